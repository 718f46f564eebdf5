//! The DHT crawler engine.
//!
//! One UDP socket, one fixed local id, four pipelines connected only by
//! bounded queues:
//!
//! - **receive**: reads datagrams, applies the inbound rate budget and
//!   pushes onto the ingest queue (timed enqueue, drop on timeout);
//! - **process**: N workers decode, update the routing table, correlate
//!   responses through the transaction map, fire domain events and emit
//!   replies or follow-up queries;
//! - **send**: drains the priority queue (responses and error replies)
//!   strictly before the query queue, registers queries in the transaction
//!   map and writes to the socket under the outbound rate budget;
//! - **discovery**: periodically walks the routing table and the
//!   bootstrap list with `find_node` to keep the crawl spreading.
//!
//! Nothing in here is fatal: malformed traffic gets an error reply,
//! unsolicited responses are dropped, socket errors are logged and the
//! pipelines keep running until [`DhtClient::shutdown`].

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, trace, warn};

use crate::bencode::Value;
use crate::config::DhtConfig;
use crate::krpc::{
    Args, CommandType, DhtMessage, MessageKind, ProtocolError, QueryPayload, ResponseBody,
    ERROR_PROTOCOL, ERROR_SERVER,
};
use crate::node::{
    encode_compact_nodes, neighbor_id, DhtNode, InfoHash, NodeId, INFO_HASH_LENGTH,
};
use crate::ratelimit::TokenBucketLimiter;
use crate::routing::{RouteTable, NEAREST_NODE_COUNT};
use crate::transaction::{
    FileMessageMap, MemoryMessageMap, MessageMap, TRANSACTION_ID_LENGTH,
};

/// Largest datagram the crawler will read.
const MAX_DATAGRAM: usize = 8192;

/// How long a timed enqueue waits before the item is dropped.
const ENQUEUE_WAIT: Duration = Duration::from_secs(10);

/// Idle wait of the send loop when both outbound queues are empty.
const SEND_IDLE_WAIT: Duration = Duration::from_secs(1);

/// Base delay between discovery rounds, with the shortened variant for a
/// starved candidate set and the stretched one for backpressure.
const DISCOVERY_ROUND: Duration = Duration::from_secs(60);
const DISCOVERY_ROUND_SHORT: Duration = Duration::from_secs(5);
const DISCOVERY_ROUND_BACKPRESSURE: Duration = Duration::from_secs(90);

/// Cap on the per-round discovery candidate set.
const DISCOVERY_SET_LIMIT: usize = 10 * 1024;

/// Below this many candidates a round counts as starved.
const DISCOVERY_SMALL_SET: usize = 10;

/// Entries in the resolved-info-hash filter.
const RESOLVED_FILTER_SIZE: usize = 64 * 1024;

/// Observers of the crawl. Handlers run inline on the processing worker in
/// registration order; a slow handler backpressures that worker, and an
/// erring handler turns the datagram into a server-error reply.
#[async_trait]
pub trait DhtEventHandler: Send + Sync {
    /// A `get_peers` or `announce_peer` query mentioned this hash.
    async fn on_receive_info_hash(&self, _info_hash: InfoHash) -> Result<()> {
        Ok(())
    }

    /// A peer announced itself; `peers` holds its resolved endpoint.
    async fn on_announce_peer(&self, _info_hash: InfoHash) -> Result<()> {
        Ok(())
    }

    /// A `get_peers` walk returned concrete swarm peers.
    async fn on_find_peer(&self, _info_hash: InfoHash) -> Result<()> {
        Ok(())
    }
}

struct Datagram {
    data: Vec<u8>,
    from: SocketAddr,
}

type Outbound = (DhtMessage, DhtNode);
type SharedQueue<T> = Arc<Mutex<mpsc::Receiver<T>>>;

struct Shared {
    socket: UdpSocket,
    local_id: NodeId,
    table: RouteTable,
    map: Arc<dyn MessageMap>,
    send_limit: TokenBucketLimiter,
    recv_limit: TokenBucketLimiter,
    handlers: RwLock<Vec<Arc<dyn DhtEventHandler>>>,
    resolved: StdMutex<LruCache<[u8; INFO_HASH_LENGTH], ()>>,
    ingest_tx: mpsc::Sender<Datagram>,
    query_tx: mpsc::Sender<Outbound>,
    response_tx: mpsc::Sender<Outbound>,
    discovery_tx: mpsc::Sender<DhtNode>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    config: DhtConfig,
}

pub struct DhtClient {
    shared: Arc<Shared>,
    ingest_rx: SharedQueue<Datagram>,
    query_rx: SharedQueue<Outbound>,
    response_rx: SharedQueue<Outbound>,
    discovery_rx: SharedQueue<DhtNode>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl DhtClient {
    pub async fn new(config: DhtConfig) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .context("failed to bind crawler socket")?;
        platform::suppress_udp_connreset(&socket);

        let (ingest_tx, ingest_rx) = mpsc::channel(config.receive_queue_size);
        let (query_tx, query_rx) = mpsc::channel(config.send_queue_size);
        let (response_tx, response_rx) = mpsc::channel(config.response_queue_size);
        let (discovery_tx, discovery_rx) = mpsc::channel(config.node_queue_size);

        let map: Arc<dyn MessageMap> = match &config.durable_map_dir {
            Some(dir) => Arc::new(
                FileMessageMap::new(dir).context("failed to open durable transaction map")?,
            ),
            None => Arc::new(MemoryMessageMap::new()),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let filter_size = NonZeroUsize::new(RESOLVED_FILTER_SIZE).expect("non-zero constant");

        let shared = Arc::new(Shared {
            socket,
            local_id: NodeId::random(),
            table: RouteTable::new(config.route_table_size),
            map,
            send_limit: TokenBucketLimiter::new(config.send_rate_kib * 1024),
            recv_limit: TokenBucketLimiter::new(config.receive_rate_kib * 1024),
            handlers: RwLock::new(Vec::new()),
            resolved: StdMutex::new(LruCache::new(filter_size)),
            ingest_tx,
            query_tx,
            response_tx,
            discovery_tx,
            running: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            config,
        });

        Ok(Self {
            shared,
            ingest_rx: Arc::new(Mutex::new(ingest_rx)),
            query_rx: Arc::new(Mutex::new(query_rx)),
            response_rx: Arc::new(Mutex::new(response_rx)),
            discovery_rx: Arc::new(Mutex::new(discovery_rx)),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.shared.local_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.shared
            .socket
            .local_addr()
            .context("failed to get local address")
    }

    /// Registers an observer. Handlers fire in registration order.
    pub fn add_handler(&self, handler: Arc<dyn DhtEventHandler>) {
        self.shared.handlers.write().unwrap().push(handler);
    }

    /// Marks a hash as resolved; the engine stops fanning out `get_peers`
    /// for it and skips further announce events.
    pub fn mark_resolved(&self, info_hash: [u8; INFO_HASH_LENGTH]) {
        self.shared.mark_resolved(info_hash);
    }

    pub fn known_nodes(&self) -> usize {
        self.shared.table.len()
    }

    pub fn pending_receive(&self) -> usize {
        pending(&self.shared.ingest_tx)
    }

    pub fn pending_send(&self) -> usize {
        pending(&self.shared.query_tx)
    }

    pub fn pending_response(&self) -> usize {
        pending(&self.shared.response_tx)
    }

    pub fn pending_discovery(&self) -> usize {
        pending(&self.shared.discovery_tx)
    }

    pub async fn ping(&self, node: &DhtNode) {
        self.shared.send_query(CommandType::Ping, Args::new(), node).await;
    }

    /// Asks `node` for neighbors of a random target.
    pub async fn find_node(&self, node: &DhtNode) {
        self.shared.send_find_node(node).await;
    }

    /// Asks one specific node for peers of `info_hash`.
    pub async fn get_peers_from(&self, node: &DhtNode, info_hash: [u8; INFO_HASH_LENGTH]) {
        self.shared.send_get_peers(node, info_hash).await;
    }

    /// Starts a peer search at the closest nodes the table knows, padding
    /// with the bootstrap list while the table is still thin.
    pub async fn get_peers(&self, info_hash: [u8; INFO_HASH_LENGTH]) {
        let mut nodes = self.shared.table.find_nodes(&NodeId(info_hash));
        if nodes.len() < NEAREST_NODE_COUNT {
            nodes.extend(resolve_bootstrap(&self.shared.config.bootstrap_nodes).await);
        }
        for node in &nodes {
            self.shared.send_get_peers(node, info_hash).await;
        }
    }

    pub async fn announce_peer(
        &self,
        node: &DhtNode,
        info_hash: [u8; INFO_HASH_LENGTH],
        port: u16,
        token: &str,
    ) {
        let payload = QueryPayload::AnnouncePeer {
            info_hash,
            port: Some(i64::from(port)),
            implied_port: None,
        };
        let mut args = payload.to_args();
        args.insert("token".into(), Value::from(token));
        self.shared.send_query(payload.command(), args, node).await;
    }

    /// Spawns the four pipelines. Must run inside a tokio runtime.
    pub fn run(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            bail!("crawler is already running");
        }
        let workers = self.shared.config.process_workers.max(1);
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(receive_loop(
            self.shared.clone(),
            self.shared.shutdown_rx.clone(),
        )));
        for _ in 0..workers {
            tasks.push(tokio::spawn(process_loop(
                self.shared.clone(),
                self.ingest_rx.clone(),
                self.shared.shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(send_loop(
            self.shared.clone(),
            self.query_rx.clone(),
            self.response_rx.clone(),
            self.shared.shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(discovery_loop(
            self.shared.clone(),
            self.discovery_rx.clone(),
            self.shared.shutdown_rx.clone(),
        )));
        info!(
            node_id = ?self.shared.local_id,
            workers,
            "dht crawler started"
        );
        Ok(())
    }

    /// Cooperative stop: signal every pipeline, discard whatever is still
    /// queued, then wait for the tasks to finish. Queued work is lost by
    /// design; only durable transaction records outlive the process.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.shutdown_tx.send(true);

        drain(&self.ingest_rx).await;
        drain(&self.query_rx).await;
        drain(&self.response_rx).await;
        drain(&self.discovery_rx).await;

        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("dht crawler stopped");
    }
}

fn pending<T>(tx: &mpsc::Sender<T>) -> usize {
    tx.max_capacity() - tx.capacity()
}

async fn drain<T>(queue: &SharedQueue<T>) {
    let mut rx = queue.lock().await;
    while rx.try_recv().is_ok() {}
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn is_resolved(&self, hash: &[u8; INFO_HASH_LENGTH]) -> bool {
        self.resolved.lock().unwrap().contains(hash)
    }

    fn mark_resolved(&self, hash: [u8; INFO_HASH_LENGTH]) {
        self.resolved.lock().unwrap().put(hash, ());
    }

    async fn fire_receive_info_hash(&self, info: InfoHash) -> Result<()> {
        let handlers = self.handlers.read().unwrap().clone();
        for handler in handlers {
            handler.on_receive_info_hash(info.clone()).await?;
        }
        Ok(())
    }

    async fn fire_announce_peer(&self, info: InfoHash) -> Result<()> {
        let handlers = self.handlers.read().unwrap().clone();
        for handler in handlers {
            handler.on_announce_peer(info.clone()).await?;
        }
        Ok(())
    }

    async fn fire_find_peer(&self, info: InfoHash) -> Result<()> {
        let handlers = self.handlers.read().unwrap().clone();
        for handler in handlers {
            handler.on_find_peer(info.clone()).await?;
        }
        Ok(())
    }

    /// Queues a query. The transaction id is allocated later, on the send
    /// pipeline, so ids are unique at the moment of sending.
    async fn send_query(&self, command: CommandType, mut args: Args, node: &DhtNode) {
        let presented = neighbor_id(&self.local_id, node.id.as_ref());
        args.insert("id".into(), Value::bytes(presented.as_bytes().to_vec()));
        let item = (DhtMessage::query(command, args), node.clone());
        if command == CommandType::GetPeers {
            if self.query_tx.send_timeout(item, ENQUEUE_WAIT).await.is_err() {
                debug!(to = %node.addr, "send queue full, get_peers dropped");
            }
        } else if self.query_tx.try_send(item).is_err() {
            debug!(to = %node.addr, "send queue full, query dropped");
        }
    }

    async fn send_find_node(&self, node: &DhtNode) {
        let payload = QueryPayload::FindNode {
            target: NodeId::random(),
        };
        self.send_query(payload.command(), payload.to_args(), node)
            .await;
    }

    async fn send_get_peers(&self, node: &DhtNode, info_hash: [u8; INFO_HASH_LENGTH]) {
        let payload = QueryPayload::GetPeers { info_hash };
        self.send_query(payload.command(), payload.to_args(), node)
            .await;
    }

    /// Hands freshly learned nodes to the discovery queue and the routing
    /// table. A full queue only costs the find_node follow-up; the table
    /// still remembers the contact.
    fn absorb_discovered(&self, nodes: Vec<DhtNode>) {
        for node in nodes {
            let _ = self.discovery_tx.try_send(node.clone());
            self.table.add_node(node);
        }
    }

    async fn process_datagram(&self, datagram: &Datagram) -> Result<()> {
        let message = DhtMessage::decode(&datagram.data)?;
        match message.kind {
            MessageKind::Query => self.process_query(message, datagram.from).await,
            MessageKind::Response => self.process_response(message, datagram.from).await,
            MessageKind::Error => {
                trace!(from = %datagram.from, error = ?message.error, "remote error ignored");
                Ok(())
            }
        }
    }

    async fn process_query(&self, message: DhtMessage, from: SocketAddr) -> Result<()> {
        let sender_id = message
            .arg_bytes("id")
            .and_then(NodeId::from_slice)
            .ok_or_else(|| anyhow!("query missing valid node id"))?;
        self.table.add_or_update_node(DhtNode::with_id(sender_id, from));
        let payload = QueryPayload::from_message(&message)?;

        let mut args = Args::new();
        let presented = neighbor_id(&self.local_id, Some(&sender_id));
        args.insert("id".into(), Value::bytes(presented.as_bytes().to_vec()));

        match payload {
            QueryPayload::Ping => {}
            QueryPayload::FindNode { target } => {
                let nodes = self.table.find_nodes(&target);
                args.insert("nodes".into(), Value::bytes(encode_compact_nodes(&nodes)));
            }
            QueryPayload::GetPeers { info_hash } => {
                let mut info = InfoHash::new(info_hash);
                info.resolved = self.is_resolved(&info_hash);
                self.fire_receive_info_hash(info.clone()).await?;

                let nodes = self.table.find_nodes(&NodeId(info_hash));
                args.insert("nodes".into(), Value::bytes(encode_compact_nodes(&nodes)));
                args.insert("token".into(), Value::from(info.token().as_str()));
                if !info.resolved {
                    // Passive fan-out: the neighbors we hand back are also
                    // the next hop of our own search for this hash.
                    for node in &nodes {
                        self.send_get_peers(node, info_hash).await;
                    }
                }
            }
            QueryPayload::AnnouncePeer {
                info_hash,
                port,
                implied_port,
            } => {
                let mut info = InfoHash::new(info_hash);
                info.resolved = self.is_resolved(&info_hash);
                self.fire_receive_info_hash(info.clone()).await?;
                if !info.resolved {
                    let port = if implied_port.unwrap_or(0) == 0 {
                        let declared =
                            port.ok_or_else(|| anyhow!("announce_peer missing port"))?;
                        u16::try_from(declared)
                            .map_err(|_| anyhow!("announce_peer port out of range"))?
                    } else {
                        from.port()
                    };
                    info.peers = Some(HashSet::from([SocketAddr::new(from.ip(), port)]));
                    self.fire_announce_peer(info).await?;
                }
            }
        }

        let reply = DhtMessage::response(message.transaction_id, args);
        if self
            .response_tx
            .try_send((reply, DhtNode::new(from)))
            .is_err()
        {
            debug!(%from, "response queue full, reply dropped");
        }
        Ok(())
    }

    async fn process_response(&self, message: DhtMessage, from: SocketAddr) -> Result<()> {
        if message.transaction_id.len() != TRANSACTION_ID_LENGTH {
            return Ok(());
        }
        let responder_id = message
            .arg_bytes("id")
            .and_then(NodeId::from_slice)
            .ok_or_else(|| anyhow!("response missing valid node id"))?;
        let responder = DhtNode::with_id(responder_id, from);
        let Some(context) = self
            .map
            .require_registered_info(&message.transaction_id, &responder)
        else {
            // Unsolicited, stale, duplicate or spoofed; must leave no trace.
            trace!(%from, "unregistered response dropped");
            return Ok(());
        };
        self.table.add_or_update_node(responder);

        match context.command {
            CommandType::FindNode => {
                if let ResponseBody::Nodes(nodes) = ResponseBody::from_message(&message) {
                    self.absorb_discovered(nodes);
                }
            }
            CommandType::GetPeers => {
                let hash = context
                    .info_hash
                    .ok_or_else(|| anyhow!("get_peers registration without info hash"))?;
                match ResponseBody::from_message(&message) {
                    ResponseBody::Peers(peers) => {
                        // Concrete peers end this branch of the walk; any
                        // nodes field rides along unused.
                        let mut info = InfoHash::new(hash);
                        info.peers = Some(peers);
                        self.fire_find_peer(info).await?;
                    }
                    ResponseBody::Nodes(nodes) => {
                        // Depth here is bounded only by the id pool and the
                        // rate limiter; see DESIGN.md before tightening.
                        for node in &nodes {
                            self.send_get_peers(node, hash).await;
                        }
                        self.absorb_discovered(nodes);
                    }
                    ResponseBody::Empty => {}
                }
            }
            CommandType::Ping | CommandType::AnnouncePeer => {}
        }
        Ok(())
    }
}

async fn receive_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        if !shared.running() {
            break;
        }
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            result = shared.socket.recv_from(&mut buf) => result,
        };
        match received {
            Ok((len, from)) => {
                shared.recv_limit.acquire(len as u64).await;
                let datagram = Datagram {
                    data: buf[..len].to_vec(),
                    from,
                };
                if shared
                    .ingest_tx
                    .send_timeout(datagram, ENQUEUE_WAIT)
                    .await
                    .is_err()
                {
                    debug!(%from, "ingest queue full, datagram dropped");
                }
            }
            // Looping is the re-arm; keep trying until a read sticks.
            Err(err) => warn!(error = %err, "udp receive failed"),
        }
    }
}

async fn process_loop(
    shared: Arc<Shared>,
    ingest: SharedQueue<Datagram>,
    mut shutdown: watch::Receiver<bool>,
) {
    let throttle_size = shared.config.process_wait_size;
    let throttle_wait = Duration::from_millis(shared.config.process_wait_millis);
    let throttled = throttle_size > 0 && !throttle_wait.is_zero();
    let mut processed = 0usize;
    loop {
        if !shared.running() {
            break;
        }
        let datagram = {
            let mut rx = ingest.lock().await;
            tokio::select! {
                _ = shutdown.changed() => None,
                received = rx.recv() => received,
            }
        };
        let Some(datagram) = datagram else { break };
        if throttled && processed >= throttle_size {
            sleep(throttle_wait).await;
            processed = 0;
        }
        if let Err(err) = shared.process_datagram(&datagram).await {
            let reply = if err.downcast_ref::<ProtocolError>().is_some() {
                debug!(from = %datagram.from, error = %err, "malformed datagram");
                DhtMessage::error(ERROR_PROTOCOL, "Error Protocol")
            } else {
                warn!(from = %datagram.from, error = %err, "datagram processing failed");
                DhtMessage::error(ERROR_SERVER, format!("Server Error:{err}"))
            };
            if shared
                .response_tx
                .try_send((reply, DhtNode::new(datagram.from)))
                .is_err()
            {
                debug!("response queue full, error reply dropped");
            }
        }
        processed += 1;
    }
}

async fn send_loop(
    shared: Arc<Shared>,
    queries: SharedQueue<Outbound>,
    responses: SharedQueue<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if !shared.running() {
            break;
        }
        // Responses drain strictly before queries.
        let next = match responses.lock().await.try_recv() {
            Ok(item) => Some((item, false)),
            Err(_) => queries.lock().await.try_recv().ok().map(|item| (item, true)),
        };
        let Some(((mut message, node), register)) = next else {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(SEND_IDLE_WAIT) => {}
            }
            continue;
        };
        if register && !shared.map.register_message(&mut message, &node) {
            debug!(to = %node.addr, "transaction allocation failed, query dropped");
            continue;
        }
        let raw = message.encode();
        shared.send_limit.acquire(raw.len() as u64).await;
        if let Err(err) = shared.socket.send_to(&raw, node.addr).await {
            // UDP is best effort; a dead route costs nothing but the packet.
            debug!(to = %node.addr, error = %err, "udp send failed");
        }
    }
}

async fn discovery_loop(
    shared: Arc<Shared>,
    queue: SharedQueue<DhtNode>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut candidates: HashSet<DhtNode> = HashSet::new();
    loop {
        if !shared.running() {
            break;
        }
        // When nothing has been harvested since the last round, reseed the
        // queue from the table so the walk keeps moving.
        if pending(&shared.discovery_tx) == 0 {
            for node in shared.table.snapshot() {
                if shared.discovery_tx.try_send(node).is_err() {
                    break;
                }
            }
        }
        {
            let mut rx = queue.lock().await;
            while candidates.len() <= DISCOVERY_SET_LIMIT {
                match rx.try_recv() {
                    Ok(node) => {
                        candidates.insert(node);
                    }
                    Err(_) => break,
                }
            }
        }
        let bootstrap = resolve_bootstrap(&shared.config.bootstrap_nodes).await;
        for node in bootstrap.iter().chain(candidates.iter()) {
            if !shared.running() {
                return;
            }
            shared.send_find_node(node).await;
        }
        let busy = pending(&shared.query_tx) > 0 && pending(&shared.ingest_tx) > 0;
        let round = discovery_delay(candidates.len(), busy);
        candidates.clear();
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(round) => {}
        }
    }
}

/// Backpressure heuristic, not a hard gate: starved candidate sets shorten
/// the round, simultaneously loaded ingest and send queues stretch it.
fn discovery_delay(candidates: usize, busy: bool) -> Duration {
    if busy {
        DISCOVERY_ROUND_BACKPRESSURE
    } else if candidates < DISCOVERY_SMALL_SET {
        DISCOVERY_ROUND_SHORT
    } else {
        DISCOVERY_ROUND
    }
}

async fn resolve_bootstrap(entries: &[String]) -> Vec<DhtNode> {
    let mut nodes = Vec::new();
    for entry in entries {
        if let Ok(addr) = entry.parse::<SocketAddr>() {
            nodes.push(DhtNode::new(addr));
            continue;
        }
        match lookup_host(entry.as_str()).await {
            Ok(mut resolved) => {
                if let Some(addr) = resolved.find(SocketAddr::is_ipv4) {
                    nodes.push(DhtNode::new(addr));
                }
            }
            Err(err) => debug!(host = %entry, error = %err, "bootstrap resolution failed"),
        }
    }
    nodes
}

/// Windows sockets report ICMP port-unreachable as `WSAECONNRESET` on a
/// later receive, which would turn every dead peer into a read error. The
/// `SIO_UDP_CONNRESET` ioctl switches that off; on every other platform
/// the condition does not exist and this is a no-op.
mod platform {
    use tokio::net::UdpSocket;

    #[cfg(windows)]
    pub fn suppress_udp_connreset(socket: &UdpSocket) {
        use std::ffi::c_void;
        use std::os::windows::io::AsRawSocket;

        const SIO_UDP_CONNRESET: u32 = 0x9800_000C;

        #[link(name = "ws2_32")]
        extern "system" {
            fn WSAIoctl(
                s: usize,
                code: u32,
                in_buf: *const u8,
                in_len: u32,
                out_buf: *mut u8,
                out_len: u32,
                returned: *mut u32,
                overlapped: *mut c_void,
                routine: *const c_void,
            ) -> i32;
        }

        let off = [0u8; 4];
        let mut returned = 0u32;
        unsafe {
            WSAIoctl(
                socket.as_raw_socket() as usize,
                SIO_UDP_CONNRESET,
                off.as_ptr(),
                off.len() as u32,
                std::ptr::null_mut(),
                0,
                &mut returned,
                std::ptr::null_mut(),
                std::ptr::null(),
            );
        }
    }

    #[cfg(not(windows))]
    pub fn suppress_udp_connreset(_socket: &UdpSocket) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_delay_picks_the_right_round() {
        assert_eq!(discovery_delay(0, false), DISCOVERY_ROUND_SHORT);
        assert_eq!(discovery_delay(5000, false), DISCOVERY_ROUND);
        assert_eq!(discovery_delay(5000, true), DISCOVERY_ROUND_BACKPRESSURE);
        assert_eq!(discovery_delay(0, true), DISCOVERY_ROUND_BACKPRESSURE);
    }

    #[tokio::test]
    async fn resolve_bootstrap_parses_raw_addresses_without_dns() {
        let nodes = resolve_bootstrap(&["82.221.103.244:6881".to_string()]).await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].addr, "82.221.103.244:6881".parse().unwrap());
        assert!(nodes[0].id.is_none());
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let config = DhtConfig {
            port: 0,
            bootstrap_nodes: Vec::new(),
            ..DhtConfig::default()
        };
        let client = DhtClient::new(config).await.unwrap();
        client.run().unwrap();
        assert!(client.run().is_err());
        client.shutdown().await;
    }
}
