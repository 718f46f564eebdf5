//! Byte-throughput throttling for the UDP socket.
//!
//! A fixed-window token bucket: the bucket refills to full capacity at the
//! start of each one-second window rather than trickling continuously.
//! [`TokenBucketLimiter::require`] debits and admits while tokens remain;
//! once the window is spent it reports how long until the next refill so
//! the caller can sleep and retry. The engine runs one limiter on the
//! receive path and an independent one on the send path.

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

struct BucketState {
    tokens: u64,
    window_start: Instant,
}

pub struct TokenBucketLimiter {
    capacity: u64,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    /// A limiter admitting up to `bytes_per_second` bytes per window.
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            capacity: bytes_per_second,
            state: Mutex::new(BucketState {
                tokens: bytes_per_second,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tries to admit `bytes` now. On denial returns the time remaining
    /// until the window refills; after sleeping that long a retry will be
    /// admitted.
    pub async fn require(&self, bytes: u64) -> Result<(), Duration> {
        // A request larger than a whole window drains the bucket when it
        // is full instead of starving forever.
        let need = bytes.min(self.capacity);
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.window_start);
        if elapsed >= WINDOW {
            state.tokens = self.capacity;
            state.window_start = now;
        }
        if state.tokens >= need {
            state.tokens -= need;
            return Ok(());
        }
        let elapsed = now.duration_since(state.window_start);
        Err(WINDOW.saturating_sub(elapsed))
    }

    /// Sleep-and-retry wrapper around [`require`](Self::require).
    pub async fn acquire(&self, bytes: u64) {
        loop {
            match self.require(bytes).await {
                Ok(()) => return,
                Err(wait) => sleep(wait.max(Duration::from_millis(1))).await,
            }
        }
    }
}
