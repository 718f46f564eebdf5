//! Bencode wire codec.
//!
//! Every Mainline DHT datagram is a bencoded dictionary. Bencode has four
//! shapes: decimal-ASCII integers (`i42e`), length-prefixed byte strings
//! (`4:spam`), lists (`l...e`) and dictionaries (`d...e`) whose keys are
//! byte strings sorted lexicographically.
//!
//! Decoding is depth-bounded so a hostile datagram cannot recurse the stack
//! away, and every malformed input surfaces as a [`BencodeError`] instead of
//! a panic. Encoding keeps keys sorted structurally: dictionaries are
//! `BTreeMap`s, so `decode(encode(v)) == v` and re-encoding canonical input
//! is byte-identical.

use std::collections::BTreeMap;

use thiserror::Error;

/// Nesting cap for lists and dictionaries. Real DHT traffic is at most
/// three levels deep.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid string length prefix")]
    InvalidLength,

    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("trailing data after value")]
    TrailingData,

    #[error("nesting too deep")]
    NestingTooDeep,
}

pub type Dict = BTreeMap<Vec<u8>, Value>;

/// A single bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` when this value is not a dictionary or the
    /// key is absent.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::bytes(s.as_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// Decodes a complete bencode value from `data`, rejecting trailing bytes.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut pos = 0;
    let value = decode_value(data, &mut pos, 0)?;
    if pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Encodes a value into its canonical bencode byte form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_value(value, &mut out);
    out
}

fn decode_value(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::NestingTooDeep);
    }
    match data.get(*pos) {
        None => Err(BencodeError::UnexpectedEof),
        Some(b'i') => decode_int(data, pos),
        Some(b'l') => decode_list(data, pos, depth),
        Some(b'd') => decode_dict(data, pos, depth),
        Some(b'0'..=b'9') => decode_bytes(data, pos),
        Some(&other) => Err(BencodeError::UnexpectedByte(other)),
    }
}

fn decode_int(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    *pos += 1;
    let start = *pos;
    while *pos < data.len() && data[*pos] != b'e' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    let digits = std::str::from_utf8(&data[start..*pos])
        .map_err(|_| BencodeError::InvalidInteger("not ascii".into()))?;
    if digits.is_empty() {
        return Err(BencodeError::InvalidInteger("empty".into()));
    }
    if digits.starts_with("-0") || (digits.len() > 1 && digits.starts_with('0')) {
        return Err(BencodeError::InvalidInteger("leading zeros".into()));
    }
    let value: i64 = digits
        .parse()
        .map_err(|_| BencodeError::InvalidInteger(digits.into()))?;
    *pos += 1;
    Ok(Value::Int(value))
}

fn decode_bytes(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    let start = *pos;
    while *pos < data.len() && data[*pos] != b':' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    let len: usize = std::str::from_utf8(&data[start..*pos])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::InvalidLength)?;
    *pos += 1;
    if data.len() - *pos < len {
        return Err(BencodeError::UnexpectedEof);
    }
    let bytes = data[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(Value::Bytes(bytes))
}

fn decode_list(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    *pos += 1;
    let mut list = Vec::new();
    while *pos < data.len() && data[*pos] != b'e' {
        list.push(decode_value(data, pos, depth + 1)?);
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    *pos += 1;
    Ok(Value::List(list))
}

fn decode_dict(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    *pos += 1;
    let mut dict = Dict::new();
    while *pos < data.len() && data[*pos] != b'e' {
        let key = match decode_value(data, pos, depth + 1)? {
            Value::Bytes(b) => b,
            _ => return Err(BencodeError::NonStringKey),
        };
        let value = decode_value(data, pos, depth + 1)?;
        dict.insert(key, value);
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    *pos += 1;
    Ok(Value::Dict(dict))
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(l) => {
            out.push(b'l');
            for item in l {
                encode_value(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(d) => {
            out.push(b'd');
            for (key, val) in d {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_value(val, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips() {
        for (raw, value) in [
            (b"i42e".to_vec(), Value::Int(42)),
            (b"i-7e".to_vec(), Value::Int(-7)),
            (b"i0e".to_vec(), Value::Int(0)),
            (b"4:spam".to_vec(), Value::bytes(*b"spam")),
            (b"0:".to_vec(), Value::bytes(*b"")),
        ] {
            assert_eq!(decode(&raw).unwrap(), value);
            assert_eq!(encode(&value), raw);
        }
    }

    #[test]
    fn containers_round_trip() {
        let raw = b"l4:spami42ee";
        let value = decode(raw).unwrap();
        assert_eq!(
            value,
            Value::List(vec![Value::bytes(*b"spam"), Value::Int(42)])
        );
        assert_eq!(encode(&value), raw);

        let raw = b"d3:cow3:moo4:spaml1:a1:bee";
        let value = decode(raw).unwrap();
        assert_eq!(encode(&value), raw);
    }

    #[test]
    fn dict_keys_are_sorted_on_encode() {
        let mut dict = Dict::new();
        dict.insert(b"zz".to_vec(), Value::Int(1));
        dict.insert(b"aa".to_vec(), Value::Int(2));
        dict.insert(b"mm".to_vec(), Value::Int(3));
        let encoded = encode(&Value::Dict(dict));
        assert_eq!(encoded, b"d2:aai2e2:mmi3e2:zzi1ee");
    }

    #[test]
    fn binary_byte_strings_survive() {
        let blob: Vec<u8> = (0u8..=255).collect();
        let value = Value::bytes(blob.clone());
        let decoded = decode(&encode(&value)).unwrap();
        assert_eq!(decoded.as_bytes(), Some(blob.as_slice()));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(decode(b""), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(decode(b"9x:ab"), Err(BencodeError::InvalidLength)));
        assert!(matches!(decode(b"5:ab"), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(decode(b"i12"), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(
            decode(b"i01e"),
            Err(BencodeError::InvalidInteger(_))
        ));
        assert!(matches!(
            decode(b"i-0e"),
            Err(BencodeError::InvalidInteger(_))
        ));
        assert!(matches!(decode(b"l4:spam"), Err(BencodeError::UnexpectedEof)));
        assert!(matches!(decode(b"di1ei2ee"), Err(BencodeError::NonStringKey)));
        assert!(matches!(decode(b"xyz"), Err(BencodeError::UnexpectedByte(_))));
        assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::TrailingData)));
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let mut raw = Vec::new();
        raw.extend(std::iter::repeat(b'l').take(200));
        raw.extend(std::iter::repeat(b'e').take(200));
        assert!(matches!(decode(&raw), Err(BencodeError::NestingTooDeep)));
    }
}
