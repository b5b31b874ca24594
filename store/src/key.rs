//! Profile Key encoding: `(ts, job, tp, instance) -> bytes`, ordered so that
//! lexicographic byte order of the encoding equals `(ts, job, tp, instance)`
//! total order. Ported from the original `codec.go` (`crazycs520/conprof`),
//! with the decode bug noted in spec.md's DESIGN NOTES / REDESIGN FLAGS
//! corrected: the original's `decodeStrings` clears the accumulator *before*
//! appending it to the result, so every decoded segment comes out empty.
//! Here the accumulated bytes are pushed as a segment, then cleared.

use common::error::{Error, Result};

/// Single-byte domain prefix for all profile keys, so the keyspace can later
/// share a RocksDB column family with other key domains without collision.
pub const KEY_PREFIX: u8 = b'p';
pub const KEY_SEP: u8 = 0xFF;
/// prefix byte + 8-byte big-endian timestamp.
pub const MIN_KEY_LEN: usize = 1 + 8;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProfileKey {
    pub ts: i64,
    pub job: String,
    pub tp: String,
    pub instance: String,
}

impl ProfileKey {
    pub fn new(ts: i64, job: impl Into<String>, tp: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            ts,
            job: job.into(),
            tp: tp.into(),
            instance: instance.into(),
        }
    }

    /// Full key encoding: prefix, ts, job, tp, instance.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.job.len() + self.tp.len() + self.instance.len());
        buf.push(KEY_PREFIX);
        buf.extend_from_slice(&self.ts.to_be_bytes());
        append_string(&mut buf, &self.job);
        append_string(&mut buf, &self.tp);
        append_string(&mut buf, &self.instance);
        buf
    }

    pub fn decode(key: &[u8]) -> Result<Self> {
        if key.len() < MIN_KEY_LEN {
            return Err(Error::MalformedKey(format!(
                "key too short: {} bytes",
                key.len()
            )));
        }
        let ts_bytes: [u8; 8] = key[1..9]
            .try_into()
            .map_err(|_| Error::MalformedKey("truncated timestamp".into()))?;
        let ts = i64::from_be_bytes(ts_bytes);

        let fields = decode_strings(&key[9..]);
        if fields.len() != 3 {
            return Err(Error::MalformedKey(format!(
                "expected 3 segments after timestamp, got {}",
                fields.len()
            )));
        }
        Ok(ProfileKey {
            ts,
            job: fields[0].clone(),
            tp: fields[1].clone(),
            instance: fields[2].clone(),
        })
    }
}

/// A partially specified key used to build scan bounds. Fields are filled
/// leading-to-trailing; the first absent field truncates the encoding so
/// that prefix semantics (`Encode({ts}) ` is a strict prefix of every key
/// with that timestamp) hold.
#[derive(Debug, Clone, Default)]
pub struct RangeKey {
    pub ts: i64,
    pub job: Option<String>,
    pub tp: Option<String>,
    pub instance: Option<String>,
}

impl RangeKey {
    pub fn encode_prefix(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.push(KEY_PREFIX);
        buf.extend_from_slice(&self.ts.to_be_bytes());
        let job = match &self.job {
            Some(j) => j,
            None => return buf,
        };
        append_string(&mut buf, job);
        let tp = match &self.tp {
            Some(t) => t,
            None => return buf,
        };
        append_string(&mut buf, tp);
        let instance = match &self.instance {
            Some(i) => i,
            None => return buf,
        };
        append_string(&mut buf, instance);
        buf
    }
}

fn append_string(buf: &mut Vec<u8>, v: &str) {
    // the prefix byte + 8-byte timestamp always precede the first segment,
    // so every segment (including the first) is separator-delimited from
    // what came before it.
    buf.push(KEY_SEP);
    buf.extend_from_slice(v.as_bytes());
}

fn decode_strings(buf: &[u8]) -> Vec<String> {
    let mut result = Vec::with_capacity(3);
    let mut current = Vec::new();
    for &b in buf {
        if b == KEY_SEP {
            result.push(String::from_utf8_lossy(&current).into_owned());
            current.clear();
            continue;
        }
        current.push(b);
    }
    result.push(String::from_utf8_lossy(&current).into_owned());
    // the leading separator before the first segment means decode_strings
    // is always called on a buffer that starts with KEY_SEP; drop the
    // resulting empty leading segment.
    if result.first().map(String::is_empty).unwrap_or(false) {
        result.remove(0);
    }
    result
}
