//! Delta decoding
//!
//! A deltified object stores instructions for rebuilding its content from
//! a base object. The instruction stream opens with two varints (base
//! size, result size) followed by copy and insert commands:
//!
//! - a command byte with the top bit set copies a range out of the base;
//!   bits 0..3 select which offset bytes follow, bits 4..6 which size
//!   bytes; absent bytes are zero and a zero size means 0x10000
//! - a command byte with the top bit clear inserts its low 7 bits'
//!   worth of literal bytes from the stream
//! - command byte 0 is reserved and rejected
//!
//! Chains of deltas are walked to a non-delta base; inflated bases are
//! kept in a shared, size-bounded cache so neighbouring objects in the
//! same chain do not re-inflate them.

use crate::artifacts::objects::object_type::ObjectType;
use crate::artifacts::pack::PackError;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Decode the little-endian base-128 varint used for delta sizes.
///
/// # Returns
///
/// The value and the number of bytes consumed.
pub fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (used, byte) in bytes.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, used + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

/// The two sizes opening a delta instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaHeader {
    pub base_size: u64,
    pub result_size: u64,
    /// Bytes consumed by the two varints.
    pub header_length: usize,
}

/// Parse the base-size and result-size varints.
pub fn parse_header(delta: &[u8]) -> Option<DeltaHeader> {
    let (base_size, used_base) = read_varint(delta)?;
    let (result_size, used_result) = read_varint(&delta[used_base..])?;
    Some(DeltaHeader {
        base_size,
        result_size,
        header_length: used_base + used_result,
    })
}

/// Apply a delta instruction stream to `base`.
///
/// Both declared sizes are enforced: the base must match `base_size` and
/// the produced output must match `result_size`. `location` names the
/// pack file and object offset for corruption reports.
pub fn apply(
    location: (&Path, u64),
    base: &[u8],
    delta: &[u8],
) -> Result<Bytes, PackError> {
    let (file, offset) = location;
    let corrupt = |cause: &str| PackError::corrupt(file, offset, cause);

    let header = parse_header(delta).ok_or_else(|| corrupt("truncated delta header"))?;
    if base.len() as u64 != header.base_size {
        return Err(corrupt(&format!(
            "delta base is {} bytes, expected {}",
            base.len(),
            header.base_size
        )));
    }

    let mut out = Vec::with_capacity(header.result_size as usize);
    let mut commands = &delta[header.header_length..];

    while let Some((&command, rest)) = commands.split_first() {
        commands = rest;
        if command & 0x80 != 0 {
            // copy from base
            let mut copy_offset = 0u64;
            let mut copy_size = 0u64;
            for bit in 0..4 {
                if command & (1 << bit) != 0 {
                    let (&byte, rest) =
                        commands.split_first().ok_or_else(|| corrupt("truncated copy offset"))?;
                    commands = rest;
                    copy_offset |= u64::from(byte) << (8 * bit);
                }
            }
            for bit in 0..3 {
                if command & (1 << (4 + bit)) != 0 {
                    let (&byte, rest) =
                        commands.split_first().ok_or_else(|| corrupt("truncated copy size"))?;
                    commands = rest;
                    copy_size |= u64::from(byte) << (8 * bit);
                }
            }
            if copy_size == 0 {
                copy_size = 0x10000;
            }

            let start = copy_offset as usize;
            let end = start
                .checked_add(copy_size as usize)
                .ok_or_else(|| corrupt("copy range overflows"))?;
            if end > base.len() {
                return Err(corrupt("copy range outside delta base"));
            }
            out.extend_from_slice(&base[start..end]);
        } else if command != 0 {
            // insert literal bytes
            let count = command as usize;
            if commands.len() < count {
                return Err(corrupt("truncated insert data"));
            }
            out.extend_from_slice(&commands[..count]);
            commands = &commands[count..];
        } else {
            return Err(corrupt("delta command byte 0 is invalid"));
        }
    }

    if out.len() as u64 != header.result_size {
        return Err(corrupt(&format!(
            "delta produced {} bytes, declared {}",
            out.len(),
            header.result_size
        )));
    }

    Ok(Bytes::from(out))
}

/// A materialized delta base retained for chain reuse.
#[derive(Debug)]
struct CachedBase {
    kind: ObjectType,
    bytes: Bytes,
    last_used: AtomicU64,
}

/// Shared LRU cache of inflated delta bases, keyed by (pack, offset).
///
/// Bounded by `delta_base_cache_limit` bytes; entries are whole inflated
/// objects, so one hot base can serve an entire chain of siblings.
#[derive(Debug)]
pub struct DeltaBaseCache {
    limit: usize,
    state: Mutex<BaseCacheState>,
    tick: AtomicU64,
}

#[derive(Debug, Default)]
struct BaseCacheState {
    entries: HashMap<(u64, u64), Arc<CachedBase>>,
    total_bytes: usize,
}

impl DeltaBaseCache {
    pub fn new(limit: usize) -> Self {
        DeltaBaseCache {
            limit,
            state: Mutex::new(BaseCacheState::default()),
            tick: AtomicU64::new(0),
        }
    }

    /// Look up a base by (pack cache id, offset).
    pub fn get(&self, pack: u64, offset: u64) -> Option<(ObjectType, Bytes)> {
        let state = self.state.lock().unwrap();
        let entry = state.entries.get(&(pack, offset))?;
        entry
            .last_used
            .store(self.tick.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        Some((entry.kind, entry.bytes.clone()))
    }

    /// Insert a materialized base, evicting LRU entries over the budget.
    ///
    /// Objects larger than the whole budget are not cached at all.
    pub fn put(&self, pack: u64, offset: u64, kind: ObjectType, bytes: Bytes) {
        if bytes.len() > self.limit {
            return;
        }

        let mut state = self.state.lock().unwrap();
        let entry = Arc::new(CachedBase {
            kind,
            bytes,
            last_used: AtomicU64::new(self.tick.fetch_add(1, Ordering::Relaxed)),
        });
        if let Some(previous) = state.entries.insert((pack, offset), entry) {
            state.total_bytes -= previous.bytes.len();
        }
        state.total_bytes += state.entries[&(pack, offset)].bytes.len();

        while state.total_bytes > self.limit {
            let victim = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(key, _)| *key);
            match victim {
                Some(key) => {
                    if let Some(evicted) = state.entries.remove(&key) {
                        state.total_bytes -= evicted.bytes.len();
                        trace!(pack = key.0, offset = key.1, "evicted delta base");
                    }
                }
                None => break,
            }
        }
    }
}
