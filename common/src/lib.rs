//! Shared types for the MapReduce lite engine.
//!
//! Users specify a map and a reduce function, and the coordinator runs
//! them as map and reduce tasks over a keyed record store. Intermediate
//! data is published by each worker over HTTP, unlike Hadoop or GFS.

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod store;
pub mod task;

pub use error::{Error, Phase, TaskError};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The sink handed to user functions. Each call publishes one record.
///
/// An `Err` means the engine can no longer accept output (e.g. the
/// partition stage went away); user functions should propagate it.
pub type Emit<'a> = dyn FnMut(KeyValue) -> anyhow::Result<()> + 'a;

/// A map function is called once per input record and may emit any number
/// of intermediate records.
pub type MapFn = fn(kv: KeyValue, emit: &mut Emit<'_>) -> anyhow::Result<()>;

/// A reduce function is called exactly once per distinct key.
///
/// `values` is a forward-only iterator over every value recorded for `key`.
/// It can be consumed once; anything left unread is skipped by the engine.
pub type ReduceFn = fn(
    key: &str,
    values: &mut dyn Iterator<Item = String>,
    emit: &mut Emit<'_>,
) -> anyhow::Result<()>;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workload").finish_non_exhaustive()
    }
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
///
/// Pairs order by key first, then by value, which is the order reduce
/// tasks group in.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct KeyValue {
    /// The key.
    pub key: String,

    /// The value.
    pub value: String,
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key, self.value)
    }
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Get the key of this key-value pair.
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the value of this key-value pair.
    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Consumes the key-value pair and returns the key.
    #[inline]
    pub fn into_key(self) -> String {
        self.key
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> String {
        self.value
    }
}

/// Hashes an intermediate key. Compute a reduce bucket for a given key
/// by calculating `ihash(key) % n_reduce`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    // Masked to 31 bits, so the conversion cannot fail.
    (hasher.finish() & 0x7fff_ffff) as u32
}

/// The reduce partition owning `key` when there are `n_reduce` partitions.
pub fn partition(key: &str, n_reduce: usize) -> usize {
    debug_assert!(n_reduce > 0);
    ihash(key.as_bytes()) as usize % n_reduce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihash_is_stable() {
        // FNV-1a seeded with zero, truncated to 31 bits.
        assert_eq!(ihash(b""), 0);
        assert_eq!(ihash(b"cat"), ihash(b"cat"));
        assert_ne!(ihash(b"cat"), ihash(b"dog"));
    }

    #[test]
    fn partition_is_deterministic_and_in_range() {
        for n_reduce in 1..8 {
            for word in ["the", "cat", "sat", "dog", "ran", ""] {
                let first = partition(word, n_reduce);
                assert!(first < n_reduce);
                for _ in 0..10 {
                    assert_eq!(partition(word, n_reduce), first);
                }
            }
        }
    }

    #[test]
    fn pairs_order_by_key_then_value() {
        let mut pairs = vec![
            KeyValue::new("b", "1"),
            KeyValue::new("a", "2"),
            KeyValue::new("a", "1"),
        ];
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                KeyValue::new("a", "1"),
                KeyValue::new("a", "2"),
                KeyValue::new("b", "1"),
            ]
        );
    }
}
