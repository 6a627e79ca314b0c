/*!
 * In-Memory Storage
 *
 * The storage layer behind the command engine: a dictionary keyed by raw
 * bytes, using AHash for fast lookups. This stands in for the persistent
 * storage engine; the network core never touches it directly.
 */

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::hash::BuildHasherDefault;

type AHash = BuildHasherDefault<ahash::AHasher>;

/// Value types the dictionary can hold
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String/binary data
    Str(Vec<u8>),
    /// 64-bit signed integer, kept numeric so INCR avoids re-parsing
    Int(i64),
}

/// In-memory dictionary
#[derive(Default)]
pub struct Dict {
    inner: HashMap<Vec<u8>, Value, AHash>,
}

impl Dict {
    /// Get a value by key
    #[inline]
    pub fn get(&self, k: &[u8]) -> Option<&Value> {
        self.inner.get(k)
    }

    /// Set a key-value pair, replacing any previous value
    #[inline]
    pub fn set(&mut self, k: Vec<u8>, v: Value) {
        self.inner.insert(k, v);
    }

    /// Delete a key; returns whether it existed
    #[inline]
    pub fn del(&mut self, k: &[u8]) -> bool {
        self.inner.remove(k).is_some()
    }

    /// Rename a key; returns false when the source key does not exist
    #[inline]
    pub fn rename(&mut self, from: Vec<u8>, to: Vec<u8>) -> bool {
        if from == to {
            return self.inner.contains_key(&from);
        }
        if let Some(v) = self.inner.remove(&from) {
            self.inner.insert(to, v);
            true
        } else {
            false
        }
    }

    /// Check whether a key exists
    #[inline]
    pub fn exists(&self, k: &[u8]) -> bool {
        self.inner.contains_key(k)
    }

    /// Increment the numeric value stored at `k` by one, creating it at 0.
    ///
    /// Fails when the current value is not an integer.
    pub fn incr(&mut self, k: &[u8]) -> Result<i64> {
        let cur = match self.inner.get(k) {
            None => 0,
            Some(Value::Int(i)) => *i,
            Some(Value::Str(s)) => match std::str::from_utf8(s).ok().and_then(|s| s.parse().ok()) {
                Some(i) => i,
                None => bail!("value is not an integer or out of range"),
            },
        };
        let next = match cur.checked_add(1) {
            Some(n) => n,
            None => bail!("increment or decrement would overflow"),
        };
        self.inner.insert(k.to_vec(), Value::Int(next));
        Ok(next)
    }

    /// Number of keys stored
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the dictionary is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
