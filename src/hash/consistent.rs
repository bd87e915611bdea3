// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Consistent-hash ring over a sortable array of `(hash, node index)` pairs
//! (§4.4). Two algorithms are selectable per ring: Ketama (MD5 split into
//! four little-endian 32-bit groups, 4 ring entries per virtual node) and
//! the default (MD5 folded by XOR of its four 32-bit words, 1 ring entry
//! per virtual node).

use md5::{Digest, Md5};
use thiserror::Error;

use crate::cfg::enums::HashAlgorithm;

#[derive(Debug, Error)]
pub enum HashRingError {
    #[error("consistent hash ring has no nodes")]
    Empty,
}

/// One entry of the ring: a 32-bit hash and the index of the node it maps
/// to. The ring is kept sorted by `hash` for binary search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConsistentHashNode {
    pub hash_code: u32,
    pub index: u32,
}

/// A consistent-hash ring over an arbitrary set of named nodes.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    algorithm: HashAlgorithm,
    nodes: Vec<ConsistentHashNode>,
    sorted: bool,
}

impl ConsistentHashRing {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm, nodes: Vec::new(), sorted: true }
    }

    /// Adds `weight` virtual nodes for `(name, index)`. Ketama rings add
    /// four ring entries per virtual node (one per 32-bit group of the
    /// replica's MD5 digest); the default algorithm adds one.
    pub fn add_node(&mut self, name: &str, index: u32, weight: u32) {
        for replica in 0..weight {
            let key = format!("{name}_{replica}");
            match self.algorithm {
                HashAlgorithm::Ketama => {
                    for h in ketama_hashes(&key) {
                        self.nodes.push(ConsistentHashNode { hash_code: h, index });
                    }
                },
                HashAlgorithm::Default => {
                    self.nodes.push(ConsistentHashNode {
                        hash_code: default_hash(&key),
                        index,
                    });
                },
            }
        }
        self.sorted = false;
    }

    /// Sorts the ring by hash code. Must be called (directly or implicitly
    /// via `get_index`) after any `add_node` before lookups are valid.
    pub fn sort_node(&mut self) {
        self.nodes.sort_unstable();
        self.sorted = true;
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the node index that `key` maps to: MD5(key) folded into a
    /// 32-bit target, then binary search for the smallest entry whose hash
    /// is >= target, wrapping to entry 0 if the target is beyond the last
    /// entry.
    pub fn get_index(&mut self, key: &str) -> Result<u32, HashRingError> {
        if self.nodes.is_empty() {
            return Err(HashRingError::Empty);
        }
        if !self.sorted {
            self.sort_node();
        }
        let target = match self.algorithm {
            HashAlgorithm::Ketama => ketama_hashes(key)[0],
            HashAlgorithm::Default => default_hash(key),
        };
        let pos = match self.nodes.binary_search_by(|n| n.hash_code.cmp(&target)) {
            Ok(i) => i,
            Err(i) if i == self.nodes.len() => 0,
            Err(i) => i,
        };
        Ok(self.nodes[pos].index)
    }
}

fn md5_digest(key: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// MD5(key) split into four little-endian 32-bit groups, per §4.4's Ketama
/// definition.
fn ketama_hashes(key: &str) -> [u32; 4] {
    let digest = md5_digest(key);
    let mut out = [0u32; 4];
    for (i, chunk) in digest.chunks_exact(4).enumerate() {
        out[i] = u32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes"));
    }
    out
}

/// MD5(key) folded by XOR of its four 32-bit words, masked to 32 bits.
fn default_hash(key: &str) -> u32 {
    let words = ketama_hashes(key);
    words[0] ^ words[1] ^ words[2] ^ words[3]
}
