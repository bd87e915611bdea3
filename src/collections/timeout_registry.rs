// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Timeout-indexed keyed registry (§4.3).
//!
//! Backs both the server's per-adapter pending-request bookkeeping and the
//! client's per-[`crate::client::object_proxy::ObjectProxy`] outstanding-call
//! table. Two structures are kept in lockstep under a single mutex: a map
//! from id to value plus a position in an insertion-ordered time list, and
//! the time list itself (oldest first) used both by the timeout sweeper and
//! by FIFO `pop()`.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("id {0} already present in registry")]
    Duplicate(u32),
    #[error("no such id {0} in registry")]
    NotFound(u32),
}

struct Entry<V> {
    value: V,
    create_time: Instant,
    popped: bool,
}

struct Inner<V> {
    /// id -> position into `order` plus the stored value.
    by_id: HashMap<u32, Entry<V>>,
    /// Insertion-ordered ids, oldest first. `pop()`/`timeout()` walk this
    /// from the front; a popped-but-not-erased id stays here until erased
    /// or swept so the timeout sweeper can still reclaim it.
    order: VecDeque<u32>,
    /// Monotonic id source; wraps around, skipping zero (§4.3).
    next_id: u32,
}

/// A keyed store that preserves insertion time and supports O(1) get/erase
/// by id plus FIFO consumption decoupled from removal.
pub struct TimeoutRegistry<V> {
    inner: Mutex<Inner<V>>,
}

impl<V> Default for TimeoutRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TimeoutRegistry<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                order: VecDeque::new(),
                next_id: 1,
            }),
        }
    }

    /// Returns a monotonic, non-zero id. Ids wrap around 32 bits, skipping
    /// zero, which the caller uses as a sentinel for "no request".
    pub fn generate_id(&self) -> u32 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id = match inner.next_id.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        id
    }

    /// Inserts `value` under `id`, recording the current time as its
    /// creation time. Fails if `id` is already present.
    pub fn push(&self, id: u32, value: V) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.by_id.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        inner.by_id.insert(
            id,
            Entry { value, create_time: Instant::now(), popped: false },
        );
        inner.order.push_back(id);
        Ok(())
    }

    /// Looks up `id`. When `erase` is true the entry is removed from both
    /// structures; otherwise it is left in place (a popped entry remains
    /// reachable this way until the sweeper or an explicit erase reclaims
    /// it).
    pub fn get(&self, id: u32, erase: bool) -> Option<V>
    where V: Clone {
        let mut inner = self.inner.lock();
        if erase {
            let entry = inner.by_id.remove(&id)?;
            inner.order.retain(|&x| x != id);
            Some(entry.value)
        } else {
            inner.by_id.get(&id).map(|e| e.value.clone())
        }
    }

    /// Removes `id` unconditionally, returning its value if present.
    pub fn erase(&self, id: u32) -> Option<V> {
        let mut inner = self.inner.lock();
        let entry = inner.by_id.remove(&id)?;
        inner.order.retain(|&x| x != id);
        Some(entry.value)
    }

    /// Returns the earliest entry not yet popped, marking it popped. The
    /// entry remains in the registry (reachable via `get`/`erase`) until
    /// its timeout fires or it is explicitly erased.
    pub fn pop(&self) -> Option<(u32, V)>
    where V: Clone {
        let mut inner = self.inner.lock();
        let id = inner.order.iter().copied().find(|id| {
            inner.by_id.get(id).map(|e| !e.popped).unwrap_or(false)
        })?;
        let value = {
            let entry = inner.by_id.get_mut(&id).expect("id came from by_id lookup");
            entry.popped = true;
            entry.value.clone()
        };
        Some((id, value))
    }

    /// Pops every not-yet-popped entry in FIFO order into `out`.
    pub fn swap(&self, out: &mut VecDeque<(u32, V)>)
    where V: Clone {
        let mut inner = self.inner.lock();
        let ids: Vec<u32> = inner
            .order
            .iter()
            .copied()
            .filter(|id| inner.by_id.get(id).map(|e| !e.popped).unwrap_or(false))
            .collect();
        for id in ids {
            let entry = inner.by_id.get_mut(&id).expect("id came from by_id lookup");
            entry.popped = true;
            out.push_back((id, entry.value.clone()));
        }
    }

    /// Removes every entry whose age exceeds `threshold`, returning the
    /// removed `(id, value)` pairs in oldest-first order. Callers may
    /// invoke a side-effecting callback over the result outside the lock
    /// (e.g. dispatching a timeout error to a waiting caller).
    pub fn timeout(&self, threshold: Duration) -> Vec<(u32, V)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        while let Some(&id) = inner.order.front() {
            let expired = inner
                .by_id
                .get(&id)
                .map(|e| now.saturating_duration_since(e.create_time) > threshold)
                .unwrap_or(true);
            if !expired {
                break;
            }
            inner.order.pop_front();
            if let Some(entry) = inner.by_id.remove(&id) {
                removed.push((id, entry.value));
            }
        }
        removed
    }

    /// Like [`Self::timeout`] but invokes `on_expire` for each removed
    /// entry, outside the registry's lock.
    pub fn timeout_with<F: FnMut(u32, V)>(&self, threshold: Duration, mut on_expire: F) {
        for (id, value) in self.timeout(threshold) {
            on_expire(id, value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;

    use super::*;

    #[test]
    fn generate_id_is_monotonic_and_skips_zero() {
        let reg: TimeoutRegistry<()> = TimeoutRegistry::new();
        let a = reg.generate_id();
        let b = reg.generate_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn push_rejects_duplicate_id() {
        let reg = TimeoutRegistry::new();
        reg.push(1, "a").unwrap();
        assert!(matches!(reg.push(1, "b"), Err(RegistryError::Duplicate(1))));
    }

    #[test]
    fn pop_is_fifo_and_leaves_entry_reachable() {
        let reg = TimeoutRegistry::new();
        reg.push(1, "a").unwrap();
        reg.push(2, "b").unwrap();
        assert_eq!(reg.pop(), Some((1, "a")));
        assert_eq!(reg.get(1, false), Some("a"));
        assert_eq!(reg.pop(), Some((2, "b")));
        assert_eq!(reg.pop(), None);
    }

    #[test]
    fn timeout_removes_only_expired_entries() {
        let reg = TimeoutRegistry::new();
        reg.push(1, "a").unwrap();
        sleep(Duration::from_millis(60));
        reg.push(2, "b").unwrap();
        sleep(Duration::from_millis(60));
        let removed = reg.timeout(Duration::from_millis(100));
        assert_eq!(removed.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(reg.get(2, false), Some("b"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn erase_removes_from_both_structures() {
        let reg = TimeoutRegistry::new();
        reg.push(1, "a").unwrap();
        assert_eq!(reg.erase(1), Some("a"));
        assert_eq!(reg.erase(1), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn swap_drains_all_unpopped_entries_in_order() {
        let reg = TimeoutRegistry::new();
        reg.push(1, "a").unwrap();
        reg.push(2, "b").unwrap();
        reg.push(3, "c").unwrap();
        reg.pop();
        let mut out = VecDeque::new();
        reg.swap(&mut out);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec![(2, "b"), (3, "c")]);
    }
}
