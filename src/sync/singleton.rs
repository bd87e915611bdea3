// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Thread-safe singleton lifecycle (§4.6).
//!
//! Two orthogonal axes control a singleton's behavior: where the instance
//! lives ([`CreationPolicy`]) and what happens to the slot after destruction
//! ([`LifetimePolicy`]). The source's "heap vs. placement-new static
//! storage" distinction doesn't translate literally to Rust — both are
//! represented here by `Arc<T>`, since Rust has no separate notion of a
//! raw, un-owned static allocation that is still safely shareable across
//! threads — but `CreationPolicy::NoDestroy` additionally leaks the `Arc`'s
//! strong count via [`std::mem::forget`] so the value is never dropped even
//! if every external handle is, matching the source's "never register a
//! destructor" behavior for that policy.
//!
//! Access uses double-checked locking: an atomic fast-path read avoids the
//! mutex once the instance is constructed; the slow path takes the mutex
//! and re-checks before constructing.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SingletonError {
    #[error("singleton accessed after destruction (default lifetime policy)")]
    AccessAfterDestroy,
}

/// Where a constructed instance is considered to live. Both variants use an
/// `Arc` under the hood (see module docs); `NoDestroy` additionally never
/// drops the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationPolicy {
    Heap,
    StaticStorage,
}

/// What happens to the slot once `destroy()` has been called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimePolicy {
    /// Access after destruction is an error.
    Default,
    /// Access after destruction silently re-creates the instance exactly
    /// once.
    Phoenix,
    /// The instance is never destroyed; `destroy()` is a no-op.
    NoDestroy,
}

struct Slot<T> {
    instance: Option<Arc<T>>,
}

/// A double-checked-locking singleton slot parameterized over the value
/// type and the two lifecycle policies.
pub struct Singleton<T> {
    slot: Mutex<Slot<T>>,
    constructed: AtomicBool,
    destroyed: AtomicBool,
    creation: CreationPolicy,
    lifetime: LifetimePolicy,
}

impl<T> Singleton<T> {
    pub const fn new(creation: CreationPolicy, lifetime: LifetimePolicy) -> Self {
        Self {
            slot: Mutex::new(Slot { instance: None }),
            constructed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            creation,
            lifetime,
        }
    }

    /// Returns the existing instance, or constructs one via `init` if none
    /// exists yet (or the lifetime policy permits re-creation after
    /// destruction). Concurrent callers racing to construct are guaranteed
    /// to see exactly one construction (Testable Property #7).
    pub fn get_instance<F>(&self, init: F) -> Result<Arc<T>, SingletonError>
    where F: FnOnce() -> T {
        // Outer, lock-free check.
        if self.constructed.load(Ordering::Acquire) {
            let guard = self.slot.lock();
            if let Some(existing) = guard.instance.as_ref() {
                return Ok(Arc::clone(existing));
            }
        }

        let mut guard = self.slot.lock();
        // Inner check under the lock: another thread may have won the race
        // between our fast-path read and acquiring the mutex.
        if let Some(existing) = guard.instance.as_ref() {
            return Ok(Arc::clone(existing));
        }

        if self.destroyed.load(Ordering::Acquire) {
            match self.lifetime {
                LifetimePolicy::Default => return Err(SingletonError::AccessAfterDestroy),
                LifetimePolicy::Phoenix => self.destroyed.store(false, Ordering::Release),
                LifetimePolicy::NoDestroy => {},
            }
        }

        let instance = Arc::new(init());
        guard.instance = Some(Arc::clone(&instance));
        self.constructed.store(true, Ordering::Release);
        Ok(instance)
    }

    /// Tears down the instance per the lifetime policy. `NoDestroy`
    /// singletons leak the `Arc` (matching "never register a destructor")
    /// instead of dropping it.
    pub fn destroy(&self) {
        if self.lifetime == LifetimePolicy::NoDestroy {
            return;
        }
        let mut guard = self.slot.lock();
        if let Some(instance) = guard.instance.take() {
            if self.creation == CreationPolicy::StaticStorage {
                std::mem::forget(instance);
            }
            self.constructed.store(false, Ordering::Release);
            self.destroyed.store(true, Ordering::Release);
        }
    }

    pub fn is_constructed(&self) -> bool {
        self.constructed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicU32, thread};

    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn concurrent_get_instance_constructs_exactly_once() {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        static SINGLETON: Singleton<u32> =
            Singleton::new(CreationPolicy::Heap, LifetimePolicy::Default);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                thread::spawn(|| {
                    SINGLETON
                        .get_instance(|| COUNTER.fetch_add(1, Ordering::SeqCst))
                        .expect("construction should succeed")
                })
            })
            .collect();

        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(COUNTER.load(Ordering::SeqCst), 1);
        SINGLETON.destroy();
    }

    #[test]
    #[serial]
    fn default_lifetime_errors_after_destroy() {
        static SINGLETON: Singleton<u32> =
            Singleton::new(CreationPolicy::Heap, LifetimePolicy::Default);
        SINGLETON.get_instance(|| 1).unwrap();
        SINGLETON.destroy();
        assert!(matches!(
            SINGLETON.get_instance(|| 2),
            Err(SingletonError::AccessAfterDestroy)
        ));
    }

    #[test]
    #[serial]
    fn phoenix_lifetime_recreates_exactly_once_after_destroy() {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        static SINGLETON: Singleton<u32> =
            Singleton::new(CreationPolicy::Heap, LifetimePolicy::Phoenix);

        let first = SINGLETON
            .get_instance(|| COUNTER.fetch_add(1, Ordering::SeqCst))
            .unwrap();
        assert_eq!(*first, 0);
        SINGLETON.destroy();
        let second = SINGLETON
            .get_instance(|| COUNTER.fetch_add(1, Ordering::SeqCst))
            .unwrap();
        assert_eq!(*second, 1);
        assert_eq!(COUNTER.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[serial]
    fn no_destroy_lifetime_ignores_destroy_calls() {
        static SINGLETON: Singleton<u32> =
            Singleton::new(CreationPolicy::StaticStorage, LifetimePolicy::NoDestroy);
        let first = SINGLETON.get_instance(|| 42).unwrap();
        SINGLETON.destroy();
        let second = SINGLETON.get_instance(|| 99).unwrap();
        assert_eq!(*first, 42);
        assert_eq!(*second, 42);
    }
}
