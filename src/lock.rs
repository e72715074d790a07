//! Cross-document locking discipline
//!
//! Every document exposes one monitor (its inner mutex). Single-document
//! operations hold that monitor for their duration. A cross-document
//! operation must take both monitors without risking deadlock against a
//! concurrent operation moving data the opposite way:
//!
//! 1. take the process-wide ordering lock
//! 2. take both document monitors in increasing store-id order
//! 3. release the ordering lock, keeping the two monitors
//!
//! The global lock is held only for the brief acquisition window, so it
//! serializes lock acquisition order, not the operations themselves.

use log::trace;
use parking_lot::{Mutex, MutexGuard};

use crate::store::root::StoreInner;
use crate::store::XmlStore;

static GLOBAL_ORDER: Mutex<()> = Mutex::new(());

/// Acquire both documents' monitors deadlock-free.
///
/// Returns the guards in argument order. The two stores must be distinct
/// documents; same-document operations take the single monitor directly.
pub(crate) fn lock_pair<'a>(
    a: &'a XmlStore,
    b: &'a XmlStore,
) -> (MutexGuard<'a, StoreInner>, MutexGuard<'a, StoreInner>) {
    debug_assert_ne!(a.store_id, b.store_id, "lock_pair on one document");
    let order = GLOBAL_ORDER.lock();
    trace!(
        "acquiring monitors for documents {} and {}",
        a.store_id,
        b.store_id
    );
    let guards = if a.store_id < b.store_id {
        let ga = a.inner.lock();
        let gb = b.inner.lock();
        (ga, gb)
    } else {
        let gb = b.inner.lock();
        let ga = a.inner.lock();
        (ga, gb)
    };
    drop(order);
    guards
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_pair_both_orders() {
        let a = XmlStore::new();
        let b = XmlStore::new();
        {
            let (ga, gb) = lock_pair(&a, &b);
            drop(ga);
            drop(gb);
        }
        {
            let (gb, ga) = lock_pair(&b, &a);
            drop(ga);
            drop(gb);
        }
    }

    #[test]
    fn test_opposite_direction_no_deadlock() {
        let a = XmlStore::new();
        let b = XmlStore::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let a = Arc::clone(&a);
            let b = Arc::clone(&b);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let (x, y) = if i % 2 == 0 {
                        lock_pair(&a, &b)
                    } else {
                        lock_pair(&b, &a)
                    };
                    drop(x);
                    drop(y);
                }
            }));
        }
        for h in handles {
            h.join().expect("locking thread panicked");
        }
    }
}
