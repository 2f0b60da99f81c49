//! In-flight update bookkeeping per namespace
//!
//! Two kinds of producers hold guards here for the duration of a shard
//! round trip:
//! - a coordinator's own broadcast in `PerformingUpdate`
//! - any other write path on this node that updates a namespace outside a
//!   coordinator, such as a router forwarding targeted updates; these obtain
//!   the tracker through `MultiUpdateCoordinatorService::pending_updates`
//!
//! `CheckingForPendingUpdates` waits until the count for its namespace
//! drains to zero before migrations may be unblocked.

use crate::coordinator::document::Namespace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct PendingUpdateTracker {
    in_flight: Mutex<HashMap<Namespace, usize>>,
}

impl PendingUpdateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one in-flight broadcast; released when the guard drops.
    pub fn begin(self: &Arc<Self>, namespace: &Namespace) -> PendingUpdateGuard {
        *self.in_flight.lock().entry(namespace.clone()).or_insert(0) += 1;
        PendingUpdateGuard {
            tracker: self.clone(),
            namespace: namespace.clone(),
        }
    }

    pub fn pending(&self, namespace: &Namespace) -> usize {
        self.in_flight.lock().get(namespace).copied().unwrap_or(0)
    }

    pub fn is_clear(&self, namespace: &Namespace) -> bool {
        self.pending(namespace) == 0
    }

    fn end(&self, namespace: &Namespace) {
        let mut in_flight = self.in_flight.lock();
        if let Some(count) = in_flight.get_mut(namespace) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(namespace);
            }
        }
    }
}

#[derive(Debug)]
pub struct PendingUpdateGuard {
    tracker: Arc<PendingUpdateTracker>,
    namespace: Namespace,
}

impl Drop for PendingUpdateGuard {
    fn drop(&mut self) {
        self.tracker.end(&self.namespace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let tracker = Arc::new(PendingUpdateTracker::new());
        let ns: Namespace = "db.coll".parse().unwrap();
        let other: Namespace = "db.other".parse().unwrap();

        let first = tracker.begin(&ns);
        let second = tracker.begin(&ns);
        assert_eq!(tracker.pending(&ns), 2);
        assert!(tracker.is_clear(&other));

        drop(first);
        assert_eq!(tracker.pending(&ns), 1);
        drop(second);
        assert!(tracker.is_clear(&ns));
    }
}
