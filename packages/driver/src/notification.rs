use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use zwire_core::prelude::*;

/// Everything the driver reports to the host. Watchers receive these in the
/// order they were enqueued, and only from a point in the driver loop where
/// no node-table lock is held.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    // Value lifecycle, produced on behalf of command-class handlers
    ValueAdded { value_id: ValueId },
    ValueRemoved { value_id: ValueId },
    ValueChanged { value_id: ValueId },
    ValueRefreshed { value_id: ValueId },

    /// A node's association group membership changed
    Group { node_id: NodeId, group_idx: u8 },

    // Node lifecycle
    NodeNew { node_id: NodeId },
    NodeAdded { node_id: NodeId },
    NodeRemoved { node_id: NodeId },
    NodeProtocolInfo { node_id: NodeId },
    NodeNaming { node_id: NodeId },
    NodeEvent { node_id: NodeId, event: u8 },

    PollingDisabled { value_id: ValueId },
    PollingEnabled { value_id: ValueId },

    SceneEvent { node_id: NodeId, scene_id: u8 },

    // Handheld button tracking
    CreateButton { value_id: ValueId },
    DeleteButton { value_id: ValueId },
    ButtonOn { value_id: ValueId },
    ButtonOff { value_id: ValueId },

    // Driver lifecycle
    DriverReady { home_id: u32, node_id: NodeId },
    DriverFailed,
    DriverReset,

    // Interview milestones
    EssentialNodeQueriesComplete { node_id: NodeId },
    NodeQueriesComplete { node_id: NodeId },
    AwakeNodesQueried,
    AllNodesQueried,
}

pub type Watcher = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherId(u64);

/// Single-producer queue of notifications, drained by the driver loop at its
/// safe point and fanned out to every registered watcher in order.
pub struct NotificationBus {
    queue: Mutex<VecDeque<Notification>>,
    watchers: Mutex<Vec<(WatcherId, Watcher)>>,
    next_id: Mutex<u64>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            watchers: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    pub fn post(&self, notification: Notification) {
        self.queue
            .lock()
            .expect("notification queue mutex poisoned")
            .push_back(notification);
    }

    pub fn add_watcher(&self, watcher: Watcher) -> WatcherId {
        let mut next_id = self.next_id.lock().expect("watcher id mutex poisoned");
        let id = WatcherId(*next_id);
        *next_id += 1;
        self.watchers
            .lock()
            .expect("watcher list mutex poisoned")
            .push((id, watcher));
        id
    }

    pub fn remove_watcher(&self, id: WatcherId) -> bool {
        let mut watchers = self.watchers.lock().expect("watcher list mutex poisoned");
        let before = watchers.len();
        watchers.retain(|(watcher_id, _)| *watcher_id != id);
        watchers.len() != before
    }

    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .expect("notification queue mutex poisoned")
            .len()
    }

    /// Deliver everything queued so far. Both locks are released before any
    /// watcher code runs, so watchers may post or (de)register freely.
    pub fn dispatch(&self) {
        let drained: Vec<Notification> = {
            let mut queue = self.queue.lock().expect("notification queue mutex poisoned");
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        let watchers: Vec<Watcher> = {
            let watchers = self.watchers.lock().expect("watcher list mutex poisoned");
            watchers.iter().map(|(_, w)| w.clone()).collect()
        };
        for notification in &drained {
            for watcher in &watchers {
                watcher(notification);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dispatch_order() {
        let bus = NotificationBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.add_watcher(Arc::new(move |n: &Notification| {
            seen2.lock().unwrap().push(n.clone());
        }));

        bus.post(Notification::NodeAdded {
            node_id: NodeId::new(1),
        });
        bus.post(Notification::AwakeNodesQueried);
        assert_eq!(bus.pending(), 2);
        bus.dispatch();
        assert_eq!(bus.pending(), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Notification::NodeAdded {
                    node_id: NodeId::new(1)
                },
                Notification::AwakeNodesQueried
            ]
        );
    }

    #[test]
    fn test_remove_watcher() {
        let bus = NotificationBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = bus.add_watcher(Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.post(Notification::DriverReset);
        bus.dispatch();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(bus.remove_watcher(id));
        assert!(!bus.remove_watcher(id));
        bus.post(Notification::DriverReset);
        bus.dispatch();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watcher_may_post_during_dispatch() {
        let bus = Arc::new(NotificationBus::new());
        let bus2 = bus.clone();
        bus.add_watcher(Arc::new(move |n: &Notification| {
            if matches!(n, Notification::DriverReady { .. }) {
                bus2.post(Notification::DriverReset);
            }
        }));
        bus.post(Notification::DriverReady {
            home_id: 0xc0ffee,
            node_id: NodeId::new(1),
        });
        bus.dispatch();
        // The re-entrant post lands in the queue for the next safe point
        assert_eq!(bus.pending(), 1);
    }
}
