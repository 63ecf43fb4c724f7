use crate::message::Message;
use crate::node::QueryStage;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use zwire_core::prelude::*;

/// The five send bands, highest priority first. Controller-administration
/// traffic must never be interrupted, wakeup windows are short, and discovery
/// and polling must not crowd out user traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueBand {
    Command = 0,
    WakeUp = 1,
    Send = 2,
    Query = 3,
    Poll = 4,
}

impl QueueBand {
    pub const ALL: [QueueBand; 5] = [
        QueueBand::Command,
        QueueBand::WakeUp,
        QueueBand::Send,
        QueueBand::Query,
        QueueBand::Poll,
    ];

    /// Controller-administration traffic goes out regardless of the target's
    /// sleep state; everything else waits for the node to be awake.
    fn sendable_while_asleep(&self) -> bool {
        matches!(self, QueueBand::Command)
    }
}

/// One entry of a send band: either an outbound message, or the marker that
/// advances a node's interview once everything queued before it has drained.
#[derive(Debug, Clone)]
pub enum QueueItem {
    SendMsg(Message),
    QueryStageComplete { node_id: NodeId, stage: QueryStage },
}

impl QueueItem {
    pub fn target_node(&self) -> NodeId {
        match self {
            QueueItem::SendMsg(msg) => msg.target_node(),
            QueueItem::QueryStageComplete { node_id, .. } => *node_id,
        }
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (QueueItem::SendMsg(a), QueueItem::SendMsg(b)) => a == b,
            (
                QueueItem::QueryStageComplete { node_id, stage },
                QueueItem::QueryStageComplete {
                    node_id: other_node,
                    stage: other_stage,
                },
            ) => node_id == other_node && stage == other_stage,
            _ => false,
        }
    }
}

impl Eq for QueueItem {}

/// The prioritized send queues. All bands share one mutex; readiness is
/// signalled through a single [`Notify`] the driver loop sleeps on.
pub struct SendQueues {
    bands: Mutex<[VecDeque<QueueItem>; 5]>,
    ready: Notify,
}

impl Default for SendQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueues {
    pub fn new() -> Self {
        Self {
            bands: Mutex::new(Default::default()),
            ready: Notify::new(),
        }
    }

    /// Append an item to a band, unless an equal item is already queued
    /// there. Returns whether the item was actually added.
    pub fn enqueue(&self, item: QueueItem, band: QueueBand) -> bool {
        {
            let mut bands = self.bands.lock().expect("send queue mutex poisoned");
            let queue = &mut bands[band as usize];
            if queue.contains(&item) {
                return false;
            }
            queue.push_back(item);
        }
        self.ready.notify_one();
        true
    }

    /// Put an item back at the head of its band, ahead of everything queued
    /// behind it. Used when an in-flight message must be retried in place.
    pub fn requeue_front(&self, item: QueueItem, band: QueueBand) {
        {
            let mut bands = self.bands.lock().expect("send queue mutex poisoned");
            bands[band as usize].push_front(item);
        }
        self.ready.notify_one();
    }

    /// Pop the head of the highest-priority non-empty band whose head is
    /// currently sendable. `asleep` reports the driver's current belief about
    /// a node and must not take any lock of its own.
    pub fn pop_next_sendable(
        &self,
        asleep: &dyn Fn(NodeId) -> bool,
    ) -> Option<(QueueItem, QueueBand)> {
        let mut bands = self.bands.lock().expect("send queue mutex poisoned");
        for band in QueueBand::ALL {
            let queue = &mut bands[band as usize];
            let Some(head) = queue.front() else {
                continue;
            };
            let target = head.target_node();
            if target.is_valid() && asleep(target) && !band.sendable_while_asleep() {
                continue;
            }
            let item = queue.pop_front().expect("head checked above");
            return Some((item, band));
        }
        None
    }

    /// Move every queued Send/Query/Poll item addressed to `node` onto the
    /// WakeUp band, preserving relative order. Returns how many moved.
    pub fn move_to_wakeup(&self, node: NodeId) -> usize {
        let mut bands = self.bands.lock().expect("send queue mutex poisoned");
        let mut moved = Vec::new();
        for band in [QueueBand::Send, QueueBand::Query, QueueBand::Poll] {
            let queue = &mut bands[band as usize];
            let mut keep = VecDeque::with_capacity(queue.len());
            for item in queue.drain(..) {
                if item.target_node() == node {
                    moved.push(item);
                } else {
                    keep.push_back(item);
                }
            }
            *queue = keep;
        }
        let count = moved.len();
        let wakeup = &mut bands[QueueBand::WakeUp as usize];
        for item in moved {
            if !wakeup.contains(&item) {
                wakeup.push_back(item);
            }
        }
        count
    }

    /// Drop everything queued for the given node, e.g. after it was removed
    pub fn remove_node_items(&self, node: NodeId) {
        let mut bands = self.bands.lock().expect("send queue mutex poisoned");
        for queue in bands.iter_mut() {
            queue.retain(|item| item.target_node() != node);
        }
    }

    pub fn len(&self) -> usize {
        let bands = self.bands.lock().expect("send queue mutex poisoned");
        bands.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn band_len(&self, band: QueueBand) -> usize {
        let bands = self.bands.lock().expect("send queue mutex poisoned");
        bands[band as usize].len()
    }

    /// Whether any band above `band` holds traffic
    pub fn busy_above(&self, band: QueueBand) -> bool {
        let bands = self.bands.lock().expect("send queue mutex poisoned");
        bands
            .iter()
            .take(band as usize)
            .any(|queue| !queue.is_empty())
    }

    pub fn clear(&self) {
        let mut bands = self.bands.lock().expect("send queue mutex poisoned");
        for queue in bands.iter_mut() {
            queue.clear();
        }
    }

    /// Wake the driver loop, e.g. after a node's wakeup traffic became sendable
    pub fn signal(&self) {
        self.ready.notify_one();
    }

    pub async fn readiness(&self) {
        self.ready.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zwire_core::definitions::TransmitOptions;

    fn msg(node: u8, cc: &[u8]) -> Message {
        Message::send_data(NodeId::new(node), cc, TransmitOptions::default())
    }

    fn awake(_: NodeId) -> bool {
        false
    }

    #[test]
    fn test_priority_order() {
        let queues = SendQueues::new();
        queues.enqueue(QueueItem::SendMsg(msg(1, &[0x20, 0x02])), QueueBand::Poll);
        queues.enqueue(QueueItem::SendMsg(msg(2, &[0x25, 0x01])), QueueBand::Command);
        queues.enqueue(QueueItem::SendMsg(msg(3, &[0x26, 0x02])), QueueBand::Send);

        let order: Vec<NodeId> = std::iter::from_fn(|| {
            queues
                .pop_next_sendable(&awake)
                .map(|(item, _)| item.target_node())
        })
        .collect();
        assert_eq!(order, vec![NodeId::new(2), NodeId::new(3), NodeId::new(1)]);
    }

    #[test]
    fn test_fifo_within_band() {
        let queues = SendQueues::new();
        for i in 1..=4u8 {
            queues.enqueue(QueueItem::SendMsg(msg(i, &[0x25, 0x02])), QueueBand::Send);
        }
        let order: Vec<NodeId> = std::iter::from_fn(|| {
            queues
                .pop_next_sendable(&awake)
                .map(|(item, _)| item.target_node())
        })
        .collect();
        assert_eq!(order, (1..=4u8).map(NodeId::new).collect::<Vec<_>>());
    }

    #[test]
    fn test_dedup() {
        let queues = SendQueues::new();
        assert!(queues.enqueue(QueueItem::SendMsg(msg(1, &[0x25, 0x02])), QueueBand::Send));
        assert!(!queues.enqueue(QueueItem::SendMsg(msg(1, &[0x25, 0x02])), QueueBand::Send));
        assert_eq!(queues.len(), 1);

        let marker = QueueItem::QueryStageComplete {
            node_id: NodeId::new(1),
            stage: QueryStage::NodeInfo,
        };
        assert!(queues.enqueue(marker.clone(), QueueBand::Query));
        assert!(!queues.enqueue(marker, QueueBand::Query));
    }

    #[test]
    fn test_asleep_head_skips_to_lower_band() {
        let queues = SendQueues::new();
        queues.enqueue(QueueItem::SendMsg(msg(7, &[0x25, 0x02])), QueueBand::Send);
        queues.enqueue(QueueItem::SendMsg(msg(8, &[0x25, 0x02])), QueueBand::Poll);

        let asleep = |id: NodeId| id == NodeId::new(7);
        let (item, band) = queues.pop_next_sendable(&asleep).unwrap();
        assert_eq!(item.target_node(), NodeId::new(8));
        assert_eq!(band, QueueBand::Poll);

        // Parked traffic stays parked until the node reports awake
        queues.move_to_wakeup(NodeId::new(7));
        assert!(queues.pop_next_sendable(&asleep).is_none());
        let (item, band) = queues.pop_next_sendable(&awake).unwrap();
        assert_eq!(item.target_node(), NodeId::new(7));
        assert_eq!(band, QueueBand::WakeUp);
    }

    #[test]
    fn test_wakeup_migration_preserves_order() {
        let queues = SendQueues::new();
        let first = msg(5, &[0x26, 0x01, 0x10]);
        let second = msg(5, &[0x26, 0x01, 0x20]);
        let third = msg(5, &[0x26, 0x01, 0x30]);
        queues.enqueue(QueueItem::SendMsg(first.clone()), QueueBand::Send);
        queues.enqueue(QueueItem::SendMsg(second.clone()), QueueBand::Send);
        queues.enqueue(QueueItem::SendMsg(msg(6, &[0x25, 0x02])), QueueBand::Send);
        queues.enqueue(QueueItem::SendMsg(third.clone()), QueueBand::Query);

        assert_eq!(queues.move_to_wakeup(NodeId::new(5)), 3);
        assert_eq!(queues.band_len(QueueBand::WakeUp), 3);
        assert_eq!(queues.band_len(QueueBand::Send), 1);
        assert_eq!(queues.band_len(QueueBand::Query), 0);

        let drained: Vec<Message> = std::iter::from_fn(|| {
            queues.pop_next_sendable(&awake).map(|(item, _)| item)
        })
        .filter_map(|item| match item {
            QueueItem::SendMsg(m) if m.target_node() == NodeId::new(5) => Some(m),
            _ => None,
        })
        .collect();
        assert_eq!(drained, vec![first, second, third]);
    }

    #[test]
    fn test_busy_above() {
        let queues = SendQueues::new();
        assert!(!queues.busy_above(QueueBand::Poll));
        queues.enqueue(QueueItem::SendMsg(msg(1, &[0x25, 0x02])), QueueBand::Send);
        assert!(queues.busy_above(QueueBand::Poll));
        assert!(!queues.busy_above(QueueBand::Send));
    }
}
