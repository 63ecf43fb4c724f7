use crate::message::Message;
use crate::node::{Node, NodeTable, QueryStage};
use crate::notification::{Notification, NotificationBus};
use crate::queue::{QueueBand, QueueItem, SendQueues};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zwire_core::prelude::*;

/// The narrow capability surface handed to command-class handlers. Handlers
/// can enqueue frames, post notifications and inspect nodes, and nothing
/// else; there is no back-channel into the driver's own state.
pub struct DriverCtx<'a> {
    pub(crate) queues: &'a SendQueues,
    pub(crate) bus: &'a NotificationBus,
    pub(crate) nodes: &'a Mutex<NodeTable>,
    pub(crate) source_node: NodeId,
}

impl DriverCtx<'_> {
    /// The node the current payload came from
    pub fn node_id(&self) -> NodeId {
        self.source_node
    }

    pub fn enqueue(&self, msg: Message, band: QueueBand) -> bool {
        self.queues.enqueue(QueueItem::SendMsg(msg), band)
    }

    pub fn notify(&self, notification: Notification) {
        self.bus.post(notification);
    }

    /// Run `f` against a node under the table lock. The lock is held only for
    /// the duration of `f`; do not stash references.
    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        let mut nodes = self.nodes.lock().expect("node table mutex poisoned");
        nodes.get_mut(id).map(f)
    }
}

/// An opaque command-class plugin. The driver core never interprets
/// application payloads itself; it routes them here by their class byte.
pub trait CommandClassHandler: Send + Sync {
    /// The command class byte this handler owns
    fn class_id(&self) -> u8;

    /// An application payload relayed from a node: class byte, command,
    /// parameters. Refreshed values surface as notifications through `ctx`.
    fn handle(&self, payload: &[u8], ctx: &DriverCtx);

    /// Outbound exchanges this class contributes to an interview stage
    fn queries_for_stage(&self, _node: NodeId, _stage: QueryStage) -> Vec<Message> {
        Vec::new()
    }

    /// The exchange that refreshes one polled value of this class
    fn refresh_message(&self, _value_id: ValueId) -> Option<Message> {
        None
    }
}

/// Handlers keyed by class byte. Identified by `(node, class)` at call sites;
/// handler instances themselves are stateless with respect to nodes.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<u8, Arc<dyn CommandClassHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn CommandClassHandler>) {
        self.handlers.insert(handler.class_id(), handler);
    }

    pub fn get(&self, class: u8) -> Option<&Arc<dyn CommandClassHandler>> {
        self.handlers.get(&class)
    }

    /// All exchanges the node's supported classes contribute to a stage
    pub fn stage_queries(&self, node: &Node, stage: QueryStage) -> Vec<Message> {
        node.command_classes()
            .filter_map(|class| self.handlers.get(&class))
            .flat_map(|handler| handler.queries_for_stage(node.id(), stage))
            .collect()
    }

    pub fn refresh_message(&self, value_id: ValueId) -> Option<Message> {
        self.handlers
            .get(&value_id.command_class)?
            .refresh_message(value_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zwire_core::definitions::TransmitOptions;

    struct BinarySwitch;

    impl CommandClassHandler for BinarySwitch {
        fn class_id(&self) -> u8 {
            0x25
        }

        fn handle(&self, payload: &[u8], ctx: &DriverCtx) {
            // A report updates the node's value and surfaces a change
            if payload.get(1) == Some(&0x03) {
                ctx.notify(Notification::ValueChanged {
                    value_id: ValueId::new(ctx.node_id(), 0x25, 1, 0),
                });
            }
        }

        fn queries_for_stage(&self, node: NodeId, stage: QueryStage) -> Vec<Message> {
            match stage {
                QueryStage::Dynamic => vec![Message::send_data_expecting_report(
                    node,
                    &[0x25, 0x02],
                    TransmitOptions::default(),
                )],
                _ => Vec::new(),
            }
        }

        fn refresh_message(&self, value_id: ValueId) -> Option<Message> {
            Some(Message::send_data_expecting_report(
                value_id.node_id,
                &[0x25, 0x02],
                TransmitOptions::default(),
            ))
        }
    }

    #[test]
    fn test_stage_queries_follow_node_classes() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(BinarySwitch));

        let mut node = Node::new(NodeId::new(3));
        assert!(registry.stage_queries(&node, QueryStage::Dynamic).is_empty());

        node.add_command_class(0x25);
        let queries = registry.stage_queries(&node, QueryStage::Dynamic);
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].expected_command_class(), 0x25);
        assert!(registry.stage_queries(&node, QueryStage::Static).is_empty());
    }

    #[test]
    fn test_handler_context_capabilities() {
        let queues = SendQueues::new();
        let bus = NotificationBus::new();
        let nodes = Mutex::new(NodeTable::new());
        nodes.lock().unwrap().init_node(NodeId::new(3));

        let ctx = DriverCtx {
            queues: &queues,
            bus: &bus,
            nodes: &nodes,
            source_node: NodeId::new(3),
        };

        let handler = BinarySwitch;
        // Payload: class, command (report), value
        handler.handle(&[0x25, 0x03, 0xff], &ctx);
        assert_eq!(bus.pending(), 1);

        ctx.with_node(NodeId::new(3), |node| node.add_command_class(0x25));
        assert!(nodes
            .lock()
            .unwrap()
            .get(NodeId::new(3))
            .unwrap()
            .supports_command_class(0x25));
    }

    #[test]
    fn test_refresh_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(BinarySwitch));

        let polled = ValueId::new(NodeId::new(4), 0x25, 1, 0);
        assert!(registry.refresh_message(polled).is_some());
        let unknown = ValueId::new(NodeId::new(4), 0x31, 1, 0);
        assert!(registry.refresh_message(unknown).is_none());
    }
}
