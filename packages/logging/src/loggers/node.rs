use crate::{now, Direction, LogInfo, LogSink, Loglevel};
use std::sync::Arc;
use zwire_core::definitions::NodeId;

/// Logs events attributed to a single node on the mesh.
pub struct NodeLogger {
    sink: Arc<dyn LogSink>,
    node_id: NodeId,
}

impl NodeLogger {
    pub fn new(sink: Arc<dyn LogSink>, node_id: NodeId) -> Self {
        Self { sink, node_id }
    }

    fn write(&self, level: Loglevel, direction: Direction, message: String) {
        self.sink.log(
            LogInfo {
                timestamp: now(),
                label: format!("Node {}", self.node_id).into(),
                direction,
                message: message.into(),
            },
            level,
        );
    }

    pub fn info(&self, message: impl FnOnce() -> String) {
        self.write(Loglevel::Info, Direction::None, message());
    }

    pub fn warn(&self, message: impl FnOnce() -> String) {
        self.write(Loglevel::Warn, Direction::None, message());
    }

    pub fn error(&self, message: impl FnOnce() -> String) {
        self.write(Loglevel::Error, Direction::None, message());
    }

    pub fn command(&self, direction: Direction, message: impl FnOnce() -> String) {
        self.write(Loglevel::Info, direction, message());
    }
}
