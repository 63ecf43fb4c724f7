use crate::{now, Direction, LogInfo, LogSink, Loglevel};
use std::sync::Arc;

/// Logs traffic between the driver and the controller stick.
#[derive(Clone)]
pub struct ControllerLogger {
    sink: Arc<dyn LogSink>,
}

impl ControllerLogger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    fn write(&self, level: Loglevel, direction: Direction, message: String) {
        self.sink.log(
            LogInfo {
                timestamp: now(),
                label: "CNTRLR".into(),
                direction,
                message: message.into(),
            },
            level,
        );
    }

    /// Log a frame travelling in the given direction, as hex
    pub fn frame(&self, direction: Direction, bytes: &[u8]) {
        if self.sink.log_level() >= Loglevel::Debug {
            self.write(Loglevel::Debug, direction, format!("0x{}", hex::encode(bytes)));
        }
    }

    pub fn message(&self, direction: Direction, message: impl FnOnce() -> String) {
        self.write(Loglevel::Info, direction, message());
    }

    pub fn warn(&self, message: impl FnOnce() -> String) {
        self.write(Loglevel::Warn, Direction::None, message());
    }
}
