use crate::{now, Direction, LogInfo, LogSink, Loglevel};
use std::sync::Arc;

/// Logs lifecycle messages of the driver itself.
#[derive(Clone)]
pub struct DriverLogger {
    sink: Arc<dyn LogSink>,
}

impl DriverLogger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    fn write(&self, level: Loglevel, message: String) {
        self.sink.log(
            LogInfo {
                timestamp: now(),
                label: "DRIVER".into(),
                direction: Direction::None,
                message: message.into(),
            },
            level,
        );
    }

    pub fn info(&self, message: impl FnOnce() -> String) {
        self.write(Loglevel::Info, message());
    }

    pub fn warn(&self, message: impl FnOnce() -> String) {
        self.write(Loglevel::Warn, message());
    }

    pub fn error(&self, message: impl FnOnce() -> String) {
        self.write(Loglevel::Error, message());
    }

    pub fn verbose(&self, message: impl FnOnce() -> String) {
        if self.sink.log_level() >= Loglevel::Verbose {
            self.write(Loglevel::Verbose, message());
        }
    }
}
