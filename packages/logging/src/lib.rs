use std::borrow::Cow;

mod console;
pub mod loggers;

pub use console::ConsoleSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Loglevel {
    Error,
    Warn,
    Info,
    Verbose,
    Debug,
}

/// Which way a logged frame or command travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    None,
}

impl Direction {
    pub fn symbol(&self) -> &'static str {
        match self {
            Direction::Inbound => "« ",
            Direction::Outbound => "» ",
            Direction::None => "  ",
        }
    }
}

/// One log record, produced by the logger façades and consumed by a sink.
pub struct LogInfo {
    pub timestamp: String,
    pub label: Cow<'static, str>,
    pub direction: Direction,
    pub message: Cow<'static, str>,
}

/// Where log records end up. Sinks are shared across tasks, so they take
/// `&self` and must serialize output internally.
pub trait LogSink: Send + Sync {
    fn log(&self, info: LogInfo, level: Loglevel);
    fn log_level(&self) -> Loglevel;
}

/// A sink that swallows everything; useful in tests.
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _info: LogInfo, _level: Loglevel) {}

    fn log_level(&self) -> Loglevel {
        Loglevel::Error
    }
}

pub(crate) fn now() -> String {
    use time::{macros::format_description, OffsetDateTime};
    let format =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");
    OffsetDateTime::now_utc()
        .format(format)
        .unwrap_or_default()
}
