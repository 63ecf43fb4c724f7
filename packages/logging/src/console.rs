use crate::{Direction, LogInfo, LogSink, Loglevel};
use std::io::Write;
use std::sync::Mutex;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Writes log records to stdout, one line per record, colored by level.
pub struct ConsoleSink {
    stream: Mutex<StandardStream>,
    level: Loglevel,
}

impl ConsoleSink {
    pub fn new(level: Loglevel) -> Self {
        Self {
            stream: Mutex::new(StandardStream::stdout(ColorChoice::Auto)),
            level,
        }
    }
}

fn level_color(level: Loglevel) -> ColorSpec {
    let mut spec = ColorSpec::new();
    match level {
        Loglevel::Error => spec.set_fg(Some(Color::Red)),
        Loglevel::Warn => spec.set_fg(Some(Color::Yellow)),
        Loglevel::Info => spec.set_fg(Some(Color::White)),
        Loglevel::Verbose | Loglevel::Debug => spec.set_fg(Some(Color::Cyan)).set_dimmed(true),
    };
    spec
}

impl LogSink for ConsoleSink {
    fn log(&self, info: LogInfo, level: Loglevel) {
        if level > self.level {
            return;
        }
        let Ok(mut stream) = self.stream.lock() else {
            return;
        };
        let _ = stream.set_color(&level_color(level));
        let _ = writeln!(
            stream,
            "{} {:10} {}{}",
            info.timestamp,
            info.label,
            match info.direction {
                Direction::None => "",
                _ => info.direction.symbol(),
            },
            info.message
        );
        let _ = stream.reset();
    }

    fn log_level(&self) -> Loglevel {
        self.level
    }
}
