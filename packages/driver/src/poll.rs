use std::sync::Mutex;
use std::time::Duration;
use zwire_core::prelude::*;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct PollEntry {
    value_id: ValueId,
    /// Poll every Nth pass through the list; 1 = every pass
    intensity: u8,
    counter: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    /// true: sleep `interval` between successive polls.
    /// false: spread one pass over all entries across `interval`.
    pub between_polls: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            between_polls: false,
        }
    }
}

/// The rotating list of values that are refreshed on a timer. The poll task
/// asks for the next due entry each tick; the driver suppresses the tick
/// entirely while higher-priority traffic is pending.
pub struct PollList {
    entries: Mutex<Vec<PollEntry>>,
    config: Mutex<PollConfig>,
}

impl Default for PollList {
    fn default() -> Self {
        Self::new()
    }
}

impl PollList {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            config: Mutex::new(PollConfig::default()),
        }
    }

    /// Returns false if the value is already polled
    pub fn enable(&self, value_id: ValueId, intensity: u8) -> bool {
        let mut entries = self.entries.lock().expect("poll list mutex poisoned");
        if entries.iter().any(|e| e.value_id == value_id) {
            return false;
        }
        let intensity = intensity.max(1);
        entries.push(PollEntry {
            value_id,
            intensity,
            counter: intensity,
        });
        true
    }

    pub fn disable(&self, value_id: ValueId) -> bool {
        let mut entries = self.entries.lock().expect("poll list mutex poisoned");
        let before = entries.len();
        entries.retain(|e| e.value_id != value_id);
        entries.len() != before
    }

    pub fn is_polled(&self, value_id: ValueId) -> bool {
        let entries = self.entries.lock().expect("poll list mutex poisoned");
        entries.iter().any(|e| e.value_id == value_id)
    }

    pub fn set_intensity(&self, value_id: ValueId, intensity: u8) -> bool {
        let mut entries = self.entries.lock().expect("poll list mutex poisoned");
        match entries.iter_mut().find(|e| e.value_id == value_id) {
            Some(entry) => {
                entry.intensity = intensity.max(1);
                entry.counter = entry.counter.min(entry.intensity);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("poll list mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_interval(&self, interval: Duration, between_polls: bool) {
        let mut config = self.config.lock().expect("poll config mutex poisoned");
        config.interval = interval;
        config.between_polls = between_polls;
    }

    pub fn config(&self) -> PollConfig {
        *self.config.lock().expect("poll config mutex poisoned")
    }

    /// How long the poll task sleeps before the next tick
    pub fn next_sleep(&self) -> Duration {
        let config = self.config();
        if config.between_polls {
            return config.interval;
        }
        let len = self.len().max(1) as u32;
        config.interval / len
    }

    /// Rotate the list by one entry and return its value id if its counter
    /// ran out this pass.
    pub fn next_due(&self) -> Option<ValueId> {
        let mut entries = self.entries.lock().expect("poll list mutex poisoned");
        if entries.is_empty() {
            return None;
        }
        let mut entry = entries.remove(0);
        entry.counter = entry.counter.saturating_sub(1);
        let due = entry.counter == 0;
        if due {
            entry.counter = entry.intensity;
        }
        let value_id = entry.value_id;
        entries.push(entry);
        due.then_some(value_id)
    }
}
