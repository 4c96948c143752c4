//! Job-defined watchdogs: timers gated by console lines.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::pattern::Pattern;
use crate::timeout::Timeouts;

/// What a watchdog did in response to a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchdogEvent {
    Start,
    Reset,
    Stop,
}

impl fmt::Display for WatchdogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WatchdogEvent::Start => "start",
            WatchdogEvent::Reset => "reset",
            WatchdogEvent::Stop => "stop",
        })
    }
}

/// A watchdog event, namespaced by the watchdog that fired it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogMatch {
    pub name: String,
    pub event: WatchdogEvent,
}

impl fmt::Display for WatchdogMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.event)
    }
}

/// Drives one watchdog timer from console lines.
///
/// The timer itself lives in [`Timeouts`]; the watchdog only remembers the
/// name of the timeout it is bound to. Until [`set_timeout`](Self::set_timeout)
/// is called every line is ignored.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Watchdog {
    start: Pattern,
    reset: Pattern,
    stop: Pattern,
    #[serde(skip)]
    timeout: Option<String>,
}

impl Watchdog {
    pub fn new(start: Pattern, reset: Pattern, stop: Pattern) -> Self {
        Self {
            start,
            reset,
            stop,
            timeout: None,
        }
    }

    /// Binds the watchdog to the named timeout in [`Timeouts`].
    pub fn set_timeout(&mut self, timeout_name: impl Into<String>) {
        self.timeout = Some(timeout_name.into());
    }

    pub fn bound_timeout(&self) -> Option<&str> {
        self.timeout.as_deref()
    }

    /// Applies a console line to the bound timer.
    ///
    /// `start` only fires while the timer is stopped; `reset` and `stop` only
    /// while it is running.
    pub fn process_line(&mut self, line: &[u8], timeouts: &mut Timeouts) -> Vec<WatchdogEvent> {
        let mut events = Vec::new();

        let Some(name) = self.timeout.as_deref() else {
            return events;
        };
        let Some(timer) = timeouts.watchdog_mut(name) else {
            return events;
        };

        if !timer.is_started() {
            if self.start.is_match(line) {
                timer.start();
                events.push(WatchdogEvent::Start);
            }
            return events;
        }

        if self.reset.is_match(line) {
            timer.reset(None);
            events.push(WatchdogEvent::Reset);
        }
        if self.stop.is_match(line) {
            timer.stop();
            events.push(WatchdogEvent::Stop);
        }

        events
    }
}
