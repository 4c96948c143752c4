//! Console pattern matching.
//!
//! A job describes what its console output means through a handful of
//! regular expressions. [`ConsoleState`] applies them to every line the
//! machine prints and accumulates which of them matched. The job status is a
//! pure function of that accumulated set.
//!
//! # Job Document Format
//!
//! ```yaml
//! console_patterns:
//!   session_end:
//!     regex: "^\\[[\\d \\.]{12}\\] reboot: Power Down$"
//!   session_reboot:
//!     regex: "GPU hang"
//!   job_success:
//!     regex: "Execution is over, pass"
//!   job_warn:
//!     regex: "some tests are flaky"
//!   machine_unfit_for_service:
//!     regex: "Hardware Error"
//!   watchdogs:
//!     piglit:
//!       start: { regex: "piglit: start" }
//!       reset: { regex: "piglit: progress" }
//!       stop:  { regex: "piglit: done" }
//! ```
//!
//! # Status Resolution
//!
//! | `session_end` | `job_success` configured | `job_success` | `job_warn` | Status |
//! |---------------|--------------------------|---------------|------------|--------|
//! | no            | any                      | any           | any        | INCOMPLETE |
//! | yes           | no                       | -             | any        | COMPLETE |
//! | yes           | yes                      | no            | any        | FAIL |
//! | yes           | yes                      | yes           | no         | PASS |
//! | yes           | yes                      | yes           | yes        | WARN |

pub mod lines;
pub mod pattern;
pub mod watchdog;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::status::JobStatus;
use crate::timeout::Timeouts;

pub use lines::{LineSplitter, trim_line_ending};
pub use pattern::{Pattern, PatternError, PatternResult};
pub use watchdog::{Watchdog, WatchdogEvent, WatchdogMatch};

/// The classifiers a job can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsolePattern {
    SessionEnd = 0,
    SessionReboot = 1,
    JobSuccess = 2,
    JobWarn = 3,
    MachineUnfitForService = 4,
}

impl ConsolePattern {
    pub const ALL: [ConsolePattern; 5] = [
        ConsolePattern::SessionEnd,
        ConsolePattern::SessionReboot,
        ConsolePattern::JobSuccess,
        ConsolePattern::JobWarn,
        ConsolePattern::MachineUnfitForService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolePattern::SessionEnd => "session_end",
            ConsolePattern::SessionReboot => "session_reboot",
            ConsolePattern::JobSuccess => "job_success",
            ConsolePattern::JobWarn => "job_warn",
            ConsolePattern::MachineUnfitForService => "machine_unfit_for_service",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for ConsolePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of [`ConsolePattern`]s, stored as a bitset.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MatchSet(u8);

impl MatchSet {
    pub const EMPTY: MatchSet = MatchSet(0);

    pub fn insert(&mut self, pattern: ConsolePattern) {
        self.0 |= pattern.bit();
    }

    pub fn remove(&mut self, pattern: ConsolePattern) {
        self.0 &= !pattern.bit();
    }

    pub fn contains(&self, pattern: ConsolePattern) -> bool {
        self.0 & pattern.bit() != 0
    }

    pub fn union(self, other: MatchSet) -> MatchSet {
        MatchSet(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ConsolePattern> + '_ {
        ConsolePattern::ALL
            .into_iter()
            .filter(|pattern| self.contains(*pattern))
    }
}

impl fmt::Debug for MatchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|p| p.as_str())).finish()
    }
}

impl FromIterator<ConsolePattern> for MatchSet {
    fn from_iter<I: IntoIterator<Item = ConsolePattern>>(iter: I) -> Self {
        let mut set = MatchSet::EMPTY;
        for pattern in iter {
            set.insert(pattern);
        }
        set
    }
}

/// Everything a single line matched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineMatches {
    pub patterns: MatchSet,
    pub watchdogs: Vec<WatchdogMatch>,
}

impl LineMatches {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.watchdogs.is_empty()
    }
}

/// The `console_patterns` of a job and what they matched so far.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConsoleState {
    session_end: Pattern,
    #[serde(default)]
    session_reboot: Option<Pattern>,
    #[serde(default)]
    job_success: Option<Pattern>,
    #[serde(default)]
    job_warn: Option<Pattern>,
    #[serde(default)]
    machine_unfit_for_service: Option<Pattern>,
    #[serde(default)]
    watchdogs: BTreeMap<String, Watchdog>,
    #[serde(skip)]
    matched: MatchSet,
}

impl ConsoleState {
    pub fn new(session_end: Pattern) -> Self {
        Self {
            session_end,
            session_reboot: None,
            job_success: None,
            job_warn: None,
            machine_unfit_for_service: None,
            watchdogs: BTreeMap::new(),
            matched: MatchSet::EMPTY,
        }
    }

    pub fn with_session_reboot(mut self, pattern: Pattern) -> Self {
        self.session_reboot = Some(pattern);
        self
    }

    pub fn with_job_success(mut self, pattern: Pattern) -> Self {
        self.job_success = Some(pattern);
        self
    }

    pub fn with_job_warn(mut self, pattern: Pattern) -> Self {
        self.job_warn = Some(pattern);
        self
    }

    pub fn with_machine_unfit_for_service(mut self, pattern: Pattern) -> Self {
        self.machine_unfit_for_service = Some(pattern);
        self
    }

    pub fn with_watchdog(mut self, name: impl Into<String>, watchdog: Watchdog) -> Self {
        self.watchdogs.insert(name.into(), watchdog);
        self
    }

    pub fn pattern(&self, kind: ConsolePattern) -> Option<&Pattern> {
        match kind {
            ConsolePattern::SessionEnd => Some(&self.session_end),
            ConsolePattern::SessionReboot => self.session_reboot.as_ref(),
            ConsolePattern::JobSuccess => self.job_success.as_ref(),
            ConsolePattern::JobWarn => self.job_warn.as_ref(),
            ConsolePattern::MachineUnfitForService => self.machine_unfit_for_service.as_ref(),
        }
    }

    pub fn watchdog_names(&self) -> impl Iterator<Item = &str> {
        self.watchdogs.keys().map(String::as_str)
    }

    /// Binds every watchdog to the timeout of the same name.
    pub fn bind_watchdogs(&mut self) {
        for (name, watchdog) in &mut self.watchdogs {
            watchdog.set_timeout(name.clone());
        }
    }

    /// Classifies one console line and records what matched.
    pub fn process_line(&mut self, line: &[u8], timeouts: &mut Timeouts) -> LineMatches {
        let line = trim_line_ending(line);
        let mut matches = LineMatches::default();

        for kind in ConsolePattern::ALL {
            if let Some(pattern) = self.pattern(kind)
                && pattern.is_match(line)
            {
                matches.patterns.insert(kind);
            }
        }

        for (name, watchdog) in &mut self.watchdogs {
            for event in watchdog.process_line(line, timeouts) {
                matches.watchdogs.push(WatchdogMatch {
                    name: name.clone(),
                    event,
                });
            }
        }

        self.matched = self.matched.union(matches.patterns);
        matches
    }

    /// Forgets per-boot-cycle matches. Only `session_reboot` is per boot.
    pub fn reset_per_boot_state(&mut self) {
        self.matched.remove(ConsolePattern::SessionReboot);
    }

    pub fn matched(&self) -> MatchSet {
        self.matched
    }

    pub fn session_has_ended(&self) -> bool {
        self.matched.contains(ConsolePattern::SessionEnd)
    }

    pub fn needs_reboot(&self) -> bool {
        self.matched.contains(ConsolePattern::SessionReboot)
    }

    pub fn machine_is_unfit_for_service(&self) -> bool {
        self.matched.contains(ConsolePattern::MachineUnfitForService)
    }

    pub fn job_status(&self) -> JobStatus {
        if !self.session_has_ended() {
            return JobStatus::Incomplete;
        }

        if self.job_success.is_none() {
            return JobStatus::Complete;
        }

        if !self.matched.contains(ConsolePattern::JobSuccess) {
            JobStatus::Fail
        } else if self.matched.contains(ConsolePattern::JobWarn) {
            JobStatus::Warn
        } else {
            JobStatus::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut ConsoleState, lines: &[&str]) {
        let mut timeouts = Timeouts::default();
        for line in lines {
            state.process_line(line.as_bytes(), &mut timeouts);
        }
    }

    fn basic() -> ConsoleState {
        ConsoleState::new(Pattern::new("end").unwrap())
    }

    fn with_classifiers() -> ConsoleState {
        basic()
            .with_job_success(Pattern::new("ok").unwrap())
            .with_job_warn(Pattern::new("warn").unwrap())
    }

    #[test]
    fn test_complete_without_success_classifier() {
        let mut state = basic();
        feed(&mut state, &["noise\n", "end\n"]);
        assert!(state.session_has_ended());
        assert_eq!(state.job_status(), JobStatus::Complete);
    }

    #[test]
    fn test_incomplete_without_session_end() {
        let mut state = basic();
        feed(&mut state, &["noise\n"]);
        assert!(!state.session_has_ended());
        assert_eq!(state.job_status(), JobStatus::Incomplete);
    }

    #[test]
    fn test_fail_when_success_not_seen() {
        let mut state = with_classifiers();
        feed(&mut state, &["end\n"]);
        assert_eq!(state.job_status(), JobStatus::Fail);
    }

    #[test]
    fn test_pass_when_success_seen() {
        let mut state = with_classifiers();
        feed(&mut state, &["ok\n", "end\n"]);
        assert_eq!(state.job_status(), JobStatus::Pass);
    }

    #[test]
    fn test_warn_when_success_and_warn_seen() {
        let mut state = with_classifiers();
        feed(&mut state, &["ok\n", "warn\n", "end\n"]);
        assert_eq!(state.job_status(), JobStatus::Warn);
    }

    #[test]
    fn test_success_without_session_end_is_incomplete() {
        let mut state = with_classifiers();
        feed(&mut state, &["ok\n"]);
        assert_eq!(state.job_status(), JobStatus::Incomplete);
    }

    #[test]
    fn test_reset_per_boot_state_only_clears_reboot() {
        let mut state = with_classifiers().with_session_reboot(Pattern::new("reboot").unwrap());
        feed(&mut state, &["reboot\n", "ok\n"]);
        assert!(state.needs_reboot());

        state.reset_per_boot_state();
        assert!(!state.needs_reboot());
        assert!(state.matched().contains(ConsolePattern::JobSuccess));

        feed(&mut state, &["end\n"]);
        assert_eq!(state.job_status(), JobStatus::Pass);
    }

    #[test]
    fn test_unfit_for_service() {
        let mut state =
            basic().with_machine_unfit_for_service(Pattern::new("Hardware Error").unwrap());
        feed(&mut state, &["[ 3.0] mce: Hardware Error\r\n"]);
        assert!(state.machine_is_unfit_for_service());
        assert!(!state.session_has_ended());
    }

    #[test]
    fn test_anchored_patterns_ignore_line_endings() {
        let mut state = ConsoleState::new(Pattern::new("^end$").unwrap());
        feed(&mut state, &["end\r\n"]);
        assert!(state.session_has_ended());
    }

    #[test]
    fn test_line_matches_report_watchdog_events() {
        let watchdog = Watchdog::new(
            Pattern::new("wd start").unwrap(),
            Pattern::new("wd tick").unwrap(),
            Pattern::new("wd stop").unwrap(),
        );
        let mut state = basic().with_watchdog("piglit", watchdog);
        let mut timeouts = Timeouts::default();
        timeouts.add_watchdog(crate::timeout::Timeout::new(
            "piglit",
            std::time::Duration::from_secs(5),
            0,
        ));

        // Not bound yet
        assert!(state.process_line(b"wd start\n", &mut timeouts).is_empty());

        state.bind_watchdogs();
        let matches = state.process_line(b"wd start\n", &mut timeouts);
        assert_eq!(
            matches.watchdogs,
            vec![WatchdogMatch {
                name: "piglit".to_string(),
                event: WatchdogEvent::Start
            }]
        );
        assert_eq!(matches.watchdogs[0].to_string(), "piglit.start");
        assert!(timeouts.watchdog("piglit").unwrap().is_started());
    }

    #[test]
    fn test_match_set_operations() {
        let mut set: MatchSet = [ConsolePattern::SessionEnd, ConsolePattern::JobWarn]
            .into_iter()
            .collect();
        assert!(set.contains(ConsolePattern::JobWarn));
        set.remove(ConsolePattern::JobWarn);
        assert!(!set.contains(ConsolePattern::JobWarn));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![ConsolePattern::SessionEnd]);
        assert!(MatchSet::EMPTY.is_empty());
    }

    #[test]
    fn test_deserialize_console_patterns() {
        let yaml = r#"
session_end:
  regex: "reboot: Power Down"
job_success:
  regex: "pass"
watchdogs:
  piglit:
    start: { regex: "start" }
    reset: { regex: "tick" }
    stop: { regex: "stop" }
"#;
        let state: ConsoleState = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            state.pattern(ConsolePattern::SessionEnd).unwrap().as_str(),
            "reboot: Power Down"
        );
        assert!(state.pattern(ConsolePattern::JobWarn).is_none());
        assert_eq!(state.watchdog_names().collect::<Vec<_>>(), vec!["piglit"]);
        assert!(state.matched().is_empty());
    }

    #[test]
    fn test_session_end_is_required() {
        let yaml = "job_success:\n  regex: pass\n";
        assert!(serde_yaml::from_str::<ConsoleState>(yaml).is_err());
    }
}
