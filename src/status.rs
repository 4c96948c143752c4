//! Terminal job status.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The final status of a job, as reported to the submitting client.
///
/// The discriminant doubles as the client's process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pass = 0,
    Warn = 1,
    Complete = 2,
    Fail = 3,
    Incomplete = 4,
    Unknown = 5,
    SetupFail = 6,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pass => "PASS",
            JobStatus::Warn => "WARN",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Fail => "FAIL",
            JobStatus::Incomplete => "INCOMPLETE",
            JobStatus::Unknown => "UNKNOWN",
            JobStatus::SetupFail => "SETUP_FAIL",
        }
    }

    pub fn exit_code(&self) -> i32 {
        *self as i32
    }

    /// Whether the job ran to completion without failing.
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Pass | JobStatus::Warn | JobStatus::Complete)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(JobStatus::Pass),
            "WARN" => Ok(JobStatus::Warn),
            "COMPLETE" => Ok(JobStatus::Complete),
            "FAIL" => Ok(JobStatus::Fail),
            "INCOMPLETE" => Ok(JobStatus::Incomplete),
            "UNKNOWN" => Ok(JobStatus::Unknown),
            "SETUP_FAIL" => Ok(JobStatus::SetupFail),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}
