//! Job descriptions.
//!
//! A job is a YAML document describing one test run: which machine may run
//! it, how long each phase may take, how to read the console, and what to
//! boot.
//!
//! # Document Format
//!
//! ```yaml
//! version: 1
//! deadline: "2026-10-18T12:00:00Z"
//! target:
//!   id: "52:54:00:11:22:01"
//!   tags: ["amdgpu:gfx1030"]
//! timeouts:
//!   overall: { hours: 2 }
//!   boot_cycle: { minutes: 20, retries: 2 }
//! console_patterns:
//!   session_end: { regex: "^Power down$" }
//!   job_success: { regex: "RESULT: pass" }
//! deployment:
//!   start:
//!     kernel:
//!       url: "http://boot/vmlinuz"
//!       cmdline: ["console=ttyS0", "SALAD.machine_id={{ machine_id }}"]
//!     initramfs:
//!       url: "http://boot/initramfs.img"
//!   continue:
//!     kernel:
//!       cmdline: "console=ttyS0 resume=1"
//! ```
//!
//! Documents are minijinja templates (see [`template`]); they are rendered
//! for the machine that will run them and only then parsed, so a parsed
//! [`Job`] never contains template syntax.

pub mod schema;
pub mod template;

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::console::ConsoleState;
use crate::timeout::{TimeoutError, Timeouts};

pub use schema::TargetSpec as Target;
pub use template::{BucketContext, JobContext};

use schema::{DeploymentEntry, JobDocument};

/// Result type for job parsing.
pub type JobResult<T> = Result<T, JobError>;

/// A job document was rejected.
///
/// These are configuration errors: they are reported to the submitter and
/// never reach an executor.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to render job template: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Invalid job document: {0}")]
    Document(#[from] serde_yaml::Error),

    #[error("Unsupported job version {0} (expected 1)")]
    UnsupportedVersion(u32),

    #[error("Invalid deadline '{0}': expected an ISO-8601 date")]
    InvalidDeadline(String),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("Console watchdog '{0}' has no timeout in timeouts.watchdogs")]
    MissingWatchdogTimeout(String),

    #[error("Invalid deployment: {0}")]
    Deployment(String),
}

pub const JOB_VERSION: u32 = 1;

/// What to boot the machine with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Deployment {
    pub kernel_url: String,
    pub initramfs_url: Option<String>,
    pub kernel_cmdline: String,
}

impl Deployment {
    fn from_entry(entry: &DeploymentEntry) -> JobResult<Self> {
        let kernel = entry.kernel.clone().unwrap_or_default();
        let kernel_url = kernel
            .url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| JobError::Deployment("deployment.start.kernel.url is required".to_string()))?;

        Ok(Self {
            kernel_url,
            initramfs_url: entry.initramfs.as_ref().and_then(|i| i.url.clone()),
            kernel_cmdline: kernel.cmdline.map(|c| c.join()).unwrap_or_default(),
        })
    }

    /// Returns a copy with every field set in `entry` replaced.
    fn with_overrides(&self, entry: &DeploymentEntry) -> Self {
        let mut deployment = self.clone();
        if let Some(kernel) = &entry.kernel {
            if let Some(url) = &kernel.url {
                deployment.kernel_url = url.clone();
            }
            if let Some(cmdline) = &kernel.cmdline {
                deployment.kernel_cmdline = cmdline.join();
            }
        }
        if let Some(url) = entry.initramfs.as_ref().and_then(|i| i.url.as_ref()) {
            deployment.initramfs_url = Some(url.clone());
        }
        deployment
    }
}

/// A parsed and validated job.
#[derive(Debug, Clone)]
pub struct Job {
    pub version: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub target: Target,
    pub timeouts: Timeouts,
    pub console_patterns: ConsoleState,
    pub deployment_start: Deployment,
    pub deployment_continue: Deployment,
}

impl Job {
    /// Parses an already rendered job document.
    pub fn parse(document: &str) -> JobResult<Self> {
        let doc: JobDocument = serde_yaml::from_str(document)?;

        if doc.version != JOB_VERSION {
            return Err(JobError::UnsupportedVersion(doc.version));
        }

        let deadline = doc.deadline.as_deref().map(parse_deadline).transpose()?;
        let timeouts = Timeouts::from_config(&doc.timeouts)?;

        let mut console_patterns = doc.console_patterns;
        for name in console_patterns.watchdog_names() {
            if timeouts.watchdog(name).is_none() {
                return Err(JobError::MissingWatchdogTimeout(name.to_string()));
            }
        }
        console_patterns.bind_watchdogs();

        let deployment_start = Deployment::from_entry(&doc.deployment.start)?;
        let deployment_continue = match &doc.deployment.continue_ {
            Some(overrides) => deployment_start.with_overrides(overrides),
            None => deployment_start.clone(),
        };

        Ok(Self {
            version: doc.version,
            deadline,
            target: doc.target,
            timeouts,
            console_patterns,
            deployment_start,
            deployment_continue,
        })
    }

    /// Renders a job template for a machine, then parses it.
    pub fn render(template: &str, context: &JobContext) -> JobResult<Self> {
        let document = template::render(template, context)?;
        Self::parse(&document)
    }

    /// Reads the target of a job template without a machine to render for.
    pub fn peek_target(template: &str) -> JobResult<Target> {
        #[derive(Deserialize)]
        struct TargetOnly {
            #[serde(default)]
            target: Target,
        }

        let document = template::render_lenient(template)?;
        let doc: TargetOnly = serde_yaml::from_str(&document)?;
        Ok(doc.target)
    }

    /// The deployment of the first boot cycle, or of the following ones.
    pub fn deployment(&self, first_cycle: bool) -> &Deployment {
        if first_cycle {
            &self.deployment_start
        } else {
            &self.deployment_continue
        }
    }

    /// Time left before the deadline, saturating at zero.
    pub fn time_to_deadline(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }
}

fn parse_deadline(value: &str) -> JobResult<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Ok(date.with_timezone(&Utc));
    }

    // Dates without an offset are taken as UTC.
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| JobError::InvalidDeadline(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ConsolePattern;
    use crate::timeout::TimeoutKind;

    const MINIMAL: &str = r#"
version: 1
console_patterns:
  session_end:
    regex: "^done$"
deployment:
  start:
    kernel:
      url: "http://boot/vmlinuz"
      cmdline: "console=ttyS0"
"#;

    #[test]
    fn test_minimal_job() {
        let job = Job::parse(MINIMAL).unwrap();
        assert_eq!(job.version, 1);
        assert!(job.deadline.is_none());
        assert_eq!(job.target, Target::default());
        assert_eq!(job.deployment_start.kernel_url, "http://boot/vmlinuz");
        assert_eq!(job.deployment_start.initramfs_url, None);
        assert_eq!(job.deployment_continue, job.deployment_start);
        assert!(job.timeouts.get(TimeoutKind::Overall).is_infinite());
        assert!(
            job.console_patterns
                .pattern(ConsolePattern::SessionEnd)
                .is_some()
        );
    }

    #[test]
    fn test_continue_overrides_start() {
        let job = Job::parse(
            r#"
version: 1
console_patterns:
  session_end: { regex: "end" }
deployment:
  start:
    kernel:
      url: "http://boot/vmlinuz"
      cmdline: ["console=ttyS0", "quiet"]
    initramfs:
      url: "http://boot/initrd"
  continue:
    kernel:
      cmdline: "console=ttyS0 resume"
"#,
        )
        .unwrap();

        assert_eq!(job.deployment_start.kernel_cmdline, "console=ttyS0 quiet");
        assert_eq!(job.deployment_continue.kernel_cmdline, "console=ttyS0 resume");
        assert_eq!(job.deployment_continue.kernel_url, "http://boot/vmlinuz");
        assert_eq!(
            job.deployment_continue.initramfs_url.as_deref(),
            Some("http://boot/initrd")
        );
        assert_eq!(job.deployment(true), &job.deployment_start);
        assert_eq!(job.deployment(false), &job.deployment_continue);
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let doc = MINIMAL.replace("version: 1", "version: 2");
        assert!(matches!(
            Job::parse(&doc),
            Err(JobError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_missing_session_end_is_rejected() {
        let doc = MINIMAL.replace("session_end", "job_success");
        assert!(matches!(Job::parse(&doc), Err(JobError::Document(_))));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let doc = MINIMAL.replace("^done$", "(");
        assert!(Job::parse(&doc).is_err());
    }

    #[test]
    fn test_missing_kernel_is_rejected() {
        let doc = MINIMAL.replace("url: \"http://boot/vmlinuz\"", "url: \"\"");
        assert!(matches!(Job::parse(&doc), Err(JobError::Deployment(_))));
    }

    #[test]
    fn test_retried_overall_is_rejected() {
        let doc = format!("{}timeouts:\n  overall: {{ minutes: 5, retries: 1 }}\n", MINIMAL);
        assert!(matches!(
            Job::parse(&doc),
            Err(JobError::Timeout(TimeoutError::NotRetryable { .. }))
        ));
    }

    #[test]
    fn test_watchdog_needs_a_timeout() {
        let doc = MINIMAL.replace(
            "console_patterns:\n",
            "console_patterns:\n  watchdogs:\n    wd:\n      start: { regex: a }\n      reset: { regex: b }\n      stop: { regex: c }\n",
        );
        assert!(matches!(
            Job::parse(&doc),
            Err(JobError::MissingWatchdogTimeout(name)) if name == "wd"
        ));

        let with_timeout = format!("{}timeouts:\n  watchdogs:\n    wd: {{ seconds: 30 }}\n", doc);
        let job = Job::parse(&with_timeout).unwrap();
        assert!(job.timeouts.watchdog("wd").is_some());
    }

    #[test]
    fn test_deadline_formats() {
        let doc = format!("{}deadline: \"2026-10-18T12:00:00Z\"\n", MINIMAL);
        let job = Job::parse(&doc).unwrap();
        let now = DateTime::parse_from_rfc3339("2026-10-18T11:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(job.time_to_deadline(now), Some(Duration::from_secs(3600)));

        let naive = format!("{}deadline: \"2026-10-18T12:00:00\"\n", MINIMAL);
        assert!(Job::parse(&naive).unwrap().deadline.is_some());

        let bogus = format!("{}deadline: \"tomorrow\"\n", MINIMAL);
        assert!(matches!(
            Job::parse(&bogus),
            Err(JobError::InvalidDeadline(_))
        ));
    }

    #[test]
    fn test_past_deadline_saturates() {
        let doc = format!("{}deadline: \"2020-01-01T00:00:00Z\"\n", MINIMAL);
        let job = Job::parse(&doc).unwrap();
        assert_eq!(job.time_to_deadline(Utc::now()), Some(Duration::ZERO));
    }

    #[test]
    fn test_render_and_peek_target() {
        let template = r#"
version: 1
target:
  id: "m1"
  tags: ["gpu"]
console_patterns:
  session_end: { regex: "end" }
deployment:
  start:
    kernel:
      url: "http://boot/vmlinuz"
      cmdline: "SALAD.machine_id={{ machine_id }}"
"#;
        let target = Job::peek_target(template).unwrap();
        assert_eq!(target.id.as_deref(), Some("m1"));
        assert_eq!(target.tags, vec!["gpu"]);

        let context = JobContext {
            machine_id: "m1".to_string(),
            ..Default::default()
        };
        let job = Job::render(template, &context).unwrap();
        assert_eq!(job.deployment_start.kernel_cmdline, "SALAD.machine_id=m1");
    }
}
