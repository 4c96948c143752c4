//! Serde model of a job document, before validation.

use serde::{Deserialize, Serialize};

use crate::console::ConsoleState;
use crate::timeout::TimeoutsConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDocument {
    pub version: u32,

    #[serde(default)]
    pub deadline: Option<String>,

    #[serde(default)]
    pub target: TargetSpec,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    pub console_patterns: ConsoleState,

    pub deployment: DeploymentSpec,
}

/// Which machine(s) may run the job.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentSpec {
    pub start: DeploymentEntry,

    #[serde(rename = "continue", default)]
    pub continue_: Option<DeploymentEntry>,
}

/// A deployment with every field optional, so `continue` can override
/// selectively.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentEntry {
    #[serde(default)]
    pub kernel: Option<KernelEntry>,

    #[serde(default)]
    pub initramfs: Option<InitramfsEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelEntry {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub cmdline: Option<Cmdline>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitramfsEntry {
    #[serde(default)]
    pub url: Option<String>,
}

/// A kernel command line, given either as one string or as a list of
/// arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Cmdline {
    Line(String),
    Args(Vec<String>),
}

impl Cmdline {
    pub fn join(&self) -> String {
        match self {
            Cmdline::Line(line) => line.trim().to_string(),
            Cmdline::Args(args) => args.join(" "),
        }
    }
}
