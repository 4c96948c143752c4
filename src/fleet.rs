//! The fleet: every machine this executor drives.
//!
//! [`Fleet`] is the registry of [`Machine`]s keyed by id. It also decides
//! where a submitted job runs:
//!
//! | Outcome | Code |
//! |---------|------|
//! | Job queued on a machine | 200 |
//! | Malformed request or job document | 400 |
//! | Storage credentials rejected | 403 |
//! | Target id unknown | 404 |
//! | No machine matches the target | 406 |
//! | Matching machines are all busy | 409 |

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bucket::JobBucket;
use crate::config::StorageConfig;
use crate::job::{Job, JobContext, Target};
use crate::machine::{
    ExecutorContext, Machine, MachineError, MachineInfo, MachineState, QueuedJob,
};
use crate::protocol::ProtocolVersion;

/// Result type for job submission.
pub type SubmitResult<T> = Result<T, SubmitError>;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Storage access denied: {0}")]
    Forbidden(String),

    #[error("Unknown machine: {0}")]
    UnknownMachine(String),

    #[error("No machine matches the target: {0}")]
    NoCandidate(String),

    #[error("All matching machines are busy")]
    Busy,

    #[error("Failed to create the job bucket: {0}")]
    Bucket(#[from] std::io::Error),
}

impl SubmitError {
    /// The HTTP-style status code reported to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            SubmitError::BadRequest(_) => 400,
            SubmitError::Forbidden(_) => 403,
            SubmitError::UnknownMachine(_) => 404,
            SubmitError::NoCandidate(_) => 406,
            SubmitError::Busy => 409,
            SubmitError::Bucket(_) => 500,
        }
    }
}

/// Where the submitting client listens.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Callback {
    pub host: String,
    pub port: u16,
}

impl Callback {
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageCredentials {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Everything about a submission except the job document.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JobMetadata {
    /// Wire protocol version the client speaks.
    #[serde(default)]
    pub version: u32,
    pub job_id: Option<String>,
    pub callback: Callback,
    /// Replaces the target of the job document.
    pub target: Option<Target>,
    pub storage: Option<StorageCredentials>,
}

/// A job submission.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Submission {
    pub metadata: JobMetadata,
    /// The job document, still a template.
    pub job: String,
}

/// Where a submitted job was queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub machine_id: String,
    pub job_id: String,
}

pub struct Fleet {
    context: ExecutorContext,
    storage: StorageConfig,
    machines: RwLock<BTreeMap<String, Arc<Machine>>>,
}

impl Fleet {
    pub fn new(context: ExecutorContext, storage: StorageConfig) -> Self {
        Self {
            context,
            storage,
            machines: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &ExecutorContext {
        &self.context
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<Machine>>> {
        self.machines.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<Machine>>> {
        self.machines.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the machine `id`, creating it if needed.
    pub fn add_machine(&self, id: &str, tags: Vec<String>) -> Arc<Machine> {
        let mut machines = self.write();
        if let Some(existing) = machines.get(id) {
            return existing.clone();
        }

        info!("Adding machine {}", id);
        let machine = Arc::new(Machine::spawn(id, tags, self.context.clone()));
        machines.insert(id.to_string(), machine.clone());
        machine
    }

    pub fn get(&self, id: &str) -> Option<Arc<Machine>> {
        self.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Removes a machine and waits for its executor to stop.
    pub async fn remove(&self, id: &str) -> bool {
        let machine = self.write().remove(id);
        match machine {
            Some(machine) => {
                info!("Removing machine {}", id);
                machine.retire().await;
                true
            }
            None => false,
        }
    }

    /// Retires every machine.
    pub async fn shutdown(&self) {
        let machines: Vec<_> = std::mem::take(&mut *self.write()).into_values().collect();
        for machine in machines {
            machine.retire().await;
        }
    }

    pub fn snapshot(&self) -> Vec<MachineInfo> {
        self.read().values().map(|m| m.info()).collect()
    }

    /// Picks a machine for a job and queues it there.
    pub fn submit(&self, submission: Submission) -> SubmitResult<Accepted> {
        let Submission { metadata, job } = submission;

        let protocol = ProtocolVersion::try_from(metadata.version)
            .map_err(|e| SubmitError::BadRequest(e.to_string()))?;
        self.check_storage(metadata.storage.as_ref())?;

        let target = match &metadata.target {
            Some(target) => target.clone(),
            None => Job::peek_target(&job).map_err(|e| SubmitError::BadRequest(e.to_string()))?,
        };
        let candidates = self.candidates(&target)?;

        let job_id = match &metadata.job_id {
            Some(id) => {
                validate_job_id(id)?;
                id.clone()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        for machine in candidates {
            if machine.state() != MachineState::Idle {
                continue;
            }

            let bucket = self.create_bucket(&job_id)?;
            let context = JobContext {
                machine_id: machine.id().to_string(),
                machine_tags: machine.tags().into_iter().collect(),
                local_tty_device: machine.local_tty_device().unwrap_or_default(),
                job_bucket: bucket.as_ref().map(JobBucket::context),
            };

            let parsed = match Job::render(&job, &context) {
                Ok(parsed) => parsed,
                Err(e) => {
                    discard_bucket(bucket.as_ref());
                    return Err(SubmitError::BadRequest(e.to_string()));
                }
            };

            let queued = QueuedJob {
                job_id: job_id.clone(),
                job: parsed,
                callback: metadata.callback.address(),
                protocol,
                bucket: bucket.clone(),
            };

            match machine.start_job(queued) {
                Ok(()) => {
                    info!(machine = %machine.id(), job = %job_id, "Job accepted");
                    return Ok(Accepted {
                        machine_id: machine.id().to_string(),
                        job_id,
                    });
                }
                Err(MachineError::NotIdle { .. } | MachineError::Retired(_)) => {
                    debug!("{} got busy, trying the next machine", machine.id());
                    discard_bucket(bucket.as_ref());
                }
            }
        }

        Err(SubmitError::Busy)
    }

    /// Machines able to run a job for `target`, busy or not.
    fn candidates(&self, target: &Target) -> SubmitResult<Vec<Arc<Machine>>> {
        if let Some(id) = &target.id {
            let machine = self
                .get(id)
                .ok_or_else(|| SubmitError::UnknownMachine(id.clone()))?;
            if !machine.has_tags(&target.tags) {
                return Err(SubmitError::NoCandidate(format!(
                    "{} lacks tags {:?}",
                    id, target.tags
                )));
            }
            if !machine.ready_for_service() {
                return Err(SubmitError::NoCandidate(format!("{} is out of service", id)));
            }
            return Ok(vec![machine]);
        }

        let candidates: Vec<_> = self
            .read()
            .values()
            .filter(|m| m.ready_for_service() && m.has_tags(&target.tags))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(SubmitError::NoCandidate(format!("tags {:?}", target.tags)));
        }
        Ok(candidates)
    }

    fn check_storage(&self, credentials: Option<&StorageCredentials>) -> SubmitResult<()> {
        if let Some(expected) = &self.storage.access_key {
            let Some(credentials) = credentials else {
                return Err(SubmitError::Forbidden("credentials required".to_string()));
            };
            if &credentials.access_key != expected
                || Some(&credentials.secret_key) != self.storage.secret_key.as_ref()
            {
                return Err(SubmitError::Forbidden("invalid credentials".to_string()));
            }
        }

        if let Some(credentials) = credentials
            && let Some(group) = credentials
                .groups
                .iter()
                .find(|group| !self.storage.groups.contains(group))
        {
            return Err(SubmitError::Forbidden(format!("unknown group {}", group)));
        }

        Ok(())
    }

    fn create_bucket(&self, job_id: &str) -> SubmitResult<Option<JobBucket>> {
        let Some(root) = &self.storage.root else {
            return Ok(None);
        };
        let bucket = JobBucket::create(
            root,
            job_id,
            self.storage.access_key.as_deref().unwrap_or_default(),
            self.storage.secret_key.as_deref().unwrap_or_default(),
        )?;
        Ok(Some(bucket))
    }
}

/// Longest job id accepted from a client.
const MAX_JOB_ID_LENGTH: usize = 128;

/// Job ids name bucket and log directories, so they must be a single plain
/// path component.
fn validate_job_id(id: &str) -> SubmitResult<()> {
    let plain = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if id.is_empty() || id.len() > MAX_JOB_ID_LENGTH || !plain || id == "." || id == ".." {
        return Err(SubmitError::BadRequest(format!("invalid job id {:?}", id)));
    }
    Ok(())
}

fn discard_bucket(bucket: Option<&JobBucket>) {
    if let Some(bucket) = bucket
        && let Err(e) = std::fs::remove_dir_all(&bucket.path)
    {
        warn!("Failed to remove bucket {}: {}", bucket.path.display(), e);
    }
}
