//! Machines and their executors.
//!
//! A [`Machine`] is the handle the fleet keeps for one test machine. It owns
//! exactly one executor task for its whole lifetime; the task receives PDU
//! port assignments and jobs over a channel and runs one job at a time.
//!
//! ```text
//!   WAIT_FOR_CONFIG ──(port assigned)──► IDLE ──(start_job)──► QUEUED
//!                                         ▲                      │
//!                                         │                      ▼
//!                                         └──(job over)───── RUNNING
//! ```
//!
//! Retiring a machine signals its executor and joins it.

pub mod executor;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::boot::BootService;
use crate::bucket::JobBucket;
use crate::config::ExecutorConfig;
use crate::job::Job;
use crate::pdu::PduPort;
use crate::protocol::ProtocolVersion;
use crate::salad::SessionRegistry;
use crate::status::JobStatus;

pub use executor::ExecutorFault;

/// Result type for machine operations.
pub type MachineResult<T> = Result<T, MachineError>;

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("Machine {id} is {state}, not IDLE")]
    NotIdle { id: String, state: MachineState },

    #[error("Machine {0} is retired")]
    Retired(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    WaitForConfig,
    Idle,
    Queued,
    Running,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::WaitForConfig => "WAIT_FOR_CONFIG",
            MachineState::Idle => "IDLE",
            MachineState::Queued => "QUEUED",
            MachineState::Running => "RUNNING",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Everything an executor needs besides its machine.
#[derive(Clone)]
pub struct ExecutorContext {
    pub registry: Arc<SessionRegistry>,
    pub boot: Arc<dyn BootService>,
    /// Upper bound on how long the boot loop sleeps between checks.
    pub poll_interval: Duration,
    pub callback_timeout: Duration,
    /// Where console logs of jobs without a bucket are kept.
    pub log_dir: Option<PathBuf>,
}

impl ExecutorContext {
    pub fn new(registry: Arc<SessionRegistry>, boot: Arc<dyn BootService>) -> Self {
        Self::from_config(&ExecutorConfig::default(), registry, boot)
    }

    pub fn from_config(
        config: &ExecutorConfig,
        registry: Arc<SessionRegistry>,
        boot: Arc<dyn BootService>,
    ) -> Self {
        Self {
            registry,
            boot,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            callback_timeout: Duration::from_secs(config.callback_timeout_secs),
            log_dir: config.log_dir.clone(),
        }
    }
}

/// A job accepted by the fleet, waiting for its executor.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub job: Job,
    /// `host:port` the client listens on.
    pub callback: String,
    pub protocol: ProtocolVersion,
    pub bucket: Option<JobBucket>,
}

pub(crate) enum MachineCommand {
    AssignPort(PduPort),
    StartJob(Box<QueuedJob>),
}

/// State shared between the handle and the executor task.
pub(crate) struct Shared {
    pub(crate) state: watch::Sender<MachineState>,
    pub(crate) ready_for_service: AtomicBool,
    pub(crate) current_job: Mutex<Option<String>>,
    pub(crate) last_status: Mutex<Option<JobStatus>>,
    pub(crate) pdu_port: Mutex<Option<String>>,
}

impl Shared {
    pub(crate) fn set_state(&self, state: MachineState) {
        self.state.send_replace(state);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// What the fleet reports about a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: String,
    pub tags: Vec<String>,
    pub state: MachineState,
    pub ready_for_service: bool,
    pub pdu_port: Option<String>,
    pub current_job: Option<String>,
    pub last_status: Option<JobStatus>,
}

pub struct Machine {
    id: String,
    tags: Mutex<BTreeSet<String>>,
    local_tty_device: Mutex<Option<String>>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<MachineCommand>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Machine {
    /// Creates a machine and spawns its executor.
    pub fn spawn(
        id: impl Into<String>,
        tags: impl IntoIterator<Item = String>,
        context: ExecutorContext,
    ) -> Self {
        let id = id.into();
        let (state, _) = watch::channel(MachineState::WaitForConfig);
        let shared = Arc::new(Shared {
            state,
            ready_for_service: AtomicBool::new(true),
            current_job: Mutex::new(None),
            last_status: Mutex::new(None),
            pdu_port: Mutex::new(None),
        });
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let executor = executor::Executor::new(id.clone(), shared.clone(), context, rx, cancel.clone());
        let task = tokio::spawn(executor.run());
        debug!("Spawned the executor of {}", id);

        Self {
            id,
            tags: Mutex::new(tags.into_iter().collect()),
            local_tty_device: Mutex::new(None),
            shared,
            commands,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tags(&self) -> BTreeSet<String> {
        lock(&self.tags).clone()
    }

    pub fn set_tags(&self, tags: impl IntoIterator<Item = String>) {
        *lock(&self.tags) = tags.into_iter().collect();
    }

    /// Whether the machine carries every tag in `wanted`.
    pub fn has_tags(&self, wanted: &[String]) -> bool {
        let tags = lock(&self.tags);
        wanted.iter().all(|tag| tags.contains(tag))
    }

    pub fn local_tty_device(&self) -> Option<String> {
        lock(&self.local_tty_device).clone()
    }

    pub fn set_local_tty_device(&self, device: Option<String>) {
        *lock(&self.local_tty_device) = device;
    }

    pub fn state(&self) -> MachineState {
        *self.shared.state.borrow()
    }

    /// Follows state changes.
    pub fn subscribe(&self) -> watch::Receiver<MachineState> {
        self.shared.state.subscribe()
    }

    /// Cleared when a console reported the machine unfit for service.
    pub fn ready_for_service(&self) -> bool {
        self.shared.ready_for_service.load(Ordering::SeqCst)
    }

    pub fn set_ready_for_service(&self, ready: bool) {
        self.shared.ready_for_service.store(ready, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Hands the machine its power outlet. Moves WAIT_FOR_CONFIG to IDLE.
    pub fn assign_port(&self, port: PduPort) -> MachineResult<()> {
        *lock(&self.shared.pdu_port) = Some(port.to_string());
        self.commands
            .send(MachineCommand::AssignPort(port))
            .map_err(|_| MachineError::Retired(self.id.clone()))
    }

    /// Queues a job. Only an IDLE machine accepts one.
    pub fn start_job(&self, job: QueuedJob) -> MachineResult<()> {
        if self.is_retired() {
            return Err(MachineError::Retired(self.id.clone()));
        }

        let mut previous = MachineState::Idle;
        let queued = self.shared.state.send_if_modified(|state| {
            previous = *state;
            if *state == MachineState::Idle {
                *state = MachineState::Queued;
                true
            } else {
                false
            }
        });
        if !queued {
            return Err(MachineError::NotIdle {
                id: self.id.clone(),
                state: previous,
            });
        }

        *lock(&self.shared.current_job) = Some(job.job_id.clone());
        let job_id = job.job_id.clone();
        if self.commands.send(MachineCommand::StartJob(Box::new(job))).is_err() {
            warn!("{}: the executor is gone, job {} not queued", self.id, job_id);
            *lock(&self.shared.current_job) = None;
            self.shared.set_state(MachineState::Idle);
            return Err(MachineError::Retired(self.id.clone()));
        }
        info!("{}: queued job {}", self.id, job_id);
        Ok(())
    }

    pub fn info(&self) -> MachineInfo {
        MachineInfo {
            id: self.id.clone(),
            tags: self.tags().into_iter().collect(),
            state: self.state(),
            ready_for_service: self.ready_for_service(),
            pdu_port: lock(&self.shared.pdu_port).clone(),
            current_job: lock(&self.shared.current_job).clone(),
            last_status: *lock(&self.shared.last_status),
        }
    }

    /// Stops the executor and waits for it. A running job is aborted.
    pub async fn retire(&self) {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("{}: executor task failed: {}", self.id, e);
            }
            info!("{}: retired", self.id);
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::NoBootService;
    use crate::pdu::dummy::DummyPdu;

    fn context() -> ExecutorContext {
        ExecutorContext::new(Arc::new(SessionRegistry::new()), Arc::new(NoBootService))
    }

    fn queued(job_id: &str) -> QueuedJob {
        let job = Job::parse(
            r#"
version: 1
console_patterns:
  session_end:
    regex: "^Power down$"
deployment:
  start:
    kernel:
      url: "http://example.com/bzImage"
"#,
        )
        .unwrap();

        QueuedJob {
            job_id: job_id.to_string(),
            job,
            // Nothing listens there; the job fails during setup.
            callback: "127.0.0.1:1".to_string(),
            protocol: ProtocolVersion::V1,
            bucket: None,
        }
    }

    async fn wait_for(machine: &Machine, state: MachineState) {
        let mut rx = machine.subscribe();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test]
    async fn test_port_assignment_makes_machine_idle() {
        let machine = Machine::spawn("m1", vec!["x86".to_string()], context());
        assert_eq!(machine.state(), MachineState::WaitForConfig);
        assert!(matches!(
            machine.start_job(queued("j1")),
            Err(MachineError::NotIdle { state: MachineState::WaitForConfig, .. })
        ));

        let pdu = Arc::new(DummyPdu::new("pdu", 2));
        machine
            .assign_port(PduPort::new(pdu, "0", Duration::ZERO))
            .unwrap();
        wait_for(&machine, MachineState::Idle).await;
        assert_eq!(machine.info().pdu_port.as_deref(), Some("pdu/0"));

        machine.retire().await;
        assert!(machine.is_retired());
    }

    #[tokio::test]
    async fn test_only_one_job_is_queued() {
        let machine = Machine::spawn("m1", Vec::new(), context());
        let pdu = Arc::new(DummyPdu::new("pdu", 1));
        machine
            .assign_port(PduPort::new(pdu, "0", Duration::ZERO))
            .unwrap();
        wait_for(&machine, MachineState::Idle).await;

        machine.start_job(queued("j1")).unwrap();
        assert!(matches!(
            machine.start_job(queued("j2")),
            Err(MachineError::NotIdle { .. })
        ));

        // The callback is unreachable, so the job ends in setup.
        let mut rx = machine.subscribe();
        rx.wait_for(|s| *s == MachineState::Idle).await.unwrap();
        drop(rx);
        assert_eq!(machine.info().last_status, Some(JobStatus::SetupFail));
        assert_eq!(machine.info().current_job, None);

        machine.retire().await;
    }

    #[tokio::test]
    async fn test_tags() {
        let machine = Machine::spawn("m1", vec!["a".to_string(), "b".to_string()], context());
        assert!(machine.has_tags(&["a".to_string()]));
        assert!(!machine.has_tags(&["c".to_string()]));

        machine.set_tags(vec!["c".to_string()]);
        assert!(machine.has_tags(&["c".to_string()]));
        machine.retire().await;
    }

    #[tokio::test]
    async fn test_retired_machine_rejects_jobs() {
        let machine = Machine::spawn("m1", Vec::new(), context());
        machine.retire().await;
        assert!(matches!(
            machine.start_job(queued("j1")),
            Err(MachineError::Retired(_))
        ));
    }

    #[tokio::test]
    async fn test_lost_executor_does_not_strand_a_queued_job() {
        let machine = Machine::spawn("m1", Vec::new(), context());
        let pdu = Arc::new(DummyPdu::new("pdu", 1));
        machine
            .assign_port(PduPort::new(pdu, "0", Duration::ZERO))
            .unwrap();
        wait_for(&machine, MachineState::Idle).await;

        let task = lock(&machine.task).take().unwrap();
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(matches!(
            machine.start_job(queued("j1")),
            Err(MachineError::Retired(_))
        ));
        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(machine.info().current_job, None);
    }
}
