//! The executor task of a machine.
//!
//! A job runs as a sequence of boot cycles. Each cycle resets the per-boot
//! console state, powers the machine off, pushes the deployment to the boot
//! service, powers it on and watches the console until the session ends, a
//! reboot is requested, the executor is stopped or a timeout expires. Expired
//! timeouts are retried; a timeout out of retries aborts the job.
//!
//! Hardware and boot service failures are [`ExecutorFault`]s: they end the
//! job with `UNKNOWN` but leave the executor ready for the next one.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ExecutorContext, MachineCommand, MachineState, QueuedJob, Shared, lock};
use crate::boot::BootError;
use crate::job::Job;
use crate::pdu::{PduError, PduPort, PortState};
use crate::protocol::{Message, MessageReader, MessageWriter, ProtocolResult};
use crate::salad::{Delivery, SessionEndpoint, SessionRegistry};
use crate::session::{ClientWriter, JobConsole};
use crate::status::JobStatus;
use crate::timeout::{TimeoutKind, Timeouts};

type ClientReader = MessageReader<OwnedReadHalf>;

/// Infrastructure failures, as opposed to the job failing.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorFault {
    #[error("No PDU port is assigned")]
    NoPort,

    #[error("PDU error: {0}")]
    Pdu(#[from] PduError),

    #[error("Boot service error: {0}")]
    Boot(#[from] BootError),

    #[error("The console session of {0} was closed")]
    SessionClosed(String),

    #[error("Timeout '{0}' expired while driving the hardware")]
    InfraTimeout(&'static str),
}

pub(crate) struct Executor {
    machine_id: String,
    shared: Arc<Shared>,
    context: ExecutorContext,
    commands: mpsc::UnboundedReceiver<MachineCommand>,
    cancel: CancellationToken,
    port: Option<PduPort>,
}

/// The parts of a running job that change from cycle to cycle.
struct JobRun {
    console: JobConsole,
    client: Option<ClientReader>,
    timeouts: Timeouts,
}

impl Executor {
    pub(crate) fn new(
        machine_id: String,
        shared: Arc<Shared>,
        context: ExecutorContext,
        commands: mpsc::UnboundedReceiver<MachineCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            machine_id,
            shared,
            context,
            commands,
            cancel,
            port: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let command = tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => command,
            };

            match command {
                None => break,
                Some(MachineCommand::AssignPort(port)) => self.assign_port(port),
                Some(MachineCommand::StartJob(job)) => {
                    self.shared.set_state(MachineState::Running);
                    let status = self.run_job(*job).await;

                    *lock(&self.shared.last_status) = Some(status);
                    *lock(&self.shared.current_job) = None;
                    self.shared.set_state(MachineState::Idle);
                }
            }
        }

        if let Some(port) = self.port.as_mut()
            && let Err(e) = port.set(PortState::Off).await
        {
            warn!("{}: failed to power off {}: {}", self.machine_id, port, e);
        }
        debug!("Executor of {} stopped", self.machine_id);
    }

    fn assign_port(&mut self, port: PduPort) {
        info!("{}: assigned to {}", self.machine_id, port);
        self.port = Some(port);
        self.shared.state.send_if_modified(|state| {
            if *state == MachineState::WaitForConfig {
                *state = MachineState::Idle;
                true
            } else {
                false
            }
        });
    }

    async fn run_job(&mut self, queued: QueuedJob) -> JobStatus {
        let QueuedJob {
            job_id,
            job,
            callback,
            protocol,
            bucket,
        } = queued;
        info!(machine = %self.machine_id, job = %job_id, "Starting job");

        let stream = match tokio::time::timeout(
            self.context.callback_timeout,
            TcpStream::connect(&callback),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("{}: cannot reach the client at {}: {}", self.machine_id, callback, e);
                return JobStatus::SetupFail;
            }
            Err(_) => {
                warn!("{}: timed out connecting to the client at {}", self.machine_id, callback);
                return JobStatus::SetupFail;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let writer: ClientWriter = MessageWriter::new(protocol, Box::new(write_half));
        let mut run = JobRun {
            console: JobConsole::new(&self.machine_id, job.console_patterns.clone(), writer),
            client: Some(MessageReader::new(protocol, read_half)),
            timeouts: job.timeouts.clone(),
        };
        run.console
            .log(&format!("Job {} on {} (protocol {})", job_id, self.machine_id, protocol))
            .await;

        let status = match self.context.registry.register(&self.machine_id) {
            Ok(mut endpoint) => {
                let status = match self.boot_loop(&job, &mut run, &mut endpoint).await {
                    Ok(status) => status,
                    Err(fault) => {
                        error!(machine = %self.machine_id, "Job {} aborted: {}", job_id, fault);
                        run.console.log(&format!("Executor fault: {}", fault)).await;
                        JobStatus::Unknown
                    }
                };

                if let Some(port) = self.port.as_mut()
                    && let Err(e) = port.set(PortState::Off).await
                {
                    run.console
                        .log(&format!("Failed to power off {}: {}", port, e))
                        .await;
                }
                self.context.registry.unregister(&endpoint);
                status
            }
            Err(e) => {
                run.console
                    .log(&format!("Cannot open the console session: {}", e))
                    .await;
                JobStatus::SetupFail
            }
        };

        run.console.log(&format!("Job finished: {}", status)).await;
        if let Err(e) = run
            .console
            .close(status, bucket.as_ref().map(|b| b.reference.clone()))
            .await
        {
            warn!("{}: failed to report the end of the session: {}", self.machine_id, e);
        }

        let log_dir = bucket
            .as_ref()
            .map(|b| b.path.clone())
            .or_else(|| self.context.log_dir.as_ref().map(|dir| dir.join(&job_id)));
        if let Some(dir) = log_dir
            && let Err(e) = run.console.save_log(&dir).await
        {
            warn!("{}: failed to save the console log to {}: {}", self.machine_id, dir.display(), e);
        }

        info!(machine = %self.machine_id, job = %job_id, status = %status, "Job over");
        status
    }

    async fn boot_loop(
        &mut self,
        job: &Job,
        run: &mut JobRun,
        endpoint: &mut SessionEndpoint,
    ) -> Result<JobStatus, ExecutorFault> {
        let port = self.port.as_mut().ok_or(ExecutorFault::NoPort)?;

        if let Some(left) = job.time_to_deadline(Utc::now()) {
            if left.is_zero() {
                run.console.log("The job deadline has already passed").await;
                return Ok(run.console.state().job_status());
            }
            run.timeouts.get_mut(TimeoutKind::Overall).clamp_duration(left);
        }
        run.timeouts.get_mut(TimeoutKind::Overall).start();

        let boot = &self.context.boot;
        let machine_id = self.machine_id.as_str();
        let mut cycle = 0u32;
        let mut booted = false;
        loop {
            if self.cancel.is_cancelled() {
                run.console.log("The executor is stopping, aborting the job").await;
                break;
            }
            if run.timeouts.get(TimeoutKind::Overall).has_expired() {
                run.console.log("Timeout 'overall' expired").await;
                break;
            }
            cycle += 1;

            run.console.reset_per_boot_state();

            // The deployment of the first cycle until one actually powered on.
            let deployment = job.deployment(!booted);
            let console = &mut run.console;
            let setup = async {
                port.set(PortState::Off).await?;
                console
                    .log(&format!("Boot cycle {}: deploying {}", cycle, deployment.kernel_url))
                    .await;
                boot.configure(machine_id, deployment).await?;
                console.log(&format!("Powering on {}", port)).await;
                port.set(PortState::On).await?;
                Ok::<(), ExecutorFault>(())
            };
            if !infra_phase(&mut run.timeouts, TimeoutKind::InfraSetup, setup).await? {
                let infra_setup = TimeoutKind::InfraSetup.as_str();
                run.console.log(&format!("Timeout '{}' expired", infra_setup)).await;
                if !run.timeouts.get_mut(TimeoutKind::InfraSetup).retry() {
                    run.console
                        .log(&format!("Out of retries for {}, aborting the job", infra_setup))
                        .await;
                    break;
                }
                continue;
            }
            booted = true;

            run.timeouts.get_mut(TimeoutKind::BootCycle).start();
            run.timeouts.get_mut(TimeoutKind::FirstConsoleActivity).start();
            run.timeouts.get_mut(TimeoutKind::ConsoleActivity).stop();

            run.watch_cycle(&self.context, &self.cancel, endpoint).await?;

            let teardown = async { port.set(PortState::Off).await.map_err(ExecutorFault::from) };
            if !infra_phase(&mut run.timeouts, TimeoutKind::InfraTeardown, teardown).await? {
                return Err(ExecutorFault::InfraTimeout(TimeoutKind::InfraTeardown.as_str()));
            }
            run.console.log(&format!("Powered off {}", port)).await;

            let unfit = run.console.state().machine_is_unfit_for_service();
            let ended = run.console.state().session_has_ended();
            let reboot = run.console.state().needs_reboot();

            if unfit {
                self.shared.ready_for_service.store(false, Ordering::SeqCst);
                run.console.log("The machine reported itself unfit for service").await;
                break;
            }
            if ended {
                break;
            }
            if self.cancel.is_cancelled() {
                continue;
            }

            let verdict = run.timeouts.retry_expired_at(Instant::now());
            for name in &verdict.expired {
                run.console.log(&format!("Timeout '{}' expired", name)).await;
            }
            let mut exhausted = verdict.exhausted.clone();

            // A reboot request spends a boot cycle, unless the boot cycle
            // already timed out and was counted.
            let boot_cycle = TimeoutKind::BootCycle.as_str();
            if reboot && !verdict.expired.iter().any(|name| name == boot_cycle) {
                run.console.log("The console requested a reboot").await;
                if !run.timeouts.get_mut(TimeoutKind::BootCycle).retry() {
                    exhausted.push(boot_cycle.to_string());
                }
            }

            if !exhausted.is_empty() {
                run.console
                    .log(&format!("Out of retries for {}, aborting the job", exhausted.join(", ")))
                    .await;
                break;
            }

            run.timeouts.stop_per_cycle();
        }

        run.timeouts.stop_all();
        Ok(run.console.state().job_status())
    }
}

impl JobRun {
    /// Relays the console until the cycle has to end.
    async fn watch_cycle(
        &mut self,
        context: &ExecutorContext,
        cancel: &CancellationToken,
        endpoint: &mut SessionEndpoint,
    ) -> Result<(), ExecutorFault> {
        loop {
            let state = self.console.state();
            if state.session_has_ended()
                || state.needs_reboot()
                || state.machine_is_unfit_for_service()
            {
                return Ok(());
            }

            let now = Instant::now();
            if cancel.is_cancelled() || self.timeouts.has_expired_at(now) {
                return Ok(());
            }

            let mut wake = now + context.poll_interval;
            if let Some(deadline) = self.timeouts.next_deadline() {
                // Expiry is strict: wake up just past the deadline.
                wake = wake.min(deadline + Duration::from_millis(1));
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                data = endpoint.recv() => {
                    let data = data
                        .ok_or_else(|| ExecutorFault::SessionClosed(endpoint.machine_id().to_string()))?;
                    self.console.feed(data, &mut self.timeouts).await;
                    self.timeouts.get_mut(TimeoutKind::FirstConsoleActivity).stop();
                    self.timeouts
                        .get_mut(TimeoutKind::ConsoleActivity)
                        .reset(self.console.last_activity());
                }
                input = next_input(&mut self.client) => {
                    self.forward_input(input, &context.registry).await;
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn forward_input(
        &mut self,
        input: ProtocolResult<Option<Message>>,
        registry: &SessionRegistry,
    ) {
        match input {
            Ok(Some(Message::JobIo(data))) => {
                match registry.send_to_console(self.console.machine_id(), data) {
                    Delivery::Sent => {}
                    Delivery::QueueFull => {
                        warn!("{}: the console is stalled, dropping input", self.console.machine_id());
                    }
                    Delivery::NoReceiver => {
                        debug!("{}: no console bound, dropping input", self.console.machine_id());
                    }
                }
            }
            Ok(Some(other)) => {
                debug!(
                    "{}: ignoring {:?} message from the client",
                    self.console.machine_id(),
                    other.message_type()
                );
            }
            Ok(None) => {
                debug!("{}: the client closed its input", self.console.machine_id());
                self.client = None;
            }
            Err(e) => {
                warn!("{}: bad input from the client: {}", self.console.machine_id(), e);
                self.client = None;
            }
        }
    }
}

/// Runs an infrastructure phase under the timeout of `kind`.
///
/// Returns `Ok(false)` if the timeout expired before the phase was over.
async fn infra_phase<F>(
    timeouts: &mut Timeouts,
    kind: TimeoutKind,
    phase: F,
) -> Result<bool, ExecutorFault>
where
    F: Future<Output = Result<(), ExecutorFault>>,
{
    let timer = timeouts.get_mut(kind);
    timer.start();
    let outcome = match timer.deadline() {
        Some(deadline) => tokio::time::timeout_at(deadline + Duration::from_millis(1), phase)
            .await
            .ok(),
        None => Some(phase.await),
    };
    timer.stop();

    match outcome {
        Some(result) => result.map(|()| true),
        None => Ok(false),
    }
}

/// Next message from the client, or never once it is gone.
async fn next_input(client: &mut Option<ClientReader>) -> ProtocolResult<Option<Message>> {
    match client {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{BootResult, BootService, NoBootService};
    use crate::job::Deployment;
    use crate::machine::Machine;
    use crate::pdu::dummy::DummyPdu;
    use crate::protocol::ProtocolVersion;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    const JOB: &str = r#"
version: 1
timeouts:
  boot_cycle:
    seconds: 0
    retries: 1
console_patterns:
  session_end:
    regex: "^Power down$"
  session_reboot:
    regex: "^Rebooting$"
  job_success:
    regex: "RESULT: pass"
  machine_unfit_for_service:
    regex: "^Disk failure$"
deployment:
  start:
    kernel:
      url: "http://example.com/bzImage"
"#;

    const LONG_JOB: &str = r#"
version: 1
timeouts:
  boot_cycle:
    minutes: 5
    retries: 1
console_patterns:
  session_end:
    regex: "^Power down$"
  session_reboot:
    regex: "^Rebooting$"
  job_success:
    regex: "RESULT: pass"
  machine_unfit_for_service:
    regex: "^Disk failure$"
deployment:
  start:
    kernel:
      url: "http://example.com/bzImage"
"#;

    struct Harness {
        machine: Machine,
        pdu: Arc<DummyPdu>,
        registry: Arc<SessionRegistry>,
        listener: TcpListener,
    }

    /// Never finishes configuring a machine.
    struct StuckBootService;

    #[async_trait::async_trait]
    impl BootService for StuckBootService {
        async fn configure(&self, _machine_id: &str, _deployment: &Deployment) -> BootResult<()> {
            std::future::pending().await
        }
    }

    /// `LONG_JOB` with extra `timeouts` entries.
    fn long_job_with_timeouts(extra: &str) -> String {
        LONG_JOB.replacen("timeouts:\n", &format!("timeouts:\n{}", extra), 1)
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(NoBootService)).await
    }

    async fn harness_with(boot: Arc<dyn BootService>) -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let mut context = ExecutorContext::new(registry.clone(), boot);
        context.poll_interval = Duration::from_millis(10);

        let machine = Machine::spawn("m1", Vec::new(), context);
        let pdu = Arc::new(DummyPdu::new("pdu", 1));
        machine
            .assign_port(PduPort::new(pdu.clone(), "0", Duration::ZERO))
            .unwrap();
        machine
            .subscribe()
            .wait_for(|s| *s == MachineState::Idle)
            .await
            .unwrap();

        Harness {
            machine,
            pdu,
            registry,
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    impl Harness {
        fn submit(&self, document: &str) {
            let callback = self.listener.local_addr().unwrap().to_string();
            self.machine
                .start_job(QueuedJob {
                    job_id: "job-1".to_string(),
                    job: Job::parse(document).unwrap(),
                    callback,
                    protocol: ProtocolVersion::V1,
                    bucket: None,
                })
                .unwrap();
        }

        async fn wait_for_power_ons(&self, count: usize) {
            while self.pdu.count("0", PortState::On) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn wait_until_idle(&self) {
            self.machine
                .subscribe()
                .wait_for(|s| *s == MachineState::Idle)
                .await
                .unwrap();
        }

        async fn client(&self) -> (ClientReader, tokio::net::tcp::OwnedWriteHalf) {
            let (stream, _) = self.listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            (MessageReader::new(ProtocolVersion::V1, read_half), write_half)
        }

        /// Feeds the console once the executor listens to it.
        async fn console_says(&self, text: &'static str) {
            while !self.registry.has_session("m1") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(
                self.registry
                    .dispatch("m1", Bytes::from_static(text.as_bytes()))
                    .is_sent()
            );
        }
    }

    async fn final_status(reader: &mut ClientReader) -> (JobStatus, Vec<String>) {
        let mut control = Vec::new();
        while let Some(message) = reader.next().await.unwrap() {
            match message {
                Message::Control(text) => control.push(text),
                Message::SessionEnd(end) => return (end.status, control),
                Message::JobIo(_) => {}
            }
        }
        panic!("the session ended without a status");
    }

    #[tokio::test]
    async fn test_exhausted_boot_cycles_end_incomplete() {
        let h = harness().await;
        h.submit(JOB);
        let (mut reader, _input) = h.client().await;

        let (status, control) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Incomplete);
        assert_eq!(h.pdu.count("0", PortState::On), 2);
        assert_eq!(h.pdu.state_of("0"), Some(PortState::Off));
        assert!(control.iter().any(|line| line.contains("Out of retries for boot_cycle")));

        h.machine
            .subscribe()
            .wait_for(|s| *s == MachineState::Idle)
            .await
            .unwrap();
        assert_eq!(h.machine.info().last_status, Some(JobStatus::Incomplete));
        assert!(!h.registry.has_session("m1"));
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_session_end_passes() {
        let h = harness().await;
        h.submit(LONG_JOB);
        let (mut reader, _input) = h.client().await;

        h.console_says("RESULT: pass\nPower down\n").await;
        let (status, _) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Pass);
        assert_eq!(h.pdu.count("0", PortState::On), 1);
        assert_eq!(h.pdu.state_of("0"), Some(PortState::Off));
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_reboot_request_spends_a_boot_cycle() {
        let h = harness().await;
        h.submit(LONG_JOB);
        let (mut reader, _input) = h.client().await;

        h.console_says("Rebooting\n").await;
        h.wait_for_power_ons(2).await;
        // The boot_cycle budget allows a single retry.
        h.console_says("Rebooting\n").await;

        let (status, _) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Incomplete);
        assert_eq!(h.pdu.count("0", PortState::On), 2);
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_unfit_machine_leaves_service() {
        let h = harness().await;
        h.submit(LONG_JOB);
        let (mut reader, _input) = h.client().await;

        h.console_says("Disk failure\n").await;
        let (status, _) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Incomplete);
        assert!(!h.machine.ready_for_service());
        assert_eq!(h.pdu.count("0", PortState::On), 1);
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_client_input_reaches_the_console() {
        let h = harness().await;
        let (tx, mut rx) = mpsc::channel(crate::salad::CONSOLE_QUEUE_DEPTH);
        h.registry.bind_console("m1", "unix:/run/m1.sock", tx);

        h.submit(LONG_JOB);
        let (mut reader, input) = h.client().await;
        let mut writer = MessageWriter::new(ProtocolVersion::V1, input);
        writer
            .send(Message::JobIo(Bytes::from_static(b"root\n")))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"root\n"));

        h.console_says("Power down\n").await;
        let (status, _) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Fail);
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_busy_console_fails_setup() {
        let h = harness().await;
        let _operator = h.registry.register("m1").unwrap();

        h.submit(LONG_JOB);
        let (mut reader, _input) = h.client().await;
        let (status, control) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::SetupFail);
        assert!(control.iter().any(|line| line.contains("Cannot open the console session")));
        assert_eq!(h.pdu.count("0", PortState::On), 0);
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_past_deadline_never_powers_on() {
        let h = harness().await;
        let document = format!("{}deadline: \"2020-01-01T00:00:00Z\"\n", LONG_JOB);
        h.submit(&document);
        let (mut reader, _input) = h.client().await;

        let (status, control) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Incomplete);
        assert!(control.iter().any(|line| line.contains("deadline has already passed")));
        assert_eq!(h.pdu.count("0", PortState::On), 0);
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_silent_watchdog_aborts_the_job() {
        let h = harness().await;
        let document = long_job_with_timeouts("  watchdogs:\n    heartbeat:\n      milliseconds: 200\n")
            .replacen(
                "console_patterns:\n",
                concat!(
                    "console_patterns:\n",
                    "  watchdogs:\n",
                    "    heartbeat:\n",
                    "      start:\n        regex: \"tests starting\"\n",
                    "      reset:\n        regex: \"ping\"\n",
                    "      stop:\n        regex: \"tests done\"\n",
                ),
                1,
            );
        h.submit(&document);
        let (mut reader, _input) = h.client().await;

        h.console_says("tests starting\n").await;
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.console_says("ping\n").await;
        }
        // Pings kept the watchdog alive past its 200ms budget.
        assert_eq!(h.machine.state(), MachineState::Running);

        let (status, control) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Incomplete);
        assert!(control.iter().any(|line| line.contains("Timeout 'heartbeat' expired")));
        assert!(control.iter().any(|line| line.contains("Out of retries for heartbeat")));
        assert_eq!(h.pdu.count("0", PortState::On), 1);
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_silent_console_is_retried_then_aborted() {
        let h = harness().await;
        h.submit(&long_job_with_timeouts(
            "  first_console_activity:\n    milliseconds: 100\n    retries: 1\n",
        ));
        let (mut reader, _input) = h.client().await;

        let (status, control) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Incomplete);
        assert_eq!(h.pdu.count("0", PortState::On), 2);
        assert!(
            control
                .iter()
                .any(|line| line.contains("Out of retries for first_console_activity"))
        );
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_console_activity_slides_with_output() {
        let h = harness().await;
        h.submit(&long_job_with_timeouts(
            "  console_activity:\n    milliseconds: 300\n",
        ));
        let (mut reader, _input) = h.client().await;

        for _ in 0..8 {
            h.console_says("tick\n").await;
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert_eq!(h.machine.state(), MachineState::Running);
        assert_eq!(h.pdu.count("0", PortState::On), 1);

        let (status, control) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Incomplete);
        assert!(control.iter().any(|line| line.contains("Timeout 'console_activity' expired")));
        assert_eq!(h.pdu.count("0", PortState::On), 1);
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_overall_timeout_ends_the_job() {
        let h = harness().await;
        h.submit(&long_job_with_timeouts("  overall:\n    milliseconds: 200\n"));
        let (mut reader, _input) = h.client().await;

        let (status, control) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Incomplete);
        assert!(control.iter().any(|line| line.contains("Timeout 'overall' expired")));
        assert_eq!(h.pdu.count("0", PortState::On), 1);
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_pdu_failure_is_unknown_and_the_next_job_runs() {
        let h = harness().await;
        h.submit(LONG_JOB);
        let (mut reader, _input) = h.client().await;
        h.wait_for_power_ons(1).await;

        h.pdu.set_failing(true);
        h.console_says("Rebooting\n").await;
        let (status, control) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Unknown);
        assert!(control.iter().any(|line| line.contains("Executor fault")));

        h.wait_until_idle().await;
        assert_eq!(h.machine.info().last_status, Some(JobStatus::Unknown));
        assert!(!h.registry.has_session("m1"));

        h.pdu.set_failing(false);
        h.submit(LONG_JOB);
        let (mut reader, _input) = h.client().await;
        h.console_says("RESULT: pass\nPower down\n").await;
        let (status, _) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Pass);
        assert_eq!(h.pdu.state_of("0"), Some(PortState::Off));
        h.machine.retire().await;
    }

    #[tokio::test]
    async fn test_stuck_boot_service_spends_infra_setup() {
        let h = harness_with(Arc::new(StuckBootService)).await;
        h.submit(&long_job_with_timeouts(
            "  infra_setup:\n    milliseconds: 100\n    retries: 1\n",
        ));
        let (mut reader, _input) = h.client().await;

        let (status, control) = final_status(&mut reader).await;
        assert_eq!(status, JobStatus::Incomplete);
        let expired = control
            .iter()
            .filter(|line| line.contains("Timeout 'infra_setup' expired"))
            .count();
        assert_eq!(expired, 2);
        assert!(control.iter().any(|line| line.contains("Out of retries for infra_setup")));
        assert_eq!(h.pdu.count("0", PortState::On), 0);
        h.machine.retire().await;
    }
}
