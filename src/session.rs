//! The console of a running job.
//!
//! [`JobConsole`] sits between a machine console and the client that
//! submitted the job. Every byte of console output is relayed to the client
//! and fed through the job's [`ConsoleState`]; executor status messages are
//! sent as `CONTROL` messages. Everything also lands in a timestamped log
//! that is stored with the job artifacts.

use std::fmt::Write as _;
use std::path::Path;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::AsyncWrite;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::console::{ConsoleState, LineMatches, LineSplitter, trim_line_ending};
use crate::protocol::{JobBucketRef, Message, MessageWriter, ProtocolResult, SessionEnd};
use crate::status::JobStatus;
use crate::timeout::Timeouts;

/// Where client-bound messages are written.
pub type ClientWriter = MessageWriter<Box<dyn AsyncWrite + Send + Sync + Unpin>>;

pub struct JobConsole {
    machine_id: String,
    state: ConsoleState,
    splitter: LineSplitter,
    client: Option<ClientWriter>,
    log: String,
    last_activity: Option<Instant>,
}

impl JobConsole {
    pub fn new(machine_id: impl Into<String>, state: ConsoleState, client: ClientWriter) -> Self {
        Self {
            machine_id: machine_id.into(),
            state,
            splitter: LineSplitter::new(),
            client: Some(client),
            log: String::new(),
            last_activity: None,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn state(&self) -> &ConsoleState {
        &self.state
    }

    pub fn reset_per_boot_state(&mut self) {
        self.state.reset_per_boot_state();
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Whether the client is still connected.
    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// The timestamped log of the session so far.
    pub fn log_text(&self) -> &str {
        &self.log
    }

    fn append_log(&mut self, source: &str, line: &str) {
        let _ = writeln!(
            self.log,
            "[{}] {}: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            source,
            line
        );
    }

    async fn send(&mut self, message: Message) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if let Err(e) = client.send(message).await {
            warn!("{}: client went away: {}", self.machine_id, e);
            self.client = None;
        }
    }

    /// Reports executor progress to the client.
    pub async fn log(&mut self, message: &str) {
        info!("{}: {}", self.machine_id, message);
        self.append_log("executor", message);
        self.send(Message::Control(format!("+ {}\n", message))).await;
    }

    /// Relays console output and classifies every completed line.
    pub async fn feed(&mut self, data: Bytes, timeouts: &mut Timeouts) -> Vec<LineMatches> {
        self.last_activity = Some(Instant::now());
        let lines = self.splitter.push(&data);
        self.send(Message::JobIo(data)).await;

        let mut all = Vec::new();
        for line in lines {
            let text = String::from_utf8_lossy(trim_line_ending(&line)).into_owned();
            self.append_log("console", &text);

            let matches = self.state.process_line(&line, timeouts);
            if matches.is_empty() {
                continue;
            }

            for pattern in matches.patterns.iter() {
                self.log(&format!("Matched console pattern '{}'", pattern)).await;
            }
            for watchdog in &matches.watchdogs {
                self.log(&format!("Watchdog {}", watchdog)).await;
            }
            all.push(matches);
        }
        all
    }

    /// Ends the session: flushes the log and sends the final status.
    pub async fn close(
        &mut self,
        status: JobStatus,
        job_bucket: Option<JobBucketRef>,
    ) -> ProtocolResult<()> {
        if let Some(rest) = self.splitter.flush() {
            let text = String::from_utf8_lossy(&rest).into_owned();
            self.append_log("console", &text);
        }
        self.append_log("executor", &format!("End of the session: {}", status));

        let Some(mut client) = self.client.take() else {
            debug!("{}: no client to report {} to", self.machine_id, status);
            return Ok(());
        };

        client
            .send(Message::SessionEnd(SessionEnd { status, job_bucket }))
            .await?;
        client.shutdown().await
    }

    /// Writes the session log to `dir/console.log`.
    pub async fn save_log(&self, dir: &Path) -> std::io::Result<()> {
        let contents = self.log.clone();
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join("console.log"), contents).await
    }
}
