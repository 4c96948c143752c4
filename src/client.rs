//! The client side of a job: submit, wait for the callback, proxy the session.
//!
//! The client listens on a TCP port and advertises it in the submission. Once
//! a machine is free the executor connects back and the client becomes a
//! terminal onto the machine console:
//!
//! - console output goes to stdout, executor messages to stderr
//! - stdin goes to the console; an interactive terminal is switched to
//!   cbreak mode for the duration of the session
//! - `CTRL+A` then `CTRL+C` detaches locally; a bare `CTRL+C` is forwarded
//!
//! The final status of the job becomes the exit code of the client.

use std::io::IsTerminal;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::bucket;
use crate::fleet::{Callback, JobMetadata, StorageCredentials, Submission};
use crate::job::Target;
use crate::protocol::{Message, MessageReader, MessageWriter, ProtocolVersion, SessionEnd};
use crate::status::JobStatus;
use crate::submit::{self, Request};

const CTRL_A: u8 = 0x01;
const CTRL_C: u8 = 0x03;

pub struct ClientOptions {
    /// Address of the executor submission endpoint.
    pub executor: String,
    /// The job document.
    pub job: String,
    /// Address the callback listener binds to.
    pub listen_host: String,
    /// Host name the executor should connect back to.
    pub callback_host: String,
    pub protocol: ProtocolVersion,
    pub job_id: Option<String>,
    pub target: Option<Target>,
    pub storage: Option<StorageCredentials>,
    /// Delay between submissions while every machine is busy.
    pub retry_interval: Duration,
    /// Where to mirror the job bucket once the job is over.
    pub artifacts: Option<PathBuf>,
}

impl ClientOptions {
    pub fn new(executor: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            executor: executor.into(),
            job: job.into(),
            listen_host: "0.0.0.0".to_string(),
            callback_host: "127.0.0.1".to_string(),
            protocol: ProtocolVersion::V1,
            job_id: None,
            target: None,
            storage: None,
            retry_interval: Duration::from_secs(5),
            artifacts: None,
        }
    }
}

/// How a proxied session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Ended(SessionEnd),
    /// The user detached with `CTRL+A CTRL+C`.
    Detached,
    /// The executor hung up without a status.
    Disconnected,
}

impl SessionOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            SessionOutcome::Ended(end) => end.status,
            SessionOutcome::Detached | SessionOutcome::Disconnected => JobStatus::Unknown,
        }
    }
}

/// Spots `CTRL+A CTRL+C` in user input.
#[derive(Debug, Default)]
pub struct EscapeFilter {
    armed: bool,
}

impl EscapeFilter {
    /// Returns the bytes to forward, and whether the user asked to detach.
    pub fn filter(&mut self, input: &[u8]) -> (Vec<u8>, bool) {
        let mut forward = Vec::with_capacity(input.len());
        for &byte in input {
            if self.armed {
                self.armed = false;
                if byte == CTRL_C {
                    return (forward, true);
                }
                forward.push(CTRL_A);
                if byte == CTRL_A {
                    continue;
                }
            } else if byte == CTRL_A {
                self.armed = true;
                continue;
            }
            forward.push(byte);
        }
        (forward, false)
    }
}

/// Switches a terminal to cbreak mode until dropped.
pub struct TerminalGuard {
    saved: Termios,
}

impl TerminalGuard {
    /// Enables cbreak mode on stdin when it is a terminal.
    pub fn for_stdin() -> Result<Option<Self>> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }

        let saved = termios::tcgetattr(stdin.as_fd()).context("Failed to read terminal mode")?;
        let mut cbreak = saved.clone();
        cbreak
            .local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
        cbreak.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        cbreak.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &cbreak)
            .context("Failed to switch the terminal to cbreak mode")?;

        Ok(Some(Self { saved }))
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let stdin = std::io::stdin();
        if let Err(e) = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &self.saved) {
            warn!("Failed to restore the terminal: {}", e);
        }
    }
}

/// Submits the job, retrying while every matching machine is busy.
pub async fn submit(options: &ClientOptions, callback_port: u16) -> Result<(String, String)> {
    let request = Request::Submit(Submission {
        metadata: JobMetadata {
            version: options.protocol.into(),
            job_id: options.job_id.clone(),
            callback: Callback {
                host: options.callback_host.clone(),
                port: callback_port,
            },
            target: options.target.clone(),
            storage: options.storage.clone(),
        },
        job: options.job.clone(),
    });

    loop {
        let response = submit::send_request(&options.executor, &request)
            .await
            .with_context(|| format!("Failed to reach the executor at {}", options.executor))?;

        match response.status {
            200 => {
                let machine_id = response.machine_id.unwrap_or_default();
                let job_id = response.job_id.unwrap_or_default();
                info!("Job {} queued on {}", job_id, machine_id);
                return Ok((machine_id, job_id));
            }
            409 => {
                info!(
                    "Every matching machine is busy, retrying in {:?}",
                    options.retry_interval
                );
                tokio::time::sleep(options.retry_interval).await;
            }
            status => bail!(
                "Job rejected ({}): {}",
                status,
                response.reason.unwrap_or_default()
            ),
        }
    }
}

/// Runs a job with the process stdin and stdout.
pub async fn run(options: ClientOptions) -> Result<JobStatus> {
    let guard = TerminalGuard::for_stdin()?;
    let outcome = run_with(&options, tokio::io::stdin(), tokio::io::stdout()).await;
    drop(guard);
    let outcome = outcome?;

    if let (SessionOutcome::Ended(end), Some(dest)) = (&outcome, &options.artifacts) {
        match &end.job_bucket {
            Some(reference) => {
                let copied = bucket::mirror(reference, dest)
                    .with_context(|| format!("Failed to mirror {}", reference.url))?;
                info!("Mirrored {} artifacts to {}", copied, dest.display());
            }
            None => warn!("The job has no bucket to mirror"),
        }
    }

    Ok(outcome.status())
}

/// Submits a job and proxies its session between `input`, `output` and
/// the executor.
pub async fn run_with<I, O>(options: &ClientOptions, input: I, output: O) -> Result<SessionOutcome>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let listener = TcpListener::bind((options.listen_host.as_str(), 0))
        .await
        .with_context(|| format!("Failed to listen on {}", options.listen_host))?;
    let port = listener.local_addr()?.port();
    debug!("Waiting for the executor on port {}", port);

    submit(options, port).await?;

    let (stream, peer) = listener
        .accept()
        .await
        .context("Failed to accept the executor connection")?;
    info!("Executor connected from {}", peer);

    proxy(stream, options.protocol, input, output).await
}

/// Relays a job session until it ends.
pub async fn proxy<I, O>(
    stream: TcpStream,
    version: ProtocolVersion,
    mut input: I,
    mut output: O,
) -> Result<SessionOutcome>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (read_half, write_half) = stream.into_split();
    let mut reader = MessageReader::new(version, read_half);
    if version == ProtocolVersion::V0 {
        reader = reader.detect_session_end();
    }
    let mut writer = MessageWriter::new(version, write_half);

    let mut escape = EscapeFilter::default();
    let mut input_open = true;
    let mut buf = vec![0u8; 1024];
    let mut stderr = tokio::io::stderr();

    loop {
        tokio::select! {
            message = reader.next() => {
                match message? {
                    None => return Ok(SessionOutcome::Disconnected),
                    Some(Message::JobIo(data)) => {
                        output.write_all(&data).await?;
                        output.flush().await?;
                    }
                    Some(Message::Control(text)) => {
                        stderr.write_all(text.as_bytes()).await?;
                    }
                    Some(Message::SessionEnd(end)) => {
                        output.flush().await?;
                        return Ok(SessionOutcome::Ended(end));
                    }
                }
            }
            read = input.read(&mut buf), if input_open => {
                let n = read?;
                if n == 0 {
                    debug!("Input closed");
                    input_open = false;
                    continue;
                }

                let (forward, detach) = escape.filter(&buf[..n]);
                if !forward.is_empty() {
                    writer.send(Message::JobIo(forward.into())).await?;
                }
                if detach {
                    info!("Detached from the session");
                    return Ok(SessionOutcome::Detached);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::session_end_trailer;
    use crate::submit::Response;
    use bytes::Bytes;
    use futures::StreamExt;
    use tokio_util::codec::{FramedRead, LinesCodec};

    #[test]
    fn test_escape_filter() {
        let mut filter = EscapeFilter::default();
        assert_eq!(filter.filter(b"ls\n"), (b"ls\n".to_vec(), false));
        // A bare CTRL+C goes to the machine.
        assert_eq!(filter.filter(&[CTRL_C]), (vec![CTRL_C], false));
        // CTRL+A followed by anything else is forwarded as is.
        assert_eq!(filter.filter(&[CTRL_A, b'x']), (vec![CTRL_A, b'x'], false));
        // CTRL+A CTRL+A sends a single CTRL+A.
        assert_eq!(filter.filter(&[CTRL_A, CTRL_A]), (vec![CTRL_A], false));
        // The escape may span reads.
        assert_eq!(filter.filter(b"ab\x01"), (b"ab".to_vec(), false));
        assert_eq!(filter.filter(&[CTRL_C, b'z']), (Vec::new(), true));
    }

    async fn connected() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(address), listener.accept());
        (server.unwrap().0, client.unwrap())
    }

    #[tokio::test]
    async fn test_proxy_v1_session() {
        let (client_side, executor_side) = connected().await;
        let (mut user, input) = tokio::io::duplex(1024);

        let executor = tokio::spawn(async move {
            let (read_half, write_half) = executor_side.into_split();
            let mut writer = MessageWriter::new(ProtocolVersion::V1, write_half);
            let mut reader = MessageReader::new(ProtocolVersion::V1, read_half);

            writer.send(Message::Control("+ Powering on\n".to_string())).await.unwrap();
            writer.send(Message::JobIo(Bytes::from_static(b"login: "))).await.unwrap();
            let typed = reader.next().await.unwrap();

            writer
                .send(Message::SessionEnd(SessionEnd {
                    status: JobStatus::Pass,
                    job_bucket: None,
                }))
                .await
                .unwrap();
            typed
        });

        user.write_all(b"root\n").await.unwrap();
        let mut output = Vec::new();
        let outcome = proxy(client_side, ProtocolVersion::V1, input, &mut output)
            .await
            .unwrap();

        assert_eq!(outcome.status(), JobStatus::Pass);
        assert_eq!(output, b"login: ");
        assert_eq!(
            executor.await.unwrap(),
            Some(Message::JobIo(Bytes::from_static(b"root\n")))
        );
    }

    #[tokio::test]
    async fn test_proxy_v0_detects_trailer() {
        let (client_side, mut executor_side) = connected().await;
        let (_user, input) = tokio::io::duplex(1024);

        let trailer = session_end_trailer(JobStatus::Incomplete);
        executor_side.write_all(b"booting\n").await.unwrap();
        executor_side.write_all(trailer.as_bytes()).await.unwrap();

        let mut output = Vec::new();
        let outcome = proxy(client_side, ProtocolVersion::V0, input, &mut output)
            .await
            .unwrap();
        assert_eq!(outcome.status(), JobStatus::Incomplete);
        assert!(output.starts_with(b"booting\n"));
    }

    #[tokio::test]
    async fn test_proxy_detach_and_disconnect() {
        let (client_side, _executor_side) = connected().await;
        let (mut user, input) = tokio::io::duplex(1024);
        user.write_all(&[CTRL_A, CTRL_C]).await.unwrap();
        let outcome = proxy(client_side, ProtocolVersion::V1, input, Vec::new())
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Detached);

        let (client_side, executor_side) = connected().await;
        drop(executor_side);
        let (_user, input) = tokio::io::duplex(1024);
        let outcome = proxy(client_side, ProtocolVersion::V1, input, Vec::new())
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Disconnected);
        assert_eq!(outcome.status(), JobStatus::Unknown);
    }

    #[tokio::test]
    async fn test_submit_retries_while_busy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut options = ClientOptions::new(listener.local_addr().unwrap().to_string(), "job");
        options.retry_interval = Duration::from_millis(10);

        let executor = tokio::spawn(async move {
            let mut requests = Vec::new();
            for status in [409, 200] {
                let (stream, _) = listener.accept().await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = FramedRead::new(read_half, LinesCodec::new());
                let line = lines.next().await.unwrap().unwrap();
                requests.push(serde_json::from_str::<Request>(&line).unwrap());

                let response = Response {
                    status,
                    machine_id: Some("m1".to_string()),
                    job_id: Some("j1".to_string()),
                    ..Response::default()
                };
                let mut line = serde_json::to_vec(&response).unwrap();
                line.push(b'\n');
                write_half.write_all(&line).await.unwrap();
            }
            requests
        });

        let (machine_id, job_id) = submit(&options, 4242).await.unwrap();
        assert_eq!((machine_id.as_str(), job_id.as_str()), ("m1", "j1"));

        let requests = executor.await.unwrap();
        assert_eq!(requests.len(), 2);
        let Request::Submit(submission) = &requests[0] else {
            panic!("expected a submission");
        };
        assert_eq!(submission.metadata.callback.port, 4242);
        assert_eq!(submission.metadata.version, 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let options = ClientOptions::new(listener.local_addr().unwrap().to_string(), "job");

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = FramedRead::new(read_half, LinesCodec::new());
            lines.next().await;
            write_half
                .write_all(b"{\"status\": 404, \"reason\": \"Unknown machine: m9\"}\n")
                .await
                .unwrap();
        });

        let err = submit(&options, 1).await.unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
