//! The job submission endpoint.
//!
//! Clients connect over TCP and exchange newline-delimited JSON: one request
//! per line, one response line per request.
//!
//! ```text
//! → {"metadata": {"version": 1, "callback": {"host": "10.0.0.5", "port": 4123}}, "job": "version: 1\n..."}
//! ← {"status": 200, "machine_id": "52:54:00:11:22:01", "job_id": "0b5c..."}
//!
//! → {"list": true}
//! ← {"status": 200, "machines": [{"id": "52:54:00:11:22:01", "state": "IDLE", ...}]}
//! ```
//!
//! The legacy form carries the job and the callback at the top level and
//! always speaks protocol v0:
//!
//! ```text
//! → {"job": "version: 1\n...", "callback": {"host": "10.0.0.5", "port": 4123}}
//! ```

use std::sync::Arc;

use futures::StreamExt;
use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fleet::{Callback, Fleet, JobMetadata, Submission};
use crate::machine::MachineInfo;

/// Longest request line accepted.
pub const MAX_REQUEST_LENGTH: usize = 4 * 1024 * 1024;

/// The single-body request older clients send.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LegacySubmission {
    pub job: String,
    pub callback: Callback,
    #[serde(default)]
    pub job_id: Option<String>,
}

impl From<LegacySubmission> for Submission {
    fn from(legacy: LegacySubmission) -> Self {
        Submission {
            metadata: JobMetadata {
                version: 0,
                job_id: legacy.job_id,
                callback: legacy.callback,
                target: None,
                storage: None,
            },
            job: legacy.job,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Request {
    List {
        #[serde(deserialize_with = "literal_true")]
        list: bool,
    },
    Submit(Submission),
    Legacy(LegacySubmission),
}

/// Only `{"list": true}` asks for the machine list.
fn literal_true<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    if bool::deserialize(deserializer)? {
        Ok(true)
    } else {
        Err(de::Error::invalid_value(Unexpected::Bool(false), &"true"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Response {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machines: Vec<MachineInfo>,
}

impl Response {
    fn error(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Answers one request line.
pub fn handle_line(fleet: &Fleet, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return Response::error(400, format!("Malformed request: {}", e)),
    };

    let submission = match request {
        Request::List { .. } => {
            return Response {
                status: 200,
                machines: fleet.snapshot(),
                ..Response::default()
            };
        }
        Request::Submit(submission) => submission,
        Request::Legacy(legacy) => legacy.into(),
    };

    match fleet.submit(submission) {
        Ok(accepted) => Response {
            status: 200,
            machine_id: Some(accepted.machine_id),
            job_id: Some(accepted.job_id),
            ..Response::default()
        },
        Err(e) => {
            debug!("Submission rejected: {}", e);
            Response::error(e.status_code(), e.to_string())
        }
    }
}

pub struct SubmitServer {
    listener: TcpListener,
    fleet: Arc<Fleet>,
}

impl SubmitServer {
    pub async fn bind(address: impl ToSocketAddrs, fleet: Arc<Fleet>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, fleet })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves clients until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> std::io::Result<()> {
        info!("Accepting jobs on {}", self.listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Submission client {} connected", peer);
                    let fleet = self.fleet.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, fleet, cancel).await {
                            warn!("Submission client {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept a submission client: {}", e),
            }
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    fleet: Arc<Fleet>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_REQUEST_LENGTH),
    );

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next() => line,
        };

        let response = match line {
            None => return Ok(()),
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => handle_line(&fleet, &line),
            Some(Err(e)) => {
                // The stream cannot be resynchronised after an oversized line.
                let response = Response::error(400, e.to_string());
                write_response(&mut write_half, &response).await?;
                return Ok(());
            }
        };
        write_response(&mut write_half, &response).await?;
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Sends one request and waits for its response.
pub async fn send_request(address: &str, request: &Request) -> std::io::Result<Response> {
    let stream = TcpStream::connect(address).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    write_half.write_all(&line).await?;

    let mut lines = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_REQUEST_LENGTH),
    );
    match lines.next().await {
        Some(Ok(line)) => Ok(serde_json::from_str(&line)?),
        Some(Err(e)) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "the executor closed the connection without answering",
        )),
    }
}
