//! Job I/O protocol between an executor and a submitting client.
//!
//! The client listens on a TCP port and the executor connects back to it
//! once a machine has been assigned. Two protocol versions exist, picked by
//! the `version` field of the submission:
//!
//! - **v0**: raw bytes in both directions. The end of the session is a text
//!   trailer the client finds by scanning what it receives:
//!   `<-- End of the session: STATUS -->`.
//! - **v1**: typed frames in both directions.
//!
//! # v1 Frame Format
//!
//! ```text
//! ┌──────────┬────────────────┬──────────────────┐
//! │ type: u8 │ length: u32 BE │ payload (length) │
//! └──────────┴────────────────┴──────────────────┘
//! ```
//!
//! | Type | Name | Payload |
//! |------|------|---------|
//! | 0 | `CONTROL` | UTF-8 status text for the user |
//! | 1 | `JOB_IO` | Raw console bytes |
//! | 2 | `SESSION_END` | JSON `{"status": "PASS", "job_bucket": {...}}` |

use std::collections::VecDeque;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::status::JobStatus;

/// Maximum payload of a single frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (1 byte type + 4 bytes length).
pub const HEADER_SIZE: usize = 5;

const SESSION_END_PREFIX: &[u8] = b"<-- End of the session: ";
const SESSION_END_SUFFIX: &[u8] = b" -->";

/// How much of the v0 stream is kept to find a trailer split across reads.
const SCAN_WINDOW: usize = 256;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    V0,
    V1,
}

impl TryFrom<u32> for ProtocolVersion {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProtocolVersion::V0),
            1 => Ok(ProtocolVersion::V1),
            other => Err(ProtocolError::UnsupportedVersion(other)),
        }
    }
}

impl From<ProtocolVersion> for u32 {
    fn from(version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::V0 => 0,
            ProtocolVersion::V1 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Control = 0,
    JobIo = 1,
    SessionEnd = 2,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Control),
            1 => Ok(MessageType::JobIo),
            2 => Ok(MessageType::SessionEnd),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }
}

/// Where the artifacts of a job can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobBucketRef {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
}

/// Payload of a `SESSION_END` message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionEnd {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_bucket: Option<JobBucketRef>,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Control(String),
    JobIo(Bytes),
    SessionEnd(SessionEnd),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Control(_) => MessageType::Control,
            Message::JobIo(_) => MessageType::JobIo,
            Message::SessionEnd(_) => MessageType::SessionEnd,
        }
    }

    fn payload(&self) -> ProtocolResult<Bytes> {
        Ok(match self {
            Message::Control(text) => Bytes::copy_from_slice(text.as_bytes()),
            Message::JobIo(data) => data.clone(),
            Message::SessionEnd(end) => Bytes::from(serde_json::to_vec(end)?),
        })
    }

    fn from_payload(message_type: MessageType, payload: Bytes) -> ProtocolResult<Self> {
        match message_type {
            MessageType::Control => String::from_utf8(payload.to_vec())
                .map(Message::Control)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string())),
            MessageType::JobIo => Ok(Message::JobIo(payload)),
            MessageType::SessionEnd => Ok(Message::SessionEnd(serde_json::from_slice(&payload)?)),
        }
    }
}

/// The v0 session trailer for `status`.
pub fn session_end_trailer(status: JobStatus) -> String {
    format!("\n<-- End of the session: {} -->\n", status)
}

/// tokio codec for v1 frames.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let message_type = MessageType::try_from(src[0])?;
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();
        Message::from_payload(message_type, payload).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = item.payload()?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(payload.len()));
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u8(item.message_type() as u8);
        dst.put_u32(payload.len() as u32);
        dst.put(payload);
        Ok(())
    }
}

/// Finds the v0 session trailer in a raw stream.
#[derive(Debug, Default)]
pub struct SessionEndScanner {
    window: Vec<u8>,
}

impl SessionEndScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds received bytes, returning the status once a trailer was seen.
    pub fn push(&mut self, data: &[u8]) -> Option<JobStatus> {
        self.window.extend_from_slice(data);

        let status = find_trailer(&self.window);
        if status.is_some() {
            self.window.clear();
        } else if self.window.len() > SCAN_WINDOW {
            let excess = self.window.len() - SCAN_WINDOW;
            self.window.drain(..excess);
        }

        status
    }
}

fn find_trailer(data: &[u8]) -> Option<JobStatus> {
    let start = find(data, SESSION_END_PREFIX)? + SESSION_END_PREFIX.len();
    let rest = &data[start..];
    let end = find(rest, SESSION_END_SUFFIX)?;
    std::str::from_utf8(&rest[..end]).ok()?.parse().ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Writes messages to a peer, in the encoding of the negotiated version.
pub struct MessageWriter<W> {
    version: ProtocolVersion,
    writer: W,
    codec: MessageCodec,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(version: ProtocolVersion, writer: W) -> Self {
        Self {
            version,
            writer,
            codec: MessageCodec,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub async fn send(&mut self, message: Message) -> ProtocolResult<()> {
        match self.version {
            ProtocolVersion::V1 => {
                let mut buf = BytesMut::new();
                self.codec.encode(message, &mut buf)?;
                self.writer.write_all(&buf).await?;
            }
            ProtocolVersion::V0 => match message {
                Message::Control(text) => self.writer.write_all(text.as_bytes()).await?,
                Message::JobIo(data) => self.writer.write_all(&data).await?,
                Message::SessionEnd(end) => {
                    self.writer
                        .write_all(session_end_trailer(end.status).as_bytes())
                        .await?
                }
            },
        }
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Reads messages from a peer.
///
/// In v0 every read becomes a `JOB_IO` message; with
/// [`detect_session_end`](Self::detect_session_end) a `SESSION_END` follows
/// the chunk that completed the trailer.
pub struct MessageReader<R> {
    version: ProtocolVersion,
    reader: R,
    buf: BytesMut,
    codec: MessageCodec,
    scanner: Option<SessionEndScanner>,
    pending: VecDeque<Message>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(version: ProtocolVersion, reader: R) -> Self {
        Self {
            version,
            reader,
            buf: BytesMut::with_capacity(4096),
            codec: MessageCodec,
            scanner: None,
            pending: VecDeque::new(),
        }
    }

    pub fn detect_session_end(mut self) -> Self {
        self.scanner = Some(SessionEndScanner::new());
        self
    }

    /// Returns the next message, or `None` once the peer closed the stream.
    ///
    /// Cancel safe: partial frames stay buffered.
    pub async fn next(&mut self) -> ProtocolResult<Option<Message>> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }

        loop {
            if self.version == ProtocolVersion::V1
                && let Some(message) = self.codec.decode(&mut self.buf)?
            {
                return Ok(Some(message));
            }

            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.version == ProtocolVersion::V1 && !self.buf.is_empty() {
                    return Err(ProtocolError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed in the middle of a frame",
                    )));
                }
                return Ok(None);
            }

            if self.version == ProtocolVersion::V0 {
                let data = self.buf.split().freeze();
                if let Some(status) = self.scanner.as_mut().and_then(|s| s.push(&data)) {
                    self.pending.push_back(Message::SessionEnd(SessionEnd {
                        status,
                        job_bucket: None,
                    }));
                }
                return Ok(Some(Message::JobIo(data)));
            }
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", u32::from(*self))
    }
}
