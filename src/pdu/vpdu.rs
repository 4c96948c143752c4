//! The virtual PDU protocol.
//!
//! A deliberately tiny protocol used by emulated test machines and cheap
//! microcontroller-based power strips.
//!
//! # Wire Format
//!
//! Each request is one 32-bit big-endian word:
//!
//! ```text
//!  31            14   13   12           2  1  0
//! ┌────────────────┬─────┬──────────────┬─────┐
//! │ reserved (= 0) │ SHD │   port id    │ op  │
//! └────────────────┴─────┴──────────────┴─────┘
//! ```
//!
//! | op | Meaning | Reply |
//! |----|---------|-------|
//! | 0 | query port count | count (one byte) |
//! | 1 | turn on | `0x01` |
//! | 2 | turn off | `0x01` |
//! | 3 | query state | `0x03` ON, `0x04` OFF, `0x05` UNKNOWN |
//!
//! `SHD` asks the controller to shut down once the request is served.
//! Requests with reserved bits set are rejected by closing the connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Pdu, PduError, PduResult, PortState};

pub const SHUTDOWN_BIT: u32 = 1 << 13;
const PORT_SHIFT: u32 = 2;
const PORT_MASK: u32 = 0x7ff;
const OP_MASK: u32 = 0b11;
const RESERVED_MASK: u32 = !(SHUTDOWN_BIT | (PORT_MASK << PORT_SHIFT) | OP_MASK);

pub const REPLY_ACK: u8 = 0x01;
pub const REPLY_ON: u8 = 0x03;
pub const REPLY_OFF: u8 = 0x04;
pub const REPLY_UNKNOWN: u8 = 0x05;

/// The operation encoded in the two low bits of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpduOp {
    QueryPortCount = 0,
    TurnOn = 1,
    TurnOff = 2,
    QueryState = 3,
}

/// A decoded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpduRequest {
    pub port: u16,
    pub op: VpduOp,
    pub shutdown: bool,
}

impl VpduRequest {
    pub fn new(port: u16, op: VpduOp) -> Self {
        Self {
            port,
            op,
            shutdown: false,
        }
    }

    pub fn encode(&self) -> u32 {
        let mut word = ((self.port as u32 & PORT_MASK) << PORT_SHIFT) | self.op as u32;
        if self.shutdown {
            word |= SHUTDOWN_BIT;
        }
        word
    }

    pub fn decode(word: u32) -> PduResult<Self> {
        if word & RESERVED_MASK != 0 {
            return Err(PduError::Protocol(format!(
                "Reserved bits set in request 0x{:08x}",
                word
            )));
        }

        let op = match word & OP_MASK {
            0 => VpduOp::QueryPortCount,
            1 => VpduOp::TurnOn,
            2 => VpduOp::TurnOff,
            _ => VpduOp::QueryState,
        };

        Ok(Self {
            port: ((word >> PORT_SHIFT) & PORT_MASK) as u16,
            op,
            shutdown: word & SHUTDOWN_BIT != 0,
        })
    }
}

fn state_to_reply(state: PortState) -> u8 {
    match state {
        PortState::On => REPLY_ON,
        PortState::Off => REPLY_OFF,
        _ => REPLY_UNKNOWN,
    }
}

fn reply_to_state(reply: u8) -> PduResult<PortState> {
    match reply {
        REPLY_ON => Ok(PortState::On),
        REPLY_OFF => Ok(PortState::Off),
        REPLY_UNKNOWN => Ok(PortState::Unknown),
        other => Err(PduError::Protocol(format!(
            "Unexpected state reply 0x{:02x}",
            other
        ))),
    }
}

/// Driver talking to a virtual PDU over TCP, one connection per request.
pub struct VpduClient {
    name: String,
    address: String,
    timeout: Duration,
}

impl VpduClient {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn port_number(&self, port_id: &str) -> PduResult<u16> {
        port_id
            .parse::<u16>()
            .ok()
            .filter(|port| (*port as u32) <= PORT_MASK)
            .ok_or_else(|| PduError::UnknownPort {
                pdu: self.name.clone(),
                port: port_id.to_string(),
            })
    }

    /// Sends one request and returns the single-byte reply.
    pub async fn request(&self, request: VpduRequest) -> PduResult<u8> {
        let exchange = async {
            let mut stream = TcpStream::connect(&self.address).await?;
            stream.write_u32(request.encode()).await?;
            stream.flush().await?;
            stream.read_u8().await
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                PduError::Timeout(format!("No reply from virtual PDU at {}", self.address))
            })?
            .map_err(PduError::from)
    }
}

#[async_trait]
impl Pdu for VpduClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ports(&self) -> PduResult<Vec<String>> {
        let count = self
            .request(VpduRequest::new(0, VpduOp::QueryPortCount))
            .await?;
        Ok((0..count).map(|i| i.to_string()).collect())
    }

    async fn get_port_state(&self, port_id: &str) -> PduResult<PortState> {
        let port = self.port_number(port_id)?;
        let reply = self
            .request(VpduRequest::new(port, VpduOp::QueryState))
            .await?;
        reply_to_state(reply)
    }

    async fn set_port_state(&self, port_id: &str, state: PortState) -> PduResult<()> {
        let port = self.port_number(port_id)?;

        let ops: &[VpduOp] = match state {
            PortState::On => &[VpduOp::TurnOn],
            PortState::Off => &[VpduOp::TurnOff],
            PortState::Reboot => &[VpduOp::TurnOff, VpduOp::TurnOn],
            PortState::Unknown => {
                return Err(PduError::CommandFailed(
                    "Cannot switch a port to UNKNOWN".to_string(),
                ));
            }
        };

        for op in ops {
            let reply = self.request(VpduRequest::new(port, *op)).await?;
            if reply != REPLY_ACK {
                return Err(PduError::Protocol(format!(
                    "Expected ack, got 0x{:02x}",
                    reply
                )));
            }
        }
        Ok(())
    }
}

/// How long a connected client has to send its request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PortBank = Arc<Mutex<Vec<PortState>>>;

/// A virtual PDU serving an in-memory bank of ports.
pub struct VirtualPduServer {
    listener: TcpListener,
    ports: PortBank,
}

impl VirtualPduServer {
    pub async fn bind(address: &str, ports: usize) -> PduResult<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            ports: Arc::new(Mutex::new(vec![PortState::Off; ports])),
        })
    }

    pub fn local_addr(&self) -> PduResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves requests until cancelled or a request carries the shutdown bit.
    ///
    /// Every connection is served by its own task, so a client that never
    /// sends its request only holds up itself.
    pub async fn run(self, cancel: CancellationToken) -> PduResult<()> {
        info!("Virtual PDU listening on {}", self.local_addr()?);
        // Also cancelled by a shutdown request.
        let stop = cancel.child_token();

        loop {
            let (stream, peer) = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => accepted?,
            };

            let ports = self.ports.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop.cancelled() => debug!("{}: dropped, the server is stopping", peer),
                    _ = serve_connection(stream, peer, &ports, &stop) => {}
                }
            });
        }

        Ok(())
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ports: &Mutex<Vec<PortState>>,
    stop: &CancellationToken,
) {
    let word = match tokio::time::timeout(REQUEST_TIMEOUT, stream.read_u32()).await {
        Ok(Ok(word)) => word,
        Ok(Err(e)) => {
            debug!("{}: short request: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("{}: no request within {:?}, closing", peer, REQUEST_TIMEOUT);
            return;
        }
    };

    let request = match VpduRequest::decode(word) {
        Ok(request) => request,
        Err(e) => {
            warn!("{}: {}", peer, e);
            return;
        }
    };

    match serve_request(ports, &request) {
        Some(reply) => {
            if let Err(e) = stream.write_u8(reply).await {
                warn!("{}: failed to reply: {}", peer, e);
            }
        }
        None => warn!("{}: request for unknown port {}", peer, request.port),
    }

    if request.shutdown {
        info!("Virtual PDU shutdown requested by {}", peer);
        stop.cancel();
    }
}

fn serve_request(ports: &Mutex<Vec<PortState>>, request: &VpduRequest) -> Option<u8> {
    let mut ports = ports.lock().unwrap_or_else(|e| e.into_inner());

    if request.op == VpduOp::QueryPortCount {
        return Some(ports.len().min(u8::MAX as usize) as u8);
    }

    let port = ports.get_mut(request.port as usize)?;
    match request.op {
        VpduOp::TurnOn => {
            *port = PortState::On;
            Some(REPLY_ACK)
        }
        VpduOp::TurnOff => {
            *port = PortState::Off;
            Some(REPLY_ACK)
        }
        _ => Some(state_to_reply(*port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let request = VpduRequest::new(3, VpduOp::TurnOff);
        assert_eq!(request.encode(), (3 << 2) | 2);

        let decoded = VpduRequest::decode((5 << 2) | 3 | SHUTDOWN_BIT).unwrap();
        assert_eq!(decoded.port, 5);
        assert_eq!(decoded.op, VpduOp::QueryState);
        assert!(decoded.shutdown);
    }

    #[test]
    fn test_reserved_bits_are_rejected() {
        assert!(VpduRequest::decode(1 << 14).is_err());
        assert!(VpduRequest::decode(0x8000_0001).is_err());
    }

    async fn spawn_server(ports: usize) -> (String, CancellationToken, tokio::task::JoinHandle<()>) {
        let server = VirtualPduServer::bind("127.0.0.1:0", ports).await.unwrap();
        let address = server.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            server.run(token).await.unwrap();
        });
        (address, cancel, handle)
    }

    #[tokio::test]
    async fn test_client_against_server() {
        let (address, cancel, handle) = spawn_server(4).await;
        let client = VpduClient::new("vpdu", address);

        assert_eq!(client.ports().await.unwrap().len(), 4);
        assert_eq!(client.get_port_state("2").await.unwrap(), PortState::Off);

        client.set_port_state("2", PortState::On).await.unwrap();
        assert_eq!(client.get_port_state("2").await.unwrap(), PortState::On);

        client.set_port_state("2", PortState::Reboot).await.unwrap();
        assert_eq!(client.get_port_state("2").await.unwrap(), PortState::On);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_port_gets_no_reply() {
        let (address, cancel, handle) = spawn_server(1).await;
        let client = VpduClient::new("vpdu", address);

        assert!(client.get_port_state("9").await.is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_bit_stops_server() {
        let (address, _cancel, handle) = spawn_server(1).await;
        let client = VpduClient::new("vpdu", address);

        let mut request = VpduRequest::new(0, VpduOp::TurnOn);
        request.shutdown = true;
        assert_eq!(client.request(request).await.unwrap(), REPLY_ACK);

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_client_does_not_block_others() {
        let (address, cancel, handle) = spawn_server(2).await;
        let _silent = TcpStream::connect(&address).await.unwrap();

        let client = VpduClient::new("vpdu", address.clone()).with_timeout(Duration::from_secs(2));
        client.set_port_state("1", PortState::On).await.unwrap();
        assert_eq!(client.get_port_state("1").await.unwrap(), PortState::On);

        // A request that never completes must not keep the server alive.
        let mut partial = TcpStream::connect(&address).await.unwrap();
        partial.write_u8(0).await.unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
