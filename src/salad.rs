//! SALAD: the console multiplexer.
//!
//! SALAD owns every console transport of the host (serial adapters and the
//! Unix sockets of emulated machines), learns which machine is behind each
//! of them, and routes bytes between consoles and the sessions registered in
//! the [`SessionRegistry`].
//!
//! # Console Markers
//!
//! Machines identify themselves by printing markers anywhere in a line,
//! usually from the kernel command line or an early init script:
//!
//! | Marker | Effect |
//! |--------|--------|
//! | `SALAD.machine_id=<id>` | Binds the transport to machine `<id>` |
//! | `SALAD.ping` | SALAD answers `SALAD.pong` on the same transport |
//!
//! Rebinding a transport to a different machine is allowed and only logged:
//! identity discovery is best effort, not authentication.
//!
//! # Architecture
//!
//! ```text
//!  /dev/ttyUSB*  ──┐                    ┌──► SessionEndpoint (executor)
//!  socket_dir/*  ──┼──► Salad::run ─────┤
//!                  │    (one task)      └──► console port client (operator)
//!  console input ◄─┴──── SessionRegistry::send_to_console
//! ```
//!
//! Output of a machine nobody listens to is dropped with a warning: consoles
//! are never buffered.

pub mod registry;
pub mod transport;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use regex::bytes::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SaladConfig;
use crate::console::LineSplitter;

pub use registry::{CONSOLE_QUEUE_DEPTH, Delivery, SessionEndpoint, SessionRegistry};
use transport::{EventSender, TransportEvent, TransportEventKind, TransportHandle};

/// Result type for multiplexer operations.
pub type SaladResult<T> = Result<T, SaladError>;

#[derive(Debug, thiserror::Error)]
pub enum SaladError {
    /// A machine can only have one live session.
    #[error("A session is already active for machine {0}")]
    SessionAlreadyActive(String),

    #[error("Invalid marker pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub const PING_MARKER: &[u8] = b"SALAD.ping";
pub const PONG_REPLY: &[u8] = b"SALAD.pong\n";
const MACHINE_ID_MARKER: &str = r"SALAD\.machine_id=(\S+)";

/// How long a rejected console port client gets to read why.
const REJECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP ports exposing machine consoles, by machine id.
#[derive(Clone, Default)]
pub struct ConsolePorts(Arc<Mutex<BTreeMap<String, u16>>>);

impl ConsolePorts {
    pub fn get(&self, machine_id: &str) -> Option<u16> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(machine_id)
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u16> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn insert(&self, machine_id: &str, port: u16) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(machine_id.to_string(), port);
    }

    fn remove(&self, machine_id: &str) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(machine_id);
    }
}

/// Where a console transport comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Source {
    Serial(PathBuf),
    Unix(PathBuf),
}

impl Source {
    fn name(&self) -> String {
        match self {
            Source::Serial(path) => format!("serial:{}", path.display()),
            Source::Unix(path) => format!("unix:{}", path.display()),
        }
    }
}

/// A console transport and what SALAD knows about it.
struct Tracked {
    handle: TransportHandle,
    machine_id: Option<String>,
    splitter: LineSplitter,
    warned_unrouted: bool,
}

/// What a line of console output asks SALAD to do.
#[derive(Debug, Default, PartialEq)]
struct LineMarkers {
    ping: bool,
    machine_id: Option<String>,
}

pub struct Salad {
    config: SaladConfig,
    registry: Arc<SessionRegistry>,
    console_ports: ConsolePorts,
    machine_id_re: Regex,
    next_id: AtomicU64,
}

impl Salad {
    pub fn new(config: SaladConfig, registry: Arc<SessionRegistry>) -> SaladResult<Self> {
        Ok(Self {
            config,
            registry,
            console_ports: ConsolePorts::default(),
            machine_id_re: Regex::new(MACHINE_ID_MARKER)?,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn console_ports(&self) -> ConsolePorts {
        self.console_ports.clone()
    }

    fn scan_line(&self, line: &[u8]) -> LineMarkers {
        LineMarkers {
            ping: line
                .windows(PING_MARKER.len())
                .any(|window| window == PING_MARKER),
            machine_id: self
                .machine_id_re
                .captures(line)
                .and_then(|captures| captures.get(1))
                .map(|id| String::from_utf8_lossy(id.as_bytes()).into_owned()),
        }
    }

    /// Lists the console transports currently present on the host.
    fn discover(&self) -> HashSet<Source> {
        let mut found = HashSet::new();

        match std::fs::read_dir(&self.config.device_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if self
                        .config
                        .serial_prefixes
                        .iter()
                        .any(|prefix| name.starts_with(prefix.as_str()))
                    {
                        found.insert(Source::Serial(entry.path()));
                    }
                }
            }
            Err(e) => debug!("Cannot list {}: {}", self.config.device_dir.display(), e),
        }

        if let Ok(entries) = std::fs::read_dir(&self.config.socket_dir) {
            use std::os::unix::fs::FileTypeExt;
            for entry in entries.flatten() {
                if entry.file_type().is_ok_and(|t| t.is_socket()) {
                    found.insert(Source::Unix(entry.path()));
                }
            }
        }

        found
    }

    async fn open(&self, source: &Source, events: &EventSender) -> std::io::Result<TransportHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        match source {
            Source::Serial(path) => {
                transport::open_serial(id, path, self.config.baud_rate, events.clone())
            }
            Source::Unix(path) => transport::open_unix(id, path, events.clone()).await,
        }
    }

    /// Runs the multiplexer until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> SaladResult<()> {
        info!(
            "SALAD watching {} ({}) and {}",
            self.config.device_dir.display(),
            self.config.serial_prefixes.join(", "),
            self.config.socket_dir.display()
        );

        let (events_tx, mut events_rx) = mpsc::channel::<TransportEvent>(CONSOLE_QUEUE_DEPTH);
        let mut transports: HashMap<Source, Tracked> = HashMap::new();
        let mut failed: HashSet<Source> = HashSet::new();
        let mut console_listeners: HashMap<String, CancellationToken> = HashMap::new();

        let mut rescan =
            tokio::time::interval(Duration::from_millis(self.config.rescan_interval_ms.max(10)));
        rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = rescan.tick() => {
                    self.rescan(&mut transports, &mut failed, &events_tx).await;
                }

                Some(event) = events_rx.recv() => {
                    let Some((source, tracked)) = transports
                        .iter_mut()
                        .find(|(_, t)| t.handle.id() == event.id)
                    else {
                        continue;
                    };

                    match event.kind {
                        TransportEventKind::Data(data) => {
                            if let Some(machine_id) = self.handle_data(tracked, data) {
                                self.ensure_console_port(&machine_id, &mut console_listeners, &cancel)
                                    .await;
                            }
                        }
                        TransportEventKind::Closed => {
                            let source = source.clone();
                            self.drop_transport(&mut transports, &source);
                        }
                    }
                }
            }
        }

        for token in console_listeners.values() {
            token.cancel();
        }
        let sources: Vec<Source> = transports.keys().cloned().collect();
        for source in sources {
            self.drop_transport(&mut transports, &source);
        }

        info!("SALAD stopped");
        Ok(())
    }

    async fn rescan(
        &self,
        transports: &mut HashMap<Source, Tracked>,
        failed: &mut HashSet<Source>,
        events: &EventSender,
    ) {
        let present = self.discover();

        let gone: Vec<Source> = transports
            .keys()
            .filter(|source| !present.contains(*source))
            .cloned()
            .collect();
        for source in gone {
            info!("{} disappeared", source.name());
            self.drop_transport(transports, &source);
        }
        failed.retain(|source| present.contains(source));

        for source in present {
            if transports.contains_key(&source) {
                continue;
            }

            match self.open(&source, events).await {
                Ok(handle) => {
                    info!("Opened console {}", handle.name());
                    failed.remove(&source);
                    transports.insert(
                        source,
                        Tracked {
                            handle,
                            machine_id: None,
                            splitter: LineSplitter::new(),
                            warned_unrouted: false,
                        },
                    );
                }
                Err(e) => {
                    if failed.insert(source.clone()) {
                        warn!("Failed to open {}: {}", source.name(), e);
                    } else {
                        debug!("Still cannot open {}: {}", source.name(), e);
                    }
                }
            }
        }
    }

    fn drop_transport(&self, transports: &mut HashMap<Source, Tracked>, source: &Source) {
        if let Some(tracked) = transports.remove(source) {
            if let Some(machine_id) = &tracked.machine_id {
                self.registry
                    .unbind_console(machine_id, tracked.handle.name());
            }
            debug!("Closed console {}", tracked.handle.name());
        }
    }

    /// Processes console output. Returns the machine id the transport got
    /// bound to, if the chunk changed it.
    fn handle_data(&self, tracked: &mut Tracked, data: Bytes) -> Option<String> {
        let mut rebound = None;

        for line in tracked.splitter.push(&data) {
            let markers = self.scan_line(&line);

            if markers.ping {
                debug!("{}: ping", tracked.handle.name());
                tracked.handle.write(Bytes::from_static(PONG_REPLY));
            }

            if let Some(machine_id) = markers.machine_id
                && tracked.machine_id.as_deref() != Some(machine_id.as_str())
            {
                if let Some(previous) = tracked.machine_id.take() {
                    warn!(
                        "{}: machine id changed from {} to {}",
                        tracked.handle.name(),
                        previous,
                        machine_id
                    );
                    self.registry
                        .unbind_console(&previous, tracked.handle.name());
                } else {
                    info!("{}: machine {}", tracked.handle.name(), machine_id);
                }

                if let Some(other) = self.registry.bind_console(
                    &machine_id,
                    tracked.handle.name(),
                    tracked.handle.writer(),
                ) {
                    warn!(
                        "Machine {} moved from {} to {}",
                        machine_id,
                        other,
                        tracked.handle.name()
                    );
                }
                tracked.machine_id = Some(machine_id.clone());
                tracked.warned_unrouted = false;
                rebound = Some(machine_id);
            }
        }

        match &tracked.machine_id {
            Some(machine_id) => match self.registry.dispatch(machine_id, data) {
                Delivery::Sent => tracked.warned_unrouted = false,
                _ if tracked.warned_unrouted => {}
                Delivery::QueueFull => {
                    warn!(
                        "{}: the session of {} is not keeping up, dropping console output",
                        tracked.handle.name(),
                        machine_id
                    );
                    tracked.warned_unrouted = true;
                }
                Delivery::NoReceiver => {
                    warn!(
                        "{}: no session for machine {}, dropping console output",
                        tracked.handle.name(),
                        machine_id
                    );
                    tracked.warned_unrouted = true;
                }
            },
            None => debug!(
                "{}: {} bytes from an unidentified console",
                tracked.handle.name(),
                data.len()
            ),
        }

        rebound
    }

    /// Exposes the console of `machine_id` on its own TCP port.
    async fn ensure_console_port(
        &self,
        machine_id: &str,
        listeners: &mut HashMap<String, CancellationToken>,
        cancel: &CancellationToken,
    ) {
        if listeners.contains_key(machine_id) {
            return;
        }

        let listener = match TcpListener::bind((self.config.bind_address.as_str(), 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Cannot open a console port for {}: {}", machine_id, e);
                return;
            }
        };

        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!("Cannot open a console port for {}: {}", machine_id, e);
                return;
            }
        };

        info!("Console of {} available on port {}", machine_id, port);
        self.console_ports.insert(machine_id, port);

        let token = cancel.child_token();
        listeners.insert(machine_id.to_string(), token.clone());

        let registry = self.registry.clone();
        let ports = self.console_ports.clone();
        let machine_id = machine_id.to_string();
        tokio::spawn(async move {
            serve_console_port(listener, &machine_id, registry, token).await;
            ports.remove(&machine_id);
        });
    }
}

async fn serve_console_port(
    listener: TcpListener,
    machine_id: &str,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Console port of {}: accept failed: {}", machine_id, e);
                    continue;
                }
            },
        };

        match registry.register(machine_id) {
            Ok(endpoint) => {
                info!("{} attached to the console of {}", peer, machine_id);
                tokio::spawn(pump_console_client(
                    stream,
                    endpoint,
                    registry.clone(),
                    cancel.clone(),
                ));
            }
            Err(e) => {
                debug!("Rejected {}: {}", peer, e);
                tokio::spawn(reject_console_client(stream, peer, e.to_string()));
            }
        }
    }
}

/// Tells a console port client why it cannot attach, then hangs up.
async fn reject_console_client(mut stream: TcpStream, peer: SocketAddr, reason: String) {
    let reply = format!("{}\n", reason);
    match tokio::time::timeout(REJECT_TIMEOUT, stream.write_all(reply.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to tell {} it was rejected: {}", peer, e),
        Err(_) => warn!("Timed out telling {} it was rejected", peer),
    }
    if let Err(e) = stream.shutdown().await {
        debug!("Failed to close the connection of {}: {}", peer, e);
    }
}

/// Shuttles bytes between a console port client and the machine console.
async fn pump_console_client(
    stream: TcpStream,
    mut endpoint: SessionEndpoint,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            output = endpoint.recv() => {
                let Some(output) = output else { break };
                if write_half.write_all(&output).await.is_err() {
                    break;
                }
            }

            input = read_half.read(&mut buf) => {
                match input {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        match registry.send_to_console(endpoint.machine_id(), data) {
                            Delivery::Sent => {}
                            Delivery::QueueFull => {
                                warn!("Console of {} is stalled, dropping input", endpoint.machine_id());
                            }
                            Delivery::NoReceiver => {
                                debug!("Console of {} is not connected", endpoint.machine_id());
                            }
                        }
                    }
                }
            }
        }
    }

    registry.unregister(&endpoint);
    debug!("Client detached from the console of {}", endpoint.machine_id());
}
