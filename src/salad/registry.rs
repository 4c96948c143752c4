//! The routing table shared by the multiplexer and the executors.
//!
//! Two maps keyed by machine id:
//!
//! - **sessions**: who receives the console output of a machine. Executors
//!   register one while they run a job; per-machine console ports register
//!   one per connected operator.
//! - **consoles**: where input for a machine goes. The multiplexer binds a
//!   transport once it learns which machine is behind it.
//!
//! A session is over when its [`SessionEndpoint`] is dropped or explicitly
//! unregistered. Only one live session per machine is allowed.
//!
//! Both directions go through queues of [`CONSOLE_QUEUE_DEPTH`] chunks. A
//! chunk that does not fit is dropped rather than stalling the sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use super::{SaladError, SaladResult};

/// Chunks of console data queued per direction before data is dropped.
pub const CONSOLE_QUEUE_DEPTH: usize = 256;

/// What happened to a chunk handed to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The receiver is not keeping up; the chunk was dropped.
    QueueFull,
    /// Nobody is listening; the chunk was dropped.
    NoReceiver,
}

impl Delivery {
    pub fn is_sent(self) -> bool {
        self == Delivery::Sent
    }
}

struct SessionEntry {
    generation: u64,
    tx: mpsc::Sender<Bytes>,
}

impl SessionEntry {
    fn is_over(&self) -> bool {
        self.tx.is_closed()
    }
}

struct ConsoleEntry {
    transport: String,
    tx: mpsc::Sender<Bytes>,
}

/// The receiving end of a registered session.
pub struct SessionEndpoint {
    machine_id: String,
    generation: u64,
    rx: mpsc::Receiver<Bytes>,
}

impl SessionEndpoint {
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Waits for the next chunk of console output.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    consoles: Mutex<HashMap<String, ConsoleEntry>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn consoles(&self) -> MutexGuard<'_, HashMap<String, ConsoleEntry>> {
        self.consoles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers the session receiving the console output of `machine_id`.
    ///
    /// # Errors
    ///
    /// [`SaladError::SessionAlreadyActive`] if a previous session for the
    /// machine is not over yet.
    pub fn register(&self, machine_id: &str) -> SaladResult<SessionEndpoint> {
        let mut sessions = self.sessions();

        if let Some(existing) = sessions.get(machine_id)
            && !existing.is_over()
        {
            return Err(SaladError::SessionAlreadyActive(machine_id.to_string()));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(CONSOLE_QUEUE_DEPTH);
        sessions.insert(machine_id.to_string(), SessionEntry { generation, tx });
        debug!("Registered session {} for {}", generation, machine_id);

        Ok(SessionEndpoint {
            machine_id: machine_id.to_string(),
            generation,
            rx,
        })
    }

    /// Removes the session of `endpoint`, leaving any newer one in place.
    pub fn unregister(&self, endpoint: &SessionEndpoint) {
        let mut sessions = self.sessions();
        if sessions
            .get(&endpoint.machine_id)
            .is_some_and(|entry| entry.generation == endpoint.generation)
        {
            sessions.remove(&endpoint.machine_id);
            debug!("Unregistered session {} for {}", endpoint.generation, endpoint.machine_id);
        }
    }

    pub fn has_session(&self, machine_id: &str) -> bool {
        self.sessions()
            .get(machine_id)
            .is_some_and(|entry| !entry.is_over())
    }

    /// Delivers console output to the session of `machine_id`.
    pub fn dispatch(&self, machine_id: &str, data: Bytes) -> Delivery {
        let mut sessions = self.sessions();
        let Some(entry) = sessions.get(machine_id) else {
            return Delivery::NoReceiver;
        };

        match entry.tx.try_send(data) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::QueueFull,
            Err(TrySendError::Closed(_)) => {
                sessions.remove(machine_id);
                Delivery::NoReceiver
            }
        }
    }

    /// Binds the console input of `machine_id` to a transport.
    ///
    /// Returns the transport it was previously bound to, if any.
    pub fn bind_console(
        &self,
        machine_id: &str,
        transport: &str,
        tx: mpsc::Sender<Bytes>,
    ) -> Option<String> {
        self.consoles()
            .insert(
                machine_id.to_string(),
                ConsoleEntry {
                    transport: transport.to_string(),
                    tx,
                },
            )
            .map(|previous| previous.transport)
            .filter(|previous| previous != transport)
    }

    /// Unbinds `machine_id` if it is still bound to `transport`.
    pub fn unbind_console(&self, machine_id: &str, transport: &str) {
        let mut consoles = self.consoles();
        if consoles
            .get(machine_id)
            .is_some_and(|entry| entry.transport == transport)
        {
            consoles.remove(machine_id);
        }
    }

    pub fn console_transport(&self, machine_id: &str) -> Option<String> {
        self.consoles()
            .get(machine_id)
            .map(|entry| entry.transport.clone())
    }

    /// Sends session input to the console of `machine_id`.
    pub fn send_to_console(&self, machine_id: &str, data: Bytes) -> Delivery {
        let consoles = self.consoles();
        let Some(entry) = consoles.get(machine_id) else {
            return Delivery::NoReceiver;
        };

        match entry.tx.try_send(data) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::QueueFull,
            Err(TrySendError::Closed(_)) => Delivery::NoReceiver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_session_is_rejected_while_first_is_live() {
        let registry = SessionRegistry::new();
        let first = registry.register("m1").unwrap();

        assert!(matches!(
            registry.register("m1"),
            Err(SaladError::SessionAlreadyActive(id)) if id == "m1"
        ));

        registry.unregister(&first);
        assert!(registry.register("m1").is_ok());
    }

    #[test]
    fn test_dropped_endpoint_ends_the_session() {
        let registry = SessionRegistry::new();
        let first = registry.register("m1").unwrap();
        assert!(registry.has_session("m1"));

        drop(first);
        assert!(!registry.has_session("m1"));
        assert!(registry.register("m1").is_ok());
    }

    #[test]
    fn test_stale_unregister_keeps_newer_session() {
        let registry = SessionRegistry::new();
        let first = registry.register("m1").unwrap();
        registry.unregister(&first);
        let _second = registry.register("m1").unwrap();

        registry.unregister(&first);
        assert!(registry.has_session("m1"));
    }

    #[test]
    fn test_sessions_are_per_machine() {
        let registry = SessionRegistry::new();
        let _a = registry.register("a").unwrap();
        assert!(registry.register("b").is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_reaches_session() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.dispatch("m1", Bytes::from_static(b"lost")),
            Delivery::NoReceiver
        );

        let mut endpoint = registry.register("m1").unwrap();
        assert!(registry.dispatch("m1", Bytes::from_static(b"hello")).is_sent());
        assert_eq!(endpoint.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_console_binding() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::channel(CONSOLE_QUEUE_DEPTH);

        assert_eq!(
            registry.send_to_console("m1", Bytes::from_static(b"x")),
            Delivery::NoReceiver
        );
        assert_eq!(registry.bind_console("m1", "serial:/dev/ttyUSB0", tx.clone()), None);
        assert!(registry.send_to_console("m1", Bytes::from_static(b"ls\n")).is_sent());
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"ls\n"));

        assert_eq!(
            registry.bind_console("m1", "unix:/run/m1.sock", tx),
            Some("serial:/dev/ttyUSB0".to_string())
        );

        // Stale transports cannot unbind the current one.
        registry.unbind_console("m1", "serial:/dev/ttyUSB0");
        assert_eq!(
            registry.console_transport("m1").as_deref(),
            Some("unix:/run/m1.sock")
        );
        registry.unbind_console("m1", "unix:/run/m1.sock");
        assert!(registry.console_transport("m1").is_none());
    }

    #[tokio::test]
    async fn test_slow_session_drops_output_without_blocking() {
        let registry = SessionRegistry::new();
        let mut endpoint = registry.register("m1").unwrap();

        for _ in 0..CONSOLE_QUEUE_DEPTH {
            assert!(registry.dispatch("m1", Bytes::from_static(b"x")).is_sent());
        }
        assert_eq!(
            registry.dispatch("m1", Bytes::from_static(b"overflow")),
            Delivery::QueueFull
        );
        assert!(registry.has_session("m1"));

        // Draining makes room again.
        assert_eq!(endpoint.recv().await.unwrap(), Bytes::from_static(b"x"));
        assert!(registry.dispatch("m1", Bytes::from_static(b"y")).is_sent());
    }

    #[test]
    fn test_stalled_console_drops_input() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.bind_console("m1", "unix:/run/m1.sock", tx);

        assert!(registry.send_to_console("m1", Bytes::from_static(b"a")).is_sent());
        assert_eq!(
            registry.send_to_console("m1", Bytes::from_static(b"b")),
            Delivery::QueueFull
        );
    }
}
