//! In-memory PDU.
//!
//! Ports start OFF. Every state change is recorded so tests can assert on
//! the exact sequence of hardware calls.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{Pdu, PduError, PduResult, PortState};

pub struct DummyPdu {
    name: String,
    ports: Mutex<Vec<PortState>>,
    history: Mutex<Vec<(String, PortState)>>,
    set_calls: AtomicUsize,
    failing: AtomicBool,
}

impl DummyPdu {
    pub fn new(name: impl Into<String>, ports: usize) -> Self {
        Self {
            name: name.into(),
            ports: Mutex::new(vec![PortState::Off; ports]),
            history: Mutex::new(Vec::new()),
            set_calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Number of `set_port_state` calls that reached the PDU.
    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    /// Every `(port, state)` the PDU was asked to switch to, in order.
    pub fn history(&self) -> Vec<(String, PortState)> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    /// How many times `port_id` was switched to `state`.
    pub fn count(&self, port_id: &str, state: PortState) -> usize {
        self.history()
            .iter()
            .filter(|(port, s)| port == port_id && *s == state)
            .count()
    }

    /// While set, every port command fails as if the PDU were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> PduResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PduError::CommandFailed(format!(
                "dummy PDU {} is unreachable",
                self.name
            )));
        }
        Ok(())
    }

    pub fn state_of(&self, port_id: &str) -> Option<PortState> {
        let index = self.index(port_id).ok()?;
        self.ports.lock().ok().map(|ports| ports[index])
    }

    /// Changes a port behind the back of any [`PduPort`](super::PduPort).
    pub fn force_state(&self, port_id: &str, state: PortState) {
        if let (Ok(index), Ok(mut ports)) = (self.index(port_id), self.ports.lock()) {
            ports[index] = state;
        }
    }

    fn index(&self, port_id: &str) -> PduResult<usize> {
        let count = self.ports.lock().map(|ports| ports.len()).unwrap_or(0);
        port_id
            .parse::<usize>()
            .ok()
            .filter(|index| *index < count)
            .ok_or_else(|| PduError::UnknownPort {
                pdu: self.name.clone(),
                port: port_id.to_string(),
            })
    }
}

#[async_trait]
impl Pdu for DummyPdu {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ports(&self) -> PduResult<Vec<String>> {
        let count = self.ports.lock().map(|ports| ports.len()).unwrap_or(0);
        Ok((0..count).map(|i| i.to_string()).collect())
    }

    async fn get_port_state(&self, port_id: &str) -> PduResult<PortState> {
        self.check_reachable()?;
        let index = self.index(port_id)?;
        let ports = self
            .ports
            .lock()
            .map_err(|_| PduError::CommandFailed("port table poisoned".to_string()))?;
        Ok(ports[index])
    }

    async fn set_port_state(&self, port_id: &str, state: PortState) -> PduResult<()> {
        self.check_reachable()?;
        let index = self.index(port_id)?;
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        debug!("dummy PDU {}: port {} -> {}", self.name, port_id, state);

        if let Ok(mut history) = self.history.lock() {
            history.push((port_id.to_string(), state));
        }

        let mut ports = self
            .ports
            .lock()
            .map_err(|_| PduError::CommandFailed("port table poisoned".to_string()))?;
        // A reboot ends with the port powered.
        ports[index] = match state {
            PortState::Reboot => PortState::On,
            other => other,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ports_start_off() {
        let pdu = DummyPdu::new("pdu", 3);
        assert_eq!(pdu.ports().await.unwrap(), vec!["0", "1", "2"]);
        assert_eq!(pdu.get_port_state("2").await.unwrap(), PortState::Off);
    }

    #[tokio::test]
    async fn test_unknown_port_is_rejected() {
        let pdu = DummyPdu::new("pdu", 1);
        assert!(matches!(
            pdu.set_port_state("7", PortState::On).await,
            Err(PduError::UnknownPort { .. })
        ));
        assert_eq!(pdu.set_calls(), 0);
    }

    #[tokio::test]
    async fn test_history_is_recorded() {
        let pdu = DummyPdu::new("pdu", 2);
        pdu.set_port_state("1", PortState::On).await.unwrap();
        pdu.set_port_state("1", PortState::Reboot).await.unwrap();
        assert_eq!(pdu.count("1", PortState::On), 1);
        assert_eq!(pdu.state_of("1"), Some(PortState::On));
        assert_eq!(pdu.set_calls(), 2);
    }

    #[tokio::test]
    async fn test_failing_pdu_rejects_commands() {
        let pdu = DummyPdu::new("pdu", 1);
        pdu.set_failing(true);
        assert!(matches!(
            pdu.set_port_state("0", PortState::On).await,
            Err(PduError::CommandFailed(_))
        ));
        assert!(matches!(
            pdu.get_port_state("0").await,
            Err(PduError::CommandFailed(_))
        ));
        assert_eq!(pdu.set_calls(), 0);

        pdu.set_failing(false);
        pdu.set_port_state("0", PortState::On).await.unwrap();
        assert_eq!(pdu.state_of("0"), Some(PortState::On));
    }
}
