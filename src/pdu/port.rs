//! A single outlet bound to a machine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::{Pdu, PduResult, PortState};

/// One switched outlet of a [`Pdu`].
///
/// Owned by the executor of the machine plugged into it. Switching the port
/// ON never happens sooner than `min_off_time` after it was last seen going
/// OFF, and requests for the state the port is already in are not forwarded
/// to the hardware.
pub struct PduPort {
    pdu: Arc<dyn Pdu>,
    port_id: String,
    label: Option<String>,
    min_off_time: Duration,
    last_shutdown: Option<Instant>,
    last_known: PortState,
}

impl PduPort {
    pub fn new(pdu: Arc<dyn Pdu>, port_id: impl Into<String>, min_off_time: Duration) -> Self {
        Self {
            pdu,
            port_id: port_id.into(),
            label: None,
            min_off_time,
            last_shutdown: None,
            last_known: PortState::Unknown,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn pdu_name(&self) -> &str {
        self.pdu.name()
    }

    pub fn port_id(&self) -> &str {
        &self.port_id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn min_off_time(&self) -> Duration {
        self.min_off_time
    }

    pub fn last_shutdown(&self) -> Option<Instant> {
        self.last_shutdown
    }

    /// Whether this port drives the same outlet as `other`.
    pub fn same_outlet(&self, other: &PduPort) -> bool {
        self.pdu_name() == other.pdu_name() && self.port_id == other.port_id
    }

    /// Reads the state from the hardware.
    pub async fn state(&mut self) -> PduResult<PortState> {
        let state = self.pdu.get_port_state(&self.port_id).await?;
        self.observe(state);
        Ok(state)
    }

    /// Switches the port, waiting out `min_off_time` before powering on.
    pub async fn set(&mut self, state: PortState) -> PduResult<()> {
        let current = self.state().await?;
        if current == state {
            debug!("{} already {}, nothing to do", self, state);
            return Ok(());
        }

        if state == PortState::On
            && let Some(ready_at) = self.ready_at()
            && Instant::now() < ready_at
        {
            let wait = ready_at - Instant::now();
            info!("{}: waiting {:?} before powering on", self, wait);
            tokio::time::sleep_until(ready_at).await;
        }

        info!("{}: {} -> {}", self, current, state);
        self.pdu.set_port_state(&self.port_id, state).await?;
        self.observe(state);
        Ok(())
    }

    /// Earliest instant at which the port may be powered on again.
    pub fn ready_at(&self) -> Option<Instant> {
        self.last_shutdown
            .map(|shutdown| shutdown + self.min_off_time)
    }

    fn observe(&mut self, state: PortState) {
        if state == PortState::Off && self.last_known != PortState::Off {
            self.last_shutdown = Some(Instant::now());
        }
        self.last_known = state;
    }
}

impl fmt::Display for PduPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}/{} ({})", self.pdu_name(), self.port_id, label),
            None => write!(f, "{}/{}", self.pdu_name(), self.port_id),
        }
    }
}

impl fmt::Debug for PduPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PduPort")
            .field("pdu", &self.pdu_name())
            .field("port_id", &self.port_id)
            .field("label", &self.label)
            .field("min_off_time", &self.min_off_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::dummy::DummyPdu;

    #[tokio::test(start_paused = true)]
    async fn test_power_on_waits_for_min_off_time() {
        let pdu = Arc::new(DummyPdu::new("pdu", 2));
        let mut port = PduPort::new(pdu.clone(), "0", Duration::from_secs(5));

        port.set(PortState::On).await.unwrap();
        port.set(PortState::Off).await.unwrap();
        let off_at = Instant::now();

        port.set(PortState::On).await.unwrap();
        assert!(Instant::now() - off_at >= Duration::from_secs(5));
        assert_eq!(pdu.state_of("0"), Some(PortState::On));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_after_min_off_time_does_not_wait() {
        let pdu = Arc::new(DummyPdu::new("pdu", 1));
        let mut port = PduPort::new(pdu.clone(), "0", Duration::from_secs(5));

        port.set(PortState::Off).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let before = Instant::now();
        port.set(PortState::On).await.unwrap();
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_off_hits_hardware_once() {
        let pdu = Arc::new(DummyPdu::new("pdu", 1));
        pdu.force_state("0", PortState::On);
        let mut port = PduPort::new(pdu.clone(), "0", Duration::ZERO);

        port.set(PortState::Off).await.unwrap();
        port.set(PortState::Off).await.unwrap();
        assert_eq!(pdu.set_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observed_off_records_shutdown_once() {
        let pdu = Arc::new(DummyPdu::new("pdu", 1));
        let mut port = PduPort::new(pdu.clone(), "0", Duration::from_secs(1));

        assert_eq!(port.state().await.unwrap(), PortState::Off);
        let first = port.last_shutdown().unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        port.state().await.unwrap();
        assert_eq!(port.last_shutdown(), Some(first));
    }

    #[test]
    fn test_display_includes_label() {
        let pdu = Arc::new(DummyPdu::new("rack", 1));
        let port = PduPort::new(pdu, "0", Duration::ZERO).with_label("dut-1");
        assert_eq!(port.to_string(), "rack/0 (dut-1)");
    }
}
