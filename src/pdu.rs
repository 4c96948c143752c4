//! Power distribution units.
//!
//! Every DUT is plugged into one outlet ("port") of a network-controlled
//! power strip. The executor only needs two capabilities from a PDU: read the
//! state of a port and switch it. Vendor specifics live behind the [`Pdu`]
//! trait and a driver is picked once, when the fleet configuration is loaded.
//!
//! # Built-in Drivers
//!
//! | Driver | Module | Description |
//! |--------|--------|-------------|
//! | `dummy` | [`dummy`] | In-memory ports, for dry runs and tests |
//! | `vpdu` | [`vpdu`] | TCP client of the virtual PDU protocol |
//! | `command` | [`command`] | Shells out to vendor tooling |
//!
//! [`PduPort`] wraps one outlet and enforces the minimum off time a machine
//! must spend unpowered before it is switched back on.

pub mod command;
pub mod dummy;
pub mod port;
pub mod vpdu;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{PduConfig, PduDriverConfig};

pub use port::PduPort;

/// Result type for PDU operations.
pub type PduResult<T> = Result<T, PduError>;

/// Errors raised while talking to a PDU.
///
/// All of these are transient from the executor's point of view: the job is
/// aborted and the machine stays in the fleet.
#[derive(Debug, thiserror::Error)]
pub enum PduError {
    /// The PDU has no port with this id.
    #[error("PDU '{pdu}' has no port '{port}'")]
    UnknownPort { pdu: String, port: String },

    /// The driver could not carry out the request.
    #[error("PDU command failed: {0}")]
    CommandFailed(String),

    /// The PDU answered with something we do not understand.
    #[error("PDU protocol error: {0}")]
    Protocol(String),

    /// The PDU did not answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No PDU with this name is configured.
    #[error("Unknown PDU: {0}")]
    UnknownPdu(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The state of an outlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortState {
    On,
    Off,
    Reboot,
    Unknown,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::On => "ON",
            PortState::Off => "OFF",
            PortState::Reboot => "REBOOT",
            PortState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortState {
    type Err = PduError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(PortState::On),
            "OFF" => Ok(PortState::Off),
            "REBOOT" => Ok(PortState::Reboot),
            "UNKNOWN" => Ok(PortState::Unknown),
            other => Err(PduError::Protocol(format!("Unknown port state: {}", other))),
        }
    }
}

/// A network-controllable power strip.
#[async_trait]
pub trait Pdu: Send + Sync {
    /// Name of the PDU, as referenced by the machine inventory.
    fn name(&self) -> &str;

    /// Ids of every port of the PDU.
    async fn ports(&self) -> PduResult<Vec<String>>;

    async fn get_port_state(&self, port_id: &str) -> PduResult<PortState>;

    async fn set_port_state(&self, port_id: &str, state: PortState) -> PduResult<()>;
}

/// Instantiates the driver selected by a `[[pdus]]` entry.
pub fn create(config: &PduConfig) -> PduResult<Arc<dyn Pdu>> {
    let pdu: Arc<dyn Pdu> = match &config.driver {
        PduDriverConfig::Dummy { ports } => Arc::new(dummy::DummyPdu::new(&config.name, *ports)),
        PduDriverConfig::Vpdu {
            address,
            timeout_secs,
        } => Arc::new(vpdu::VpduClient::new(&config.name, address.clone()).with_timeout(
            std::time::Duration::from_secs(*timeout_secs),
        )),
        PduDriverConfig::Command {
            set_command,
            get_command,
            ports,
            timeout_secs,
        } => Arc::new(
            command::CommandPdu::new(&config.name, set_command.clone(), get_command.clone())
                .with_ports(ports.clone())
                .with_timeout(std::time::Duration::from_secs(*timeout_secs)),
        ),
    };
    Ok(pdu)
}

/// Instantiates every configured PDU, keyed by name.
pub fn create_all(configs: &[PduConfig]) -> PduResult<BTreeMap<String, Arc<dyn Pdu>>> {
    let mut pdus = BTreeMap::new();
    for config in configs {
        if pdus.insert(config.name.clone(), create(config)?).is_some() {
            warn!("PDU {} is configured twice, keeping the last entry", config.name);
        }
    }
    Ok(pdus)
}
