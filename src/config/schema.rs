//! Configuration schema definitions for dutctl.
//!
//! This module defines all configuration types that can be deserialized from
//! the fleet configuration file (`dutctl.toml`) and from the machine
//! inventory (`machines.toml`). Tagged enums select the PDU driver and the
//! boot service.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── ExecutorConfig        - Submission endpoint, boot loop tuning
//! ├── SaladConfig           - Console discovery and per-machine ports
//! ├── BootConfig            - Tagged enum selecting the boot service
//! │   ├── None              - Log only
//! │   └── Directory         - One JSON file per machine
//! ├── StorageConfig         - Job buckets and their credentials
//! ├── [PduConfig]           - Named PDUs
//! │   └── PduDriverConfig   - Tagged enum: dummy, vpdu, command
//! └── InventoryConfig       - Where machines.toml lives
//!
//! Inventory (machines.toml)
//! └── [MachineEntry]        - id, tags, PDU port
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for dutctl.
///
/// Every section is optional; an empty file describes an executor with no
/// PDUs and no machines.
///
/// # TOML Structure
///
/// ```toml
/// [executor]
/// listen = "0.0.0.0:8100"
///
/// [salad]
/// serial_prefixes = ["ttyUSB"]
///
/// [boot]
/// type = "directory"
/// path = "/srv/tftp/dutctl"
///
/// [storage]
/// root = "/srv/jobs"
///
/// [[pdus]]
/// name = "rack1"
/// driver = "vpdu"
/// address = "10.0.0.2:9000"
///
/// [inventory]
/// path = "/etc/dutctl/machines.toml"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub salad: SaladConfig,

    #[serde(default)]
    pub boot: BootConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pdus: Vec<PduConfig>,

    #[serde(default)]
    pub inventory: InventoryConfig,
}

/// Executor settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `listen` | `127.0.0.1:8100` |
/// | `poll_interval_ms` | 100 |
/// | `callback_timeout_secs` | 10 |
/// | `log_dir` | None |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Address of the job submission endpoint.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Upper bound on how long the boot loop sleeps between checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long to wait when connecting back to a submitting client.
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,

    /// Where job console logs are kept when the job has no bucket.
    pub log_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            poll_interval_ms: default_poll_interval_ms(),
            callback_timeout_secs: default_callback_timeout(),
            log_dir: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8100".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_callback_timeout() -> u64 {
    10
}

/// Console multiplexer settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SaladConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often serial devices and console sockets are rescanned.
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,

    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,

    /// Device name prefixes treated as DUT consoles (`ttyUSB0`, ...).
    #[serde(default = "default_serial_prefixes")]
    pub serial_prefixes: Vec<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Directory of Unix sockets exposed by emulated machines.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Address the per-machine console ports are bound to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for SaladConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rescan_interval_ms: default_rescan_interval_ms(),
            device_dir: default_device_dir(),
            serial_prefixes: default_serial_prefixes(),
            baud_rate: default_baud_rate(),
            socket_dir: default_socket_dir(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_rescan_interval_ms() -> u64 {
    1000
}

fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_serial_prefixes() -> Vec<String> {
    vec!["ttyUSB".to_string(), "ttyACM".to_string()]
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/run/dutctl/consoles")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

/// Boot service selection.
///
/// ```toml
/// [boot]
/// type = "directory"
/// path = "/srv/tftp/dutctl"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BootConfig {
    #[default]
    None,
    Directory {
        path: PathBuf,
    },
}

/// Job bucket storage.
///
/// Without a `root`, jobs run without a bucket. When `access_key` is set,
/// submissions must present matching credentials.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    pub root: Option<PathBuf>,

    pub access_key: Option<String>,

    pub secret_key: Option<String>,

    /// Groups a submission may ask to be added to.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// A named PDU.
///
/// ```toml
/// [[pdus]]
/// name = "bench"
/// driver = "command"
/// set_command = "snmp-pdu --port {port} {state}"
/// get_command = "snmp-pdu --port {port} status"
/// ports = ["1", "2", "3"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PduConfig {
    pub name: String,

    #[serde(flatten)]
    pub driver: PduDriverConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum PduDriverConfig {
    Dummy {
        #[serde(default = "default_dummy_ports")]
        ports: usize,
    },
    Vpdu {
        address: String,
        #[serde(default = "default_pdu_timeout")]
        timeout_secs: u64,
    },
    Command {
        set_command: String,
        get_command: String,
        #[serde(default)]
        ports: Vec<String>,
        #[serde(default = "default_pdu_timeout")]
        timeout_secs: u64,
    },
}

fn default_dummy_ports() -> usize {
    8
}

fn default_pdu_timeout() -> u64 {
    10
}

/// Machine inventory sync.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InventoryConfig {
    pub path: Option<PathBuf>,

    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            path: None,
            sync_interval_secs: default_sync_interval(),
        }
    }
}

fn default_sync_interval() -> u64 {
    30
}

/// The machine inventory file.
///
/// ```toml
/// [[machines]]
/// id = "52:54:00:11:22:01"
/// tags = ["amdgpu:gfx1030"]
/// pdu = "rack1"
/// port_id = "3"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Inventory {
    #[serde(default)]
    pub machines: Vec<MachineEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MachineEntry {
    pub id: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Name of the PDU the machine is plugged into.
    pub pdu: Option<String>,

    pub port_id: Option<String>,

    #[serde(default = "default_min_off_time")]
    pub min_off_time_secs: f64,

    /// Console device of the machine, exposed to job templates.
    pub local_tty_device: Option<String>,
}

fn default_min_off_time() -> f64 {
    5.0
}
