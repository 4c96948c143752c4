//! dutctl: runs CI jobs on a fleet of physical test machines.
//!
//! A job power-cycles its machine through a PDU, network boots the
//! requested kernel and watches the serial console to decide how the job
//! went. Failed boot cycles are retried under the job's timeout policy.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **PDU** ([`pdu`]): power outlets behind a driver trait, with
//!   `min_off_time` enforcement in [`pdu::PduPort`]
//! - **Timeouts** ([`timeout`]): retryable timers, fixed slots and watchdogs
//! - **Console** ([`console`]): regex patterns classifying console lines
//! - **SALAD** ([`salad`]): the console multiplexer routing serial streams
//!   to job sessions by machine id
//! - **Machines** ([`machine`]): one executor task per machine running the
//!   boot-retry loop
//! - **Fleet** ([`fleet`], [`submit`], [`inventory`]): machine registry,
//!   job submission and inventory sync
//! - **Client** ([`client`], [`protocol`]): submits a job and proxies its
//!   console session
//!
//! # Example
//!
//! ```no_run
//! use dutctl::config::load_config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("dutctl.toml"))?;
//!     println!("Accepting jobs on {}", config.executor.listen);
//!     // ... build the registry, fleet and multiplexer ...
//!     Ok(())
//! }
//! ```

pub mod boot;
pub mod bucket;
pub mod client;
pub mod config;
pub mod console;
pub mod fleet;
pub mod inventory;
pub mod job;
pub mod machine;
pub mod pdu;
pub mod protocol;
pub mod salad;
pub mod session;
pub mod status;
pub mod submit;
pub mod timeout;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use console::{ConsoleState, Pattern};
pub use fleet::{Fleet, SubmitError};
pub use job::Job;
pub use machine::{Machine, MachineState};
pub use pdu::{Pdu, PduPort, PortState};
pub use status::JobStatus;
pub use timeout::{Timeout, Timeouts};
