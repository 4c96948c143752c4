//! PDU driver delegating to external commands.
//!
//! Vendor tooling (SNMP scripts, IPMI wrappers, smart plug CLIs) is kept out
//! of the crate. The driver runs user-defined command templates:
//!
//! - `set_command`: switches a port; `{port}` and `{state}` are substituted
//!   (`{state}` is one of `ON`, `OFF`, `REBOOT`).
//! - `get_command`: prints the port state (`on`/`off`, case-insensitive) on
//!   the last line of stdout; `{port}` is substituted.
//!
//! A non-zero exit status is a [`PduError::CommandFailed`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Pdu, PduError, PduResult, PortState};

pub struct CommandPdu {
    name: String,
    set_command: String,
    get_command: String,
    ports: Vec<String>,
    timeout: Duration,
}

impl CommandPdu {
    pub fn new(
        name: impl Into<String>,
        set_command: impl Into<String>,
        get_command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            set_command: set_command.into(),
            get_command: get_command.into(),
            ports: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_ports(mut self, ports: Vec<String>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs a command line and returns its stdout.
    async fn run(&self, command: &str) -> PduResult<String> {
        let parts = shell_words::split(command)
            .map_err(|e| PduError::CommandFailed(format!("Invalid command '{}': {}", command, e)))?;
        let Some((program, args)) = parts.split_first() else {
            return Err(PduError::CommandFailed("Empty command".to_string()));
        };

        debug!("Running PDU command: {:?}", parts);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| PduError::Timeout(format!("PDU command timed out: {}", command)))?
            .map_err(|e| PduError::CommandFailed(format!("Failed to run '{}': {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("PDU command failed: {}", stderr.trim());
            return Err(PduError::CommandFailed(format!(
                "'{}' exited with {}: {}",
                command,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Pdu for CommandPdu {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ports(&self) -> PduResult<Vec<String>> {
        Ok(self.ports.clone())
    }

    async fn get_port_state(&self, port_id: &str) -> PduResult<PortState> {
        let command = self.get_command.replace("{port}", port_id);
        let stdout = self.run(&command).await?;

        let last = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("");
        Ok(last.parse().unwrap_or(PortState::Unknown))
    }

    async fn set_port_state(&self, port_id: &str, state: PortState) -> PduResult<()> {
        let command = self
            .set_command
            .replace("{port}", port_id)
            .replace("{state}", state.as_str());
        self.run(&command).await?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_parses_last_line() {
        let pdu = CommandPdu::new("cmd", "true", "printf 'probing {port}\\nOn\\n'");
        assert_eq!(pdu.get_port_state("3").await.unwrap(), PortState::On);
    }

    #[tokio::test]
    async fn test_unparseable_state_is_unknown() {
        let pdu = CommandPdu::new("cmd", "true", "echo banana");
        assert_eq!(pdu.get_port_state("1").await.unwrap(), PortState::Unknown);
    }

    #[tokio::test]
    async fn test_set_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("port-{port}-{state}");
        let pdu = CommandPdu::new(
            "cmd",
            format!("touch {}", marker.display()),
            "echo off",
        );

        pdu.set_port_state("4", PortState::Off).await.unwrap();
        assert!(dir.path().join("port-4-OFF").exists());
    }

    #[tokio::test]
    async fn test_failing_command_is_an_error() {
        let pdu = CommandPdu::new("cmd", "false", "false");
        assert!(matches!(
            pdu.set_port_state("0", PortState::On).await,
            Err(PduError::CommandFailed(_))
        ));
    }
}
