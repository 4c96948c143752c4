//! Network boot configuration.
//!
//! Before each boot cycle the executor tells the boot service what the
//! machine should boot. Generating DHCP/TFTP configuration is left to
//! external tooling; the `directory` service drops one JSON file per machine
//! that such tooling can watch.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::config::BootConfig;
use crate::job::Deployment;

/// Result type for boot service operations.
pub type BootResult<T> = Result<T, BootError>;

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("Failed to write boot configuration for {machine_id}: {source}")]
    Write {
        machine_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode boot configuration: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Something that can make a machine network boot a [`Deployment`].
#[async_trait]
pub trait BootService: Send + Sync {
    async fn configure(&self, machine_id: &str, deployment: &Deployment) -> BootResult<()>;
}

/// Builds the boot service selected in the configuration.
pub fn create(config: &BootConfig) -> Arc<dyn BootService> {
    match config {
        BootConfig::None => Arc::new(NoBootService),
        BootConfig::Directory { path } => Arc::new(DirectoryBootService::new(path.clone())),
    }
}

/// Only logs what would be booted.
pub struct NoBootService;

#[async_trait]
impl BootService for NoBootService {
    async fn configure(&self, machine_id: &str, deployment: &Deployment) -> BootResult<()> {
        info!(
            "{}: boot {} (cmdline: {})",
            machine_id, deployment.kernel_url, deployment.kernel_cmdline
        );
        Ok(())
    }
}

/// Writes `<dir>/<machine_id>.json` for every boot cycle.
pub struct DirectoryBootService {
    dir: PathBuf,
}

#[derive(Serialize)]
struct BootEntry<'a> {
    machine_id: &'a str,
    kernel: &'a str,
    initramfs: Option<&'a str>,
    cmdline: &'a str,
}

impl DirectoryBootService {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, machine_id: &str) -> PathBuf {
        // MAC addresses are the usual ids; keep them filesystem friendly.
        let file_name: String = machine_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl BootService for DirectoryBootService {
    async fn configure(&self, machine_id: &str, deployment: &Deployment) -> BootResult<()> {
        let entry = BootEntry {
            machine_id,
            kernel: &deployment.kernel_url,
            initramfs: deployment.initramfs_url.as_deref(),
            cmdline: &deployment.kernel_cmdline,
        };
        let content = serde_json::to_string_pretty(&entry)?;

        let path = self.path_for(machine_id);
        let write_err = |source| BootError::Write {
            machine_id: machine_id.to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(write_err)?;
        // Write then rename so watchers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;

        info!("{}: boot configuration written to {}", machine_id, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Deployment {
        Deployment {
            kernel_url: "http://boot/vmlinuz".to_string(),
            initramfs_url: Some("http://boot/initrd".to_string()),
            kernel_cmdline: "console=ttyS0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_directory_service_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let service = DirectoryBootService::new(dir.path().join("boot"));

        service
            .configure("52:54:00:00:00:01", &deployment())
            .await
            .unwrap();

        let path = dir.path().join("boot").join("52-54-00-00-00-01.json");
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["machine_id"], "52:54:00:00:00:01");
        assert_eq!(value["kernel"], "http://boot/vmlinuz");
        assert_eq!(value["initramfs"], "http://boot/initrd");
        assert_eq!(value["cmdline"], "console=ttyS0");
    }

    #[tokio::test]
    async fn test_no_boot_service_succeeds() {
        let service = create(&BootConfig::None);
        service.configure("m", &deployment()).await.unwrap();
    }
}
