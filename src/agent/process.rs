//! OS-process proxy binding
//!
//! Drives a real data-plane binary as the supervised proxy: each epoch is a
//! child process launched with its own rendered config file and a
//! `--restart-epoch` flag, liveness is a TCP probe against the proxy's admin
//! port, and aborting an epoch kills its process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{EpochConfig, Proxy};
use crate::{Error, Result};

const LIVE_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Supervised external proxy process.
pub struct ProcessProxy {
    binary: PathBuf,
    config_dir: PathBuf,
    admin_addr: SocketAddr,
}

impl ProcessProxy {
    /// Create a binding for `binary`, writing per-epoch config files under
    /// `config_dir` and probing liveness on `admin_addr`.
    pub fn new(binary: impl Into<PathBuf>, config_dir: impl Into<PathBuf>, admin_addr: SocketAddr) -> Self {
        Self {
            binary: binary.into(),
            config_dir: config_dir.into(),
            admin_addr,
        }
    }

    fn config_path(&self, epoch: i64) -> PathBuf {
        self.config_dir.join(format!("proxy-config-{epoch}.json"))
    }
}

/// Render the config handed to one epoch. The drain sentinel becomes a
/// config that asks the proxy to stop accepting and wind down.
fn render_config(config: &EpochConfig<serde_json::Value>) -> serde_json::Value {
    match config {
        EpochConfig::Serve(value) => value.clone(),
        EpochConfig::Drain => serde_json::json!({ "drain": true }),
    }
}

/// Map a child exit status onto a run result. A SIGKILL death surfaces as
/// the well-known out-of-memory message.
fn exit_result(status: std::process::ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            if signal == 9 {
                return Err(Error::proxy(super::ERR_OUT_OF_MEMORY));
            }
            return Err(Error::proxy(format!("signal: {signal}")));
        }
    }
    Err(Error::proxy(format!(
        "exit status {}",
        status.code().unwrap_or(-1)
    )))
}

#[async_trait]
impl Proxy for ProcessProxy {
    type Config = serde_json::Value;

    fn is_live(&self) -> bool {
        std::net::TcpStream::connect_timeout(&self.admin_addr, LIVE_PROBE_TIMEOUT).is_ok()
    }

    async fn run(
        &self,
        config: EpochConfig<serde_json::Value>,
        epoch: i64,
        abort: oneshot::Receiver<Error>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        let path = self.config_path(epoch);
        let rendered = serde_json::to_vec_pretty(&render_config(&config))?;
        tokio::fs::write(&path, rendered).await?;

        info!(epoch, binary = %self.binary.display(), "launching proxy epoch");
        let mut child = tokio::process::Command::new(&self.binary)
            .arg("--config")
            .arg(&path)
            .arg("--restart-epoch")
            .arg(epoch.to_string())
            .spawn()
            .map_err(|e| Error::proxy(format!("failed to launch {}: {e}", self.binary.display())))?;

        tokio::select! {
            status = child.wait() => exit_result(status?),
            reason = abort => {
                let reason = reason.unwrap_or_else(|_| Error::cancelled("abort channel dropped"));
                warn!(epoch, %reason, "killing proxy epoch");
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(reason)
            }
        }
    }

    async fn cleanup(&self, epoch: i64) {
        let path = self.config_path(epoch);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(epoch, error = %e, "epoch config file already gone");
        }
    }
}
