//! Data-plane proxy supervisor
//!
//! Manages generations ("epochs") of a proxy process. A hot restart launches
//! a new process with a restart epoch exactly one greater than the highest
//! running epoch; older epochs drain themselves and exit on their own. The
//! supervisor never terminates an old epoch except during shutdown.
//!
//! The supervisor runs one control loop that receives epoch exits and the
//! shutdown signal. Restarts serialize on the agent state: a new epoch is
//! not launched until the current one is observed live (or the wait times
//! out).

pub mod process;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, warn};

use crate::lifecycle::ShutdownSignal;
use crate::{Error, Result};

/// How often the live probe is polled while waiting for an epoch.
pub const LIVE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long to wait for an epoch to go live before restarting anyway. The
/// proxy's own initialization timer sits below this.
pub const LIVE_WAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Exit message of a proxy killed by the OOM killer.
pub const ERR_OUT_OF_MEMORY: &str = "signal: killed";

/// Abort message delivered to epochs at termination.
pub const EPOCH_ABORTED: &str = "epoch aborted";

/// Configuration handed to an epoch: a serving config, or the sentinel
/// asking the proxy to drain connections.
#[derive(Debug, Clone, PartialEq)]
pub enum EpochConfig<C> {
    /// Serve with the given configuration.
    Serve(C),
    /// Drain in preparation for termination.
    Drain,
}

/// Command interface for the supervised proxy.
#[async_trait]
pub trait Proxy: Send + Sync + 'static {
    /// Configuration type; equality is the restart decision.
    type Config: Clone + PartialEq + Send + Sync + 'static;

    /// Whether the proxy is up and serving (past initialization).
    fn is_live(&self) -> bool;

    /// Run one epoch. Must block until the proxy exits; the abort channel
    /// asks the epoch to exit early.
    async fn run(
        &self,
        config: EpochConfig<Self::Config>,
        epoch: i64,
        abort: oneshot::Receiver<Error>,
    ) -> Result<()>;

    /// Release an epoch's resources. Invoked after `run` returns and before
    /// the exit is reported; must be prompt.
    async fn cleanup(&self, epoch: i64);
}

struct ExitStatus {
    epoch: i64,
    err: Option<Error>,
}

struct AgentState<C> {
    active: HashMap<i64, oneshot::Sender<Error>>,
    current_epoch: i64,
    current_config: Option<EpochConfig<C>>,
}

/// Supervisor over a [`Proxy`], tracking all running epochs.
pub struct Agent<P: Proxy> {
    proxy: Arc<P>,
    state: Mutex<AgentState<P::Config>>,
    status_tx: mpsc::Sender<ExitStatus>,
    status_rx: std::sync::Mutex<Option<mpsc::Receiver<ExitStatus>>>,
    termination_drain: Duration,
}

impl<P: Proxy> Agent<P> {
    /// Create a supervisor. No epoch exists until the first
    /// [`restart`](Agent::restart).
    pub fn new(proxy: Arc<P>, termination_drain_duration: Duration) -> Arc<Self> {
        let (status_tx, status_rx) = mpsc::channel(8);
        Arc::new(Self {
            proxy,
            state: Mutex::new(AgentState {
                active: HashMap::new(),
                current_epoch: -1,
                current_config: None,
            }),
            status_tx,
            status_rx: std::sync::Mutex::new(Some(status_rx)),
            termination_drain: termination_drain_duration,
        })
    }

    /// Epoch of the most recent proxy; -1 before the first start.
    pub async fn current_epoch(&self) -> i64 {
        self.state.lock().await.current_epoch
    }

    /// Number of epochs still running.
    pub async fn active_epochs(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Hot-restart with a new configuration. A configuration equal to the
    /// current one is a no-op; otherwise the call waits for the current
    /// epoch to go live, then launches the next epoch.
    pub async fn restart(&self, config: P::Config) {
        self.restart_with(EpochConfig::Serve(config)).await;
    }

    async fn restart_with(&self, config: EpochConfig<P::Config>) {
        // Holding the state lock across the live wait serializes restarts
        // and guarantees strictly ordered epoch starts.
        let mut state = self.state.lock().await;

        if state.current_config.as_ref() == Some(&config) {
            return;
        }

        info!("received new proxy config");
        self.wait_until_live(&state).await;

        state.current_epoch += 1;
        state.current_config = Some(config.clone());
        let epoch = state.current_epoch;

        let (abort_tx, abort_rx) = oneshot::channel();
        state.active.insert(epoch, abort_tx);

        let proxy = self.proxy.clone();
        let status_tx = self.status_tx.clone();
        tokio::spawn(async move {
            info!(epoch, "epoch starting");
            let result = proxy.run(config, epoch, abort_rx).await;
            // Cleanup runs before the exit is reported; the control loop
            // must observe a fully released epoch.
            proxy.cleanup(epoch).await;
            let _ = status_tx
                .send(ExitStatus {
                    epoch,
                    err: result.err(),
                })
                .await;
        });
    }

    async fn wait_until_live(&self, state: &AgentState<P::Config>) {
        if state.active.is_empty() {
            info!("no previous epoch exists, starting now");
            return;
        }

        info!(
            epoch = state.current_epoch,
            "waiting for epoch to go live before performing a hot restart"
        );

        if self.proxy.is_live() {
            return;
        }

        let timeout = tokio::time::sleep(LIVE_WAIT_TIMEOUT);
        tokio::pin!(timeout);
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + LIVE_POLL_INTERVAL,
            LIVE_POLL_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = &mut timeout => {
                    warn!(epoch = state.current_epoch, "timed out waiting for epoch to go live");
                    return;
                }
                _ = interval.tick() => {
                    if self.proxy.is_live() {
                        return;
                    }
                }
            }
        }
    }

    /// Control loop: processes epoch exits until all epochs are gone or the
    /// shutdown signal arrives, in which case the proxy is drained and every
    /// remaining epoch aborted.
    pub async fn run(&self, mut stop: ShutdownSignal) {
        info!("starting proxy agent");
        let mut status_rx = self
            .status_rx
            .lock()
            .expect("status lock poisoned")
            .take()
            .expect("agent control loop started twice");

        loop {
            tokio::select! {
                status = status_rx.recv() => {
                    let Some(status) = status else { return; };
                    match &status.err {
                        Some(err) => {
                            if err.to_string().contains(ERR_OUT_OF_MEMORY) {
                                warn!("proxy may have been out-of-memory killed, check memory usage and limits");
                            }
                            error!(epoch = status.epoch, error = %err, "epoch exited with error");
                        }
                        None => info!(epoch = status.epoch, "epoch exited normally"),
                    }

                    let active = {
                        let mut state = self.state.lock().await;
                        state.active.remove(&status.epoch);
                        state.active.len()
                    };
                    if active == 0 {
                        info!("no more active epochs, terminating");
                        return;
                    }
                    info!(active, "active epochs running");
                }
                _ = stop.recv() => {
                    self.terminate().await;
                    info!("agent has terminated");
                    return;
                }
            }
        }
    }

    async fn terminate(&self) {
        info!("agent draining proxy");
        self.restart_with(EpochConfig::Drain).await;
        info!(period = ?self.termination_drain, "graceful termination period starting");
        tokio::time::sleep(self.termination_drain).await;
        info!("graceful termination period complete, terminating remaining epochs");
        self.abort_all().await;
    }

    async fn abort_all(&self) {
        let mut state = self.state.lock().await;
        for (epoch, abort) in state.active.drain() {
            warn!(epoch, "aborting epoch");
            let _ = abort.send(Error::cancelled(EPOCH_ABORTED));
        }
        warn!("aborted all epochs");
    }
}
