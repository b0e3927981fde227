//! Daemon-wide state.
//!
//! The C lineage of this program kept configuration, the local node
//! record and the monitoring state in file-scope globals. Here they live
//! in one context struct passed by reference; the only genuinely global
//! state is the pair of signal flags, which stay atomic.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use repmgr_core::catalog::{events, rpc};
use repmgr_core::config::Config;
use repmgr_core::pool::DbConn;
use repmgr_core::shared_state::SharedState;
use repmgr_proto::event::event_type;
use repmgr_proto::node::{MonitoringState, NodeRecord};

/// Process-wide signal flags, set from the signal stream tasks and read
/// at the top of each monitoring tick.
#[derive(Debug, Default)]
pub struct SignalFlags {
    got_sigterm: AtomicBool,
    got_sighup: AtomicBool,
}

impl SignalFlags {
    pub fn terminate_requested(&self) -> bool {
        self.got_sigterm.load(Ordering::Relaxed)
    }

    pub fn reload_requested(&self) -> bool {
        self.got_sighup.swap(false, Ordering::Relaxed)
    }

    /// Spawn listener tasks feeding the flags.
    pub fn install(flags: &Arc<Self>) {
        let flags_term = Arc::clone(flags);
        tokio::spawn(async move {
            let mut stream = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("unable to install SIGTERM handler: {}", e);
                    return;
                }
            };
            stream.recv().await;
            flags_term.got_sigterm.store(true, Ordering::Relaxed);
        });

        let flags_hup = Arc::clone(flags);
        tokio::spawn(async move {
            let mut stream = match signal(SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("unable to install SIGHUP handler: {}", e);
                    return;
                }
            };
            loop {
                stream.recv().await;
                flags_hup.got_sighup.store(true, Ordering::Relaxed);
            }
        });
    }
}

/// Why a role loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// SIGTERM observed; shut down.
    Terminate,
    /// The node's role changed (promotion, follow to a new upstream);
    /// re-dispatch from the top.
    RoleChange,
}

/// Shared daemon context.
pub struct Daemon {
    pub config: Config,
    pub config_file: PathBuf,
    pub local_node: NodeRecord,
    pub shared: Arc<SharedState>,
    pub signals: Arc<SignalFlags>,
    /// Connections to sibling nodes during failover, keyed by node id.
    pub sibling_conns: DashMap<i32, DbConn>,
    pub monitoring_state: MonitoringState,
    pub degraded_start: Option<Instant>,
    pub pid_file: Option<PathBuf>,
    pub startup_event_logged: bool,
}

impl Daemon {
    pub fn new(
        config: Config,
        config_file: PathBuf,
        local_node: NodeRecord,
        shared: Arc<SharedState>,
        signals: Arc<SignalFlags>,
        pid_file: Option<PathBuf>,
    ) -> Self {
        Self {
            config,
            config_file,
            local_node,
            shared,
            signals,
            sibling_conns: DashMap::new(),
            monitoring_state: MonitoringState::Normal,
            degraded_start: None,
            pid_file,
            startup_event_logged: false,
        }
    }

    /// Seconds spent in degraded monitoring so far.
    pub fn degraded_seconds(&self) -> i32 {
        self.degraded_start
            .map(|start| start.elapsed().as_secs() as i32)
            .unwrap_or(0)
    }

    pub fn enter_degraded_monitoring(&mut self) {
        if self.monitoring_state != MonitoringState::Degraded {
            warn!("monitoring upstream in degraded state");
            self.monitoring_state = MonitoringState::Degraded;
            self.degraded_start = Some(Instant::now());
        }
    }

    pub fn resume_normal_monitoring(&mut self) {
        if self.monitoring_state == MonitoringState::Degraded {
            info!(
                "resuming normal monitoring after {} seconds degraded",
                self.degraded_seconds()
            );
            self.monitoring_state = MonitoringState::Normal;
            self.degraded_start = None;
        }
    }

    /// Reload the configuration, replacing the whole structure; conninfo
    /// and priority changes are pushed back into the nodes table by the
    /// caller.
    pub async fn reload_config(&mut self, local_conn: Option<&DbConn>) -> bool {
        match Config::load(&self.config_file).await {
            Ok(new_config) => {
                info!("configuration file reloaded");
                self.config = new_config;
                events::create_event_notification(
                    local_conn,
                    &self.config,
                    self.config.node_id,
                    event_type::REPMGRD_RELOAD,
                    true,
                    "configuration file reloaded",
                )
                .await;
                true
            }
            Err(e) => {
                warn!("unable to reload configuration, keeping current: {}", e);
                false
            }
        }
    }

    /// Graceful shutdown: clear the registered PID, drop the PID file,
    /// record the shutdown event.
    pub async fn terminate(&self, local_conn: Option<&DbConn>) {
        if let Some(conn) = local_conn {
            rpc::set_repmgrd_pid(conn, repmgr_proto::constants::UNKNOWN_PID, None).await;
        }

        if let Some(pid_file) = &self.pid_file {
            if let Err(e) = tokio::fs::remove_file(pid_file).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("unable to remove PID file \"{}\": {}", pid_file.display(), e);
                }
            }
        }

        events::create_event_notification(
            local_conn,
            &self.config,
            self.config.node_id,
            event_type::REPMGRD_SHUTDOWN,
            true,
            "repmgrd terminating",
        )
        .await;

        info!("repmgrd terminating");
    }
}
