//! Connection-health probes and the reconnect cycle.

use std::time::Duration;

use tracing::{info, warn};

use repmgr_core::catalog::status;
use repmgr_core::config::{Config, ConnectionCheckType};
use repmgr_core::pool::{self, DbConn};
use repmgr_proto::node::{ConnectionStatus, NodeRecord, RecoveryType};

/// Check the upstream session according to the configured check type.
pub async fn check_upstream_connection(conn: &mut DbConn, config: &Config) -> bool {
    match config.connection_check_type {
        ConnectionCheckType::Ping => conn.ping().await == ConnectionStatus::Ok,
        ConnectionCheckType::Query => {
            // a real query exercises the executor, not just the socket
            status::get_recovery_type(conn).await != RecoveryType::Unknown
        }
        ConnectionCheckType::Connection => {
            pool::is_server_available(&conn.params().to_conninfo_string()).await
        }
    }
}

/// Timed reconnect cycle against a node's stored conninfo.
///
/// Attempts `reconnect_attempts` connections, sleeping
/// `reconnect_interval` seconds between tries. Returns the new session on
/// success.
pub async fn try_reconnect(node: &NodeRecord, config: &Config) -> Option<DbConn> {
    let max_attempts = config.reconnect_attempts.max(1);

    for attempt in 1..=max_attempts {
        info!(
            "attempting to reconnect to node {} ({} of {} attempts)",
            node, attempt, max_attempts
        );

        match DbConn::establish_quiet(&node.conninfo).await {
            Ok(conn) => {
                info!("reconnected to node {}", node);
                return Some(conn);
            }
            Err(_) => {
                warn!("unable to reconnect to node {}", node);
            }
        }

        if attempt < max_attempts && config.reconnect_interval > 0 {
            tokio::time::sleep(Duration::from_secs(config.reconnect_interval as u64)).await;
        }
    }

    None
}
