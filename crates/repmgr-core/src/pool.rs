//! Database connection establishment and health checks.
//!
//! Connections are short-lived: callers own each handle and release it on
//! every exit path; nothing is cached between call sites. Every
//! non-replication session is hardened with an empty `search_path` and
//! `synchronous_commit=local` so a standby outage can never block a
//! catalog write behind synchronous-commit acknowledgement.

use std::str::FromStr;
use std::time::Duration;

use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, warn};

use repmgr_proto::constants::{REPMGR_APPLICATION_NAME, UNKNOWN_NODE_ID};
use repmgr_proto::defaults::DEFAULT_CONNECT_TIMEOUT_SECS;
use repmgr_proto::node::{ConnectionStatus, RecoveryType};
use repmgr_proto::{RepmgrError, RepmgrResult};

use crate::conninfo::ConninfoParams;

/// Result of waiting for connection availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ready,
    Error,
    Timeout,
}

/// An established database session.
///
/// Wraps the driver client together with the background connection task
/// and the effective parameter list the session was opened with, so the
/// session can be duplicated with substituted parameters.
pub struct DbConn {
    client: Client,
    conn_task: tokio::task::JoinHandle<()>,
    params: ConninfoParams,
    replication: bool,
}

impl DbConn {
    /// Open a session from a conninfo string.
    pub async fn establish(conninfo: &str) -> RepmgrResult<Self> {
        let params = ConninfoParams::parse(conninfo)?;
        Self::establish_by_params(&params).await
    }

    /// Open a session from a conninfo string, logging failures at debug
    /// level only. Used for opportunistic probes of possibly-down nodes.
    pub async fn establish_quiet(conninfo: &str) -> RepmgrResult<Self> {
        let params = ConninfoParams::parse(conninfo)?;
        match Self::connect(&params, false).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                debug!("connection attempt failed: {}", e);
                Err(e)
            }
        }
    }

    /// Open a session with one parameter replaced.
    pub async fn establish_with_replacement_param(
        conninfo: &str,
        param: &str,
        value: &str,
    ) -> RepmgrResult<Self> {
        let mut params = ConninfoParams::parse(conninfo)?;
        params.set(param, value);
        Self::establish_by_params(&params).await
    }

    /// Open a session from a parameter list.
    pub async fn establish_by_params(params: &ConninfoParams) -> RepmgrResult<Self> {
        Self::connect(params, true).await
    }

    /// Open a replication channel derived from a conninfo string.
    ///
    /// Sets `replication=1` and `dbname=replication` on the parameter set,
    /// connecting as the given replication role.
    pub async fn establish_replication_connection(
        conninfo: &str,
        repluser: &str,
    ) -> RepmgrResult<Self> {
        let mut params = ConninfoParams::parse(conninfo)?;
        params.set("user", repluser);
        params.set("replication", "1");
        params.set("dbname", "replication");

        let mut conn = Self::connect(&params, true).await?;
        conn.replication = true;
        Ok(conn)
    }

    /// Duplicate this session, optionally substituting the user and/or
    /// switching to a replication channel.
    pub async fn duplicate(&self, user: Option<&str>, replication: bool) -> RepmgrResult<Self> {
        let mut params = self.params.clone();
        if let Some(user) = user {
            params.set("user", user);
        }
        if replication {
            params.set("replication", "1");
            params.set("dbname", "replication");
        }
        let mut conn = Self::connect(&params, true).await?;
        conn.replication = replication;
        Ok(conn)
    }

    async fn connect(params: &ConninfoParams, log_failure: bool) -> RepmgrResult<Self> {
        let mut params = params.clone();

        // defaults unless the caller provided its own
        params.set_if_not_exists("connect_timeout", DEFAULT_CONNECT_TIMEOUT_SECS);
        params.set_if_not_exists("application_name", REPMGR_APPLICATION_NAME);

        let is_replication = params.get("replication").is_some();

        // defeat search-path injection on every session
        params.set("options", "-csearch_path=");

        let config = config_from_params(&params)?;

        debug!("connecting to: \"{}\"", redacted(&params));

        let (client, connection) = config.connect(NoTls).await.map_err(|e| {
            if log_failure {
                error!("connection to database failed: {}", e);
                error!("attempted to connect using: \"{}\"", redacted(&params));
            }
            RepmgrError::Connection(e.to_string())
        })?;

        let conn_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("connection closed: {}", e);
            }
        });

        let conn = Self {
            client,
            conn_task,
            params,
            replication: is_replication,
        };

        // Prevent standby outages from blocking catalog writes on
        // synchronous-commit acknowledgement. Replication channels have no
        // session GUCs to set.
        if !conn.replication {
            conn.client
                .batch_execute("SET synchronous_commit TO 'local'")
                .await
                .map_err(|e| {
                    if log_failure {
                        error!("unable to set synchronous_commit: {}", e);
                    }
                    RepmgrError::Connection(e.to_string())
                })?;
        }

        Ok(conn)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The parameter list this session was opened with.
    pub fn params(&self) -> &ConninfoParams {
        &self.params
    }

    pub fn is_replication(&self) -> bool {
        self.replication
    }

    /// Send a trivial query to verify the session is alive.
    pub async fn ping(&self) -> ConnectionStatus {
        match self.client.simple_query("").await {
            Ok(_) => ConnectionStatus::Ok,
            Err(e) if e.is_closed() => ConnectionStatus::Bad,
            Err(_) => ConnectionStatus::Error,
        }
    }

    /// Ping, re-establishing the session once if the first attempt shows
    /// the connection has gone away. On success the handle is replaced.
    pub async fn ping_reconnect(&mut self) -> ConnectionStatus {
        match self.ping().await {
            ConnectionStatus::Ok => ConnectionStatus::Ok,
            _ => {
                debug!("ping failed, attempting to reset connection");
                match Self::connect(&self.params, false).await {
                    Ok(new_conn) => {
                        *self = new_conn;
                        self.ping().await
                    }
                    Err(_) => ConnectionStatus::Bad,
                }
            }
        }
    }

    /// Best-effort, time-boxed cancellation of whatever query the session
    /// is currently running.
    pub async fn cancel_query(&self, timeout_secs: i32) -> bool {
        let token = self.client.cancel_token();
        let budget = Duration::from_secs(timeout_secs.max(1) as u64);
        match tokio::time::timeout(budget, token.cancel_query(NoTls)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("unable to cancel current query: {}", e);
                false
            }
            Err(_) => {
                warn!("query cancellation timed out after {:?}", budget);
                false
            }
        }
    }

    /// Wait for the session to become responsive within the given budget
    /// (microseconds, matching the engine's async-query clock).
    pub async fn wait_connection_availability(&self, timeout_us: u64) -> WaitResult {
        match tokio::time::timeout(Duration::from_micros(timeout_us), self.ping()).await {
            Ok(ConnectionStatus::Ok) => WaitResult::Ready,
            Ok(_) => WaitResult::Error,
            Err(_) => WaitResult::Timeout,
        }
    }

    /// Close the session; the background connection task is aborted on
    /// drop.
    pub fn finish(self) {
        drop(self);
    }
}

impl std::ops::Deref for DbConn {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl Drop for DbConn {
    fn drop(&mut self) {
        self.conn_task.abort();
    }
}

/// Map a parameter list onto the driver's configuration.
///
/// Keywords the driver has no equivalent for are skipped with a debug
/// message; `replication` is handled by the caller.
fn config_from_params(params: &ConninfoParams) -> RepmgrResult<tokio_postgres::Config> {
    let mut config = tokio_postgres::Config::new();

    for (keyword, value) in params.iter() {
        match keyword {
            "host" => {
                config.host(value);
            }
            "hostaddr" => {
                let addr = std::net::IpAddr::from_str(value).map_err(|e| {
                    RepmgrError::Config(format!("invalid hostaddr \"{}\": {}", value, e))
                })?;
                config.hostaddr(addr);
            }
            "port" => {
                let port: u16 = value.parse().map_err(|e| {
                    RepmgrError::Config(format!("invalid port \"{}\": {}", value, e))
                })?;
                config.port(port);
            }
            "user" => {
                config.user(value);
            }
            "password" => {
                config.password(value);
            }
            "dbname" => {
                config.dbname(value);
            }
            "options" => {
                config.options(value);
            }
            "application_name" | "fallback_application_name" => {
                config.application_name(value);
            }
            "connect_timeout" => {
                let secs: u64 = value.parse().map_err(|e| {
                    RepmgrError::Config(format!("invalid connect_timeout \"{}\": {}", value, e))
                })?;
                config.connect_timeout(Duration::from_secs(secs));
            }
            "replication" => {
                // carried on the parameter list; the channel derivation is
                // handled at establish time
            }
            other => {
                debug!("ignoring unsupported conninfo parameter \"{}\"", other);
            }
        }
    }

    Ok(config)
}

/// Parameter list with the password masked, for log output.
fn redacted(params: &ConninfoParams) -> String {
    let mut masked = params.clone();
    if masked.get("password").is_some() {
        masked.set("password", "********");
    }
    masked.to_conninfo_string()
}

/// Check whether a server is reachable with the given conninfo string.
pub async fn is_server_available(conninfo: &str) -> bool {
    match DbConn::establish_quiet(conninfo).await {
        Ok(conn) => {
            let ok = conn.ping().await == ConnectionStatus::Ok;
            conn.finish();
            ok
        }
        Err(_) => false,
    }
}

/// Check whether a server is reachable with the given parameter list.
pub async fn is_server_available_params(params: &ConninfoParams) -> bool {
    match DbConn::establish_by_params(params).await {
        Ok(conn) => {
            let ok = conn.ping().await == ConnectionStatus::Ok;
            conn.finish();
            ok
        }
        Err(_) => false,
    }
}

/// Starting from any member session, locate and connect to the cluster
/// primary. Returns the new session and the primary's node id.
///
/// Walks the primary-typed node records, connecting to each in turn and
/// verifying the server really is not in recovery.
pub async fn get_primary_connection(conn: &DbConn) -> RepmgrResult<(DbConn, i32)> {
    let rows = conn
        .client()
        .query(
            "  SELECT node_id, conninfo \
               FROM repmgr.nodes \
              WHERE type = 'primary' \
                AND active IS TRUE \
           ORDER BY priority DESC, node_id ",
            &[],
        )
        .await
        .map_err(|e| RepmgrError::Catalog(format!("unable to retrieve primary candidates: {}", e)))?;

    for row in rows {
        let node_id: i32 = row.get(0);
        let conninfo: String = row.get(1);

        let candidate = match DbConn::establish_quiet(&conninfo).await {
            Ok(c) => c,
            Err(_) => continue,
        };

        match crate::catalog::status::get_recovery_type(&candidate).await {
            RecoveryType::Primary => return Ok((candidate, node_id)),
            _ => candidate.finish(),
        }
    }

    Err(RepmgrError::Connection(format!(
        "unable to connect to any registered primary (node id {})",
        UNKNOWN_NODE_ID
    )))
}
