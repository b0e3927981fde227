//! Event log writes and notification dispatch.
//!
//! The event log is best-effort: a failed write is logged but never aborts
//! the action that produced it. A record is only attempted against a
//! session that is open and not in recovery; either way the notification
//! command (if configured) still runs, with a locally generated timestamp
//! standing in when no database timestamp is available.

use chrono::Local;
use tracing::{debug, info, warn};

use repmgr_proto::event::{EventInfo, EventRecord};
use repmgr_proto::node::RecoveryType;
use repmgr_proto::{RepmgrError, RepmgrResult};

use crate::command::{expand_event_notification, local_command};
use crate::config::Config;
use crate::pool::DbConn;

use super::status::get_recovery_type;

/// Insert one event row, returning the engine-assigned timestamp.
async fn insert_event(
    conn: &DbConn,
    node_id: i32,
    event: &str,
    successful: bool,
    details: &str,
) -> Option<String> {
    let result = conn
        .client()
        .query_one(
            " INSERT INTO repmgr.events (node_id, event, successful, details) \
                   VALUES ($1, $2, $3, $4) \
                RETURNING event_timestamp::TEXT ",
            &[&node_id, &event, &successful, &details],
        )
        .await;

    match result {
        Ok(row) => Some(row.get(0)),
        Err(e) => {
            warn!("unable to create event record: {}", e);
            None
        }
    }
}

async fn create_event(
    conn: Option<&DbConn>,
    config: &Config,
    node_id: i32,
    event: &str,
    successful: bool,
    details: &str,
    event_info: &EventInfo,
    send_notification: bool,
) -> bool {
    debug!("creating event \"{}\" for node {}", event, node_id);

    let mut event_timestamp = String::new();
    let mut success = true;

    if let Some(conn) = conn {
        if get_recovery_type(conn).await == RecoveryType::Primary {
            match insert_event(conn, node_id, event, successful, details).await {
                Some(ts) => event_timestamp = ts,
                None => success = false,
            }
        }
    }

    // No record written (no usable connection, or the write failed):
    // stamp the notification with a locally generated timestamp.
    if event_timestamp.is_empty() {
        event_timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%z").to_string();
    }

    if send_notification {
        if let Some(command_template) = config.event_notification_command.as_deref() {
            // an explicit allow-list restricts which events trigger the command
            if !config.event_notifications.is_empty()
                && !config.event_notifications.iter().any(|e| e == event)
            {
                debug!(
                    "not executing notification script for event type \"{}\"",
                    event
                );
                return success;
            }

            let parsed = expand_event_notification(
                command_template,
                node_id,
                event,
                successful,
                details,
                &event_timestamp,
                event_info,
            );

            info!("executing notification command for event \"{}\"", event);
            debug!("command is: {}", parsed);

            match local_command(&parsed).await {
                Ok(output) if output.success => {}
                Ok(output) => {
                    warn!("unable to execute event notification command");
                    warn!("parsed event notification command was: {}", parsed);
                    debug!("command output: {}", output.stderr);
                    success = false;
                }
                Err(e) => {
                    warn!("unable to execute event notification command: {}", e);
                    success = false;
                }
            }
        }
    }

    success
}

/// Record an event without dispatching any notification command.
pub async fn create_event_record(
    conn: Option<&DbConn>,
    config: &Config,
    node_id: i32,
    event: &str,
    successful: bool,
    details: &str,
) -> bool {
    create_event(
        conn,
        config,
        node_id,
        event,
        successful,
        details,
        &EventInfo::default(),
        false,
    )
    .await
}

/// Record an event and dispatch the configured notification command.
pub async fn create_event_notification(
    conn: Option<&DbConn>,
    config: &Config,
    node_id: i32,
    event: &str,
    successful: bool,
    details: &str,
) -> bool {
    create_event(
        conn,
        config,
        node_id,
        event,
        successful,
        details,
        &EventInfo::default(),
        true,
    )
    .await
}

/// As [`create_event_notification`], with extra substitution context
/// (node name, conninfo, auxiliary node id).
pub async fn create_event_notification_extended(
    conn: Option<&DbConn>,
    config: &Config,
    node_id: i32,
    event: &str,
    successful: bool,
    details: &str,
    event_info: &EventInfo,
) -> bool {
    create_event(
        conn,
        config,
        node_id,
        event,
        successful,
        details,
        event_info,
        true,
    )
    .await
}

/// Fetch event rows, optionally filtered by node id, node name or event
/// type, newest first.
pub async fn get_event_records(
    conn: &DbConn,
    node_id: Option<i32>,
    node_name: Option<&str>,
    event: Option<&str>,
    limit: Option<i64>,
) -> RepmgrResult<Vec<EventRecord>> {
    // LEFT JOIN: the node record may have been removed since the event
    let mut query = String::from(
        "   SELECT e.node_id, COALESCE(n.node_name, ''), e.event, e.successful, \
                   to_char(e.event_timestamp, 'YYYY-MM-DD HH24:MI:SS') AS timestamp, \
                   e.details \
              FROM repmgr.events e \
         LEFT JOIN repmgr.nodes n ON e.node_id = n.node_id ",
    );

    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = Vec::new();

    if let Some(ref node_id) = node_id {
        params.push(node_id);
        clauses.push(format!("e.node_id = ${}", params.len()));
    } else if let Some(ref node_name) = node_name {
        params.push(node_name);
        clauses.push(format!("n.node_name = ${}", params.len()));
    }

    if let Some(ref event) = event {
        params.push(event);
        clauses.push(format!("e.event = ${}", params.len()));
    }

    if !clauses.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(&clauses.join(" AND "));
    }

    query.push_str(" ORDER BY e.event_timestamp DESC");

    if let Some(ref limit) = limit {
        params.push(limit);
        query.push_str(&format!(" LIMIT ${}", params.len()));
    }

    let rows = conn
        .client()
        .query(&query, &params)
        .await
        .map_err(|e| RepmgrError::Catalog(format!("unable to retrieve event records: {}", e)))?;

    Ok(rows
        .iter()
        .map(|row| EventRecord {
            node_id: row.get(0),
            node_name: row.get(1),
            event: row.get(2),
            successful: row.get(3),
            event_timestamp: row.get(4),
            details: row.get(5),
        })
        .collect())
}
