//! Cluster subcommands: show, event, cleanup.

use clap::{Args, Subcommand};
use tabled::{Table, Tabled};

use repmgr_core::catalog::{events, monitoring, nodes, status};
use repmgr_core::config::Config;
use repmgr_core::pool::DbConn;
use repmgr_proto::defaults::DEFAULT_CLUSTER_EVENT_LIMIT;
use repmgr_proto::node::{NodeType, RecoveryType};
use repmgr_proto::ExitCode;

use crate::common::{establish_local_connection, establish_primary_connection, exit_error};

#[derive(Args)]
pub struct ClusterArgs {
    #[command(subcommand)]
    pub command: ClusterCommands,
}

#[derive(Subcommand)]
pub enum ClusterCommands {
    /// Show the role and status of every registered node
    Show,
    /// List recorded events
    Event {
        /// Show all events rather than the most recent
        #[arg(long)]
        all: bool,
        /// Filter by node id
        #[arg(long, value_name = "ID")]
        node_id: Option<i32>,
        /// Filter by node name
        #[arg(long, value_name = "NAME")]
        node_name: Option<String>,
        /// Filter by event type
        #[arg(long, value_name = "TYPE")]
        event: Option<String>,
        /// Maximum number of events to show
        #[arg(long, default_value_t = DEFAULT_CLUSTER_EVENT_LIMIT as i64)]
        limit: i64,
    },
    /// Trim the monitoring history
    Cleanup {
        /// Days of monitoring history to keep
        #[arg(short = 'k', long, default_value_t = 0)]
        keep_history: i32,
        /// Restrict the cleanup to one standby's records
        #[arg(long, value_name = "ID")]
        node_id: Option<i32>,
    },
}

pub async fn run(config: &Config, args: ClusterArgs) {
    match args.command {
        ClusterCommands::Show => do_cluster_show(config).await,
        ClusterCommands::Event {
            all,
            node_id,
            node_name,
            event,
            limit,
        } => do_cluster_event(config, all, node_id, node_name.as_deref(), event.as_deref(), limit).await,
        ClusterCommands::Cleanup {
            keep_history,
            node_id,
        } => do_cluster_cleanup(config, keep_history, node_id).await,
    }
}

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "ID")]
    id: i32,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Upstream")]
    upstream: String,
    #[tabled(rename = "Location")]
    location: String,
    #[tabled(rename = "Priority")]
    priority: i32,
}

async fn do_cluster_show(config: &Config) {
    let conn = establish_local_connection(config).await;

    let records = match nodes::get_all_node_records(&conn).await {
        Ok(records) => records,
        Err(e) => {
            conn.finish();
            exit_error(&e.to_string(), ExitCode::DbQuery);
        }
    };

    if records.is_empty() {
        println!("No nodes registered.");
        conn.finish();
        return;
    }

    let mut rows = Vec::with_capacity(records.len());
    let mut issues = Vec::new();

    for record in &records {
        // probe each node to report observed, not just registered, state
        let observed = match DbConn::establish_quiet(&record.conninfo).await {
            Ok(node_conn) => {
                let recovery_type = status::get_recovery_type(&node_conn).await;
                node_conn.finish();
                match (record.node_type, recovery_type) {
                    (NodeType::Primary, RecoveryType::Primary) => "* running".to_string(),
                    (NodeType::Primary, RecoveryType::Standby) => {
                        issues.push(format!(
                            "node \"{}\" (ID: {}) is registered as primary but running in recovery",
                            record.node_name, record.node_id
                        ));
                        "! running as standby".to_string()
                    }
                    (NodeType::Standby, RecoveryType::Primary) => {
                        issues.push(format!(
                            "node \"{}\" (ID: {}) is registered as standby but running as primary",
                            record.node_name, record.node_id
                        ));
                        "! running as primary".to_string()
                    }
                    _ => "running".to_string(),
                }
            }
            Err(_) => {
                if record.active {
                    issues.push(format!(
                        "unable to connect to node \"{}\" (ID: {})",
                        record.node_name, record.node_id
                    ));
                    "- unreachable".to_string()
                } else {
                    "- inactive".to_string()
                }
            }
        };

        rows.push(NodeRow {
            id: record.node_id,
            name: record.node_name.clone(),
            role: record.node_type.to_string(),
            status: observed,
            upstream: record
                .upstream_node_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            location: record.location.clone(),
            priority: record.priority,
        });
    }

    println!("{}", Table::new(&rows));

    if !issues.is_empty() {
        println!();
        println!("WARNING: the following issues were detected:");
        for issue in &issues {
            println!("  - {}", issue);
        }
    }

    conn.finish();
}

#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "Node ID")]
    node_id: i32,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Event")]
    event: String,
    #[tabled(rename = "OK")]
    ok: String,
    #[tabled(rename = "Timestamp")]
    timestamp: String,
    #[tabled(rename = "Details")]
    details: String,
}

async fn do_cluster_event(
    config: &Config,
    all: bool,
    node_id: Option<i32>,
    node_name: Option<&str>,
    event: Option<&str>,
    limit: i64,
) {
    let local_conn = establish_local_connection(config).await;
    let (primary_conn, _) = establish_primary_connection(&local_conn).await;

    let limit = if all { None } else { Some(limit) };

    let records =
        match events::get_event_records(&primary_conn, node_id, node_name, event, limit).await {
            Ok(records) => records,
            Err(e) => {
                primary_conn.finish();
                exit_error(&e.to_string(), ExitCode::DbQuery);
            }
        };

    if records.is_empty() {
        println!("No events found.");
    } else {
        let rows: Vec<EventRow> = records
            .iter()
            .map(|r| EventRow {
                node_id: r.node_id,
                name: r.node_name.clone(),
                event: r.event.clone(),
                ok: if r.successful { "t" } else { "f" }.to_string(),
                timestamp: r.event_timestamp.clone(),
                details: r.details.clone(),
            })
            .collect();
        println!("{}", Table::new(&rows));
    }

    primary_conn.finish();
    local_conn.finish();
}

async fn do_cluster_cleanup(config: &Config, keep_history: i32, node_id: Option<i32>) {
    let local_conn = establish_local_connection(config).await;
    let (primary_conn, _) = establish_primary_connection(&local_conn).await;

    let to_delete = monitoring::get_number_of_monitoring_records_to_delete(
        &primary_conn,
        keep_history,
        node_id,
    )
    .await
    .unwrap_or(0);

    if to_delete == 0 {
        println!("No monitoring records to delete.");
        primary_conn.finish();
        local_conn.finish();
        return;
    }

    match monitoring::delete_monitoring_records(&primary_conn, keep_history, node_id).await {
        Ok(deleted) => {
            status::vacuum_table(&primary_conn, "repmgr.monitoring_history").await;
            println!("{} monitoring records deleted.", deleted);
        }
        Err(e) => {
            primary_conn.finish();
            exit_error(&e.to_string(), ExitCode::DbQuery);
        }
    }

    primary_conn.finish();
    local_conn.finish();
}
