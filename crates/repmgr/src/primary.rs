//! Primary subcommands: register, unregister.

use clap::{Args, Subcommand};
use tracing::info;

use repmgr_core::catalog::{events, nodes, status, voting};
use repmgr_core::config::Config;
use repmgr_proto::event::event_type;
use repmgr_proto::node::{NodeRecord, NodeType, RecordStatus, RecoveryType};
use repmgr_proto::ExitCode;

use crate::common::{establish_local_connection, exit_error};

#[derive(Args)]
pub struct PrimaryArgs {
    #[command(subcommand)]
    pub command: PrimaryCommands,
}

#[derive(Subcommand)]
pub enum PrimaryCommands {
    /// Register this node as the cluster primary
    Register {
        /// Overwrite an existing record for this node id
        #[arg(short = 'F', long)]
        force: bool,
    },
    /// Remove an inactive primary's record from the cluster
    Unregister {
        /// Node id of the inactive primary to unregister
        #[arg(long, value_name = "ID")]
        node_id: Option<i32>,
    },
}

pub async fn run(config: &Config, args: PrimaryArgs) {
    match args.command {
        PrimaryCommands::Register { force } => do_primary_register(config, force).await,
        PrimaryCommands::Unregister { node_id } => do_primary_unregister(config, node_id).await,
    }
}

/// Register the local node as the cluster primary, creating the repmgr
/// metadata on first use and seeding the voting term.
async fn do_primary_register(config: &Config, force: bool) {
    let conn = establish_local_connection(config).await;

    if status::get_recovery_type(&conn).await != RecoveryType::Primary {
        exit_error(
            "this node is in recovery and cannot be registered as primary",
            ExitCode::BadConfig,
        );
    }

    // an existing, different, active primary blocks registration
    if let Some(existing) = nodes::get_primary_node_record(&conn).await {
        if existing.node_id != config.node_id {
            exit_error(
                &format!("another primary is already registered: {}", existing),
                ExitCode::BadConfig,
            );
        }
    }

    let mut record = NodeRecord::new(
        config.node_id,
        NodeType::Primary,
        &config.node_name,
        &config.conninfo,
    );
    record.repluser = config.replication_user.clone();
    record.location = config.location.clone();
    record.priority = config.priority;
    record.config_file = config.data_directory.clone();
    record.virtual_ip = config.virtual_ip.clone();
    record.network_card = config.network_card.clone();

    let (existing, _) = nodes::get_node_record(&conn, config.node_id).await;

    let result = match existing {
        RecordStatus::Found if !force => {
            conn.finish();
            exit_error(
                &format!(
                    "a record for node {} already exists; use --force to overwrite",
                    config.node_id
                ),
                ExitCode::BadConfig,
            );
        }
        RecordStatus::Found => nodes::update_node_record(&conn, &record).await,
        _ => nodes::create_node_record(&conn, &record).await,
    };

    if let Err(e) = result {
        conn.finish();
        exit_error(&e.to_string(), ExitCode::DbQuery);
    }

    // enforce the primary-uniqueness invariant at the catalog level too
    if let Err(e) = nodes::update_node_record_set_primary(&conn, config.node_id).await {
        conn.finish();
        exit_error(&e.to_string(), ExitCode::DbQuery);
    }

    // elections need a term row to serialise on
    voting::initialize_voting_term(&conn).await;

    events::create_event_notification(
        Some(&conn),
        config,
        config.node_id,
        event_type::PRIMARY_REGISTER,
        true,
        &format!("primary registration succeeded for node {}", record),
    )
    .await;

    info!("primary node {} registered", record);
    println!("primary registered (node {})", record);
    conn.finish();
}

/// Remove the record of an inactive primary, typically after its role
/// has been taken over and the node is gone for good.
async fn do_primary_unregister(config: &Config, node_id: Option<i32>) {
    let conn = establish_local_connection(config).await;
    let target_id = node_id.unwrap_or(config.node_id);

    let (record_status, record) = nodes::get_node_record(&conn, target_id).await;
    let Some(record) = record else {
        conn.finish();
        exit_error(
            &format!(
                "no record found for node {} ({:?})",
                target_id, record_status
            ),
            ExitCode::BadConfig,
        );
    };

    if record.node_type == NodeType::Primary && record.active {
        conn.finish();
        exit_error(
            "node is still registered as the active primary; promote another node first",
            ExitCode::BadConfig,
        );
    }

    if let Err(e) = nodes::delete_node_record(&conn, target_id).await {
        conn.finish();
        exit_error(&e.to_string(), ExitCode::DbQuery);
    }

    events::create_event_notification(
        Some(&conn),
        config,
        target_id,
        event_type::PRIMARY_UNREGISTER,
        true,
        &format!("primary unregistration succeeded for node {}", target_id),
    )
    .await;

    println!("primary unregistered (node {})", target_id);
    conn.finish();
}
