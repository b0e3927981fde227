//! Witness subcommands: register, unregister.
//!
//! A witness runs its own small database holding a copy of the nodes
//! table; registration seeds that copy from the primary.

use clap::{Args, Subcommand};

use repmgr_core::catalog::{events, nodes, status};
use repmgr_core::config::Config;
use repmgr_core::pool::DbConn;
use repmgr_proto::event::event_type;
use repmgr_proto::node::{NodeRecord, NodeType, RecordStatus, RecoveryType};
use repmgr_proto::ExitCode;

use crate::common::{establish_local_connection, exit_error};

#[derive(Args)]
pub struct WitnessArgs {
    #[command(subcommand)]
    pub command: WitnessCommands,
}

#[derive(Subcommand)]
pub enum WitnessCommands {
    /// Register this node as a witness
    Register {
        /// Conninfo string of the cluster primary
        #[arg(short = 'd', long = "primary-conninfo", value_name = "CONNINFO")]
        primary_conninfo: String,
        /// Overwrite an existing record for this node id
        #[arg(short = 'F', long)]
        force: bool,
    },
    /// Remove this witness's record from the cluster
    Unregister,
}

pub async fn run(config: &Config, args: WitnessArgs) {
    match args.command {
        WitnessCommands::Register {
            primary_conninfo,
            force,
        } => do_witness_register(config, &primary_conninfo, force).await,
        WitnessCommands::Unregister => do_witness_unregister(config).await,
    }
}

async fn do_witness_register(config: &Config, primary_conninfo: &str, force: bool) {
    let local_conn = establish_local_connection(config).await;

    let primary_conn = match DbConn::establish(primary_conninfo).await {
        Ok(conn) => conn,
        Err(e) => exit_error(
            &format!("unable to connect to the primary: {}", e),
            ExitCode::DbConn,
        ),
    };

    if status::get_recovery_type(&primary_conn).await != RecoveryType::Primary {
        primary_conn.finish();
        exit_error(
            "the provided conninfo string does not point at a primary",
            ExitCode::BadConfig,
        );
    }

    let primary_id = status::get_primary_node_id(&primary_conn).await;

    let mut record = NodeRecord::new(
        config.node_id,
        NodeType::Witness,
        &config.node_name,
        &config.conninfo,
    );
    record.upstream_node_id = Some(primary_id);
    record.location = config.location.clone();
    // a witness can never be promoted
    record.priority = 0;
    record.config_file = config.data_directory.clone();

    let (existing, _) = nodes::get_node_record(&primary_conn, config.node_id).await;

    let result = match existing {
        RecordStatus::Found if !force => {
            primary_conn.finish();
            exit_error(
                &format!(
                    "a record for node {} already exists; use --force to overwrite",
                    config.node_id
                ),
                ExitCode::BadConfig,
            );
        }
        RecordStatus::Found => nodes::update_node_record(&primary_conn, &record).await,
        _ => nodes::create_node_record(&primary_conn, &record).await,
    };

    if let Err(e) = result {
        primary_conn.finish();
        exit_error(&e.to_string(), ExitCode::DbQuery);
    }

    // seed the witness-side copy of the nodes table
    if let Err(e) = nodes::witness_copy_node_records(&primary_conn, &local_conn).await {
        primary_conn.finish();
        exit_error(&e.to_string(), ExitCode::DbQuery);
    }

    events::create_event_notification(
        Some(&primary_conn),
        config,
        config.node_id,
        event_type::WITNESS_REGISTER,
        true,
        &format!("witness registration succeeded for node {}", record),
    )
    .await;

    println!("witness registered (node {})", record);
    primary_conn.finish();
    local_conn.finish();
}

async fn do_witness_unregister(config: &Config) {
    let local_conn = establish_local_connection(config).await;
    let (primary_conn, _) = crate::common::establish_primary_connection(&local_conn).await;

    if let Err(e) = nodes::delete_node_record(&primary_conn, config.node_id).await {
        primary_conn.finish();
        exit_error(&e.to_string(), ExitCode::DbQuery);
    }

    events::create_event_notification(
        Some(&primary_conn),
        config,
        config.node_id,
        event_type::WITNESS_UNREGISTER,
        true,
        &format!("witness unregistration succeeded for node {}", config.node_id),
    )
    .await;

    println!("witness unregistered (node {})", config.node_id);
    primary_conn.finish();
    local_conn.finish();
}
