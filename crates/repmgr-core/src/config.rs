//! Configuration file handling.
//!
//! The configuration is a `key=value` text file. Parsing collects all
//! problems in one pass: unknown keys produce warnings, invalid values
//! produce errors, and the caller reports the lot before exiting. After
//! load the structure is immutable; reload replaces it wholesale.

use std::path::Path;

use tracing::warn;

use repmgr_proto::constants::UNKNOWN_NODE_ID;
use repmgr_proto::defaults::*;
use repmgr_proto::{RepmgrError, RepmgrResult};

/// Failover handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverMode {
    Manual,
    Automatic,
}

/// How the daemon checks its upstream connection each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCheckType {
    Ping,
    Query,
    Connection,
}

/// Replication mode; only physical streaming replication is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationType {
    Physical,
}

/// Parsed configuration. One instance per process, replaced atomically
/// on reload.
#[derive(Debug, Clone)]
pub struct Config {
    /* node identity */
    pub node_id: i32,
    pub node_name: String,
    pub conninfo: String,
    pub replication_user: String,
    pub data_directory: String,
    pub config_directory: Option<String>,
    pub ux_bindir: String,
    pub replication_type: ReplicationType,

    /* log settings */
    pub log_level: String,
    pub log_facility: String,
    pub log_file: Option<String>,
    pub log_rotation_size: i64,
    pub log_rotation_age: i64,

    /* replication settings */
    pub use_replication_slots: bool,

    /* failover settings */
    pub failover: FailoverMode,
    pub location: String,
    pub priority: i32,
    pub promote_command: Option<String>,
    pub follow_command: Option<String>,
    pub monitor_interval_secs: i32,
    pub reconnect_attempts: i32,
    pub reconnect_interval: i32,
    pub degraded_monitoring_timeout: i32,
    pub async_query_timeout: i32,
    pub connection_check_type: ConnectionCheckType,
    pub primary_visibility_consensus: bool,
    pub monitoring_history: bool,
    pub election_rerun_interval: i32,
    pub primary_notification_timeout: i32,
    pub repmgrd_pid_file: Option<String>,

    /* promotion / follow budgets */
    pub promote_check_timeout: i32,
    pub promote_check_interval: i32,
    pub standby_follow_timeout: i32,
    pub shutdown_check_timeout: i32,

    /* witness settings */
    pub witness_sync_interval: i32,

    /* node rejoin settings */
    pub node_rejoin_timeout: i32,

    /* node check thresholds */
    pub archive_ready_warning: i32,
    pub archive_ready_critical: i32,
    pub replication_lag_warning: i32,
    pub replication_lag_critical: i32,

    /* service commands */
    pub service_start_command: Option<String>,
    pub service_stop_command: Option<String>,
    pub service_restart_command: Option<String>,
    pub service_reload_command: Option<String>,
    pub service_promote_command: Option<String>,

    /* event notifications */
    pub event_notification_command: Option<String>,
    pub event_notifications: Vec<String>,

    /* virtual IP control */
    pub virtual_ip: Option<String>,
    pub network_card: Option<String>,
    pub arping_command: Option<String>,
    pub sudo_password: Option<String>,

    /* ssh settings */
    pub ssh_options: String,
    pub root_password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: UNKNOWN_NODE_ID,
            node_name: String::new(),
            conninfo: String::new(),
            replication_user: String::new(),
            data_directory: String::new(),
            config_directory: None,
            ux_bindir: String::new(),
            replication_type: ReplicationType::Physical,
            log_level: "INFO".to_string(),
            log_facility: "STDERR".to_string(),
            log_file: None,
            log_rotation_size: 0,
            log_rotation_age: 0,
            use_replication_slots: false,
            failover: FailoverMode::Automatic,
            location: DEFAULT_LOCATION.to_string(),
            priority: DEFAULT_PRIORITY,
            promote_command: None,
            follow_command: None,
            monitor_interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            degraded_monitoring_timeout: DEFAULT_DEGRADED_MONITORING_TIMEOUT,
            async_query_timeout: DEFAULT_ASYNC_QUERY_TIMEOUT,
            connection_check_type: ConnectionCheckType::Ping,
            primary_visibility_consensus: false,
            monitoring_history: false,
            election_rerun_interval: DEFAULT_ELECTION_RERUN_INTERVAL,
            primary_notification_timeout: DEFAULT_PRIMARY_NOTIFICATION_TIMEOUT,
            repmgrd_pid_file: None,
            promote_check_timeout: DEFAULT_PROMOTE_CHECK_TIMEOUT,
            promote_check_interval: DEFAULT_PROMOTE_CHECK_INTERVAL,
            standby_follow_timeout: DEFAULT_STANDBY_FOLLOW_TIMEOUT,
            shutdown_check_timeout: DEFAULT_SHUTDOWN_CHECK_TIMEOUT,
            witness_sync_interval: DEFAULT_WITNESS_SYNC_INTERVAL,
            node_rejoin_timeout: DEFAULT_NODE_REJOIN_TIMEOUT,
            archive_ready_warning: DEFAULT_ARCHIVE_READY_WARNING,
            archive_ready_critical: DEFAULT_ARCHIVE_READY_CRITICAL,
            replication_lag_warning: DEFAULT_REPLICATION_LAG_WARNING,
            replication_lag_critical: DEFAULT_REPLICATION_LAG_CRITICAL,
            service_start_command: None,
            service_stop_command: None,
            service_restart_command: None,
            service_reload_command: None,
            service_promote_command: None,
            event_notification_command: None,
            event_notifications: Vec::new(),
            virtual_ip: None,
            network_card: None,
            arping_command: None,
            sudo_password: None,
            ssh_options: "-o BatchMode=yes -q -o ConnectTimeout=10".to_string(),
            root_password: None,
        }
    }
}

/// Problems collected during a parse.
#[derive(Debug, Default)]
pub struct ParseReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ParseReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn parse_bool(value: &str, key: &str, report: &mut ParseReport) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => true,
        "false" | "off" | "no" | "0" => false,
        _ => {
            report
                .errors
                .push(format!("\"{}\": invalid boolean value \"{}\"", key, value));
            false
        }
    }
}

fn parse_int(value: &str, key: &str, minval: i32, report: &mut ParseReport) -> i32 {
    match value.parse::<i32>() {
        Ok(v) if v >= minval => v,
        Ok(v) => {
            report.errors.push(format!(
                "\"{}\": value {} is below the minimum of {}",
                key, v, minval
            ));
            minval
        }
        Err(_) => {
            report
                .errors
                .push(format!("\"{}\": invalid integer value \"{}\"", key, value));
            minval
        }
    }
}

fn parse_size_bytes(value: &str, key: &str, report: &mut ParseReport) -> i64 {
    match value.parse::<i64>() {
        Ok(v) if v >= 0 => v,
        _ => {
            report
                .errors
                .push(format!("\"{}\": invalid size value \"{}\"", key, value));
            0
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Config {
    /// Parse configuration text, collecting warnings and errors.
    pub fn parse_str(contents: &str, report: &mut ParseReport) -> Config {
        let mut config = Config::default();

        for (lineno, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                report.errors.push(format!(
                    "line {}: expected \"key=value\", found \"{}\"",
                    lineno + 1,
                    line
                ));
                continue;
            };

            let key = key.trim();
            let value = value.trim().trim_matches('\'').trim_matches('"');

            match key {
                "node_id" => config.node_id = parse_int(value, key, 1, report),
                "node_name" => config.node_name = value.to_string(),
                "conninfo" => config.conninfo = value.to_string(),
                "replication_user" | "repluser" => {
                    config.replication_user = value.to_string()
                }
                "data_directory" => config.data_directory = value.to_string(),
                "config_directory" => config.config_directory = non_empty(value),
                "ux_bindir" => config.ux_bindir = value.to_string(),
                "replication_type" => {
                    if value != "physical" {
                        report.errors.push(format!(
                            "\"{}\": only \"physical\" replication is supported, found \"{}\"",
                            key, value
                        ));
                    }
                }
                "log_level" => config.log_level = value.to_ascii_uppercase(),
                "log_facility" => config.log_facility = value.to_string(),
                "log_file" => config.log_file = non_empty(value),
                "log_rotation_size" => {
                    config.log_rotation_size = parse_size_bytes(value, key, report)
                }
                "log_rotation_age" => {
                    config.log_rotation_age = parse_size_bytes(value, key, report)
                }
                "use_replication_slots" => {
                    config.use_replication_slots = parse_bool(value, key, report)
                }
                "failover" => match value {
                    "manual" => config.failover = FailoverMode::Manual,
                    "automatic" => config.failover = FailoverMode::Automatic,
                    _ => report.errors.push(format!(
                        "\"{}\": expected \"manual\" or \"automatic\", found \"{}\"",
                        key, value
                    )),
                },
                "location" => config.location = value.to_string(),
                "priority" => config.priority = parse_int(value, key, 0, report),
                "promote_command" => config.promote_command = non_empty(value),
                "follow_command" => config.follow_command = non_empty(value),
                "monitor_interval_secs" => {
                    config.monitor_interval_secs = parse_int(value, key, 1, report)
                }
                "reconnect_attempts" => {
                    config.reconnect_attempts = parse_int(value, key, 0, report)
                }
                "reconnect_interval" => {
                    config.reconnect_interval = parse_int(value, key, 0, report)
                }
                "degraded_monitoring_timeout" => {
                    config.degraded_monitoring_timeout = parse_int(value, key, -1, report)
                }
                "async_query_timeout" => {
                    config.async_query_timeout = parse_int(value, key, 0, report)
                }
                "connection_check_type" => match value.to_ascii_lowercase().as_str() {
                    "ping" => config.connection_check_type = ConnectionCheckType::Ping,
                    "query" => config.connection_check_type = ConnectionCheckType::Query,
                    "connection" => {
                        config.connection_check_type = ConnectionCheckType::Connection
                    }
                    _ => report.errors.push(format!(
                        "\"{}\": expected \"ping\", \"query\" or \"connection\", found \"{}\"",
                        key, value
                    )),
                },
                "primary_visibility_consensus" => {
                    config.primary_visibility_consensus = parse_bool(value, key, report)
                }
                "monitoring_history" => {
                    config.monitoring_history = parse_bool(value, key, report)
                }
                "election_rerun_interval" => {
                    config.election_rerun_interval = parse_int(value, key, 1, report)
                }
                "primary_notification_timeout" => {
                    config.primary_notification_timeout = parse_int(value, key, 0, report)
                }
                "repmgrd_pid_file" => config.repmgrd_pid_file = non_empty(value),
                "promote_check_timeout" => {
                    config.promote_check_timeout = parse_int(value, key, 1, report)
                }
                "promote_check_interval" => {
                    config.promote_check_interval = parse_int(value, key, 1, report)
                }
                "standby_follow_timeout" => {
                    config.standby_follow_timeout = parse_int(value, key, 0, report)
                }
                "shutdown_check_timeout" => {
                    config.shutdown_check_timeout = parse_int(value, key, 1, report)
                }
                "witness_sync_interval" => {
                    config.witness_sync_interval = parse_int(value, key, 1, report)
                }
                "node_rejoin_timeout" => {
                    config.node_rejoin_timeout = parse_int(value, key, 0, report)
                }
                "archive_ready_warning" => {
                    config.archive_ready_warning = parse_int(value, key, 1, report)
                }
                "archive_ready_critical" => {
                    config.archive_ready_critical = parse_int(value, key, 1, report)
                }
                "replication_lag_warning" => {
                    config.replication_lag_warning = parse_int(value, key, 1, report)
                }
                "replication_lag_critical" => {
                    config.replication_lag_critical = parse_int(value, key, 1, report)
                }
                "service_start_command" => config.service_start_command = non_empty(value),
                "service_stop_command" => config.service_stop_command = non_empty(value),
                "service_restart_command" => {
                    config.service_restart_command = non_empty(value)
                }
                "service_reload_command" => config.service_reload_command = non_empty(value),
                "service_promote_command" => {
                    config.service_promote_command = non_empty(value)
                }
                "event_notification_command" => {
                    config.event_notification_command = non_empty(value)
                }
                "event_notifications" => {
                    config.event_notifications = value
                        .split(',')
                        .map(|e| e.trim().to_string())
                        .filter(|e| !e.is_empty())
                        .collect()
                }
                "virtual_ip" => config.virtual_ip = non_empty(value),
                "network_card" => config.network_card = non_empty(value),
                "arping_command" => config.arping_command = non_empty(value),
                "sudo_password" => config.sudo_password = non_empty(value),
                "ssh_options" => config.ssh_options = value.to_string(),
                "root_password" => config.root_password = non_empty(value),
                _ => {
                    report
                        .warnings
                        .push(format!("unknown configuration item \"{}\"", key));
                }
            }
        }

        // required settings
        if config.node_id == UNKNOWN_NODE_ID {
            report.errors.push("\"node_id\": required setting was not provided".into());
        }
        if config.node_name.is_empty() {
            report
                .errors
                .push("\"node_name\": required setting was not provided".into());
        }
        if config.conninfo.is_empty() {
            report
                .errors
                .push("\"conninfo\": required setting was not provided".into());
        }
        if config.archive_ready_warning >= config.archive_ready_critical {
            report.warnings.push(
                "\"archive_ready_warning\" is not below \"archive_ready_critical\"".into(),
            );
        }

        config
    }

    /// Load the configuration file, logging warnings and failing on any
    /// collected error.
    pub async fn load(path: &Path) -> RepmgrResult<Config> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            RepmgrError::Config(format!(
                "unable to read configuration file \"{}\": {}",
                path.display(),
                e
            ))
        })?;

        let mut report = ParseReport::default();
        let config = Config::parse_str(&contents, &mut report);

        for warning in &report.warnings {
            warn!("{}", warning);
        }

        if !report.ok() {
            return Err(RepmgrError::Config(format!(
                "configuration file \"{}\" contains errors:\n  {}",
                path.display(),
                report.errors.join("\n  ")
            )));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "node_id=1\nnode_name=node1\nconninfo=host=node1 dbname=repmgr\n";

    #[test]
    fn test_minimal_config() {
        let mut report = ParseReport::default();
        let config = Config::parse_str(MINIMAL, &mut report);
        assert!(report.ok(), "{:?}", report.errors);
        assert_eq!(config.node_id, 1);
        assert_eq!(config.node_name, "node1");
        assert_eq!(config.conninfo, "host=node1 dbname=repmgr");
        // defaults
        assert_eq!(config.priority, DEFAULT_PRIORITY);
        assert_eq!(config.failover, FailoverMode::Automatic);
        assert_eq!(config.connection_check_type, ConnectionCheckType::Ping);
    }

    #[test]
    fn test_missing_required_settings() {
        let mut report = ParseReport::default();
        Config::parse_str("node_id=1\n", &mut report);
        assert!(!report.ok());
        assert!(report.errors.iter().any(|e| e.contains("node_name")));
        assert!(report.errors.iter().any(|e| e.contains("conninfo")));
    }

    #[test]
    fn test_unknown_key_warns_but_parses() {
        let mut report = ParseReport::default();
        let contents = format!("{}shoe_size=44\n", MINIMAL);
        let config = Config::parse_str(&contents, &mut report);
        assert!(report.ok());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("shoe_size"));
        assert_eq!(config.node_id, 1);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let mut report = ParseReport::default();
        let contents = format!(
            "{}failover=sometimes\npriority=goat\nmonitoring_history=perhaps\n",
            MINIMAL
        );
        Config::parse_str(&contents, &mut report);
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let mut report = ParseReport::default();
        let contents = format!("# a comment\n\n{}\n# another\n", MINIMAL);
        let config = Config::parse_str(&contents, &mut report);
        assert!(report.ok());
        assert_eq!(config.node_id, 1);
    }

    #[test]
    fn test_event_notifications_list() {
        let mut report = ParseReport::default();
        let contents = format!(
            "{}event_notifications=standby_promote, standby_follow ,repmgrd_failover_promote\n",
            MINIMAL
        );
        let config = Config::parse_str(&contents, &mut report);
        assert!(report.ok());
        assert_eq!(
            config.event_notifications,
            vec![
                "standby_promote",
                "standby_follow",
                "repmgrd_failover_promote"
            ]
        );
    }

    #[test]
    fn test_failover_and_check_type_values() {
        let mut report = ParseReport::default();
        let contents = format!(
            "{}failover=manual\nconnection_check_type=query\npriority=0\n",
            MINIMAL
        );
        let config = Config::parse_str(&contents, &mut report);
        assert!(report.ok());
        assert_eq!(config.failover, FailoverMode::Manual);
        assert_eq!(config.connection_check_type, ConnectionCheckType::Query);
        assert_eq!(config.priority, 0);
    }

    #[test]
    fn test_threshold_inversion_warns() {
        let mut report = ParseReport::default();
        let contents = format!(
            "{}archive_ready_warning=100\narchive_ready_critical=50\n",
            MINIMAL
        );
        Config::parse_str(&contents, &mut report);
        assert!(report.ok());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("archive_ready_warning")));
    }
}
