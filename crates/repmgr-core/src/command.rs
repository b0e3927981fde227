//! Local command execution and notification-command templates.
//!
//! Commands run through the shell with stdout and stderr captured;
//! success follows the process exit status. Event-notification templates
//! are expanded into a bounded buffer with `%`-token substitution.

use tokio::process::Command;
use tracing::debug;

use repmgr_proto::event::EventInfo;
use repmgr_proto::{RepmgrError, RepmgrResult};

use crate::config::Config;

/// Upper bound for an expanded notification command; longer expansions
/// are truncated.
const PARSED_COMMAND_MAX: usize = 4096;

/// Captured output of a local command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run a shell command locally, capturing stdout and stderr.
pub async fn local_command(command: &str) -> RepmgrResult<CommandOutput> {
    debug!("executing: {}", command);

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .map_err(|e| RepmgrError::Command(format!("unable to execute \"{}\": {}", command, e)))?;

    Ok(CommandOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command and report only whether it exited successfully.
pub async fn local_command_simple(command: &str) -> bool {
    matches!(local_command(command).await, Ok(output) if output.success)
}

/// Expand an event-notification template.
///
/// Substitutions: `%%` literal percent, `%n` node id, `%a` node name,
/// `%e` event name, `%d` details (double quotes escaped), `%s` 1/0
/// success flag, `%t` event timestamp, `%c` conninfo, `%p` auxiliary node
/// id. Unknown sequences pass through unchanged.
pub fn expand_event_notification(
    template: &str,
    node_id: i32,
    event: &str,
    successful: bool,
    details: &str,
    event_timestamp: &str,
    event_info: &EventInfo,
) -> String {
    let mut out = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if out.len() >= PARSED_COMMAND_MAX {
            break;
        }

        if c != '%' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some('n') => {
                chars.next();
                out.push_str(&node_id.to_string());
            }
            Some('a') => {
                chars.next();
                if let Some(name) = &event_info.node_name {
                    out.push_str(name);
                }
            }
            Some('e') => {
                chars.next();
                out.push_str(event);
            }
            Some('d') => {
                chars.next();
                out.push_str(&details.replace('"', "\\\""));
            }
            Some('s') => {
                chars.next();
                out.push(if successful { '1' } else { '0' });
            }
            Some('t') => {
                chars.next();
                out.push_str(event_timestamp);
            }
            Some('c') => {
                chars.next();
                if let Some(conninfo) = &event_info.conninfo {
                    out.push_str(conninfo);
                }
            }
            Some('p') => {
                chars.next();
                if let Some(peer_id) = event_info.peer_node_id {
                    out.push_str(&peer_id.to_string());
                }
            }
            _ => out.push('%'),
        }
    }

    out.truncate(PARSED_COMMAND_MAX);
    out
}

/// Logical service actions translatable to configured shell commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
    Promote,
}

impl ServiceAction {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(ServiceAction::Start),
            "stop" => Some(ServiceAction::Stop),
            "restart" => Some(ServiceAction::Restart),
            "reload" => Some(ServiceAction::Reload),
            "promote" => Some(ServiceAction::Promote),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Reload => "reload",
            ServiceAction::Promote => "promote",
        }
    }
}

/// Resolve the shell command for a service action: the configured command
/// if one was provided, otherwise the engine's control tool against the
/// configured data directory.
pub fn get_server_action(config: &Config, action: ServiceAction) -> String {
    let configured = match action {
        ServiceAction::Start => &config.service_start_command,
        ServiceAction::Stop => &config.service_stop_command,
        ServiceAction::Restart => &config.service_restart_command,
        ServiceAction::Reload => &config.service_reload_command,
        ServiceAction::Promote => &config.service_promote_command,
    };

    if let Some(command) = configured {
        return command.clone();
    }

    let ux_ctl = if config.ux_bindir.is_empty() {
        "ux_ctl".to_string()
    } else {
        format!("{}/ux_ctl", config.ux_bindir.trim_end_matches('/'))
    };

    match action {
        ServiceAction::Start => format!("{} -w -D '{}' start", ux_ctl, config.data_directory),
        ServiceAction::Stop => format!("{} -D '{}' -m fast -w stop", ux_ctl, config.data_directory),
        ServiceAction::Restart => {
            format!("{} -w -D '{}' restart", ux_ctl, config.data_directory)
        }
        ServiceAction::Reload => format!("{} -D '{}' reload", ux_ctl, config.data_directory),
        ServiceAction::Promote => format!("{} -w -D '{}' promote", ux_ctl, config.data_directory),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand(template: &str, event_info: &EventInfo) -> String {
        expand_event_notification(
            template,
            7,
            "standby_promote",
            true,
            "promotion details",
            "2024-01-02 03:04:05+00",
            event_info,
        )
    }

    #[test]
    fn test_expand_all_tokens() {
        let parsed = expand(
            "/bin/send --node=%n --event=%e --ok=%s --when=%t",
            &EventInfo::default(),
        );
        assert_eq!(
            parsed,
            "/bin/send --node=7 --event=standby_promote --ok=1 --when=2024-01-02 03:04:05+00"
        );
    }

    #[test]
    fn test_expand_name_conninfo_peer() {
        let info = EventInfo {
            node_name: Some("node7".into()),
            conninfo: Some("host=node7 dbname=repmgr".into()),
            peer_node_id: Some(1),
        };
        let parsed = expand("%a %p '%c'", &info);
        assert_eq!(parsed, "node7 1 'host=node7 dbname=repmgr'");
    }

    #[test]
    fn test_expand_missing_context_is_empty() {
        let parsed = expand("[%a][%c][%p]", &EventInfo::default());
        assert_eq!(parsed, "[][][]");
    }

    #[test]
    fn test_expand_details_escapes_double_quotes() {
        let parsed = expand_event_notification(
            "--details=\"%d\"",
            1,
            "x",
            false,
            "say \"hi\"",
            "ts",
            &EventInfo::default(),
        );
        assert_eq!(parsed, "--details=\"say \\\"hi\\\"\"");
    }

    #[test]
    fn test_expand_literal_percent_and_unknown() {
        let parsed = expand("100%% %q", &EventInfo::default());
        assert_eq!(parsed, "100% %q");
    }

    #[test]
    fn test_expand_failure_flag() {
        let parsed = expand_event_notification(
            "%s",
            1,
            "x",
            false,
            "",
            "ts",
            &EventInfo::default(),
        );
        assert_eq!(parsed, "0");
    }

    #[test]
    fn test_expansion_is_bounded() {
        let template = "%d".repeat(PARSED_COMMAND_MAX);
        let parsed = expand_event_notification(
            &template,
            1,
            "x",
            true,
            "0123456789",
            "ts",
            &EventInfo::default(),
        );
        assert!(parsed.len() <= PARSED_COMMAND_MAX);
    }

    #[test]
    fn test_service_action_parse() {
        assert_eq!(ServiceAction::parse("start"), Some(ServiceAction::Start));
        assert_eq!(ServiceAction::parse("PROMOTE"), Some(ServiceAction::Promote));
        assert_eq!(ServiceAction::parse("bounce"), None);
    }

    #[tokio::test]
    async fn test_local_command_captures_output() {
        let output = local_command("echo out; echo err >&2").await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");

        let output = local_command("exit 3").await.unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
    }
}
