//! Virtual IP arbitration.
//!
//! Binds or unbinds virtual addresses on a physical interface with the
//! OS address-configuration command and announces takeovers via a
//! configured gratuitous-ARP command. Both operations first query the
//! kernel: binding an already-present address and unbinding an absent one
//! are no-op successes.
//!
//! Only safe to invoke after the caller has won the election and updated
//! the catalog; the arbitrator cannot tell "should own this address"
//! from "someone else already owns it".

use nix::unistd::Uid;
use tracing::{debug, info, warn};

use crate::command::{local_command, local_command_simple};
use crate::config::Config;

/// Build a command line, prefixing the privilege-escalation helper when
/// not running as root. A stored password is piped into the helper.
fn privileged_command(command: &str, sudo_password: Option<&str>) -> String {
    if Uid::effective().is_root() {
        return command.to_string();
    }

    match sudo_password {
        Some(password) if !password.is_empty() => {
            format!("echo '{}' | sudo -S {}", password, command)
        }
        _ => format!("sudo {}", command),
    }
}

/// Check whether the address is currently present on the interface.
async fn is_virtual_ip_bound(vip: &str, network_card: &str, sudo_password: Option<&str>) -> bool {
    let command = privileged_command(
        &format!("ip addr show dev {} | grep \"{}\"", network_card, vip),
        sudo_password,
    );

    match local_command(&command).await {
        Ok(output) => !output.stdout.trim().is_empty(),
        Err(_) => false,
    }
}

/// Issue the configured gratuitous-ARP command, if any.
async fn arping_virtual_ip(config: &Config) {
    let Some(arping_command) = config.arping_command.as_deref() else {
        debug!("arping will not execute because no command is configured");
        return;
    };

    info!("announcing virtual ip takeover");

    let command = privileged_command(arping_command, config.sudo_password.as_deref());
    if !local_command_simple(&command).await {
        warn!("unable to execute arping command");
    }
}

/// Validate that both halves of the virtual-address configuration are
/// present.
pub fn check_vip_conf(vip: Option<&str>, network_card: Option<&str>) -> bool {
    match (vip, network_card) {
        (Some(vip), Some(card)) => !vip.is_empty() && !card.is_empty(),
        (Some(_), None) => {
            warn!("network card is not configured, the configured virtual ip will not take effect");
            false
        }
        _ => false,
    }
}

/// Bind the virtual address on the interface. Idempotent.
pub async fn bind_virtual_ip(config: &Config, vip: &str, network_card: &str) -> bool {
    let sudo_password = config.sudo_password.as_deref();

    if is_virtual_ip_bound(vip, network_card, sudo_password).await {
        info!("virtual ip {} already bound to {}", vip, network_card);
        return true;
    }

    let command = privileged_command(
        &format!("ip addr add {} dev {}", vip, network_card),
        sudo_password,
    );

    if !local_command_simple(&command).await {
        warn!("unable to bind virtual ip {} to {}", vip, network_card);
        return false;
    }

    info!("bound virtual ip {} to {}", vip, network_card);
    arping_virtual_ip(config).await;
    true
}

/// Remove the virtual address from the interface. Idempotent.
pub async fn unbind_virtual_ip(config: &Config, vip: &str, network_card: &str) -> bool {
    let sudo_password = config.sudo_password.as_deref();

    if !is_virtual_ip_bound(vip, network_card, sudo_password).await {
        info!("virtual ip {} not bound to {}", vip, network_card);
        return true;
    }

    let command = privileged_command(
        &format!("ip addr del {} dev {}", vip, network_card),
        sudo_password,
    );

    if !local_command_simple(&command).await {
        warn!("unable to unbind virtual ip {} from {}", vip, network_card);
        return false;
    }

    info!("unbound virtual ip {} from {}", vip, network_card);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_vip_conf() {
        assert!(check_vip_conf(Some("192.0.2.10/24"), Some("eth0")));
        assert!(!check_vip_conf(Some("192.0.2.10/24"), None));
        assert!(!check_vip_conf(None, Some("eth0")));
        assert!(!check_vip_conf(None, None));
        assert!(!check_vip_conf(Some(""), Some("eth0")));
    }

    #[test]
    fn test_privileged_command_with_password() {
        let cmd = privileged_command("ip addr add 192.0.2.10/24 dev eth0", Some("secret"));
        if !Uid::effective().is_root() {
            assert!(cmd.starts_with("echo 'secret' | sudo -S "));
            assert!(cmd.ends_with("ip addr add 192.0.2.10/24 dev eth0"));
        } else {
            assert_eq!(cmd, "ip addr add 192.0.2.10/24 dev eth0");
        }
    }

    #[test]
    fn test_privileged_command_without_password() {
        let cmd = privileged_command("ip addr show", None);
        if !Uid::effective().is_root() {
            assert_eq!(cmd, "sudo ip addr show");
        } else {
            assert_eq!(cmd, "ip addr show");
        }
    }
}
