//! Networking fix-ups. The runtime creates no interfaces; it only adjusts
//! forwarding, NAT and the name-resolution files on both sides of the
//! pivot.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use anyhow::Result;
use nix::unistd::{sethostname, Pid};

use crate::android;
use crate::config::DsConfig;
use crate::utils;

const DNS_DEFAULTS: [&str; 2] = ["1.1.1.1", "8.8.8.8"];

/// Temp file in the rootfs carrying the resolv.conf body across the pivot.
const DNS_SYNC_FILE: &str = ".dns_servers";

/// Assemble the resolv.conf body: explicit CLI servers first, then the
/// Android property store, then the public fallbacks.
pub fn dns_resolv_body(custom: Option<&str>) -> String {
    let mut servers: Vec<String> = custom
        .map(|list| {
            list.split(|c| c == ',' || c == ' ')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();

    if servers.is_empty() {
        servers = android::dns_from_props();
    }
    if servers.is_empty() {
        servers = DNS_DEFAULTS.iter().map(|s| s.to_string()).collect();
    }

    servers
        .iter()
        .map(|s| format!("nameserver {}\n", s))
        .collect()
}

/// Host side, before the fork: forwarding sysctls, the DNS sync file, and
/// the Android firewall rules.
pub fn fix_networking_host(cfg: &DsConfig) -> Result<()> {
    log::info!(
        "Configuring host-side networking for {}...",
        cfg.name.as_deref().unwrap_or("container")
    );

    let _ = utils::write_file("/proc/sys/net/ipv4/ip_forward", "1");

    if cfg.enable_ipv6 {
        let _ = utils::write_file("/proc/sys/net/ipv6/conf/all/disable_ipv6", "0");
        let _ = utils::write_file("/proc/sys/net/ipv6/conf/default/disable_ipv6", "0");
        let _ = utils::write_file("/proc/sys/net/ipv6/conf/all/forwarding", "1");
    } else {
        // Hosts without IPv6 reject these writes, which is fine.
        let _ = utils::write_file("/proc/sys/net/ipv6/conf/all/disable_ipv6", "1");
        let _ = utils::write_file("/proc/sys/net/ipv6/conf/default/disable_ipv6", "1");
    }

    let body = dns_resolv_body(cfg.dns_servers.as_deref());
    let count = body.lines().count();
    if cfg.dns_servers.is_some() {
        log::info!("Setting up {} custom DNS servers...", count);
    } else {
        log::info!("Setting up {} default DNS servers...", count);
    }

    // The boot sequencer picks this up once it can no longer see the host.
    let rootfs = cfg.effective_rootfs()?;
    let _ = utils::write_file(rootfs.join(DNS_SYNC_FILE), &body);

    if android::is_android() {
        android::configure_iptables();
    }

    Ok(())
}

/// Container side, after pivot_root: hostname, hosts file, resolv.conf
/// materialisation, Android network groups.
pub fn fix_networking_rootfs(cfg: &DsConfig) -> Result<()> {
    let hostname = cfg.hostname.as_deref().unwrap_or("localhost");

    if let Err(e) = sethostname(hostname) {
        log::warn!("Failed to set hostname to {}: {}", hostname, e);
    }
    let _ = utils::write_file("/etc/hostname", format!("{}\n", hostname));

    let hosts = format!(
        "127.0.0.1\tlocalhost\n\
         127.0.1.1\t{}\n\
         ::1\t\tlocalhost ip6-localhost ip6-loopback\n\
         ff02::1\t\tip6-allnodes\n\
         ff02::2\t\tip6-allrouters\n",
        hostname
    );
    let _ = utils::write_file("/etc/hosts", hosts);

    let _ = fs::create_dir_all("/run/resolvconf");
    let body = match utils::read_file(Path::new("/").join(DNS_SYNC_FILE)) {
        Ok(body) => {
            let _ = fs::remove_file(Path::new("/").join(DNS_SYNC_FILE));
            format!("{}\n", body)
        }
        Err(_) => dns_resolv_body(None),
    };
    let _ = utils::write_file("/run/resolvconf/resolv.conf", body);

    let _ = fs::remove_file("/etc/resolv.conf");
    if let Err(e) = symlink("/run/resolvconf/resolv.conf", "/etc/resolv.conf") {
        log::warn!("Failed to link /etc/resolv.conf: {}", e);
    }

    if android::is_android() {
        setup_android_groups();
    }

    Ok(())
}

/// Paranoid-network kernels refuse sockets to processes outside the AID
/// groups; make sure the rootfs knows them and root is a member.
fn setup_android_groups() {
    let etc_group = Path::new("/etc/group");
    if etc_group.exists() && !utils::grep_file(etc_group, "aid_inet") {
        let current = utils::read_file(etc_group).unwrap_or_default();
        let appended = format!(
            "{}\naid_inet:x:3003:\naid_net_raw:x:3004:\naid_net_admin:x:3005:\n",
            current
        );
        let _ = utils::write_file(etc_group, appended);
    }

    let has_usermod = Path::new("/usr/sbin/usermod").exists() || Path::new("/sbin/usermod").exists();
    if has_usermod
        && !utils::grep_file(etc_group, "aid_inet:x:3003:root")
        && !utils::grep_file(etc_group, "aid_inet:*:3003:root")
    {
        utils::run_command_quiet(&["usermod", "-a", "-G", "aid_inet,aid_net_raw", "root"]);
    }
}

/// Whether IPv6 is live inside the container (reads its sysctl view).
pub fn detect_ipv6_in_container(pid: Pid) -> bool {
    let path = utils::proc_root_path(pid, "/proc/sys/net/ipv6/conf/all/disable_ipv6");
    match utils::read_file(path) {
        Ok(v) => v.trim() == "0",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_body_from_custom_list() {
        assert_eq!(
            dns_resolv_body(Some("9.9.9.9,149.112.112.112")),
            "nameserver 9.9.9.9\nnameserver 149.112.112.112\n"
        );
        // Space separation and mixed separators are accepted.
        assert_eq!(
            dns_resolv_body(Some("9.9.9.9 8.8.8.8")),
            "nameserver 9.9.9.9\nnameserver 8.8.8.8\n"
        );
    }

    #[test]
    fn test_dns_body_falls_back_to_defaults() {
        // Off Android there are no properties to consult, so an empty list
        // lands on the public defaults.
        if !android::is_android() {
            assert_eq!(
                dns_resolv_body(None),
                "nameserver 1.1.1.1\nnameserver 8.8.8.8\n"
            );
            assert_eq!(
                dns_resolv_body(Some("  ")),
                "nameserver 1.1.1.1\nnameserver 8.8.8.8\n"
            );
        }
    }
}
