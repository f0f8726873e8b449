//! Android host-platform layer: detection, SELinux, firewall, storage.

use std::env;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;

use crate::mounts::bind_mount;
use crate::utils;

static IS_ANDROID: Lazy<bool> = Lazy::new(|| {
    env::var_os("ANDROID_ROOT").is_some()
        || Path::new("/system/bin/app_process").exists()
        || Path::new("/dev/binder").exists()
        || Path::new("/dev/ashmem").exists()
});

pub fn is_android() -> bool {
    *IS_ANDROID
}

/// Current SELinux enforcement: Some(1) enforcing, Some(0) permissive,
/// None when the interface is absent.
pub fn selinux_status() -> Option<i32> {
    utils::read_file("/sys/fs/selinux/enforce")
        .ok()
        .and_then(|s| s.parse().ok())
}

pub fn set_selinux_permissive() {
    match selinux_status() {
        None => {
            log::warn!("SELinux not supported or interface missing. Skipping permissive mode.");
        }
        Some(1) => {
            log::info!("Setting SELinux to permissive...");
            if utils::write_file("/sys/fs/selinux/enforce", "0").is_err() {
                utils::run_command_quiet(&["setenforce", "0"]);
            }
        }
        Some(_) => {}
    }
}

/// Keep Android's process reaper and doze machinery away from container
/// workloads while at least one container runs. Best effort; the commands
/// only exist on Android.
pub fn apply_optimizations(enable: bool) {
    if !is_android() {
        return;
    }

    if enable {
        log::info!("Applying Android system optimizations...");
        utils::run_command_quiet(&[
            "cmd",
            "device_config",
            "put",
            "activity_manager",
            "max_phantom_processes",
            "2147483647",
        ]);
        utils::run_command_quiet(&[
            "cmd",
            "device_config",
            "set_sync_disabled_for_tests",
            "persistent",
        ]);
        utils::run_command_quiet(&["dumpsys", "deviceidle", "disable"]);
    } else {
        utils::run_command_quiet(&[
            "cmd",
            "device_config",
            "put",
            "activity_manager",
            "max_phantom_processes",
            "32",
        ]);
        utils::run_command_quiet(&["cmd", "device_config", "set_sync_disabled_for_tests", "none"]);
        utils::run_command_quiet(&["dumpsys", "deviceidle", "enable"]);
    }
}

/// `/data` is commonly mounted nosuid; su/sudo inside a rootfs stored there
/// need it remounted.
pub fn remount_data_suid() {
    if !is_android() {
        return;
    }

    log::info!("Ensuring /data is mounted with suid support...");
    if utils::run_command_quiet(&["mount", "-o", "remount,suid", "/data"]) != 0 {
        log::warn!("Failed to remount /data with suid support. su/sudo might not work.");
    }
}

/// Resolvers from the Android property store: every `getprop` line whose
/// key mentions "dns", de-duplicated, first two kept.
pub fn dns_from_props() -> Vec<String> {
    if !is_android() {
        return Vec::new();
    }

    let output = match Command::new("getprop").output() {
        Ok(out) => out,
        Err(_) => return Vec::new(),
    };
    parse_getprop_dns(&String::from_utf8_lossy(&output.stdout))
}

fn parse_getprop_dns(output: &str) -> Vec<String> {
    let mut servers = Vec::new();
    for line in output.lines() {
        // getprop format: [prop.name]: [value]
        let mut brackets = line.split(|c| c == '[' || c == ']');
        let _ = brackets.next();
        let name = match brackets.next() {
            Some(n) => n,
            None => continue,
        };
        if !name.contains("dns") {
            continue;
        }
        let _ = brackets.next();
        let value = match brackets.next() {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => continue,
        };
        if !servers.contains(&value) {
            servers.push(value);
            if servers.len() == 2 {
                break;
            }
        }
    }
    servers
}

/// The fixed NAT/forwarding rule set for container networking on Android.
/// The REDIRECT rules intentionally cover the full port range.
pub fn configure_iptables() {
    if !is_android() {
        return;
    }

    log::info!("Configuring iptables for container networking...");

    let rules: &[&[&str]] = &[
        &["iptables", "-t", "filter", "-F"],
        &["ip6tables", "-t", "filter", "-F"],
        &["iptables", "-P", "FORWARD", "ACCEPT"],
        &[
            "iptables", "-t", "nat", "-A", "POSTROUTING", "-s", "10.0.3.0/24", "!", "-d",
            "10.0.3.0/24", "-j", "MASQUERADE",
        ],
        &[
            "iptables", "-t", "nat", "-A", "OUTPUT", "-p", "tcp", "-d", "127.0.0.1", "-m",
            "tcp", "--dport", "1:65535", "-j", "REDIRECT", "--to-ports", "1-65535",
        ],
        &[
            "iptables", "-t", "nat", "-A", "OUTPUT", "-p", "udp", "-d", "127.0.0.1", "-m",
            "udp", "--dport", "1:65535", "-j", "REDIRECT", "--to-ports", "1-65535",
        ],
    ];

    for rule in rules {
        utils::run_command_quiet(rule);
    }
}

/// Bind the shared Android storage into the rootfs (pre-pivot, path
/// relative to the rootfs).
pub fn setup_storage(rootfs: &Path) -> Result<()> {
    if !is_android() {
        return Ok(());
    }

    let storage_src = Path::new("/storage/emulated/0");
    if !storage_src.is_dir() {
        log::warn!("Android storage not found or not readable at {}", storage_src.display());
        anyhow::bail!("android storage unavailable");
    }

    let target = rootfs.join("storage/emulated/0");
    utils::create_dir_all(&target)?;

    log::info!("Mounting Android internal storage to /storage/emulated/0...");
    bind_mount(storage_src, &target).context("failed to bind Android storage")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_getprop_dns() {
        let output = "\
[net.dns1]: [8.8.8.8]
[net.dns2]: [8.8.4.4]
[net.hostname]: [android-device]
[persist.sys.timezone]: [UTC]
";
        assert_eq!(parse_getprop_dns(output), vec!["8.8.8.8", "8.8.4.4"]);
    }

    #[test]
    fn test_parse_getprop_dns_dedups_and_caps() {
        let output = "\
[net.dns1]: [1.1.1.1]
[net.dns2]: [1.1.1.1]
[vendor.net.dns3]: [9.9.9.9]
[vendor.net.dns4]: [8.8.8.8]
";
        assert_eq!(parse_getprop_dns(output), vec!["1.1.1.1", "9.9.9.9"]);
    }

    #[test]
    fn test_parse_getprop_dns_ignores_empty_values() {
        assert!(parse_getprop_dns("[net.dns1]: []\n").is_empty());
        assert!(parse_getprop_dns("").is_empty());
    }
}
