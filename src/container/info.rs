//! `status`, `pid`, and `info` — read-only views of the registry and of a
//! running container's state.

use std::path::Path;

use nix::sys::utsname::uname;
use nix::unistd::Pid;

use crate::android;
use crate::config::DsConfig;
use crate::mounts;
use crate::network;
use crate::registry;
use crate::utils;

/// Resolve the config to a live container PID, logging guidance on
/// failure. Used by the lifecycle commands.
pub fn check_status(cfg: &mut DsConfig) -> Option<Pid> {
    if registry::auto_resolve_pidfile(cfg, false).is_err() {
        return None;
    }
    let pidfile = cfg.pidfile.as_ref()?;
    registry::read_and_validate_pid(pidfile)
}

/// Quiet variant with a stable contract for `status` and `pid`: never
/// logs, never mutates workspace state.
pub fn is_container_running(cfg: &mut DsConfig) -> Option<Pid> {
    if registry::auto_resolve_pidfile(cfg, true).is_err() {
        return None;
    }
    let pidfile = cfg.pidfile.as_ref()?;
    registry::read_and_validate_pid(pidfile)
}

fn architecture() -> String {
    let uts = uname();
    match uts.machine() {
        "aarch64" | "arm64" => "aarch64",
        "i686" | "i386" => "x86",
        m if m.starts_with("arm") => "arm",
        other => other,
    }
    .to_string()
}

fn pretty_name_from(os_release: &Path) -> Option<String> {
    let content = utils::read_file(os_release).ok()?;
    for line in content.lines() {
        if let Some(val) = line.strip_prefix("PRETTY_NAME=") {
            return Some(val.trim_matches('"').to_string());
        }
    }
    None
}

/// `info` — host summary plus per-container detail. With `trust_cfg_pid`
/// (right after start) the PID in the config is used instead of
/// re-reading the registry, because the pidfile write may still be racing
/// the marker.
pub fn show_info(cfg: &mut DsConfig, trust_cfg_pid: bool) -> anyhow::Result<()> {
    let host = if android::is_android() { "Android" } else { "Linux" };
    println!("\nHost: {} {}", host, architecture());

    if cfg.name.is_none() {
        let running = registry::running_containers();
        match running.len() {
            0 => {
                println!("\nContainer: No containers running.\n");
                return Ok(());
            }
            1 => {
                let (name, _) = &running[0];
                cfg.name = Some(name.clone());
                cfg.pidfile = Some(registry::pidfile_from_name(name));
            }
            _ => {
                println!("\nMultiple containers running:");
                registry::show_containers()?;
                println!("\nUse '--name <NAME> info' for detailed information.\n");
                return Ok(());
            }
        }
    }

    let name = cfg.name.clone().unwrap();
    if cfg.pidfile.is_none() {
        cfg.pidfile = Some(registry::pidfile_from_name(&name));
    }

    let pid = if trust_cfg_pid {
        cfg.container_pid
    } else {
        cfg.pidfile
            .as_ref()
            .and_then(|pf| registry::read_and_validate_pid(pf))
    };

    match pid {
        Some(pid) => {
            println!("\nContainer: {} (RUNNING)", name);
            println!("  PID: {}", pid);

            if let Some(pretty) =
                pretty_name_from(&utils::proc_root_path(pid, "/etc/os-release"))
            {
                println!("  OS: {}", pretty);
            }

            println!("\nFeatures:");
            if let Some(enforce) = android::selinux_status() {
                let sel = if enforce == 0 { "Permissive" } else { "Enforcing" };
                println!("  SELinux: {}", sel);
            }
            println!(
                "  IPv6: {}",
                if network::detect_ipv6_in_container(pid) {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!(
                "  Android storage: {}",
                if mounts::detect_android_storage_in_container(pid) {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!(
                "  HW access: {}",
                if mounts::detect_hw_access_in_container(pid) {
                    "enabled"
                } else {
                    "disabled"
                }
            );
        }
        None => {
            println!("\nContainer: {} (STOPPED)", name);
            if let Some(rootfs) = &cfg.rootfs_path {
                if let Some(pretty) = pretty_name_from(&rootfs.join("etc/os-release")) {
                    println!("  Rootfs OS: {}", pretty);
                }
            }
        }
    }
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_pretty_name_parsing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("os-release");
        std::fs::write(
            &path,
            "NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\n",
        )?;
        assert_eq!(
            pretty_name_from(&path).as_deref(),
            Some("Debian GNU/Linux 12 (bookworm)")
        );
        assert_eq!(pretty_name_from(&dir.path().join("missing")), None);
        Ok(())
    }

    #[test]
    fn test_architecture_is_normalized() {
        let arch = architecture();
        assert!(!arch.is_empty());
        assert_ne!(arch, "arm64");
    }
}
