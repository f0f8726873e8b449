//! `stop` and `restart` — bounded signal escalation plus resource
//! teardown.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::android;
use crate::config::DsConfig;
use crate::container::info::check_status;
use crate::container::start_rootfs;
use crate::mounts;
use crate::registry;
use crate::utils;
use crate::STOP_TIMEOUT_SECS;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Release everything a container held on the host. Teardown is
/// best-effort throughout: a failed step is logged, never fatal. With
/// `skip_unmount` (restart) the loop mount and sidecars survive so the
/// next start can adopt them.
pub fn cleanup_container_resources(cfg: &DsConfig, pid: Option<Pid>, skip_unmount: bool) {
    nix::unistd::sync();

    // Undo the Android tweaks once nothing is left running. The count is
    // racy without a workspace lock; a concurrent start may briefly see
    // the conservative settings, which is harmless.
    if android::is_android() && !skip_unmount && registry::running_containers().is_empty() {
        android::apply_optimizations(false);
    }

    if let Some(rootfs) = &cfg.rootfs_path {
        utils::firmware_path_remove_rootfs(rootfs);
    } else if let Some(pid) = pid {
        if let Ok(rootfs) = fs::read_link(format!("/proc/{}/root", pid)) {
            utils::firmware_path_remove_rootfs(&rootfs);
        }
    }

    let global_pidfile = cfg.name.as_deref().map(registry::pidfile_from_name);

    // The overlay must go before the lower image is detached.
    if cfg.volatile_mode {
        mounts::cleanup_volatile_overlay(cfg);
    }

    if let Some(pidfile) = &cfg.pidfile {
        if let Some(mount_point) = registry::read_mount_path(pidfile) {
            if !skip_unmount {
                mounts::unmount_rootfs_img(&mount_point, cfg.foreground);
            }
        }
    }

    if !skip_unmount {
        if let Some(pidfile) = &cfg.pidfile {
            registry::remove_mount_path(pidfile);
            let _ = fs::remove_file(pidfile);
        }
        if let Some(global) = &global_pidfile {
            if cfg.pidfile.as_ref() != Some(global) {
                let _ = fs::remove_file(global);
            }
        }
        // A restart that never consumed its marker would poison the next
        // start.
        if let Some(name) = &cfg.name {
            let _ = fs::remove_file(registry::restart_marker_path(name));
        }
    }
}

/// Signal escalation: SIGRTMIN+3 (systemd poweroff) immediately, SIGTERM
/// at 2 s, SIGKILL at the stop timeout, then observe for up to 5 s.
pub fn stop_rootfs(cfg: &mut DsConfig, skip_unmount: bool) -> Result<()> {
    let pid = match check_status(cfg) {
        Some(pid) => pid,
        None => {
            log::error!(
                "Container '{}' is not running or invalid.",
                cfg.name.as_deref().unwrap_or("?")
            );
            bail!("container not running");
        }
    };

    let name = cfg.name.clone().unwrap_or_default();
    log::info!("Stopping container '{}' (PID {})...", name, pid);

    if skip_unmount {
        let _ = utils::write_file(registry::restart_marker_path(&name), "1");
    }

    // The rootfs link disappears with the process; grab it for the
    // firmware-path cleanup while it still resolves.
    let rootfs: Option<PathBuf> = fs::read_link(format!("/proc/{}/root", pid)).ok();

    // SIGRTMIN+3 is not in the portable signal set; send it raw.
    unsafe {
        libc::kill(pid.as_raw(), libc::SIGRTMIN() + 3);
    }

    let mut stopped = false;
    for i in 0..(STOP_TIMEOUT_SECS * 5) {
        if matches!(kill(pid, None), Err(Errno::ESRCH)) {
            stopped = true;
            break;
        }
        thread::sleep(POLL_INTERVAL);
        if i == 10 {
            log::info!("Graceful stop in progress, sending SIGTERM...");
            let _ = kill(pid, Signal::SIGTERM);
        }
    }

    if !stopped {
        log::warn!("Graceful stop timed out, sending SIGKILL...");
        let _ = kill(pid, Signal::SIGKILL);

        // We are not the parent, so no waitpid; poll for the kernel to
        // reap it, bounded so an unkillable PID cannot hang us.
        let mut killed = false;
        for _ in 0..25 {
            if matches!(kill(pid, None), Err(Errno::ESRCH)) {
                killed = true;
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        if !killed {
            log::error!("Container PID {} is in an unkillable state!", pid);
            log::warn!(
                "This often happens on old Android kernels due to zombie processes.\nPlease restart your device to clear it."
            );
            log::warn!("Proceeding with best-effort host cleanup...");
        }
    }

    if let Some(rootfs) = rootfs {
        utils::firmware_path_remove_rootfs(&rootfs);
    }

    cleanup_container_resources(cfg, None, skip_unmount);

    log::info!("Container '{}' stopped.", name);
    Ok(())
}

pub fn restart_rootfs(cfg: &mut DsConfig) -> Result<()> {
    log::info!(
        "Restarting container {}...",
        cfg.name.as_deref().unwrap_or("container")
    );
    // Keep the rootfs image attached across the bounce; a failed stop
    // (already dead) is no reason not to start.
    let _ = stop_rootfs(cfg, true);
    start_rootfs(cfg)
}
