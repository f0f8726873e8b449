//! `start` — from validated configuration to a running, registered
//! container.
//!
//! Three processes cooperate: the parent keeps the console masters and the
//! registry, the monitor owns the new UTS/IPC/PID(/CGROUP) namespaces and
//! reaps init, and init runs the boot sequencer. A single pipe carries the
//! init PID from monitor to parent; readiness is observed through the
//! `/run/droidspaces` marker.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::kill;
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, dup2, fork, getpid, setsid, ForkResult, Pid};

use crate::android;
use crate::boot::{self, UUID_SYNC_FILE};
use crate::channel::{self, InitPidSender};
use crate::config::DsConfig;
use crate::console;
use crate::container::info::show_info;
use crate::container::stop::cleanup_container_resources;
use crate::mounts;
use crate::network;
use crate::registry;
use crate::terminal;
use crate::utils;
use crate::MAX_TTYS;

/// Readiness poll: 10 Hz for up to 5 seconds.
const BOOT_POLL_TRIES: u32 = 50;
const BOOT_POLL_DELAY: Duration = Duration::from_millis(100);

pub fn start_rootfs(cfg: &mut DsConfig) -> Result<()> {
    // 0. Consume a restart marker left by `stop --skip-unmount`. For an
    // image-based container with its loop mount still attached this also
    // means reusing the mount instead of re-attaching.
    let mut restart_reuse = false;
    if let Some(name) = cfg.name.clone() {
        restart_reuse = try_reuse_restart_mount(cfg, &name);
    }

    registry::ensure_workspace()?;

    if cfg.selinux_permissive {
        android::set_selinux_permissive();
    }
    if cfg.android_storage && !android::is_android() {
        log::warn!("--enable-android-storage is only supported on Android hosts. Skipping.");
        cfg.android_storage = false;
    }

    // 1. Resolve the name; image mounts need it for their mount point.
    if cfg.name.is_none() {
        match &cfg.rootfs_path {
            Some(rootfs) => {
                cfg.name = Some(registry::generate_container_name(rootfs));
            }
            None => bail!("--name is mandatory when using a rootfs image"),
        }
    }

    if !restart_reuse {
        let base = cfg.name.clone().unwrap();
        // A name the user chose must not be silently reshaped; only
        // generated names pick up a numeric suffix on collision.
        if cfg.name_explicit && registry::name_in_use(&base) {
            log::error!(
                "Container name '{}' is already in use by a running container.",
                base
            );
            log::error!("Please stop it first or choose a different name with --name.");
            bail!("container name in use");
        }
        // For an explicit name this consumes a stale pidfile and returns
        // the name unchanged; generated names walk to the first free slot.
        cfg.name = Some(registry::find_available_name(&base)?);
    }
    let name = cfg.name.clone().unwrap();
    if name.len() > registry::MAX_NAME_LEN {
        bail!("container name '{}' exceeds {} characters", name, registry::MAX_NAME_LEN);
    }

    if cfg.hostname.is_none() {
        cfg.hostname = Some(name.clone());
    }

    // 2. Attach the image, read-only under volatile mode (all writes land
    // in the overlay upper layer anyway).
    if !restart_reuse {
        if let Some(img) = cfg.rootfs_img_path.clone() {
            let mount_point = mounts::mount_rootfs_img(&img, &name, cfg.volatile_mode)?;
            cfg.rootfs_path = Some(mount_point.clone());
            cfg.img_mount_point = Some(mount_point);
            cfg.is_img_mount = true;
        }
    }

    // 3. Volatile preflight happens before any further host changes, so a
    // rejected f2fs lower layer leaves nothing to clean up but the image
    // mount.
    if let Err(e) = mounts::check_volatile_mode(cfg) {
        if cfg.is_img_mount {
            if let Some(mp) = &cfg.img_mount_point {
                mounts::unmount_rootfs_img(mp, cfg.foreground);
            }
        }
        return Err(e);
    }

    cfg.uuid = utils::generate_uuid()?;
    if cfg.volatile_mode {
        cfg.volatile_dir = Some(registry::volatile_dir(&name));
    }

    // The init child recovers the UUID from this file. Volatile mode skips
    // it (the image may be read-only and cfg survives the fork anyway).
    let rootfs = cfg.effective_rootfs()?.to_path_buf();
    if !cfg.volatile_mode {
        let _ = utils::write_file(rootfs.join(UUID_SYNC_FILE), &cfg.uuid);
    }

    // 4. Refuse to fork when there is nothing to exec on the other side.
    check_init_binary(&rootfs).map_err(|e| {
        if cfg.is_img_mount {
            if let Some(mp) = &cfg.img_mount_point {
                mounts::unmount_rootfs_img(mp, cfg.foreground);
            }
        }
        e
    })?;

    // 5. Console and aux PTYs are allocated on the host so the parent
    // keeps the masters across the container's lifetime.
    let console_tty = terminal::create("console")?;
    // Size the console before boot output starts; sudo queries the slave
    // size immediately and misaligns on 0x0.
    terminal::sync_winsize_from_stdin(console_tty.master);
    cfg.console = Some(console_tty);

    for i in 0..MAX_TTYS {
        match terminal::create("tty") {
            Ok(tty) => cfg.ttys.push(tty),
            Err(e) => {
                log::warn!("stopping tty allocation at {}: {}", i, e);
                break;
            }
        }
    }

    // 6. Registry paths, resolved before the fork so the monitor inherits
    // them for cleanup.
    let global_pidfile = registry::pidfile_from_name(&name);
    if cfg.pidfile.is_none() {
        cfg.pidfile = Some(global_pidfile.clone());
    }

    let (pid_tx, mut pid_rx) = channel::init_pid_channel()?;

    let monitor_pid = match unsafe { fork() }.context("failed to fork monitor")? {
        ForkResult::Child => {
            drop(pid_rx);
            let code = monitor_main(cfg, pid_tx);
            process::exit(code);
        }
        ForkResult::Parent { child } => child,
    };
    drop(pid_tx);

    // Parent: learn the init PID from the monitor, falling back to the
    // UUID marker scan if the pipe let us down (monitor killed mid-fork,
    // or the write raced its own exit).
    let container_pid = match pid_rx.recv() {
        Ok(pid) => pid,
        Err(e) => {
            log::warn!("{:#}; scanning for the init process by UUID...", e);
            registry::find_container_init_pid(&cfg.uuid)
                .context("could not locate the container init process")?
        }
    };
    cfg.container_pid = Some(container_pid);

    log::info!("Container started with PID {} (Monitor: {})", container_pid, monitor_pid);

    // 7. Host-side plumbing the container relies on.
    network::fix_networking_host(cfg)?;
    android::apply_optimizations(true);
    if android::is_android() && cfg.rootfs_img_path.is_none() {
        android::remount_data_suid();
    }
    utils::firmware_path_add_rootfs(&rootfs);

    if cfg.hw_access {
        log::info!("Hardware access enabled: using host devtmpfs...");
    } else {
        log::info!("Hardware access disabled: using isolated tmpfs /dev...");
    }
    if cfg.volatile_mode {
        log::info!("Entering volatile mode (OverlayFS)...");
    }
    if !cfg.binds.is_empty() {
        log::info!("Setting up {} custom bind mount(s)...", cfg.binds.len());
    }
    log::info!("Booting '{}' (init: /sbin/init)...", name);

    // 8. Registry reflects truth from here on.
    utils::write_file(&global_pidfile, format!("{}", container_pid))
        .with_context(|| format!("failed to write PID file {:?}", global_pidfile))?;
    if let Some(pidfile) = &cfg.pidfile {
        if pidfile != &global_pidfile {
            if let Err(e) = utils::write_file(pidfile, format!("{}", container_pid)) {
                log::error!("Failed to write PID file {:?}: {}", pidfile, e);
            }
        }
    }
    if cfg.is_img_mount {
        if let (Some(pidfile), Some(mp)) = (&cfg.pidfile, &cfg.img_mount_point) {
            registry::save_mount_path(pidfile, mp)?;
        }
    }

    // 9. Attach or detach.
    if cfg.foreground {
        println!();
        let master = cfg.console.as_ref().unwrap().master;
        console::console_monitor_loop(master, monitor_pid, container_pid)
    } else {
        wait_for_boot(container_pid)?;
        show_info(cfg, true)?;
        log::info!("Container '{}' is running in background.", name);
        if android::is_android() {
            log::info!("Use 'su -c \"{} --name='{}' enter\"' to connect.", cfg.prog_name, name);
        } else {
            log::info!("Use 'sudo {} --name='{}' enter' to connect.", cfg.prog_name, name);
        }
        Ok(())
    }
}

/// The monitor: session leader of the new namespaces, parent and reaper of
/// init. Runs in the forked child, so it never returns — the exit code is
/// the container init's.
fn monitor_main(cfg: &mut DsConfig, mut pid_tx: InitPidSender) -> i32 {
    match setsid() {
        Ok(_) | Err(Errno::EPERM) => {}
        Err(e) => {
            log::error!("setsid failed: {}", e);
            return 1;
        }
    }
    let _ = prctl::set_name("[ds-monitor]");

    let mut ns_flags = CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWPID;

    // A cgroup namespace is only useful if we sit below the root of the
    // hierarchy before unsharing; otherwise the namespace root IS the host
    // root and nothing is scoped.
    if Path::new("/proc/self/ns/cgroup").exists() {
        if Path::new("/sys/fs/cgroup/cgroup.procs").exists() {
            let cg_path = PathBuf::from(format!(
                "/sys/fs/cgroup/droidspaces/{}",
                cfg.name.as_deref().unwrap_or("container")
            ));
            let _ = utils::create_dir_all(&cg_path);
            let _ = utils::write_file(cg_path.join("cgroup.procs"), format!("{}", getpid()));
        }
        ns_flags |= CloneFlags::CLONE_NEWCGROUP;
    }

    if let Err(e) = unshare(ns_flags) {
        log::error!("unshare failed: {}", e);
        return 1;
    }

    let init_pid = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // CONTAINER INIT
            let code = match boot::internal_boot(cfg) {
                Err(e) => {
                    log::error!("Container boot failed: {:#}", e);
                    log::error!(
                        "Please ensure the rootfs path is correct and contains a valid /sbin/init binary."
                    );
                    1
                }
                Ok(()) => 0,
            };
            process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            log::error!("failed to fork container init: {}", e);
            return 1;
        }
    };

    if pid_tx.send(init_pid).is_err() {
        // The parent is gone; keep supervising regardless.
        log::warn!("parent vanished before receiving the init PID");
    }

    // Do not hold any mount point hostage.
    let _ = chdir("/");

    if !cfg.foreground {
        if let Ok(devnull) = nix::fcntl::open(
            "/dev/null",
            nix::fcntl::OFlag::O_RDWR,
            nix::sys::stat::Mode::empty(),
        ) {
            let _ = dup2(devnull, 0);
            let _ = dup2(devnull, 1);
            let _ = dup2(devnull, 2);
            let _ = nix::unistd::close(devnull);
        }
    }

    let status = loop {
        match waitpid(init_pid, None) {
            Ok(status) => break status,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::error!("waitpid on init failed: {}", e);
                return 1;
            }
        }
    };

    // An intentional restart leaves a marker; preserving the mount and
    // sidecars lets the next start reuse them.
    let name = cfg.name.clone().unwrap_or_default();
    if registry::restart_marker_path(&name).exists() {
        log::info!("Restart marker found, skipping monitor cleanup");
    } else {
        cleanup_container_resources(cfg, Some(init_pid), false);
    }

    match status {
        nix::sys::wait::WaitStatus::Exited(_, code) => code,
        _ => 1,
    }
}

fn try_reuse_restart_mount(cfg: &mut DsConfig, name: &str) -> bool {
    let marker = registry::restart_marker_path(name);
    if !marker.exists() {
        return false;
    }
    let _ = fs::remove_file(&marker);

    // Mount reuse only applies to image-based containers.
    if cfg.rootfs_img_path.is_none() {
        return false;
    }

    if cfg.pidfile.is_none() {
        cfg.pidfile = Some(registry::pidfile_from_name(name));
    }

    if let Some(pidfile) = &cfg.pidfile {
        if let Some(existing) = registry::read_mount_path(pidfile) {
            if mounts::is_mountpoint(&existing) {
                log::info!("Reusing existing mount at {} (restart)", existing.display());
                cfg.rootfs_path = Some(existing.clone());
                cfg.img_mount_point = Some(existing);
                cfg.is_img_mount = true;
                return true;
            }
        }
    }

    log::warn!("Restart marker found but mount not active, doing fresh mount");
    false
}

/// `<rootfs>/sbin/init` must exist before the fork. Symlinks are trusted:
/// an absolute target looks broken from the host but resolves after
/// pivot_root.
fn check_init_binary(rootfs: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let init_path = rootfs.join("sbin/init");
    let meta = match fs::symlink_metadata(&init_path) {
        Ok(meta) => meta,
        Err(_) => {
            log::error!("Init binary not found: {}", init_path.display());
            log::error!("Please ensure the rootfs path is correct and contains /sbin/init.");
            bail!("init binary not found");
        }
    };

    if !meta.file_type().is_symlink() && meta.permissions().mode() & 0o111 == 0 {
        log::error!("Init binary is not executable: {}", init_path.display());
        log::error!("Ensure it has executable permissions.");
        bail!("init binary not executable");
    }

    Ok(())
}

/// Background mode: poll the readiness marker the boot sequencer writes
/// after pivot_root.
fn wait_for_boot(container_pid: Pid) -> Result<()> {
    let marker = utils::proc_root_path(container_pid, "/run/droidspaces");

    for _ in 0..BOOT_POLL_TRIES {
        if marker.exists() {
            return Ok(());
        }
        if let Err(Errno::ESRCH) = kill(container_pid, None) {
            break;
        }
        thread::sleep(BOOT_POLL_DELAY);
    }

    log::error!("Container failed to boot correctly.");
    bail!("container failed to boot")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_init_binary_missing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(check_init_binary(dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_check_init_binary_trusts_symlinks() -> Result<()> {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("sbin"))?;
        // Absolute target that does not exist on the host.
        symlink("/lib/systemd/systemd", dir.path().join("sbin/init"))?;
        assert!(check_init_binary(dir.path()).is_ok());
        Ok(())
    }

    #[test]
    fn test_check_init_binary_requires_exec_bit() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("sbin"))?;
        let init = dir.path().join("sbin/init");
        fs::write(&init, "#!/bin/sh\n")?;
        fs::set_permissions(&init, fs::Permissions::from_mode(0o644))?;
        assert!(check_init_binary(dir.path()).is_err());

        fs::set_permissions(&init, fs::Permissions::from_mode(0o755))?;
        assert!(check_init_binary(dir.path()).is_ok());
        Ok(())
    }
}
