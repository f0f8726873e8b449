//! The boot sequencer: everything the container's init process does
//! between being forked by the monitor and exec'ing `/sbin/init`.
//!
//! The order is load-bearing. pivot_root demands the new root be a mount
//! point with a sibling old-root directory; a `newinstance` devpts only
//! wins over the host's after the pivot; cgroup mounts need their tmpfs
//! anchor created while `/sys` is still writable; and the mount-namespace
//! unshare must precede the private remount of `/` or everything leaks
//! back to the host.

use std::env;
use std::ffi::CString;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nix::fcntl::{open, OFlag};
use nix::mount::{mount as nix_mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::{fchmod, Mode};
use nix::unistd::{chdir, close, execve, pivot_root};

use crate::android;
use crate::cgroups;
use crate::config::DsConfig;
use crate::mounts;
use crate::network;
use crate::seccomp;
use crate::terminal;
use crate::utils;
use crate::{CONTAINER_MARKER, VERSION};

/// Name of the file the parent drops into the rootfs so the init child can
/// recover its UUID after the fork.
pub const UUID_SYNC_FILE: &str = ".droidspaces-uuid";

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub fn internal_boot(cfg: &mut DsConfig) -> Result<()> {
    // Remember the caller's terminal type; the environment gets wiped
    // before exec.
    let term = env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string());

    // 1-2. Private mount namespace, nothing propagates back out.
    unshare(CloneFlags::CLONE_NEWNS).context("failed to unshare mount namespace")?;
    nix_mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("failed to make / private")?;

    // 3. Legacy-kernel shield before any systemd code can run.
    if android::is_android() {
        let is_systemd = cfg
            .rootfs_path
            .as_deref()
            .map(seccomp::is_systemd_rootfs)
            .unwrap_or(false);
        if let Err(e) = seccomp::apply_legacy_kernel_filter(is_systemd) {
            log::warn!("Failed to apply Android seccomp filter: {}", e);
        }
    }

    // 4. The overlay lives inside this namespace so it tears down with it.
    if cfg.volatile_mode {
        mounts::setup_volatile_overlay(cfg).context("failed to setup volatile overlay")?;
    }

    let rootfs = cfg.effective_rootfs()?.to_path_buf();

    // 5-7. pivot_root preconditions.
    nix_mount(
        Some(&rootfs),
        &rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("failed to bind mount rootfs onto itself")?;
    chdir(&rootfs).with_context(|| format!("failed to chdir to {:?}", rootfs))?;

    if cfg.uuid.is_empty() {
        if let Ok(uuid) = utils::read_file(UUID_SYNC_FILE) {
            cfg.uuid = uuid;
        }
    }
    // May fail on a read-only image mount; the parent skips writing the
    // sync file in that case anyway.
    let _ = fs::remove_file(UUID_SYNC_FILE);

    match fs::create_dir(".old_root") {
        Ok(()) => {}
        Err(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e).context("failed to create .old_root"),
    }

    // 8. /dev before anything needs device nodes.
    mounts::setup_dev(Path::new("."), cfg.hw_access).context("failed to setup /dev")?;

    // 9. procfs.
    let vfs_flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    utils::create_dir_all("proc")?;
    mounts::domount(Some("proc"), Path::new("proc"), Some("proc"), vfs_flags, None)?;

    // 10. sysfs, then carve out the windows that must survive the
    // read-only remount below.
    utils::create_dir_all("sys")?;
    mounts::domount(Some("sysfs"), Path::new("sys"), Some("sysfs"), vfs_flags, None)?;

    if cfg.hw_access {
        // Pin every immediate /sys subtree as its own RW mount, so full
        // hardware visibility survives the RO parent.
        if let Ok(entries) = fs::read_dir("sys") {
            for entry in entries.flatten() {
                let sub = entry.path();
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if sub.is_dir() {
                    let _ = nix_mount(
                        Some(&sub),
                        &sub,
                        None::<&str>,
                        MsFlags::MS_BIND | MsFlags::MS_REC,
                        None::<&str>,
                    );
                }
            }
        }
    } else {
        // Isolated mode still needs an RW sysfs window for networking
        // daemons to manage virtual interfaces.
        utils::create_dir_all("sys/devices/virtual/net")?;
        if mounts::domount(
            Some("sysfs"),
            Path::new("sys/devices/virtual/net"),
            Some("sysfs"),
            vfs_flags,
            None,
        )
        .is_err()
        {
            log::warn!("Failed to mount sysfs at sys/devices/virtual/net (networking may be limited)");
        }
    }

    // 11. The cgroup anchor must exist before /sys goes read-only.
    utils::create_dir_all("sys/fs/cgroup")?;
    let hierarchies = cgroups::discover().unwrap_or_default();

    // 12. Read-only /sys is how systemd detects "container mode".
    if nix_mount(
        None::<&str>,
        "sys",
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .is_err()
    {
        log::warn!("Failed to remount /sys as read-only");
    }

    // 13. Keep systemd 258+ from resolving /dev/console back to a host
    // TTY through sysfs.
    let _ = nix_mount(
        Some("/dev/null"),
        "sys/class/tty/console/active",
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    );

    // 14. /run.
    utils::create_dir_all("run")?;
    mounts::domount(
        Some("tmpfs"),
        Path::new("run"),
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=755"),
    )?;

    // 15. Console and aux TTYs; the slave paths still resolve through the
    // host's devpts until pivot_root.
    if let Some(console) = &cfg.console {
        if let Err(e) = nix_mount(
            Some(&console.name),
            "dev/console",
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            log::warn!("Failed to bind mount console '{}': {}", console.name.display(), e);
        }
    }
    for (i, tty) in cfg.ttys.iter().enumerate() {
        let target = format!("dev/tty{}", i + 1);
        if let Err(e) = nix_mount(
            Some(&tty.name),
            target.as_str(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            log::warn!("Failed to bind mount '{}': {}", target, e);
        }
    }

    // 16. Liveness markers, readable by the parent through /proc/<pid>/root.
    utils::write_file(format!("run/{}", cfg.uuid), "init")?;
    utils::write_file("run/droidspaces", VERSION)?;

    // 17. Cgroup replica.
    if let Err(e) = cgroups::setup(&hierarchies) {
        log::warn!("cgroup setup incomplete: {}", e);
    }

    // 18. Shared Android storage.
    if cfg.android_storage {
        let _ = android::setup_storage(Path::new("."));
    }

    // 19. User bind mounts, validated against escapes.
    mounts::setup_custom_binds(cfg, Path::new("."))?;

    // 20. The swap.
    pivot_root(".", ".old_root").context("pivot_root failed")?;
    chdir("/").context("chdir(/) after pivot_root failed")?;

    // 21. Private PTY namespace; must follow the pivot or the host devpts
    // shadows it.
    if let Err(e) = mounts::setup_devpts() {
        log::warn!("devpts setup failed: {}", e);
    }

    // 22. In-container networking files.
    let _ = network::fix_networking_rootfs(cfg);

    // 23. Drop the old root.
    match umount2("/.old_root", MntFlags::MNT_DETACH) {
        Ok(()) => {
            let _ = fs::remove_dir("/.old_root");
        }
        Err(e) => log::warn!("Failed to unmount .old_root: {}", e),
    }

    // 24. Container identity for systemd/openrc.
    let _ = fs::create_dir_all("/run/systemd");
    let _ = utils::write_file("/run/systemd/container", CONTAINER_MARKER);

    // 25. Fresh environment.
    let keys: Vec<_> = env::vars_os().map(|(k, _)| k).collect();
    for key in keys {
        env::remove_var(key);
    }
    env::set_var("PATH", DEFAULT_PATH);
    env::set_var("TERM", &term);
    env::set_var("HOME", "/root");
    env::set_var("container", CONTAINER_MARKER);
    env::set_var("container_ttys", terminal::container_ttys_string(&cfg.ttys));

    // 26. Hand stdio to the console and adopt it as controlling TTY.
    match open("/dev/console", OFlag::O_RDWR, Mode::empty()) {
        Ok(console_fd) => {
            terminal::set_stdfds(console_fd)?;
            if let Err(e) = terminal::make_controlling(console_fd) {
                log::warn!("could not take /dev/console as controlling tty: {}", e);
            }

            // The parent overwrites this via SIGWINCH once its loop runs,
            // but early boot output (sudo in particular) queries the size
            // before that and misaligns on 0x0.
            if let Some(ws) = terminal::get_winsize(console_fd) {
                if ws.ws_row == 0 && ws.ws_col == 0 {
                    let default = libc::winsize {
                        ws_row: 24,
                        ws_col: 80,
                        ws_xpixel: 0,
                        ws_ypixel: 0,
                    };
                    terminal::set_winsize(console_fd, &default);
                }
            }

            // systemd's TTYReset may have stripped these.
            let _ = fchmod(console_fd, Mode::from_bits_truncate(0o620));
            unsafe {
                libc::fchown(console_fd, 0, 5);
            }
            if console_fd > 2 {
                let _ = close(console_fd);
            }
        }
        Err(e) => log::warn!("could not open /dev/console: {}", e),
    }

    // 27. Become init.
    let init = CString::new("/sbin/init").unwrap();
    let args = [init.clone()];
    let environ: Vec<CString> = env::vars()
        .map(|(k, v)| CString::new(format!("{}={}", k, v)).unwrap_or_default())
        .collect();
    execve(&init, &args, &environ).context("failed to execute /sbin/init")?;
    unreachable!();
}

/// Baseline environment for processes injected into a running container
/// (`enter`, `run`).
pub fn setup_container_env() {
    let keys: Vec<_> = env::vars_os().map(|(k, _)| k).collect();
    for key in keys {
        env::remove_var(key);
    }
    env::set_var("PATH", DEFAULT_PATH);
    env::set_var("TERM", "xterm-256color");
    env::set_var("HOME", "/root");
    env::set_var("container", CONTAINER_MARKER);
}

/// Pull `KEY=value` pairs from the rootfs's /etc/environment, the way a
/// login shell would.
pub fn load_etc_environment() {
    let content = match utils::read_file("/etc/environment") {
        Ok(c) => c,
        Err(_) => return,
    };

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, val) = match line.find('=') {
            Some(pos) => (line[..pos].trim(), line[pos + 1..].trim()),
            None => continue,
        };
        if key.is_empty() {
            continue;
        }
        let val = val.trim_matches('"').trim_matches('\'');
        env::set_var(key, val);
    }
}
