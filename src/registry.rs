//! Workspace bookkeeping: pidfiles, sidecars, names, and discovery.
//!
//! A container is "registered" when `Pids/<name>.pid` holds the host PID of
//! its init and that PID still proves itself via the `/run/droidspaces`
//! marker. Everything else here derives from that contract.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use tabwriter::TabWriter;

use crate::android::is_android;
use crate::config::DsConfig;
use crate::mounts;
use crate::utils;

pub const IMG_MOUNT_ROOT: &str = "/mnt/Droidspaces";
const MAX_CONTAINERS: usize = 1024;
const PID_SCAN_RETRIES: u32 = 20;
const PID_SCAN_DELAY: Duration = Duration::from_millis(200);

/// Maximum container name length; also keeps the hostname legal.
pub const MAX_NAME_LEN: usize = 63;

static WORKSPACE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    if is_android() {
        PathBuf::from("/data/local/Droidspaces")
    } else {
        PathBuf::from("/var/lib/Droidspaces")
    }
});

pub fn workspace_dir() -> &'static Path {
    &WORKSPACE_DIR
}

pub fn pids_dir() -> PathBuf {
    workspace_dir().join("Pids")
}

pub fn volatile_dir(name: &str) -> PathBuf {
    workspace_dir().join("Volatile").join(name)
}

pub fn ensure_workspace() -> Result<()> {
    utils::create_dir_all(workspace_dir())?;
    utils::create_dir_all(pids_dir())?;
    Ok(())
}

/// `Pids/<name>.pid`
pub fn pidfile_from_name(name: &str) -> PathBuf {
    pids_dir().join(format!("{}.pid", name))
}

/// `foo.pid` → `foo.mount` (loopback mount point sidecar).
pub fn mount_sidecar_path(pidfile: &Path) -> PathBuf {
    sidecar_path(pidfile, "mount")
}

/// `Pids/<name>.restart` — zero-length hint consumed by the next start.
pub fn restart_marker_path(name: &str) -> PathBuf {
    pids_dir().join(format!("{}.restart", name))
}

fn sidecar_path(pidfile: &Path, ext: &str) -> PathBuf {
    if pidfile.extension().map(|e| e == "pid").unwrap_or(false) {
        pidfile.with_extension(ext)
    } else {
        let mut s = pidfile.as_os_str().to_owned();
        s.push(format!(".{}", ext));
        PathBuf::from(s)
    }
}

pub fn save_mount_path(pidfile: &Path, mount_path: &Path) -> Result<()> {
    utils::write_file(mount_sidecar_path(pidfile), mount_path.to_string_lossy().as_bytes())
}

pub fn read_mount_path(pidfile: &Path) -> Option<PathBuf> {
    let content = utils::read_file(mount_sidecar_path(pidfile)).ok()?;
    if content.is_empty() {
        return None;
    }
    Some(PathBuf::from(content))
}

pub fn remove_mount_path(pidfile: &Path) {
    let _ = fs::remove_file(mount_sidecar_path(pidfile));
}

/// Derive a base name from `ID[-VERSION_ID]` in the rootfs os-release.
pub fn generate_container_name(rootfs: &Path) -> String {
    let content = match utils::read_file(rootfs.join("etc/os-release")) {
        Ok(c) => c,
        Err(_) => return "linux-container".to_string(),
    };

    let mut id = "linux".to_string();
    let mut version = String::new();
    for line in content.lines() {
        if let Some(val) = line.strip_prefix("ID=") {
            id = val.trim_matches('"').to_string();
        } else if let Some(val) = line.strip_prefix("VERSION_ID=") {
            version = val.trim_matches('"').to_string();
        }
    }

    let mut name = if version.is_empty() {
        id
    } else {
        format!("{}-{}", id, version)
    };
    name.truncate(MAX_NAME_LEN);
    name
}

/// What a pidfile currently asserts.
#[derive(Debug, PartialEq, Eq)]
pub enum PidfileState {
    Missing,
    /// File exists but the PID is gone or fails container validation.
    Stale,
    Valid(Pid),
}

pub fn pidfile_state(pidfile: &Path) -> PidfileState {
    let content = match utils::read_file(pidfile) {
        Ok(c) => c,
        Err(_) => return PidfileState::Missing,
    };

    let pid = match content.parse::<i32>() {
        Ok(v) if v > 0 => Pid::from_raw(v),
        _ => return PidfileState::Stale,
    };

    if kill(pid, None).is_err() || !is_valid_container_pid(pid) {
        return PidfileState::Stale;
    }
    PidfileState::Valid(pid)
}

pub fn read_and_validate_pid(pidfile: &Path) -> Option<Pid> {
    match pidfile_state(pidfile) {
        PidfileState::Valid(pid) => Some(pid),
        _ => None,
    }
}

/// A PID belongs to a droidspaces container when the boot marker is visible
/// through its root and its argv[0] mentions an init. The loose substring
/// test is deliberate: Alpine/runit/openrc inits never write
/// `/run/systemd/container`, and their argv[0] is e.g. `/sbin/openrc-init`.
pub fn is_valid_container_pid(pid: Pid) -> bool {
    if !utils::proc_root_path(pid, "/run/droidspaces").exists() {
        return false;
    }

    let cmdline = match procfs::process::Process::new(pid.as_raw()).and_then(|p| p.cmdline()) {
        Ok(c) => c,
        Err(_) => return false,
    };
    cmdline.first().map(|arg| arg.contains("init")).unwrap_or(false)
}

/// True when the PID is PID 1 of its own namespace (`NSpid` ends in 1).
pub fn is_container_init(pid: Pid) -> bool {
    let status = match utils::read_file(format!("/proc/{}/status", pid)) {
        Ok(s) => s,
        Err(_) => return false,
    };

    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("NSpid:") {
            return rest.split_whitespace().last() == Some("1");
        }
    }
    false
}

/// Pick `base`, `base-1`, `base-2`, … — the first name whose pidfile is
/// absent or stale. Stale files are consumed together with their sidecars.
pub fn find_available_name(base: &str) -> Result<String> {
    find_available_name_in(&pids_dir(), base)
}

fn find_available_name_in(pids_dir: &Path, base: &str) -> Result<String> {
    for i in 0..MAX_CONTAINERS {
        let candidate = if i == 0 {
            base.to_string()
        } else {
            format!("{}-{}", base, i)
        };

        let pidfile = pids_dir.join(format!("{}.pid", candidate));
        match pidfile_state(&pidfile) {
            PidfileState::Missing => return Ok(candidate),
            PidfileState::Stale => {
                let _ = fs::remove_file(&pidfile);
                let _ = fs::remove_file(mount_sidecar_path(&pidfile));
                return Ok(candidate);
            }
            PidfileState::Valid(_) => continue,
        }
    }
    bail!("too many containers running with similar names")
}

/// True when a live, validated container currently owns this name.
pub fn name_in_use(name: &str) -> bool {
    matches!(
        pidfile_state(&pidfile_from_name(name)),
        PidfileState::Valid(_)
    )
}

fn is_pid_file(name: &str) -> bool {
    name.len() > 4 && name.ends_with(".pid")
}

/// Valid containers currently in the registry, as (name, pid) pairs.
/// Read-only: counting callers (auto-resolution, cleanup gating) must not
/// disturb sidecars mid-teardown.
pub fn running_containers() -> Vec<(String, Pid)> {
    collect_registry(false)
}

fn collect_registry(sweep_stale: bool) -> Vec<(String, Pid)> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(pids_dir()) {
        Ok(e) => e,
        Err(_) => return out,
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = match file_name.to_str() {
            Some(n) if is_pid_file(n) => n,
            _ => continue,
        };

        let pidfile = entry.path();
        match pidfile_state(&pidfile) {
            PidfileState::Valid(pid) => {
                out.push((file_name.trim_end_matches(".pid").to_string(), pid));
            }
            PidfileState::Stale if sweep_stale => {
                let _ = fs::remove_file(&pidfile);
                remove_mount_path(&pidfile);
            }
            _ => {}
        }
    }
    out
}

/// Fill in `cfg.pidfile`/`cfg.name` from whichever of --pidfile/--name was
/// given, or from the single running container. `quiet` suppresses the
/// user-guidance errors for machine-readable callers (`pid`, `status`).
pub fn auto_resolve_pidfile(cfg: &mut DsConfig, quiet: bool) -> Result<()> {
    if let Some(pidfile) = cfg.pidfile.clone() {
        if cfg.name.is_none() {
            let base = pidfile
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            cfg.name = Some(base);
        }
        return Ok(());
    }

    if let Some(name) = &cfg.name {
        cfg.pidfile = Some(pidfile_from_name(name));
        return Ok(());
    }

    let running = running_containers();
    match running.len() {
        1 => {
            let (name, _) = &running[0];
            cfg.pidfile = Some(pidfile_from_name(name));
            cfg.name = Some(name.clone());
            Ok(())
        }
        0 => {
            if !quiet {
                log::error!("No containers running.");
            }
            bail!("no containers running")
        }
        _ => {
            if !quiet {
                log::error!("Multiple containers running. Please specify --name.");
            }
            bail!("multiple containers running")
        }
    }
}

/// Locate a just-started init by its `/run/<uuid>` marker. The marker write
/// races with us, so retry for a few seconds.
pub fn find_container_init_pid(uuid: &str) -> Option<Pid> {
    let marker = format!("/run/{}", uuid);

    for _ in 0..PID_SCAN_RETRIES {
        if let Ok(pids) = utils::collect_pids() {
            for pid in pids {
                if utils::proc_root_path(pid, &marker).exists() && is_valid_container_pid(pid) {
                    return Some(pid);
                }
            }
        }
        thread::sleep(PID_SCAN_DELAY);
    }
    None
}

/// `show` — table of running containers. Stale pidfiles encountered on
/// the way are swept together with their sidecars.
pub fn show_containers() -> Result<()> {
    let running = collect_registry(true);
    if running.is_empty() {
        println!("\n(No containers running)\n");
        return Ok(());
    }

    let mut tw = TabWriter::new(std::io::stdout());
    writeln!(&mut tw, "NAME\tPID")?;
    for (name, pid) in &running {
        writeln!(&mut tw, "{}\t{}", name, pid)?;
    }
    tw.flush()?;
    Ok(())
}

/// `scan` — adopt untracked containers and sweep orphaned loop mounts.
pub fn scan_containers() -> Result<()> {
    log::info!("Scanning system for untracked Droidspaces containers...");

    let tracked = collect_registry(true);
    let tracked_pids: Vec<Pid> = tracked.iter().map(|(_, p)| *p).collect();
    let tracked_mounts: Vec<PathBuf> = tracked
        .iter()
        .filter_map(|(name, _)| read_mount_path(&pidfile_from_name(name)))
        .collect();

    let mut untracked_found = 0;
    for pid in utils::collect_pids().context("failed to enumerate processes")? {
        if pid.as_raw() <= 1 || tracked_pids.contains(&pid) {
            continue;
        }
        if !is_valid_container_pid(pid) || !is_container_init(pid) {
            continue;
        }

        log::info!("Found untracked container PID {}", pid);
        let proc_root = utils::proc_root_path(pid, "");
        let base = generate_container_name(&proc_root);
        if let Ok(name) = find_available_name(&base) {
            let pidfile = pidfile_from_name(&name);
            if utils::write_file(&pidfile, format!("{}", pid)).is_ok() {
                log::info!("Tracked untracked container: {} (PID {})", name, pid);
            }
        }
        untracked_found += 1;
    }

    let mut orphaned_found = 0;
    if let Ok(entries) = fs::read_dir(IMG_MOUNT_ROOT) {
        for entry in entries.flatten() {
            let mpath = entry.path();
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }

            if mounts::is_mountpoint(&mpath) {
                if !tracked_mounts.contains(&mpath) {
                    log::warn!("Found orphaned mount: {}, cleaning up...", mpath.display());
                    mounts::unmount_rootfs_img(&mpath, true);
                    orphaned_found += 1;
                }
            } else {
                // Bare leftover directory, nothing mounted.
                let _ = fs::remove_dir(&mpath);
            }
        }
    }

    if untracked_found == 0 && orphaned_found == 0 {
        log::info!("No untracked resources found.");
    } else {
        log::info!(
            "Scan complete: found {} container(s), cleaned {} orphaned mount(s).",
            untracked_found,
            orphaned_found
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_os_release(dir: &Path, content: &str) {
        fs::create_dir_all(dir.join("etc")).unwrap();
        fs::write(dir.join("etc/os-release"), content).unwrap();
    }

    #[test]
    fn test_generate_name_id_and_version() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_os_release(
            dir.path(),
            "NAME=\"Alpine Linux\"\nID=alpine\nVERSION_ID=3.19.1\n",
        );
        assert_eq!(generate_container_name(dir.path()), "alpine-3.19.1");
        Ok(())
    }

    #[test]
    fn test_generate_name_id_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_os_release(dir.path(), "ID=\"arch\"\n");
        assert_eq!(generate_container_name(dir.path()), "arch");
        Ok(())
    }

    #[test]
    fn test_generate_name_without_os_release() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(generate_container_name(dir.path()), "linux-container");
        Ok(())
    }

    #[test]
    fn test_generate_name_truncates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let long_id = "x".repeat(100);
        write_os_release(dir.path(), &format!("ID={}\n", long_id));
        assert_eq!(generate_container_name(dir.path()).len(), MAX_NAME_LEN);
        Ok(())
    }

    #[test]
    fn test_sidecar_path_mapping() {
        assert_eq!(
            mount_sidecar_path(Path::new("/var/lib/Droidspaces/Pids/foo.pid")),
            PathBuf::from("/var/lib/Droidspaces/Pids/foo.mount")
        );
        assert_eq!(
            mount_sidecar_path(Path::new("/tmp/custom")),
            PathBuf::from("/tmp/custom.mount")
        );
    }

    #[test]
    fn test_pidfile_state_missing_and_stale() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pidfile = dir.path().join("gone.pid");
        assert_eq!(pidfile_state(&pidfile), PidfileState::Missing);

        fs::write(&pidfile, "not-a-pid")?;
        assert_eq!(pidfile_state(&pidfile), PidfileState::Stale);

        // A live PID that is not a container is still stale.
        fs::write(&pidfile, format!("{}", std::process::id()))?;
        assert_eq!(pidfile_state(&pidfile), PidfileState::Stale);
        Ok(())
    }

    #[test]
    fn test_find_available_name_skips_live_and_consumes_stale() -> Result<()> {
        let dir = tempfile::tempdir()?;

        // Fresh base name is used as-is.
        assert_eq!(find_available_name_in(dir.path(), "alpine")?, "alpine");

        // A stale pidfile is consumed and its sidecar removed.
        fs::write(dir.path().join("alpine.pid"), "999999999")?;
        fs::write(dir.path().join("alpine.mount"), "/mnt/Droidspaces/alpine")?;
        assert_eq!(find_available_name_in(dir.path(), "alpine")?, "alpine");
        assert!(!dir.path().join("alpine.pid").exists());
        assert!(!dir.path().join("alpine.mount").exists());
        Ok(())
    }

    #[test]
    fn test_is_pid_file() {
        assert!(is_pid_file("alpine.pid"));
        assert!(!is_pid_file(".pid"));
        assert!(!is_pid_file("alpine.mount"));
    }
}
