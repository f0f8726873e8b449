//! Cgroup hierarchy replication.
//!
//! Data-driven in the LXC style: enumerate whatever the host has mounted
//! (v1 hierarchies, v2 unified, or a hybrid of both) from mountinfo and
//! recreate the same shape inside the container, either through a cgroup
//! namespace (kernel scopes the view for us) or by bind-mounting the
//! calling process's own subtree (legacy isolation).

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::{mount as nix_mount, MsFlags};
use nix::unistd::{getpid, Pid};
use procfs::process::Process;

use crate::mounts::domount;
use crate::utils;

/// One host cgroup hierarchy. The two variants have genuinely different
/// mount arguments and procfs layouts, so they stay separate types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hierarchy {
    V1 {
        mount_point: PathBuf,
        controllers: Vec<String>,
    },
    V2 {
        mount_point: PathBuf,
    },
}

impl Hierarchy {
    pub fn mount_point(&self) -> &Path {
        match self {
            Hierarchy::V1 { mount_point, .. } => mount_point,
            Hierarchy::V2 { mount_point } => mount_point,
        }
    }

    /// Directory name under `/sys/fs/cgroup` this hierarchy maps to.
    fn suffix(&self) -> String {
        let mp = self.mount_point();
        if mp == Path::new("/sys/fs/cgroup") {
            return String::new();
        }
        if let Ok(rest) = mp.strip_prefix("/sys/fs/cgroup") {
            return rest.to_string_lossy().into_owned();
        }
        mp.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Enumerate the host's cgroup mounts. Mounts created by droidspaces itself
/// (under a container's mount root) are excluded so a restart does not
/// replicate its own replica.
pub fn discover() -> Result<Vec<Hierarchy>> {
    let mountinfo = Process::myself()
        .and_then(|p| p.mountinfo())
        .context("failed to read mountinfo")?;

    let mut out = Vec::new();
    for m in mountinfo {
        if m.mount_point.to_string_lossy().contains("/Droidspaces/") {
            continue;
        }

        match m.fs_type.as_str() {
            "cgroup" => {
                let mut controllers: Vec<String> = m
                    .super_options
                    .iter()
                    .filter(|(k, _)| k.as_str() != "rw" && k.as_str() != "ro")
                    .map(|(k, v)| match v {
                        Some(v) => format!("{}={}", k, v),
                        None => k.clone(),
                    })
                    .collect();
                controllers.sort();
                out.push(Hierarchy::V1 {
                    mount_point: m.mount_point,
                    controllers,
                });
            }
            "cgroup2" => out.push(Hierarchy::V2 {
                mount_point: m.mount_point,
            }),
            _ => {}
        }
    }
    Ok(out)
}

/// A cgroup namespace gives a scoped view iff every entry of
/// `/proc/self/cgroup` reads "/".
fn is_cgroup_ns_active() -> bool {
    match utils::read_file("/proc/self/cgroup") {
        Ok(content) => cgroup_paths_all_root(&content),
        Err(_) => false,
    }
}

fn cgroup_paths_all_root(proc_self_cgroup: &str) -> bool {
    proc_self_cgroup
        .lines()
        .all(|line| matches!(split_cgroup_line(line), Some((_, "/"))))
}

/// `hierarchy-ID:controller-list:path` → (controller-list, path)
fn split_cgroup_line(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.splitn(3, ':');
    let _id = parts.next()?;
    let subsys = parts.next()?;
    let path = parts.next()?;
    Some((subsys, path))
}

/// The process's own path within a hierarchy, from its `/proc/<pid>/cgroup`.
/// `controller == None` selects the v2 (empty controller list) entry.
fn cgroup_path_for(proc_cgroup: &str, controller: Option<&str>) -> Option<String> {
    for line in proc_cgroup.lines() {
        let (subsys, path) = match split_cgroup_line(line) {
            Some(pair) => pair,
            None => continue,
        };
        let matched = match controller {
            None => subsys.is_empty(),
            Some(ctrl) => subsys.contains(ctrl),
        };
        if matched {
            return Some(path.to_string());
        }
    }
    None
}

fn self_cgroup_path(controller: Option<&str>) -> Option<String> {
    let content = utils::read_file("/proc/self/cgroup").ok()?;
    cgroup_path_for(&content, controller)
}

/// Android mounts some v1 hierarchies under directory names that are not
/// the kernel controller names.
fn android_controller_alias(opts: &str) -> &str {
    match opts {
        "memcg" => "memory",
        "acct" => "cpuacct",
        other => other,
    }
}

/// First controller token of a v1 hierarchy, used to find the matching
/// `/proc/self/cgroup` line.
fn primary_controller(controllers: &[String]) -> Option<&str> {
    controllers.first().map(|c| c.as_str())
}

/// Replicate the host hierarchies under `sys/fs/cgroup` of the
/// about-to-be-pivoted rootfs (paths are relative to the current directory,
/// which the boot sequencer has already set to the rootfs).
pub fn setup(hierarchies: &[Hierarchy]) -> Result<()> {
    let base = Path::new("sys/fs/cgroup");
    if !base.exists() {
        utils::create_dir_all(base)?;
    }

    domount(
        Some("none"),
        base,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        Some("mode=755,size=16M"),
    )?;

    let in_ns = is_cgroup_ns_active();
    let mut is_pure_v2 = false;

    for hierarchy in hierarchies {
        let suffix = hierarchy.suffix();
        if hierarchy.mount_point() == Path::new("/sys/fs/cgroup") {
            is_pure_v2 = matches!(hierarchy, Hierarchy::V2 { .. });
        }

        let container_mp = if suffix.is_empty() {
            base.to_path_buf()
        } else {
            let mp = base.join(&suffix);
            let _ = fs::create_dir(&mp);
            mp
        };

        let mut mounted = false;
        if in_ns {
            // Modern path: mounting the filesystem inside an unshared
            // cgroup namespace yields the scoped root automatically.
            let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
            let mount_result = match hierarchy {
                Hierarchy::V2 { .. } => nix_mount(
                    Some("cgroup"),
                    &container_mp,
                    Some("cgroup2"),
                    flags,
                    None::<&str>,
                ),
                Hierarchy::V1 { controllers, .. } => {
                    let joined = controllers.join(",");
                    // Mountinfo parsing can come up empty on Android; fall
                    // back to the directory name.
                    let opts = if joined.is_empty() {
                        suffix.as_str()
                    } else {
                        joined.as_str()
                    };
                    let opts = android_controller_alias(opts).to_string();
                    nix_mount(
                        Some("cgroup"),
                        &container_mp,
                        Some("cgroup"),
                        flags,
                        Some(opts.as_str()),
                    )
                }
            };
            mounted = mount_result.is_ok();
        }

        if !mounted {
            // Legacy path: bind the caller's own subtree from the host
            // hierarchy. The view is not re-rooted, but it is confined.
            let controller = match hierarchy {
                Hierarchy::V2 { .. } => None,
                Hierarchy::V1 { controllers, .. } => primary_controller(controllers),
            };
            if let Some(self_path) = self_cgroup_path(controller) {
                let host_subpath = PathBuf::from(format!(
                    "{}{}",
                    hierarchy.mount_point().display(),
                    self_path
                ));
                let flags = MsFlags::MS_BIND
                    | MsFlags::MS_REC
                    | MsFlags::MS_NOSUID
                    | MsFlags::MS_NODEV
                    | MsFlags::MS_NOEXEC;
                let host_str = host_subpath.to_string_lossy();
                if let Err(e) = domount(Some(host_str.as_ref()), &container_mp, None, flags, None) {
                    log::warn!(
                        "failed to bind cgroup hierarchy {}: {}",
                        hierarchy.mount_point().display(),
                        e
                    );
                }
            }
        }

        // Comounted v1 hierarchies (cpu,cpuacct) get symlinks for the
        // secondary controller names.
        if let Hierarchy::V1 { controllers, .. } = hierarchy {
            for ctrl in controllers {
                if ctrl != &suffix && !ctrl.contains('=') {
                    let link = base.join(ctrl);
                    if !link.exists() {
                        let _ = symlink(&suffix, &link);
                    }
                }
            }
        }
    }

    // Lock the base read-only unless the host is pure v2: there the base IS
    // the cgroup2 mount and systemd must be able to create scopes at its
    // root.
    if !is_pure_v2 {
        let _ = nix_mount(
            None::<&str>,
            base,
            None::<&str>,
            MsFlags::MS_REMOUNT
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_NOEXEC,
            None::<&str>,
        );
    }

    Ok(())
}

/// Move the calling process into the same host cgroups as `target_pid`.
/// `enter` relies on this so logind inside the container can reparent the
/// session into its own scopes.
pub fn attach(target_pid: Pid) -> Result<()> {
    let hierarchies = discover()?;
    let target_cgroup = utils::read_file(format!("/proc/{}/cgroup", target_pid))
        .with_context(|| format!("cannot read cgroup table of {}", target_pid))?;

    for hierarchy in &hierarchies {
        let (controller, procs_file) = match hierarchy {
            Hierarchy::V2 { .. } => (None, "cgroup.procs"),
            Hierarchy::V1 { controllers, .. } => (primary_controller(controllers), "tasks"),
        };

        let subpath = match cgroup_path_for(&target_cgroup, controller) {
            Some(p) => p,
            None => continue,
        };

        let attach_path = PathBuf::from(format!(
            "{}{}/{}",
            hierarchy.mount_point().display(),
            subpath,
            procs_file
        ));
        if let Err(e) = utils::write_file(&attach_path, format!("{}", getpid())) {
            // EPERM is expected when already attached or delegation forbids
            // it; anything else is worth a note.
            log::debug!("cgroup attach via {:?} failed: {}", attach_path, e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_derivation() {
        let unified = Hierarchy::V2 {
            mount_point: PathBuf::from("/sys/fs/cgroup"),
        };
        assert_eq!(unified.suffix(), "");

        let memory = Hierarchy::V1 {
            mount_point: PathBuf::from("/sys/fs/cgroup/memory"),
            controllers: vec!["memory".into()],
        };
        assert_eq!(memory.suffix(), "memory");

        let android = Hierarchy::V1 {
            mount_point: PathBuf::from("/dev/memcg"),
            controllers: vec![],
        };
        assert_eq!(android.suffix(), "memcg");
    }

    #[test]
    fn test_cgroup_line_parsing() {
        let content = "\
12:cpu,cpuacct:/user.slice
5:memory:/user.slice/user-1000.slice
1:name=systemd:/init.scope
0::/user.slice/session-2.scope";

        assert_eq!(
            cgroup_path_for(content, Some("cpuacct")).as_deref(),
            Some("/user.slice")
        );
        assert_eq!(
            cgroup_path_for(content, Some("memory")).as_deref(),
            Some("/user.slice/user-1000.slice")
        );
        assert_eq!(
            cgroup_path_for(content, Some("name=systemd")).as_deref(),
            Some("/init.scope")
        );
        assert_eq!(
            cgroup_path_for(content, None).as_deref(),
            Some("/user.slice/session-2.scope")
        );
        assert_eq!(cgroup_path_for(content, Some("pids")), None);
    }

    #[test]
    fn test_cgroup_ns_detection() {
        assert!(cgroup_paths_all_root("0::/\n"));
        assert!(cgroup_paths_all_root("5:memory:/\n0::/\n"));
        assert!(!cgroup_paths_all_root("0::/user.slice\n"));
        assert!(!cgroup_paths_all_root("5:memory:/docker/abc\n0::/\n"));
    }

    #[test]
    fn test_android_controller_alias() {
        assert_eq!(android_controller_alias("memcg"), "memory");
        assert_eq!(android_controller_alias("acct"), "cpuacct");
        assert_eq!(android_controller_alias("cpu,cpuacct"), "cpu,cpuacct");
    }

    #[test]
    fn test_discover_matches_host_state() -> Result<()> {
        // Whatever the host has, every discovered hierarchy must point at
        // an existing mount point.
        for hierarchy in discover()? {
            assert!(hierarchy.mount_point().exists());
        }
        Ok(())
    }
}
