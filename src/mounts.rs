//! Mount plumbing: `/dev` population, devpts, OverlayFS volatile mode,
//! loopback images, and custom bind mounts.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::mount::{mount as nix_mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::sys::statfs::{statfs, FsType};
use nix::unistd::Pid;
use path_clean::PathClean;

use crate::android::is_android;
use crate::config::DsConfig;
use crate::registry;
use crate::utils;
use crate::MAX_TTYS;

/// f2fs cannot host an OverlayFS lower layer on Android kernels.
const F2FS_SUPER_MAGIC: libc::c_long = 0xF2F5_2010u32 as libc::c_long;

const ANDROID_TMPFS_CONTEXT: &str = "u:object_r:tmpfs:s0";

struct DeviceSpec {
    name: &'static str,
    mode: u32,
    major: u64,
    minor: u64,
}

/// The minimal `/dev` population; in hw-access mode the same nodes are the
/// "dangerous" host ones that get replaced with private copies.
const DEVICES: &[DeviceSpec] = &[
    DeviceSpec { name: "null", mode: 0o666, major: 1, minor: 3 },
    DeviceSpec { name: "zero", mode: 0o666, major: 1, minor: 5 },
    DeviceSpec { name: "full", mode: 0o666, major: 1, minor: 7 },
    DeviceSpec { name: "random", mode: 0o666, major: 1, minor: 8 },
    DeviceSpec { name: "urandom", mode: 0o666, major: 1, minor: 9 },
    DeviceSpec { name: "tty", mode: 0o666, major: 5, minor: 0 },
    DeviceSpec { name: "console", mode: 0o600, major: 5, minor: 1 },
    DeviceSpec { name: "ptmx", mode: 0o666, major: 5, minor: 2 },
];

/// mount(2) wrapper that treats EBUSY ("already mounted") as success.
pub fn domount(
    src: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    match nix_mount(src, target, fstype, flags, data) {
        Ok(()) | Err(Errno::EBUSY) => Ok(()),
        Err(e) => Err(e).with_context(|| {
            format!(
                "failed to mount {} on {} ({})",
                src.unwrap_or("none"),
                target.display(),
                fstype.unwrap_or("none")
            )
        }),
    }
}

/// Recursive bind mount, creating the target as a directory or empty file
/// to match the source.
pub fn bind_mount(src: &Path, target: &Path) -> Result<()> {
    let meta = fs::metadata(src).with_context(|| format!("bind source {:?} missing", src))?;

    if !target.exists() {
        if meta.is_dir() {
            utils::create_dir_all(target)?;
        } else {
            if let Some(parent) = target.parent() {
                utils::create_dir_all(parent)?;
            }
            utils::write_file(target, "")?;
        }
    }

    let src_str = src.to_string_lossy();
    domount(
        Some(src_str.as_ref()),
        target,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )
    .with_context(|| format!("failed to bind {:?} onto {:?}", src, target))
}

/// A path is a mount point when it sits on a different device than its
/// parent.
pub fn is_mountpoint(path: &Path) -> bool {
    use std::os::linux::fs::MetadataExt;

    let st = match fs::metadata(path) {
        Ok(st) => st,
        Err(_) => return false,
    };
    let parent = match fs::metadata(path.join("..")) {
        Ok(st) => st,
        Err(_) => return false,
    };
    st.st_dev() != parent.st_dev()
}

/// Populate `<rootfs>/dev`. Isolated mode builds a private tmpfs with a
/// minimal node set; hw-access mode exposes the host devtmpfs but swaps the
/// shared console/tty/ptmx-class nodes for private ones.
pub fn setup_dev(rootfs: &Path, hw_access: bool) -> Result<()> {
    let dev = rootfs.join("dev");
    utils::create_dir_all(&dev)?;

    if hw_access {
        domount(
            Some("devtmpfs"),
            &dev,
            Some("devtmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            None,
        )?;

        for spec in DEVICES {
            let node = dev.join(spec.name);
            let _ = fs::remove_file(&node);
            if let Err(e) = mknod(
                &node,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(spec.mode),
                makedev(spec.major, spec.minor),
            ) {
                log::warn!("failed to recreate /dev/{}: {}", spec.name, e);
            }
        }
    } else {
        domount(
            Some("none"),
            &dev,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("size=4M,mode=755"),
        )?;

        for spec in DEVICES {
            let node = dev.join(spec.name);
            match mknod(
                &node,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(spec.mode),
                makedev(spec.major, spec.minor),
            ) {
                Ok(()) | Err(Errno::EEXIST) => {}
                // mknod may be refused (e.g. restricted SELinux domains);
                // a bind of the host node is an acceptable stand-in.
                Err(_) => {
                    let _ = bind_mount(&Path::new("/dev").join(spec.name), &node);
                }
            }
        }

        for extra in ["net/tun", "fuse"].iter() {
            let host = Path::new("/dev").join(extra);
            if host.exists() {
                if let Err(e) = bind_mount(&host, &dev.join(extra)) {
                    log::debug!("skipping {}: {}", host.display(), e);
                }
            }
        }

        // Empty files as bind targets for the aux TTY slaves.
        for i in 1..=MAX_TTYS {
            let tty = dev.join(format!("tty{}", i));
            if !tty.exists() {
                utils::write_file(&tty, "")?;
            }
        }
    }

    let links = [
        ("/proc/self/fd", "fd"),
        ("/proc/self/fd/0", "stdin"),
        ("/proc/self/fd/1", "stdout"),
        ("/proc/self/fd/2", "stderr"),
    ];
    for (src, dst) in links.iter() {
        let _ = symlink(src, dev.join(dst));
    }

    Ok(())
}

/// Mount a private devpts instance. Kernels differ in which option subsets
/// they accept, so walk a fallback list before giving up.
pub fn setup_devpts() -> Result<()> {
    utils::create_dir_all("/dev/pts")?;

    let option_sets = [
        "newinstance,ptmxmode=0666,mode=0620,gid=5",
        "newinstance,ptmxmode=0666,mode=0620",
        "newinstance,ptmxmode=0666",
        "newinstance",
    ];

    let mut mounted = false;
    for opts in option_sets.iter() {
        if nix_mount(
            Some("devpts"),
            "/dev/pts",
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some(*opts),
        )
        .is_ok()
        {
            mounted = true;
            break;
        }
    }
    if !mounted {
        bail!("all devpts option sets were rejected");
    }

    // /dev/ptmx must resolve into the private instance.
    let ptmx = Path::new("/dev/ptmx");
    if !ptmx.exists() {
        let _ = utils::write_file(ptmx, "");
    }
    if nix_mount(
        Some("/dev/pts/ptmx"),
        ptmx,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .is_err()
    {
        let _ = fs::remove_file(ptmx);
        symlink("pts/ptmx", ptmx).context("failed to symlink /dev/ptmx")?;
    }

    Ok(())
}

/// Volatile-mode preflight, run before any host state changes.
pub fn check_volatile_mode(cfg: &DsConfig) -> Result<()> {
    if !cfg.volatile_mode {
        return Ok(());
    }

    if !utils::grep_file("/proc/filesystems", "overlay") {
        bail!("kernel lacks OverlayFS support required for --volatile");
    }

    let rootfs = cfg.effective_rootfs()?;
    let st = statfs(rootfs).with_context(|| format!("statfs({:?}) failed", rootfs))?;
    if st.filesystem_type() == FsType(F2FS_SUPER_MAGIC) {
        bail!(
            "rootfs at {} is on f2fs, which cannot serve as an OverlayFS lower layer",
            rootfs.display()
        );
    }

    Ok(())
}

/// Build the tmpfs-backed overlay and swap the effective rootfs to the
/// merged view. Runs inside the container's private mount namespace so the
/// whole arrangement vanishes with it.
pub fn setup_volatile_overlay(cfg: &mut DsConfig) -> Result<()> {
    let name = cfg.name.clone().context("volatile overlay needs a name")?;
    let lower = cfg.effective_rootfs()?.to_path_buf();
    let base = registry::volatile_dir(&name);

    let result = (|| -> Result<PathBuf> {
        utils::create_dir_all(&base)?;
        domount(
            Some("none"),
            &base,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=755"),
        )?;

        let upper = base.join("upper");
        let work = base.join("work");
        let merged = base.join("merged");
        for dir in [&upper, &work, &merged].iter() {
            utils::create_dir_all(dir)?;
        }

        let mut data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        if is_android() {
            // Survives the SELinux label mismatch between /data and tmpfs.
            data.push_str(&format!(",context=\"{}\"", ANDROID_TMPFS_CONTEXT));
        }

        nix_mount(
            Some("overlay"),
            &merged,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .context("overlay mount failed")?;

        Ok(merged)
    })();

    match result {
        Ok(merged) => {
            cfg.volatile_dir = Some(base);
            cfg.rootfs_path = Some(merged);
            Ok(())
        }
        Err(e) => {
            let _ = umount2(&base, MntFlags::MNT_DETACH);
            let _ = fs::remove_dir_all(&base);
            Err(e)
        }
    }
}

/// Best-effort teardown of the overlay workspace from the host side.
pub fn cleanup_volatile_overlay(cfg: &DsConfig) {
    let base = match &cfg.volatile_dir {
        Some(b) => b.clone(),
        None => match &cfg.name {
            Some(n) => registry::volatile_dir(n),
            None => return,
        },
    };
    if !base.exists() {
        return;
    }

    let _ = umount2(&base.join("merged"), MntFlags::MNT_DETACH);
    let _ = umount2(&base, MntFlags::MNT_DETACH);
    let _ = fs::remove_dir_all(&base);
}

/// Resolve a bind destination inside the rootfs, rejecting anything that
/// would escape it. Returns the host-side target path.
pub fn validate_bind_dest(rootfs: &Path, dest: &Path) -> Result<PathBuf> {
    if !dest.is_absolute() {
        bail!("bind destination must be an absolute path: {:?}", dest);
    }
    if dest.components().any(|c| c == Component::ParentDir) {
        bail!("path traversal detected in bind destination: {:?}", dest);
    }

    let cleaned = dest.to_path_buf().clean();
    let relative = cleaned.strip_prefix("/").unwrap_or_else(|_| cleaned.as_path());
    let target = rootfs.join(relative);

    if let Ok(meta) = fs::symlink_metadata(&target) {
        if meta.file_type().is_symlink() {
            bail!("bind destination {:?} is a symlink", dest);
        }
    }

    // Resolve the nearest existing ancestor; its realpath must stay inside
    // the rootfs or a symlink somewhere on the way is pointing out.
    let rootfs_real = fs::canonicalize(rootfs)
        .with_context(|| format!("cannot canonicalize rootfs {:?}", rootfs))?;
    let mut probe = target.clone();
    let existing = loop {
        if probe.exists() {
            break probe;
        }
        match probe.parent() {
            Some(parent) => probe = parent.to_path_buf(),
            None => break rootfs.to_path_buf(),
        }
    };
    let real = fs::canonicalize(&existing)
        .with_context(|| format!("cannot canonicalize {:?}", existing))?;
    if !real.starts_with(&rootfs_real) {
        bail!(
            "bind destination {:?} escapes the rootfs (resolves to {:?})",
            dest,
            real
        );
    }

    Ok(target)
}

/// Apply the user's custom bind mounts into the (not yet pivoted) rootfs.
pub fn setup_custom_binds(cfg: &DsConfig, rootfs: &Path) -> Result<()> {
    for bind in &cfg.binds {
        let target = validate_bind_dest(rootfs, &bind.dest)
            .with_context(|| format!("rejecting bind mount {:?}", bind.dest))?;
        bind_mount(&bind.src, &target)
            .with_context(|| format!("bind mount {:?} failed", bind.src))?;
        log::debug!("bind mounted {:?} -> {:?}", bind.src, target);
    }
    Ok(())
}

/// Loop-mount a rootfs image at `/mnt/Droidspaces/<name>`.
pub fn mount_rootfs_img(img: &Path, name: &str, readonly: bool) -> Result<PathBuf> {
    let mount_point = Path::new(registry::IMG_MOUNT_ROOT).join(name);
    utils::create_dir_all(&mount_point)?;

    if is_mountpoint(&mount_point) {
        log::warn!(
            "Mount point {} is already active, detaching first...",
            mount_point.display()
        );
        unmount_rootfs_img(&mount_point, true);
        utils::create_dir_all(&mount_point)?;
    }

    log::info!("Mounting rootfs image {} on {}...", img.display(), mount_point.display());

    let img_str = img.to_string_lossy();
    if utils::run_command_quiet(&["e2fsck", "-f", "-y", &img_str]) == 0 {
        log::info!("Image checked and repaired successfully.");
    }

    let opts = if readonly { "loop,ro" } else { "loop" };
    let mp_str = mount_point.to_string_lossy();
    if utils::run_command_quiet(&["mount", "-o", opts, &img_str, &mp_str]) != 0 {
        let _ = fs::remove_dir(&mount_point);
        bail!("failed to mount image {}", img.display());
    }

    Ok(mount_point)
}

/// Detach a loop mount. Lazy-unmount first, fall back to `umount -d -l`,
/// give the kernel a beat to release the loop device, then drop the
/// directory.
pub fn unmount_rootfs_img(mount_point: &Path, silent: bool) {
    if mount_point.as_os_str().is_empty() {
        return;
    }
    if !silent {
        log::info!("Unmounting {}...", mount_point.display());
    }

    let mp_str = mount_point.to_string_lossy().into_owned();
    if umount2(mount_point, MntFlags::MNT_DETACH).is_err() {
        utils::run_command_quiet(&["umount", "-d", "-l", &mp_str]);
    }

    thread::sleep(Duration::from_millis(100));
    let _ = fs::remove_dir(mount_point);
}

/// Filesystem type of `path` as seen inside pid's mount namespace.
pub fn get_container_mount_fstype(pid: Pid, path: &str) -> Option<String> {
    let content = utils::read_file(format!("/proc/{}/mounts", pid)).ok()?;
    fstype_from_mounts(&content, path)
}

fn fstype_from_mounts(mounts: &str, path: &str) -> Option<String> {
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let _src = fields.next()?;
        let mount_point = fields.next()?;
        let fstype = fields.next()?;
        if mount_point == path {
            return Some(fstype.to_string());
        }
    }
    None
}

pub fn detect_hw_access_in_container(pid: Pid) -> bool {
    get_container_mount_fstype(pid, "/dev").as_deref() == Some("devtmpfs")
}

pub fn detect_android_storage_in_container(pid: Pid) -> bool {
    get_container_mount_fstype(pid, "/storage/emulated/0").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_device_table_matches_kernel_majors() {
        let expect = [
            ("null", 1, 3),
            ("zero", 1, 5),
            ("full", 1, 7),
            ("random", 1, 8),
            ("urandom", 1, 9),
            ("tty", 5, 0),
            ("console", 5, 1),
            ("ptmx", 5, 2),
        ];
        for (name, major, minor) in expect.iter() {
            let spec = DEVICES.iter().find(|d| d.name == *name).expect("device listed");
            assert_eq!((spec.major, spec.minor), (*major, *minor), "{}", name);
        }
        assert_eq!(DEVICES.len(), expect.len());
    }

    #[test]
    fn test_validate_bind_dest_accepts_inside() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rootfs = dir.path();
        fs::create_dir_all(rootfs.join("mnt"))?;

        let target = validate_bind_dest(rootfs, Path::new("/mnt/share"))?;
        assert_eq!(target, rootfs.join("mnt/share"));
        Ok(())
    }

    #[test]
    fn test_validate_bind_dest_rejects_traversal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(validate_bind_dest(dir.path(), Path::new("/../../etc/passwd")).is_err());
        assert!(validate_bind_dest(dir.path(), Path::new("relative/path")).is_err());
        Ok(())
    }

    #[test]
    fn test_validate_bind_dest_rejects_symlink_escape() -> Result<()> {
        let outside = tempfile::tempdir()?;
        let dir = tempfile::tempdir()?;
        let rootfs = dir.path();

        // A symlinked ancestor pointing outside the rootfs is an escape.
        symlink(outside.path(), rootfs.join("evil"))?;
        assert!(validate_bind_dest(rootfs, Path::new("/evil/target")).is_err());

        // A symlink at the destination itself is refused outright.
        symlink("/etc", rootfs.join("link"))?;
        assert!(validate_bind_dest(rootfs, Path::new("/link")).is_err());
        Ok(())
    }

    #[test]
    fn test_fstype_from_mounts() {
        let mounts = "\
overlay / overlay rw,lowerdir=/a,upperdir=/b 0 0
proc /proc proc rw,nosuid,nodev,noexec 0 0
devtmpfs /dev devtmpfs rw,nosuid 0 0
/dev/fuse /storage/emulated/0 fuse rw 0 0
";
        assert_eq!(fstype_from_mounts(mounts, "/").as_deref(), Some("overlay"));
        assert_eq!(fstype_from_mounts(mounts, "/dev").as_deref(), Some("devtmpfs"));
        assert_eq!(
            fstype_from_mounts(mounts, "/storage/emulated/0").as_deref(),
            Some("fuse")
        );
        assert_eq!(fstype_from_mounts(mounts, "/absent"), None);
    }

    #[test]
    fn test_is_mountpoint_plain_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(!is_mountpoint(dir.path()));
        Ok(())
    }
}
