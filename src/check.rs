//! Preflight diagnostics: the quick gate lifecycle commands run, and the
//! full `check` report.

use std::fmt::Write as _;
use std::path::Path;
use std::process;

use anyhow::Result;
use nix::sched::{unshare, CloneFlags};
use nix::sys::statfs::statfs;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Uid};

use crate::utils;

const MIN_KERNEL: (u32, u32) = (3, 18);
const RECOMMENDED_KERNEL: (u32, u32) = (4, 14);

const RAMFS_MAGIC: libc::c_long = 0x8584_58f6u32 as libc::c_long;

/// Functional namespace probe: the child actually unshares, because /proc
/// exposure alone does not prove the kernel will let us.
fn check_ns(flag: CloneFlags, name: &str) -> bool {
    if !Path::new(&format!("/proc/self/ns/{}", name)).exists() {
        return false;
    }

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = if unshare(flag).is_ok() { 0 } else { 1 };
            process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => matches!(
            waitpid(child, None),
            Ok(WaitStatus::Exited(_, 0))
        ),
        Err(_) => false,
    }
}

/// pivot_root cannot run when / is the initramfs itself.
fn check_pivot_root() -> bool {
    match statfs("/") {
        Ok(st) => st.filesystem_type().0 != RAMFS_MAGIC,
        Err(_) => false,
    }
}

fn check_loop() -> bool {
    Path::new("/dev/loop-control").exists()
}

fn check_cgroup_v1(sub: &str) -> bool {
    Path::new("/sys/fs/cgroup").join(sub).exists()
}

fn check_cgroup_v2() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
        || utils::grep_file("/proc/mounts", "cgroup2")
}

fn check_seccomp() -> bool {
    let ret = unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) };
    ret >= 0 || nix::errno::Errno::last() == nix::errno::Errno::EINVAL
}

pub fn kernel_supported() -> bool {
    match utils::kernel_version() {
        Ok((major, minor)) => {
            (major, minor) >= MIN_KERNEL
        }
        Err(_) => false,
    }
}

pub fn validate_kernel_version() -> Result<()> {
    let (major, minor) = utils::kernel_version()?;
    if (major, minor) < MIN_KERNEL {
        println!("\n[ FATAL: UNSUPPORTED KERNEL ]\n");
        log::error!(
            "Droidspaces requires at least Linux {}.{}.0.",
            MIN_KERNEL.0,
            MIN_KERNEL.1
        );
        log::info!("Detected kernel: {}.{}", major, minor);
        log::info!("You can still use check, info, help, scan for diagnostics.");
        anyhow::bail!("unsupported kernel");
    }
    Ok(())
}

pub fn check_kernel_recommendation() {
    if let Ok((major, minor)) = utils::kernel_version() {
        if (major, minor) < RECOMMENDED_KERNEL {
            log::warn!(
                "Your kernel ({}.{}) is below recommended {}.{} - some functions might be unstable.",
                major,
                minor,
                RECOMMENDED_KERNEL.0,
                RECOMMENDED_KERNEL.1
            );
        }
    }
}

/// The fast gate before any lifecycle command touches the host.
pub fn check_requirements() -> Result<()> {
    let mut missing = Vec::new();

    if !check_ns(CloneFlags::CLONE_NEWNS, "mnt") {
        missing.push("mount namespace");
    }
    if !check_ns(CloneFlags::CLONE_NEWPID, "pid") {
        missing.push("PID namespace");
    }
    if !check_ns(CloneFlags::CLONE_NEWUTS, "uts") {
        missing.push("UTS namespace");
    }
    if !check_ns(CloneFlags::CLONE_NEWIPC, "ipc") {
        missing.push("IPC namespace");
    }
    if !(check_cgroup_v1("devices") || check_cgroup_v2()) {
        missing.push("cgroup support");
    }
    if !check_pivot_root() {
        missing.push("pivot_root support");
    }

    if !missing.is_empty() {
        for item in &missing {
            log::error!("Kernel feature missing: {}", item);
        }
        log::info!("Run 'check' for a detailed report.");
        anyhow::bail!("kernel requirements not met");
    }
    Ok(())
}

struct Report {
    buf: String,
    missing_must: usize,
}

impl Report {
    fn check(&mut self, name: &str, description: &str, ok: bool, must: bool) {
        let mark = if ok { "✓" } else { "✗" };
        let _ = writeln!(self.buf, "  [{}] {:<22} {}", mark, name, description);
        if !ok && must {
            self.missing_must += 1;
        }
    }
}

/// `check` — the full buffered report, printed in one shot so raw-mode
/// terminals do not interleave it.
pub fn check_requirements_detailed() -> Result<()> {
    let is_root = Uid::effective().is_root();
    let mut report = Report {
        buf: String::new(),
        missing_must: 0,
    };

    let _ = writeln!(report.buf, "\n[REQUIRED]");
    report.check("Root privileges", "Runtime must run as root", is_root, true);
    report.check(
        "Kernel version",
        "Linux 3.18 or newer",
        kernel_supported(),
        true,
    );
    report.check(
        "Mount namespace",
        "Filesystem isolation",
        check_ns(CloneFlags::CLONE_NEWNS, "mnt"),
        true,
    );
    report.check(
        "PID namespace",
        "Process tree isolation",
        check_ns(CloneFlags::CLONE_NEWPID, "pid"),
        true,
    );
    report.check(
        "UTS namespace",
        "Hostname/domainname isolation",
        check_ns(CloneFlags::CLONE_NEWUTS, "uts"),
        true,
    );
    report.check(
        "IPC namespace",
        "Inter-process communication isolation",
        check_ns(CloneFlags::CLONE_NEWIPC, "ipc"),
        true,
    );
    report.check(
        "devtmpfs support",
        "Kernel support for devtmpfs",
        utils::grep_file("/proc/filesystems", "devtmpfs"),
        true,
    );
    report.check(
        "cgroup support",
        "Control Groups (v1 or v2) support",
        check_cgroup_v1("devices") || check_cgroup_v2(),
        true,
    );
    report.check(
        "pivot_root syscall",
        "Kernel support for the pivot_root syscall",
        check_pivot_root(),
        true,
    );
    report.check(
        "/proc filesystem",
        "Proc filesystem mount support",
        Path::new("/proc/self").exists(),
        true,
    );
    report.check(
        "/sys filesystem",
        "Sys filesystem mount support",
        Path::new("/sys/kernel").exists(),
        true,
    );
    report.check(
        "Seccomp support",
        "Kernel support for Seccomp (Bypass Mode)",
        check_seccomp(),
        true,
    );

    let _ = writeln!(
        report.buf,
        "\n[RECOMMENDED]\nThese features improve functionality but are not strictly required:\n"
    );
    report.check(
        "Cgroup namespace",
        "Scoped cgroup views (Linux 4.6+)",
        Path::new("/proc/self/ns/cgroup").exists(),
        false,
    );
    report.check(
        "PTY support",
        "Unix98 PTY support",
        Path::new("/dev/ptmx").exists(),
        false,
    );
    report.check(
        "devpts support",
        "Virtual terminal filesystem support",
        Path::new("/dev/pts").exists(),
        false,
    );
    report.check(
        "Loop device",
        "Required for rootfs.img mounting",
        check_loop(),
        false,
    );
    report.check(
        "ext4 filesystem",
        "Ext4 filesystem support",
        utils::grep_file("/proc/filesystems", "ext4"),
        false,
    );

    let _ = writeln!(
        report.buf,
        "\n[OPTIONAL]\nThese features are optional and only used for specific functionality:\n"
    );
    report.check(
        "IPv6 support",
        "IPv6 networking support",
        Path::new("/proc/sys/net/ipv6").exists(),
        false,
    );
    report.check(
        "FUSE support",
        "Filesystem in Userspace support",
        Path::new("/dev/fuse").exists() || utils::grep_file("/proc/filesystems", "fuse"),
        false,
    );
    report.check(
        "TUN/TAP support",
        "Virtual network device support",
        Path::new("/dev/net/tun").exists(),
        false,
    );
    report.check(
        "OverlayFS support",
        "Required for --volatile mode",
        utils::grep_file("/proc/filesystems", "overlay"),
        false,
    );

    let _ = writeln!(report.buf, "\nSummary:");
    if report.missing_must > 0 {
        let _ = writeln!(
            report.buf,
            "  [✗] {} required feature(s) missing - Droidspaces will not work",
            report.missing_must
        );
    } else {
        let _ = writeln!(report.buf, "  [✓] All required features found!");
    }
    if !is_root {
        let _ = writeln!(
            report.buf,
            "\n[!] Warning: You are not root. Some checks may be inaccurate."
        );
    }
    let _ = writeln!(report.buf);

    print!("{}", report.buf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_gate_constants_ordered() {
        assert!(MIN_KERNEL < RECOMMENDED_KERNEL);
    }

    #[test]
    fn test_kernel_supported_on_test_host() {
        // Any machine able to build this crate runs a far newer kernel.
        assert!(kernel_supported());
    }

    #[test]
    fn test_pivot_root_probe() {
        // The probe must not panic regardless of the root filesystem.
        let _ = check_pivot_root();
    }
}
