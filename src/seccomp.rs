//! Seccomp-BPF shield for legacy Android kernels.
//!
//! Kernels below 5.0 deadlock in two places when systemd boots inside a
//! container: keyring syscalls under file-based encryption, and
//! namespace-creating unshare/clone from sandboxed services, which can
//! wedge the VFS in grab_super(). The filter turns the first group into
//! ENOSYS and, for systemd rootfs only, the second into EPERM; everything
//! else passes through.

use anyhow::{bail, Result};
use libc::{sock_filter, sock_fprog};

use crate::utils;

// BPF instruction classes and fields, from linux/bpf_common.h.
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JA: u16 = 0x00;
const BPF_JEQ: u16 = 0x10;
const BPF_JSET: u16 = 0x40;
const BPF_K: u16 = 0x00;

// Filter return codes, from linux/seccomp.h.
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

// struct seccomp_data field offsets.
const SECCOMP_DATA_NR_OFFSET: u32 = 0;
const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
const SECCOMP_DATA_ARG0_OFFSET: u32 = 16;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_CURRENT: u32 = 62 | 0x8000_0000 | 0x4000_0000;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_CURRENT: u32 = 183 | 0x8000_0000 | 0x4000_0000;
#[cfg(target_arch = "arm")]
const AUDIT_ARCH_CURRENT: u32 = 40 | 0x4000_0000;
#[cfg(target_arch = "x86")]
const AUDIT_ARCH_CURRENT: u32 = 3 | 0x4000_0000;

/// Every namespace-creating CLONE_NEW* flag.
const NS_FLAGS_MASK: u32 = 0x7E02_0000;

fn stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, jt: u8, jf: u8, k: u32) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

fn errno_ret(errno: i32) -> sock_filter {
    stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO | (errno as u32 & SECCOMP_RET_DATA))
}

fn build_filter(is_systemd: bool) -> Vec<sock_filter> {
    let mut filter = vec![
        // Validate architecture; foreign-arch (compat) syscalls pass.
        stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH_OFFSET),
        jump(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, AUDIT_ARCH_CURRENT),
        stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
        // Load the syscall number.
        stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR_OFFSET),
        // Keyring syscalls report "not implemented".
        jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, libc::SYS_keyctl as u32),
        errno_ret(libc::ENOSYS),
        jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, libc::SYS_add_key as u32),
        errno_ret(libc::ENOSYS),
        jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, libc::SYS_request_key as u32),
        errno_ret(libc::ENOSYS),
        // Non-systemd rootfs: skip the namespace shield entirely. The
        // unconditional-jump offset lives in k.
        stmt(BPF_JMP | BPF_JA, if is_systemd { 0 } else { 5 }),
        // unshare/clone with namespace flags report EPERM.
        jump(BPF_JMP | BPF_JEQ | BPF_K, 1, 0, libc::SYS_unshare as u32),
        jump(BPF_JMP | BPF_JEQ | BPF_K, 0, 3, libc::SYS_clone as u32),
        stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARG0_OFFSET),
        jump(BPF_JMP | BPF_JSET | BPF_K, 0, 1, NS_FLAGS_MASK),
        errno_ret(libc::EPERM),
    ];
    filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    filter
}

/// Install the shield when the running kernel needs it. On 5.0+ no filter
/// is installed at all.
pub fn apply_legacy_kernel_filter(is_systemd: bool) -> Result<()> {
    let (major, minor) = utils::kernel_version()?;
    if major >= 5 {
        return Ok(());
    }

    log::info!(
        "Legacy kernel ({}.{}) detected: Applying Android compatibility shield...",
        major,
        minor
    );

    let mut filter = build_filter(is_systemd);
    let prog = sock_fprog {
        len: filter.len() as u16,
        filter: filter.as_mut_ptr(),
    };

    if let Err(e) = prctl::set_no_new_privileges(true) {
        bail!("PR_SET_NO_NEW_PRIVS failed: errno {}", e);
    }

    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER as libc::c_ulong,
            &prog as *const sock_fprog,
        )
    };
    if ret < 0 {
        bail!(
            "failed to apply seccomp filter: {}",
            std::io::Error::last_os_error()
        );
    }

    Ok(())
}

/// A rootfs boots systemd when its /sbin/init resolves to a systemd
/// binary. Checked on the host, where absolute symlink targets must be
/// re-rooted by hand.
pub fn is_systemd_rootfs(rootfs: &std::path::Path) -> bool {
    let init = rootfs.join("sbin/init");
    match std::fs::read_link(&init) {
        Ok(target) => target.to_string_lossy().contains("systemd"),
        Err(_) => {
            // Not a symlink; a real file named init could still be systemd,
            // but only the link layout is detectable cheaply.
            rootfs.join("lib/systemd/systemd").exists()
                || rootfs.join("usr/lib/systemd/systemd").exists()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_shape() {
        let systemd = build_filter(true);
        let plain = build_filter(false);

        // Same program either way; only the skip jump differs.
        assert_eq!(systemd.len(), plain.len());
        assert_eq!(systemd.len(), 17);

        // Both must terminate with an unconditional allow.
        let last = systemd.last().unwrap();
        assert_eq!(last.code, BPF_RET | BPF_K);
        assert_eq!(last.k, SECCOMP_RET_ALLOW);

        // The systemd variant falls through into the namespace shield; the
        // plain variant jumps straight past its 5 instructions.
        let idx = 10;
        assert_eq!(systemd[idx].k, 0);
        assert_eq!(plain[idx].k, 5);
    }

    #[test]
    fn test_namespace_mask_covers_all_clone_new_flags() {
        let mask = NS_FLAGS_MASK as libc::c_int;
        for flag in [
            libc::CLONE_NEWNS,
            libc::CLONE_NEWCGROUP,
            libc::CLONE_NEWUTS,
            libc::CLONE_NEWIPC,
            libc::CLONE_NEWUSER,
            libc::CLONE_NEWPID,
            libc::CLONE_NEWNET,
        ]
        .iter()
        {
            assert_eq!(mask & flag, *flag);
        }
    }

    #[test]
    fn test_errno_ret_encodes_errno() {
        let insn = errno_ret(libc::ENOSYS);
        assert_eq!(insn.k & !SECCOMP_RET_DATA, SECCOMP_RET_ERRNO);
        assert_eq!((insn.k & SECCOMP_RET_DATA) as i32, libc::ENOSYS);
    }

    #[test]
    fn test_systemd_rootfs_detection() -> Result<()> {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("sbin"))?;
        symlink("/lib/systemd/systemd", dir.path().join("sbin/init"))?;
        assert!(is_systemd_rootfs(dir.path()));

        let plain = tempfile::tempdir()?;
        std::fs::create_dir_all(plain.path().join("sbin"))?;
        std::fs::write(plain.path().join("sbin/init"), "#!/bin/sh\n")?;
        assert!(!is_systemd_rootfs(plain.path()));
        Ok(())
    }
}
