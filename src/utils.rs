//! Small syscall and filesystem helpers shared by every layer.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoVec;
use nix::sys::utsname::uname;
use nix::unistd::Pid;

/// Longest file read `grep_file` will attempt. Marker and table files the
/// runtime greps are all far below this.
const GREP_READ_CAP: usize = 16 * 1024;

pub fn write_file<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, contents).with_context(|| format!("failed to write to {:?}", path))?;
    Ok(())
}

/// Write-then-rename so readers never observe a half-written file.
pub fn write_file_atomic<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<()> {
    let path = path.as_ref();
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).with_context(|| format!("failed to write to {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to commit {:?}", path))?;
    Ok(())
}

/// Whole-file read with trailing newline/CR stripped.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    Ok(content.trim_end_matches(|c| c == '\n' || c == '\r').to_string())
}

pub fn create_dir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).with_context(|| format!("failed to create directory {:?}", path))
}

/// 32 lowercase hex chars from the kernel CSPRNG.
pub fn generate_uuid() -> Result<String> {
    let mut raw = [0u8; 16];
    File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut raw))
        .context("failed to read /dev/urandom")?;

    Ok(raw.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Every numeric entry of `/proc`, i.e. every visible PID.
pub fn collect_pids() -> Result<Vec<Pid>> {
    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc").context("failed to read /proc")? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) {
            if pid > 0 {
                pids.push(Pid::from_raw(pid));
            }
        }
    }
    Ok(pids)
}

/// `/proc/<pid>/root<suffix>` — the container-relative view of a path.
pub fn proc_root_path(pid: Pid, suffix: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{}/root{}", pid, suffix))
}

/// Substring search over a capped read of `path`. Returns false when the
/// file is unreadable.
pub fn grep_file<P: AsRef<Path>>(path: P, pattern: &str) -> bool {
    let mut buf = vec![0u8; GREP_READ_CAP];
    let n = match File::open(path.as_ref()).and_then(|mut f| f.read(&mut buf)) {
        Ok(n) => n,
        Err(_) => return false,
    };
    String::from_utf8_lossy(&buf[..n]).contains(pattern)
}

/// Run a command without a shell, returning its exit code. A process that
/// cannot be spawned reports 127, matching what execvp failure would yield.
pub fn run_command(argv: &[&str]) -> i32 {
    run(argv, false)
}

/// Like [`run_command`] but with stdout/stderr discarded.
pub fn run_command_quiet(argv: &[&str]) -> i32 {
    run(argv, true)
}

fn run(argv: &[&str], quiet: bool) -> i32 {
    if argv.is_empty() {
        return 127;
    }

    let mut cmd = Command::new(argv[0]);
    cmd.args(&argv[1..]);
    if quiet {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }

    match cmd.status() {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => 127,
    }
}

/// Replace the current process image, searching PATH. Only returns on error.
pub fn do_exec(path: impl AsRef<Path>, args: &[String]) -> Result<()> {
    let p = CString::new(path.as_ref().to_string_lossy().to_string())?;
    let a: Vec<CString> = args
        .iter()
        .map(|s| CString::new(s.to_string()).unwrap_or_default())
        .collect();
    nix::unistd::execvp(&p, &a)?;
    Ok(())
}

/// Pass an open descriptor across a Unix socket (SCM_RIGHTS).
pub fn send_fd(sock: RawFd, fd: RawFd) -> Result<()> {
    let iov = [IoVec::from_slice(b"FD")];
    let fds = [fd];
    let cmsg = ControlMessage::ScmRights(&fds);
    sendmsg(sock, &iov, &[cmsg], MsgFlags::empty(), None).context("failed to send fd")?;
    Ok(())
}

/// Receive a descriptor sent with [`send_fd`].
pub fn recv_fd(sock: RawFd) -> Result<RawFd> {
    let mut buf = [0u8; 2];
    let iov = [IoVec::from_mut_slice(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg(sock, &iov, Some(&mut cmsg_buffer), MsgFlags::empty())
        .context("failed to receive fd")?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.first() {
                return Ok(*fd);
            }
        }
    }

    bail!("no fd in control message")
}

/// Parsed `uname.release` major/minor.
pub fn kernel_version() -> Result<(u32, u32)> {
    let uts = uname();
    let release = uts.release();
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next().and_then(|s| s.parse().ok());
    let minor = parts.next().and_then(|s| s.parse().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => Ok((major, minor)),
        _ => bail!("unparseable kernel release: {}", release),
    }
}

const FW_PATH_FILE: &str = "/sys/module/firmware_class/parameters/path";

/// Prepend `<rootfs>/lib/firmware` to the kernel firmware search path so
/// drivers probed by a hw-access container find their blobs. Idempotent.
pub fn firmware_path_add_rootfs(rootfs: &Path) {
    firmware_path_add_at(Path::new(FW_PATH_FILE), rootfs)
}

pub fn firmware_path_remove_rootfs(rootfs: &Path) {
    firmware_path_remove_at(Path::new(FW_PATH_FILE), rootfs)
}

fn firmware_dir(rootfs: &Path) -> String {
    format!("{}/lib/firmware", rootfs.display())
}

fn firmware_path_add_at(fw_file: &Path, rootfs: &Path) {
    let fw_path = firmware_dir(rootfs);
    if !Path::new(&fw_path).is_dir() {
        return;
    }

    let current = read_file(fw_file).unwrap_or_default();
    if current.contains(&fw_path) {
        return;
    }

    let new_path = if current.is_empty() {
        fw_path
    } else {
        format!("{}:{}", fw_path, current)
    };
    let _ = write_file(fw_file, new_path);
}

fn firmware_path_remove_at(fw_file: &Path, rootfs: &Path) {
    let fw_path = firmware_dir(rootfs);
    let current = match read_file(fw_file) {
        Ok(c) => c,
        Err(_) => return,
    };
    if !current.contains(&fw_path) {
        return;
    }

    let new_path: Vec<&str> = current
        .split(':')
        .filter(|entry| *entry != fw_path && !entry.is_empty())
        .collect();
    let _ = write_file(fw_file, new_path.join(":"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_read_file_strips_trailing_newlines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pidfile");
        fs::write(&path, "12345\r\n")?;
        assert_eq!(read_file(&path)?, "12345");

        fs::write(&path, "plain")?;
        assert_eq!(read_file(&path)?, "plain");
        Ok(())
    }

    #[test]
    fn test_write_file_atomic_replaces_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state");
        write_file_atomic(&path, "one")?;
        write_file_atomic(&path, "two")?;
        assert_eq!(read_file(&path)?, "two");
        assert!(!dir.path().join("state.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_generate_uuid_shape() -> Result<()> {
        let uuid = generate_uuid()?;
        assert_eq!(uuid.len(), 32);
        assert!(uuid.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(uuid, generate_uuid()?);
        Ok(())
    }

    #[test]
    fn test_collect_pids_contains_self() -> Result<()> {
        let me = Pid::from_raw(std::process::id() as i32);
        let pids = collect_pids()?;
        assert!(pids.contains(&me));
        Ok(())
    }

    #[test]
    fn test_grep_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("group");
        fs::write(&path, "root:x:0:\naid_inet:x:3003:\n")?;
        assert!(grep_file(&path, "aid_inet"));
        assert!(!grep_file(&path, "aid_net_admin"));
        assert!(!grep_file(dir.path().join("absent"), "anything"));
        Ok(())
    }

    #[test]
    fn test_run_command_exit_codes() {
        assert_eq!(run_command_quiet(&["true"]), 0);
        assert_eq!(run_command_quiet(&["false"]), 1);
        assert_eq!(run_command_quiet(&["/nonexistent/binary"]), 127);
    }

    #[test]
    fn test_kernel_version_parses() -> Result<()> {
        let (major, _minor) = kernel_version()?;
        assert!(major >= 3);
        Ok(())
    }

    #[test]
    fn test_firmware_path_add_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(rootfs.join("lib/firmware"))?;
        let fw_file = dir.path().join("fw_path");
        fs::write(&fw_file, "/lib/firmware")?;

        firmware_path_add_at(&fw_file, &rootfs);
        firmware_path_add_at(&fw_file, &rootfs);
        let expect = format!("{}/lib/firmware:/lib/firmware", rootfs.display());
        assert_eq!(read_file(&fw_file)?, expect);

        firmware_path_remove_at(&fw_file, &rootfs);
        assert_eq!(read_file(&fw_file)?, "/lib/firmware");
        Ok(())
    }

    #[test]
    fn test_fd_passing_roundtrip() -> Result<()> {
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
        use nix::unistd::{close, read as nix_read, write as nix_write};

        let (left, right) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        let (pipe_r, pipe_w) = nix::unistd::pipe()?;

        send_fd(left, pipe_w)?;
        let received = recv_fd(right)?;

        nix_write(received, b"ping")?;
        let mut buf = [0u8; 4];
        nix_read(pipe_r, &mut buf)?;
        assert_eq!(&buf, b"ping");

        for fd in [left, right, pipe_r, pipe_w, received].iter() {
            let _ = close(*fd);
        }
        Ok(())
    }
}
