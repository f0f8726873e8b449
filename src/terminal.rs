//! PTY allocation and terminal plumbing.

use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::openpty;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::stat::{fchmod, Mode};
use nix::sys::termios::{
    tcgetattr, tcsetattr, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios,
};
use nix::unistd::{close, dup2, isatty, read, setsid, write};

use crate::config::TtyInfo;

const TTY_GID: libc::gid_t = 5;

/// Allocate a master/slave PTY pair. The slave is owned root:tty, mode
/// 0620, and both ends are close-on-exec so they never leak into the
/// container payload.
pub fn create(label: &str) -> Result<TtyInfo> {
    let pty = openpty(None, None).context("could not create pseudo terminal")?;

    // Resolve the slave device path; it gets bind-mounted as
    // /dev/console or /dev/ttyN later.
    let name = PathBuf::from(
        nix::fcntl::readlink(format!("/proc/self/fd/{}", pty.slave).as_str())
            .with_context(|| format!("could not resolve {} pty slave path", label))?,
    );

    // Ownership failures are non-fatal; some hosts have no tty group.
    if unsafe { libc::fchown(pty.slave, 0, TTY_GID) } < 0 {
        log::debug!("fchown({}) failed", name.display());
    }
    if let Err(e) = fchmod(pty.slave, Mode::from_bits_truncate(0o620)) {
        log::debug!("fchmod({}) failed: {}", name.display(), e);
    }

    fcntl(pty.master, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    fcntl(pty.slave, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

    Ok(TtyInfo {
        master: pty.master,
        slave: pty.slave,
        name,
    })
}

/// Duplicate `fd` onto stdin/stdout/stderr.
pub fn set_stdfds(fd: RawFd) -> Result<()> {
    dup2(fd, 0)?;
    dup2(fd, 1)?;
    dup2(fd, 2)?;
    Ok(())
}

/// Start a new session and take `fd` as the controlling terminal.
pub fn make_controlling(fd: RawFd) -> Result<()> {
    match setsid() {
        Ok(_) => {}
        // EPERM means we already lead a session, which is fine.
        Err(Errno::EPERM) => {}
        Err(e) => return Err(e).context("setsid failed"),
    }

    if unsafe { libc::ioctl(fd, libc::TIOCSCTTY, 0) } < 0 {
        anyhow::bail!("TIOCSCTTY failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Put `fd` into the raw-ish discipline the proxy loops need: no canonical
/// processing, echo, or signal keys; OPOST stays on so container output
/// keeps working when the inner side stops emitting carriage returns.
/// Returns the previous termios for restoration.
pub fn setup_raw_tios(fd: RawFd) -> Result<Termios> {
    if !isatty(fd).unwrap_or(false) {
        anyhow::bail!("fd {} is not a tty", fd);
    }

    let old = tcgetattr(fd)?;
    let mut tios = old.clone();

    tios.input_flags |= InputFlags::IGNPAR;
    tios.input_flags &= !(InputFlags::ISTRIP
        | InputFlags::INLCR
        | InputFlags::IGNCR
        | InputFlags::ICRNL
        | InputFlags::IXON
        | InputFlags::IXANY
        | InputFlags::IXOFF);
    tios.local_flags &= !(LocalFlags::TOSTOP
        | LocalFlags::ISIG
        | LocalFlags::ICANON
        | LocalFlags::ECHO
        | LocalFlags::ECHOE
        | LocalFlags::ECHOK
        | LocalFlags::ECHONL
        | LocalFlags::IEXTEN);
    tios.output_flags |= OutputFlags::OPOST;
    tios.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    tcsetattr(fd, SetArg::TCSAFLUSH, &tios)?;
    Ok(old)
}

pub fn restore_tios(fd: RawFd, old: &Termios) {
    let _ = tcsetattr(fd, SetArg::TCSAFLUSH, old);
}

pub fn get_winsize(fd: RawFd) -> Option<libc::winsize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) } == 0 {
        Some(ws)
    } else {
        None
    }
}

pub fn set_winsize(fd: RawFd, ws: &libc::winsize) {
    unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, ws) };
}

/// Copy the host terminal's window size onto a PTY master, if stdin is a
/// terminal at all.
pub fn sync_winsize_from_stdin(master: RawFd) {
    if isatty(0).unwrap_or(false) {
        if let Some(ws) = get_winsize(0) {
            set_winsize(master, &ws);
        }
    }
}

/// `container_ttys=` value: slave device paths joined by spaces.
pub fn container_ttys_string(ttys: &[TtyInfo]) -> String {
    ttys.iter()
        .map(|t| t.name.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

// The classical-handler SIGWINCH path for the enter proxy; the console
// loop uses a signalfd instead.
static PROXY_MASTER_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_sigwinch(_sig: libc::c_int) {
    let master = PROXY_MASTER_FD.load(Ordering::SeqCst);
    if master < 0 {
        return;
    }
    if let Some(ws) = get_winsize(0) {
        set_winsize(master, &ws);
    }
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("write failed"),
        }
    }
    Ok(())
}

/// Duplex proxy between host stdin/stdout and a PTY master. Returns on
/// EOF or hangup on either side. Resize events on the host terminal are
/// forwarded to the master while the loop runs.
pub fn proxy(master: RawFd) -> Result<()> {
    let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;

    PROXY_MASTER_FD.store(master, Ordering::SeqCst);
    handle_sigwinch(libc::SIGWINCH);
    let old_handler = unsafe {
        signal::signal(Signal::SIGWINCH, SigHandler::Handler(handle_sigwinch))?
    };

    epoll_ctl(
        epfd,
        EpollOp::EpollCtlAdd,
        0,
        &mut EpollEvent::new(EpollFlags::EPOLLIN, 0),
    )?;
    epoll_ctl(
        epfd,
        EpollOp::EpollCtlAdd,
        master,
        &mut EpollEvent::new(
            EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
            master as u64,
        ),
    )?;

    let mut buf = [0u8; 8192];
    let mut events = [EpollEvent::empty(); 10];

    'outer: loop {
        let nfds = match epoll_wait(epfd, &mut events, -1) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                let _ = close(epfd);
                return Err(e).context("epoll_wait failed");
            }
        };

        for event in events.iter().take(nfds) {
            if event.data() == 0 {
                let n = match read(0, &mut buf) {
                    Ok(n) if n > 0 => n,
                    _ => break 'outer,
                };
                if write_all(master, &buf[..n]).is_err() {
                    break 'outer;
                }
            } else {
                if event
                    .events()
                    .intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
                {
                    break 'outer;
                }
                let n = match read(master, &mut buf) {
                    Ok(n) if n > 0 => n,
                    _ => break 'outer,
                };
                if write_all(1, &buf[..n]).is_err() {
                    break 'outer;
                }
            }
        }
    }

    unsafe {
        let _ = signal::signal(Signal::SIGWINCH, old_handler);
    }
    PROXY_MASTER_FD.store(-1, Ordering::SeqCst);
    let _ = close(epfd);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_create_allocates_pair() -> Result<()> {
        let tty = create("test")?;
        assert!(tty.master >= 0);
        assert!(tty.slave >= 0);
        assert!(tty.name.starts_with("/dev/pts") || tty.name.starts_with("/dev"));

        // Both ends must be close-on-exec.
        for fd in [tty.master, tty.slave].iter() {
            let flags = fcntl(*fd, FcntlArg::F_GETFD)?;
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }

        let _ = close(tty.master);
        let _ = close(tty.slave);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_master_slave_are_connected() -> Result<()> {
        let tty = create("test")?;
        write(tty.master, b"hi\n")?;
        let mut buf = [0u8; 8];
        let n = read(tty.slave, &mut buf)?;
        assert!(n >= 2);
        assert_eq!(&buf[..2], b"hi");
        let _ = close(tty.master);
        let _ = close(tty.slave);
        Ok(())
    }

    #[test]
    fn test_container_ttys_string() {
        let ttys = vec![
            TtyInfo {
                master: -1,
                slave: -1,
                name: PathBuf::from("/dev/pts/3"),
            },
            TtyInfo {
                master: -1,
                slave: -1,
                name: PathBuf::from("/dev/pts/4"),
            },
        ];
        assert_eq!(container_ttys_string(&ttys), "/dev/pts/3 /dev/pts/4");
        assert_eq!(container_ttys_string(&[]), "");
    }

    #[test]
    #[serial]
    fn test_winsize_roundtrip() -> Result<()> {
        let tty = create("test")?;
        let ws = libc::winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        set_winsize(tty.master, &ws);
        let got = get_winsize(tty.slave).expect("winsize readable");
        assert_eq!(got.ws_row, 24);
        assert_eq!(got.ws_col, 80);
        let _ = close(tty.master);
        let _ = close(tty.slave);
        Ok(())
    }
}
