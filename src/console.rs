//! Foreground console loop: multiplex the host terminal, the container's
//! console PTY master, and a signalfd until either side of the process
//! tree goes away.

use std::convert::TryFrom;
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, read, write, Pid};

use crate::terminal;

const TOKEN_STDIN: u64 = 0;
const TOKEN_MASTER: u64 = 1;
const TOKEN_SIGNAL: u64 = 2;

fn write_all(fd: RawFd, mut buf: &[u8]) {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}

/// Run until the monitor or init exits, EOF/hangup shows up on the master,
/// or the user's terminal dies. SIGINT/SIGTERM are forwarded to the
/// container init rather than handled here; SIGWINCH keeps the inner
/// console sized like the outer terminal.
pub fn console_monitor_loop(master: RawFd, monitor_pid: Pid, container_pid: Pid) -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGWINCH);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
        .context("failed to block console signals")?;

    let mut sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        .context("failed to create signalfd")?;

    let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
    if let Err(e) = epoll_ctl(
        epfd,
        EpollOp::EpollCtlAdd,
        0,
        &mut EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_STDIN),
    ) {
        log::warn!("epoll_ctl(stdin) failed: {}", e);
    }
    epoll_ctl(
        epfd,
        EpollOp::EpollCtlAdd,
        master,
        &mut EpollEvent::new(
            EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
            TOKEN_MASTER,
        ),
    )?;
    epoll_ctl(
        epfd,
        EpollOp::EpollCtlAdd,
        sfd.as_raw_fd(),
        &mut EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SIGNAL),
    )?;

    let old_tios = terminal::setup_raw_tios(0).ok();
    terminal::sync_winsize_from_stdin(master);

    let mut buf = [0u8; 4096];
    let mut events = [EpollEvent::empty(); 10];
    let mut result = Ok(());

    'outer: loop {
        let nfds = match epoll_wait(epfd, &mut events, -1) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                result = Err(e).context("console epoll failed");
                break;
            }
        };

        for event in events.iter().take(nfds) {
            match event.data() {
                TOKEN_STDIN => {
                    match read(0, &mut buf) {
                        Ok(n) if n > 0 => write_all(master, &buf[..n]),
                        // EOF on the host terminal: keep showing container
                        // output, there is just nothing left to forward.
                        _ => {}
                    }
                }
                TOKEN_MASTER => {
                    if event
                        .events()
                        .intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
                    {
                        break 'outer;
                    }
                    match read(master, &mut buf) {
                        Ok(n) if n > 0 => write_all(1, &buf[..n]),
                        _ => break 'outer,
                    }
                }
                TOKEN_SIGNAL => {
                    let info = match sfd.read_signal() {
                        Ok(Some(info)) => info,
                        _ => continue,
                    };
                    match info.ssi_signo as i32 {
                        libc::SIGCHLD => loop {
                            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                                Ok(WaitStatus::StillAlive) | Err(_) => break,
                                Ok(status) => {
                                    let pid = status.pid();
                                    if pid == Some(monitor_pid) || pid == Some(container_pid) {
                                        break 'outer;
                                    }
                                }
                            }
                        },
                        libc::SIGWINCH => terminal::sync_winsize_from_stdin(master),
                        signo @ (libc::SIGINT | libc::SIGTERM) => {
                            // The container decides what interrupt means.
                            let _ = kill(container_pid, Signal::try_from(signo).ok());
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    if let Some(tios) = old_tios {
        terminal::restore_tios(0, &tios);
    }
    let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None);
    let _ = close(epfd);
    result
}
