//! `enter` and `run` — inject a process into a running container's
//! namespaces.

use std::ffi::CString;
use std::path::Path;
use std::process;

use anyhow::{bail, Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::signal::kill;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, close, execve, fork, ForkResult, Pid};

use crate::boot;
use crate::cgroups;
use crate::config::DsConfig;
use crate::container::info::check_status;
use crate::terminal;
use crate::utils;

/// Join the target's namespaces. The mount namespace is mandatory; the
/// others are best-effort because old kernels may not expose them. All
/// descriptors are opened before the first setns, while /proc still shows
/// the caller's view.
pub fn enter_namespace(pid: Pid) -> Result<()> {
    if kill(pid, None).is_err() {
        log::error!("Container PID {} is no longer alive.", pid);
        bail!("container process gone");
    }

    let namespaces = ["mnt", "uts", "ipc", "pid", "cgroup"];
    let mut fds = Vec::with_capacity(namespaces.len());

    for (i, ns) in namespaces.iter().enumerate() {
        let path = format!("/proc/{}/ns/{}", pid, ns);
        match open(path.as_str(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(fd) => fds.push(Some(fd)),
            Err(e) => {
                if i == 0 {
                    log::error!("Failed to open mount namespace at {}: {}", path, e);
                    for fd in fds.into_iter().flatten() {
                        let _ = close(fd);
                    }
                    bail!("mount namespace unavailable");
                }
                if e != nix::errno::Errno::ENOENT {
                    log::warn!("Optional namespace {} ({}) is missing: {}", ns, path, e);
                }
                fds.push(None);
            }
        }
    }

    for (i, fd) in fds.into_iter().enumerate() {
        let fd = match fd {
            Some(fd) => fd,
            None => continue,
        };
        match setns(fd, CloneFlags::empty()) {
            Ok(()) => {}
            Err(e) if i == 0 => {
                let _ = close(fd);
                log::error!("setns(mnt) failed: {}", e);
                bail!("cannot join mount namespace");
            }
            Err(e) => log::warn!("setns({}) failed (ignored): {}", namespaces[i], e),
        }
        let _ = close(fd);
    }

    Ok(())
}

fn exec_login_shell(user: Option<&str>) -> Result<()> {
    boot::setup_container_env();
    std::env::set_var("LANG", "C.UTF-8");
    boot::load_etc_environment();

    let environ: Vec<CString> = std::env::vars()
        .map(|(k, v)| CString::new(format!("{}={}", k, v)).unwrap_or_default())
        .collect();

    if let Some(user) = user {
        let argv = [
            CString::new("su").unwrap(),
            CString::new("-l").unwrap(),
            CString::new(user).unwrap(),
        ];
        for su in ["/bin/su", "/usr/bin/su"].iter() {
            let _ = execve(&CString::new(*su).unwrap(), &argv, &environ);
        }
    }

    for shell in ["/bin/bash", "/bin/ash", "/bin/sh"].iter() {
        let path = Path::new(shell);
        if !path.exists() {
            continue;
        }
        let base = path.file_name().unwrap().to_string_lossy();
        let argv = [
            CString::new(base.as_ref()).unwrap(),
            CString::new("-l").unwrap(),
        ];
        let _ = execve(&CString::new(*shell).unwrap(), &argv, &environ);
    }

    log::error!("Failed to find any usable shell");
    bail!("no usable shell")
}

pub fn enter_rootfs(cfg: &mut DsConfig, user: Option<&str>) -> Result<()> {
    let pid = match check_status(cfg) {
        Some(pid) => pid,
        None => {
            log::error!(
                "Container '{}' is not running or invalid.",
                cfg.name.as_deref().unwrap_or("?")
            );
            bail!("container not running");
        }
    };

    log::info!(
        "Entering container '{}' as {}...",
        cfg.name.as_deref().unwrap_or("?"),
        user.unwrap_or("root")
    );

    let (parent_sock, child_sock) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )?;

    let child = match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => {
            let _ = close(parent_sock);

            // Sit inside the container's cgroup subtree on the host first,
            // so logind inside can move the session into its scopes.
            let _ = cgroups::attach(pid);

            if enter_namespace(pid).is_err() {
                process::exit(1);
            }

            // The PTY must come from the container's own devpts.
            let tty = match terminal::create("enter") {
                Ok(tty) => tty,
                Err(_) => process::exit(1),
            };
            if utils::send_fd(child_sock, tty.master).is_err() {
                process::exit(1);
            }
            let _ = close(tty.master);
            let _ = close(child_sock);

            // A second fork actually lands in the PID namespace.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    // The controlling terminal must belong to the process
                    // that execs the shell: login(1) does its own setsid
                    // and could never re-acquire the tty from a sibling.
                    if terminal::make_controlling(tty.slave).is_err() {
                        process::exit(1);
                    }
                    if terminal::set_stdfds(tty.slave).is_err() {
                        process::exit(1);
                    }
                    if tty.slave > 2 {
                        let _ = close(tty.slave);
                    }
                    if chdir("/").is_err() {
                        process::exit(1);
                    }
                    let _ = exec_login_shell(user);
                    process::exit(1);
                }
                Ok(ForkResult::Parent { child: shell_pid }) => {
                    let _ = close(tty.slave);
                    let _ = waitpid(shell_pid, None);
                    process::exit(0);
                }
                Err(_) => process::exit(1),
            }
        }
        ForkResult::Parent { child } => child,
    };
    let _ = close(child_sock);

    let master = match utils::recv_fd(parent_sock) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = close(parent_sock);
            let _ = waitpid(child, None);
            log::error!("Failed to receive PTY master from child: {}", e);
            bail!("no pty from container");
        }
    };
    let _ = close(parent_sock);

    // Size the inner terminal before the shell starts so full-screen
    // programs come up right.
    terminal::sync_winsize_from_stdin(master);

    let old_tios = terminal::setup_raw_tios(0).ok();
    let _ = terminal::proxy(master);
    if let Some(tios) = old_tios {
        terminal::restore_tios(0, &tios);
    }

    let _ = close(master);
    let _ = waitpid(child, None);
    Ok(())
}

pub fn run_in_rootfs(cfg: &mut DsConfig, args: &[String]) -> Result<i32> {
    let pid = match check_status(cfg) {
        Some(pid) => pid,
        None => {
            log::error!(
                "Container '{}' is not running or invalid.",
                cfg.name.as_deref().unwrap_or("?")
            );
            bail!("container not running");
        }
    };

    let child = match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => {
            if enter_namespace(pid).is_err() {
                process::exit(1);
            }

            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    if chdir("/").is_err() {
                        process::exit(1);
                    }
                    boot::setup_container_env();
                    boot::load_etc_environment();

                    // A single token with spaces is a shell command line.
                    let result = if args.len() == 1 && args[0].contains(' ') {
                        utils::do_exec(
                            "/bin/sh",
                            &[
                                "sh".to_string(),
                                "-c".to_string(),
                                args[0].clone(),
                            ],
                        )
                    } else {
                        utils::do_exec(&args[0], args)
                    };
                    if let Err(e) = result {
                        log::error!("Failed to execute command: {}", e);
                    }
                    process::exit(1);
                }
                Ok(ForkResult::Parent { child: cmd_pid }) => {
                    let code = match waitpid(cmd_pid, None) {
                        Ok(WaitStatus::Exited(_, code)) => code,
                        _ => 1,
                    };
                    process::exit(code);
                }
                Err(_) => process::exit(1),
            }
        }
        ForkResult::Parent { child } => child,
    };

    match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, code)) => Ok(code),
        _ => Ok(1),
    }
}
