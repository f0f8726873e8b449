//! The pipe between the monitor and the parent, carrying exactly one
//! fixed-size payload: the host PID of the container's init.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mio::unix::pipe::{self, Receiver, Sender};
use mio::{Events, Interest, Poll, Token};
use nix::unistd::Pid;

const MONITOR: Token = Token(0);
const MAX_EVENTS: usize = 8;

/// How long the parent waits for the monitor to fork init and report back.
const WAIT_FOR_INIT: Duration = Duration::from_secs(10);

/// Write end, held by the monitor after the fork.
pub struct InitPidSender {
    sender: Sender,
}

impl InitPidSender {
    pub fn send(&mut self, pid: Pid) -> Result<()> {
        self.sender
            .write_all(&pid.as_raw().to_le_bytes())
            .context("failed to send init pid to parent")?;
        Ok(())
    }
}

/// Read end, held by the parent.
pub struct InitPidReceiver {
    receiver: Receiver,
    poll: Poll,
}

impl InitPidReceiver {
    /// Block until the monitor delivers the init PID or the timeout
    /// elapses (monitor died before forking, most likely).
    pub fn recv(&mut self) -> Result<Pid> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut buf = [0u8; 4];
        let mut filled = 0;

        loop {
            self.poll
                .poll(&mut events, Some(WAIT_FOR_INIT))
                .context("poll on monitor pipe failed")?;
            if events.is_empty() {
                bail!("monitor failed to send container PID in time");
            }

            for event in events.iter() {
                if event.token() != MONITOR {
                    continue;
                }
                loop {
                    match self.receiver.read(&mut buf[filled..]) {
                        Ok(0) => bail!("monitor closed the pipe before sending a PID"),
                        Ok(n) => {
                            filled += n;
                            if filled == buf.len() {
                                let raw = i32::from_le_bytes(buf);
                                if raw <= 0 {
                                    bail!("monitor sent an invalid PID: {}", raw);
                                }
                                return Ok(Pid::from_raw(raw));
                            }
                        }
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            return Err(e).context("failed to read init pid from monitor")
                        }
                    }
                }
            }
        }
    }
}

/// Build the pipe pair before forking the monitor. The parent keeps the
/// receiver, the monitor the sender; each side drops the other half.
pub fn init_pid_channel() -> Result<(InitPidSender, InitPidReceiver)> {
    let (sender, mut receiver) = pipe::new().context("failed to create sync pipe")?;
    let poll = Poll::new()?;
    poll.registry()
        .register(&mut receiver, MONITOR, Interest::READABLE)?;

    Ok((
        InitPidSender { sender },
        InitPidReceiver { receiver, poll },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_roundtrip() -> Result<()> {
        let (mut tx, mut rx) = init_pid_channel()?;
        tx.send(Pid::from_raw(4242))?;
        assert_eq!(rx.recv()?, Pid::from_raw(4242));
        Ok(())
    }

    #[test]
    fn test_closed_pipe_is_an_error() -> Result<()> {
        let (tx, mut rx) = init_pid_channel()?;
        drop(tx);
        assert!(rx.recv().is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_pid_rejected() -> Result<()> {
        let (mut tx, mut rx) = init_pid_channel()?;
        tx.sender.write_all(&(-1i32).to_le_bytes())?;
        assert!(rx.recv().is_err());
        Ok(())
    }
}
