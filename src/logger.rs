//! Console logging sink.
//!
//! Info/Warn/Error lines are the user-facing output contract: a `[+]`,
//! `[!]` or `[-]` tag, CR-LF termination and an immediate flush so lines
//! survive raw-mode terminals and abrupt exits. Debug/Trace lines carry a
//! timestamp and only appear when `DROIDSPACES_LOG_LEVEL` asks for them.

use std::env;
use std::io::{stderr, stdout, Write};
use std::str::FromStr;

use anyhow::Result;
use log::{Level, LevelFilter, Log, Metadata, Record};
use nix::unistd::isatty;
use once_cell::sync::OnceCell;

const C_RESET: &str = "\x1b[0m";
const C_RED: &str = "\x1b[1;31m";
const C_GREEN: &str = "\x1b[1;32m";
const C_YELLOW: &str = "\x1b[1;33m";

pub static DS_LOGGER: OnceCell<DsLogger> = OnceCell::new();

pub fn init() -> Result<()> {
    let level_filter = env::var("DROIDSPACES_LOG_LEVEL")
        .ok()
        .and_then(|s| LevelFilter::from_str(&s).ok())
        .unwrap_or(LevelFilter::Info);

    let logger = DS_LOGGER.get_or_init(|| DsLogger {
        level: level_filter.to_level(),
        stdout_tty: isatty(1).unwrap_or(false),
        stderr_tty: isatty(2).unwrap_or(false),
    });
    log::set_logger(logger)
        .map(|()| log::set_max_level(level_filter))
        .expect("set logger failed");

    Ok(())
}

pub struct DsLogger {
    level: Option<Level>,
    stdout_tty: bool,
    stderr_tty: bool,
}

impl DsLogger {
    fn tag(&self, level: Level) -> String {
        let (mark, color, tty) = match level {
            Level::Info => ("+", C_GREEN, self.stdout_tty),
            Level::Warn => ("!", C_YELLOW, self.stderr_tty),
            _ => ("-", C_RED, self.stderr_tty),
        };
        if tty {
            format!("[{}{}{}]", color, mark, C_RESET)
        } else {
            format!("[{}]", mark)
        }
    }
}

impl Log for DsLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Some(level) = self.level {
            metadata.level() <= level
        } else {
            false
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        match record.level() {
            Level::Info => {
                let out = stdout();
                let mut out = out.lock();
                let _ = write!(out, "{} {}\r\n", self.tag(Level::Info), record.args());
                let _ = out.flush();
            }
            Level::Warn | Level::Error => {
                let err = stderr();
                let mut err = err.lock();
                let _ = write!(err, "{} {}\r\n", self.tag(record.level()), record.args());
                let _ = err.flush();
            }
            _ => {
                let msg = match (record.file(), record.line()) {
                    (Some(file), Some(line)) => format!(
                        "[{} {}:{}] {} {}\r",
                        record.level(),
                        file,
                        line,
                        chrono::Local::now().to_rfc3339(),
                        record.args()
                    ),
                    (_, _) => format!(
                        "[{}] {} {}\r",
                        record.level(),
                        chrono::Local::now().to_rfc3339(),
                        record.args()
                    ),
                };
                let _ = writeln!(stderr(), "{}", msg);
                let _ = stderr().flush();
            }
        }
    }

    fn flush(&self) {
        let _ = stdout().flush();
        let _ = stderr().flush();
    }
}
