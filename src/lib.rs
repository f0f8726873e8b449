pub mod android;
pub mod boot;
pub mod cgroups;
pub mod channel;
pub mod check;
pub mod config;
pub mod console;
pub mod container;
pub mod logger;
pub mod mounts;
pub mod network;
pub mod registry;
pub mod seccomp;
pub mod terminal;
pub mod utils;

/// Version string written into the container's `/run/droidspaces` marker.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Marker value stored in `/run/systemd/container` and in the container
/// environment so init systems detect they are inside a container.
pub const CONTAINER_MARKER: &str = "droidspaces";

/// Number of auxiliary TTYs allocated next to the console.
pub const MAX_TTYS: usize = 6;

/// Upper bound on custom bind mounts.
pub const MAX_BINDS: usize = 16;

/// Seconds between the graceful stop signal and SIGKILL escalation.
pub const STOP_TIMEOUT_SECS: u32 = 15;
