//! Container lifecycle operations, one file per command.

mod enter;
mod info;
mod start;
mod stop;

pub use enter::{enter_rootfs, run_in_rootfs};
pub use info::{check_status, is_container_running, show_info};
pub use start::start_rootfs;
pub use stop::{restart_rootfs, stop_rootfs};
