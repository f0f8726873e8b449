//! Droidspaces — a container runtime for Android and Linux.
//!
//! The binary owns container lifecycle only: booting a rootfs as an
//! isolated process tree, supervising it, and getting the user in and out
//! of it. Image building and distribution live elsewhere.

use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::{crate_version, AppSettings, Clap};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{isatty, Uid};

use droidspaces::android::is_android;
use droidspaces::check;
use droidspaces::config::{self, DsConfig};
use droidspaces::container;
use droidspaces::registry;
use droidspaces::{logger, MAX_BINDS, VERSION};

#[derive(Clap, Debug)]
#[clap(
    name = "droidspaces",
    version = crate_version!(),
    author = "ravindu644",
    about = "High-performance Container Runtime for Android/Linux"
)]
struct Opts {
    /// Path to rootfs directory
    #[clap(short, long)]
    rootfs: Option<PathBuf>,
    /// Path to rootfs image (.img)
    #[clap(short = 'i', long)]
    rootfs_img: Option<PathBuf>,
    /// Container name (auto-generated if omitted)
    #[clap(short, long)]
    name: Option<String>,
    /// Path to pidfile
    #[clap(short, long)]
    pidfile: Option<PathBuf>,
    /// Set container hostname
    #[clap(short = 'h', long)]
    hostname: Option<String>,
    /// Set custom DNS servers (comma separated)
    #[clap(short, long)]
    dns: Option<String>,
    /// Run in foreground (attach console)
    #[clap(short, long)]
    foreground: bool,
    /// Expose the host /dev (devtmpfs) inside the container
    #[clap(long)]
    hw_access: bool,
    /// Enable IPv6 networking in the container
    #[clap(long)]
    enable_ipv6: bool,
    /// Bind Android shared storage into the container
    #[clap(long)]
    enable_android_storage: bool,
    /// Switch SELinux to permissive before starting
    #[clap(long)]
    selinux_permissive: bool,
    /// Discard changes on exit (OverlayFS)
    #[clap(short = 'V', long = "volatile")]
    volatile_mode: bool,
    /// Bind mount host directory into container (SRC:DEST[,SRC:DEST...])
    #[clap(short = 'B', long = "bind-mount", multiple_occurrences = true)]
    bind_mount: Vec<String>,
    /// Load configuration from file
    #[clap(short = 'C', long = "conf", alias = "config")]
    conf: Option<PathBuf>,
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Clap, Debug)]
enum SubCommand {
    /// Start a new container
    Start,
    /// Stop one or more containers
    Stop,
    /// Restart a container
    Restart,
    /// Enter a running container
    Enter { user: Option<String> },
    /// Run a command in a running container
    #[clap(setting = AppSettings::TrailingVarArg)]
    Run {
        #[clap(required = true)]
        command: Vec<String>,
    },
    /// Show container status
    Status,
    /// Print the container init PID, or NONE
    Pid,
    /// Show detailed container info
    Info,
    /// List all running containers
    Show,
    /// Scan for untracked containers
    Scan,
    /// Check system requirements
    Check,
    /// Show where the documentation lives
    Docs,
    /// Show version information
    Version,
}

fn print_banner() {
    println!(
        "\x1b[1;36m— Welcome to \x1b[1;37mDroidspaces v{}\x1b[1;36m ! —\x1b[0m\r\n",
        VERSION
    );
}

fn parse_bind_flags(cfg: &mut DsConfig, values: &[String]) -> Result<()> {
    for value in values {
        for token in value.split(',') {
            let (src, dest) = match token.find(':') {
                Some(pos) => (&token[..pos], &token[pos + 1..]),
                None => {
                    log::error!("Invalid bind mount format: {} (expected SRC:DEST)", token);
                    anyhow::bail!("invalid bind mount");
                }
            };
            if !dest.starts_with('/') {
                log::error!("Bind destination must be an absolute path: {}", dest);
                anyhow::bail!("invalid bind mount");
            }
            if dest.contains("..") {
                log::error!("Path traversal detected in bind destination: {}", dest);
                anyhow::bail!("invalid bind mount");
            }
            if cfg.binds.len() >= MAX_BINDS {
                log::error!("Too many bind mounts (max {})", MAX_BINDS);
                anyhow::bail!("too many bind mounts");
            }
            cfg.add_bind(src, dest)?;
        }
    }
    Ok(())
}

/// Layer the CLI on top of whatever the config file set.
fn build_config(opts: &Opts) -> Result<DsConfig> {
    let mut cfg = DsConfig::default();
    cfg.prog_name = std::env::args()
        .next()
        .unwrap_or_else(|| "droidspaces".to_string());

    let conf_path = opts.conf.clone().or_else(|| {
        opts.rootfs
            .as_ref()
            .or(opts.rootfs_img.as_ref())
            .and_then(|p| config::auto_path(p))
    });
    if let Some(path) = &conf_path {
        config::load(path, &mut cfg)?;
        cfg.config_file = Some(path.clone());
    }

    if let Some(rootfs) = &opts.rootfs {
        cfg.rootfs_path = Some(rootfs.clone());
        cfg.rootfs_img_path = None;
        cfg.is_img_mount = false;
    }
    if let Some(img) = &opts.rootfs_img {
        cfg.rootfs_img_path = Some(img.clone());
        cfg.rootfs_path = None;
        cfg.is_img_mount = true;
    }
    if let Some(name) = &opts.name {
        cfg.name = Some(name.clone());
        cfg.name_explicit = true;
    }
    if let Some(pidfile) = &opts.pidfile {
        cfg.pidfile = Some(pidfile.clone());
    }
    if let Some(hostname) = &opts.hostname {
        cfg.hostname = Some(hostname.clone());
    }
    if let Some(dns) = &opts.dns {
        cfg.dns_servers = Some(dns.clone());
    }
    cfg.foreground |= opts.foreground;
    cfg.hw_access |= opts.hw_access;
    cfg.enable_ipv6 |= opts.enable_ipv6;
    cfg.android_storage |= opts.enable_android_storage;
    cfg.selinux_permissive |= opts.selinux_permissive;
    cfg.volatile_mode |= opts.volatile_mode;

    parse_bind_flags(&mut cfg, &opts.bind_mount)?;

    Ok(cfg)
}

/// Shared prologue of `start` and `restart`: early name/hostname
/// resolution (so the config save captures them) and the banner.
fn prepare_lifecycle(cfg: &mut DsConfig) -> Result<()> {
    cfg.validate()?;
    check::validate_kernel_version()?;
    check::check_requirements()?;

    if cfg.name.is_none() {
        if let Some(rootfs) = cfg.rootfs_path.clone() {
            cfg.name = Some(registry::generate_container_name(&rootfs));
        }
    }
    if cfg.hostname.is_none() {
        cfg.hostname = cfg.name.clone();
    }

    print_banner();
    check::check_kernel_recommendation();

    if let Some(config_file) = cfg.config_file.clone() {
        if let Err(e) = config::save(&config_file, cfg) {
            log::warn!("Could not save configuration: {:#}", e);
        }
    }
    Ok(())
}

fn require_root(cmd: &str) -> Result<()> {
    if !Uid::effective().is_root() {
        log::error!("Root privileges required for '{}'", cmd);
        anyhow::bail!("not root");
    }
    Ok(())
}

fn run() -> Result<i32> {
    let opts = Opts::parse();

    // Commands with no root or config requirements.
    match &opts.subcmd {
        SubCommand::Check => {
            check::check_requirements_detailed()?;
            return Ok(0);
        }
        SubCommand::Version => {
            println!("v{}", VERSION);
            return Ok(0);
        }
        SubCommand::Docs => {
            println!("Documentation: https://github.com/ravindu644/Droidspaces-OSS");
            return Ok(0);
        }
        _ => {}
    }

    let mut cfg = build_config(&opts)?;

    if cfg.foreground && !(isatty(0).unwrap_or(false) && isatty(1).unwrap_or(false)) {
        log::error!(
            "Foreground mode (-f/--foreground) requires a fully interactive terminal (STDIN and STDOUT must be TTYs)."
        );
        return Ok(1);
    }

    let cmd_name = match &opts.subcmd {
        SubCommand::Start => "start",
        SubCommand::Stop => "stop",
        SubCommand::Restart => "restart",
        SubCommand::Enter { .. } => "enter",
        SubCommand::Run { .. } => "run",
        SubCommand::Status => "status",
        SubCommand::Pid => "pid",
        SubCommand::Info => "info",
        SubCommand::Show => "show",
        SubCommand::Scan => "scan",
        _ => unreachable!(),
    };
    require_root(cmd_name)?;
    registry::ensure_workspace()?;

    match opts.subcmd {
        SubCommand::Show => {
            registry::show_containers()?;
            Ok(0)
        }
        SubCommand::Scan => {
            registry::scan_containers()?;
            Ok(0)
        }
        SubCommand::Start => {
            prepare_lifecycle(&mut cfg)?;
            container::start_rootfs(&mut cfg)?;
            Ok(0)
        }
        SubCommand::Restart => {
            prepare_lifecycle(&mut cfg)?;
            container::restart_rootfs(&mut cfg)?;
            Ok(0)
        }
        SubCommand::Stop => {
            check::check_requirements()?;
            // `--name a,b,c` stops each in turn.
            let names: Vec<String> = cfg
                .name
                .as_deref()
                .map(|n| n.split(',').map(|s| s.to_string()).collect())
                .unwrap_or_default();
            if names.len() > 1 {
                for name in names {
                    let mut sub = DsConfig::default();
                    sub.prog_name = cfg.prog_name.clone();
                    sub.name = Some(name);
                    let _ = container::stop_rootfs(&mut sub, false);
                }
                Ok(0)
            } else {
                container::stop_rootfs(&mut cfg, false)?;
                Ok(0)
            }
        }
        SubCommand::Status => match container::is_container_running(&mut cfg) {
            Some(_) => {
                println!(
                    "Container '{}' is Running",
                    cfg.name.as_deref().unwrap_or("?")
                );
                Ok(0)
            }
            None => {
                println!(
                    "Container '{}' is Stopped",
                    cfg.name.as_deref().unwrap_or("?")
                );
                Ok(1)
            }
        },
        // Machine-readable; never triggers cleanup, stable stdout contract.
        SubCommand::Pid => match container::is_container_running(&mut cfg) {
            Some(pid) => {
                println!("{}", pid);
                Ok(0)
            }
            None => {
                println!("NONE");
                Ok(1)
            }
        },
        SubCommand::Info => {
            container::show_info(&mut cfg, false)?;
            Ok(0)
        }
        SubCommand::Enter { user } => {
            check::validate_kernel_version()?;
            check::check_requirements()?;
            container::enter_rootfs(&mut cfg, user.as_deref())?;
            Ok(0)
        }
        SubCommand::Run { command } => {
            check::validate_kernel_version()?;
            check::check_requirements()?;
            let code = container::run_in_rootfs(&mut cfg, &command)?;
            Ok(code)
        }
        SubCommand::Check | SubCommand::Version | SubCommand::Docs => unreachable!(),
    }
}

fn main() {
    if let Err(e) = logger::init() {
        eprintln!("log init failed: {:?}", e);
    }

    // Proxy loops write into pipes and PTYs that can vanish under us;
    // EPIPE must come back as an error, not a signal.
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    // Resolve the platform once up front; everything downstream reads the
    // cached answer.
    let _ = is_android();

    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            1
        }
    };
    process::exit(code);
}
