//! Container configuration record and the optional `key=value` config file.

use std::fs;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use nix::unistd::Pid;

use crate::utils;
use crate::MAX_BINDS;

/// One allocated PTY pair. The master stays with the parent/monitor, the
/// slave device is bind-mounted into the container.
#[derive(Debug)]
pub struct TtyInfo {
    pub master: RawFd,
    pub slave: RawFd,
    pub name: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub src: PathBuf,
    pub dest: PathBuf,
}

/// Everything a container run needs, resolved before the first fork.
/// Immutable after `start` except for the runtime fields the start path
/// itself fills in (effective rootfs, PIDs, allocated terminals).
#[derive(Debug, Default)]
pub struct DsConfig {
    // Identity
    pub name: Option<String>,
    /// True when the name came from the user (CLI or config file) rather
    /// than os-release generation; explicit names fail on collision
    /// instead of getting a numeric suffix.
    pub name_explicit: bool,
    pub hostname: Option<String>,
    pub uuid: String,

    // Rootfs
    pub rootfs_path: Option<PathBuf>,
    pub rootfs_img_path: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,

    // Flags
    pub foreground: bool,
    pub hw_access: bool,
    pub volatile_mode: bool,
    pub enable_ipv6: bool,
    pub android_storage: bool,
    pub selinux_permissive: bool,

    pub dns_servers: Option<String>,
    pub binds: Vec<BindMount>,
    pub prog_name: String,

    // Runtime state
    pub container_pid: Option<Pid>,
    pub is_img_mount: bool,
    pub img_mount_point: Option<PathBuf>,
    pub volatile_dir: Option<PathBuf>,
    pub console: Option<TtyInfo>,
    pub ttys: Vec<TtyInfo>,

    pub config_file: Option<PathBuf>,
    pub config_file_existed: bool,
}

impl DsConfig {
    /// The rootfs the boot sequencer operates on. Filled by the time the
    /// monitor forks (image mounts and overlay swaps update it).
    pub fn effective_rootfs(&self) -> Result<&Path> {
        match self.rootfs_path.as_deref() {
            Some(p) => Ok(p),
            None => bail!("no rootfs resolved"),
        }
    }

    pub fn add_bind(&mut self, src: &str, dest: &str) -> Result<()> {
        if src.is_empty() || dest.is_empty() {
            return Ok(());
        }

        let bind = BindMount {
            src: PathBuf::from(src),
            dest: PathBuf::from(dest),
        };
        if self.binds.contains(&bind) {
            return Ok(());
        }
        if self.binds.len() >= MAX_BINDS {
            bail!("too many bind mounts (max {})", MAX_BINDS);
        }

        self.binds.push(bind);
        Ok(())
    }

    /// Sanity checks shared by `start` and `restart`. Reported as a single
    /// failure after all of them ran, so the user sees every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = 0;

        if self.rootfs_path.is_some() && self.rootfs_img_path.is_some() {
            log::error!("Both rootfs directory and image specified simultaneously.");
            log::info!("Directory: {}", self.rootfs_path.as_ref().unwrap().display());
            log::info!("Image: {}", self.rootfs_img_path.as_ref().unwrap().display());
            log::info!("Override one using --rootfs or --rootfs-img.");
            errors += 1;
        }

        if self.rootfs_path.is_none() && self.rootfs_img_path.is_none() {
            log::error!("No rootfs target specified (requires -r or -i).");
            errors += 1;
        }

        if let Some(rootfs) = &self.rootfs_path {
            if !rootfs.exists() {
                log::error!("Rootfs directory not found: '{}'", rootfs.display());
                errors += 1;
            }
        }

        if let Some(img) = &self.rootfs_img_path {
            if !img.exists() {
                log::error!("Rootfs image not found: '{}'", img.display());
                errors += 1;
            }
        }

        if self.rootfs_img_path.is_some() && self.name.is_none() {
            log::error!("Rootfs image requires a container name (--name).");
            errors += 1;
        }

        if errors > 0 {
            bail!("invalid configuration");
        }
        Ok(())
    }
}

/// Keys the runtime owns in a config file. Anything else round-trips
/// untouched on save.
const KNOWN_KEYS: &[&str] = &[
    "name",
    "hostname",
    "rootfs_path",
    "pidfile",
    "enable_ipv6",
    "enable_android_storage",
    "enable_hw_access",
    "selinux_permissive",
    "volatile_mode",
    "foreground",
    "bind_mounts",
    "dns_servers",
];

/// Sibling `container.config` next to the rootfs, used when no --conf was
/// given.
pub fn auto_path(rootfs: &Path) -> Option<PathBuf> {
    rootfs.parent().map(|dir| dir.join("container.config"))
}

pub fn load(config_path: &Path, cfg: &mut DsConfig) -> Result<()> {
    let content = match fs::read_to_string(config_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            cfg.config_file_existed = false;
            return Ok(());
        }
        Err(e) => {
            log::error!("Failed to open config file '{}': {}", config_path.display(), e);
            return Err(e.into());
        }
    };
    cfg.config_file_existed = true;

    for (line_num, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, val) = match line.find('=') {
            Some(pos) => (line[..pos].trim(), line[pos + 1..].trim()),
            None => {
                log::warn!(
                    "Config: Invalid syntax at {}:{} (missing '=')",
                    config_path.display(),
                    line_num + 1
                );
                continue;
            }
        };

        match key {
            "name" => {
                cfg.name = Some(val.to_string());
                cfg.name_explicit = true;
            }
            "hostname" => cfg.hostname = Some(val.to_string()),
            "rootfs_path" => {
                if val.contains(".img") {
                    cfg.rootfs_img_path = Some(PathBuf::from(val));
                    cfg.is_img_mount = true;
                } else {
                    cfg.rootfs_path = Some(PathBuf::from(val));
                }
            }
            "pidfile" => cfg.pidfile = Some(PathBuf::from(val)),
            "enable_ipv6" => cfg.enable_ipv6 = parse_bool(val),
            "enable_android_storage" => cfg.android_storage = parse_bool(val),
            "enable_hw_access" => cfg.hw_access = parse_bool(val),
            "selinux_permissive" => cfg.selinux_permissive = parse_bool(val),
            "volatile_mode" => cfg.volatile_mode = parse_bool(val),
            "foreground" => cfg.foreground = parse_bool(val),
            "bind_mounts" => parse_bind_mounts(val, cfg),
            "dns_servers" => cfg.dns_servers = Some(val.to_string()),
            _ => {} // preserved on save
        }
    }

    Ok(())
}

pub fn save(config_path: &Path, cfg: &DsConfig) -> Result<()> {
    // Collect unknown keys from the existing file so an app layering its own
    // settings on top of ours survives a save.
    let mut preserved = Vec::new();
    if let Ok(existing) = fs::read_to_string(config_path) {
        for raw in existing.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let key = match line.find('=') {
                Some(pos) => line[..pos].trim(),
                None => continue,
            };
            if !KNOWN_KEYS.contains(&key) {
                preserved.push(raw.to_string());
            }
        }
    }

    let mut out = String::new();
    out.push_str("# Droidspaces Container Configuration\n");
    out.push_str("# Generated automatically — Changes may be overwritten\n\n");

    if let Some(name) = &cfg.name {
        out.push_str(&format!("name={}\n", name));
    }
    if let Some(hostname) = &cfg.hostname {
        out.push_str(&format!("hostname={}\n", hostname));
    }

    let rootfs_key = if cfg.is_img_mount {
        cfg.rootfs_img_path.as_ref()
    } else {
        cfg.rootfs_path.as_ref()
    };
    if let Some(rootfs) = rootfs_key {
        let abs = fs::canonicalize(rootfs).unwrap_or_else(|_| rootfs.clone());
        out.push_str(&format!("rootfs_path={}\n", abs.display()));
    }

    if let Some(pidfile) = &cfg.pidfile {
        out.push_str(&format!("pidfile={}\n", pidfile.display()));
    }

    out.push_str(&format!("enable_ipv6={}\n", cfg.enable_ipv6 as u8));
    out.push_str(&format!("enable_android_storage={}\n", cfg.android_storage as u8));
    out.push_str(&format!("enable_hw_access={}\n", cfg.hw_access as u8));
    out.push_str(&format!("selinux_permissive={}\n", cfg.selinux_permissive as u8));
    out.push_str(&format!("volatile_mode={}\n", cfg.volatile_mode as u8));
    out.push_str(&format!("foreground={}\n", cfg.foreground as u8));

    if let Some(dns) = &cfg.dns_servers {
        out.push_str(&format!("dns_servers={}\n", dns));
    }

    if !cfg.binds.is_empty() {
        let joined: Vec<String> = cfg
            .binds
            .iter()
            .map(|b| format!("{}:{}", b.src.display(), b.dest.display()))
            .collect();
        out.push_str(&format!("bind_mounts={}\n", joined.join(",")));
    }

    if !preserved.is_empty() {
        out.push_str("\n# Android App Configuration\n");
        for line in &preserved {
            out.push_str(line);
            out.push('\n');
        }
    }

    utils::write_file_atomic(config_path, out)?;

    if !cfg.config_file_existed {
        log::info!("Configuration persisted to {}", config_path.display());
    }
    Ok(())
}

fn parse_bool(val: &str) -> bool {
    val.parse::<i32>().map(|v| v != 0).unwrap_or(false)
}

fn parse_bind_mounts(value: &str, cfg: &mut DsConfig) {
    cfg.binds.clear();
    for token in value.split(',') {
        let (src, dest) = match token.find(':') {
            Some(pos) => (token[..pos].trim(), token[pos + 1..].trim()),
            None => continue,
        };
        // Both sides must be absolute to be considered at all.
        if src.starts_with('/') && dest.starts_with('/') {
            let _ = cfg.add_bind(src, dest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_parses_known_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("container.config");
        fs::write(
            &path,
            "# comment\n\
             name=alpine-3.19\n\
             hostname = alpinebox \n\
             enable_ipv6=1\n\
             volatile_mode=0\n\
             bind_mounts=/data/share:/mnt/share,/opt:/opt\n\
             dns_servers=9.9.9.9\n",
        )?;

        let mut cfg = DsConfig::default();
        load(&path, &mut cfg)?;

        assert_eq!(cfg.name.as_deref(), Some("alpine-3.19"));
        assert_eq!(cfg.hostname.as_deref(), Some("alpinebox"));
        assert!(cfg.enable_ipv6);
        assert!(!cfg.volatile_mode);
        assert_eq!(cfg.binds.len(), 2);
        assert_eq!(cfg.binds[0].dest, PathBuf::from("/mnt/share"));
        assert_eq!(cfg.dns_servers.as_deref(), Some("9.9.9.9"));
        assert!(cfg.config_file_existed);
        Ok(())
    }

    #[test]
    fn test_load_missing_file_is_ok() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut cfg = DsConfig::default();
        load(&dir.path().join("absent.config"), &mut cfg)?;
        assert!(!cfg.config_file_existed);
        Ok(())
    }

    #[test]
    fn test_save_preserves_unknown_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("container.config");
        fs::write(&path, "name=old\napp_theme=dark\napp_refresh=30\n")?;

        let mut cfg = DsConfig::default();
        cfg.name = Some("new".to_string());
        cfg.config_file_existed = true;
        save(&path, &cfg)?;

        let content = fs::read_to_string(&path)?;
        assert!(content.contains("name=new\n"));
        assert!(!content.contains("name=old"));
        assert!(content.contains("app_theme=dark"));
        assert!(content.contains("app_refresh=30"));
        Ok(())
    }

    #[test]
    fn test_save_load_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("container.config");

        let mut cfg = DsConfig::default();
        cfg.name = Some("debian-12".to_string());
        cfg.hostname = Some("deb".to_string());
        cfg.enable_ipv6 = true;
        cfg.add_bind("/srv", "/srv")?;
        save(&path, &cfg)?;

        let mut loaded = DsConfig::default();
        load(&path, &mut loaded)?;
        assert_eq!(loaded.name, cfg.name);
        assert_eq!(loaded.hostname, cfg.hostname);
        assert!(loaded.enable_ipv6);
        assert_eq!(loaded.binds, cfg.binds);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_ambiguous_rootfs() {
        let mut cfg = DsConfig::default();
        cfg.rootfs_path = Some(PathBuf::from("/tmp"));
        cfg.rootfs_img_path = Some(PathBuf::from("/tmp/img.img"));
        assert!(cfg.validate().is_err());

        let empty = DsConfig::default();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_add_bind_dedups_and_caps() -> Result<()> {
        let mut cfg = DsConfig::default();
        cfg.add_bind("/a", "/b")?;
        cfg.add_bind("/a", "/b")?;
        assert_eq!(cfg.binds.len(), 1);

        for i in 1..MAX_BINDS {
            cfg.add_bind(&format!("/src{}", i), &format!("/dst{}", i))?;
        }
        assert!(cfg.add_bind("/overflow", "/overflow").is_err());
        Ok(())
    }

    #[test]
    fn test_auto_path_is_sibling() {
        assert_eq!(
            auto_path(Path::new("/data/containers/alpine")),
            Some(PathBuf::from("/data/containers/container.config"))
        );
    }
}
