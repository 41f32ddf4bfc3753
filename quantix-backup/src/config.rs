//! Configuration management for backup runs.
//!
//! Loaded once at startup from YAML, overridden by CLI flags, then shared
//! read-only with every component.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::cli::Args;
use crate::repository::{Compression, RetentionPolicy};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/quantix-backup/backup.yaml";

/// Default lock token location.
pub const DEFAULT_LOCK_PATH: &str = "/run/quantix-backup.lock";

/// Default parent directory for per-machine working directories.
pub const DEFAULT_WORK_DIR: &str = "/var/tmp/quantix-backup";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Repository access
    pub repository: RepositoryConfig,
    /// Archives kept per archive set after pruning
    pub retention: RetentionPolicy,
    /// Machines never backed up unless named explicitly
    pub exclude: Vec<String>,
    /// Hypervisor backend
    pub hypervisor: HypervisorConfig,
    /// Shutdown polling
    pub power: PowerConfig,
    /// External tool locations
    pub tools: ToolPaths,
    /// Lock token file
    pub lock_path: PathBuf,
    /// Parent of the transient per-machine working directories
    pub work_dir: PathBuf,
    /// Exit non-zero when any item or machine failed
    pub strict: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig::default(),
            retention: RetentionPolicy::default(),
            exclude: Vec::new(),
            hypervisor: HypervisorConfig::default(),
            power: PowerConfig::default(),
            tools: ToolPaths::default(),
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            strict: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        
        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }
        
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        
        Self::from_yaml(&content)
    }
    
    /// Like [`load`](Self::load), but a missing file is `Ok(None)`.
    /// A file that exists and fails to read, parse, or validate is an error.
    pub fn load_optional<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }
    
    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)
            .context("Failed to parse config file")?;
        
        config.validate()?;
        Ok(config)
    }
    
    /// Defaults plus CLI arguments, for hosts without a config file.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }
    
    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref passphrase) = args.passphrase {
            self.repository.passphrase = Some(Passphrase(passphrase.clone()));
        }
        
        if let Some(ref uri) = args.libvirt_uri {
            self.hypervisor.uri = uri.clone();
        }
        
        for name in &args.exclude {
            if !self.exclude.contains(name) {
                self.exclude.push(name.clone());
            }
        }
        
        if let Some(secs) = args.shutdown_timeout {
            self.power.shutdown_timeout_secs = Some(secs);
        }
        
        if args.strict {
            self.strict = true;
        }
        
        if args.dev {
            // Mock runs need no privileges
            self.hypervisor.backend = HypervisorBackend::Mock;
            self.lock_path = std::env::temp_dir().join("quantix-backup-dev.lock");
            self.work_dir = std::env::temp_dir().join("quantix-backup-dev");
        }
        
        self
    }
    
    /// Check values that would only fail later, mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.power.poll_interval_secs == 0 {
            bail!("power.poll_interval_secs must be at least 1");
        }
        if self.power.shutdown_timeout_secs == Some(0) {
            bail!("power.shutdown_timeout_secs must be at least 1 when set");
        }
        if self.retention.is_empty() {
            bail!("retention must keep at least one daily, weekly, or monthly archive");
        }
        Ok(())
    }
    
    /// Whether a machine is in the exclusion set.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|excluded| excluded == name)
    }
}

/// Repository passphrase; never printed.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Passphrase(pub String);

impl Passphrase {
    /// The secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(***)")
    }
}

/// Repository access configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Passphrase handed to borg via `BORG_PASSPHRASE`
    pub passphrase: Option<Passphrase>,
    /// Compression spec in borg syntax (e.g. "zstd,6", "auto,lz4")
    pub compression: Compression,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            passphrase: None,
            compression: Compression::default(),
        }
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// Libvirt connection URI
    pub uri: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Virsh,
            uri: "qemu:///system".to_string(),
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// `virsh` command-line client
    #[default]
    Virsh,
    /// Libvirt C API (requires the `libvirt` feature)
    Libvirt,
    /// In-memory mock with demo machines, disks, and repository
    Mock,
}

/// Shutdown polling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Seconds between state polls while waiting for power-off
    pub poll_interval_secs: u64,
    /// Give up waiting after this many seconds (unset = wait forever)
    pub shutdown_timeout_secs: Option<u64>,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            shutdown_timeout_secs: None,
        }
    }
}

impl PowerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
    
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_secs.map(Duration::from_secs)
    }
}

/// Locations of the external tools.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub borg: String,
    pub lsblk: String,
    pub blkid: String,
    pub zerofree: String,
    pub ntfsclone: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            borg: "borg".to_string(),
            lsblk: "lsblk".to_string(),
            blkid: "blkid".to_string(),
            zerofree: "zerofree".to_string(),
            ntfsclone: "ntfsclone".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    
    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Virsh);
        assert!(config.power.shutdown_timeout().is_none());
    }
    
    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
repository:
  passphrase: correct horse
  compression: auto,zstd,9
retention:
  keep_daily: 3
  keep_weekly: 2
  keep_monthly: 1
exclude:
  - scratch
hypervisor:
  backend: libvirt
  uri: qemu+ssh://root@kvm1/system
power:
  poll_interval_secs: 10
  shutdown_timeout_secs: 600
lock_path: /tmp/backup.lock
"#;
        let config = Config::from_yaml(yaml).unwrap();
        
        assert_eq!(config.repository.passphrase.as_ref().map(|p| p.expose()), Some("correct horse"));
        assert_eq!(config.repository.compression.to_string(), "auto,zstd,9");
        assert_eq!(config.retention.keep_daily, 3);
        assert!(config.is_excluded("scratch"));
        assert!(!config.is_excluded("db1"));
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Libvirt);
        assert_eq!(config.power.shutdown_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.lock_path, PathBuf::from("/tmp/backup.lock"));
        // Unset sections keep their defaults
        assert_eq!(config.work_dir, PathBuf::from(DEFAULT_WORK_DIR));
    }
    
    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_yaml("power:\n  poll_interval_secs: 0\n").is_err());
        assert!(Config::from_yaml(
            "retention:\n  keep_daily: 0\n  keep_weekly: 0\n  keep_monthly: 0\n"
        ).is_err());
        assert!(Config::from_yaml("repository:\n  compression: brotli\n").is_err());
    }
    
    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "quantix-backup", "/srv/borg",
            "--exclude", "scratch", "--shutdown-timeout", "120", "--strict", "--dev",
        ]);
        let config = Config::default_with_cli(&args);
        
        assert!(config.is_excluded("scratch"));
        assert_eq!(config.power.shutdown_timeout_secs, Some(120));
        assert!(config.strict);
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert!(config.lock_path.starts_with(std::env::temp_dir()));
    }
    
    #[test]
    fn test_load_optional() {
        let dir = tempfile::tempdir().unwrap();
        
        let missing = dir.path().join("missing.yaml");
        assert!(Config::load_optional(&missing).unwrap().is_none());
        
        let valid = dir.path().join("valid.yaml");
        std::fs::write(&valid, "exclude:\n  - scratch\n").unwrap();
        let config = Config::load_optional(&valid).unwrap().unwrap();
        assert!(config.is_excluded("scratch"));
        
        // Present but broken files are errors, never defaults
        let malformed = dir.path().join("malformed.yaml");
        std::fs::write(&malformed, "exclude: [unterminated\n").unwrap();
        assert!(Config::load_optional(&malformed).is_err());
        
        let invalid = dir.path().join("invalid.yaml");
        std::fs::write(&invalid, "power:\n  poll_interval_secs: 0\n").unwrap();
        assert!(Config::load_optional(&invalid).is_err());
    }
    
    #[test]
    fn test_passphrase_is_redacted() {
        let config = RepositoryConfig {
            passphrase: Some(Passphrase("hunter2".to_string())),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
