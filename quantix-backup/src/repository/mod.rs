//! Backup repository access.
//!
//! A repository is an external deduplicating archive store. Archives are
//! created from files, raw special files, or a tool's byte stream, and
//! thinned per archive set by a daily/weekly/monthly retention policy.
//!
//! Implementations:
//!
//! - [`BorgRepository`] - drives the `borg` command-line client
//! - [`MockRepository`] - in-memory store for tests and `--dev` runs
//!
//! [`RepositoryClient`] binds one repository reference to a backend and
//! names the archives it creates.

mod borg;
mod client;
mod mock;
mod naming;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::process::{ToolCommand, ToolError};
use crate::strategy::Strategy;

pub use borg::BorgRepository;
pub use client::RepositoryClient;
pub use mock::{MockRepository, StoredArchive};
pub use naming::{ArchiveKind, ArchiveNamer, Clock};

// =============================================================================
// Errors
// =============================================================================

/// Errors from repository operations.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The repository reference is malformed.
    #[error("invalid repository reference '{0}'")]
    InvalidReference(String),

    /// The repository could not be opened or queried.
    #[error("repository {repository} is unavailable: {source}")]
    Unavailable {
        repository: String,
        #[source]
        source: ToolError,
    },

    /// An archive could not be created.
    #[error("archive {archive} failed: {source}")]
    Archive {
        archive: String,
        #[source]
        source: ToolError,
    },

    /// Pruning an archive set failed.
    #[error("prune of {glob} failed: {source}")]
    Prune {
        glob: String,
        #[source]
        source: ToolError,
    },
}

// =============================================================================
// Repository reference
// =============================================================================

/// Location of a repository: a local path or a remote `ssh://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef(String);

impl RepositoryRef {
    /// Parse a repository location given on the command line.
    pub fn parse(location: &str) -> Result<Self, RepositoryError> {
        let location = location.trim();
        if location.is_empty() || location.contains("::") {
            return Err(RepositoryError::InvalidReference(location.to_string()));
        }
        Ok(Self(location.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `repo::archive` form used by borg to address one archive.
    pub fn archive_spec(&self, archive: &str) -> String {
        format!("{}::{}", self.0, archive)
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Compression
// =============================================================================

/// Compression algorithm understood by borg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zstd,
    Zlib,
    Lzma,
}

impl CompressionAlgorithm {
    fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Zlib => "zlib",
            Self::Lzma => "lzma",
        }
    }

    /// Accepted level range, if the algorithm takes a level.
    fn levels(&self) -> Option<(u8, u8)> {
        match self {
            Self::None | Self::Lz4 => None,
            Self::Zstd => Some((1, 22)),
            Self::Zlib | Self::Lzma => Some((0, 9)),
        }
    }
}

/// Compression spec in borg's `[auto,]algo[,level]` syntax.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Compression {
    pub auto: bool,
    pub algorithm: CompressionAlgorithm,
    pub level: Option<u8>,
}

impl Default for Compression {
    fn default() -> Self {
        Self {
            auto: false,
            algorithm: CompressionAlgorithm::Zstd,
            level: Some(3),
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts: Vec<&str> = s.trim().split(',').map(str::trim).collect();

        let auto = parts.first() == Some(&"auto");
        if auto {
            parts.remove(0);
        }

        let algorithm = match parts.first().copied() {
            Some("none") => CompressionAlgorithm::None,
            Some("lz4") => CompressionAlgorithm::Lz4,
            Some("zstd") => CompressionAlgorithm::Zstd,
            Some("zlib") => CompressionAlgorithm::Zlib,
            Some("lzma") => CompressionAlgorithm::Lzma,
            _ => return Err(format!("unknown compression '{}'", s)),
        };

        let level = match (parts.get(1), algorithm.levels()) {
            (None, _) => None,
            (Some(_), None) => {
                return Err(format!("{} does not take a level", algorithm.as_str()))
            }
            (Some(raw), Some((min, max))) => {
                let level: u8 = raw
                    .parse()
                    .map_err(|_| format!("invalid compression level '{}'", raw))?;
                if level < min || level > max {
                    return Err(format!(
                        "{} level must be between {} and {}",
                        algorithm.as_str(), min, max
                    ));
                }
                Some(level)
            }
        };

        if parts.len() > 2 {
            return Err(format!("unknown compression '{}'", s));
        }

        Ok(Self { auto, algorithm, level })
    }
}

impl TryFrom<String> for Compression {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.auto {
            f.write_str("auto,")?;
        }
        f.write_str(self.algorithm.as_str())?;
        if let Some(level) = self.level {
            write!(f, ",{}", level)?;
        }
        Ok(())
    }
}

// =============================================================================
// Retention
// =============================================================================

/// How many archives of one set survive a prune.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 6,
        }
    }
}

impl RetentionPolicy {
    /// True when no rule keeps anything.
    pub fn is_empty(&self) -> bool {
        self.keep_daily == 0 && self.keep_weekly == 0 && self.keep_monthly == 0
    }

    /// Upper bound on archives left in a set after pruning.
    pub fn max_kept(&self) -> usize {
        (self.keep_daily + self.keep_weekly + self.keep_monthly) as usize
    }
}

// =============================================================================
// Jobs and results
// =============================================================================

/// Input of an archive.
#[derive(Debug, Clone)]
pub enum ArchiveSource {
    /// Regular files, archived by content.
    Files(Vec<PathBuf>),
    /// A device node read as a file (`--read-special`).
    Special(PathBuf),
    /// The stdout of a producer command, stored under `stdin_name`.
    Stream {
        producer: ToolCommand,
        stdin_name: String,
    },
}

impl fmt::Display for ArchiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Files(paths) => {
                let names: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                write!(f, "{}", names.join(" "))
            }
            Self::Special(device) => write!(f, "{}", device.display()),
            Self::Stream { producer, .. } => write!(f, "{} |", producer),
        }
    }
}

/// One fully described archive operation. Immutable once built.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub repository: RepositoryRef,
    /// Unique archive name
    pub name: String,
    /// Name prefix shared by every archive of this job's set
    pub set: String,
    /// Name pattern matching every archive of this job's set
    pub set_glob: String,
    pub source: ArchiveSource,
    pub strategy: Strategy,
    pub compression: Compression,
}

/// Outcome of a successful archive.
#[derive(Debug, Clone)]
pub struct ArchiveResult {
    pub name: String,
    pub elapsed: Duration,
    /// Tool warning text when the archive completed with warnings
    pub warning: Option<String>,
}

/// Outcome of a successful prune.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneResult {
    pub kept: Vec<String>,
    pub pruned: Vec<String>,
}

// =============================================================================
// Backend trait
// =============================================================================

/// Repository collaborator.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Verify the repository exists and can be opened.
    async fn validate(&self, repository: &RepositoryRef) -> Result<(), RepositoryError>;

    /// Create one archive.
    async fn create_archive(&self, job: &ArchiveJob) -> Result<ArchiveResult, RepositoryError>;

    /// Thin the archives matching `glob` down to `policy`.
    async fn prune(
        &self,
        repository: &RepositoryRef,
        glob: &str,
        policy: &RetentionPolicy,
    ) -> Result<PruneResult, RepositoryError>;
}
