//! Archive naming.
//!
//! Names have the form `{machine}-{kind}-{subject}-{timestamp}`. Every
//! archive of one set shares the prefix before the timestamp. The set glob
//! also pins the start of the timestamp, so `db1`'s sets never match the
//! archives of a machine whose name merely starts with `db1-`.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};

/// Timestamp layout: sortable, glob-safe, microsecond resolution.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.6f";

/// Matches the year that opens every timestamp.
const TIMESTAMP_GLOB: &str = "[0-9][0-9][0-9][0-9]-*";

/// Wall-clock source.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What an archive set holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    /// Exported configuration plus virtual disk files
    Bundle,
    /// One partition of a pass-through device
    Partition,
    /// An unpartitioned pass-through device
    Disk,
}

impl ArchiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bundle => "vm",
            Self::Partition => "part",
            Self::Disk => "disk",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces unique archive names for one invocation.
pub struct ArchiveNamer {
    clock: Clock,
    last: Mutex<Option<DateTime<Utc>>>,
}

impl ArchiveNamer {
    /// Namer driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Namer driven by a custom clock.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            last: Mutex::new(None),
        }
    }

    /// Glob matching every archive of one set and nothing else.
    pub fn set_glob(machine: &str, kind: ArchiveKind, subject: &str) -> String {
        format!("{}-{}", Self::set_prefix(machine, kind, subject), TIMESTAMP_GLOB)
    }

    /// Name prefix shared by every archive of one set.
    pub fn set_prefix(machine: &str, kind: ArchiveKind, subject: &str) -> String {
        format!("{}-{}-{}", sanitize(machine), kind, sanitize(subject))
    }

    /// Next archive name. Timestamps strictly increase across calls even
    /// when the clock stalls or steps backwards.
    pub fn next(&self, machine: &str, kind: ArchiveKind, subject: &str) -> String {
        let mut now = (self.clock)().trunc_subsecs(6);

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + TimeDelta::microseconds(1);
            }
        }
        *last = Some(now);

        format!(
            "{}-{}",
            Self::set_prefix(machine, kind, subject),
            now.format(TIMESTAMP_FORMAT)
        )
    }
}

impl Default for ArchiveNamer {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep names free of glob metacharacters and path separators.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}
