//! In-memory repository for tests and development runs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use quantix_backup_hypervisor::{record, CallJournal};
use tracing::info;

use super::{
    ArchiveJob, ArchiveResult, Clock, PruneResult, Repository, RepositoryError, RepositoryRef,
    RetentionPolicy,
};
use crate::process::ToolError;

/// An archive held by [`MockRepository`].
#[derive(Debug, Clone)]
pub struct StoredArchive {
    pub name: String,
    pub created: DateTime<Utc>,
    /// Rendered source description
    pub source: String,
}

/// Repository simulated in memory.
///
/// Journal entries use the archive set prefix rather than the full name so
/// that call sequences are stable across runs.
pub struct MockRepository {
    archives: Mutex<Vec<StoredArchive>>,
    journal: CallJournal,
    clock: Clock,
    valid: bool,
    failing_archives: Vec<String>,
    failing_prune: bool,
}

impl MockRepository {
    /// Create an empty, valid repository.
    pub fn new() -> Self {
        Self {
            archives: Mutex::new(Vec::new()),
            journal: Arc::new(Mutex::new(Vec::new())),
            clock: Arc::new(Utc::now),
            valid: true,
            failing_archives: Vec::new(),
            failing_prune: false,
        }
    }

    /// Record calls into a journal shared with other mocks.
    pub fn with_journal(mut self, journal: CallJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Stamp stored archives with a custom clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Make `validate` fail as for a missing repository.
    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }

    /// Fail archives whose name starts with `prefix`.
    pub fn with_failing_archive(mut self, prefix: impl Into<String>) -> Self {
        self.failing_archives.push(prefix.into());
        self
    }

    /// Fail every prune.
    pub fn with_failing_prune(mut self) -> Self {
        self.failing_prune = true;
        self
    }

    /// Names of all stored archives, oldest first.
    pub fn archive_names(&self) -> Vec<String> {
        self.lock_archives().iter().map(|a| a.name.clone()).collect()
    }

    /// All stored archives, oldest first.
    pub fn archives(&self) -> Vec<StoredArchive> {
        self.lock_archives().clone()
    }

    fn lock_archives(&self) -> std::sync::MutexGuard<'_, Vec<StoredArchive>> {
        self.archives.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failure(stderr: impl Into<String>) -> ToolError {
        ToolError::Failed {
            program: "borg".to_string(),
            status: "exit status: 2".to_string(),
            code: Some(2),
            stderr: stderr.into(),
        }
    }
}

impl Default for MockRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Names kept by borg-style retention, evaluated newest first.
///
/// Each rule keeps the newest archive of each of its most recent periods.
/// An archive already kept by an earlier rule does not use up a slot.
fn retained(archives: &[&StoredArchive], policy: &RetentionPolicy) -> HashSet<String> {
    let mut sorted: Vec<&StoredArchive> = archives.to_vec();
    sorted.sort_by(|a, b| b.created.cmp(&a.created));

    let rules: [(u32, fn(&DateTime<Utc>) -> (i32, u32)); 3] = [
        (policy.keep_daily, |t| (t.year(), t.ordinal())),
        (policy.keep_weekly, |t| {
            let week = t.iso_week();
            (week.year(), week.week())
        }),
        (policy.keep_monthly, |t| (t.year(), t.month())),
    ];

    let mut kept = HashSet::new();
    for (count, period_of) in rules {
        if count == 0 {
            continue;
        }
        let mut last_period = None;
        let mut used = 0;
        for archive in &sorted {
            let period = period_of(&archive.created);
            if last_period == Some(period) {
                continue;
            }
            last_period = Some(period);
            if kept.insert(archive.name.clone()) {
                used += 1;
                if used == count {
                    break;
                }
            }
        }
    }
    kept
}

#[async_trait]
impl Repository for MockRepository {
    async fn validate(&self, repository: &RepositoryRef) -> Result<(), RepositoryError> {
        record(&self.journal, format!("validate {}", repository));

        if !self.valid {
            return Err(RepositoryError::Unavailable {
                repository: repository.to_string(),
                source: Self::failure(format!("Repository {} does not exist.", repository)),
            });
        }
        Ok(())
    }

    async fn create_archive(&self, job: &ArchiveJob) -> Result<ArchiveResult, RepositoryError> {
        record(&self.journal, format!("archive {} {}", job.set, job.strategy));

        if self.failing_archives.iter().any(|prefix| job.name.starts_with(prefix.as_str())) {
            return Err(RepositoryError::Archive {
                archive: job.name.clone(),
                source: Self::failure(format!("{}: mock archive failure", job.source)),
            });
        }

        let mut archives = self.lock_archives();
        if archives.iter().any(|a| a.name == job.name) {
            return Err(RepositoryError::Archive {
                archive: job.name.clone(),
                source: Self::failure(format!("Archive {} already exists", job.name)),
            });
        }

        archives.push(StoredArchive {
            name: job.name.clone(),
            created: (self.clock)(),
            source: job.source.to_string(),
        });
        info!(archive = %job.name, "Mock archive stored");

        Ok(ArchiveResult {
            name: job.name.clone(),
            elapsed: Duration::ZERO,
            warning: None,
        })
    }

    async fn prune(
        &self,
        _repository: &RepositoryRef,
        glob: &str,
        policy: &RetentionPolicy,
    ) -> Result<PruneResult, RepositoryError> {
        record(&self.journal, format!("prune {}", glob));

        let prune_error = |stderr: String| RepositoryError::Prune {
            glob: glob.to_string(),
            source: Self::failure(stderr),
        };

        if self.failing_prune {
            return Err(prune_error("mock prune failure".to_string()));
        }

        let pattern = glob::Pattern::new(glob).map_err(|e| prune_error(e.to_string()))?;

        let mut archives = self.lock_archives();
        let matching: Vec<&StoredArchive> =
            archives.iter().filter(|a| pattern.matches(&a.name)).collect();
        let kept = retained(&matching, policy);

        let mut result = PruneResult::default();
        for archive in &matching {
            if kept.contains(&archive.name) {
                result.kept.push(archive.name.clone());
            } else {
                result.pruned.push(archive.name.clone());
            }
        }

        archives.retain(|a| !pattern.matches(&a.name) || kept.contains(&a.name));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{ArchiveSource, Compression};
    use crate::strategy::Strategy;
    use chrono::{TimeDelta, TimeZone};
    use std::path::PathBuf;

    fn repo() -> RepositoryRef {
        RepositoryRef::parse("/srv/borg").unwrap()
    }

    fn job(name: &str) -> ArchiveJob {
        let set = name.rsplit_once('@').map(|(set, _)| set).unwrap_or(name);
        ArchiveJob {
            repository: repo(),
            name: name.to_string(),
            set: set.to_string(),
            set_glob: format!("{}@*", set),
            source: ArchiveSource::Special(PathBuf::from("/dev/sdb1")),
            strategy: Strategy::RawSpecial { zero_free_space: false },
            compression: Compression::default(),
        }
    }

    /// Repository whose clock advances one day per archive.
    fn daily_repository(start: DateTime<Utc>) -> MockRepository {
        let tick = Arc::new(Mutex::new(start));
        MockRepository::new().with_clock(Arc::new(move || {
            let mut now = tick.lock().unwrap();
            let current = *now;
            *now = current + TimeDelta::days(1);
            current
        }))
    }

    #[tokio::test]
    async fn test_validate() {
        assert!(MockRepository::new().validate(&repo()).await.is_ok());
        let err = MockRepository::new().invalid().validate(&repo()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let repository = MockRepository::new();
        repository.create_archive(&job("a@1")).await.unwrap();
        assert!(repository.create_archive(&job("a@1")).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_archive() {
        let repository = MockRepository::new().with_failing_archive("web");
        assert!(repository.create_archive(&job("web@1")).await.is_err());
        assert!(repository.create_archive(&job("db@1")).await.is_ok());
        assert_eq!(repository.archive_names(), vec!["db@1"]);
    }

    #[tokio::test]
    async fn test_prune_keeps_one_per_day() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        let repository = MockRepository::new().with_clock(Arc::new(move || start));
        for i in 0..3 {
            repository.create_archive(&job(&format!("a@{}", i))).await.unwrap();
        }

        let policy = RetentionPolicy { keep_daily: 1, keep_weekly: 0, keep_monthly: 0 };
        let result = repository.prune(&repo(), "a@*", &policy).await.unwrap();
        assert_eq!(result.kept.len(), 1);
        assert_eq!(result.pruned.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_respects_bounds_and_other_sets() {
        let repository = daily_repository(Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap());
        for i in 0..60 {
            repository.create_archive(&job(&format!("a@{:02}", i))).await.unwrap();
        }
        repository.create_archive(&job("b@0")).await.unwrap();

        let policy = RetentionPolicy { keep_daily: 7, keep_weekly: 4, keep_monthly: 6 };
        let result = repository.prune(&repo(), "a@*", &policy).await.unwrap();

        assert!(result.kept.len() <= policy.max_kept());
        assert!(result.kept.contains(&"a@59".to_string()));
        assert_eq!(result.kept.len() + result.pruned.len(), 60);
        assert!(repository.archive_names().contains(&"b@0".to_string()));
    }

    #[tokio::test]
    async fn test_prune_is_idempotent() {
        let repository = daily_repository(Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap());
        for i in 0..20 {
            repository.create_archive(&job(&format!("a@{:02}", i))).await.unwrap();
        }

        let policy = RetentionPolicy { keep_daily: 3, keep_weekly: 2, keep_monthly: 1 };
        repository.prune(&repo(), "a@*", &policy).await.unwrap();
        let after_first = repository.archive_names();
        let second = repository.prune(&repo(), "a@*", &policy).await.unwrap();

        assert!(second.pruned.is_empty());
        assert_eq!(repository.archive_names(), after_first);
    }

    #[tokio::test]
    async fn test_journal_uses_set_prefix() {
        let journal: CallJournal = Arc::new(Mutex::new(Vec::new()));
        let repository = MockRepository::new().with_journal(journal.clone());
        repository.create_archive(&job("db1-part-sdb1@x")).await.unwrap();
        repository.prune(&repo(), "db1-part-sdb1@*", &RetentionPolicy::default()).await.unwrap();

        let calls = journal.lock().unwrap().clone();
        assert_eq!(calls, vec![
            "archive db1-part-sdb1 raw-special",
            "prune db1-part-sdb1@*",
        ]);
    }
}
