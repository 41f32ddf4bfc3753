//! Repository client bound to one repository for the length of a run.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::{
    ArchiveJob, ArchiveKind, ArchiveNamer, ArchiveResult, ArchiveSource, Compression, PruneResult,
    Repository, RepositoryError, RepositoryRef, RetentionPolicy,
};
use crate::strategy::Strategy;

/// Builds, names, and submits archive jobs against one repository.
pub struct RepositoryClient {
    backend: Arc<dyn Repository>,
    repository: RepositoryRef,
    compression: Compression,
    retention: RetentionPolicy,
    namer: ArchiveNamer,
}

impl RepositoryClient {
    pub fn new(
        backend: Arc<dyn Repository>,
        repository: RepositoryRef,
        compression: Compression,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            backend,
            repository,
            compression,
            retention,
            namer: ArchiveNamer::new(),
        }
    }

    /// Replace the archive namer (tests use a frozen clock).
    pub fn with_namer(mut self, namer: ArchiveNamer) -> Self {
        self.namer = namer;
        self
    }

    pub fn repository(&self) -> &RepositoryRef {
        &self.repository
    }

    /// Check the repository can be opened.
    pub async fn validate(&self) -> Result<(), RepositoryError> {
        self.backend.validate(&self.repository).await
    }

    /// Build a uniquely named job for one archive set.
    pub fn job(
        &self,
        machine: &str,
        kind: ArchiveKind,
        subject: &str,
        strategy: Strategy,
        source: ArchiveSource,
    ) -> ArchiveJob {
        ArchiveJob {
            repository: self.repository.clone(),
            name: self.namer.next(machine, kind, subject),
            set: ArchiveNamer::set_prefix(machine, kind, subject),
            set_glob: ArchiveNamer::set_glob(machine, kind, subject),
            source,
            strategy,
            compression: self.compression.clone(),
        }
    }

    /// Create an archive. Failures are logged and returned to the caller.
    pub async fn archive(&self, job: &ArchiveJob) -> Result<ArchiveResult, RepositoryError> {
        info!(
            archive = %job.name,
            strategy = %job.strategy,
            source = %job.source,
            "Creating archive"
        );

        match self.backend.create_archive(job).await {
            Ok(result) => {
                if result.warning.is_some() {
                    warn!(archive = %result.name, "Archive created with warnings");
                } else {
                    info!(
                        archive = %result.name,
                        elapsed_ms = result.elapsed.as_millis() as u64,
                        "Archive created"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                error!(archive = %job.name, error = %e, "Archive failed");
                Err(e)
            }
        }
    }

    /// Apply the retention policy to one archive set.
    pub async fn prune(&self, glob: &str) -> Result<PruneResult, RepositoryError> {
        match self.backend.prune(&self.repository, glob, &self.retention).await {
            Ok(result) => {
                info!(
                    glob = %glob,
                    kept = result.kept.len(),
                    pruned = result.pruned.len(),
                    "Pruned archive set"
                );
                Ok(result)
            }
            Err(e) => {
                error!(glob = %glob, error = %e, "Prune failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockRepository;
    use std::path::PathBuf;

    fn client(backend: Arc<MockRepository>) -> RepositoryClient {
        RepositoryClient::new(
            backend,
            RepositoryRef::parse("/srv/borg").unwrap(),
            Compression::default(),
            RetentionPolicy { keep_daily: 1, keep_weekly: 0, keep_monthly: 0 },
        )
    }

    #[tokio::test]
    async fn test_job_carries_client_settings() {
        let client = client(Arc::new(MockRepository::new()));
        let job = client.job(
            "db1",
            ArchiveKind::Partition,
            "sdb1",
            Strategy::NtfsClone,
            ArchiveSource::Special(PathBuf::from("/dev/sdb1")),
        );
        assert!(job.name.starts_with("db1-part-sdb1-"));
        assert_eq!(job.set, "db1-part-sdb1");
        assert_eq!(job.set_glob, "db1-part-sdb1-[0-9][0-9][0-9][0-9]-*");
        assert_eq!(job.repository.as_str(), "/srv/borg");
        assert_eq!(job.compression, Compression::default());
    }

    #[tokio::test]
    async fn test_archive_then_prune() {
        let backend = Arc::new(MockRepository::new());
        let client = client(backend.clone());

        for _ in 0..3 {
            let job = client.job(
                "db1",
                ArchiveKind::Bundle,
                "files",
                Strategy::PlainFiles,
                ArchiveSource::Files(vec![PathBuf::from("/tmp/db1.xml")]),
            );
            client.archive(&job).await.unwrap();
        }
        assert_eq!(backend.archive_names().len(), 3);

        let result = client.prune(&ArchiveNamer::set_glob("db1", ArchiveKind::Bundle, "files")).await.unwrap();
        assert_eq!(result.kept.len(), 1);
        assert_eq!(backend.archive_names().len(), 1);
    }
}
