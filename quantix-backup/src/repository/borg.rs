//! `borg` command-line backend.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{
    ArchiveJob, ArchiveResult, ArchiveSource, PruneResult, Repository, RepositoryError,
    RepositoryRef, RetentionPolicy,
};
use crate::config::Passphrase;
use crate::process::ToolCommand;

/// Borg exit code meaning "completed with warnings".
const BORG_WARNING: i32 = 1;

/// Repository backend that shells out to `borg`.
pub struct BorgRepository {
    borg_path: String,
    passphrase: Option<Passphrase>,
}

impl BorgRepository {
    pub fn new(borg_path: impl Into<String>, passphrase: Option<Passphrase>) -> Self {
        Self {
            borg_path: borg_path.into(),
            passphrase,
        }
    }

    fn command(&self, subcommand: &str) -> ToolCommand {
        let cmd = ToolCommand::new(&self.borg_path)
            .arg(subcommand)
            .allow_exit_code(BORG_WARNING);
        match &self.passphrase {
            Some(passphrase) => cmd.env("BORG_PASSPHRASE", passphrase.expose()),
            None => cmd,
        }
    }

    pub(crate) fn info_command(&self, repository: &RepositoryRef) -> ToolCommand {
        self.command("info").arg(repository.as_str())
    }

    pub(crate) fn create_command(&self, job: &ArchiveJob) -> ToolCommand {
        let cmd = self
            .command("create")
            .arg("--compression")
            .arg(job.compression.to_string());

        let spec = job.repository.archive_spec(&job.name);
        match &job.source {
            ArchiveSource::Files(paths) => cmd.arg(spec).args(paths),
            ArchiveSource::Special(device) => cmd.arg("--read-special").arg(spec).arg(device),
            ArchiveSource::Stream { stdin_name, .. } => cmd
                .arg("--stdin-name")
                .arg(stdin_name)
                .arg(spec)
                .arg("-"),
        }
    }

    pub(crate) fn prune_command(
        &self,
        repository: &RepositoryRef,
        glob: &str,
        policy: &RetentionPolicy,
    ) -> ToolCommand {
        self.command("prune")
            .arg("--list")
            .arg("--glob-archives")
            .arg(glob)
            .arg(format!("--keep-daily={}", policy.keep_daily))
            .arg(format!("--keep-weekly={}", policy.keep_weekly))
            .arg(format!("--keep-monthly={}", policy.keep_monthly))
            .arg(repository.as_str())
    }
}

/// Parse `borg prune --list` output.
///
/// Lines look like `Keeping archive (rule: daily #1): name  Mon, ...` or
/// `Pruning archive: name  Mon, ...`; the archive name is the first token
/// after the colon that ends the prefix.
fn parse_prune_list(output: &str) -> PruneResult {
    let mut result = PruneResult::default();

    for line in output.lines() {
        let line = line.trim();
        let target = if line.starts_with("Keeping archive") {
            &mut result.kept
        } else if line.starts_with("Pruning archive") || line.starts_with("Would prune") {
            &mut result.pruned
        } else {
            continue;
        };

        let name = line
            .split_once("):")
            .or_else(|| line.split_once(':'))
            .and_then(|(_, rest)| rest.split_whitespace().next());
        if let Some(name) = name {
            target.push(name.to_string());
        }
    }

    result
}

#[async_trait]
impl Repository for BorgRepository {
    #[instrument(skip(self), fields(repository = %repository))]
    async fn validate(&self, repository: &RepositoryRef) -> Result<(), RepositoryError> {
        self.info_command(repository)
            .output()
            .await
            .map_err(|source| RepositoryError::Unavailable {
                repository: repository.to_string(),
                source,
            })?;

        debug!("Repository is accessible");
        Ok(())
    }

    #[instrument(skip(self, job), fields(archive = %job.name))]
    async fn create_archive(&self, job: &ArchiveJob) -> Result<ArchiveResult, RepositoryError> {
        let started = Instant::now();
        let create = self.create_command(job);

        let output = match &job.source {
            ArchiveSource::Stream { producer, .. } => producer.pipe_into(&create).await,
            _ => create.output().await,
        }
        .map_err(|source| RepositoryError::Archive {
            archive: job.name.clone(),
            source,
        })?;

        let warning = output.is_warning().then(|| output.stderr.clone());
        if let Some(ref text) = warning {
            warn!(warning = %text, "borg create completed with warnings");
        }

        Ok(ArchiveResult {
            name: job.name.clone(),
            elapsed: started.elapsed(),
            warning,
        })
    }

    #[instrument(skip(self, policy), fields(repository = %repository))]
    async fn prune(
        &self,
        repository: &RepositoryRef,
        glob: &str,
        policy: &RetentionPolicy,
    ) -> Result<PruneResult, RepositoryError> {
        let output = self
            .prune_command(repository, glob, policy)
            .output()
            .await
            .map_err(|source| RepositoryError::Prune {
                glob: glob.to_string(),
                source,
            })?;

        if output.is_warning() {
            warn!(warning = %output.stderr, "borg prune completed with warnings");
        }

        // --list writes to stderr
        Ok(parse_prune_list(&format!("{}\n{}", output.stderr, output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ToolCommand;
    use crate::repository::Compression;
    use crate::strategy::Strategy;
    use std::path::PathBuf;

    fn repo() -> RepositoryRef {
        RepositoryRef::parse("/srv/borg").unwrap()
    }

    fn job(source: ArchiveSource, strategy: Strategy) -> ArchiveJob {
        ArchiveJob {
            repository: repo(),
            name: "db1-part-sdb1-2024-03-01T02-00-00.000000".to_string(),
            set: "db1-part-sdb1".to_string(),
            set_glob: "db1-part-sdb1-[0-9][0-9][0-9][0-9]-*".to_string(),
            source,
            strategy,
            compression: "zstd,6".parse::<Compression>().unwrap(),
        }
    }

    #[test]
    fn test_create_files() {
        let borg = BorgRepository::new("borg", None);
        let cmd = borg.create_command(&job(
            ArchiveSource::Files(vec![PathBuf::from("/tmp/w/db1.xml"), PathBuf::from("/var/lib/libvirt/images/db1.qcow2")]),
            Strategy::PlainFiles,
        ));
        assert_eq!(
            cmd.to_string(),
            "borg create --compression zstd,6 /srv/borg::db1-part-sdb1-2024-03-01T02-00-00.000000 \
             /tmp/w/db1.xml /var/lib/libvirt/images/db1.qcow2"
        );
        assert!(!cmd.has_env("BORG_PASSPHRASE"));
    }

    #[test]
    fn test_create_special() {
        let borg = BorgRepository::new("/usr/bin/borg", Some(Passphrase("pw".to_string())));
        let cmd = borg.create_command(&job(
            ArchiveSource::Special(PathBuf::from("/dev/sdb1")),
            Strategy::RawSpecial { zero_free_space: true },
        ));
        let args = cmd.arg_strings();
        assert_eq!(cmd.program(), "/usr/bin/borg");
        assert!(args.contains(&"--read-special".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/dev/sdb1"));
        assert!(cmd.has_env("BORG_PASSPHRASE"));
        assert!(!cmd.to_string().contains("pw"));
    }

    #[test]
    fn test_create_stream() {
        let borg = BorgRepository::new("borg", None);
        let cmd = borg.create_command(&job(
            ArchiveSource::Stream {
                producer: ToolCommand::new("ntfsclone"),
                stdin_name: "sdb1.ntfsclone".to_string(),
            },
            Strategy::NtfsClone,
        ));
        let args = cmd.arg_strings();
        assert_eq!(args[args.len() - 3..], ["sdb1.ntfsclone", "/srv/borg::db1-part-sdb1-2024-03-01T02-00-00.000000", "-"]);
        assert!(args.contains(&"--stdin-name".to_string()));
    }

    #[test]
    fn test_prune_command() {
        let borg = BorgRepository::new("borg", None);
        let policy = RetentionPolicy { keep_daily: 7, keep_weekly: 4, keep_monthly: 6 };
        let cmd = borg.prune_command(&repo(), "db1-vm-files-*", &policy);
        assert_eq!(
            cmd.to_string(),
            "borg prune --list --glob-archives db1-vm-files-* --keep-daily=7 --keep-weekly=4 --keep-monthly=6 /srv/borg"
        );
    }

    #[test]
    fn test_parse_prune_list() {
        let output = "\
Keeping archive (rule: daily #1):        db1-vm-files-2024-03-02T02-00-00.000000  Sat, 2024-03-02 02:00:00 [aa]
Keeping archive (rule: weekly #1):       db1-vm-files-2024-02-25T02-00-00.000000  Sun, 2024-02-25 02:00:00 [bb]
Pruning archive:                         db1-vm-files-2024-03-01T02-00-00.000000  Fri, 2024-03-01 02:00:00 [cc] (1/1)
";
        let result = parse_prune_list(output);
        assert_eq!(result.kept, vec![
            "db1-vm-files-2024-03-02T02-00-00.000000",
            "db1-vm-files-2024-02-25T02-00-00.000000",
        ]);
        assert_eq!(result.pruned, vec!["db1-vm-files-2024-03-01T02-00-00.000000"]);
    }

    #[tokio::test]
    async fn test_validate_reports_tool_failure() {
        let borg = BorgRepository::new("/nonexistent/borg", None);
        let err = borg.validate(&repo()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Unavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_one_is_a_warning() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("borg");
        std::fs::write(&script, "#!/bin/sh\necho 'file changed while we read it' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let borg = BorgRepository::new(script.to_string_lossy(), None);
        let result = borg
            .create_archive(&job(ArchiveSource::Files(Vec::new()), Strategy::PlainFiles))
            .await
            .unwrap();
        assert_eq!(result.warning.as_deref(), Some("file changed while we read it"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_two_is_an_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("borg");
        std::fs::write(&script, "#!/bin/sh\necho 'Repository does not exist' >&2\nexit 2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let borg = BorgRepository::new(script.to_string_lossy(), None);
        let err = borg
            .create_archive(&job(ArchiveSource::Files(Vec::new()), Strategy::PlainFiles))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Repository does not exist"));
    }
}
