//! Disk inspection using the standard Linux block utilities.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{DiskError, DiskInspector, FilesystemType};
use crate::config::ToolPaths;
use crate::process::ToolCommand;

/// `blkid` exits with 2 when no signature matched the requested tag.
const BLKID_NO_MATCH: i32 = 2;

/// Disk inspector backed by `lsblk`, `blkid`, `zerofree`, and `ntfsclone`.
pub struct HostDiskTools {
    tools: ToolPaths,
}

impl HostDiskTools {
    /// Create an inspector using the given tool paths.
    pub fn new(tools: ToolPaths) -> Self {
        Self { tools }
    }
}

impl Default for HostDiskTools {
    fn default() -> Self {
        Self::new(ToolPaths::default())
    }
}

/// Parse `lsblk --list --noheadings --paths --output NAME,TYPE` output,
/// keeping only partition rows.
fn parse_lsblk_partitions(stdout: &str) -> Result<Vec<PathBuf>, DiskError> {
    let mut partitions = Vec::new();

    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(kind)) = (fields.next(), fields.next()) else {
            return Err(DiskError::Parse {
                tool: "lsblk",
                detail: format!("malformed row {:?}", line),
            });
        };
        if kind == "part" {
            partitions.push(PathBuf::from(name));
        }
    }

    Ok(partitions)
}

#[async_trait]
impl DiskInspector for HostDiskTools {
    #[instrument(skip(self), fields(device = %device.display()))]
    async fn list_partitions(&self, device: &Path) -> Result<Vec<PathBuf>, DiskError> {
        let output = ToolCommand::new(&self.tools.lsblk)
            .args(["--list", "--noheadings", "--paths", "--output", "NAME,TYPE"])
            .arg(device)
            .output()
            .await?;

        let partitions = parse_lsblk_partitions(&output.stdout)?;
        debug!(count = partitions.len(), "Enumerated partitions");
        Ok(partitions)
    }

    #[instrument(skip(self), fields(device = %device.display()))]
    async fn probe_filesystem(&self, device: &Path) -> Result<FilesystemType, DiskError> {
        let result = ToolCommand::new(&self.tools.blkid)
            .args(["--probe", "--match-tag", "TYPE", "--output", "value"])
            .arg(device)
            .output()
            .await;

        match result {
            Ok(output) => Ok(FilesystemType::from_probe(&output.stdout)),
            Err(e) if e.exit_code() == Some(BLKID_NO_MATCH) => Ok(FilesystemType::Unknown),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(device = %device.display()))]
    async fn zero_free_space(&self, device: &Path) -> Result<(), DiskError> {
        info!("Zeroing free space");

        ToolCommand::new(&self.tools.zerofree)
            .arg(device)
            .output()
            .await?;

        Ok(())
    }

    fn ntfs_clone_command(&self, device: &Path) -> ToolCommand {
        ToolCommand::new(&self.tools.ntfsclone)
            .args(["--save-image", "--output", "-"])
            .arg(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsblk_partitions() {
        let stdout = "\
/dev/sdb  disk
/dev/sdb1 part
/dev/sdb2 part
/dev/mapper/vg-root lvm
";
        let partitions = parse_lsblk_partitions(stdout).unwrap();
        assert_eq!(
            partitions,
            vec![PathBuf::from("/dev/sdb1"), PathBuf::from("/dev/sdb2")]
        );
    }

    #[test]
    fn test_parse_lsblk_whole_disk() {
        let partitions = parse_lsblk_partitions("/dev/sdc disk\n").unwrap();
        assert!(partitions.is_empty());
    }

    #[test]
    fn test_parse_lsblk_malformed() {
        assert!(matches!(
            parse_lsblk_partitions("/dev/sdb\n"),
            Err(DiskError::Parse { tool: "lsblk", .. })
        ));
    }

    #[test]
    fn test_ntfs_clone_streams_to_stdout() {
        let cmd = HostDiskTools::default().ntfs_clone_command(Path::new("/dev/sdb1"));
        assert_eq!(cmd.program(), "ntfsclone");
        assert_eq!(cmd.arg_strings(), vec!["--save-image", "--output", "-", "/dev/sdb1"]);
    }

    #[tokio::test]
    async fn test_missing_lsblk_is_tool_error() {
        let tools = ToolPaths {
            lsblk: "/nonexistent/lsblk".to_string(),
            ..ToolPaths::default()
        };
        let result = HostDiskTools::new(tools).list_partitions(Path::new("/dev/sdb")).await;
        assert!(matches!(result, Err(DiskError::Tool(_))));
    }
}
