use std::path::{Path, PathBuf};

use crate::error::DriveError;

/// Local archive and hash tooling used by the backup rotation.
///
/// Both operations must be stable: unchanged directory contents always yield
/// the same checksum, and archives carry no attributes that would make two
/// runs over identical content differ.
#[async_trait::async_trait]
pub trait Archiver: Send + Sync {
    /// Aggregate checksum over every regular file under `directory`, skipping
    /// the `excludes` sub-trees.
    async fn checksum(&self, directory: &Path, excludes: &[PathBuf]) -> Result<String, DriveError>;

    /// Write a compressed archive of `directory` to `dest`.
    async fn archive(
        &self,
        directory: &Path,
        excludes: &[PathBuf],
        dest: &Path,
    ) -> Result<(), DriveError>;
}
