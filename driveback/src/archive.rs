//! Archiver backed by the system `tar` and `md5sum` tools.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

use driveback_common::archiver::Archiver;
use driveback_common::DriveError;

const MD5_BATCH: usize = 256;

pub struct TarArchiver {
    tar: String,
    md5sum: String,
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self {
            tar: "tar".to_string(),
            md5sum: "md5sum".to_string(),
        }
    }
}

fn archive_error(directory: &Path, message: impl Into<String>) -> DriveError {
    DriveError::Archive {
        path: directory.display().to_string(),
        message: message.into(),
    }
}

fn is_excluded(path: &Path, excludes: &[PathBuf]) -> bool {
    excludes.iter().any(|e| path.starts_with(e) && path != e.as_path())
}

/// Regular files under `directory` outside the excluded sub-trees, in byte
/// order of their full path. Symlinks are not followed.
pub fn collect_files(directory: &Path, excludes: &[PathBuf]) -> Result<Vec<PathBuf>, DriveError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(directory)
        .into_iter()
        .filter_entry(|e| !is_excluded(e.path(), excludes))
    {
        let entry = entry.map_err(|e| archive_error(directory, e.to_string()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort_by(|a, b| {
        a.as_os_str()
            .as_encoded_bytes()
            .cmp(b.as_os_str().as_encoded_bytes())
    });
    Ok(files)
}

/// Arguments for a gzipped ustar archive of `directory`, stored relative to
/// its parent. ustar drops the extended attributes that would make archives
/// of identical content differ.
pub fn tar_args(directory: &Path, excludes: &[PathBuf], dest: &Path) -> Result<Vec<OsString>, DriveError> {
    let parent = directory
        .parent()
        .ok_or_else(|| archive_error(directory, "cannot archive the filesystem root"))?;
    let name = directory
        .file_name()
        .ok_or_else(|| archive_error(directory, "directory has no name"))?;

    let mut args: Vec<OsString> = Vec::new();
    for exclude in excludes {
        let relative = exclude
            .strip_prefix(parent)
            .unwrap_or_else(|_| exclude.strip_prefix("/").unwrap_or(exclude));
        args.push("--exclude".into());
        args.push(relative.as_os_str().to_owned());
    }
    args.push("--format".into());
    args.push("ustar".into());
    args.push("-czf".into());
    args.push(dest.as_os_str().to_owned());
    args.push("--directory".into());
    args.push(parent.as_os_str().to_owned());
    args.push(name.to_owned());
    Ok(args)
}

impl TarArchiver {
    async fn md5_of_stdin(&self, directory: &Path, input: &[u8]) -> Result<String, DriveError> {
        let mut child = Command::new(&self.md5sum)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| archive_error(directory, format!("cannot run {}: {}", self.md5sum, e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .await
                .map_err(|e| archive_error(directory, e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| archive_error(directory, e.to_string()))?;
        if !output.status.success() {
            return Err(archive_error(directory, String::from_utf8_lossy(&output.stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait::async_trait]
impl Archiver for TarArchiver {
    /// md5sum over the per-file md5sum listing, in the
    /// `<hex>  -` form md5sum prints for standard input.
    async fn checksum(&self, directory: &Path, excludes: &[PathBuf]) -> Result<String, DriveError> {
        let walk_root = directory.to_path_buf();
        let walk_excludes = excludes.to_vec();
        let files = tokio::task::spawn_blocking(move || collect_files(&walk_root, &walk_excludes))
            .await
            .map_err(|e| archive_error(directory, e.to_string()))??;
        debug!(directory = %directory.display(), files = files.len(), "Computing checksum");

        let mut listing = Vec::new();
        for batch in files.chunks(MD5_BATCH) {
            let output = Command::new(&self.md5sum)
                .args(batch)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| archive_error(directory, format!("cannot run {}: {}", self.md5sum, e)))?;
            if !output.status.success() {
                return Err(archive_error(directory, String::from_utf8_lossy(&output.stderr)));
            }
            listing.extend_from_slice(&output.stdout);
        }
        self.md5_of_stdin(directory, &listing).await
    }

    async fn archive(
        &self,
        directory: &Path,
        excludes: &[PathBuf],
        dest: &Path,
    ) -> Result<(), DriveError> {
        let args = tar_args(directory, excludes, dest)?;
        debug!(directory = %directory.display(), dest = %dest.display(), "Running tar");
        let output = Command::new(&self.tar)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| archive_error(directory, format!("cannot run {}: {}", self.tar, e)))?;
        if !output.status.success() {
            return Err(archive_error(
                directory,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}
