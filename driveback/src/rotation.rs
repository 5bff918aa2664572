//! Backup rotation: archive local directories, upload them under a remote
//! backup folder, skip unchanged content and prune old generations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, Utc};
use tracing::{debug, info, warn};

use driveback_common::archiver::Archiver;
use driveback_common::query::Query;
use driveback_common::store::TransferProgress;
use driveback_common::DriveError;

use crate::files::{delete_by_id, upload_to_path};
use crate::folders::create_folder_path;
use crate::resolver::{list_by_predicate, split_parent, Located};
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct BackupPlan {
    /// Remote folder receiving the archives; created when missing.
    pub folder: String,
    /// Generations kept per directory, the new upload included.
    pub keepfiles: usize,
    /// Absolute paths left out of every archive and checksum.
    pub excludes: Vec<PathBuf>,
    /// Local directory for archives awaiting upload.
    pub scratch_dir: PathBuf,
    pub archive_retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadedBackup {
    pub directory: PathBuf,
    pub path: String,
    pub id: String,
    pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct UnchangedBackup {
    pub directory: PathBuf,
    /// The existing remote archive carrying the same checksum.
    pub path: String,
}

#[derive(Debug)]
pub struct FailedBackup {
    pub directory: PathBuf,
    pub error: DriveError,
}

/// An old generation that could not be removed. The directory's new archive
/// was uploaded regardless.
#[derive(Debug)]
pub struct FailedPrune {
    pub path: String,
    pub error: DriveError,
}

/// Outcome of one run, per directory.
#[derive(Debug, Default)]
pub struct BackupReport {
    pub uploaded: Vec<UploadedBackup>,
    pub unchanged: Vec<UnchangedBackup>,
    pub missing: Vec<PathBuf>,
    pub failed: Vec<FailedBackup>,
    /// Remote paths removed by pruning.
    pub pruned: Vec<String>,
    pub prune_failed: Vec<FailedPrune>,
}

enum Outcome {
    Uploaded(UploadedBackup),
    Unchanged(UnchangedBackup),
}

// ── Naming ───────────────────────────────────────────────────────────────────

fn drop_first(s: &str) -> &str {
    let mut chars = s.chars();
    chars.next();
    chars.as_str()
}

/// Name prefix shared by every archive of `directory` with this exclude
/// set. Archives are named `<root>.<local timestamp>.tgz`.
///
/// The path separators become underscores and the leading one is dropped.
/// The exclude part repeats each exclude the same way, minus any fragment
/// that spells the directory's parent.
pub fn backup_root(directory: &Path, excludes: &[PathBuf]) -> String {
    let dir = directory.to_string_lossy();
    let head = dir.replace('/', "_");

    let mut tail = String::from("_excl_");
    if excludes.is_empty() {
        tail.push_str("none");
    } else {
        for exclude in excludes {
            let mangled = exclude
                .to_string_lossy()
                .replace(&['*', '[', ']', '-', '/'][..], "_");
            tail.push_str(drop_first(&mangled));
        }
    }

    let parent = directory
        .parent()
        .map(|p| p.to_string_lossy().replace(&['-', '/'][..], "_"))
        .unwrap_or_default();
    if !parent.is_empty() {
        tail = tail.replace(&parent, "");
    }
    format!("{}{}", drop_first(&head), tail.replace("__", "_"))
}

fn archive_name(root: &str) -> String {
    format!("{}.{}.tgz", root, Local::now().format("%Y-%m-%dT%H.%M.%S%.6f"))
}

// ── Pruning ──────────────────────────────────────────────────────────────────

/// The generations to delete so that only the newest `keep` remain. Ties on
/// modification time keep their listing order.
pub fn select_prunable(mut generations: Vec<Located>, keep: usize) -> Vec<Located> {
    generations.sort_by_key(|g| g.node.modified_time);
    let excess = generations.len().saturating_sub(keep);
    generations.truncate(excess);
    generations
}

// ── Run ──────────────────────────────────────────────────────────────────────

/// Back up each directory in order. Per-directory failures are recorded in
/// the report and the run moves on; errors that make the backup folder
/// unusable end the run.
pub async fn run_backup(
    session: &Session,
    archiver: &dyn Archiver,
    plan: &BackupPlan,
    directories: &[PathBuf],
) -> Result<BackupReport, DriveError> {
    let folder = create_folder_path(session, &plan.folder).await?;
    let mut report = BackupReport::default();

    for directory in directories {
        if !directory.is_dir() {
            info!(directory = %directory.display(), "Directory does not exist, skipping");
            report.missing.push(directory.clone());
            continue;
        }

        match backup_directory(session, archiver, plan, &folder, directory, &mut report).await {
            Ok(Outcome::Uploaded(uploaded)) => report.uploaded.push(uploaded),
            Ok(Outcome::Unchanged(unchanged)) => report.unchanged.push(unchanged),
            Err(e) if e.aborts_run() => return Err(e),
            Err(e) => {
                warn!(directory = %directory.display(), error = %e, "Backup failed");
                report.failed.push(FailedBackup {
                    directory: directory.clone(),
                    error: e,
                });
            }
        }
    }

    info!(
        uploaded = report.uploaded.len(),
        unchanged = report.unchanged.len(),
        missing = report.missing.len(),
        failed = report.failed.len(),
        pruned = report.pruned.len(),
        prune_failed = report.prune_failed.len(),
        "Backup run finished"
    );
    Ok(report)
}

async fn backup_directory(
    session: &Session,
    archiver: &dyn Archiver,
    plan: &BackupPlan,
    folder: &Located,
    directory: &Path,
    report: &mut BackupReport,
) -> Result<Outcome, DriveError> {
    let checksum = archiver.checksum(directory, &plan.excludes).await?;
    let root = backup_root(directory, &plan.excludes);
    debug!(directory = %directory.display(), root = %root, checksum = %checksum, "Checking for changes");

    let prefix = format!("{}.", root);
    let query = Query::new().modified_before(Utc::now()).name_contains(&root);
    let generations: Vec<Located> = list_by_predicate(session, &query, false)
        .await?
        .into_iter()
        .filter(|g| g.node.name.starts_with(&prefix) && split_parent(&g.path).0 == folder.path)
        .collect();

    if let Some(same) = generations
        .iter()
        .find(|g| g.node.content_checksum.as_deref() == Some(checksum.as_str()))
    {
        info!(directory = %directory.display(), path = %same.path, "Unchanged since last backup");
        return Ok(Outcome::Unchanged(UnchangedBackup {
            directory: directory.to_path_buf(),
            path: same.path.clone(),
        }));
    }

    let archive = plan.scratch_dir.join(archive_name(&root));
    let uploaded = archive_and_upload(session, archiver, plan, folder, directory, &archive, &checksum).await;
    if let Err(e) = tokio::fs::remove_file(&archive).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %archive.display(), error = %e, "Failed to remove local archive");
        }
    }
    let uploaded = uploaded?;

    let mut all = generations;
    all.push(uploaded.clone());
    for old in select_prunable(all, plan.keepfiles) {
        match delete_by_id(session, old.id(), false).await {
            Ok(removed) => {
                info!(path = %removed.path, "Pruned old backup");
                report.pruned.push(removed.path);
            }
            Err(e) => {
                warn!(path = %old.path, error = %e, "Failed to prune old backup");
                report.prune_failed.push(FailedPrune {
                    path: old.path,
                    error: e,
                });
            }
        }
    }

    Ok(Outcome::Uploaded(UploadedBackup {
        directory: directory.to_path_buf(),
        path: uploaded.path,
        id: uploaded.node.id,
        size: uploaded.node.size,
    }))
}

async fn archive_and_upload(
    session: &Session,
    archiver: &dyn Archiver,
    plan: &BackupPlan,
    folder: &Located,
    directory: &Path,
    archive: &Path,
    checksum: &str,
) -> Result<Located, DriveError> {
    if let Err(e) = archiver.archive(directory, &plan.excludes, archive).await {
        warn!(
            directory = %directory.display(),
            error = %e,
            "Archive failed, retrying in {}s",
            plan.archive_retry_delay.as_secs()
        );
        tokio::time::sleep(plan.archive_retry_delay).await;
        archiver.archive(directory, &plan.excludes, archive).await?;
    }

    info!(directory = %directory.display(), archive = %archive.display(), "Uploading backup");
    upload_to_path(
        session,
        archive,
        &folder.path,
        false,
        Some(checksum),
        &mut |p: TransferProgress| {
            if let Some(pct) = p.percent() {
                debug!(transferred = p.transferred, "Upload {}%", pct);
            }
        },
    )
    .await
}
