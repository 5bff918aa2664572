use std::path::{Path, PathBuf};

use tracing::{info, warn};

use driveback_common::node::{NewNode, Node, NodePatch};
use driveback_common::store::ProgressFn;
use driveback_common::DriveError;

use crate::resolver::{find_by_path, join_path, normalize_path, resolve_folder, resolve_path, Located};
use crate::session::Session;

// ── Upload ───────────────────────────────────────────────────────────────────

/// Upload a local file into the folder at `parent_path`, keeping its base
/// name. With `allow_duplicate` unset an existing non-trashed node at the
/// target path is an error.
pub async fn upload_to_path(
    session: &Session,
    local_file: &Path,
    parent_path: &str,
    allow_duplicate: bool,
    checksum: Option<&str>,
    progress: ProgressFn<'_>,
) -> Result<Located, DriveError> {
    let meta = tokio::fs::metadata(local_file)
        .await
        .map_err(|e| DriveError::io(local_file.display(), e))?;
    if !meta.is_file() {
        return Err(DriveError::io(
            local_file.display(),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    let name = local_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            DriveError::io(
                local_file.display(),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })?;

    let parent_path = normalize_path(parent_path);
    let parent = if parent_path == "/" {
        session.root()
    } else {
        resolve_folder(session, &parent_path).await?
    };

    let target = join_path(&parent.path, &name);
    if !allow_duplicate {
        if let Some(existing) = find_by_path(session, &target, false).await?.into_iter().next() {
            return Err(DriveError::Duplicate {
                path: target,
                id: existing.node.id,
            });
        }
    }

    let mime = mime_guess::from_path(local_file)
        .first()
        .map(|m| m.essence_str().to_string());
    let metadata = NewNode::file(&name, parent.id())
        .with_mime_type(mime)
        .with_checksum(checksum);

    let node = session
        .store()
        .upload_media(&metadata, local_file, progress)
        .await?;
    info!(path = %target, id = %node.id, bytes = meta.len(), "Uploaded");
    Ok(parent.child(node))
}

// ── Delete ───────────────────────────────────────────────────────────────────

/// Delete the single node at `path`. With `trash` set the node is moved to
/// the trash instead of being removed.
pub async fn delete_by_path(session: &Session, path: &str, trash: bool) -> Result<Located, DriveError> {
    let path = normalize_path(path);
    if path == "/" {
        return Err(DriveError::RootIsReadOnly);
    }
    let target = crate::resolver::resolve_unique(session, &path).await?;
    delete_node(session, target, trash).await
}

pub async fn delete_by_id(session: &Session, id: &str, trash: bool) -> Result<Located, DriveError> {
    if session.is_root(id) {
        return Err(DriveError::RootIsReadOnly);
    }
    let target = resolve_path(session, id).await?;
    delete_node(session, target, trash).await
}

async fn delete_node(session: &Session, target: Located, trash: bool) -> Result<Located, DriveError> {
    if trash {
        session.store().update(target.id(), &NodePatch::trash()).await?;
        info!(path = %target.path, id = %target.id(), "Trashed");
    } else {
        session.store().delete(target.id()).await?;
        info!(path = %target.path, id = %target.id(), "Deleted");
    }
    Ok(target)
}

// ── Download ─────────────────────────────────────────────────────────────────

/// Download a file node into `dest_dir`. The local name defaults to the
/// node's name; an existing file is never overwritten, a ` (n)` suffix is
/// added instead. A failed transfer leaves no partial file behind.
pub async fn download_by_id(
    session: &Session,
    id: &str,
    dest_dir: &Path,
    dest_name: Option<&str>,
    progress: ProgressFn<'_>,
) -> Result<(PathBuf, Node), DriveError> {
    let node = session.store().get(id).await?;
    if node.is_folder() {
        return Err(DriveError::Download {
            id: id.to_string(),
            path: dest_dir.display().to_string(),
            message: format!("{} is a folder", node.name),
        });
    }

    let wanted = dest_name.unwrap_or(&node.name);
    let file_name = Path::new(wanted)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| node.id.clone());
    let (dest, mut file) = create_unique(dest_dir, &file_name).await?;

    match session.store().download_media(id, &mut file, progress).await {
        Ok(bytes) => {
            info!(id = %id, path = %dest.display(), bytes, "Downloaded");
            Ok((dest, node))
        }
        Err(e) => {
            drop(file);
            if let Err(rm) = tokio::fs::remove_file(&dest).await {
                warn!(path = %dest.display(), error = %rm, "Failed to remove partial download");
            }
            Err(DriveError::Download {
                id: id.to_string(),
                path: dest.display().to_string(),
                message: e.to_string(),
            })
        }
    }
}

/// `name`, then `stem (1).ext`, `stem (2).ext` and so on.
fn candidate_name(name: &str, n: usize) -> String {
    if n == 0 {
        return name.to_string();
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    match path.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    }
}

async fn create_unique(dir: &Path, name: &str) -> Result<(PathBuf, tokio::fs::File), DriveError> {
    let mut n = 0;
    loop {
        let candidate = dir.join(candidate_name(name, n));
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(DriveError::io(candidate.display(), e)),
        }
    }
}
