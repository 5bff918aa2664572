use tracing::{debug, info};

use driveback_common::node::NewNode;
use driveback_common::DriveError;

use crate::resolver::{find_by_path, join_path, normalize_path, Located};
use crate::session::Session;

/// Make sure every folder along `path` exists, creating the missing ones
/// under their parent. Returns the deepest folder.
///
/// Safe to call repeatedly: existing folders are reused. A segment held by a
/// file, or by more than one node, stops the walk.
pub async fn create_folder_path(session: &Session, path: &str) -> Result<Located, DriveError> {
    let path = normalize_path(path);
    let mut current = session.root();

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let target = join_path(&current.path, segment);
        let mut existing = find_by_path(session, &target, false).await?;

        current = match existing.len() {
            0 => {
                let created = session
                    .store()
                    .create(&NewNode::folder(segment, current.id()))
                    .await?;
                info!(path = %target, id = %created.id, "Created folder");
                current.child(created)
            }
            1 => {
                let found = existing.remove(0);
                if !found.node.is_folder() {
                    return Err(DriveError::PathConflict {
                        path: target,
                        expected: "folder",
                    });
                }
                debug!(path = %target, id = %found.id(), "Folder exists");
                found
            }
            count => return Err(DriveError::AmbiguousPath { path: target, count }),
        };
    }

    Ok(current)
}
