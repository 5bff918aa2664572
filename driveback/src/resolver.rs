//! Virtual path layer over the store's parent-pointer graph.
//!
//! A node's canonical path is built by following `parents[0]` up to the root.
//! Other parents are ignored. The store can only filter by name at a single
//! level, so every lookup by path recomputes candidate paths client-side and
//! keeps exact matches.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::debug;

use driveback_common::node::Node;
use driveback_common::query::Query;
use driveback_common::DriveError;

use crate::session::Session;

/// A node together with its canonical path.
#[derive(Debug, Clone)]
pub struct Located {
    pub path: String,
    /// Ids along the first-parent chain, outermost first, ending with the
    /// node itself. Starts with the root id when the chain reaches the root.
    pub ids: Vec<String>,
    pub node: Node,
}

impl Located {
    pub fn id(&self) -> &str {
        &self.node.id
    }

    /// The located form of a node created directly under this one.
    pub fn child(&self, node: Node) -> Located {
        let mut ids = self.ids.clone();
        ids.push(node.id.clone());
        Located {
            path: join_path(&self.path, &node.name),
            ids,
            node,
        }
    }
}

/// Collapse repeated and trailing slashes; the empty path is the root.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Split a normalized path into its parent path and final segment.
pub fn split_parent(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(i) => (path[..i].to_string(), path[i + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// The parent to follow next, or `None` once the walk reaches the root or a
/// node without parents.
fn next_parent(session: &Session, node: &Node) -> Option<String> {
    if node.parents.is_empty() || node.parents.iter().any(|p| session.is_root(p)) {
        return None;
    }
    node.parents.first().cloned()
}

/// Canonical path of the node with the given id.
pub async fn resolve_path(session: &Session, id: &str) -> Result<Located, DriveError> {
    if session.is_root(id) {
        return Ok(session.root());
    }
    let node = session.store().get(id).await?;
    locate(session, node, &mut HashMap::new()).await
}

/// Walk the first-parent chain of an already fetched node. Ancestors are
/// memoised in `ancestors` so that siblings from one listing share lookups.
async fn locate(
    session: &Session,
    node: Node,
    ancestors: &mut HashMap<String, Node>,
) -> Result<Located, DriveError> {
    if session.is_root(&node.id) {
        return Ok(session.root());
    }

    let mut names = vec![node.name.clone()];
    let mut ids = vec![node.id.clone()];
    let mut visited = HashSet::from([node.id.clone()]);
    let mut reached_root = node.parents.iter().any(|p| session.is_root(p));
    let mut parent = next_parent(session, &node);

    while let Some(parent_id) = parent {
        if !visited.insert(parent_id.clone()) {
            return Err(DriveError::CycleDetected {
                id: node.id.clone(),
                repeated: parent_id,
            });
        }
        let ancestor = match ancestors.get(&parent_id) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = session.store().get(&parent_id).await?;
                ancestors.insert(parent_id.clone(), fetched.clone());
                fetched
            }
        };
        names.push(ancestor.name.clone());
        ids.push(ancestor.id.clone());
        reached_root = ancestor.parents.iter().any(|p| session.is_root(p));
        parent = next_parent(session, &ancestor);
    }

    if reached_root {
        ids.push(session.root_id().to_string());
    }
    names.reverse();
    ids.reverse();
    Ok(Located {
        path: format!("/{}", names.join("/")),
        ids,
        node,
    })
}

/// Run a store query and attach the canonical path of every result.
/// Trashed nodes are left out unless `include_trashed` is set or the query
/// already constrains `trashed` itself.
pub async fn list_by_predicate(
    session: &Session,
    query: &Query,
    include_trashed: bool,
) -> Result<Vec<Located>, DriveError> {
    let query = if include_trashed {
        query.clone()
    } else {
        query.clone().excluding_trashed()
    };
    let nodes = session.store().list(&query).await?;
    debug!(query = %query, count = nodes.len(), "Resolving query results");

    let mut ancestors = HashMap::new();
    let mut located = Vec::with_capacity(nodes.len());
    for node in nodes {
        located.push(locate(session, node, &mut ancestors).await?);
    }
    Ok(located)
}

/// Every node whose canonical path is exactly `path`.
pub async fn find_by_path(
    session: &Session,
    path: &str,
    include_trashed: bool,
) -> Result<Vec<Located>, DriveError> {
    let path = normalize_path(path);
    if path == "/" {
        return Ok(vec![session.root()]);
    }
    let (_, name) = split_parent(&path);
    let candidates =
        list_by_predicate(session, &Query::new().name_equals(&name), include_trashed).await?;
    Ok(candidates.into_iter().filter(|c| c.path == path).collect())
}

/// The single non-trashed node at `path`.
pub async fn resolve_unique(session: &Session, path: &str) -> Result<Located, DriveError> {
    let path = normalize_path(path);
    let mut matches = find_by_path(session, &path, false).await?;
    match matches.len() {
        0 => Err(DriveError::NotFound(path)),
        1 => Ok(matches.remove(0)),
        count => Err(DriveError::AmbiguousPath { path, count }),
    }
}

/// Like [`resolve_unique`], but the node must be a folder.
pub async fn resolve_folder(session: &Session, path: &str) -> Result<Located, DriveError> {
    let folder = resolve_unique(session, path).await?;
    if !folder.node.is_folder() {
        return Err(DriveError::PathConflict {
            path: folder.path,
            expected: "folder",
        });
    }
    Ok(folder)
}

/// Children of a folder whose path matches `pattern`.
///
/// The last `/` splits the pattern into a literal parent folder path and a
/// regular expression for the final segment, anchored at both ends. The
/// expression cannot itself span `/`. Results keep the store's order.
pub async fn filter_by_pattern(
    session: &Session,
    pattern: &str,
    include_trashed: bool,
) -> Result<Vec<Located>, DriveError> {
    let (parent, wildcard) = match pattern.rfind('/') {
        Some(i) => (&pattern[..i], &pattern[i + 1..]),
        None => ("", pattern),
    };
    let parent = normalize_path(parent);
    let prefix = if parent == "/" {
        "/".to_string()
    } else {
        format!("{}/", parent)
    };
    let matcher = Regex::new(&format!("^{}(?:{})$", regex::escape(&prefix), wildcard)).map_err(
        |e| DriveError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        },
    )?;

    let parent_id = if parent == "/" {
        session.root_id().to_string()
    } else {
        resolve_folder(session, &parent).await?.node.id
    };

    let children =
        list_by_predicate(session, &Query::new().in_parents(&parent_id), include_trashed).await?;
    Ok(children
        .into_iter()
        .filter(|c| matcher.is_match(&c.path))
        .collect())
}
