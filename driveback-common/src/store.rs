use std::path::Path;

use crate::error::DriveError;
use crate::node::{NewNode, Node, NodePatch};
use crate::query::Query;

/// Bytes moved so far in an upload or download, reported at every chunk
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: Option<u64>,
}

impl TransferProgress {
    pub fn percent(&self) -> Option<u8> {
        match self.total {
            Some(0) => Some(100),
            Some(total) => Some((self.transferred.min(total) * 100 / total) as u8),
            None => None,
        }
    }
}

pub type ProgressFn<'a> = &'a mut (dyn FnMut(TransferProgress) + Send);

/// Trait implemented by remote object stores.
///
/// The store knows nothing about paths: it answers id lookups and predicate
/// queries over a graph of nodes linked by parent ids. Path semantics are
/// layered on top by the resolver.
#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    /// Id of the distinguished root folder.
    async fn root_id(&self) -> Result<String, DriveError>;

    async fn get(&self, id: &str) -> Result<Node, DriveError>;

    /// All nodes matching the query, in the store's native order.
    async fn list(&self, query: &Query) -> Result<Vec<Node>, DriveError>;

    async fn create(&self, metadata: &NewNode) -> Result<Node, DriveError>;

    async fn update(&self, id: &str, patch: &NodePatch) -> Result<Node, DriveError>;

    async fn delete(&self, id: &str) -> Result<(), DriveError>;

    /// Upload the contents of a local file as a new node.
    async fn upload_media(
        &self,
        metadata: &NewNode,
        source: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<Node, DriveError>;

    /// Stream a node's contents into `dest`, returning the number of bytes
    /// written.
    async fn download_media(
        &self,
        id: &str,
        dest: &mut tokio::fs::File,
        progress: ProgressFn<'_>,
    ) -> Result<u64, DriveError>;
}
