use driveback_common::node::Node;
use driveback_common::store::NodeStore;
use driveback_common::DriveError;
use tracing::debug;

use crate::resolver::Located;

/// Per-invocation handle on the remote store.
///
/// Holds the store and the root folder, fetched once when the session is
/// opened. Every path operation takes the session by reference.
pub struct Session {
    store: Box<dyn NodeStore>,
    root: Node,
}

impl Session {
    pub async fn open(store: Box<dyn NodeStore>) -> Result<Self, DriveError> {
        let root_id = store.root_id().await?;
        let root = store.get(&root_id).await?;
        debug!(root_id = %root.id, "Session opened");
        Ok(Self { store, root })
    }

    pub fn store(&self) -> &dyn NodeStore {
        self.store.as_ref()
    }

    pub fn root_id(&self) -> &str {
        &self.root.id
    }

    pub fn is_root(&self, id: &str) -> bool {
        id == self.root.id
    }

    pub fn root(&self) -> Located {
        Located {
            path: "/".to_string(),
            ids: vec![self.root.id.clone()],
            node: self.root.clone(),
        }
    }
}
