use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Custom property key under which a backup's content checksum is stored.
pub const CHECKSUM_PROPERTY: &str = "checksum";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
}

// ── Node ─────────────────────────────────────────────────────────────────────

/// A file or folder in the remote store.
///
/// Only `parents[0]` takes part in path reconstruction. The checksum
/// property is lifted out of `properties` into `content_checksum`; on the
/// wire it travels as `properties.checksum`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireNode", into = "WireNode")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub parents: Vec<String>,
    pub size: Option<u64>,
    pub modified_time: DateTime<Utc>,
    pub trashed: bool,
    pub content_checksum: Option<String>,
    /// Remaining custom properties, without the checksum.
    pub properties: BTreeMap<String, String>,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        if self.mime_type == FOLDER_MIME_TYPE {
            NodeKind::Folder
        } else {
            NodeKind::File
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind() == NodeKind::Folder
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNode {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parents: Vec<String>,
    // Drive encodes int64 fields as decimal strings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<String>,
    #[serde(default)]
    modified_time: DateTime<Utc>,
    #[serde(default)]
    trashed: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    properties: BTreeMap<String, String>,
}

impl From<WireNode> for Node {
    fn from(wire: WireNode) -> Self {
        let mut properties = wire.properties;
        let content_checksum = properties.remove(CHECKSUM_PROPERTY);
        Node {
            id: wire.id,
            name: wire.name,
            mime_type: wire.mime_type,
            parents: wire.parents,
            size: wire.size.and_then(|s| s.parse().ok()),
            modified_time: wire.modified_time,
            trashed: wire.trashed,
            content_checksum,
            properties,
        }
    }
}

impl From<Node> for WireNode {
    fn from(node: Node) -> Self {
        let mut properties = node.properties;
        if let Some(checksum) = node.content_checksum {
            properties.insert(CHECKSUM_PROPERTY.to_string(), checksum);
        }
        WireNode {
            id: node.id,
            name: node.name,
            mime_type: node.mime_type,
            parents: node.parents,
            size: node.size.map(|s| s.to_string()),
            modified_time: node.modified_time,
            trashed: node.trashed,
            properties,
        }
    }
}

// ── Create / Update payloads ─────────────────────────────────────────────────

/// Metadata for a node about to be created, with or without media.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewNode {
    pub name: String,
    pub parents: Vec<String>,
    pub mime_type: Option<String>,
    pub content_checksum: Option<String>,
}

impl NewNode {
    pub fn folder(name: &str, parent_id: &str) -> Self {
        Self {
            name: name.to_string(),
            parents: vec![parent_id.to_string()],
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            content_checksum: None,
        }
    }

    pub fn file(name: &str, parent_id: &str) -> Self {
        Self {
            name: name.to_string(),
            parents: vec![parent_id.to_string()],
            mime_type: None,
            content_checksum: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: Option<String>) -> Self {
        self.mime_type = mime_type;
        self
    }

    pub fn with_checksum(mut self, checksum: Option<&str>) -> Self {
        self.content_checksum = checksum.map(|c| c.to_string());
        self
    }

    pub fn is_folder(&self) -> bool {
        self.mime_type.as_deref() == Some(FOLDER_MIME_TYPE)
    }

    /// JSON body accepted by the store's create and upload endpoints.
    pub fn metadata(&self) -> serde_json::Value {
        let mut doc = serde_json::json!({
            "name": self.name,
            "parents": self.parents,
        });
        if let Some(mime) = &self.mime_type {
            doc["mimeType"] = serde_json::Value::String(mime.clone());
        }
        if let Some(checksum) = &self.content_checksum {
            doc["properties"] = serde_json::json!({ CHECKSUM_PROPERTY: checksum });
        }
        doc
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trashed: Option<bool>,
}

impl NodePatch {
    pub fn trash() -> Self {
        Self {
            trashed: Some(true),
            ..Default::default()
        }
    }
}
