//! In-memory store and archiver fakes shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::io::AsyncWriteExt;

use driveback_common::archiver::Archiver;
use driveback_common::node::{NewNode, Node, NodePatch, FOLDER_MIME_TYPE};
use driveback_common::query::Query;
use driveback_common::store::{NodeStore, ProgressFn, TransferProgress};
use driveback_common::DriveError;

struct State {
    root: Node,
    nodes: Vec<Node>,
    content: HashMap<String, Vec<u8>>,
    next_id: usize,
    clock: DateTime<Utc>,
    fail_uploads: bool,
    fail_downloads: bool,
    fail_deletes: bool,
    deleted: Vec<String>,
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += Duration::minutes(1);
        self.clock
    }

    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("n{}", self.next_id)
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut Node, DriveError> {
        self.nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| DriveError::NotFound(id.to_string()))
    }
}

/// A store keeping nodes in insertion order, with a clock that advances one
/// minute on every write.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub const ROOT_ID: &'static str = "root";

    pub fn new() -> Self {
        let clock = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let root = Node {
            id: Self::ROOT_ID.to_string(),
            name: "My Drive".to_string(),
            mime_type: FOLDER_MIME_TYPE.to_string(),
            parents: Vec::new(),
            size: None,
            modified_time: clock,
            trashed: false,
            content_checksum: None,
            properties: BTreeMap::new(),
        };
        Self {
            state: Arc::new(Mutex::new(State {
                root,
                nodes: Vec::new(),
                content: HashMap::new(),
                next_id: 0,
                clock,
                fail_uploads: false,
                fail_downloads: false,
                fail_deletes: false,
                deleted: Vec::new(),
            })),
        }
    }

    fn push(&self, id: Option<&str>, name: &str, mime: &str, parents: &[&str], checksum: Option<&str>) -> String {
        let mut state = self.state.lock().unwrap();
        let id = match id {
            Some(id) => id.to_string(),
            None => state.fresh_id(),
        };
        let modified_time = state.tick();
        state.nodes.push(Node {
            id: id.clone(),
            name: name.to_string(),
            mime_type: mime.to_string(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            size: None,
            modified_time,
            trashed: false,
            content_checksum: checksum.map(|c| c.to_string()),
            properties: BTreeMap::new(),
        });
        id
    }

    pub fn add_folder(&self, parent: &str, name: &str) -> String {
        self.push(None, name, FOLDER_MIME_TYPE, &[parent], None)
    }

    pub fn add_node(&self, name: &str, parents: &[&str], checksum: Option<&str>) -> String {
        self.push(None, name, "application/gzip", parents, checksum)
    }

    /// Folder with a caller-chosen id, for building broken parent chains.
    pub fn insert_raw(&self, id: &str, name: &str, parents: &[&str]) {
        self.push(Some(id), name, FOLDER_MIME_TYPE, parents, None);
    }

    pub fn set_trashed(&self, id: &str, trashed: bool) {
        let mut state = self.state.lock().unwrap();
        state.find_mut(id).unwrap().trashed = trashed;
    }

    pub fn set_content(&self, id: &str, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.find_mut(id).unwrap().size = Some(bytes.len() as u64);
        state.content.insert(id.to_string(), bytes.to_vec());
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.state.lock().unwrap().fail_uploads = fail;
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.state.lock().unwrap().fail_downloads = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }

    pub fn set_modified_time(&self, id: &str, modified_time: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.find_mut(id).unwrap().modified_time = modified_time;
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        let state = self.state.lock().unwrap();
        state.nodes.iter().find(|n| n.id == id).cloned()
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().content.get(id).cloned()
    }

    /// Non-trashed nodes directly under `parent`, in insertion order.
    pub fn children(&self, parent: &str) -> Vec<Node> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .iter()
            .filter(|n| !n.trashed && n.parents.iter().any(|p| p == parent))
            .cloned()
            .collect()
    }

    /// Ids removed through hard deletes, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait::async_trait]
impl NodeStore for MemoryStore {
    async fn root_id(&self) -> Result<String, DriveError> {
        Ok(Self::ROOT_ID.to_string())
    }

    async fn get(&self, id: &str) -> Result<Node, DriveError> {
        let state = self.state.lock().unwrap();
        if id == state.root.id {
            return Ok(state.root.clone());
        }
        state
            .nodes
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| DriveError::NotFound(id.to_string()))
    }

    async fn list(&self, query: &Query) -> Result<Vec<Node>, DriveError> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for node in &state.nodes {
            match query.matches(node) {
                Some(true) => out.push(node.clone()),
                Some(false) => {}
                None => {
                    return Err(DriveError::Api {
                        status: 400,
                        subject: "query".to_string(),
                        message: "raw queries are not supported".to_string(),
                    })
                }
            }
        }
        Ok(out)
    }

    async fn create(&self, metadata: &NewNode) -> Result<Node, DriveError> {
        let parents: Vec<&str> = metadata.parents.iter().map(String::as_str).collect();
        let mime = metadata.mime_type.as_deref().unwrap_or("application/octet-stream");
        let id = self.push(None, &metadata.name, mime, &parents, metadata.content_checksum.as_deref());
        self.get(&id).await
    }

    async fn update(&self, id: &str, patch: &NodePatch) -> Result<Node, DriveError> {
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        let node = state.find_mut(id)?;
        if let Some(name) = &patch.name {
            node.name = name.clone();
        }
        if let Some(trashed) = patch.trashed {
            node.trashed = trashed;
        }
        node.modified_time = now;
        Ok(node.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), DriveError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_deletes {
            return Err(DriveError::Api {
                status: 503,
                subject: id.to_string(),
                message: "backend error".to_string(),
            });
        }
        let before = state.nodes.len();
        state.nodes.retain(|n| n.id != id);
        if state.nodes.len() == before {
            return Err(DriveError::NotFound(id.to_string()));
        }
        state.content.remove(id);
        state.deleted.push(id.to_string());
        Ok(())
    }

    async fn upload_media(
        &self,
        metadata: &NewNode,
        source: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<Node, DriveError> {
        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| DriveError::io(source.display(), e))?;
        let fail = self.state.lock().unwrap().fail_uploads;
        if fail {
            return Err(DriveError::Api {
                status: 500,
                subject: metadata.name.clone(),
                message: "upload rejected".to_string(),
            });
        }
        let total = bytes.len() as u64;
        let node = self.create(metadata).await?;
        self.set_content(&node.id, &bytes);
        progress(TransferProgress { transferred: total, total: Some(total) });
        self.get(&node.id).await
    }

    async fn download_media(
        &self,
        id: &str,
        dest: &mut tokio::fs::File,
        progress: ProgressFn<'_>,
    ) -> Result<u64, DriveError> {
        let (bytes, fail) = {
            let state = self.state.lock().unwrap();
            let bytes = state
                .content
                .get(id)
                .cloned()
                .ok_or_else(|| DriveError::NotFound(id.to_string()))?;
            (bytes, state.fail_downloads)
        };
        let total = bytes.len() as u64;
        if fail {
            let half = &bytes[..bytes.len() / 2];
            dest.write_all(half).await.map_err(|e| DriveError::io(id, e))?;
            return Err(DriveError::Api {
                status: 503,
                subject: id.to_string(),
                message: "connection reset".to_string(),
            });
        }
        dest.write_all(&bytes).await.map_err(|e| DriveError::io(id, e))?;
        dest.flush().await.map_err(|e| DriveError::io(id, e))?;
        progress(TransferProgress { transferred: total, total: Some(total) });
        Ok(total)
    }
}

/// Archiver returning a fixed checksum and writing a small placeholder
/// archive.
pub struct FakeArchiver {
    checksum: Mutex<String>,
    archive_failures: AtomicUsize,
    archived: AtomicUsize,
    broken: Mutex<Vec<PathBuf>>,
}

impl FakeArchiver {
    pub fn new(checksum: &str) -> Self {
        Self {
            checksum: Mutex::new(checksum.to_string()),
            archive_failures: AtomicUsize::new(0),
            archived: AtomicUsize::new(0),
            broken: Mutex::new(Vec::new()),
        }
    }

    pub fn set_checksum(&self, checksum: &str) {
        *self.checksum.lock().unwrap() = checksum.to_string();
    }

    /// Fail the next `n` archive attempts.
    pub fn fail_archives(&self, n: usize) {
        self.archive_failures.store(n, Ordering::SeqCst);
    }

    /// Make every operation on `directory` fail.
    pub fn break_directory(&self, directory: &Path) {
        self.broken.lock().unwrap().push(directory.to_path_buf());
    }

    pub fn archived(&self) -> usize {
        self.archived.load(Ordering::SeqCst)
    }

    fn check_broken(&self, directory: &Path) -> Result<(), DriveError> {
        if self.broken.lock().unwrap().iter().any(|d| d == directory) {
            return Err(DriveError::Archive {
                path: directory.display().to_string(),
                message: "unreadable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Archiver for FakeArchiver {
    async fn checksum(&self, directory: &Path, _excludes: &[PathBuf]) -> Result<String, DriveError> {
        self.check_broken(directory)?;
        Ok(self.checksum.lock().unwrap().clone())
    }

    async fn archive(
        &self,
        directory: &Path,
        _excludes: &[PathBuf],
        dest: &Path,
    ) -> Result<(), DriveError> {
        self.check_broken(directory)?;
        let remaining = self.archive_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.archive_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DriveError::Archive {
                path: directory.display().to_string(),
                message: "file changed as we read it".to_string(),
            });
        }
        tokio::fs::write(dest, format!("archive of {}", directory.display()))
            .await
            .map_err(|e| DriveError::io(dest.display(), e))?;
        self.archived.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
