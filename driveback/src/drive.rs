//! Google Drive v3 REST client.
//!
//! Implements [`NodeStore`] over plain `reqwest` calls. Authentication is a
//! bearer token obtained elsewhere; refreshing it is not handled here.

use std::path::Path;

use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, LOCATION};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use driveback_common::node::{NewNode, Node, NodePatch};
use driveback_common::query::Query;
use driveback_common::store::{NodeStore, ProgressFn, TransferProgress};
use driveback_common::DriveError;

pub const DEFAULT_API_URL: &str = "https://www.googleapis.com/drive/v3";
pub const DEFAULT_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3";

const NODE_FIELDS: &str = "id,name,mimeType,parents,size,modifiedTime,trashed,properties";
const LIST_FIELDS: &str =
    "nextPageToken,files(id,name,mimeType,parents,size,modifiedTime,trashed,properties)";
const PAGE_SIZE: &str = "1000";

/// Resumable upload chunks must be a multiple of 256 KiB.
const UPLOAD_CHUNK_SIZE: usize = 20 * 256 * 1024;

#[derive(Clone)]
pub struct DriveClient {
    client: Client,
    api_url: String,
    upload_url: String,
    token: String,
    chunk_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<Node>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl DriveClient {
    pub fn new(api_url: &str, upload_url: &str, token: &str) -> Self {
        Self {
            client: Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("Failed to build HTTP client"),
            api_url: api_url.trim_end_matches('/').to_string(),
            upload_url: upload_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chunk_size: UPLOAD_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn files_url(&self) -> String {
        format!("{}/files", self.api_url)
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_url, urlencoding::encode(id))
    }

    /// Put one chunk of a resumable upload. `None` means the store wants more.
    async fn put_chunk(
        &self,
        session_uri: &str,
        range: String,
        body: Vec<u8>,
        subject: &str,
    ) -> Result<Option<Node>, DriveError> {
        let resp = self
            .client
            .put(session_uri)
            .bearer_auth(&self.token)
            .header(CONTENT_RANGE, range)
            .body(body)
            .send()
            .await?;

        match resp.status().as_u16() {
            308 => Ok(None),
            200 | 201 => Ok(Some(resp.json().await?)),
            _ => Err(api_error(resp, subject).await),
        }
    }
}

async fn api_error(resp: Response, subject: &str) -> DriveError {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return DriveError::NotFound(subject.to_string());
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    DriveError::Api {
        status: status.as_u16(),
        subject: subject.to_string(),
        message,
    }
}

async fn checked(resp: Response, subject: &str) -> Result<Response, DriveError> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(api_error(resp, subject).await)
    }
}

/// Fill `buf` from `file`, short only at end of file.
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[async_trait]
impl NodeStore for DriveClient {
    async fn root_id(&self) -> Result<String, DriveError> {
        let resp = self
            .client
            .get(self.file_url("root"))
            .query(&[("fields", "id")])
            .bearer_auth(&self.token)
            .send()
            .await?;
        let root: IdOnly = checked(resp, "root").await?.json().await?;
        Ok(root.id)
    }

    async fn get(&self, id: &str) -> Result<Node, DriveError> {
        let resp = self
            .client
            .get(self.file_url(id))
            .query(&[("fields", NODE_FIELDS)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(checked(resp, id).await?.json().await?)
    }

    async fn list(&self, query: &Query) -> Result<Vec<Node>, DriveError> {
        let q = query.to_string();
        let mut nodes = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .get(self.files_url())
                .bearer_auth(&self.token);
            if !query.is_empty() {
                req = req.query(&[("q", q.as_str())]);
            }
            req = req.query(&[("fields", LIST_FIELDS), ("pageSize", PAGE_SIZE)]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }

            let page: FileList = checked(req.send().await?, &q).await?.json().await?;
            debug!(query = %q, count = page.files.len(), "Fetched file list page");
            nodes.extend(page.files);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(nodes)
    }

    async fn create(&self, metadata: &NewNode) -> Result<Node, DriveError> {
        let resp = self
            .client
            .post(self.files_url())
            .query(&[("fields", NODE_FIELDS)])
            .bearer_auth(&self.token)
            .json(&metadata.metadata())
            .send()
            .await?;
        Ok(checked(resp, &metadata.name).await?.json().await?)
    }

    async fn update(&self, id: &str, patch: &NodePatch) -> Result<Node, DriveError> {
        let resp = self
            .client
            .patch(self.file_url(id))
            .query(&[("fields", NODE_FIELDS)])
            .bearer_auth(&self.token)
            .json(patch)
            .send()
            .await?;
        Ok(checked(resp, id).await?.json().await?)
    }

    async fn delete(&self, id: &str) -> Result<(), DriveError> {
        let resp = self
            .client
            .delete(self.file_url(id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        checked(resp, id).await?;
        Ok(())
    }

    async fn upload_media(
        &self,
        metadata: &NewNode,
        source: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<Node, DriveError> {
        let total = tokio::fs::metadata(source)
            .await
            .map_err(|e| DriveError::io(source.display(), e))?
            .len();

        let resp = self
            .client
            .post(format!("{}/files", self.upload_url))
            .query(&[("uploadType", "resumable"), ("fields", NODE_FIELDS)])
            .bearer_auth(&self.token)
            .header("X-Upload-Content-Length", total.to_string())
            .json(&metadata.metadata())
            .send()
            .await?;
        let resp = checked(resp, &metadata.name).await?;
        let status = resp.status().as_u16();
        let session_uri = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| DriveError::Api {
                status,
                subject: metadata.name.clone(),
                message: "resumable upload session has no Location header".to_string(),
            })?;
        debug!(name = %metadata.name, total, "Resumable upload session opened");

        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(|e| DriveError::io(source.display(), e))?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut offset = 0u64;

        loop {
            let n = read_chunk(&mut file, &mut buf)
                .await
                .map_err(|e| DriveError::io(source.display(), e))?;
            let range = if n == 0 {
                format!("bytes */{}", total)
            } else {
                format!("bytes {}-{}/{}", offset, offset + n as u64 - 1, total)
            };

            let done = self
                .put_chunk(&session_uri, range, buf[..n].to_vec(), &metadata.name)
                .await?;
            offset += n as u64;
            progress(TransferProgress {
                transferred: offset,
                total: Some(total),
            });

            match done {
                Some(node) => return Ok(node),
                None if n == 0 => {
                    return Err(DriveError::Api {
                        status: 308,
                        subject: metadata.name.clone(),
                        message: format!(
                            "store expects more data but {} ended after {} bytes",
                            source.display(),
                            offset
                        ),
                    })
                }
                None => continue,
            }
        }
    }

    async fn download_media(
        &self,
        id: &str,
        dest: &mut tokio::fs::File,
        progress: ProgressFn<'_>,
    ) -> Result<u64, DriveError> {
        let resp = self
            .client
            .get(self.file_url(id))
            .query(&[("alt", "media")])
            .bearer_auth(&self.token)
            .send()
            .await?;
        let mut resp = checked(resp, id).await?;
        let total = resp.content_length();

        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            dest.write_all(&chunk)
                .await
                .map_err(|e| DriveError::io(format!("local copy of {}", id), e))?;
            written += chunk.len() as u64;
            progress(TransferProgress {
                transferred: written,
                total,
            });
        }
        dest.flush()
            .await
            .map_err(|e| DriveError::io(format!("local copy of {}", id), e))?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const FOLDER_JSON: &str = r#"{"id":"f1","name":"Backup","mimeType":"application/vnd.google-apps.folder","parents":["r0"],"modifiedTime":"2024-01-01T00:00:00Z"}"#;

    fn client(server: &mockito::Server) -> DriveClient {
        DriveClient::new(&server.url(), &format!("{}/upload", server.url()), "token-1")
    }

    #[tokio::test]
    async fn test_get_maps_404_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/files/missing")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer token-1")
            .with_status(404)
            .with_body(r#"{"error":{"code":404,"message":"File not found: missing."}}"#)
            .create_async()
            .await;

        let err = client(&server).get("missing").await.unwrap_err();
        assert!(matches!(err, DriveError::NotFound(ref id) if id == "missing"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_api_error_message_is_extracted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/files/f1")
            .with_status(403)
            .with_body(r#"{"error":{"code":403,"message":"Insufficient permissions"}}"#)
            .create_async()
            .await;

        let err = client(&server).delete("f1").await.unwrap_err();
        match err {
            DriveError::Api { status, message, .. } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Insufficient permissions");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_follows_page_tokens() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/files")
            .match_query(Matcher::Regex("pageSize=1000$".to_string()))
            .with_status(200)
            .with_body(format!(r#"{{"files":[{}],"nextPageToken":"p2"}}"#, FOLDER_JSON))
            .create_async()
            .await;
        let second = server
            .mock("GET", "/files")
            .match_query(Matcher::Regex("pageToken=p2$".to_string()))
            .with_status(200)
            .with_body(r#"{"files":[{"id":"a1","name":"a.tgz","mimeType":"application/gzip","parents":["f1"],"size":"3","modifiedTime":"2024-01-02T00:00:00Z"}]}"#)
            .create_async()
            .await;

        let query = Query::new().name_contains("a").trashed(false);
        let nodes = client(&server).list(&query).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].is_folder());
        assert_eq!(nodes[1].size, Some(3));
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_sends_rendered_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/files")
            .match_query(Matcher::UrlEncoded(
                "q".to_string(),
                "name = 'it\\'s' and trashed = false".to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"files":[]}"#)
            .create_async()
            .await;

        let query = Query::new().name_equals("it's").excluding_trashed();
        let nodes = client(&server).list(&query).await.unwrap();
        assert!(nodes.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_resumable_upload_in_chunks() {
        let mut server = mockito::Server::new_async().await;
        let session_uri = format!("{}/session/1", server.url());
        let init = server
            .mock("POST", "/upload/files")
            .match_query(Matcher::UrlEncoded("uploadType".to_string(), "resumable".to_string()))
            .match_header("x-upload-content-length", "6")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "name": "a.tgz",
                "parents": ["f1"],
                "properties": { "checksum": "abc  -" }
            })))
            .with_status(200)
            .with_header("location", &session_uri)
            .create_async()
            .await;
        let first = server
            .mock("PUT", "/session/1")
            .match_header("content-range", "bytes 0-3/6")
            .with_status(308)
            .create_async()
            .await;
        let last = server
            .mock("PUT", "/session/1")
            .match_header("content-range", "bytes 4-5/6")
            .with_status(200)
            .with_body(r#"{"id":"a1","name":"a.tgz","mimeType":"application/gzip","parents":["f1"],"size":"6","modifiedTime":"2024-01-02T00:00:00Z","properties":{"checksum":"abc  -"}}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.tgz");
        std::fs::write(&source, b"abcdef").unwrap();

        let mut seen = Vec::new();
        let mut progress = |p: TransferProgress| seen.push(p.transferred);
        let metadata = NewNode::file("a.tgz", "f1").with_checksum(Some("abc  -"));
        let node = client(&server)
            .with_chunk_size(4)
            .upload_media(&metadata, &source, &mut progress)
            .await
            .unwrap();

        assert_eq!(node.id, "a1");
        assert_eq!(node.content_checksum.as_deref(), Some("abc  -"));
        assert_eq!(seen, vec![4, 6]);
        init.assert_async().await;
        first.assert_async().await;
        last.assert_async().await;
    }

    #[tokio::test]
    async fn test_download_streams_into_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/files/a1")
            .match_query(Matcher::UrlEncoded("alt".to_string(), "media".to_string()))
            .with_status(200)
            .with_body("archive-bytes")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tgz");
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        let mut last = None;
        let mut progress = |p: TransferProgress| last = Some(p);
        let written = client(&server)
            .download_media("a1", &mut file, &mut progress)
            .await
            .unwrap();
        drop(file);

        assert_eq!(written, 13);
        assert_eq!(std::fs::read(&path).unwrap(), b"archive-bytes");
        assert_eq!(last.and_then(|p| p.percent()), Some(100));
    }
}
