#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("No node found for {0}")]
    NotFound(String),
    #[error("Path {path} matches {count} nodes, expected exactly one")]
    AmbiguousPath { path: String, count: usize },
    #[error("Path {path} exists but is not a {expected}")]
    PathConflict { path: String, expected: &'static str },
    #[error("{path} already exists (id {id}) and duplicates are not allowed")]
    Duplicate { path: String, id: String },
    #[error("Parent chain of {id} revisits {repeated}")]
    CycleDetected { id: String, repeated: String },
    #[error("The root folder is read-only")]
    RootIsReadOnly,
    #[error("Invalid path pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Store returned HTTP {status} for {subject}: {message}")]
    Api {
        status: u16,
        subject: String,
        message: String,
    },
    #[error("Archive tool failed for {path}: {message}")]
    Archive { path: String, message: String },
    #[error("Download of {id} to {path} failed: {message}")]
    Download {
        id: String,
        path: String,
        message: String,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl DriveError {
    pub fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        DriveError::Io {
            path: path.to_string(),
            source,
        }
    }

    /// A failed call to the remote store, either at the HTTP layer or as an
    /// error status returned by the API.
    pub fn is_transport(&self) -> bool {
        matches!(self, DriveError::Http(_) | DriveError::Api { .. })
    }

    /// Errors that make the remote target unsafe to write to. A backup run
    /// stops at the first of these instead of moving on to the next directory.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            DriveError::AmbiguousPath { .. }
                | DriveError::PathConflict { .. }
                | DriveError::CycleDetected { .. }
        )
    }
}
