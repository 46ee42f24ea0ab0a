//! Error taxonomy
//!
//! One enum per failure class:
//!
//! - [`SessionError`]: session setup. Fatal, nothing is synced.
//! - [`RemoteError`]: a single remote call. Callers that can degrade swallow it
//!   into an empty result; the rest wrap it.
//! - [`UpsertError`]: aborts the current document only.
//! - [`AssetError`]: logged and reported, never propagated out of a batch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("remote returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected result shape from `{script}`: {message}")]
    Schema { script: String, message: String },
    #[error("remote rejected the call: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn schema(script: impl Into<String>, message: impl ToString) -> Self {
        Self::Schema {
            script: script.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("missing setting `{0}`")]
    MissingSetting(&'static str),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("relay unreachable: {0}")]
    Unreachable(#[source] RemoteError),
    #[error("no active remote session with id `{0}`")]
    NoActiveSession(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Stage of the upsert state machine at which a document failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStage {
    Folder,
    Collection,
    Page,
    WriteBack,
}

impl std::fmt::Display for UpsertStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpsertStage::Folder => "folder",
            UpsertStage::Collection => "collection",
            UpsertStage::Page => "page",
            UpsertStage::WriteBack => "write-back",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("{stage} stage failed: {source}")]
    Remote {
        stage: UpsertStage,
        #[source]
        source: RemoteError,
    },
    #[error("created page `{title}` not found in collection `{collection_id}`")]
    CreatedPageMissing {
        title: String,
        collection_id: String,
    },
    #[error("metadata: {0}")]
    Metadata(#[from] MetadataError),
}

impl UpsertError {
    pub fn at(stage: UpsertStage) -> impl FnOnce(RemoteError) -> Self {
        move |source| Self::Remote { stage, source }
    }

    pub fn stage(&self) -> UpsertStage {
        match self {
            UpsertError::Remote { stage, .. } => *stage,
            UpsertError::CreatedPageMissing { .. } => UpsertStage::Page,
            UpsertError::Metadata(_) => UpsertStage::WriteBack,
        }
    }
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset `{0}` not found in vault")]
    NotFound(String),
    #[error("upload of `{path}` failed: {source}")]
    Upload {
        path: String,
        #[source]
        source: RemoteError,
    },
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("unknown document `{0}`")]
    UnknownDocument(String),
    #[error("metadata io: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
