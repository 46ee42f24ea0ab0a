//! Remote entities, provenance and the records produced by rendering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an entity in the remote system.
pub type RemoteId = String;

// ============================================================================
// Remote hierarchy
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFolder {
    pub id: RemoteId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<RemoteId>,
    #[serde(default)]
    pub depth: u32,
    /// Ancestor names joined with `/`, computed remotely
    pub full_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCollection {
    pub id: RemoteId,
    pub name: String,
    #[serde(default)]
    pub folder_id: Option<RemoteId>,
    /// Folder path + `/` + name
    pub full_path: String,
    #[serde(default)]
    pub pages: Vec<RemoteId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePage {
    pub id: RemoteId,
    pub name: String,
    pub collection_id: RemoteId,
    #[serde(default)]
    pub folder_id: Option<RemoteId>,
    /// Collection path + `.` + name
    pub full_path: String,
    #[serde(default)]
    pub provenance: Option<Provenance>,
}

/// Where a remote page came from, stored alongside it remotely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Provenance {
    pub source_uuid: String,
    pub source_path: String,
    pub title: String,
    pub content_hash: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub link_manifest: Vec<LinkRecord>,
    pub unresolved_count: usize,
}

/// Address of a page for cross references.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageRef {
    pub collection_id: RemoteId,
    pub page_id: RemoteId,
}

// ============================================================================
// Local side
// ============================================================================

/// One internal reference discovered while rendering a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkRecord {
    /// Hidden marker placed on the rendered element, when the renderer emits one
    pub link_id: Option<String>,
    pub source_uuid: String,
    pub source_path: String,
    /// Display text
    pub text: String,
    pub destination_uuid: Option<String>,
    pub destination_path: Option<String>,
    /// In-page link; resolves to its own page when nothing else matches
    pub is_anchor: bool,
    pub anchor_fragment: Option<String>,
    pub resolved: bool,
}

/// A content-addressed binary queued for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Vault-relative source path
    pub local_path: String,
    pub content_hash: String,
    /// `basename_hash.ext`
    pub derived_name: String,
    /// Remote directory
    pub upload_dir: String,
}

impl AssetRecord {
    /// Remote location the asset is (or will be) served from.
    pub fn upload_path(&self) -> String {
        format!("{}/{}", self.upload_dir.trim_end_matches('/'), self.derived_name)
    }
}

/// Output of the rendering collaborator for one local document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedDocument {
    /// Vault-relative path, also the metadata-store key
    pub source_path: String,
    pub title: String,
    /// Transformed markup
    pub content: String,
    #[serde(default)]
    pub links: Vec<LinkRecord>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

// ============================================================================
// Path keys
// ============================================================================

/// Normalize a folder path: trims separators and empty segments. The root
/// sentinel normalizes to the empty string.
pub fn normalize_folder_path(path: &str) -> String {
    path.split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn collection_path(folder_path: &str, collection: &str) -> String {
    let folder = normalize_folder_path(folder_path);
    if folder.is_empty() {
        collection.to_string()
    } else {
        format!("{folder}/{collection}")
    }
}

pub fn page_path(collection_path: &str, title: &str) -> String {
    format!("{collection_path}.{title}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_keys() {
        assert_eq!(normalize_folder_path("/"), "");
        assert_eq!(normalize_folder_path("/Exports//Sessions/"), "Exports/Sessions");
        assert_eq!(collection_path("/", "Table1"), "Table1");
        assert_eq!(
            page_path(&collection_path("Exports/Sessions", "Table1"), "Session 3"),
            "Exports/Sessions/Table1.Session 3"
        );
    }

    #[test]
    fn test_provenance_wire_names() {
        let provenance = Provenance {
            source_uuid: "abc".to_string(),
            unresolved_count: 2,
            ..Default::default()
        };
        let value = serde_json::to_value(&provenance).unwrap();
        assert_eq!(value["sourceUuid"], "abc");
        assert_eq!(value["unresolvedCount"], 2);
    }
}
