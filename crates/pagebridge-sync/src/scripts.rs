//! Versioned remote script assets and their result schemas.
//!
//! Arguments reach a script as a single `ARGS` JSON constant prepended to the
//! body; nothing is spliced into the code itself. Results are decoded into the
//! typed rows below, so a remote returning the wrong shape is reported as
//! [`RemoteError::Schema`] instead of being trusted.

use crate::error::RemoteError;
use crate::model::{Provenance, RemoteFolder, RemoteId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Flag scope under which provenance is stored on remote pages.
pub const FLAG_SCOPE: &str = "pagebridge";

#[derive(Debug)]
pub struct ScriptAsset {
    pub name: &'static str,
    pub version: u32,
    pub source: &'static str,
}

impl ScriptAsset {
    /// Script text sent to the remote.
    pub fn render(&self, args: &Value) -> String {
        format!(
            "// pagebridge:{} v{}\nconst ARGS = {};\n{}",
            self.name, self.version, args, self.source
        )
    }

    /// Decode a result into its schema.
    pub fn decode<T: DeserializeOwned>(&self, value: Value) -> Result<T, RemoteError> {
        serde_json::from_value(value).map_err(|e| RemoteError::schema(self.name, e))
    }
}

pub static LIST_FOLDERS: ScriptAsset = ScriptAsset {
    name: "list_folders",
    version: 1,
    source: include_str!("../scripts/list_folders.js"),
};

pub static LIST_COLLECTIONS: ScriptAsset = ScriptAsset {
    name: "list_collections",
    version: 1,
    source: include_str!("../scripts/list_collections.js"),
};

pub static UPSERT_PAGE: ScriptAsset = ScriptAsset {
    name: "upsert_page",
    version: 1,
    source: include_str!("../scripts/upsert_page.js"),
};

pub static SCAN_PAGES: ScriptAsset = ScriptAsset {
    name: "scan_pages",
    version: 1,
    source: include_str!("../scripts/scan_pages.js"),
};

// ============================================================================
// Result schemas
// ============================================================================

pub type FolderRows = Vec<RemoteFolder>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRow {
    pub id: RemoteId,
    pub name: String,
    #[serde(default)]
    pub folder_id: Option<RemoteId>,
    pub full_path: String,
    #[serde(default)]
    pub pages: Vec<PageRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageRow {
    pub id: RemoteId,
    pub name: String,
    #[serde(default)]
    pub provenance: Option<Provenance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertPageResult {
    #[serde(default)]
    pub page_id: Option<RemoteId>,
    pub pages: Vec<PageSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageSummary {
    pub id: RemoteId,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedPage {
    pub id: RemoteId,
    pub name: String,
    pub collection_id: RemoteId,
    #[serde(default)]
    pub provenance: Option<Provenance>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Entity returned by the structured create endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedEntity {
    #[serde(alias = "_id")]
    pub id: RemoteId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_injects_args_as_constant() {
        let text = UPSERT_PAGE.render(&json!({ "title": "Quote \" and `tick`" }));
        assert!(text.starts_with("// pagebridge:upsert_page v1\n"));
        assert!(text.contains(r#"const ARGS = {"title":"Quote \" and `tick`"};"#));
        assert!(text.contains("createEmbeddedDocuments"));
    }

    #[test]
    fn test_wrong_shape_is_schema_error() {
        let err = LIST_FOLDERS
            .decode::<FolderRows>(json!({ "folders": [] }))
            .unwrap_err();
        assert!(matches!(err, RemoteError::Schema { ref script, .. } if script == "list_folders"));
    }

    #[test]
    fn test_created_entity_accepts_underscore_id() {
        let entity: CreatedEntity = serde_json::from_value(json!({ "_id": "F1" })).unwrap();
        assert_eq!(entity.id, "F1");
    }
}
