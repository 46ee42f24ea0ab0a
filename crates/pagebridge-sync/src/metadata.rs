//! Per-document key-value metadata, owned by the local side.

use crate::error::MetadataError;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const FOLDER_FIELD: &str = "pagebridge-folder";
pub const COLLECTION_FIELD: &str = "pagebridge-collection";
pub const FOLDER_ID_FIELD: &str = "pagebridge-folder-id";
pub const COLLECTION_ID_FIELD: &str = "pagebridge-collection-id";
pub const PAGE_ID_FIELD: &str = "pagebridge-page-id";

/// Read/write access to document metadata.
///
/// Documents are keyed by their vault-relative path.
pub trait MetadataStore: Send + Sync {
    fn documents(&self) -> Vec<String>;

    fn get(&self, document: &str, field: &str) -> Option<Value>;

    fn set(&self, document: &str, field: &str, value: Value) -> Result<(), MetadataError>;

    /// String value of a field; empty strings count as unset.
    fn get_str(&self, document: &str, field: &str) -> Option<String> {
        match self.get(document, field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }
}

/// Metadata held in memory, loadable from and savable to a JSON object of
/// `{ "<document path>": { "<field>": <value> } }`.
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    documents: RwLock<BTreeMap<String, Map<String, Value>>>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(documents: BTreeMap<String, Map<String, Value>>) -> Self {
        Self {
            documents: RwLock::new(documents),
        }
    }

    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let contents = std::fs::read_to_string(path)?;
        let documents = serde_json::from_str(&contents)?;
        Ok(Self::from_map(documents))
    }

    pub fn save(&self, path: &Path) -> Result<(), MetadataError> {
        let contents = serde_json::to_string_pretty(&*self.documents.read())?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Register a document with no fields.
    pub fn add_document(&self, document: &str) {
        self.documents
            .write()
            .entry(document.to_string())
            .or_default();
    }

    pub fn snapshot(&self) -> BTreeMap<String, Map<String, Value>> {
        self.documents.read().clone()
    }
}

impl MetadataStore for InMemoryMetadata {
    fn documents(&self) -> Vec<String> {
        self.documents.read().keys().cloned().collect()
    }

    fn get(&self, document: &str, field: &str) -> Option<Value> {
        self.documents.read().get(document)?.get(field).cloned()
    }

    fn set(&self, document: &str, field: &str, value: Value) -> Result<(), MetadataError> {
        let mut documents = self.documents.write();
        let fields = documents
            .get_mut(document)
            .ok_or_else(|| MetadataError::UnknownDocument(document.to_string()))?;
        fields.insert(field.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_and_load_round_trip_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        let store = InMemoryMetadata::new();
        store.add_document("notes/a.md");
        store.set("notes/a.md", PAGE_ID_FIELD, json!("P1")).unwrap();
        store.save(&path).unwrap();

        let loaded = InMemoryMetadata::load(&path).unwrap();
        assert_eq!(loaded.get_str("notes/a.md", PAGE_ID_FIELD).as_deref(), Some("P1"));
        assert_eq!(loaded.documents(), vec!["notes/a.md".to_string()]);
    }

    #[test]
    fn test_unknown_document_is_an_error() {
        let store = InMemoryMetadata::new();
        assert!(matches!(
            store.set("missing.md", PAGE_ID_FIELD, json!("P1")),
            Err(MetadataError::UnknownDocument(_))
        ));
    }

    #[test]
    fn test_blank_string_counts_as_unset() {
        let store = InMemoryMetadata::new();
        store.add_document("a.md");
        store.set("a.md", FOLDER_FIELD, json!("  ")).unwrap();
        assert!(store.get_str("a.md", FOLDER_FIELD).is_none());
    }
}
