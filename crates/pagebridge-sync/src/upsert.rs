//! Upsert Orchestrator
//!
//! Places one rendered document in the remote hierarchy:
//!
//! ```text
//! START ──known page id in cache──────────────────────────────► UPDATE
//!   │
//!   └─► folder chain ─► collection ─► page path in cache? ─yes─► UPDATE
//!                                                 │
//!                                                 └──no──────► CREATE
//! ```
//!
//! Exactly one page write is issued per document. Folders and collections
//! created on the way are not rolled back if a later step fails; a retry finds
//! them in the cache and moves on.

use crate::assets::content_hash;
use crate::config::SyncConfig;
use crate::error::{MetadataError, RemoteError, UpsertError, UpsertStage};
use crate::metadata::{
    MetadataStore, COLLECTION_FIELD, COLLECTION_ID_FIELD, FOLDER_FIELD, FOLDER_ID_FIELD,
    PAGE_ID_FIELD,
};
use crate::model::{
    collection_path, normalize_folder_path, page_path, Provenance, RemoteId, RenderedDocument,
};
use crate::remote::{PageWrite, RemoteStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertStatus {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub source_path: String,
    pub status: UpsertStatus,
    pub folder_id: Option<RemoteId>,
    pub collection_id: RemoteId,
    pub page_id: RemoteId,
    /// Folders created while resolving the chain, outermost first
    pub created_folders: Vec<RemoteId>,
    pub created_collection: bool,
}

/// Where a document should live remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Normalized folder path; empty for the root
    pub folder_path: String,
    pub collection: String,
}

impl Destination {
    /// Metadata overrides first, then the session defaults. The collection
    /// falls back to the document title.
    pub fn for_document(
        config: &SyncConfig,
        metadata: &dyn MetadataStore,
        document: &RenderedDocument,
    ) -> Self {
        let folder = metadata
            .get_str(&document.source_path, FOLDER_FIELD)
            .unwrap_or_else(|| config.folder.clone());
        let collection = metadata
            .get_str(&document.source_path, COLLECTION_FIELD)
            .or_else(|| config.collection.clone())
            .unwrap_or_else(|| document.title.clone());
        Self {
            folder_path: normalize_folder_path(&folder),
            collection,
        }
    }
}

pub struct UpsertRequest<'a> {
    pub document: &'a RenderedDocument,
    pub identity: &'a str,
    /// Markup to store, after asset rewriting
    pub content: &'a str,
    pub destination: Destination,
    /// Destination page id already recorded on the document
    pub known_page_id: Option<String>,
}

/// Resolved target before the page write.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Plan {
    Update {
        folder_id: Option<RemoteId>,
        collection_id: RemoteId,
        page_id: RemoteId,
    },
    Create {
        folder_id: Option<RemoteId>,
        collection_id: RemoteId,
    },
}

pub async fn upsert(
    store: &mut RemoteStore,
    request: UpsertRequest<'_>,
) -> Result<UpsertOutcome, UpsertError> {
    let document = request.document;
    let mut created_folders = Vec::new();
    let mut created_collection = false;

    let known = request
        .known_page_id
        .as_deref()
        .and_then(|id| store.cache().page(id))
        .map(|page| Plan::Update {
            folder_id: page.folder_id.clone(),
            collection_id: page.collection_id.clone(),
            page_id: page.id.clone(),
        });
    let plan = match known {
        Some(plan) => {
            debug!(document = %document.source_path, "known destination page");
            plan
        }
        None => {
            let destination = &request.destination;
            let folder_id =
                ensure_folder_chain(store, &destination.folder_path, &mut created_folders)
                    .await
                    .map_err(UpsertError::at(UpsertStage::Folder))?;

            let collection_key = collection_path(&destination.folder_path, &destination.collection);
            let existing = store
                .cache()
                .collection_by_path(&collection_key)
                .map(|c| c.id.clone());
            let collection_id = match existing {
                Some(id) => id,
                None => {
                    created_collection = true;
                    store
                        .create_collection(&destination.collection, folder_id.as_deref())
                        .await
                        .map_err(UpsertError::at(UpsertStage::Collection))?
                        .id
                }
            };

            let page_key = page_path(&collection_key, &document.title);
            match store.cache().page_by_path(&page_key) {
                Some(page) => Plan::Update {
                    folder_id,
                    collection_id,
                    page_id: page.id.clone(),
                },
                None => Plan::Create {
                    folder_id,
                    collection_id,
                },
            }
        }
    };

    let provenance = build_provenance(document, request.identity, request.content);
    let (folder_id, collection_id, page_id, status) = match plan {
        Plan::Update {
            folder_id,
            collection_id,
            page_id,
        } => (folder_id, collection_id, Some(page_id), UpsertStatus::Updated),
        Plan::Create {
            folder_id,
            collection_id,
        } => (folder_id, collection_id, None, UpsertStatus::Created),
    };

    let page = store
        .write_page(PageWrite {
            collection_id: &collection_id,
            page_id: page_id.as_deref(),
            title: &document.title,
            content: request.content,
            provenance: &provenance,
        })
        .await?;

    info!(
        document = %document.source_path,
        page = %page.id,
        status = ?status,
        "document upserted"
    );
    Ok(UpsertOutcome {
        source_path: document.source_path.clone(),
        status,
        folder_id,
        collection_id,
        page_id: page.id,
        created_folders,
        created_collection,
    })
}

/// Make sure every segment of `path` exists, creating only the missing tail.
/// Returns the deepest folder id, or `None` for the root.
pub async fn ensure_folder_chain(
    store: &mut RemoteStore,
    path: &str,
    created: &mut Vec<RemoteId>,
) -> Result<Option<RemoteId>, RemoteError> {
    let normalized = normalize_folder_path(path);
    if normalized.is_empty() {
        return Ok(None);
    }
    let segments: Vec<&str> = normalized.split('/').collect();

    let mut existing = 0;
    let mut parent: Option<RemoteId> = None;
    for len in (1..=segments.len()).rev() {
        if let Some(folder) = store.cache().folder_by_path(&segments[..len].join("/")) {
            existing = len;
            parent = Some(folder.id.clone());
            break;
        }
    }

    for segment in &segments[existing..] {
        let folder = store.create_folder(segment, parent.as_deref()).await?;
        created.push(folder.id.clone());
        parent = Some(folder.id);
    }
    Ok(parent)
}

pub fn build_provenance(document: &RenderedDocument, identity: &str, content: &str) -> Provenance {
    let link_manifest: Vec<_> = document
        .links
        .iter()
        .cloned()
        .map(|mut link| {
            link.source_uuid = identity.to_string();
            link.source_path = document.source_path.clone();
            link.resolved = false;
            link
        })
        .collect();
    Provenance {
        source_uuid: identity.to_string(),
        source_path: document.source_path.clone(),
        title: document.title.clone(),
        content_hash: content_hash(content.as_bytes()),
        created: document.created,
        modified: document.modified,
        uploaded_at: Some(Utc::now()),
        unresolved_count: link_manifest.len(),
        link_manifest,
    }
}

/// Record destination ids on the document. Fields that already hold a value
/// are left alone unless `refresh` is set. Returns the number of fields
/// written.
pub fn write_back(
    metadata: &dyn MetadataStore,
    outcome: &UpsertOutcome,
    refresh: bool,
) -> Result<usize, MetadataError> {
    let fields = [
        (FOLDER_ID_FIELD, outcome.folder_id.as_deref()),
        (COLLECTION_ID_FIELD, Some(outcome.collection_id.as_str())),
        (PAGE_ID_FIELD, Some(outcome.page_id.as_str())),
    ];
    let mut written = 0;
    for (field, value) in fields {
        let Some(value) = value else { continue };
        if !refresh && metadata.get_str(&outcome.source_path, field).is_some() {
            continue;
        }
        metadata.set(&outcome.source_path, field, Value::String(value.to_string()))?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InMemoryMetadata;
    use crate::testing::FakeRemote;
    use crate::transport::EntityKind;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(title: &str) -> RenderedDocument {
        RenderedDocument {
            source_path: format!("{title}.md"),
            title: title.to_string(),
            content: format!("<h1>{title}</h1>"),
            links: Vec::new(),
            created: None,
            modified: None,
        }
    }

    fn request<'a>(document: &'a RenderedDocument, folder: &str, collection: &str) -> UpsertRequest<'a> {
        UpsertRequest {
            document,
            identity: "IDIDIDIDIDIDIDID",
            content: &document.content,
            destination: Destination {
                folder_path: normalize_folder_path(folder),
                collection: collection.to_string(),
            },
            known_page_id: None,
        }
    }

    async fn store_for(remote: &Arc<FakeRemote>) -> RemoteStore {
        let mut store = RemoteStore::new(remote.clone());
        store.refresh().await;
        remote.clear_calls();
        store
    }

    #[tokio::test]
    async fn test_folder_chain_creates_only_missing_tail() {
        let remote = Arc::new(FakeRemote::new());
        let a = remote.add_folder("A", None);
        let b = remote.add_folder("B", Some(&a));
        let mut store = store_for(&remote).await;

        let mut created = Vec::new();
        let deepest = ensure_folder_chain(&mut store, "A/B/C", &mut created)
            .await
            .unwrap();

        let creations = remote.creations();
        assert_eq!(creations.len(), 1);
        assert_eq!(creations[0].name, "C");
        assert_eq!(creations[0].parent.as_deref(), Some(b.as_str()));
        assert_eq!(deepest, Some(creations[0].id.clone()));
        assert_eq!(created, vec![creations[0].id.clone()]);
    }

    #[tokio::test]
    async fn test_root_sentinel_has_no_folder() {
        let remote = Arc::new(FakeRemote::new());
        let mut store = store_for(&remote).await;
        let mut created = Vec::new();
        assert_eq!(
            ensure_folder_chain(&mut store, "/", &mut created).await.unwrap(),
            None
        );
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_known_page_id_skips_resolution() {
        let remote = Arc::new(FakeRemote::new());
        let folder = remote.add_folder("Elsewhere", None);
        let collection = remote.add_collection("Old", Some(&folder));
        let page = remote.add_page(&collection, "Moved", None, "");
        let mut store = store_for(&remote).await;

        let document = doc("Moved");
        let mut req = request(&document, "Exports", "Table1");
        req.known_page_id = Some(page.clone());
        let outcome = upsert(&mut store, req).await.unwrap();

        assert_eq!(outcome.status, UpsertStatus::Updated);
        assert_eq!(outcome.page_id, page);
        assert_eq!(outcome.collection_id, collection);
        assert_eq!(outcome.folder_id.as_deref(), Some(folder.as_str()));
        assert!(remote.creations().is_empty());
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_collection_failure_keeps_created_folders() {
        let remote = Arc::new(FakeRemote::new());
        remote.fail_create(EntityKind::Collection);
        let mut store = store_for(&remote).await;

        let document = doc("Note");
        let err = upsert(&mut store, request(&document, "New/Deep", "Table"))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), UpsertStage::Collection);
        assert!(store.cache().folder_by_path("New/Deep").is_some());

        // the retry finds the folders and only creates what is left
        remote.heal();
        remote.clear_calls();
        let outcome = upsert(&mut store, request(&document, "New/Deep", "Table"))
            .await
            .unwrap();
        let kinds: Vec<_> = remote.creations().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec!["collection", "page"]);
        assert!(outcome.created_folders.is_empty());
    }

    #[test]
    fn test_write_back_respects_existing_fields() {
        let metadata = InMemoryMetadata::new();
        metadata.add_document("a.md");
        metadata.set("a.md", PAGE_ID_FIELD, json!("OLD")).unwrap();
        let outcome = UpsertOutcome {
            source_path: "a.md".to_string(),
            status: UpsertStatus::Updated,
            folder_id: None,
            collection_id: "C1".to_string(),
            page_id: "NEW".to_string(),
            created_folders: Vec::new(),
            created_collection: false,
        };

        assert_eq!(write_back(&metadata, &outcome, false).unwrap(), 1);
        assert_eq!(metadata.get_str("a.md", PAGE_ID_FIELD).as_deref(), Some("OLD"));
        assert_eq!(metadata.get_str("a.md", COLLECTION_ID_FIELD).as_deref(), Some("C1"));

        assert_eq!(write_back(&metadata, &outcome, true).unwrap(), 2);
        assert_eq!(metadata.get_str("a.md", PAGE_ID_FIELD).as_deref(), Some("NEW"));
    }

    #[test]
    fn test_destination_overrides() {
        let metadata = InMemoryMetadata::new();
        metadata.add_document("Note.md");
        let config = SyncConfig {
            folder: "Exports/".to_string(),
            ..Default::default()
        };
        let document = doc("Note");

        let dest = Destination::for_document(&config, &metadata, &document);
        assert_eq!(dest.folder_path, "Exports");
        assert_eq!(dest.collection, "Note");

        metadata.set("Note.md", COLLECTION_FIELD, json!("Table1")).unwrap();
        metadata.set("Note.md", FOLDER_FIELD, json!("/")).unwrap();
        let dest = Destination::for_document(&config, &metadata, &document);
        assert_eq!(dest.folder_path, "");
        assert_eq!(dest.collection, "Table1");
    }

    #[test]
    fn test_provenance_stamps_manifest_with_identity() {
        let mut document = doc("Note");
        document.links.push(crate::model::LinkRecord {
            text: "x".to_string(),
            destination_path: Some("other.md".to_string()),
            resolved: true,
            ..Default::default()
        });
        let provenance = build_provenance(&document, "IDENT", &document.content);
        assert_eq!(provenance.unresolved_count, 1);
        assert_eq!(provenance.link_manifest[0].source_uuid, "IDENT");
        assert_eq!(provenance.link_manifest[0].source_path, "Note.md");
        assert!(!provenance.link_manifest[0].resolved);
        assert_eq!(provenance.content_hash, content_hash(document.content.as_bytes()));
    }
}
