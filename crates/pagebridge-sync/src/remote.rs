//! The one place remote hierarchy entities are created or written.
//!
//! Every create/update goes through [`RemoteStore`], which performs the call
//! and inserts the result into the [`HierarchyCache`] before returning, so the
//! cache cannot drift from what this session has done remotely.

use crate::error::{RemoteError, UpsertError, UpsertStage};
use crate::hierarchy::{HierarchyCache, HierarchyStats};
use crate::model::{
    normalize_folder_path, page_path, Provenance, RemoteCollection, RemoteFolder, RemoteId,
    RemotePage,
};
use crate::scripts::{CreatedEntity, UpsertPageResult, FLAG_SCOPE, UPSERT_PAGE};
use crate::transport::{EntityKind, RemoteCall, Transport};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A page write: create when `page_id` is `None`, update otherwise.
#[derive(Debug, Clone)]
pub struct PageWrite<'a> {
    pub collection_id: &'a str,
    pub page_id: Option<&'a str>,
    pub title: &'a str,
    pub content: &'a str,
    pub provenance: &'a Provenance,
}

pub struct RemoteStore {
    transport: Arc<dyn Transport>,
    cache: HierarchyCache,
}

impl RemoteStore {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            cache: HierarchyCache::new(),
        }
    }

    pub fn cache(&self) -> &HierarchyCache {
        &self.cache
    }

    pub async fn refresh(&mut self) -> HierarchyStats {
        self.cache.refresh(self.transport.as_ref()).await
    }

    /// Send one call. Every remote round trip of a session passes here.
    pub async fn call(&self, call: RemoteCall) -> Result<Value, RemoteError> {
        let label = call.label();
        debug!(call = %label, "remote call");
        let result = self.transport.call(call).await;
        if let Err(e) = &result {
            warn!(call = %label, error = %e, "remote call failed");
        }
        result
    }

    /// Create a folder under `parent_id` (`None` for the root).
    pub async fn create_folder(
        &mut self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<RemoteFolder, RemoteError> {
        let parent = parent_id.and_then(|id| self.cache.folder(id)).cloned();
        let data = json!({ "name": name, "type": "JournalEntry", "folder": parent_id });
        let value = self
            .call(RemoteCall::Create {
                kind: EntityKind::Folder,
                data,
            })
            .await?;
        let created: CreatedEntity =
            serde_json::from_value(value).map_err(|e| RemoteError::schema("create:Folder", e))?;

        let (full_path, depth) = match &parent {
            Some(parent) => (format!("{}/{}", parent.full_path, name), parent.depth + 1),
            None => (normalize_folder_path(name), 1),
        };
        let folder = RemoteFolder {
            id: created.id,
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
            depth,
            full_path,
        };
        info!(id = %folder.id, path = %folder.full_path, "created folder");
        self.cache.insert_folder(folder.clone());
        Ok(folder)
    }

    /// Create a collection inside `folder_id` (`None` for the root).
    pub async fn create_collection(
        &mut self,
        name: &str,
        folder_id: Option<&str>,
    ) -> Result<RemoteCollection, RemoteError> {
        let folder_path = folder_id
            .and_then(|id| self.cache.folder(id))
            .map(|f| f.full_path.clone())
            .unwrap_or_default();
        let data = json!({ "name": name, "folder": folder_id });
        let value = self
            .call(RemoteCall::Create {
                kind: EntityKind::Collection,
                data,
            })
            .await?;
        let created: CreatedEntity = serde_json::from_value(value)
            .map_err(|e| RemoteError::schema("create:JournalEntry", e))?;

        let collection = RemoteCollection {
            id: created.id,
            name: name.to_string(),
            folder_id: folder_id.map(str::to_string),
            full_path: crate::model::collection_path(&folder_path, name),
            pages: Vec::new(),
        };
        info!(id = %collection.id, path = %collection.full_path, "created collection");
        self.cache.insert_collection(collection.clone());
        Ok(collection)
    }

    /// Create or update one page in a single call.
    ///
    /// A create returns the collection's page list rather than the new id, so
    /// the new page is found by title. Two siblings with the same title make
    /// that ambiguous; the first match wins.
    pub async fn write_page(&mut self, write: PageWrite<'_>) -> Result<RemotePage, UpsertError> {
        let args = json!({
            "flagScope": FLAG_SCOPE,
            "collectionId": write.collection_id,
            "pageId": write.page_id,
            "title": write.title,
            "content": write.content,
            "provenance": write.provenance,
        });
        let value = self
            .call(RemoteCall::Execute {
                script: &UPSERT_PAGE,
                args,
            })
            .await
            .map_err(UpsertError::at(UpsertStage::Page))?;
        let result: UpsertPageResult = UPSERT_PAGE
            .decode(value)
            .map_err(UpsertError::at(UpsertStage::Page))?;

        let known = write
            .page_id
            .map(str::to_string)
            .or_else(|| result.page_id.clone());
        let page_id = match known {
            Some(id) => id,
            None => locate_by_title(&result, write.title).ok_or_else(|| {
                UpsertError::CreatedPageMissing {
                    title: write.title.to_string(),
                    collection_id: write.collection_id.to_string(),
                }
            })?,
        };

        let collection = self.cache.collection(write.collection_id);
        let collection_path = collection
            .map(|c| c.full_path.clone())
            .unwrap_or_else(|| write.collection_id.to_string());
        let folder_id = collection.and_then(|c| c.folder_id.clone());
        let page = RemotePage {
            id: page_id,
            name: write.title.to_string(),
            collection_id: write.collection_id.to_string(),
            folder_id,
            full_path: page_path(&collection_path, write.title),
            provenance: Some(write.provenance.clone()),
        };
        self.cache.insert_page(page.clone());
        Ok(page)
    }
}

fn locate_by_title(result: &UpsertPageResult, title: &str) -> Option<RemoteId> {
    let mut matches = result.pages.iter().filter(|p| p.name == title);
    let first = matches.next()?;
    if matches.next().is_some() {
        warn!(title, id = %first.id, "several sibling pages share this title; adopting the first");
    }
    Some(first.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;

    #[tokio::test]
    async fn test_creates_land_in_cache() {
        let remote = Arc::new(FakeRemote::new());
        let mut store = RemoteStore::new(remote.clone());

        let exports = store.create_folder("Exports", None).await.unwrap();
        let sessions = store
            .create_folder("Sessions", Some(&exports.id))
            .await
            .unwrap();
        let table = store
            .create_collection("Table1", Some(&sessions.id))
            .await
            .unwrap();

        assert_eq!(sessions.full_path, "Exports/Sessions");
        assert_eq!(sessions.depth, 2);
        assert_eq!(table.full_path, "Exports/Sessions/Table1");
        assert_eq!(
            store.cache().folder_by_path("Exports/Sessions").unwrap().id,
            sessions.id
        );
        assert_eq!(
            store.cache().collection_by_path("Exports/Sessions/Table1").unwrap().id,
            table.id
        );
    }

    #[tokio::test]
    async fn test_created_page_is_located_by_title() {
        let remote = Arc::new(FakeRemote::new());
        let collection = remote.add_collection("Notes", None);
        remote.add_page(&collection, "Other", None, "");
        let mut store = RemoteStore::new(remote.clone());
        store.refresh().await;

        let provenance = Provenance::default();
        let page = store
            .write_page(PageWrite {
                collection_id: &collection,
                page_id: None,
                title: "Fresh",
                content: "<p>x</p>",
                provenance: &provenance,
            })
            .await
            .unwrap();

        assert_eq!(remote.pages_named("Fresh")[0].id, page.id);
        assert_eq!(store.cache().page_by_path("Notes.Fresh").unwrap().id, page.id);
        assert_eq!(store.cache().collection(&collection).unwrap().pages.len(), 2);
    }

    #[tokio::test]
    async fn test_update_keeps_known_page_id() {
        let remote = Arc::new(FakeRemote::new());
        let collection = remote.add_collection("Notes", None);
        let existing = remote.add_page(&collection, "Alpha", None, "<p>old</p>");
        let mut store = RemoteStore::new(remote.clone());
        store.refresh().await;

        let provenance = Provenance::default();
        let page = store
            .write_page(PageWrite {
                collection_id: &collection,
                page_id: Some(&existing),
                title: "Alpha",
                content: "<p>new</p>",
                provenance: &provenance,
            })
            .await
            .unwrap();

        assert_eq!(page.id, existing);
        assert_eq!(remote.pages_named("Alpha").len(), 1);
        assert_eq!(remote.pages_named("Alpha")[0].content, "<p>new</p>");
    }

    #[tokio::test]
    async fn test_create_failure_leaves_cache_untouched() {
        let remote = Arc::new(FakeRemote::new());
        remote.fail_create(EntityKind::Folder);
        let mut store = RemoteStore::new(remote.clone());

        assert!(store.create_folder("Exports", None).await.is_err());
        assert_eq!(store.cache().stats().folders, 0);
    }
}
