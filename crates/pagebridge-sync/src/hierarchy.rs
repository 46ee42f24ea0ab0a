//! Remote Hierarchy Cache
//!
//! Snapshot of the remote folder → collection → page tree, indexed by id and
//! by path key. Built by [`HierarchyCache::refresh`] at session start and then
//! kept coherent by hand: whoever creates a remote entity inserts it here
//! immediately (see [`crate::remote::RemoteStore`]). Nothing is re-fetched
//! mid-batch.
//!
//! Path keys:
//!
//! ```text
//! folder      Exports/Sessions
//! collection  Exports/Sessions/Table1
//! page        Exports/Sessions/Table1.Session 3
//! ```
//!
//! Path keys are unique inside the cache but not in the remote system. When a
//! refresh sees two entities with one path key, the first one keeps the key.

use crate::model::{
    normalize_folder_path, page_path, RemoteCollection, RemoteFolder, RemoteId, RemotePage,
};
use crate::scripts::{CollectionRow, FolderRows, FLAG_SCOPE, LIST_COLLECTIONS, LIST_FOLDERS};
use crate::transport::{RemoteCall, Transport};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HierarchyStats {
    pub folders: usize,
    pub collections: usize,
    pub pages: usize,
}

#[derive(Debug, Clone, Default)]
pub struct HierarchyCache {
    folders: HashMap<RemoteId, RemoteFolder>,
    folder_by_path: HashMap<String, RemoteId>,
    collections: HashMap<RemoteId, RemoteCollection>,
    collection_by_path: HashMap<String, RemoteId>,
    pages: HashMap<RemoteId, RemotePage>,
    page_by_path: HashMap<String, RemoteId>,
}

impl HierarchyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild every index from the remote. Two round trips: folders, then
    /// collections with their pages.
    ///
    /// A failed round trip leaves its part of the snapshot empty instead of
    /// failing, which sends later lookups down the create path.
    pub async fn refresh(&mut self, transport: &dyn Transport) -> HierarchyStats {
        let args = serde_json::json!({ "flagScope": FLAG_SCOPE });

        let folders = match transport
            .call(RemoteCall::Execute {
                script: &LIST_FOLDERS,
                args: args.clone(),
            })
            .await
            .and_then(|value| LIST_FOLDERS.decode::<FolderRows>(value))
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "folder refresh failed; continuing with no folders");
                Vec::new()
            }
        };

        let collections = match transport
            .call(RemoteCall::Execute {
                script: &LIST_COLLECTIONS,
                args,
            })
            .await
            .and_then(|value| LIST_COLLECTIONS.decode::<Vec<CollectionRow>>(value))
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "collection refresh failed; continuing with no collections");
                Vec::new()
            }
        };

        *self = Self::from_rows(folders, collections);
        let stats = self.stats();
        info!(
            folders = stats.folders,
            collections = stats.collections,
            pages = stats.pages,
            "hierarchy refreshed"
        );
        stats
    }

    /// Build the indices from decoded refresh rows.
    pub fn from_rows(folders: Vec<RemoteFolder>, collections: Vec<CollectionRow>) -> Self {
        let mut cache = Self::default();

        for mut folder in folders {
            folder.full_path = normalize_folder_path(&folder.full_path);
            if cache.folder_by_path.contains_key(&folder.full_path) {
                warn!(path = %folder.full_path, id = %folder.id, "duplicate folder path; keeping first");
                cache.folders.insert(folder.id.clone(), folder);
                continue;
            }
            cache.insert_folder(folder);
        }

        for row in collections {
            let page_ids = row.pages.iter().map(|p| p.id.clone()).collect();
            let collection = RemoteCollection {
                id: row.id.clone(),
                name: row.name,
                folder_id: row.folder_id.clone(),
                full_path: row.full_path,
                pages: page_ids,
            };
            if cache.collection_by_path.contains_key(&collection.full_path) {
                warn!(path = %collection.full_path, id = %collection.id, "duplicate collection path; keeping first");
                cache.collections.insert(collection.id.clone(), collection.clone());
            } else {
                cache.insert_collection(collection.clone());
            }

            for page in row.pages {
                let full_path = page_path(&collection.full_path, &page.name);
                let remote_page = RemotePage {
                    id: page.id,
                    name: page.name,
                    collection_id: row.id.clone(),
                    folder_id: row.folder_id.clone(),
                    full_path,
                    provenance: page.provenance,
                };
                if cache.page_by_path.contains_key(&remote_page.full_path) {
                    warn!(path = %remote_page.full_path, id = %remote_page.id, "duplicate page path; keeping first");
                    cache.pages.insert(remote_page.id.clone(), remote_page);
                } else {
                    cache.insert_page(remote_page);
                }
            }
        }

        cache
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub fn folder(&self, id: &str) -> Option<&RemoteFolder> {
        self.folders.get(id)
    }

    pub fn folder_by_path(&self, path: &str) -> Option<&RemoteFolder> {
        self.folder_by_path
            .get(&normalize_folder_path(path))
            .and_then(|id| self.folders.get(id))
    }

    pub fn collection(&self, id: &str) -> Option<&RemoteCollection> {
        self.collections.get(id)
    }

    pub fn collection_by_path(&self, path: &str) -> Option<&RemoteCollection> {
        self.collection_by_path
            .get(path)
            .and_then(|id| self.collections.get(id))
    }

    pub fn page(&self, id: &str) -> Option<&RemotePage> {
        self.pages.get(id)
    }

    pub fn page_by_path(&self, path: &str) -> Option<&RemotePage> {
        self.page_by_path.get(path).and_then(|id| self.pages.get(id))
    }

    pub fn folders(&self) -> impl Iterator<Item = &RemoteFolder> {
        self.folders.values()
    }

    pub fn collections(&self) -> impl Iterator<Item = &RemoteCollection> {
        self.collections.values()
    }

    pub fn pages(&self) -> impl Iterator<Item = &RemotePage> {
        self.pages.values()
    }

    pub fn stats(&self) -> HierarchyStats {
        HierarchyStats {
            folders: self.folders.len(),
            collections: self.collections.len(),
            pages: self.pages.len(),
        }
    }

    // ------------------------------------------------------------------------
    // Mutation (creators only)
    // ------------------------------------------------------------------------

    pub fn insert_folder(&mut self, folder: RemoteFolder) {
        debug!(id = %folder.id, path = %folder.full_path, "cache folder");
        self.folder_by_path
            .insert(folder.full_path.clone(), folder.id.clone());
        self.folders.insert(folder.id.clone(), folder);
    }

    pub fn insert_collection(&mut self, collection: RemoteCollection) {
        debug!(id = %collection.id, path = %collection.full_path, "cache collection");
        self.collection_by_path
            .insert(collection.full_path.clone(), collection.id.clone());
        self.collections.insert(collection.id.clone(), collection);
    }

    /// Insert or replace a page, keeping its collection's page list and the
    /// path index in step with it.
    pub fn insert_page(&mut self, page: RemotePage) {
        debug!(id = %page.id, path = %page.full_path, "cache page");
        if let Some(previous) = self.pages.get(&page.id) {
            if previous.full_path != page.full_path
                && self.page_by_path.get(&previous.full_path) == Some(&page.id)
            {
                self.page_by_path.remove(&previous.full_path);
            }
        }
        if let Some(collection) = self.collections.get_mut(&page.collection_id) {
            if !collection.pages.contains(&page.id) {
                collection.pages.push(page.id.clone());
            }
        }
        self.page_by_path
            .insert(page.full_path.clone(), page.id.clone());
        self.pages.insert(page.id.clone(), page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripts::PageRow;
    use crate::testing::FakeRemote;

    fn folder(id: &str, name: &str, parent: Option<&str>, path: &str) -> RemoteFolder {
        RemoteFolder {
            id: id.to_string(),
            name: name.to_string(),
            parent_id: parent.map(str::to_string),
            depth: path.matches('/').count() as u32 + 1,
            full_path: path.to_string(),
        }
    }

    #[test]
    fn test_indices_from_rows() {
        let cache = HierarchyCache::from_rows(
            vec![
                folder("F1", "Exports", None, "Exports"),
                folder("F2", "Sessions", Some("F1"), "Exports/Sessions"),
            ],
            vec![CollectionRow {
                id: "C1".to_string(),
                name: "Table1".to_string(),
                folder_id: Some("F2".to_string()),
                full_path: "Exports/Sessions/Table1".to_string(),
                pages: vec![PageRow {
                    id: "P1".to_string(),
                    name: "Session 3".to_string(),
                    provenance: None,
                }],
            }],
        );

        assert_eq!(cache.folder_by_path("Exports/Sessions").unwrap().id, "F2");
        assert_eq!(cache.folder_by_path("/Exports/").unwrap().id, "F1");
        assert_eq!(cache.collection_by_path("Exports/Sessions/Table1").unwrap().id, "C1");
        let page = cache.page_by_path("Exports/Sessions/Table1.Session 3").unwrap();
        assert_eq!(page.id, "P1");
        assert_eq!(page.folder_id.as_deref(), Some("F2"));
        assert_eq!(cache.collection("C1").unwrap().pages, vec!["P1".to_string()]);
    }

    #[test]
    fn test_duplicate_page_titles_keep_first_path_key() {
        let cache = HierarchyCache::from_rows(
            Vec::new(),
            vec![CollectionRow {
                id: "C1".to_string(),
                name: "Notes".to_string(),
                folder_id: None,
                full_path: "Notes".to_string(),
                pages: vec![
                    PageRow {
                        id: "P1".to_string(),
                        name: "Same".to_string(),
                        provenance: None,
                    },
                    PageRow {
                        id: "P2".to_string(),
                        name: "Same".to_string(),
                        provenance: None,
                    },
                ],
            }],
        );

        assert_eq!(cache.page_by_path("Notes.Same").unwrap().id, "P1");
        assert!(cache.page("P2").is_some());
        assert_eq!(cache.stats().pages, 2);
    }

    #[test]
    fn test_insert_page_moves_path_key_on_rename() {
        let mut cache = HierarchyCache::new();
        cache.insert_collection(RemoteCollection {
            id: "C1".to_string(),
            name: "Notes".to_string(),
            folder_id: None,
            full_path: "Notes".to_string(),
            pages: Vec::new(),
        });
        let mut page = RemotePage {
            id: "P1".to_string(),
            name: "Old".to_string(),
            collection_id: "C1".to_string(),
            folder_id: None,
            full_path: "Notes.Old".to_string(),
            provenance: None,
        };
        cache.insert_page(page.clone());
        page.name = "New".to_string();
        page.full_path = "Notes.New".to_string();
        cache.insert_page(page);

        assert!(cache.page_by_path("Notes.Old").is_none());
        assert_eq!(cache.page_by_path("Notes.New").unwrap().id, "P1");
        assert_eq!(cache.collection("C1").unwrap().pages.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_yields_empty_cache() {
        let remote = FakeRemote::new();
        remote.add_folder("Exports", None);
        remote.fail_script("list_folders");

        let mut cache = HierarchyCache::new();
        let stats = cache.refresh(&remote).await;

        assert_eq!(stats.folders, 0);
        assert!(cache.folder_by_path("Exports").is_none());
    }

    #[tokio::test]
    async fn test_refresh_is_two_round_trips() {
        let remote = FakeRemote::new();
        let exports = remote.add_folder("Exports", None);
        let table = remote.add_collection("Table1", Some(&exports));
        remote.add_page(&table, "Intro", None, "<p>hi</p>");

        let mut cache = HierarchyCache::new();
        let stats = cache.refresh(&remote).await;

        assert_eq!(
            stats,
            HierarchyStats {
                folders: 1,
                collections: 1,
                pages: 1
            }
        );
        assert_eq!(remote.calls().len(), 2);
        assert!(cache.page_by_path("Exports/Table1.Intro").is_some());
    }
}
