//! In-memory remote for tests.
//!
//! [`FakeRemote`] answers every [`RemoteCall`] the engine issues against a
//! small folder/collection/page model, records each call, and can be told to
//! fail specific scripts, creations or uploads.

use crate::error::RemoteError;
use crate::model::Provenance;
use crate::transport::{EntityKind, RemoteCall, Transport};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};

pub const FAKE_SESSION_ID: &str = "session-1";

#[derive(Debug, Clone)]
struct FakeFolder {
    id: String,
    name: String,
    parent: Option<String>,
}

#[derive(Debug, Clone)]
struct FakeCollection {
    id: String,
    name: String,
    folder: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FakePage {
    pub id: String,
    pub name: String,
    pub collection: String,
    pub content: String,
    pub provenance: Option<Provenance>,
}

/// One entity created through the remote, in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creation {
    pub kind: &'static str,
    pub name: String,
    pub parent: Option<String>,
    pub id: String,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    sessions: Vec<String>,
    folders: Vec<FakeFolder>,
    collections: Vec<FakeCollection>,
    pages: Vec<FakePage>,
    files: BTreeSet<String>,
    calls: Vec<RemoteCall>,
    creations: Vec<Creation>,
    uploads: Vec<String>,
    failing_scripts: HashSet<String>,
    failing_creates: HashSet<&'static str>,
    fail_uploads: bool,
    unreachable: bool,
}

impl FakeState {
    fn mint(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:04}", self.next_id)
    }

    fn folder_path(&self, id: &str) -> String {
        let mut names = Vec::new();
        let mut current = self.folders.iter().find(|f| f.id == id);
        while let Some(folder) = current {
            names.push(folder.name.clone());
            current = folder
                .parent
                .as_deref()
                .and_then(|pid| self.folders.iter().find(|f| f.id == pid));
        }
        names.reverse();
        names.join("/")
    }

    fn collection_path(&self, collection: &FakeCollection) -> String {
        match &collection.folder {
            Some(folder) => format!("{}/{}", self.folder_path(folder), collection.name),
            None => collection.name.clone(),
        }
    }

    fn page_list(&self, collection_id: &str) -> Value {
        let pages: Vec<Value> = self
            .pages
            .iter()
            .filter(|p| p.collection == collection_id)
            .map(|p| json!({ "id": p.id, "name": p.name }))
            .collect();
        Value::Array(pages)
    }
}

pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        let state = FakeState {
            sessions: vec![FAKE_SESSION_ID.to_string()],
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    // ------------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------------

    pub fn add_folder(&self, name: &str, parent: Option<&str>) -> String {
        let mut state = self.state.lock();
        let id = state.mint("F");
        state.folders.push(FakeFolder {
            id: id.clone(),
            name: name.to_string(),
            parent: parent.map(str::to_string),
        });
        id
    }

    pub fn add_collection(&self, name: &str, folder: Option<&str>) -> String {
        let mut state = self.state.lock();
        let id = state.mint("C");
        state.collections.push(FakeCollection {
            id: id.clone(),
            name: name.to_string(),
            folder: folder.map(str::to_string),
        });
        id
    }

    pub fn add_page(
        &self,
        collection: &str,
        name: &str,
        provenance: Option<Provenance>,
        content: &str,
    ) -> String {
        let mut state = self.state.lock();
        let id = state.mint("P");
        state.pages.push(FakePage {
            id: id.clone(),
            name: name.to_string(),
            collection: collection.to_string(),
            content: content.to_string(),
            provenance,
        });
        id
    }

    /// Seed a file in the remote asset store, stored exactly as given.
    pub fn add_file(&self, path: &str) {
        self.state.lock().files.insert(path.to_string());
    }

    pub fn set_sessions(&self, sessions: &[&str]) {
        self.state.lock().sessions = sessions.iter().map(|s| s.to_string()).collect();
    }

    // ------------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------------

    pub fn fail_script(&self, name: &str) {
        self.state.lock().failing_scripts.insert(name.to_string());
    }

    pub fn fail_create(&self, kind: EntityKind) {
        self.state.lock().failing_creates.insert(kind.as_str());
    }

    pub fn fail_uploads(&self) {
        self.state.lock().fail_uploads = true;
    }

    pub fn set_unreachable(&self) {
        self.state.lock().unreachable = true;
    }

    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.failing_scripts.clear();
        state.failing_creates.clear();
        state.fail_uploads = false;
        state.unreachable = false;
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.creations.clear();
        state.uploads.clear();
    }

    pub fn creations(&self) -> Vec<Creation> {
        self.state.lock().creations.clone()
    }

    /// `path/filename` of every transfer, in order.
    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().uploads.clone()
    }

    pub fn files(&self) -> Vec<String> {
        self.state.lock().files.iter().cloned().collect()
    }

    pub fn page(&self, id: &str) -> Option<FakePage> {
        self.state.lock().pages.iter().find(|p| p.id == id).cloned()
    }

    pub fn pages_named(&self, name: &str) -> Vec<FakePage> {
        self.state
            .lock()
            .pages
            .iter()
            .filter(|p| p.name == name)
            .cloned()
            .collect()
    }

    pub fn folder_id(&self, path: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .folders
            .iter()
            .find(|f| state.folder_path(&f.id) == path)
            .map(|f| f.id.clone())
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn execute(state: &mut FakeState, name: &str, args: &Value) -> Result<Value, RemoteError> {
        match name {
            "list_folders" => {
                let rows: Vec<Value> = state
                    .folders
                    .iter()
                    .map(|f| {
                        let full_path = state.folder_path(&f.id);
                        json!({
                            "id": f.id,
                            "name": f.name,
                            "parentId": f.parent,
                            "depth": full_path.split('/').count(),
                            "fullPath": full_path,
                        })
                    })
                    .collect();
                Ok(Value::Array(rows))
            }
            "list_collections" => {
                let rows: Vec<Value> = state
                    .collections
                    .iter()
                    .map(|c| {
                        let pages: Vec<Value> = state
                            .pages
                            .iter()
                            .filter(|p| p.collection == c.id)
                            .map(|p| json!({ "id": p.id, "name": p.name, "provenance": p.provenance }))
                            .collect();
                        json!({
                            "id": c.id,
                            "name": c.name,
                            "folderId": c.folder,
                            "fullPath": state.collection_path(c),
                            "pages": pages,
                        })
                    })
                    .collect();
                Ok(Value::Array(rows))
            }
            "upsert_page" => {
                let collection_id = args["collectionId"].as_str().unwrap_or_default().to_string();
                if !state.collections.iter().any(|c| c.id == collection_id) {
                    return Err(RemoteError::Rejected(format!(
                        "collection {collection_id} not found"
                    )));
                }
                let title = args["title"].as_str().unwrap_or_default().to_string();
                let content = args["content"].as_str().unwrap_or_default().to_string();
                let provenance: Option<Provenance> =
                    serde_json::from_value(args["provenance"].clone()).ok();

                let page_id = match args["pageId"].as_str() {
                    Some(page_id) => {
                        let page = state
                            .pages
                            .iter_mut()
                            .find(|p| p.id == page_id)
                            .ok_or_else(|| RemoteError::Rejected(format!("page {page_id} not found")))?;
                        page.name = title;
                        page.content = content;
                        page.provenance = provenance;
                        Value::String(page_id.to_string())
                    }
                    None => {
                        let id = state.mint("P");
                        state.creations.push(Creation {
                            kind: "page",
                            name: title.clone(),
                            parent: Some(collection_id.clone()),
                            id: id.clone(),
                        });
                        state.pages.push(FakePage {
                            id,
                            name: title,
                            collection: collection_id.clone(),
                            content,
                            provenance,
                        });
                        Value::Null
                    }
                };
                Ok(json!({ "pageId": page_id, "pages": state.page_list(&collection_id) }))
            }
            "scan_pages" => {
                let rows: Vec<Value> = state
                    .pages
                    .iter()
                    .map(|p| {
                        let pending = p
                            .provenance
                            .as_ref()
                            .is_some_and(|prov| prov.unresolved_count > 0);
                        json!({
                            "id": p.id,
                            "name": p.name,
                            "collectionId": p.collection,
                            "provenance": p.provenance,
                            "content": if pending { Some(p.content.clone()) } else { None },
                        })
                    })
                    .collect();
                Ok(Value::Array(rows))
            }
            other => Err(RemoteError::Rejected(format!("unknown script {other}"))),
        }
    }
}

#[async_trait::async_trait]
impl Transport for FakeRemote {
    async fn call(&self, call: RemoteCall) -> Result<Value, RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(call.clone());
        if state.unreachable {
            return Err(RemoteError::Network("connection refused".to_string()));
        }

        match call {
            RemoteCall::ListSessions => {
                let clients: Vec<Value> = state.sessions.iter().map(|id| json!({ "id": id })).collect();
                Ok(json!({ "clients": clients }))
            }
            RemoteCall::Execute { script, args } => {
                if state.failing_scripts.contains(script.name) {
                    return Err(RemoteError::Api {
                        status: 500,
                        message: format!("{} failed", script.name),
                    });
                }
                Self::execute(&mut state, script.name, &args)
            }
            RemoteCall::Create { kind, data } => {
                if state.failing_creates.contains(kind.as_str()) {
                    return Err(RemoteError::Api {
                        status: 500,
                        message: format!("create {} failed", kind.as_str()),
                    });
                }
                let name = data["name"].as_str().unwrap_or_default().to_string();
                let parent = data["folder"].as_str().map(str::to_string);
                let id = match kind {
                    EntityKind::Folder => {
                        let id = state.mint("F");
                        state.folders.push(FakeFolder {
                            id: id.clone(),
                            name: name.clone(),
                            parent: parent.clone(),
                        });
                        id
                    }
                    EntityKind::Collection => {
                        let id = state.mint("C");
                        state.collections.push(FakeCollection {
                            id: id.clone(),
                            name: name.clone(),
                            folder: parent.clone(),
                        });
                        id
                    }
                };
                let label = match kind {
                    EntityKind::Folder => "folder",
                    EntityKind::Collection => "collection",
                };
                state.creations.push(Creation {
                    kind: label,
                    name: name.clone(),
                    parent,
                    id: id.clone(),
                });
                Ok(json!({ "_id": id, "name": name }))
            }
            RemoteCall::Upload { path, filename, .. } => {
                if state.fail_uploads {
                    return Err(RemoteError::Api {
                        status: 507,
                        message: "storage full".to_string(),
                    });
                }
                let full = format!("{}/{}", path.trim_end_matches('/'), filename);
                state.uploads.push(full.clone());
                state.files.insert(full.clone());
                Ok(json!({ "success": true, "path": full }))
            }
            RemoteCall::ListFiles { path } => {
                let prefix = format!("{}/", path.trim_end_matches('/'));
                let files: Vec<&String> = state.files.iter().filter(|f| f.starts_with(&prefix)).collect();
                Ok(json!({ "files": files }))
            }
        }
    }
}
