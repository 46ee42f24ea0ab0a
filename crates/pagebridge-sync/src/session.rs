//! Sync Session: one authenticated reconciliation run.
//!
//! A session owns all state a run needs: the remote store with its hierarchy
//! cache, the identity resolver, the asset queue and the event handlers. It is
//! built from scratch by [`SyncSession::connect`] and discarded by
//! [`SyncSession::close`]; nothing carries over to the next session.
//!
//! Calls are issued strictly one after another. A document that fails aborts
//! only itself; the batch loop decides whether to carry on.

use crate::assets::{AssetReport, AssetSource, AssetUploader};
use crate::config::SyncConfig;
use crate::error::{RemoteError, SessionError, UpsertError};
use crate::hierarchy::HierarchyCache;
use crate::identity::IdentityResolver;
use crate::links::{self, LinkPassReport};
use crate::metadata::{MetadataStore, PAGE_ID_FIELD};
use crate::model::RenderedDocument;
use crate::remote::RemoteStore;
use crate::transport::{RemoteCall, Transport};
use crate::upsert::{self, Destination, UpsertOutcome, UpsertRequest, UpsertStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// Events
// ============================================================================

/// Events emitted while a session runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    DocumentSynced {
        source_path: String,
        status: UpsertStatus,
        page_id: String,
        created_folders: usize,
        created_collection: bool,
    },
    DocumentFailed {
        source_path: String,
        stage: String,
        message: String,
    },
    AssetsTransferred {
        uploaded: usize,
        skipped: usize,
        failed: usize,
    },
    LinksResolved {
        pages: usize,
        unresolved: usize,
    },
    /// Something the user should be told about
    Notice { message: String },
    Closed { stats: SessionStats },
}

/// Callback for sync events
pub type SyncEventHandler = Box<dyn Fn(SyncEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub assets_uploaded: usize,
    pub ids_issued: usize,
}

/// What one batch did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub synced: Vec<UpsertOutcome>,
    /// `(source path, error)`
    pub failed: Vec<(String, String)>,
    pub assets: AssetReport,
    pub links: Option<LinkPassReport>,
}

impl BatchReport {
    pub fn created(&self) -> usize {
        self.synced
            .iter()
            .filter(|o| o.status == UpsertStatus::Created)
            .count()
    }

    pub fn updated(&self) -> usize {
        self.synced
            .iter()
            .filter(|o| o.status == UpsertStatus::Updated)
            .count()
    }
}

#[derive(Debug, Deserialize)]
struct SessionList {
    #[serde(default)]
    clients: Vec<SessionEntry>,
}

#[derive(Debug, Deserialize)]
struct SessionEntry {
    id: String,
}

// ============================================================================
// Session
// ============================================================================

pub struct SyncSession {
    config: SyncConfig,
    store: RemoteStore,
    identities: IdentityResolver,
    assets: AssetUploader,
    metadata: Arc<dyn MetadataStore>,
    source: Arc<dyn AssetSource>,
    handlers: Vec<SyncEventHandler>,
    stats: SessionStats,
}

impl SyncSession {
    /// Open a session: check configuration, confirm the remote session is
    /// live, then snapshot the hierarchy and the remote asset listing.
    /// Any setup failure is fatal.
    pub async fn connect(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        metadata: Arc<dyn MetadataStore>,
        source: Arc<dyn AssetSource>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        if config.client_id.trim().is_empty() {
            return Err(SessionError::MissingSetting("client_id"));
        }

        let sessions = transport
            .call(RemoteCall::ListSessions)
            .await
            .and_then(|value| {
                serde_json::from_value::<SessionList>(value)
                    .map_err(|e| RemoteError::schema("clients", e))
            })
            .map_err(SessionError::Unreachable)?;
        if !sessions.clients.iter().any(|c| c.id == config.client_id) {
            return Err(SessionError::NoActiveSession(config.client_id.clone()));
        }

        let mut store = RemoteStore::new(transport);
        let hierarchy = store.refresh().await;
        let mut assets = AssetUploader::new(config.asset_dir.clone(), config.vault_root.clone());
        let remote_assets = assets.load_remote_index(&store).await;
        let identities = IdentityResolver::new(metadata.clone(), config.identity_field.clone());

        info!(
            client = %config.client_id,
            folders = hierarchy.folders,
            collections = hierarchy.collections,
            pages = hierarchy.pages,
            remote_assets,
            "session connected"
        );
        Ok(Self {
            config,
            store,
            identities,
            assets,
            metadata,
            source,
            handlers: Vec::new(),
            stats: SessionStats::default(),
        })
    }

    /// Add an event handler
    pub fn on_event(&mut self, handler: SyncEventHandler) {
        self.handlers.push(handler);
    }

    fn emit(&self, event: SyncEvent) {
        for handler in &self.handlers {
            handler(event.clone());
        }
    }

    fn notify(&self, message: String) {
        warn!("{message}");
        self.emit(SyncEvent::Notice { message });
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn hierarchy(&self) -> &HierarchyCache {
        self.store.cache()
    }

    pub fn identities(&mut self) -> &mut IdentityResolver {
        &mut self.identities
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            ids_issued: self.identities.issued_count(),
            ..self.stats
        }
    }

    /// Upsert one document. Once its page is written, its images are queued
    /// but not yet transferred.
    pub async fn upsert_document(
        &mut self,
        document: &RenderedDocument,
    ) -> Result<UpsertOutcome, UpsertError> {
        let identity = self.identities.ensure_identity(&document.source_path)?;
        let prepared = self
            .assets
            .prepare(&document.content, self.source.as_ref())
            .await;
        for missing in &prepared.missing {
            self.notify(format!(
                "{}: embedded image `{missing}` not found",
                document.source_path
            ));
        }

        let request = UpsertRequest {
            document,
            identity: &identity,
            content: &prepared.content,
            destination: Destination::for_document(&self.config, self.metadata.as_ref(), document),
            known_page_id: self.metadata.get_str(&document.source_path, PAGE_ID_FIELD),
        };
        let outcome = upsert::upsert(&mut self.store, request).await?;
        for asset in prepared.assets {
            self.assets.enqueue(asset);
        }

        if self.config.write_back {
            upsert::write_back(
                self.metadata.as_ref(),
                &outcome,
                self.config.refresh_destination,
            )?;
        }

        match outcome.status {
            UpsertStatus::Created => self.stats.created += 1,
            UpsertStatus::Updated => self.stats.updated += 1,
        }
        self.emit(SyncEvent::DocumentSynced {
            source_path: outcome.source_path.clone(),
            status: outcome.status,
            page_id: outcome.page_id.clone(),
            created_folders: outcome.created_folders.len(),
            created_collection: outcome.created_collection,
        });
        Ok(outcome)
    }

    /// Upsert one document, transfer its images and, if configured, resolve
    /// links.
    pub async fn sync_document(
        &mut self,
        document: &RenderedDocument,
    ) -> Result<UpsertOutcome, UpsertError> {
        let outcome = match self.upsert_document(document).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_failure(&document.source_path, &e);
                return Err(e);
            }
        };
        self.flush_assets().await;
        if self.config.resolve_links {
            self.resolve_links().await;
        }
        Ok(outcome)
    }

    /// Reconcile a batch: every document, then the asset queue, then links.
    pub async fn sync_batch(&mut self, documents: &[RenderedDocument]) -> BatchReport {
        let mut report = BatchReport::default();

        for document in documents {
            match self.upsert_document(document).await {
                Ok(outcome) => report.synced.push(outcome),
                Err(e) => {
                    self.record_failure(&document.source_path, &e);
                    report
                        .failed
                        .push((document.source_path.clone(), e.to_string()));
                    if !self.config.continue_on_error {
                        warn!("stopping batch after first failure");
                        break;
                    }
                }
            }
        }

        report.assets = self.flush_assets().await;
        if self.config.resolve_links {
            report.links = Some(self.resolve_links().await);
        }

        info!(
            created = report.created(),
            updated = report.updated(),
            failed = report.failed.len(),
            "batch complete"
        );
        report
    }

    /// Transfer every queued asset.
    pub async fn flush_assets(&mut self) -> AssetReport {
        let report = self.assets.drain(&self.store, self.source.as_ref()).await;
        self.stats.assets_uploaded += report.uploaded.len();
        for (path, error) in &report.failed {
            self.notify(format!("upload of `{path}` failed: {error}"));
        }
        self.emit(SyncEvent::AssetsTransferred {
            uploaded: report.uploaded.len(),
            skipped: report.skipped.len(),
            failed: report.failed.len(),
        });
        report
    }

    pub async fn resolve_links(&mut self) -> LinkPassReport {
        let report = links::resolve_links(&mut self.store).await;
        for (page, error) in &report.failed {
            self.notify(format!("could not save resolved links on page {page}: {error}"));
        }
        self.emit(SyncEvent::LinksResolved {
            pages: report.pages.len(),
            unresolved: report.unresolved(),
        });
        report
    }

    fn record_failure(&mut self, source_path: &str, error: &UpsertError) {
        self.stats.failed += 1;
        warn!(document = source_path, error = %error, "document upsert failed");
        self.emit(SyncEvent::DocumentFailed {
            source_path: source_path.to_string(),
            stage: error.stage().to_string(),
            message: error.to_string(),
        });
        self.notify(format!("{source_path}: {error}"));
    }

    /// End the session, returning what it did.
    pub fn close(self) -> SessionStats {
        let stats = self.stats();
        info!(?stats, "session closed");
        self.emit(SyncEvent::Closed { stats });
        stats
    }
}
