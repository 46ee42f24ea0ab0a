//! Pagebridge Sync: local vault → remote page hierarchy reconciliation
//!
//! Pushes a batch of rendered local documents into a remote content system
//! organised as folders → collections → pages. The remote offers no query API;
//! it is reached through an authenticated relay that can create entities,
//! accept uploads and run scripts that return JSON.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           SYNC SESSION                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  RenderedDocument ──► Identity ──► Asset prepare ──► Upsert          │
//! │                       Resolver     (hash, rewrite,   Orchestrator    │
//! │                          │          queued on success)   │           │
//! │                          ▼                               ▼           │
//! │                   ┌────────────┐                  ┌──────────────┐   │
//! │                   │  Metadata  │◄──write-back─────│ RemoteStore  │   │
//! │                   │   Store    │                  │  + Hierarchy │   │
//! │                   └────────────┘                  │    Cache     │   │
//! │                                                   └──────┬───────┘   │
//! │  after the batch:                                        │           │
//! │    asset queue drain ──► upload (once per name) ─────────┤           │
//! │    link pass ──► scan, rewrite, persist ─────────────────┤           │
//! │                                                          ▼           │
//! │                                                    Transport         │
//! │                                                 (HTTP relay / fake)  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//! - Re-running an unchanged document against unchanged remote state updates
//!   its page and creates nothing.
//! - Identical bytes always map to the same remote asset name, and one batch
//!   transfers each name at most once.
//! - Folder chains create only their missing tail.
//!
//! ## Known limitations
//! - Sibling pages with the same title are ambiguous: a created page is
//!   located by title and the first match wins.
//! - Nothing is rolled back; a failed document may leave folders or a
//!   collection behind, which the next run adopts.

pub mod assets;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod identity;
pub mod links;
pub mod metadata;
pub mod model;
pub mod remote;
pub mod scripts;
pub mod session;
pub mod transport;
pub mod upsert;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use assets::{AssetReport, AssetSource, AssetUploader, FsAssetSource};
pub use config::SyncConfig;
pub use error::{AssetError, ConfigError, MetadataError, RemoteError, SessionError, UpsertError};
pub use hierarchy::{HierarchyCache, HierarchyStats};
pub use identity::IdentityResolver;
pub use links::LinkPassReport;
pub use metadata::{InMemoryMetadata, MetadataStore};
pub use model::{
    AssetRecord, LinkRecord, PageRef, Provenance, RemoteCollection, RemoteFolder, RemotePage,
    RenderedDocument,
};
pub use remote::RemoteStore;
pub use session::{BatchReport, SessionStats, SyncEvent, SyncEventHandler, SyncSession};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{RemoteCall, Transport};
pub use upsert::{UpsertOutcome, UpsertStatus};
