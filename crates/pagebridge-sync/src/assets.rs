//! Asset Deduplication Uploader
//!
//! Finds the local images embedded in rendered markup, names each one after a
//! hash of its bytes, rewrites the markup to point at that name, and uploads
//! every name at most once.
//!
//! ```text
//! <img src="app://x/vault/pics/map.png?123">      local, kept
//! <img src="https://cdn.example/map.png">         web, ignored
//! <img src="data:image/png;base64,...">           inline, ignored
//!
//! pics/map.png  ──hash──►  map_1f0c3e5a9b7d2468.png
//! ```
//!
//! The same bytes always produce the same name, so re-uploading unchanged
//! content is a no-op, and a queue drain skips names the remote already lists.

use crate::error::AssetError;
use crate::model::AssetRecord;
use crate::remote::RemoteStore;
use crate::transport::RemoteCall;
use percent_encoding::percent_decode_str;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "gif", "bmp", "png", "svg", "webp"];

/// Seed mixed into every content hash.
pub const HASH_SEED: u64 = 0x7061_6765_6272_6467;

static IMG_SRC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("static regex")
});

// ============================================================================
// Hashing and naming
// ============================================================================

/// 64-bit seeded content hash as 16 lowercase hex digits.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(HASH_SEED.to_le_bytes());
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    format!("{:016x}", u64::from_be_bytes(word))
}

/// `basename_hash.ext` for a vault path.
pub fn derive_remote_name(local_path: &str, hash: &str) -> Option<String> {
    let file = local_path.rsplit('/').next()?;
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(format!("{stem}_{hash}.{ext}"))
}

pub fn is_allowed_extension(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

fn percent_decoded(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

// ============================================================================
// Extraction
// ============================================================================

/// An embedded image whose source is a local resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// `src` exactly as it appears in the markup
    pub src: String,
    pub vault_path: String,
}

pub fn extract_image_refs(markup: &str, vault_root: Option<&str>) -> Vec<ImageRef> {
    let mut seen = HashSet::new();
    IMG_SRC
        .captures_iter(markup)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().to_string())
        .filter(|src| seen.insert(src.clone()))
        .filter_map(|src| {
            let vault_path = local_resource_path(&src, vault_root)?;
            Some(ImageRef { src, vault_path })
        })
        .collect()
}

/// Replace the `src` value of every `<img>` listed in `targets`, leaving the
/// rest of each tag as written.
fn rewrite_sources(markup: &str, targets: &HashMap<String, String>) -> String {
    if targets.is_empty() {
        return markup.to_string();
    }
    IMG_SRC
        .replace_all(markup, |caps: &Captures<'_>| {
            let whole = &caps[0];
            let Some(value) = caps.get(1).or_else(|| caps.get(2)) else {
                return whole.to_string();
            };
            let Some(target) = targets.get(value.as_str()) else {
                return whole.to_string();
            };
            let start = caps.get(0).map_or(0, |m| m.start());
            let (before, rest) = whole.split_at(value.start() - start);
            format!("{before}{target}{}", &rest[value.len()..])
        })
        .into_owned()
}

/// Vault-relative path behind a local resource locator, or `None` for web
/// URLs, inline data and other schemes.
pub fn local_resource_path(src: &str, vault_root: Option<&str>) -> Option<String> {
    let lower = src.trim().to_ascii_lowercase();
    if lower.starts_with("http://")
        || lower.starts_with("https://")
        || lower.starts_with("data:")
        || lower.starts_with("//")
    {
        return None;
    }

    let without_query = src.trim().split(['?', '#']).next().unwrap_or_default();
    let raw = match without_query.split_once("://") {
        // scheme://host/path: drop scheme and host
        Some((_, rest)) => rest.find('/').map(|i| &rest[i..]).unwrap_or(""),
        None if has_scheme(without_query) => return None,
        None => without_query,
    };

    let mut path = percent_decoded(raw).replace('\\', "/");
    if let Some(root) = vault_root {
        let root = root.replace('\\', "/");
        let root = root.trim_end_matches('/');
        let candidates = [root.to_string(), format!("/{}", root.trim_start_matches('/'))];
        for candidate in candidates {
            if let Some(rest) = path.strip_prefix(&format!("{candidate}/")) {
                path = rest.to_string();
                break;
            }
        }
    }

    let path = path.trim_start_matches("./").trim_start_matches('/');
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

fn has_scheme(s: &str) -> bool {
    match s.split_once(':') {
        // `C:/...` is a drive letter, not a scheme
        Some((scheme, _)) => {
            scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+')
        }
        None => false,
    }
}

// ============================================================================
// Local bytes
// ============================================================================

/// Resolves a vault-relative path to its bytes.
#[async_trait::async_trait]
pub trait AssetSource: Send + Sync {
    async fn load(&self, vault_path: &str) -> Option<Vec<u8>>;
}

/// Reads assets from a vault directory on disk.
pub struct FsAssetSource {
    root: PathBuf,
}

impl FsAssetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl AssetSource for FsAssetSource {
    async fn load(&self, vault_path: &str) -> Option<Vec<u8>> {
        let relative = Path::new(vault_path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            warn!(path = vault_path, "refusing asset path outside the vault");
            return None;
        }
        tokio::fs::read(self.root.join(relative)).await.ok()
    }
}

// ============================================================================
// Uploader
// ============================================================================

/// Markup with local image sources rewritten to their remote names.
#[derive(Debug, Clone, Default)]
pub struct PreparedContent {
    pub content: String,
    pub assets: Vec<AssetRecord>,
    /// Referenced paths that could not be loaded
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetReport {
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct FileListing {
    #[serde(default)]
    files: Vec<String>,
}

enum Transfer {
    Uploaded,
    AlreadyRemote,
}

pub struct AssetUploader {
    upload_dir: String,
    vault_root: Option<String>,
    queue: VecDeque<AssetRecord>,
    /// Percent-decoded remote paths known to exist
    remote_index: HashSet<String>,
}

impl AssetUploader {
    pub fn new(upload_dir: impl Into<String>, vault_root: Option<String>) -> Self {
        Self {
            upload_dir: upload_dir.into().trim_end_matches('/').to_string(),
            vault_root,
            queue: VecDeque::new(),
            remote_index: HashSet::new(),
        }
    }

    /// Fetch the remote asset listing. On failure the index stays empty and
    /// every queued asset is transferred.
    pub async fn load_remote_index(&mut self, store: &RemoteStore) -> usize {
        let listing = store
            .call(RemoteCall::ListFiles {
                path: self.upload_dir.clone(),
            })
            .await
            .and_then(|value| {
                serde_json::from_value::<FileListing>(value)
                    .map_err(|e| crate::error::RemoteError::schema("list-files", e))
            });
        match listing {
            Ok(listing) => {
                for entry in listing.files {
                    let decoded = percent_decoded(&entry);
                    let full = if decoded.contains('/') {
                        decoded
                    } else {
                        format!("{}/{}", self.upload_dir, decoded)
                    };
                    self.remote_index.insert(full);
                }
            }
            Err(e) => warn!(error = %e, "asset listing failed; assuming none uploaded"),
        }
        debug!(count = self.remote_index.len(), "remote asset index loaded");
        self.remote_index.len()
    }

    /// Rewrite local image sources in `markup`. Nothing is queued here; the
    /// caller enqueues `assets` once the page write has succeeded.
    pub async fn prepare(&self, markup: &str, source: &dyn AssetSource) -> PreparedContent {
        let mut prepared = PreparedContent::default();
        let mut targets: HashMap<String, String> = HashMap::new();

        for image in extract_image_refs(markup, self.vault_root.as_deref()) {
            if !is_allowed_extension(&image.vault_path) {
                debug!(path = %image.vault_path, "skipping non-image resource");
                continue;
            }
            let Some(bytes) = source.load(&image.vault_path).await else {
                warn!(path = %image.vault_path, "embedded image not found");
                prepared.missing.push(image.vault_path);
                continue;
            };
            let hash = content_hash(&bytes);
            let Some(derived_name) = derive_remote_name(&image.vault_path, &hash) else {
                continue;
            };
            let record = AssetRecord {
                local_path: image.vault_path,
                content_hash: hash,
                derived_name,
                upload_dir: self.upload_dir.clone(),
            };
            targets.insert(image.src, record.upload_path());
            prepared.assets.push(record);
        }

        prepared.content = rewrite_sources(markup, &targets);
        prepared
    }

    pub fn enqueue(&mut self, record: AssetRecord) {
        self.queue.push_back(record);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_remote(&self, record: &AssetRecord) -> bool {
        self.remote_index
            .contains(&percent_decoded(&record.upload_path()))
    }

    /// Transfer queued assets one at a time. After each attempt every queued
    /// entry with the same remote path is dropped, so a batch never sends the
    /// same content twice. Failures are reported, not raised.
    pub async fn drain(&mut self, store: &RemoteStore, source: &dyn AssetSource) -> AssetReport {
        let mut report = AssetReport::default();

        while let Some(record) = self.queue.pop_front() {
            let target = record.upload_path();
            match self.transfer(&record, store, source).await {
                Ok(Transfer::Uploaded) => {
                    info!(path = %target, "uploaded asset");
                    report.uploaded.push(target.clone());
                }
                Ok(Transfer::AlreadyRemote) => {
                    debug!(path = %target, "asset already on remote");
                    report.skipped.push(target.clone());
                }
                Err(e) => {
                    warn!(path = %target, error = %e, "asset upload failed");
                    report.failed.push((target.clone(), e.to_string()));
                }
            }
            self.queue.retain(|queued| queued.upload_path() != target);
        }

        report
    }

    async fn transfer(
        &mut self,
        record: &AssetRecord,
        store: &RemoteStore,
        source: &dyn AssetSource,
    ) -> Result<Transfer, AssetError> {
        if self.is_remote(record) {
            return Ok(Transfer::AlreadyRemote);
        }
        let bytes = source
            .load(&record.local_path)
            .await
            .ok_or_else(|| AssetError::NotFound(record.local_path.clone()))?;

        store
            .call(RemoteCall::Upload {
                path: record.upload_dir.clone(),
                filename: record.derived_name.clone(),
                bytes,
                overwrite: true,
            })
            .await
            .map_err(|source| AssetError::Upload {
                path: record.upload_path(),
                source,
            })?;

        self.remote_index
            .insert(percent_decoded(&record.upload_path()));
        Ok(Transfer::Uploaded)
    }
}
