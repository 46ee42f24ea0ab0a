//! Identity Resolver
//!
//! Issues the stable identifier each local document carries in its metadata.
//! Uniqueness is checked against what this session knows: ids issued so far,
//! ids found in local metadata, and whatever the caller supplies. The remote
//! side is never consulted.

use crate::error::MetadataError;
use crate::metadata::MetadataStore;
use rand::rngs::OsRng;
use rand::Rng;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const ID_LENGTH: usize = 16;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub struct IdentityResolver {
    metadata: Arc<dyn MetadataStore>,
    field: String,
    issued: HashSet<String>,
    /// Ids present in local metadata; scanned on first use
    known: Option<HashSet<String>>,
}

impl IdentityResolver {
    pub fn new(metadata: Arc<dyn MetadataStore>, field: impl Into<String>) -> Self {
        Self {
            metadata,
            field: field.into(),
            issued: HashSet::new(),
            known: None,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Draw a fresh id, retrying until it collides with nothing known.
    pub fn generate_id(&mut self, supplementary: &HashSet<String>) -> String {
        loop {
            let candidate = random_id();
            if !self.id_exists(&candidate, supplementary) {
                self.issued.insert(candidate.clone());
                return candidate;
            }
            debug!(candidate, "identifier collision; drawing again");
        }
    }

    /// Whether `id` is already taken as far as this session knows.
    pub fn id_exists(&mut self, id: &str, supplementary: &HashSet<String>) -> bool {
        if self.issued.contains(id) {
            return true;
        }
        let known = self.known_ids();
        known.extend(supplementary.iter().cloned());
        known.contains(id)
    }

    /// The document's identifier, assigning one if it has none. An existing
    /// identifier is returned as is and never replaced.
    pub fn ensure_identity(&mut self, document: &str) -> Result<String, MetadataError> {
        if let Some(existing) = self.metadata.get_str(document, &self.field) {
            return Ok(existing);
        }
        let id = self.generate_id(&HashSet::new());
        self.metadata
            .set(document, &self.field, Value::String(id.clone()))?;
        self.known_ids().insert(id.clone());
        debug!(document, id, "assigned document identity");
        Ok(id)
    }

    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }

    fn known_ids(&mut self) -> &mut HashSet<String> {
        let metadata = &self.metadata;
        let field = &self.field;
        self.known.get_or_insert_with(|| {
            let ids: HashSet<String> = metadata
                .documents()
                .iter()
                .filter_map(|doc| metadata.get_str(doc, field))
                .collect();
            debug!(count = ids.len(), "scanned local identities");
            ids
        })
    }
}

/// `true` for strings of [`ID_LENGTH`] characters from the id alphabet.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LENGTH && id.bytes().all(|b| ALPHABET.contains(&b))
}

fn random_id() -> String {
    let mut rng = OsRng;
    (0..ID_LENGTH)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InMemoryMetadata;
    use proptest::prelude::*;
    use serde_json::json;

    fn resolver_with(docs: &[(&str, Option<&str>)]) -> (IdentityResolver, Arc<InMemoryMetadata>) {
        let metadata = Arc::new(InMemoryMetadata::new());
        for (doc, id) in docs {
            metadata.add_document(doc);
            if let Some(id) = id {
                metadata.set(doc, "pagebridge-id", json!(id)).unwrap();
            }
        }
        (IdentityResolver::new(metadata.clone(), "pagebridge-id"), metadata)
    }

    #[test]
    fn test_existing_identity_is_never_regenerated() {
        let (mut resolver, _) = resolver_with(&[("a.md", Some("AAAAAAAAAAAAAAAA"))]);
        assert_eq!(resolver.ensure_identity("a.md").unwrap(), "AAAAAAAAAAAAAAAA");
        assert_eq!(resolver.ensure_identity("a.md").unwrap(), "AAAAAAAAAAAAAAAA");
        assert_eq!(resolver.issued_count(), 0);
    }

    #[test]
    fn test_missing_identity_is_written_once() {
        let (mut resolver, metadata) = resolver_with(&[("a.md", None)]);
        let id = resolver.ensure_identity("a.md").unwrap();
        assert!(is_valid_id(&id));
        assert_eq!(metadata.get_str("a.md", "pagebridge-id"), Some(id.clone()));
        assert_eq!(resolver.ensure_identity("a.md").unwrap(), id);
    }

    #[test]
    fn test_exists_covers_all_three_sources() {
        let (mut resolver, _) = resolver_with(&[("a.md", Some("LocalLocalLocal1"))]);
        let issued = resolver.generate_id(&HashSet::new());
        let supplementary: HashSet<String> = ["SuppliedSupplied".to_string()].into();

        assert!(resolver.id_exists(&issued, &HashSet::new()));
        assert!(resolver.id_exists("LocalLocalLocal1", &HashSet::new()));
        assert!(resolver.id_exists("SuppliedSupplied", &supplementary));
        assert!(!resolver.id_exists("NobodyHasThisId1", &HashSet::new()));
    }

    #[test]
    fn test_metadata_is_scanned_lazily_once() {
        let (mut resolver, metadata) = resolver_with(&[("a.md", None)]);
        assert!(!resolver.id_exists("LateLateLateLate", &HashSet::new()));
        metadata.set("a.md", "pagebridge-id", json!("LateLateLateLate")).unwrap();
        // the scan result is cached for the session
        assert!(!resolver.id_exists("LateLateLateLate", &HashSet::new()));
    }

    proptest! {
        #[test]
        fn prop_generated_ids_are_well_formed_and_distinct(n in 1usize..64) {
            let (mut resolver, _) = resolver_with(&[]);
            let ids: HashSet<String> = (0..n).map(|_| resolver.generate_id(&HashSet::new())).collect();
            prop_assert_eq!(ids.len(), n);
            prop_assert!(ids.iter().all(|id| is_valid_id(id)));
        }
    }
}
