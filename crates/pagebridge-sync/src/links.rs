//! Link Resolution Pass
//!
//! Runs after a batch, once every document has a remote page. Internal
//! references recorded in each page's link manifest are resolved against the
//! provenance of all remote pages (by source identity, then by source path,
//! then as an anchor on the same page) and rewritten in place as cross
//! references:
//!
//! ```text
//! <a href="Other Note#Part Two">see</a>
//!   ──►  @UUID[JournalEntry.C12.JournalEntryPage.P34#part-two]{see}
//! ```
//!
//! Every flagged page's full manifest is re-scanned on every run; the
//! per-link `resolved` flag is written but not trusted as a short-circuit.

use crate::error::RemoteError;
use crate::model::{LinkRecord, PageRef};
use crate::remote::{PageWrite, RemoteStore};
use crate::scripts::{ScannedPage, FLAG_SCOPE, SCAN_PAGES};
use crate::transport::RemoteCall;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Lowercase, spaces to hyphens, no leading or trailing hyphens.
pub fn slugify(fragment: &str) -> String {
    fragment
        .trim()
        .to_lowercase()
        .replace(' ', "-")
        .trim_matches('-')
        .to_string()
}

pub fn cross_reference(target: &PageRef, anchor: Option<&str>, text: &str) -> String {
    match anchor.filter(|a| !a.is_empty()) {
        Some(anchor) => format!(
            "@UUID[JournalEntry.{}.JournalEntryPage.{}#{}]{{{}}}",
            target.collection_id, target.page_id, anchor, text
        ),
        None => format!(
            "@UUID[JournalEntry.{}.JournalEntryPage.{}]{{{}}}",
            target.collection_id, target.page_id, text
        ),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Markup the renderer emitted for a link that carries no hidden id.
///
/// An in-page anchor link is rendered as `#fragment` even when its manifest
/// entry also records the page's own path.
pub fn original_shape(link: &LinkRecord) -> Option<String> {
    let fragment = non_empty(&link.anchor_fragment);
    let path = non_empty(&link.destination_path)
        .filter(|_| !(link.is_anchor && fragment.is_some()));
    let href = match (path, fragment) {
        (Some(path), Some(fragment)) => format!("{path}#{fragment}"),
        (Some(path), None) => path.to_string(),
        (None, Some(fragment)) => format!("#{fragment}"),
        (None, None) => return None,
    };
    Some(format!(r#"<a href="{href}">{}</a>"#, link.text))
}

/// Byte range of the element tagged with `link_id`.
fn tagged_element(content: &str, link_id: &str) -> Option<std::ops::Range<usize>> {
    let pattern = format!(
        r#"(?s)<a\b[^>]*\bdata-link-id="{}"[^>]*>.*?</a>"#,
        regex::escape(link_id)
    );
    let re = Regex::new(&pattern).ok()?;
    re.find(content).map(|m| m.range())
}

// ============================================================================
// Targets
// ============================================================================

/// Lookup tables over every remote page's provenance.
#[derive(Debug, Default)]
pub struct LinkTargets {
    by_uuid: HashMap<String, PageRef>,
    by_path: HashMap<String, PageRef>,
}

impl LinkTargets {
    pub fn from_pages(pages: &[ScannedPage]) -> Self {
        let mut targets = Self::default();
        for page in pages {
            let Some(provenance) = &page.provenance else {
                continue;
            };
            let page_ref = PageRef {
                collection_id: page.collection_id.clone(),
                page_id: page.id.clone(),
            };
            if !provenance.source_uuid.is_empty() {
                targets
                    .by_uuid
                    .entry(provenance.source_uuid.clone())
                    .or_insert_with(|| page_ref.clone());
            }
            if !provenance.source_path.is_empty() {
                targets
                    .by_path
                    .entry(provenance.source_path.clone())
                    .or_insert(page_ref);
            }
        }
        targets
    }

    fn by_path(&self, path: &str) -> Option<&PageRef> {
        self.by_path
            .get(path)
            .or_else(|| self.by_path.get(&format!("{path}.md")))
            .or_else(|| path.strip_suffix(".md").and_then(|p| self.by_path.get(p)))
    }

    /// Target page and slugified anchor for a link on page `own`.
    pub fn resolve(&self, link: &LinkRecord, own: &PageRef) -> Option<(PageRef, Option<String>)> {
        let anchor = non_empty(&link.anchor_fragment)
            .map(slugify)
            .filter(|a| !a.is_empty());
        let uuid = non_empty(&link.destination_uuid);
        let path = non_empty(&link.destination_path);

        if let Some(target) = uuid.and_then(|u| self.by_uuid.get(u)) {
            return Some((target.clone(), anchor));
        }
        if let Some(target) = path.and_then(|p| self.by_path(p)) {
            return Some((target.clone(), anchor));
        }
        if anchor.is_some() && (link.is_anchor || (uuid.is_none() && path.is_none())) {
            return Some((own.clone(), anchor));
        }
        None
    }
}

// ============================================================================
// Rewriting
// ============================================================================

#[derive(Debug, Clone)]
pub struct PageRewrite {
    pub content: String,
    pub changed: bool,
    pub resolved: usize,
    pub unresolved: usize,
}

/// Resolve and rewrite every link of one page, updating each link's
/// `resolved` flag.
pub fn rewrite_page(
    content: &str,
    links: &mut [LinkRecord],
    own: &PageRef,
    targets: &LinkTargets,
) -> PageRewrite {
    let mut content = content.to_string();
    let mut changed = false;

    for link in links.iter_mut() {
        let Some((target, anchor)) = targets.resolve(link, own) else {
            debug!(
                page = %own.page_id,
                text = %link.text,
                uuid = ?link.destination_uuid,
                path = ?link.destination_path,
                "link target not found"
            );
            link.resolved = false;
            continue;
        };
        let replacement = cross_reference(&target, anchor.as_deref(), &link.text);
        let range = link
            .link_id
            .as_deref()
            .and_then(|id| tagged_element(&content, id))
            .or_else(|| {
                let shape = original_shape(link)?;
                content.find(&shape).map(|start| start..start + shape.len())
            });
        // Resolved only once the reference is in the content
        link.resolved = match range {
            Some(range) => {
                content.replace_range(range, &replacement);
                changed = true;
                true
            }
            None => content.contains(&replacement),
        };
        if !link.resolved {
            debug!(
                page = %own.page_id,
                text = %link.text,
                "link target found but no matching markup"
            );
        }
    }

    let resolved = links.iter().filter(|l| l.resolved).count();
    PageRewrite {
        content,
        changed,
        resolved,
        unresolved: links.len() - resolved,
    }
}

// ============================================================================
// Pass
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageLinkOutcome {
    pub page_id: String,
    pub title: String,
    pub resolved: usize,
    pub unresolved: usize,
    pub persisted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkPassReport {
    /// Pages seen by the scan
    pub scanned: usize,
    pub pages: Vec<PageLinkOutcome>,
    pub failed: Vec<(String, String)>,
}

impl LinkPassReport {
    pub fn unresolved(&self) -> usize {
        self.pages.iter().map(|p| p.unresolved).sum()
    }
}

async fn scan(store: &RemoteStore) -> Result<Vec<ScannedPage>, RemoteError> {
    let value = store
        .call(RemoteCall::Execute {
            script: &SCAN_PAGES,
            args: serde_json::json!({ "flagScope": FLAG_SCOPE }),
        })
        .await?;
    SCAN_PAGES.decode(value)
}

/// Resolve links on every page whose provenance reports unresolved links,
/// persisting content and provenance together for pages that changed.
pub async fn resolve_links(store: &mut RemoteStore) -> LinkPassReport {
    let pages = match scan(store).await {
        Ok(pages) => pages,
        Err(e) => {
            warn!(error = %e, "link scan failed; skipping link resolution");
            return LinkPassReport::default();
        }
    };
    let targets = LinkTargets::from_pages(&pages);
    let mut report = LinkPassReport {
        scanned: pages.len(),
        ..Default::default()
    };

    for page in &pages {
        let Some(provenance) = &page.provenance else {
            continue;
        };
        if provenance.unresolved_count == 0 {
            continue;
        }
        let Some(content) = &page.content else {
            warn!(page = %page.id, "flagged page returned without content");
            continue;
        };

        let own = PageRef {
            collection_id: page.collection_id.clone(),
            page_id: page.id.clone(),
        };
        let mut provenance = provenance.clone();
        let rewrite = rewrite_page(content, &mut provenance.link_manifest, &own, &targets);
        let count_changed = provenance.unresolved_count != rewrite.unresolved;
        provenance.unresolved_count = rewrite.unresolved;

        let mut persisted = false;
        if rewrite.changed || count_changed {
            let write = PageWrite {
                collection_id: &page.collection_id,
                page_id: Some(&page.id),
                title: &page.name,
                content: &rewrite.content,
                provenance: &provenance,
            };
            match store.write_page(write).await {
                Ok(_) => persisted = true,
                Err(e) => {
                    warn!(page = %page.id, error = %e, "failed to persist rewritten links");
                    report.failed.push((page.id.clone(), e.to_string()));
                }
            }
        }

        report.pages.push(PageLinkOutcome {
            page_id: page.id.clone(),
            title: page.name.clone(),
            resolved: rewrite.resolved,
            unresolved: rewrite.unresolved,
            persisted,
        });
    }

    info!(
        scanned = report.scanned,
        rewritten = report.pages.iter().filter(|p| p.persisted).count(),
        unresolved = report.unresolved(),
        "link pass complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Provenance;
    use proptest::prelude::*;

    fn page(id: &str, collection: &str, uuid: &str, path: &str) -> ScannedPage {
        ScannedPage {
            id: id.to_string(),
            name: id.to_string(),
            collection_id: collection.to_string(),
            provenance: Some(Provenance {
                source_uuid: uuid.to_string(),
                source_path: path.to_string(),
                ..Default::default()
            }),
            content: None,
        }
    }

    fn link(text: &str) -> LinkRecord {
        LinkRecord {
            source_uuid: "SELF".to_string(),
            source_path: "self.md".to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Part Two"), "part-two");
        assert_eq!(slugify(" -Edge Case- "), "edge-case");
        assert_eq!(slugify("ALREADY-slug"), "already-slug");
    }

    #[test]
    fn test_resolution_order_uuid_then_path_then_anchor() {
        let targets = LinkTargets::from_pages(&[
            page("P1", "C1", "UUID-1", "notes/one.md"),
            page("P2", "C2", "UUID-2", "notes/two.md"),
        ]);
        let own = PageRef {
            collection_id: "C9".to_string(),
            page_id: "P9".to_string(),
        };

        let mut by_uuid = link("x");
        by_uuid.destination_uuid = Some("UUID-1".to_string());
        by_uuid.destination_path = Some("notes/two.md".to_string());
        assert_eq!(targets.resolve(&by_uuid, &own).unwrap().0.page_id, "P1");

        let mut by_path = link("x");
        by_path.destination_uuid = Some("UNKNOWN".to_string());
        by_path.destination_path = Some("notes/two".to_string());
        assert_eq!(targets.resolve(&by_path, &own).unwrap().0.page_id, "P2");

        let mut anchor_only = link("x");
        anchor_only.anchor_fragment = Some("Some Heading".to_string());
        let (target, anchor) = targets.resolve(&anchor_only, &own).unwrap();
        assert_eq!(target, own);
        assert_eq!(anchor.as_deref(), Some("some-heading"));

        let mut dangling = link("x");
        dangling.destination_path = Some("nowhere.md".to_string());
        dangling.anchor_fragment = Some("h".to_string());
        assert!(targets.resolve(&dangling, &own).is_none());
    }

    #[test]
    fn test_rewrite_uses_original_shapes() {
        let targets = LinkTargets::from_pages(&[page("P2", "C2", "UUID-2", "two.md")]);
        let own = PageRef {
            collection_id: "C1".to_string(),
            page_id: "P1".to_string(),
        };
        let mut links = vec![
            LinkRecord {
                destination_path: Some("two.md".to_string()),
                anchor_fragment: Some("Part Two".to_string()),
                ..link("see")
            },
            LinkRecord {
                destination_path: Some("missing.md".to_string()),
                ..link("gone")
            },
        ];
        let content = r#"<p><a href="two.md#Part Two">see</a> and <a href="missing.md">gone</a></p>"#;

        let rewrite = rewrite_page(content, &mut links, &own, &targets);

        assert!(rewrite.changed);
        assert_eq!(
            rewrite.content,
            r#"<p>@UUID[JournalEntry.C2.JournalEntryPage.P2#part-two]{see} and <a href="missing.md">gone</a></p>"#
        );
        assert_eq!((rewrite.resolved, rewrite.unresolved), (1, 1));
        assert!(links[0].resolved);
        assert!(!links[1].resolved);
    }

    #[test]
    fn test_rewrite_prefers_hidden_link_id() {
        let targets = LinkTargets::from_pages(&[page("P2", "C2", "UUID-2", "two.md")]);
        let own = PageRef {
            collection_id: "C1".to_string(),
            page_id: "P1".to_string(),
        };
        let mut links = vec![LinkRecord {
            link_id: Some("l-7".to_string()),
            destination_uuid: Some("UUID-2".to_string()),
            ..link("Two")
        }];
        let content =
            r#"<a class="internal-link" data-link-id="l-7" href="two.md">Two</a> <a href="two.md">Two</a>"#;

        let rewrite = rewrite_page(content, &mut links, &own, &targets);

        assert_eq!(
            rewrite.content,
            r#"@UUID[JournalEntry.C2.JournalEntryPage.P2]{Two} <a href="two.md">Two</a>"#
        );
    }

    #[test]
    fn test_already_rewritten_link_still_counts_as_resolved() {
        let targets = LinkTargets::from_pages(&[page("P2", "C2", "UUID-2", "two.md")]);
        let own = PageRef {
            collection_id: "C1".to_string(),
            page_id: "P1".to_string(),
        };
        let mut links = vec![LinkRecord {
            destination_uuid: Some("UUID-2".to_string()),
            destination_path: Some("two.md".to_string()),
            ..link("Two")
        }];
        let content = "@UUID[JournalEntry.C2.JournalEntryPage.P2]{Two}";

        let rewrite = rewrite_page(content, &mut links, &own, &targets);

        assert!(!rewrite.changed);
        assert_eq!(rewrite.unresolved, 0);
    }

    #[test]
    fn test_link_without_matching_markup_stays_unresolved() {
        let targets = LinkTargets::from_pages(&[page("P2", "C2", "UUID-2", "two.md")]);
        let own = PageRef {
            collection_id: "C1".to_string(),
            page_id: "P1".to_string(),
        };
        let mut links = vec![LinkRecord {
            destination_path: Some("two.md".to_string()),
            ..link("B")
        }];
        let content = r#"<a class="internal-link" href="two.md">B</a>"#;

        let rewrite = rewrite_page(content, &mut links, &own, &targets);

        assert!(!rewrite.changed);
        assert_eq!(rewrite.content, content);
        assert_eq!((rewrite.resolved, rewrite.unresolved), (0, 1));
        assert!(!links[0].resolved);
    }

    #[test]
    fn test_anchor_link_with_own_path_points_at_own_page() {
        let targets = LinkTargets::from_pages(&[page("P2", "C2", "UUID-2", "two.md")]);
        let own = PageRef {
            collection_id: "C1".to_string(),
            page_id: "P1".to_string(),
        };
        let mut links = vec![LinkRecord {
            destination_path: Some("self.md".to_string()),
            is_anchor: true,
            anchor_fragment: Some("Part Two".to_string()),
            ..link("jump")
        }];
        let content = r##"<p><a href="#Part Two">jump</a></p>"##;

        let rewrite = rewrite_page(content, &mut links, &own, &targets);

        assert_eq!(
            rewrite.content,
            "<p>@UUID[JournalEntry.C1.JournalEntryPage.P1#part-two]{jump}</p>"
        );
        assert!(links[0].resolved);
    }

    proptest! {
        #[test]
        fn prop_slugify_is_idempotent(s in "[A-Za-z0-9 -]{0,24}") {
            let once = slugify(&s);
            prop_assert_eq!(slugify(&once), once.clone());
            prop_assert!(!once.starts_with('-') && !once.ends_with('-'));
        }
    }
}
