use std::collections::BTreeSet;

use capsync_core::{LinkReport, MetadataRelations, SyncError, TagKey};
use capsync_storage::EntityStore;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PairedTags {
    pub keys: Vec<TagKey>,
    /// Entries of the longer list that had no partner.
    pub dropped: usize,
}

/// Pairs tag names with their categories by position. Only the common prefix
/// is kept; a missing list on either side yields no tags. Blank names are
/// skipped and the result is sorted and unique.
pub fn pair_tags(tags: Option<&[String]>, groups: Option<&[String]>) -> PairedTags {
    let (Some(tags), Some(groups)) = (tags, groups) else {
        return PairedTags::default();
    };

    let dropped = tags.len().abs_diff(groups.len());
    if dropped > 0 {
        debug!(
            tags = tags.len(),
            groups = groups.len(),
            dropped,
            "tag and tag-group lists differ in length; extra entries dropped"
        );
    }

    let keys: BTreeSet<TagKey> = tags
        .iter()
        .zip(groups)
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, category)| TagKey {
            name: name.trim().to_string(),
            category: category.trim().to_string(),
        })
        .collect();

    PairedTags {
        keys: keys.into_iter().collect(),
        dropped,
    }
}

/// Writes the coin's join rows. Only ever called with the relations returned
/// by a committed metadata upsert.
pub async fn link(
    store: &dyn EntityStore,
    relations: &MetadataRelations,
) -> Result<LinkReport, SyncError> {
    let report = store.link_relations(relations).await?;
    debug!(
        cap_id = relations.cap_id,
        inserted = report.inserted,
        existing = report.existing,
        "linked relations"
    );
    Ok(report)
}
