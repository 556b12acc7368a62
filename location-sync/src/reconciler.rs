//! Merges a normalized page against the stored state of the same identities.
//!
//! Merging unions the three language maps (stored values win when both sides
//! carry the same language) and the provider tags. Both unions only ever grow
//! a record, so applying a record twice or in a different provider order
//! reaches the same stored state.

use crate::error::LocationSyncResult;
use crate::model::{CanonicalLocation, LocationId, Provider};
use crate::normalizer::search_radius_for;
use std::collections::HashMap;

/// Persistence work produced by reconciling one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub to_insert: Vec<CanonicalLocation>,
    pub to_update: Vec<CanonicalLocation>,
    pub unchanged: usize
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty()
    }
}

/// Folds `incoming` into `existing`. Returns whether `existing` changed.
pub fn merge_into(
    existing: &mut CanonicalLocation,
    incoming: &CanonicalLocation
) -> LocationSyncResult<bool> {
    let mut changed = existing.name.union_missing(&incoming.name);
    changed |= existing.locality.union_missing(&incoming.locality);
    changed |= existing.country.union_missing(&incoming.country);

    for provider in &incoming.providers {
        changed |= existing.providers.insert(provider.clone());
    }

    if changed {
        existing.search_radius_meters = search_radius_for(existing)?;
    }

    Ok(changed)
}

/// Collapses records sharing an identity within one page, keeping first-seen order.
pub fn collapse_duplicates(
    batch: Vec<CanonicalLocation>
) -> LocationSyncResult<Vec<CanonicalLocation>> {
    let mut positions: HashMap<LocationId, usize> = HashMap::with_capacity(batch.len());
    let mut collapsed: Vec<CanonicalLocation> = Vec::with_capacity(batch.len());

    for location in batch {
        match positions.get(&location.id) {
            Some(&index) => {
                merge_into(&mut collapsed[index], &location)?;
            }
            None => {
                positions.insert(location.id, collapsed.len());
                collapsed.push(location);
            }
        }
    }

    Ok(collapsed)
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    provider: Provider
}

impl Reconciler {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Decides insert vs. merge for every record of `batch`.
    ///
    /// `existing` holds the stored records whose identities appear in the
    /// batch; stored records absent from the batch are never touched.
    pub fn reconcile(
        &self,
        batch: Vec<CanonicalLocation>,
        mut existing: HashMap<LocationId, CanonicalLocation>
    ) -> LocationSyncResult<ChangeSet> {
        let mut changes = ChangeSet::default();

        for mut incoming in collapse_duplicates(batch)? {
            incoming.providers.insert(self.provider.clone());

            match existing.remove(&incoming.id) {
                None => changes.to_insert.push(incoming),
                Some(mut stored) => {
                    if merge_into(&mut stored, &incoming)? {
                        changes.to_update.push(stored);
                    } else {
                        changes.unchanged += 1;
                    }
                }
            }
        }

        Ok(changes)
    }
}
