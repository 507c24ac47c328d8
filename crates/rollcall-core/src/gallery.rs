//! In-memory index of enrolled identities.

use crate::types::{Embedding, Identity, IdentityRecord};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("identity already enrolled: {0}")]
    DuplicateIdentity(String),
}

/// Counts reported by [`GalleryStore::load`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub missing_embedding: usize,
    pub invalid_embedding: usize,
    pub duplicates: usize,
}

/// Enrolled identities, keyed by display name.
///
/// Entries live in a vector; `by_name` maps each display name to its slot.
/// Callers must not rely on the order of [`all`](Self::all).
#[derive(Debug, Default, Clone)]
pub struct GalleryStore {
    entries: Vec<Identity>,
    by_name: HashMap<String, usize>,
}

impl GalleryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole index with `records`.
    ///
    /// Records without usable face data are skipped. When a display name
    /// appears more than once, the first occurrence wins.
    pub fn load(&mut self, records: impl IntoIterator<Item = IdentityRecord>) -> LoadSummary {
        self.entries.clear();
        self.by_name.clear();

        let mut summary = LoadSummary::default();
        for record in records {
            let Some(values) = record.embedding else {
                summary.missing_embedding += 1;
                continue;
            };
            let embedding = match Embedding::from_values(values) {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(
                        name = %record.display_name,
                        error = %err,
                        "skipping identity with unusable embedding"
                    );
                    summary.invalid_embedding += 1;
                    continue;
                }
            };
            if self.by_name.contains_key(&record.display_name) {
                tracing::debug!(name = %record.display_name, "duplicate identity ignored on load");
                summary.duplicates += 1;
                continue;
            }
            self.insert(Identity {
                display_name: record.display_name,
                external_id: record.external_id,
                embedding,
                enrolled_at: record.enrolled_at,
                record_id: record.record_id,
            });
            summary.loaded += 1;
        }

        tracing::info!(
            loaded = summary.loaded,
            missing_embedding = summary.missing_embedding,
            invalid_embedding = summary.invalid_embedding,
            duplicates = summary.duplicates,
            "gallery loaded"
        );
        summary
    }

    /// Add a new identity. Fails without touching the index if the display
    /// name is already present.
    pub fn enroll(&mut self, identity: Identity) -> Result<(), GalleryError> {
        if self.contains(&identity.display_name) {
            return Err(GalleryError::DuplicateIdentity(identity.display_name));
        }
        self.insert(identity);
        Ok(())
    }

    /// Remove the identity with `record_id`, if any.
    pub fn remove(&mut self, record_id: i64) -> Option<Identity> {
        let idx = self.entries.iter().position(|e| e.record_id == record_id)?;
        let removed = self.entries.swap_remove(idx);
        self.by_name.remove(&removed.display_name);
        if let Some(moved) = self.entries.get(idx) {
            self.by_name.insert(moved.display_name.clone(), idx);
        }
        Some(removed)
    }

    pub fn all(&self) -> &[Identity] {
        &self.entries
    }

    pub fn get(&self, display_name: &str) -> Option<&Identity> {
        self.by_name.get(display_name).map(|&idx| &self.entries[idx])
    }

    pub fn contains(&self, display_name: &str) -> bool {
        self.by_name.contains_key(display_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, identity: Identity) {
        self.by_name.insert(identity.display_name.clone(), self.entries.len());
        self.entries.push(identity);
    }
}
