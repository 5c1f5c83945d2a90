//! Catalog operations
//!
//! The `Catalog` is the entry point for reading and editing records. It
//! holds no copy of the data: every operation loads the record set from
//! local storage, applies the change and writes the whole set back, so a
//! merge that replaced the stored set is never overwritten by a stale
//! in-memory copy.
//!
//! Mutations return the resulting record set for the caller to hand to
//! the save scheduler.
//!
//! ## Usage
//!
//! ```ignore
//! let catalog = Catalog::open(&config)?;
//!
//! let records = catalog.add(Record::new("Yang Mi", "杨幂"))?;
//! sync.schedule_save(records);
//!
//! let favorites = catalog.favorites()?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::config::Config;
use crate::models::{Record, RecordId, RecordSet};
use crate::storage::{FileStore, LocalStore};

/// Record operations over local storage
#[derive(Clone)]
pub struct Catalog {
    local: Arc<dyn LocalStore>,
}

impl Catalog {
    /// Open the catalog in the configured data directory
    pub fn open(config: &Config) -> Result<Self> {
        let store: FileStore = config.local_store();
        Ok(Self::with_store(Arc::new(store)))
    }

    /// Use a specific local store
    pub fn with_store(local: Arc<dyn LocalStore>) -> Self {
        Self { local }
    }

    /// The underlying store, shared with the sync orchestrator
    pub fn store(&self) -> Arc<dyn LocalStore> {
        self.local.clone()
    }

    /// Load the full record set
    pub fn records(&self) -> Result<RecordSet> {
        self.local
            .load_records()
            .context("Failed to load catalog")
    }

    fn save(&self, records: &RecordSet) -> Result<()> {
        self.local
            .save_records(records)
            .context("Failed to save catalog")
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.records()?.len())
    }

    /// Get a record by id
    pub fn get(&self, id: RecordId) -> Result<Option<Record>> {
        Ok(self.records()?.get(&id).cloned())
    }

    /// All records, ordered by phonetic key
    pub fn list(&self) -> Result<Vec<Record>> {
        Ok(sorted(self.records()?.into_vec()))
    }

    /// Records carrying `tag`
    pub fn list_by_tag(&self, tag: &str) -> Result<Vec<Record>> {
        Ok(sorted(
            self.records()?
                .into_iter()
                .filter(|r| r.tags.iter().any(|t| t == tag))
                .collect(),
        ))
    }

    /// Records marked as favorite
    pub fn favorites(&self) -> Result<Vec<Record>> {
        Ok(sorted(
            self.records()?.into_iter().filter(|r| r.favorite).collect(),
        ))
    }

    /// Records matching a query on the English name, Chinese name or tags
    pub fn search(&self, query: &str) -> Result<Vec<Record>> {
        Ok(sorted(
            self.records()?
                .into_iter()
                .filter(|r| r.matches(query))
                .collect(),
        ))
    }

    /// All tags with the number of records using each, by name
    pub fn tags_with_counts(&self) -> Result<Vec<(String, usize)>> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in self.records()?.iter() {
            for tag in &record.tags {
                *counts.entry(tag.clone()).or_default() += 1;
            }
        }
        Ok(counts.into_iter().collect())
    }

    // ==================== Mutations ====================

    /// Add a new record
    ///
    /// Rejects records missing a name and records whose Chinese name, or
    /// English name ignoring case, is already in the catalog.
    pub fn add(&self, record: Record) -> Result<RecordSet> {
        validate(&record)?;
        let mut records = self.records()?;

        if records.contains(&record.id) {
            bail!("A record with id {} already exists", record.id);
        }
        if let Some(existing) = find_duplicate(&records, &record, None) {
            bail!(
                "Record already exists: {} ({})",
                existing.english,
                existing.chinese
            );
        }

        debug!(id = %record.id, "Adding record");
        records.insert(record);
        self.save(&records)?;
        Ok(records)
    }

    /// Replace an existing record
    ///
    /// The favorite flag is kept from the stored copy and the record is
    /// stamped as modified.
    pub fn update(&self, mut record: Record) -> Result<RecordSet> {
        validate(&record)?;
        let mut records = self.records()?;

        let Some(existing) = records.get(&record.id) else {
            bail!("Record not found: {}", record.id);
        };
        if let Some(other) = find_duplicate(&records, &record, Some(record.id)) {
            bail!(
                "Another record already uses this name: {} ({})",
                other.english,
                other.chinese
            );
        }

        record.favorite = existing.favorite;
        record.touch();
        debug!(id = %record.id, "Updating record");
        records.insert(record);
        self.save(&records)?;
        Ok(records)
    }

    /// Flip the favorite flag, returning the new value
    pub fn toggle_favorite(&self, id: RecordId) -> Result<(bool, RecordSet)> {
        let mut records = self.records()?;
        let Some(record) = records.get_mut(&id) else {
            bail!("Record not found: {}", id);
        };
        record.toggle_favorite();
        let favorite = record.favorite;

        self.save(&records)?;
        Ok((favorite, records))
    }

    /// Delete a record, returning it with the remaining set
    pub fn remove(&self, id: RecordId) -> Result<(Record, RecordSet)> {
        let mut records = self.records()?;
        let Some(removed) = records.remove(&id) else {
            bail!("Record not found: {}", id);
        };

        debug!(%id, "Removing record");
        self.save(&records)?;
        Ok((removed, records))
    }

    /// Replace the whole catalog
    pub fn replace_all(&self, records: RecordSet) -> Result<RecordSet> {
        debug!(count = records.len(), "Replacing catalog");
        self.save(&records)?;
        Ok(records)
    }

    /// Delete every record
    pub fn clear(&self) -> Result<RecordSet> {
        self.replace_all(RecordSet::new())
    }
}

fn validate(record: &Record) -> Result<()> {
    if record.english.trim().is_empty() || record.chinese.trim().is_empty() {
        bail!("Both the English and the Chinese name are required");
    }
    Ok(())
}

/// A record other than `exclude` with the same Chinese name or the same
/// English name ignoring case
fn find_duplicate<'a>(
    records: &'a RecordSet,
    candidate: &Record,
    exclude: Option<RecordId>,
) -> Option<&'a Record> {
    let english = candidate.english.to_lowercase();
    records.iter().find(|r| {
        Some(r.id) != exclude
            && (r.chinese == candidate.chinese || r.english.to_lowercase() == english)
    })
}

fn sorted(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by(|a, b| {
        a.phonetic_key
            .cmp(&b.phonetic_key)
            .then_with(|| a.chinese.cmp(&b.chinese))
            .then_with(|| a.id.cmp(&b.id))
    });
    records
}
