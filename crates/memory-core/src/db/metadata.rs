// ============================================================================
// Metadata Store: id -> MemoryRecord table with owner and vector-id indexes
// ============================================================================

use redb::{ReadableTable, ReadableTableMetadata};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

use super::{MemoryDb, OWNER_INDEX, RECORDS, VECTOR_IDS};
use crate::error::{MemoryError, Result};
use crate::id::IdGenerator;
use crate::memory::types::{MemoryRecord, NewMemory};

/// How many fresh ids to try before giving up on a write
pub const MAX_ID_ATTEMPTS: u32 = 5;

/// Separator inside owner-index keys
const SEP: char = '\u{1f}';

fn owner_key(record: &MemoryRecord) -> String {
    format!("{}{SEP}{}{SEP}{:020}", record.owner, record.sender, record.id)
}

/// Half-open key range covering every entry of `owner`
fn owner_range(owner: &str) -> (String, String) {
    (format!("{}{SEP}", owner), format!("{}\u{20}", owner))
}

/// Owner and sender must not contain the separator, or one owner's key
/// range would cover another's
fn check_key_part(field: &str, value: &str) -> Result<()> {
    if value.contains(SEP) {
        return Err(MemoryError::InvalidKey(format!(
            "{} {:?} contains the reserved \\u{{1f}} separator",
            field, value
        )));
    }
    Ok(())
}

/// Summary counts for the metadata table
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetadataStats {
    pub total_records: u64,
    pub owners: BTreeSet<String>,
}

/// Durable record table; every call runs in its own redb transaction
#[derive(Clone)]
pub struct MetadataStore {
    db: MemoryDb,
}

impl MetadataStore {
    pub fn new(db: MemoryDb) -> Self {
        Self { db }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert `record`, failing with `IdCollision` if its id or vector id is taken
    pub fn insert(&self, record: &MemoryRecord) -> Result<()> {
        check_key_part("owner", &record.owner)?;
        check_key_part("sender", &record.sender)?;
        let value = bincode::serialize(record)?;

        let write_txn = self.db.database().begin_write()?;
        {
            let mut records = write_txn.open_table(RECORDS)?;
            let mut vector_ids = write_txn.open_table(VECTOR_IDS)?;
            let mut owners = write_txn.open_table(OWNER_INDEX)?;

            if records.get(record.id)?.is_some() {
                return Err(MemoryError::IdCollision(record.id));
            }
            if vector_ids.get(record.vector_id)?.is_some() {
                return Err(MemoryError::IdCollision(record.vector_id));
            }

            records.insert(record.id, value.as_slice())?;
            vector_ids.insert(record.vector_id, record.id)?;
            owners.insert(owner_key(record).as_str(), record.id)?;
        }
        write_txn.commit()?;

        debug!("Stored record {} for owner {}", record.id, record.owner);
        Ok(())
    }

    /// Allocate an id and insert, retrying with a fresh id on collision
    pub fn insert_new(&self, draft: NewMemory, ids: &IdGenerator) -> Result<MemoryRecord> {
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let record = draft.clone().into_record(ids.next_id());
            match self.insert(&record) {
                Ok(()) => return Ok(record),
                Err(MemoryError::IdCollision(id)) => {
                    warn!("Id {} collided (attempt {}), retrying", id, attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Err(MemoryError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    /// Remove every record of `owner`; returns their vector ids
    pub fn delete_by_owner(&self, owner: &str) -> Result<HashSet<u64>> {
        let (start, end) = owner_range(owner);

        let write_txn = self.db.database().begin_write()?;
        let mut removed = HashSet::new();
        {
            let mut records = write_txn.open_table(RECORDS)?;
            let mut vector_ids = write_txn.open_table(VECTOR_IDS)?;
            let mut owners = write_txn.open_table(OWNER_INDEX)?;

            let mut entries = Vec::new();
            for entry in owners.range::<&str>(start.as_str()..end.as_str())? {
                let (key, id) = entry?;
                entries.push((key.value().to_string(), id.value()));
            }

            for (key, id) in entries {
                owners.remove(key.as_str())?;
                let record = match records.remove(id)? {
                    Some(raw) => Some(bincode::deserialize::<MemoryRecord>(raw.value())?),
                    None => None,
                };
                if let Some(record) = record {
                    vector_ids.remove(record.vector_id)?;
                    removed.insert(record.vector_id);
                }
            }
        }
        write_txn.commit()?;

        info!("Deleted {} records for owner {}", removed.len(), owner);
        Ok(removed)
    }

    /// Remove specific records (used to undo a half-finished save)
    pub fn delete_ids(&self, ids: &[u64]) -> Result<usize> {
        let write_txn = self.db.database().begin_write()?;
        let mut deleted = 0;
        {
            let mut records = write_txn.open_table(RECORDS)?;
            let mut vector_ids = write_txn.open_table(VECTOR_IDS)?;
            let mut owners = write_txn.open_table(OWNER_INDEX)?;

            for id in ids {
                let record = match records.remove(*id)? {
                    Some(raw) => Some(bincode::deserialize::<MemoryRecord>(raw.value())?),
                    None => None,
                };
                if let Some(record) = record {
                    vector_ids.remove(record.vector_id)?;
                    owners.remove(owner_key(&record).as_str())?;
                    deleted += 1;
                }
            }
        }
        write_txn.commit()?;
        Ok(deleted)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, id: u64) -> Result<Option<MemoryRecord>> {
        let read_txn = self.db.database().begin_read()?;
        let records = read_txn.open_table(RECORDS)?;

        match records.get(id)? {
            Some(raw) => Ok(Some(bincode::deserialize(raw.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_by_vector_id(&self, vector_id: u64) -> Result<Option<MemoryRecord>> {
        let read_txn = self.db.database().begin_read()?;
        let vector_ids = read_txn.open_table(VECTOR_IDS)?;
        let records = read_txn.open_table(RECORDS)?;

        let id = match vector_ids.get(vector_id)? {
            Some(id) => id.value(),
            None => return Ok(None),
        };
        match records.get(id)? {
            Some(raw) => Ok(Some(bincode::deserialize(raw.value())?)),
            None => Ok(None),
        }
    }

    /// Every record of `owner`, newest first
    pub fn records_by_owner(&self, owner: &str) -> Result<Vec<MemoryRecord>> {
        let (start, end) = owner_range(owner);

        let read_txn = self.db.database().begin_read()?;
        let owners = read_txn.open_table(OWNER_INDEX)?;
        let records = read_txn.open_table(RECORDS)?;

        let mut results = Vec::new();
        for entry in owners.range::<&str>(start.as_str()..end.as_str())? {
            let (_key, id) = entry?;
            if let Some(raw) = records.get(id.value())? {
                results.push(bincode::deserialize::<MemoryRecord>(raw.value())?);
            }
        }
        sort_newest_first(&mut results);
        Ok(results)
    }

    /// One page (1-based) of an owner's texts. Pages are cut newest-first but
    /// each page is returned oldest-first for display.
    pub fn page_by_owner(&self, owner: &str, page_num: usize, page_size: usize) -> Result<Vec<String>> {
        if page_num == 0 || page_size == 0 {
            return Ok(Vec::new());
        }
        let offset = (page_num - 1) * page_size;
        let mut page: Vec<String> = self
            .records_by_owner(owner)?
            .into_iter()
            .skip(offset)
            .take(page_size)
            .map(|r| r.text)
            .collect();
        page.reverse();
        Ok(page)
    }

    pub fn all_records(&self) -> Result<Vec<MemoryRecord>> {
        let read_txn = self.db.database().begin_read()?;
        let records = read_txn.open_table(RECORDS)?;

        let mut results = Vec::new();
        for entry in records.range::<u64>(..)? {
            let (_id, raw) = entry?;
            results.push(bincode::deserialize::<MemoryRecord>(raw.value())?);
        }
        Ok(results)
    }

    pub fn count(&self) -> Result<u64> {
        let read_txn = self.db.database().begin_read()?;
        let records = read_txn.open_table(RECORDS)?;
        Ok(records.len()?)
    }

    pub fn stats(&self) -> Result<MetadataStats> {
        let read_txn = self.db.database().begin_read()?;
        let records = read_txn.open_table(RECORDS)?;
        let owners = read_txn.open_table(OWNER_INDEX)?;

        let mut stats = MetadataStats {
            total_records: records.len()?,
            owners: BTreeSet::new(),
        };
        for entry in owners.range::<&str>(..)? {
            let (key, _id) = entry?;
            if let Some(owner) = key.value().split(SEP).next() {
                stats.owners.insert(owner.to_string());
            }
        }
        Ok(stats)
    }
}

fn sort_newest_first(records: &mut [MemoryRecord]) {
    records.sort_by(|a, b| {
        b.timestamp
            .total_cmp(&a.timestamp)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::keywords::extract_keywords;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = MemoryDb::open(&dir.path().join("meta.redb")).unwrap();
        (dir, MetadataStore::new(db))
    }

    fn draft(owner: &str, sender: &str, text: &str, timestamp: f64) -> NewMemory {
        NewMemory {
            text: text.to_string(),
            sender: sender.to_string(),
            owner: owner.to_string(),
            timestamp,
            importance: 3,
            keywords: extract_keywords(text),
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let (_dir, store) = store();
        let ids = IdGenerator::new(1, 1);
        let record = store.insert_new(draft("R", "alan", "hello", 1.0), &ids).unwrap();

        assert_eq!(store.get(record.id).unwrap(), Some(record.clone()));
        assert_eq!(store.get_by_vector_id(record.vector_id).unwrap(), Some(record));
        assert_eq!(store.get_by_vector_id(12345).unwrap(), None);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (_dir, store) = store();
        let record = draft("R", "alan", "hello", 1.0).into_record(42);
        store.insert(&record).unwrap();
        assert!(matches!(store.insert(&record), Err(MemoryError::IdCollision(42))));
    }

    #[test]
    fn test_delete_by_owner_only_touches_owner() {
        let (_dir, store) = store();
        let ids = IdGenerator::new(1, 1);
        let a1 = store.insert_new(draft("A", "s", "one", 1.0), &ids).unwrap();
        let a2 = store.insert_new(draft("A", "t", "two", 2.0), &ids).unwrap();
        let b = store.insert_new(draft("B", "s", "three", 3.0), &ids).unwrap();
        // Owner whose name extends "A" must survive
        let ab = store.insert_new(draft("AB", "s", "four", 4.0), &ids).unwrap();

        let removed = store.delete_by_owner("A").unwrap();
        assert_eq!(removed, HashSet::from([a1.vector_id, a2.vector_id]));
        assert_eq!(store.count().unwrap(), 2);
        assert!(store.get(b.id).unwrap().is_some());
        assert!(store.get(ab.id).unwrap().is_some());
        assert!(store.get_by_vector_id(a1.vector_id).unwrap().is_none());
        assert!(store.delete_by_owner("A").unwrap().is_empty());
    }

    #[test]
    fn test_separator_in_owner_rejected() {
        let (_dir, store) = store();
        let ids = IdGenerator::new(1, 1);
        let a = store.insert_new(draft("A", "s", "one", 1.0), &ids).unwrap();

        assert!(matches!(
            store.insert_new(draft("A\u{1f}B", "s", "two", 2.0), &ids),
            Err(MemoryError::InvalidKey(_))
        ));
        assert!(matches!(
            store.insert_new(draft("B", "s\u{1f}t", "three", 3.0), &ids),
            Err(MemoryError::InvalidKey(_))
        ));

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.delete_by_owner("A").unwrap(), HashSet::from([a.vector_id]));
        assert!(store.stats().unwrap().owners.is_empty());
    }

    #[test]
    fn test_insert_new_retries_on_collision() {
        fn frozen() -> u64 {
            crate::id::EPOCH_MS + 1_000
        }
        let (_dir, store) = store();
        let ids = IdGenerator::with_clock(1, 1, frozen);

        // With the clock frozen the next id is the current one plus one
        let next = ids.next_id() + 1;
        store.insert(&draft("R", "alan", "squatter", 1.0).into_record(next)).unwrap();

        let record = store.insert_new(draft("R", "alan", "hello", 2.0), &ids).unwrap();
        assert_eq!(record.id, next + 1);
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.get(record.id).unwrap().map(|r| r.text), Some("hello".to_string()));
    }

    #[test]
    fn test_page_by_owner_order() {
        let (_dir, store) = store();
        let ids = IdGenerator::new(1, 1);
        for (i, text) in ["t1", "t2", "t3", "t4", "t5"].iter().enumerate() {
            store.insert_new(draft("R", "alan", text, i as f64), &ids).unwrap();
        }
        store.insert_new(draft("Q", "alan", "other", 10.0), &ids).unwrap();

        // Newest page first, displayed oldest-first
        assert_eq!(store.page_by_owner("R", 1, 2).unwrap(), vec!["t4", "t5"]);
        assert_eq!(store.page_by_owner("R", 2, 2).unwrap(), vec!["t2", "t3"]);
        assert_eq!(store.page_by_owner("R", 3, 2).unwrap(), vec!["t1"]);
        assert!(store.page_by_owner("R", 4, 2).unwrap().is_empty());
        assert!(store.page_by_owner("R", 0, 2).unwrap().is_empty());
    }

    #[test]
    fn test_delete_ids() {
        let (_dir, store) = store();
        let ids = IdGenerator::new(1, 1);
        let r = store.insert_new(draft("R", "alan", "x", 1.0), &ids).unwrap();
        assert_eq!(store.delete_ids(&[r.id, 999]).unwrap(), 1);
        assert!(store.records_by_owner("R").unwrap().is_empty());
    }

    #[test]
    fn test_stats_lists_owners() {
        let (_dir, store) = store();
        let ids = IdGenerator::new(1, 1);
        store.insert_new(draft("R", "alan", "x", 1.0), &ids).unwrap();
        store.insert_new(draft("Q", "bob", "y", 1.0), &ids).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.owners.into_iter().collect::<Vec<_>>(), vec!["Q", "R"]);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let (_dir, store) = store();
        let ids = Arc::new(IdGenerator::new(1, 1));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                let ids = ids.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let r = store
                            .insert_new(draft("R", "alan", &format!("{}-{}", t, i), i as f64), &ids)
                            .unwrap();
                        assert!(store.get_by_vector_id(r.vector_id).unwrap().is_some());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.count().unwrap(), 100);
    }
}
