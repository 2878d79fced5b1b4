//! ============================================================================
//! Long-Term Memory - Embedded, persisted, relevance-ranked tier
//! ============================================================================
//! Sequences the embedder, the vector index and the metadata store. All
//! methods are blocking; the driver runs them on the blocking pool.
//!
//! Write order is metadata first, then index. A failed index insert deletes
//! the metadata row again, so a record never exists without its vector. A
//! crash between the two is repaired on the next open by reconciliation. A
//! rebuild that runs between the two already picks the record up; the
//! index then ignores the second insert of that id.
//! ============================================================================

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::db::{MemoryDb, MetadataStore};
use crate::error::Result;
use crate::id::IdGenerator;
use crate::index::{IndexParams, IndexVariant, VectorIndexManager};
use crate::memory::cache::TtlCache;
use crate::memory::embeddings::Embedder;
use crate::memory::keywords::extract_keywords;
use crate::memory::scoring::ScoringEngine;
use crate::memory::types::{unix_now, MemoryRecord, NewMemory};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    text: String,
    sender: String,
    owner: String,
    limit: usize,
}

/// Snapshot of long-term tier counters
#[derive(Debug, Clone, Serialize)]
pub struct LongTermStats {
    pub index_variant: IndexVariant,
    pub vectors: usize,
    pub records: u64,
    pub owners: BTreeSet<String>,
    pub cached_records: usize,
    pub cached_queries: usize,
}

pub struct LongTermMemory {
    config: MemoryConfig,
    embedder: Arc<dyn Embedder>,
    index: VectorIndexManager,
    metadata: MetadataStore,
    ids: IdGenerator,
    scoring: ScoringEngine,
    record_cache: TtlCache<u64, MemoryRecord>,
    query_cache: TtlCache<QueryKey, Vec<String>>,
    /// Bumped by every write; a search only caches if it saw no write
    generation: AtomicU64,
}

impl LongTermMemory {
    /// Load the index snapshot next to `db` and reconcile it with the records
    pub fn open(config: &MemoryConfig, embedder: Arc<dyn Embedder>, db: MemoryDb) -> Result<Self> {
        let index = VectorIndexManager::load(
            embedder.dimension(),
            &config.index_path(),
            IndexParams::from_config(config),
        );

        let memory = Self {
            config: config.clone(),
            index,
            metadata: MetadataStore::new(db),
            ids: IdGenerator::new(config.datacenter_id, config.worker_id),
            scoring: ScoringEngine::new(config.weights, config.recency_decay),
            record_cache: TtlCache::new(config.cache_capacity, config.cache_ttl()),
            query_cache: TtlCache::new(config.cache_capacity, config.cache_ttl()),
            generation: AtomicU64::new(0),
            embedder,
        };
        memory.reconcile()?;

        info!(
            "Long-term memory ready: {} vectors ({} index, {} embeddings)",
            memory.index.len(),
            memory.index.variant(),
            memory.embedder.name()
        );
        Ok(memory)
    }

    /// Rebuild the index from the metadata rows if the two disagree
    fn reconcile(&self) -> Result<()> {
        let records = self.metadata.count()?;
        let vectors = self.index.len() as u64;
        if records == vectors {
            return Ok(());
        }

        warn!(
            "Index holds {} vectors but metadata holds {} records, rebuilding",
            vectors, records
        );
        let survivors = self.embed_records(self.metadata.all_records()?);
        self.index.rebuild(survivors)
    }

    fn embed_records(&self, records: Vec<MemoryRecord>) -> Vec<(u64, Vec<f32>)> {
        records
            .into_iter()
            .map(|r| (r.vector_id, self.embedder.embed(&r.text)))
            .collect()
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Persist one memory; the record and its vector are written together
    pub fn save(&self, draft: NewMemory) -> Result<MemoryRecord> {
        let vector = self.embedder.embed(&draft.text);
        let record = self.metadata.insert_new(draft, &self.ids)?;

        if let Err(e) = self.index.add(record.vector_id, &vector) {
            warn!("Index insert failed for {}, undoing metadata write: {}", record.id, e);
            self.metadata.delete_ids(&[record.id])?;
            return Err(e);
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.query_cache.clear();
        debug!("Saved long-term memory {} for {}/{}", record.id, record.owner, record.sender);
        Ok(record)
    }

    /// Top `limit` texts for `query` within (owner, sender). Stops joining
    /// candidates once `deadline` passes and ranks what it has.
    pub fn search(
        &self,
        query: &str,
        sender: &str,
        owner: &str,
        limit: usize,
        deadline: Instant,
    ) -> Result<Vec<String>> {
        if limit == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let key = QueryKey {
            text: query.to_string(),
            sender: sender.to_string(),
            owner: owner.to_string(),
            limit,
        };
        if let Some(hit) = self.query_cache.get(&key) {
            debug!("Query cache hit for {}/{}", owner, sender);
            return Ok(hit);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let vector = self.embedder.embed(query);
        let total = self.index.len();

        // Other scopes can crowd out this one: widen until `limit` in-scope
        // candidates are joined or the index is exhausted
        let mut k = self.config.candidate_count(limit).min(total.max(1));
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut complete = true;
        'widen: loop {
            let hits = self.index.search(&vector, k);
            let exhausted = hits.len() < k || k >= total;

            for (vector_id, distance) in hits {
                if !seen.insert(vector_id) {
                    continue;
                }
                if Instant::now() >= deadline {
                    warn!("Long-term search deadline reached after {} candidates", seen.len());
                    complete = false;
                    break 'widen;
                }
                match self.lookup(vector_id) {
                    Ok(Some(record)) if record.in_scope(owner, sender) => {
                        candidates.push((record, distance))
                    }
                    // Out of scope, or a vector without a record (removed
                    // concurrently or awaiting reconciliation)
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Metadata lookup for vector {} failed: {}", vector_id, e);
                        complete = false;
                    }
                }
            }

            if candidates.len() >= limit || exhausted {
                break;
            }
            k = k.saturating_mul(2).min(total);
            debug!("Widening long-term search to {} candidates", k);
        }

        let ranked = self.scoring.rank(
            candidates,
            &extract_keywords(query),
            owner,
            sender,
            limit,
            unix_now(),
        );
        if complete && self.generation.load(Ordering::SeqCst) == generation {
            self.query_cache.insert(key, ranked.clone());
        }
        Ok(ranked)
    }

    fn lookup(&self, vector_id: u64) -> Result<Option<MemoryRecord>> {
        if let Some(record) = self.record_cache.get(&vector_id) {
            return Ok(Some(record));
        }
        let record = self.metadata.get_by_vector_id(vector_id)?;
        if let Some(record) = &record {
            self.record_cache.insert(vector_id, record.clone());
        }
        Ok(record)
    }

    /// Remove every record of `owner` from the metadata store and the index
    pub fn clear(&self, owner: &str) -> Result<usize> {
        let removed = self.metadata.delete_by_owner(owner)?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.record_cache.clear();
        self.query_cache.clear();

        let dropped = self.index.remove(&removed, || {
            Ok(self.embed_records(self.metadata.all_records()?))
        })?;

        if dropped != removed.len() {
            warn!(
                "Removed {} records but {} vectors for owner {}",
                removed.len(),
                dropped,
                owner
            );
        }
        info!("Cleared {} long-term memories for {}", removed.len(), owner);
        Ok(removed.len())
    }

    pub fn persist(&self) -> Result<()> {
        self.index.persist()
    }

    pub fn vector_count(&self) -> usize {
        self.index.len()
    }

    pub fn record_count(&self) -> Result<u64> {
        self.metadata.count()
    }

    pub fn records_by_owner(&self, owner: &str) -> Result<Vec<MemoryRecord>> {
        self.metadata.records_by_owner(owner)
    }

    pub fn page_by_owner(&self, owner: &str, page_num: usize, page_size: usize) -> Result<Vec<String>> {
        self.metadata.page_by_owner(owner, page_num, page_size)
    }

    pub fn stats(&self) -> Result<LongTermStats> {
        let metadata = self.metadata.stats()?;
        Ok(LongTermStats {
            index_variant: self.index.variant(),
            vectors: self.index.len(),
            records: metadata.total_records,
            owners: metadata.owners,
            cached_records: self.record_cache.len(),
            cached_queries: self.query_cache.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::embeddings::HashEmbedder;
    use std::time::Duration;

    fn open(dir: &std::path::Path) -> LongTermMemory {
        let config = MemoryConfig {
            embedding_dim: 64,
            ..MemoryConfig::with_data_dir(dir)
        };
        let db = MemoryDb::open(&config.metadata_path()).unwrap();
        LongTermMemory::open(&config, Arc::new(HashEmbedder::new(64)), db).unwrap()
    }

    fn draft(owner: &str, sender: &str, text: &str) -> NewMemory {
        NewMemory {
            text: text.to_string(),
            sender: sender.to_string(),
            owner: owner.to_string(),
            timestamp: unix_now(),
            importance: 5,
            keywords: extract_keywords(text),
        }
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_save_then_search() {
        let dir = tempfile::tempdir().unwrap();
        let memory = open(dir.path());
        memory.save(draft("R", "alan", "alan说我喜欢猫;R说我也是")).unwrap();
        memory.save(draft("R", "alan", "alan说明天下雨;R说带伞")).unwrap();

        let found = memory.search("alan说我喜欢猫;R说我也是", "alan", "R", 1, later()).unwrap();
        assert_eq!(found, vec!["alan说我喜欢猫;R说我也是"]);
        assert_eq!(memory.vector_count(), 2);
        assert_eq!(memory.record_count().unwrap(), 2);
    }

    #[test]
    fn test_search_widens_past_other_owners() {
        let dir = tempfile::tempdir().unwrap();
        let memory = open(dir.path());
        for i in 0..200 {
            memory.save(draft("OTHER", "alan", &format!("alan说第{}句;OTHER说好", i))).unwrap();
        }
        memory.save(draft("R", "alan", "alan说我喜欢吃川菜;R说我也喜欢")).unwrap();
        memory.save(draft("R", "bob", "bob说我喜欢吃川菜;R说我也喜欢")).unwrap();

        let found = memory.search("alan说我喜欢吃川菜", "alan", "R", 3, later()).unwrap();
        assert_eq!(found, vec!["alan说我喜欢吃川菜;R说我也喜欢"]);
    }

    #[test]
    fn test_query_cache_is_flushed_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let memory = open(dir.path());
        assert!(memory.search("hello", "alan", "R", 3, later()).unwrap().is_empty());

        memory.save(draft("R", "alan", "hello")).unwrap();
        assert_eq!(memory.search("hello", "alan", "R", 3, later()).unwrap(), vec!["hello"]);
    }

    #[test]
    fn test_expired_deadline_returns_partial() {
        let dir = tempfile::tempdir().unwrap();
        let memory = open(dir.path());
        memory.save(draft("R", "alan", "hello")).unwrap();

        let found = memory.search("hello", "alan", "R", 3, Instant::now()).unwrap();
        assert!(found.is_empty());
        // Partial results are not cached
        assert_eq!(memory.search("hello", "alan", "R", 3, later()).unwrap(), vec!["hello"]);
    }

    #[test]
    fn test_clear_removes_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let memory = open(dir.path());
        memory.save(draft("A", "alan", "one")).unwrap();
        memory.save(draft("A", "alan", "two")).unwrap();
        memory.save(draft("B", "alan", "three")).unwrap();

        assert_eq!(memory.clear("A").unwrap(), 2);
        assert_eq!(memory.vector_count(), 1);
        assert_eq!(memory.record_count().unwrap(), 1);
        assert!(memory.search("one", "alan", "A", 3, later()).unwrap().is_empty());
        assert_eq!(memory.search("three", "alan", "B", 3, later()).unwrap(), vec!["three"]);
    }

    #[test]
    fn test_reopen_reconciles_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let memory = open(dir.path());
            memory.save(draft("R", "alan", "remember me")).unwrap();
            // Below persist_every, so no snapshot has been written yet
        }
        let memory = open(dir.path());
        assert_eq!(memory.vector_count(), 1);
        assert_eq!(
            memory.search("remember me", "alan", "R", 1, later()).unwrap(),
            vec!["remember me"]
        );
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let memory = open(dir.path());
        memory.save(draft("R", "alan", "hello")).unwrap();
        memory.save(draft("S", "bob", "world")).unwrap();

        let stats = memory.stats().unwrap();
        assert_eq!(stats.vectors, 2);
        assert_eq!(stats.records, 2);
        assert_eq!(stats.index_variant, IndexVariant::Flat);
        assert_eq!(stats.owners.into_iter().collect::<Vec<_>>(), vec!["R", "S"]);
    }
}
