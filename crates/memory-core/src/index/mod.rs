//! ============================================================================
//! Vector Index Manager - Nearest-neighbour search over memory vectors
//! ============================================================================
//! The index is a list of immutable hora segments: sealed segments plus one
//! small flat tail that takes new vectors. Readers search an `Arc<AnnIndex>`
//! snapshot; writers are serialized and publish a new snapshot that shares
//! every untouched segment, so an insert copies only the tail.
//!
//! Once enough vectors exist the segments are retrained into one clustered
//! (IVF-PQ) segment. hora cannot delete, so removal rebuilds from the
//! surviving records and swaps the result in whole.
//!
//! Snapshots are written to `<data_dir>/memory.index` via temp file + rename.
//! ============================================================================

pub mod segment;

pub use segment::{l2_squared, Entry, Segment, TrainParams};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::memory::embeddings::is_degenerate;

/// Bumped whenever the snapshot layout changes
const SNAPSHOT_VERSION: u32 = 2;

/// Vectors held in the flat tail before it is sealed
pub const DEFAULT_TAIL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexVariant {
    Flat,
    Ivf,
}

impl std::fmt::Display for IndexVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexVariant::Flat => write!(f, "flat"),
            IndexVariant::Ivf => write!(f, "ivf"),
        }
    }
}

// ============================================================================
// Snapshot view
// ============================================================================

/// One published version of the index. Cloning shares every segment.
#[derive(Debug, Clone)]
pub struct AnnIndex {
    dim: usize,
    sealed: Vec<Arc<Segment>>,
    tail: Arc<Segment>,
}

impl AnnIndex {
    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            sealed: Vec::new(),
            tail: Arc::new(Segment::empty()),
        }
    }

    fn segments(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.sealed.iter().chain(std::iter::once(&self.tail))
    }

    pub fn len(&self) -> usize {
        self.segments().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn variant(&self) -> IndexVariant {
        if self.segments().any(|s| s.variant() == IndexVariant::Ivf) {
            IndexVariant::Ivf
        } else {
            IndexVariant::Flat
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.segments().any(|s| s.contains(id))
    }

    /// Vectors not covered by a trained segment
    fn untrained_len(&self) -> usize {
        self.segments()
            .filter(|s| s.variant() == IndexVariant::Flat)
            .map(|s| s.len())
            .sum()
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        let mut hits: Vec<(u64, f32)> = self
            .segments()
            .flat_map(|s| s.search(query, k))
            .collect();
        segment::sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }

    /// Copy of every stored (id, vector) pair
    pub fn vectors(&self) -> Vec<Entry> {
        self.segments()
            .flat_map(|s| s.entries().iter().cloned())
            .collect()
    }

    /// New version with `(id, vector)` appended to the tail
    fn with_entry(&self, id: u64, vector: &[f32], tail_capacity: usize) -> Result<Self> {
        let mut entries = Vec::with_capacity(self.tail.len() + 1);
        entries.extend(self.tail.entries().iter().cloned());
        entries.push((id, vector.to_vec()));

        let tail = Arc::new(Segment::flat(self.dim, entries)?);
        let mut sealed = self.sealed.clone();
        if tail.len() >= tail_capacity.max(1) {
            debug!("Sealing tail segment of {} vectors", tail.len());
            sealed.push(tail);
            Ok(Self {
                dim: self.dim,
                sealed,
                tail: Arc::new(Segment::empty()),
            })
        } else {
            Ok(Self {
                dim: self.dim,
                sealed,
                tail,
            })
        }
    }
}

#[derive(Serialize)]
struct SegmentRef<'a> {
    variant: IndexVariant,
    entries: &'a [Entry],
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    dim: usize,
    segments: Vec<SegmentRef<'a>>,
}

#[derive(Deserialize)]
struct SegmentData {
    variant: IndexVariant,
    entries: Vec<Entry>,
}

#[derive(Deserialize)]
struct SnapshotData {
    version: u32,
    dim: usize,
    segments: Vec<SegmentData>,
}

// ============================================================================
// Manager
// ============================================================================

/// Tuning knobs for training and persistence
#[derive(Debug, Clone, Copy)]
pub struct IndexParams {
    pub nlist: usize,
    pub nprobe: usize,
    pub min_train_size: usize,
    pub persist_every: usize,
    pub tail_capacity: usize,
}

impl IndexParams {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            nlist: config.ivf_nlist,
            nprobe: config.ivf_nprobe,
            min_train_size: config.ivf_min_train_size,
            persist_every: config.persist_every,
            tail_capacity: DEFAULT_TAIL_CAPACITY,
        }
    }

    fn train(&self) -> TrainParams {
        TrainParams {
            nlist: self.nlist,
            nprobe: self.nprobe,
        }
    }
}

#[derive(Debug, Default)]
struct WriterState {
    /// Inserts since the last snapshot
    pending: usize,
    /// Untrained vectors needed before the next training attempt
    train_after: usize,
}

pub struct VectorIndexManager {
    dim: usize,
    path: PathBuf,
    params: IndexParams,
    current: RwLock<Arc<AnnIndex>>,
    writer: Mutex<WriterState>,
}

impl VectorIndexManager {
    /// Empty index that snapshots to `path`
    pub fn new(dim: usize, path: &Path, params: IndexParams) -> Self {
        Self::with_index(path, params, AnnIndex::empty(dim))
    }

    fn with_index(path: &Path, params: IndexParams, index: AnnIndex) -> Self {
        Self {
            dim: index.dim,
            path: path.to_path_buf(),
            params,
            current: RwLock::new(Arc::new(index)),
            writer: Mutex::new(WriterState {
                pending: 0,
                train_after: params.min_train_size,
            }),
        }
    }

    /// Load the snapshot at `path`. A missing, unreadable or mismatched
    /// snapshot yields an empty index.
    pub fn load(dim: usize, path: &Path, params: IndexParams) -> Self {
        if !path.exists() {
            debug!("No index snapshot at {}, starting empty", path.display());
            return Self::new(dim, path, params);
        }

        let snapshot = std::fs::read(path)
            .map_err(MemoryError::from)
            .and_then(|raw| bincode::deserialize::<SnapshotData>(&raw).map_err(MemoryError::from));

        let data = match snapshot {
            Ok(s) if s.version == SNAPSHOT_VERSION && s.dim == dim => s,
            Ok(s) => {
                warn!(
                    "Index snapshot has version {} / dim {}, expected {} / {}; starting empty",
                    s.version, s.dim, SNAPSHOT_VERSION, dim
                );
                return Self::new(dim, path, params);
            }
            Err(e) => {
                error!("Failed to read index snapshot {}: {}; starting empty", path.display(), e);
                return Self::new(dim, path, params);
            }
        };

        match Self::restore(dim, params, data.segments) {
            Ok(index) => {
                info!(
                    "Loaded {} index with {} vectors from {}",
                    index.variant(),
                    index.len(),
                    path.display()
                );
                Self::with_index(path, params, index)
            }
            Err(e) => {
                error!("Index snapshot {} is unusable: {}; starting empty", path.display(), e);
                Self::new(dim, path, params)
            }
        }
    }

    fn restore(dim: usize, params: IndexParams, segments: Vec<SegmentData>) -> Result<AnnIndex> {
        let mut sealed = Vec::with_capacity(segments.len());
        for data in segments.into_iter().filter(|s| !s.entries.is_empty()) {
            let segment = match data.variant {
                IndexVariant::Ivf => Segment::train(dim, params.train(), &data.entries)
                    .or_else(|e| {
                        warn!("Retraining stored segment failed: {}; keeping it flat", e);
                        Segment::flat(dim, data.entries)
                    })?,
                IndexVariant::Flat => Segment::flat(dim, data.entries)?,
            };
            sealed.push(Arc::new(segment));
        }
        Ok(AnnIndex {
            dim,
            sealed,
            tail: Arc::new(Segment::empty()),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn variant(&self) -> IndexVariant {
        self.snapshot().variant()
    }

    /// Current immutable view
    fn snapshot(&self) -> Arc<AnnIndex> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap in a fully built version; the write lock covers only the swap
    fn publish(&self, index: AnnIndex) {
        let index = Arc::new(index);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = index;
    }

    fn lock_writer(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Nearest `k` ids with squared L2 distances, nearest first
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        if k == 0 || query.len() != self.dim || is_degenerate(query) {
            return Vec::new();
        }
        self.snapshot().search(query, k)
    }

    /// Insert `vector` under `id`. An id already present is left as is, so a
    /// rebuild that picked the record up first does not produce a duplicate.
    pub fn add(&self, id: u64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }

        let mut state = self.lock_writer();
        let current = self.snapshot();
        if current.contains(id) {
            debug!("Vector {} already indexed, skipping insert", id);
            return Ok(());
        }
        let next = current.with_entry(id, vector, self.params.tail_capacity)?;
        drop(current);
        self.publish(next);

        self.maybe_train(&mut state);

        state.pending += 1;
        if self.params.persist_every > 0 && state.pending >= self.params.persist_every {
            if let Err(e) = self.write_snapshot() {
                warn!("Periodic index persist failed: {}", e);
            } else {
                state.pending = 0;
            }
        }
        Ok(())
    }

    /// Retrain into one clustered segment once enough untrained vectors have
    /// piled up (at least as many as the last training covered)
    fn maybe_train(&self, state: &mut WriterState) {
        let snapshot = self.snapshot();
        let untrained = snapshot.untrained_len();
        let trained = snapshot.len() - untrained;
        if untrained < state.train_after || untrained < trained {
            return;
        }

        let vectors = snapshot.vectors();
        match Segment::train(self.dim, self.params.train(), &vectors) {
            Ok(segment) => {
                info!("Switched to IVF index ({} vectors)", segment.len());
                state.train_after = self.params.min_train_size;
                self.publish(AnnIndex {
                    dim: self.dim,
                    sealed: vec![Arc::new(segment)],
                    tail: Arc::new(Segment::empty()),
                });
            }
            Err(e) => {
                state.train_after = untrained + (self.params.min_train_size / 4).max(1);
                warn!(
                    "IVF training failed: {}; staying flat until {} vectors",
                    e, state.train_after
                );
            }
        }
    }

    /// Remove `ids` by rebuilding from the vectors `survivors` yields.
    /// Readers keep the old version until the new one is published.
    pub fn remove<F>(&self, ids: &HashSet<u64>, survivors: F) -> Result<usize>
    where
        F: FnOnce() -> Result<Vec<Entry>>,
    {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut state = self.lock_writer();
        let current = self.snapshot();
        let present = ids.iter().filter(|id| current.contains(**id)).count();
        drop(current);

        let vectors = survivors()?;
        debug!("Rebuilding index from {} surviving vectors", vectors.len());
        let rebuilt = self.build(vectors, &mut state)?;
        self.publish(rebuilt);

        self.write_snapshot()?;
        state.pending = 0;
        Ok(present)
    }

    /// Replace the whole index with `vectors`
    pub fn rebuild(&self, vectors: Vec<Entry>) -> Result<()> {
        let mut state = self.lock_writer();
        let rebuilt = self.build(vectors, &mut state)?;
        info!("Rebuilt {} index with {} vectors", rebuilt.variant(), rebuilt.len());
        self.publish(rebuilt);
        self.write_snapshot()?;
        state.pending = 0;
        Ok(())
    }

    fn build(&self, vectors: Vec<Entry>, state: &mut WriterState) -> Result<AnnIndex> {
        state.train_after = self.params.min_train_size;
        let mut index = AnnIndex::empty(self.dim);
        if vectors.is_empty() {
            return Ok(index);
        }

        if vectors.len() >= self.params.min_train_size {
            match Segment::train(self.dim, self.params.train(), &vectors) {
                Ok(segment) => {
                    index.sealed.push(Arc::new(segment));
                    return Ok(index);
                }
                Err(e) => {
                    state.train_after = vectors.len() + (self.params.min_train_size / 4).max(1);
                    warn!("IVF training failed during rebuild: {}; using flat index", e);
                }
            }
        }

        index.sealed.push(Arc::new(Segment::flat(self.dim, vectors)?));
        Ok(index)
    }

    /// Write the current snapshot to disk
    pub fn persist(&self) -> Result<()> {
        let mut state = self.lock_writer();
        self.write_snapshot()?;
        state.pending = 0;
        Ok(())
    }

    fn write_snapshot(&self) -> Result<()> {
        let index = self.snapshot();
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            dim: self.dim,
            segments: index
                .segments()
                .filter(|s| !s.is_empty())
                .map(|s| SegmentRef {
                    variant: s.variant(),
                    entries: s.entries(),
                })
                .collect(),
        };
        let bytes = bincode::serialize(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("index.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!("Persisted {} vectors to {}", index.len(), self.path.display());
        Ok(())
    }
}
