//! Immutable index segments backed by hora.
//!
//! A segment is a fully built hora index together with the raw vectors it was
//! built from. hora indexes cannot delete or hand their nodes back, so the raw
//! vectors are what retraining, rebuilds and snapshots work from. Distances
//! are recomputed exactly from them, which also re-ranks the approximate
//! candidates of the product-quantized variant.

use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::bruteforce_idx::BruteForceIndex;
use hora::index::bruteforce_params::BruteForceParams;
use hora::index::pq_idx::IVFPQIndex;
use hora::index::pq_params::IVFPQParams;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::debug;

use super::IndexVariant;
use crate::error::{MemoryError, Result};

/// One stored vector and its id
pub type Entry = (u64, Vec<f32>);

/// Fewer points per centroid than this gives meaningless clusters
const MIN_POINTS_PER_CENTROID: usize = 4;
const TRAIN_EPOCHS: usize = 20;

/// Squared euclidean distance
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Clustering knobs for the trained variant
#[derive(Debug, Clone, Copy)]
pub struct TrainParams {
    pub nlist: usize,
    pub nprobe: usize,
}

enum Backend {
    Empty,
    Flat(BruteForceIndex<f32, u64>),
    Ivf(IVFPQIndex<f32, u64>),
}

pub struct Segment {
    entries: Vec<Entry>,
    positions: HashMap<u64, usize>,
    backend: Backend,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("variant", &self.variant())
            .field("len", &self.len())
            .finish()
    }
}

impl Segment {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
            backend: Backend::Empty,
        }
    }

    /// Exhaustive segment over `entries`
    pub fn flat(dim: usize, entries: Vec<Entry>) -> Result<Self> {
        if entries.is_empty() {
            return Ok(Self::empty());
        }
        check_dims(dim, &entries)?;

        let mut index = BruteForceIndex::<f32, u64>::new(dim, &BruteForceParams::default());
        for (id, vector) in &entries {
            index.add(vector, *id).map_err(storage)?;
        }
        index.build(Metric::Euclidean).map_err(storage)?;

        Ok(Self::assemble(entries, Backend::Flat(index)))
    }

    /// Train an IVF-PQ segment over `entries`. Any failure, including a panic
    /// inside the clustering code, comes back as `MemoryError::Training`.
    pub fn train(dim: usize, params: TrainParams, entries: &[Entry]) -> Result<Self> {
        let nlist = params.nlist;
        if nlist == 0 {
            return Err(MemoryError::Training("nlist must be > 0".into()));
        }
        if entries.len() < nlist * MIN_POINTS_PER_CENTROID {
            return Err(MemoryError::Training(format!(
                "{} vectors is not enough to train {} centroids",
                entries.len(),
                nlist
            )));
        }
        check_dims(dim, entries)?;
        if entries.iter().all(|(_, v)| v == &entries[0].1) {
            return Err(MemoryError::Training(
                "training vectors are all identical".into(),
            ));
        }

        let ivf_params = IVFPQParams::default()
            .n_sub(sub_quantizers(dim))
            .sub_bits(sub_bits(entries.len() / nlist))
            .n_kmeans_center(nlist)
            .search_n_center(params.nprobe.clamp(1, nlist))
            .train_epoch(TRAIN_EPOCHS);

        let mut index = IVFPQIndex::<f32, u64>::new(dim, &ivf_params);
        for (id, vector) in entries {
            index.add(vector, *id).map_err(|e| MemoryError::Training(e.to_string()))?;
        }

        let built = catch_unwind(AssertUnwindSafe(move || {
            index.build(Metric::Euclidean).map(|_| index)
        }));
        let index = match built {
            Ok(Ok(index)) => index,
            Ok(Err(e)) => return Err(MemoryError::Training(e.to_string())),
            Err(_) => return Err(MemoryError::Training("IVF-PQ build panicked".into())),
        };

        debug!("Trained IVF-PQ segment: {} lists over {} vectors", nlist, entries.len());
        Ok(Self::assemble(entries.to_vec(), Backend::Ivf(index)))
    }

    fn assemble(entries: Vec<Entry>, backend: Backend) -> Self {
        let positions = entries
            .iter()
            .enumerate()
            .map(|(pos, (id, _))| (*id, pos))
            .collect();
        Self {
            entries,
            positions,
            backend,
        }
    }

    pub fn variant(&self) -> IndexVariant {
        match self.backend {
            Backend::Ivf(_) => IndexVariant::Ivf,
            Backend::Empty | Backend::Flat(_) => IndexVariant::Flat,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Up to `k` (id, squared L2) pairs, nearest first
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        let ids = match &self.backend {
            Backend::Empty => return Vec::new(),
            Backend::Flat(index) => index.search(query, k),
            Backend::Ivf(index) => index.search(query, k),
        };

        let mut hits: Vec<(u64, f32)> = ids
            .into_iter()
            .filter_map(|id| {
                let pos = *self.positions.get(&id)?;
                Some((id, l2_squared(query, &self.entries[pos].1)))
            })
            .filter(|(_, d)| !d.is_nan())
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }
}

/// Nearest first, ties by id
pub fn sort_hits(hits: &mut [(u64, f32)]) {
    hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
}

fn check_dims(dim: usize, entries: &[Entry]) -> Result<()> {
    match entries.iter().find(|(_, v)| v.len() != dim) {
        Some((_, v)) => Err(MemoryError::DimensionMismatch {
            expected: dim,
            actual: v.len(),
        }),
        None => Ok(()),
    }
}

fn storage(e: &'static str) -> MemoryError {
    MemoryError::Storage(format!("hora: {}", e))
}

/// Largest sub-quantizer count that divides `dim`
fn sub_quantizers(dim: usize) -> usize {
    [8, 4, 2, 1]
        .into_iter()
        .find(|n| dim % n == 0)
        .unwrap_or(1)
}

/// Codebook bits so each list has roughly two points per code
fn sub_bits(points_per_list: usize) -> usize {
    let codes = (points_per_list / 2).max(2);
    ((usize::BITS - 1 - codes.leading_zeros()) as usize).clamp(1, 8)
}
