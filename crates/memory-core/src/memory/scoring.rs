//! ============================================================================
//! Scoring Engine - Rank long-term candidates
//! ============================================================================
//! total = w_r·relevance + w_i·importance + w_c·recency + w_k·keywords
//!
//! - relevance: 1 - d/2, where d is the squared L2 distance between unit
//!   vectors (so relevance equals cosine similarity, negative when far)
//! - importance: record importance / 10
//! - recency:    decay^(age_hours)
//! - keywords:   |query ∩ record| / max(|query|, 1)
//! ============================================================================

use std::collections::BTreeSet;
use tracing::debug;

use crate::config::ScoringWeights;
use crate::memory::types::{MemoryRecord, MAX_IMPORTANCE};

/// Per-signal breakdown, mostly useful for debugging ranking
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub relevance: f64,
    pub importance: f64,
    pub recency: f64,
    pub keywords: f64,
    pub total: f64,
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    weights: ScoringWeights,
    decay: f64,
}

impl ScoringEngine {
    pub fn new(weights: ScoringWeights, decay: f64) -> Self {
        Self { weights, decay }
    }

    /// In (0, 1]; 1 for a record created now, never negative
    pub fn recency(&self, age_hours: f64) -> f64 {
        self.decay.powf(age_hours.max(0.0))
    }

    pub fn keyword_score(query: &BTreeSet<String>, record: &BTreeSet<String>) -> f64 {
        let overlap = query.intersection(record).count();
        overlap as f64 / query.len().max(1) as f64
    }

    pub fn score(
        &self,
        record: &MemoryRecord,
        distance: f32,
        query_keywords: &BTreeSet<String>,
        now: f64,
    ) -> ScoreBreakdown {
        let relevance = 1.0 - f64::from(distance) / 2.0;
        let importance = f64::from(record.importance) / f64::from(MAX_IMPORTANCE);
        let recency = self.recency(record.age_hours(now));
        let keywords = Self::keyword_score(query_keywords, &record.keywords);

        let w = &self.weights;
        let total = w.relevance * relevance
            + w.importance * importance
            + w.recency * recency
            + w.keywords * keywords;

        ScoreBreakdown {
            relevance,
            importance,
            recency,
            keywords,
            total,
        }
    }

    /// Score the in-scope candidates and return the top `limit` texts
    pub fn rank(
        &self,
        candidates: Vec<(MemoryRecord, f32)>,
        query_keywords: &BTreeSet<String>,
        owner: &str,
        sender: &str,
        limit: usize,
        now: f64,
    ) -> Vec<String> {
        let total = candidates.len();
        let mut scored: Vec<(f64, MemoryRecord)> = candidates
            .into_iter()
            .filter(|(record, _)| record.in_scope(owner, sender))
            .map(|(record, distance)| {
                let score = self.score(&record, distance, query_keywords, now);
                (score.total, record)
            })
            .collect();

        debug!("Scoring {} of {} candidates in scope", scored.len(), total);

        // sort_by is stable
        scored.sort_by(|(a, ra), (b, rb)| {
            b.total_cmp(a)
                .then_with(|| rb.timestamp.total_cmp(&ra.timestamp))
        });

        scored
            .into_iter()
            .take(limit)
            .map(|(_, record)| record.text)
            .collect()
    }
}
