//! ============================================================================
//! Memory Types - Data structures for conversation memory
//! ============================================================================
//! Long-term records, short-term turns and turn formatting.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lowest and highest importance a record can carry
pub const MIN_IMPORTANCE: i32 = 1;
pub const MAX_IMPORTANCE: i32 = 10;

/// One persisted long-term memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Globally unique, time-ordered id
    pub id: u64,
    /// Raw turn text or its summary
    pub text: String,
    /// Human participant the memory is attributed to
    pub sender: String,
    /// Persona the memory belongs to (retrieval scope)
    pub owner: String,
    /// Unix seconds at creation
    pub timestamp: f64,
    /// 1..=10, set once at creation
    pub importance: i32,
    /// Derived from `text` at creation
    pub keywords: BTreeSet<String>,
    /// Key of this record's vector in the index
    pub vector_id: u64,
}

impl MemoryRecord {
    pub fn in_scope(&self, owner: &str, sender: &str) -> bool {
        self.owner == owner && self.sender == sender
    }

    pub fn age_hours(&self, now: f64) -> f64 {
        ((now - self.timestamp) / 3600.0).max(0.0)
    }
}

/// A record before an id has been allocated for it
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub text: String,
    pub sender: String,
    pub owner: String,
    pub timestamp: f64,
    pub importance: i32,
    pub keywords: BTreeSet<String>,
}

impl NewMemory {
    pub fn into_record(self, id: u64) -> MemoryRecord {
        MemoryRecord {
            id,
            text: self.text,
            sender: self.sender,
            owner: self.owner,
            timestamp: self.timestamp,
            importance: self.importance.clamp(MIN_IMPORTANCE, MAX_IMPORTANCE),
            keywords: self.keywords,
            vector_id: id,
        }
    }
}

/// One raw exchange kept in the short-term window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortTermTurn {
    /// "{owner}说{answer}"
    pub ai: String,
    /// "{sender}说{query}"
    pub human: String,
}

impl ShortTermTurn {
    pub fn new(sender: &str, query: &str, owner: &str, answer: &str) -> Self {
        Self {
            ai: format_utterance(owner, answer),
            human: format_utterance(sender, query),
        }
    }

    /// Combined text embedded for long-term memory
    pub fn combined(&self) -> String {
        format!("{};{}", self.human, self.ai)
    }
}

pub fn format_utterance(speaker: &str, text: &str) -> String {
    format!("{}说{}", speaker, text)
}

/// Unix seconds with sub-second precision
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_formatting() {
        let turn = ShortTermTurn::new("alan", "你好", "爱莉", "很高兴认识你");
        assert_eq!(turn.human, "alan说你好");
        assert_eq!(turn.ai, "爱莉说很高兴认识你");
        assert_eq!(turn.combined(), "alan说你好;爱莉说很高兴认识你");
    }

    #[test]
    fn test_importance_clamped_on_creation() {
        let draft = NewMemory {
            text: "x".into(),
            sender: "a".into(),
            owner: "b".into(),
            timestamp: 0.0,
            importance: 42,
            keywords: BTreeSet::new(),
        };
        let record = draft.into_record(7);
        assert_eq!(record.importance, MAX_IMPORTANCE);
        assert_eq!(record.id, 7);
        assert_eq!(record.vector_id, 7);
    }

    #[test]
    fn test_scope_and_age() {
        let record = NewMemory {
            text: "x".into(),
            sender: "alan".into(),
            owner: "R".into(),
            timestamp: 1_000.0,
            importance: 3,
            keywords: BTreeSet::new(),
        }
        .into_record(1);

        assert!(record.in_scope("R", "alan"));
        assert!(!record.in_scope("R", "bob"));
        assert!(!record.in_scope("Q", "alan"));
        assert_eq!(record.age_hours(1_000.0 + 7_200.0), 2.0);
        assert_eq!(record.age_hours(0.0), 0.0);
    }
}
