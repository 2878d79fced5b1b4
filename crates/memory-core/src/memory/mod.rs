//! ============================================================================
//! Memory Module - Dual-tier conversation memory
//! ============================================================================
//! Short-term: per-owner window of raw turns, recency only.
//! Long-term: embedded turns in a vector index, joined against the metadata
//! store and ranked by relevance, importance, recency and keyword overlap.
//!
//! ## Architecture
//! ```text
//! save(sender, query, owner, answer)
//!   ├─→ ShortTermStore (always)
//!   └─→ summarize → importance → embed → MetadataStore + VectorIndex
//!
//! search_long(query, sender, owner, max_chars)
//!   embed → ANN candidates → metadata join (cached) → ScoringEngine → recall text
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use memory_core::{MemoryConfig, MemoryDriver};
//!
//! let driver = MemoryDriver::with_defaults(MemoryConfig::from_env())?;
//! driver.save("alan", "我们结婚吧", "爱莉", "好呀").await;
//!
//! let recent = driver.search_short("", "alan", "爱莉");
//! let recall = driver.search_long("结婚", "alan", "爱莉", 800).await;
//! ```
//! ============================================================================

pub mod cache;
pub mod driver;
pub mod embeddings;
pub mod hooks;
pub mod keywords;
pub mod long_term;
pub mod scoring;
pub mod short_term;
pub mod types;

// Re-export public types
pub use cache::TtlCache;
pub use driver::{format_recall, DriverStats, MemoryDriver};
pub use embeddings::{create_embedder, Embedder, HashEmbedder, EMBEDDING_DIM};
pub use hooks::{
    ChatModel, ImportanceScorer, LlmHook, LlmImportance, PassthroughHook, PromptLlmHook,
    RuleBasedImportance,
};
pub use keywords::extract_keywords;
pub use long_term::{LongTermMemory, LongTermStats};
pub use scoring::{ScoreBreakdown, ScoringEngine};
pub use short_term::ShortTermStore;
pub use types::{MemoryRecord, NewMemory, ShortTermTurn};
