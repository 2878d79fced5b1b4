//! ============================================================================
//! MEMORY-CORE: Agent Memory Store
//! ============================================================================
//! Dual-tier memory engine for conversational agents:
//! - Short-term window of the latest turns per owner
//! - Long-term vector recall (hora flat / IVF-PQ segments) over redb metadata
//! - Pluggable summarization and importance hooks
//! ============================================================================

pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod index;
pub mod memory;

// Re-export main types for convenience
pub use config::{MemoryConfig, ScoringWeights};
pub use error::{MemoryError, Result};
pub use memory::{MemoryDriver, MemoryRecord, ShortTermTurn};
