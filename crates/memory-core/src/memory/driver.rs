//! ============================================================================
//! Memory Driver - Public API of the memory engine
//! ============================================================================
//! The only component collaborators talk to. Every operation degrades instead
//! of failing: a broken long-term tier means the agent forgets, never that a
//! chat turn errors out.
//!
//! Construct one driver at startup and share it (`Arc<MemoryDriver>`); call
//! `shutdown` before exit to snapshot the index.
//! ============================================================================

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::embeddings::create_embedder;
use super::hooks::{ImportanceScorer, LlmHook, PassthroughHook, RuleBasedImportance};
use super::keywords::extract_keywords;
use super::long_term::{LongTermMemory, LongTermStats};
use super::short_term::ShortTermStore;
use super::types::{unix_now, NewMemory, ShortTermTurn};
use crate::config::MemoryConfig;
use crate::db::MemoryDb;
use crate::error::Result;

/// Characters a recalled memory may be cut after
const SENTENCE_TERMINATORS: &[char] = &['。', '！', '？', '.', '!', '?', '；', ';'];

#[derive(Debug, Clone, Serialize)]
pub struct DriverStats {
    pub short_term_owners: usize,
    pub short_term_turns: usize,
    pub long_term: Option<LongTermStats>,
    pub long_term_disabled: Option<String>,
}

pub struct MemoryDriver {
    config: MemoryConfig,
    short_term: ShortTermStore,
    long_term: Option<Arc<LongTermMemory>>,
    disabled_reason: Option<String>,
    hook: Arc<dyn LlmHook>,
    scorer: Arc<dyn ImportanceScorer>,
}

impl MemoryDriver {
    /// Open the memory directory. Only an invalid configuration is an error;
    /// storage or embedding problems disable the long-term tier instead.
    pub fn open(
        config: MemoryConfig,
        hook: Arc<dyn LlmHook>,
        scorer: Arc<dyn ImportanceScorer>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let db = MemoryDb::open(&config.metadata_path()).map_err(|e| {
            error!("Metadata database unavailable: {}", e);
            format!("metadata database unavailable: {}", e)
        });

        let short_term = match &db {
            Ok(db) => ShortTermStore::open(db.clone(), config.local_memory_num).unwrap_or_else(|e| {
                warn!("Could not load short-term windows ({}), starting empty", e);
                ShortTermStore::new(config.local_memory_num)
            }),
            Err(_) => ShortTermStore::new(config.local_memory_num),
        };

        let (long_term, disabled_reason) = match Self::open_long_term(&config, db) {
            Ok(memory) => (Some(Arc::new(memory)), None),
            Err(reason) => {
                if config.enable_long_memory {
                    error!("Long-term memory disabled: {}", reason);
                } else {
                    info!("Long-term memory disabled: {}", reason);
                }
                (None, Some(reason))
            }
        };

        info!(
            "Memory driver ready (window {}, long-term {})",
            config.local_memory_num,
            if long_term.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            config,
            short_term,
            long_term,
            disabled_reason,
            hook,
            scorer,
        })
    }

    /// Driver with the identity summarizer and rule-based importance
    pub fn with_defaults(config: MemoryConfig) -> Result<Self> {
        Self::open(
            config,
            Arc::new(PassthroughHook::default()),
            Arc::new(RuleBasedImportance::default()),
        )
    }

    fn open_long_term(
        config: &MemoryConfig,
        db: std::result::Result<MemoryDb, String>,
    ) -> std::result::Result<LongTermMemory, String> {
        if !config.enable_long_memory {
            return Err("disabled by configuration".to_string());
        }
        let db = db?;
        let embedder = create_embedder(config).map_err(|e| e.to_string())?;
        LongTermMemory::open(config, embedder, db).map_err(|e| e.to_string())
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn long_term_enabled(&self) -> bool {
        self.long_term.is_some()
    }

    /// Why the long-term tier is off, if it is
    pub fn long_term_disabled_reason(&self) -> Option<&str> {
        self.disabled_reason.as_deref()
    }

    /// Direct access to the long-term tier for operator tooling
    pub fn long_term(&self) -> Option<&Arc<LongTermMemory>> {
        self.long_term.as_ref()
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Record one dialogue turn. The short-term write always happens first;
    /// long-term failures are logged and swallowed.
    pub async fn save(&self, sender: &str, query: &str, owner: &str, answer: &str) {
        let turn = ShortTermTurn::new(sender, query, owner, answer);
        if let Err(e) = self.short_term.save(owner, turn.clone()) {
            warn!("Short-term turn for {} kept in memory only: {}", owner, e);
        }

        let Some(long_term) = &self.long_term else {
            return;
        };

        let text = self.summarize(turn.combined()).await;
        let importance = self.importance(&text).await;
        let draft = NewMemory {
            keywords: extract_keywords(&text),
            text,
            sender: sender.to_string(),
            owner: owner.to_string(),
            timestamp: unix_now(),
            importance,
        };

        let long_term = Arc::clone(long_term);
        match tokio::task::spawn_blocking(move || long_term.save(draft)).await {
            Ok(Ok(record)) => debug!(
                "Saved memory {} for {}/{} (importance {})",
                record.id, owner, sender, record.importance
            ),
            Ok(Err(e)) => warn!("Long-term save failed for {}: {}", owner, e),
            Err(e) => error!("Long-term save task failed: {}", e),
        }
    }

    async fn summarize(&self, text: String) -> String {
        if !self.config.enable_summary {
            return text;
        }
        match self.hook.summarize(&text).await {
            Ok(summary) if !summary.trim().is_empty() => summary,
            Ok(_) => {
                warn!("Empty summary, storing the raw turn");
                text
            }
            Err(e) => {
                warn!("Summarization failed: {}, storing the raw turn", e);
                text
            }
        }
    }

    async fn importance(&self, text: &str) -> i32 {
        match self.scorer.score(text).await {
            Ok(score) => score,
            Err(e) => {
                warn!("Importance scoring failed: {}, using rules", e);
                RuleBasedImportance::default().evaluate(text)
            }
        }
    }

    /// The owner's most recent turns, oldest first. The window is per owner;
    /// query and sender do not narrow it.
    pub fn search_short(&self, _query: &str, _sender: &str, owner: &str) -> Vec<ShortTermTurn> {
        self.short_term.search(owner, self.config.local_memory_num)
    }

    /// Relevant long-term memories rendered as recall lines within
    /// `max_chars`. Empty when the tier is off, slow or finds nothing.
    pub async fn search_long(&self, query: &str, sender: &str, owner: &str, max_chars: usize) -> String {
        let Some(long_term) = &self.long_term else {
            return String::new();
        };
        if query.is_empty() || max_chars == 0 {
            return String::new();
        }

        let timeout = self.config.search_timeout();
        let deadline = Instant::now() + timeout;
        let limit = self.config.search_memory_size;
        let long_term = Arc::clone(long_term);
        let (q, s, o) = (query.to_string(), sender.to_string(), owner.to_string());
        let task = tokio::task::spawn_blocking(move || long_term.search(&q, &s, &o, limit, deadline));

        let memories = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(memories))) => memories,
            Ok(Ok(Err(e))) => {
                warn!("Long-term search failed for {}: {}", owner, e);
                return String::new();
            }
            Ok(Err(e)) => {
                error!("Long-term search task failed: {}", e);
                return String::new();
            }
            Err(_) => {
                warn!("Long-term search timed out after {:?}", timeout);
                return String::new();
            }
        };

        debug!("Recalled {} memories for {}/{}", memories.len(), owner, sender);
        format_recall(&memories, &self.config.recall_prefix, max_chars)
    }

    /// Forget everything about `owner` in both tiers
    pub async fn clear(&self, owner: &str) {
        match self.short_term.clear(owner) {
            Ok(n) => debug!("Dropped {} short-term turns for {}", n, owner),
            Err(e) => warn!("Short-term clear for {} not persisted: {}", owner, e),
        }

        let Some(long_term) = &self.long_term else {
            return;
        };
        let long_term = Arc::clone(long_term);
        let o = owner.to_string();
        match tokio::task::spawn_blocking(move || long_term.clear(&o)).await {
            Ok(Ok(n)) => info!("Cleared memory of {} ({} long-term records)", owner, n),
            Ok(Err(e)) => error!("Long-term clear failed for {}: {}", owner, e),
            Err(e) => error!("Long-term clear task failed: {}", e),
        }
    }

    // ========================================================================
    // Lifecycle and introspection
    // ========================================================================

    pub async fn stats(&self) -> DriverStats {
        let (owners, turns) = self.short_term.stats();
        let long_term = match &self.long_term {
            Some(long_term) => {
                let long_term = Arc::clone(long_term);
                match tokio::task::spawn_blocking(move || long_term.stats()).await {
                    Ok(Ok(stats)) => Some(stats),
                    Ok(Err(e)) => {
                        warn!("Long-term stats unavailable: {}", e);
                        None
                    }
                    Err(e) => {
                        warn!("Long-term stats task failed: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        DriverStats {
            short_term_owners: owners,
            short_term_turns: turns,
            long_term,
            long_term_disabled: self.disabled_reason.clone(),
        }
    }

    /// Snapshot the index so the next start does not need to reconcile
    pub async fn shutdown(&self) {
        let Some(long_term) = &self.long_term else {
            return;
        };
        let long_term = Arc::clone(long_term);
        match tokio::task::spawn_blocking(move || long_term.persist()).await {
            Ok(Ok(())) => info!("Memory index persisted"),
            Ok(Err(e)) => error!("Failed to persist memory index: {}", e),
            Err(e) => error!("Persist task failed: {}", e),
        }
    }
}

/// Render ranked memories as `"{prefix}{text}\n"` lines within `max_chars`
/// characters. The first memory that does not fit is cut after its last
/// sentence terminator if that fits; nothing after it is considered.
pub fn format_recall(memories: &[String], prefix: &str, max_chars: usize) -> String {
    let prefix_len = prefix.chars().count();
    let mut out = String::new();
    let mut used = 0;

    for memory in memories {
        let len = prefix_len + memory.chars().count() + 1;
        if used + len <= max_chars {
            out.push_str(prefix);
            out.push_str(memory);
            out.push('\n');
            used += len;
            continue;
        }

        let room = max_chars.saturating_sub(used + prefix_len + 1);
        let head: Vec<char> = memory.chars().take(room).collect();
        if let Some(cut) = head.iter().rposition(|c| SENTENCE_TERMINATORS.contains(c)) {
            out.push_str(prefix);
            out.extend(&head[..=cut]);
            out.push('\n');
        }
        break;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_format_recall_fits() {
        let out = format_recall(&owned(&["a", "b"]), "回忆: ", 800);
        assert_eq!(out, "回忆: a\n回忆: b\n");
        assert_eq!(format_recall(&[], "回忆: ", 800), "");
    }

    #[test]
    fn test_format_recall_cuts_at_sentence() {
        // "P:" prefix (2) + text + "\n"
        let memories = owned(&["short", "First part. Second part that is long"]);
        let out = format_recall(&memories, "P:", 25);
        assert_eq!(out, "P:short\nP:First part.\n");
        assert!(out.chars().count() <= 25);
    }

    #[test]
    fn test_format_recall_drops_unbreakable() {
        let memories = owned(&["one", "no terminator here at all", "two"]);
        let out = format_recall(&memories, "", 10);
        assert_eq!(out, "one\n");
    }

    #[test]
    fn test_format_recall_counts_chars_not_bytes() {
        let memories = owned(&["你好。世界", "再见"]);
        let out = format_recall(&memories, "", 6);
        assert_eq!(out, "你好。世界\n");
        let out = format_recall(&memories, "", 5);
        assert_eq!(out, "你好。\n");
    }
}
