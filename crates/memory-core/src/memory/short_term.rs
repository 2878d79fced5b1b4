//! ============================================================================
//! Short-Term Store - Per-owner window of the most recent raw turns
//! ============================================================================
//! No embedding, no scoring. The window lives in memory and, when a database
//! is attached, is mirrored to the `short_term` table so it survives restarts.
//! ============================================================================

use redb::ReadableTable;
use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::db::{MemoryDb, SHORT_TERM};
use crate::error::Result;
use crate::memory::types::ShortTermTurn;

type Windows = HashMap<String, VecDeque<ShortTermTurn>>;

pub struct ShortTermStore {
    window: usize,
    windows: RwLock<Windows>,
    db: Option<MemoryDb>,
}

impl ShortTermStore {
    /// Memory-only store
    pub fn new(window: usize) -> Self {
        Self {
            window,
            windows: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    /// Store mirrored to `db`, preloaded with the persisted windows
    pub fn open(db: MemoryDb, window: usize) -> Result<Self> {
        let mut windows = Windows::new();
        {
            let read_txn = db.database().begin_read()?;
            let table = read_txn.open_table(SHORT_TERM)?;
            for entry in table.range::<&str>(..)? {
                let (owner, raw) = entry?;
                let turns: Vec<ShortTermTurn> = bincode::deserialize(raw.value())?;
                let mut turns: VecDeque<ShortTermTurn> = turns.into();
                while turns.len() > window {
                    turns.pop_front();
                }
                windows.insert(owner.value().to_string(), turns);
            }
        }

        info!("Loaded short-term windows for {} owners", windows.len());
        Ok(Self {
            window,
            windows: RwLock::new(windows),
            db: Some(db),
        })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    fn read(&self) -> RwLockReadGuard<'_, Windows> {
        self.windows.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Windows> {
        self.windows.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `turn` to `owner`'s window, dropping the oldest beyond the
    /// window size. The in-memory window is updated even if mirroring fails.
    pub fn save(&self, owner: &str, turn: ShortTermTurn) -> Result<()> {
        let mut windows = self.write();
        let turns = windows.entry(owner.to_string()).or_default();
        turns.push_back(turn);
        while turns.len() > self.window {
            turns.pop_front();
        }

        // Mirror under the lock so concurrent saves reach disk in order
        self.mirror(owner, turns)
    }

    /// The most recent `limit` turns, oldest first
    pub fn search(&self, owner: &str, limit: usize) -> Vec<ShortTermTurn> {
        let windows = self.read();
        match windows.get(owner) {
            Some(turns) => {
                let skip = turns.len().saturating_sub(limit);
                turns.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop `owner`'s window; returns how many turns it held
    pub fn clear(&self, owner: &str) -> Result<usize> {
        let mut windows = self.write();
        let removed = windows.remove(owner).map(|t| t.len()).unwrap_or(0);

        if let Some(db) = &self.db {
            let write_txn = db.database().begin_write()?;
            {
                let mut table = write_txn.open_table(SHORT_TERM)?;
                table.remove(owner)?;
            }
            write_txn.commit()?;
        }

        debug!("Cleared {} short-term turns for {}", removed, owner);
        Ok(removed)
    }

    /// (owners, total turns)
    pub fn stats(&self) -> (usize, usize) {
        let windows = self.read();
        (windows.len(), windows.values().map(VecDeque::len).sum())
    }

    fn mirror(&self, owner: &str, turns: &VecDeque<ShortTermTurn>) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let value = bincode::serialize(turns)?;

        let write_txn = db.database().begin_write()?;
        {
            let mut table = write_txn.open_table(SHORT_TERM)?;
            table.insert(owner, value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
