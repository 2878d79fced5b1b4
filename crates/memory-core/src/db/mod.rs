// ============================================================================
// MemoryDb: Embedded Database (redb)
// ============================================================================
// Durable storage for long-term memory records and short-term turn windows.
// Default path: <data_dir>/memory_metadata.redb
//
// redb's `Database` is shared; every operation opens its own read or write
// transaction, so no cursor or transaction state is ever shared between
// callers. Writers are serialized by redb, readers see a consistent snapshot.
// ============================================================================

pub mod metadata;

pub use metadata::{MetadataStats, MetadataStore};

use redb::{Database, DatabaseError, StorageError, TableDefinition};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::Result;

// Table definitions
pub(crate) const RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("memory_records");
pub(crate) const VECTOR_IDS: TableDefinition<u64, u64> = TableDefinition::new("vector_ids");
pub(crate) const OWNER_INDEX: TableDefinition<&str, u64> = TableDefinition::new("owner_index");
pub(crate) const SHORT_TERM: TableDefinition<&str, &[u8]> = TableDefinition::new("short_term");

/// Shared handle to the metadata database file
#[derive(Clone)]
pub struct MemoryDb {
    db: Arc<Database>,
    path: PathBuf,
}

impl MemoryDb {
    /// Open (or create) the database at `path`, creating missing tables.
    /// A corrupt or foreign file is moved aside and replaced; any other
    /// failure (the file is locked by another handle, permissions) is
    /// returned and leaves the file untouched.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening memory database at: {}", path.display());

        let db = match Database::create(path) {
            Ok(db) => db,
            Err(e) if is_corruption(&e) => {
                let aside = corrupt_path(path);
                error!(
                    "Failed to open database ({}), moving it to {} and starting fresh",
                    e,
                    aside.display()
                );
                std::fs::rename(path, &aside)?;
                Database::create(path)?
            }
            Err(e) => {
                error!("Cannot open database at {}: {}", path.display(), e);
                return Err(e.into());
            }
        };

        // Ensure tables exist by doing a write transaction
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(RECORDS)?;
            write_txn.open_table(VECTOR_IDS)?;
            write_txn.open_table(OWNER_INDEX)?;
            write_txn.open_table(SHORT_TERM)?;
        }
        write_txn.commit()?;

        info!("Memory database ready");

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }
}

/// Damage that starting over can fix. A lock held elsewhere is not one.
fn is_corruption(e: &DatabaseError) -> bool {
    match e {
        DatabaseError::Storage(StorageError::Corrupted(_)) => true,
        DatabaseError::Storage(StorageError::Io(io)) => {
            matches!(io.kind(), ErrorKind::InvalidData | ErrorKind::UnexpectedEof)
        }
        DatabaseError::UpgradeRequired(_) => true,
        _ => false,
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().timestamp();
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt-{}", stamp));
    let aside = path.with_file_name(name);
    if aside.exists() {
        warn!("{} already exists, overwriting", aside.display());
    }
    aside
}
