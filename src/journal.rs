use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::item::SyncItem;
use crate::paths::path_hash;

const JOURNAL_FILE_NAME: &str = ".csync_journal.db";
/// Written instead of a real etag for directories that must be re-fetched.
pub const INVALID_ETAG: &str = "_invalid_";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("database is not open")]
    Closed,
    #[error("invalid item type: {0}")]
    InvalidItemType(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    File,
    Dir,
    Symlink,
}

impl ItemType {
    fn as_i64(self) -> i64 {
        match self {
            ItemType::File => 1,
            ItemType::Dir => 2,
            ItemType::Symlink => 3,
        }
    }

    fn parse(value: i64) -> Result<Self, JournalError> {
        match value {
            1 => Ok(ItemType::File),
            2 => Ok(ItemType::Dir),
            3 => Ok(ItemType::Symlink),
            other => Err(JournalError::InvalidItemType(other)),
        }
    }
}

/// One metadata row, keyed by the 64-bit hash of `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub inode: u64,
    pub mode: u32,
    pub modtime: i64,
    pub file_type: ItemType,
    pub etag: Option<String>,
    pub file_id: Option<String>,
    pub remote_perm: Option<String>,
    pub size: i64,
}

impl FileRecord {
    pub fn from_item(item: &SyncItem) -> Self {
        Self {
            path: item.path.clone(),
            inode: item.inode,
            mode: item.mode,
            modtime: item.modtime,
            file_type: if item.is_directory {
                ItemType::Dir
            } else {
                ItemType::File
            },
            etag: item.etag.clone(),
            file_id: item.file_id.clone(),
            remote_perm: item.remote_perm.clone(),
            size: item.size,
        }
    }
}

/// Resume state of a partial download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInfo {
    pub tmp_file: String,
    pub etag: Option<String>,
    pub error_count: u32,
}

/// Resume state of a chunked upload. `chunk` counts completed chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadInfo {
    pub chunk: u32,
    pub transfer_id: u64,
    pub error_count: u32,
    pub size: i64,
    pub modtime: i64,
}

/// Persisted handle to an asynchronous server-side upload finalisation.
/// An absent `poll_url` deletes the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRecord {
    pub path: String,
    pub modtime: i64,
    pub poll_url: Option<String>,
}

struct JournalState {
    conn: Option<SqliteConnection>,
    transaction_open: bool,
    /// Paths whose ancestor etags must not be written this sync.
    avoid_read_filter: Vec<String>,
    legacy_upgrade: bool,
}

/// The durable sync journal. Exclusively owns its database connection; all
/// public operations are serialised by a single lock and must not re-enter.
pub struct SyncJournal {
    db_file: PathBuf,
    in_memory: bool,
    case_insensitive_blacklist: bool,
    state: Mutex<JournalState>,
}

include!("journal_store_impl.rs");

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;
