//! Database handle
//!
//! Opens the backing SQLite file, loads the FTS tokenizer extension,
//! ensures the `__TABLE_MANAGE__` registry exists, and switches the journal
//! to WAL. One `Database` per file; tables share it through an `Arc`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{Result, StorageError};

/// Registry DDL; one row per logical table. Column names are persisted
/// interface and must not change.
const REGISTRY_DDL: &str = "
CREATE TABLE IF NOT EXISTS __TABLE_MANAGE__ (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    tablename TEXT NOT NULL UNIQUE,
    vector_dimension INTEGER NOT NULL,
    HNWS_max_connect INTEGER NOT NULL,
    faiss_fullpath TEXT NOT NULL,
    faiss_new_id INTEGER NOT NULL
);
";

// ============================================================================
// CONFIGURATION
// ============================================================================

/// FTS5 tokenizer used for every shadow table in this database.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FtsTokenizer {
    /// SQLite's built-in unicode61 tokenizer; always available
    #[default]
    Unicode61,
    /// The `simple` CJK tokenizer extension, loaded at open time.
    /// `dict` is handed to its `jieba_dict()` registration function.
    Simple {
        extension: PathBuf,
        dict: Option<PathBuf>,
    },
}

impl FtsTokenizer {
    /// Value for the `tokenize = '...'` clause of the FTS5 DDL.
    pub(crate) fn tokenize_clause(&self) -> &'static str {
        match self {
            FtsTokenizer::Unicode61 => "unicode61",
            FtsTokenizer::Simple { .. } => "simple",
        }
    }

    /// SQL function rendering highlighted match text.
    pub(crate) fn highlight_function(&self) -> &'static str {
        match self {
            FtsTokenizer::Unicode61 => "highlight",
            FtsTokenizer::Simple { .. } => "simple_highlight",
        }
    }

    pub(crate) fn is_simple(&self) -> bool {
        matches!(self, FtsTokenizer::Simple { .. })
    }
}

/// PRAGMA synchronous levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronousMode {
    Off,
    Normal,
    Full,
}

impl SynchronousMode {
    fn as_str(self) -> &'static str {
        match self {
            SynchronousMode::Off => "OFF",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Full => "FULL",
        }
    }
}

/// WAL checkpoint modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn as_str(self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

/// Outcome of a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResult {
    /// Checkpoint could not run to completion (readers held the WAL)
    pub busy: bool,
    /// Frames in the WAL log
    pub log_frames: i64,
    /// Frames moved into the main database
    pub checkpointed_frames: i64,
}

/// One `__TABLE_MANAGE__` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub id: i64,
    pub name: String,
    pub dimension: usize,
    pub connectivity: usize,
    pub index_path: PathBuf,
    /// Next ANN slot to be assigned for this table
    pub next_slot: u64,
}

// ============================================================================
// DATABASE
// ============================================================================

/// Handle to one backing SQLite file.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
    tokenizer: FtsTokenizer,
}

impl Database {
    /// Open (or create) the database at `path`.
    ///
    /// Loads the tokenizer extension when one is configured, registers its
    /// dictionary, creates the registry, and switches the journal to WAL.
    pub fn open(path: impl AsRef<Path>, tokenizer: FtsTokenizer) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;

        if let FtsTokenizer::Simple { extension, dict } = &tokenizer {
            load_tokenizer_extension(&conn, extension, dict.as_deref())?;
        }

        conn.execute_batch(REGISTRY_DDL)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        // each table keeps ~20 hot statements alive
        conn.set_prepared_statement_cache_capacity(64);

        tracing::debug!(path = %path.display(), tokenizer = tokenizer.tokenize_clause(), "database opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            tokenizer,
        })
    }

    /// Open the database at the platform data directory
    /// (e.g. `~/.local/share/engram/engram.db` on Linux).
    pub fn open_default(tokenizer: FtsTokenizer) -> Result<Self> {
        let dirs = ProjectDirs::from("io", "engram", "engram")
            .ok_or_else(|| StorageError::Init("could not determine a data directory".to_string()))?;
        let data_dir = dirs.data_dir();
        fs::create_dir_all(data_dir)?;
        Self::open(data_dir.join("engram.db"), tokenizer)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The tokenizer every shadow table of this database uses.
    pub fn tokenizer(&self) -> &FtsTokenizer {
        &self.tokenizer
    }

    /// Registry metadata for every logical table in this database.
    pub fn tables(&self) -> Result<Vec<TableInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tablename, vector_dimension, HNWS_max_connect, faiss_fullpath, faiss_new_id
             FROM __TABLE_MANAGE__ ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TableInfo {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    dimension: row.get::<_, i64>(2)? as usize,
                    connectivity: row.get::<_, i64>(3)? as usize,
                    index_path: PathBuf::from(row.get::<_, String>(4)?),
                    next_slot: row.get::<_, i64>(5)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Registry metadata for one logical table, if registered.
    pub fn table_info(&self, name: &str) -> Result<Option<TableInfo>> {
        let conn = self.conn()?;
        let info = conn
            .query_row(
                "SELECT id, tablename, vector_dimension, HNWS_max_connect, faiss_fullpath, faiss_new_id
                 FROM __TABLE_MANAGE__ WHERE tablename = ?1",
                [name],
                |row| {
                    Ok(TableInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        dimension: row.get::<_, i64>(2)? as usize,
                        connectivity: row.get::<_, i64>(3)? as usize,
                        index_path: PathBuf::from(row.get::<_, String>(4)?),
                        next_slot: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    /// PRAGMA synchronous.
    pub fn set_synchronous(&self, mode: SynchronousMode) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(&format!("PRAGMA synchronous = {};", mode.as_str()))?;
        Ok(())
    }

    /// PRAGMA wal_autocheckpoint (frames between automatic checkpoints).
    pub fn set_wal_autocheckpoint(&self, frames: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(&format!("PRAGMA wal_autocheckpoint = {frames};"))?;
        Ok(())
    }

    /// Run a WAL checkpoint in the given mode.
    pub fn wal_checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointResult> {
        let conn = self.conn()?;
        let (busy, log_frames, checkpointed_frames) = conn
            .query_row(
                &format!("PRAGMA wal_checkpoint({})", mode.as_str()),
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .map_err(|e| StorageError::Wal(e.to_string()))?;
        Ok(CheckpointResult {
            busy: busy != 0,
            log_frames,
            checkpointed_frames,
        })
    }

    /// Serialized access to the single connection.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Lock)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("tokenizer", &self.tokenizer.tokenize_clause())
            .finish()
    }
}

/// Load the `simple` tokenizer extension and register its dictionary.
/// Extension loading stays enabled only for the duration of the guard.
fn load_tokenizer_extension(
    conn: &Connection,
    extension: &Path,
    dict: Option<&Path>,
) -> Result<()> {
    unsafe {
        let _guard = rusqlite::LoadExtensionGuard::new(conn)?;
        conn.load_extension(extension, None::<&str>)?;
    }
    if let Some(dict) = dict {
        let dict = dict.to_str().ok_or_else(|| {
            StorageError::InvalidArgument("dictionary path is not valid UTF-8".to_string())
        })?;
        // one-shot; the extension keeps the dictionary loaded afterwards
        conn.query_row("SELECT jieba_dict(?1)", [dict], |_| Ok(()))?;
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
