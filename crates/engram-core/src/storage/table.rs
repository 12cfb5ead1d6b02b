//! Per-table engine
//!
//! A [`Table`] couples three stores under one name: the relational rows in
//! `<name>`, the FTS5 shadow `<name>_fts` (rowid = main id), and an HNSW
//! index over the message embeddings (slot = `faiss_index_id` column).
//!
//! Consistency rules:
//! - an insert appends to the HNSW index first, then writes both SQL rows in
//!   one transaction; a failed insert may leave an orphaned slot, which the
//!   search paths skip and any rebuild reclaims;
//! - the index has no per-slot delete, so the forgetting pass and the rebuild
//!   operations replace it wholesale and renumber `faiss_index_id` to the
//!   dense range `[0, N)` in id order;
//! - the in-memory index is swapped only after the rebuild transaction
//!   commits; a failed commit leaves the old index and slot counter live,
//!   matching the rows the rollback restored.
//!
//! A table is single-writer: mutating operations take `&mut self`.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rand::Rng;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction, TransactionBehavior};

use super::{invalid_argument, Database, FtsTokenizer, Result, StorageError};
use crate::embeddings::{BoxedError, EmbeddingHooks};
use crate::memory::{FtsFilter, InsertMessage, StoredMessage, VectorMatch};
use crate::search::{sanitize_match_query, AnnIndex, DEFAULT_CONNECTIVITY};

/// Query embeddings cached per table to avoid re-embedding repeated queries
const QUERY_CACHE_CAPACITY: usize = 64;

// ============================================================================
// PARAMETERS
// ============================================================================

/// HNSW shape of a table's vector index. Fixed for the table's lifetime;
/// reopening an existing table with different values is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    /// Embedding dimension
    pub dimension: usize,
    /// HNSW graph degree
    pub connectivity: usize,
}

impl IndexParams {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            connectivity: DEFAULT_CONNECTIVITY,
        }
    }

    pub fn with_connectivity(mut self, connectivity: usize) -> Self {
        self.connectivity = connectivity;
        self
    }
}

// ============================================================================
// SQL TEXT
// ============================================================================

/// Statement text rendered once per table; execution goes through the
/// connection's prepared-statement cache.
struct TableSql {
    insert_main: String,
    insert_fts: String,
    select_by_id: String,
    select_meta_by_id: String,
    select_by_slot: String,
    select_by_uuid: String,
    select_by_uuid_limit: String,
    select_time_start: String,
    select_time_end: String,
    select_time_span: String,
    fts_match: String,
    fts_match_limit: String,
    fts_highlight: String,
    fts_highlight_limit: String,
    delete_main: String,
    delete_fts: String,
    update_slot: String,
    update_registry: String,
    count_rows: String,
    scan_forget: String,
    scan_slots: String,
    scan_messages: String,
}

impl TableSql {
    fn new(name: &str, tokenizer: &FtsTokenizer) -> Self {
        let hl = tokenizer.highlight_function();
        Self {
            insert_main: format!(
                "INSERT INTO {name} (timestamp, sender, sender_uuid, message, forget_probability, faiss_index_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            insert_fts: format!("INSERT INTO {name}_fts (rowid, message) VALUES (?1, ?2)"),
            select_by_id: format!(
                "SELECT id, timestamp, sender, sender_uuid, message FROM {name} WHERE id = ?1"
            ),
            select_meta_by_id: format!(
                "SELECT id, timestamp, sender, sender_uuid FROM {name} WHERE id = ?1"
            ),
            select_by_slot: format!(
                "SELECT id, timestamp, sender, sender_uuid, message FROM {name} WHERE faiss_index_id = ?1"
            ),
            select_by_uuid: format!(
                "SELECT id, timestamp, sender, sender_uuid, message FROM {name} \
                 WHERE sender_uuid = ?1 ORDER BY id DESC"
            ),
            select_by_uuid_limit: format!(
                "SELECT id, timestamp, sender, sender_uuid, message FROM {name} \
                 WHERE sender_uuid = ?1 ORDER BY id DESC LIMIT ?2"
            ),
            select_time_start: format!(
                "SELECT id, timestamp, sender, sender_uuid, message FROM {name} \
                 WHERE timestamp >= ?1 ORDER BY timestamp DESC"
            ),
            select_time_end: format!(
                "SELECT id, timestamp, sender, sender_uuid, message FROM {name} \
                 WHERE timestamp <= ?1 ORDER BY timestamp DESC"
            ),
            select_time_span: format!(
                "SELECT id, timestamp, sender, sender_uuid, message FROM {name} \
                 WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY timestamp DESC"
            ),
            fts_match: format!(
                "SELECT rowid, message FROM {name}_fts WHERE message MATCH ?1 ORDER BY rowid DESC"
            ),
            fts_match_limit: format!(
                "SELECT rowid, message FROM {name}_fts WHERE message MATCH ?1 \
                 ORDER BY rowid DESC LIMIT ?2"
            ),
            fts_highlight: format!(
                "SELECT rowid, {hl}({name}_fts, 0, ?2, ?3) FROM {name}_fts \
                 WHERE message MATCH ?1 ORDER BY rowid DESC"
            ),
            fts_highlight_limit: format!(
                "SELECT rowid, {hl}({name}_fts, 0, ?2, ?3) FROM {name}_fts \
                 WHERE message MATCH ?1 ORDER BY rowid DESC LIMIT ?4"
            ),
            delete_main: format!("DELETE FROM {name} WHERE id = ?1"),
            delete_fts: format!("DELETE FROM {name}_fts WHERE rowid = ?1"),
            update_slot: format!("UPDATE {name} SET faiss_index_id = ?1 WHERE id = ?2"),
            update_registry: "UPDATE __TABLE_MANAGE__ SET faiss_new_id = ?1 WHERE tablename = ?2"
                .to_string(),
            count_rows: format!("SELECT COUNT(*) FROM {name}"),
            scan_forget: format!("SELECT id, forget_probability FROM {name} ORDER BY id"),
            scan_slots: format!("SELECT id, faiss_index_id FROM {name} ORDER BY id"),
            scan_messages: format!("SELECT id, message FROM {name} ORDER BY id"),
        }
    }
}

fn table_ddl(name: &str, tokenizer: &FtsTokenizer) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {name} (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            timestamp INTEGER NOT NULL,
            sender TEXT,
            sender_uuid TEXT NOT NULL,
            message TEXT NOT NULL,
            forget_probability REAL NOT NULL
                CHECK (forget_probability >= 0.0 AND forget_probability <= 1.0),
            faiss_index_id INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS {name}_sender_uuid_idx ON {name} (sender_uuid);
        CREATE INDEX IF NOT EXISTS {name}_timestamp_idx ON {name} (timestamp);
        CREATE INDEX IF NOT EXISTS {name}_slot_idx ON {name} (faiss_index_id);
        CREATE VIRTUAL TABLE IF NOT EXISTS {name}_fts USING fts5(message, tokenize = '{tok}');",
        tok = tokenizer.tokenize_clause(),
    )
}

/// Table names are interpolated into DDL, so they must be plain identifiers.
fn validate_table_name(name: &str) -> Result<()> {
    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !starts_ok || !rest_ok || name.len() > 128 {
        return Err(invalid_argument(format!(
            "`{name}` is not a valid table name"
        )));
    }
    if name.starts_with("sqlite_") || name.starts_with("__") {
        return Err(invalid_argument(format!(
            "`{name}` collides with a reserved prefix"
        )));
    }
    Ok(())
}

/// `<db_dir>/<db_stem>/<table>.faiss`
fn default_index_path(db_path: &Path, table: &str) -> PathBuf {
    let parent = db_path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = db_path.file_stem().map(|s| s.to_os_string()).unwrap_or_default();
    parent.join(stem).join(format!("{table}.faiss"))
}

fn check_limit(limit: Option<usize>) -> Result<Option<i64>> {
    match limit {
        Some(0) => Err(invalid_argument("limit must be greater than zero")),
        Some(n) => Ok(Some(n as i64)),
        None => Ok(None),
    }
}

fn validate_message(data: &InsertMessage) -> Result<()> {
    let p = data.forget_probability;
    if !p.is_finite() || !(0.0..=1.0).contains(&p) {
        return Err(invalid_argument(format!(
            "forget_probability {p} is outside [0, 1]"
        )));
    }
    Ok(())
}

/// Empty sender names are stored as NULL.
fn normalize_sender(sender: Option<&str>) -> Option<&str> {
    match sender {
        Some(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// Pick the MATCH clause and its bound text for the unified full-text search.
///
/// `fts` is passed through as a raw FTS5 expression. `simple_query` is plain
/// text: under the CJK tokenizer extension the conversion happens engine-side
/// via `simple_query()`, otherwise it is sanitized locally.
fn fts_match_clause(simple_tokenizer: bool, filter: &FtsFilter) -> Result<(&'static str, String)> {
    match (&filter.fts, &filter.simple_query) {
        (Some(_), Some(_)) => Err(invalid_argument(
            "fts and simple_query are mutually exclusive",
        )),
        (None, None) => Err(invalid_argument("one of fts or simple_query is required")),
        (Some(fts), None) => {
            if fts.trim().is_empty() {
                return Err(invalid_argument("fts expression is empty"));
            }
            Ok(("f.message MATCH ?", fts.clone()))
        }
        (None, Some(plain)) => {
            if simple_tokenizer {
                if plain.trim().is_empty() {
                    return Err(invalid_argument("simple_query is empty"));
                }
                Ok(("f.message MATCH simple_query(?)", plain.clone()))
            } else {
                let expr = sanitize_match_query(plain).ok_or_else(|| {
                    invalid_argument("simple_query contains no searchable tokens")
                })?;
                Ok(("f.message MATCH ?", expr))
            }
        }
    }
}

// ============================================================================
// TABLE
// ============================================================================

/// One logical table: relational rows + FTS shadow + HNSW index.
pub struct Table {
    db: Arc<Database>,
    name: String,
    dimension: usize,
    connectivity: usize,
    index_path: PathBuf,
    /// Next ANN slot to assign; persisted to the registry as `faiss_new_id`
    next_slot: u64,
    index: AnnIndex,
    embedder: EmbeddingHooks,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
    sql: TableSql,
    dropped: bool,
}

impl Table {
    /// Open or create the logical table `name`.
    ///
    /// Runs in one EXCLUSIVE transaction: reads the registry row (or inserts
    /// a fresh one with `faiss_new_id = 0`), creates the main and shadow
    /// tables if absent, then loads the serialized index or builds an empty
    /// one. Persisted `IndexParams` win; a caller disagreeing with them gets
    /// [`StorageError::ParamMismatch`].
    pub fn open(db: Arc<Database>, name: &str, index_params: IndexParams) -> Result<Self> {
        validate_table_name(name)?;
        if index_params.dimension == 0 {
            return Err(invalid_argument("dimension must be greater than zero"));
        }
        if index_params.connectivity == 0 {
            return Err(invalid_argument("connectivity must be greater than zero"));
        }

        let (dimension, connectivity, index_path, next_slot, index) = {
            let mut conn = db.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

            let registered = tx
                .query_row(
                    "SELECT vector_dimension, HNWS_max_connect, faiss_fullpath, faiss_new_id \
                     FROM __TABLE_MANAGE__ WHERE tablename = ?1",
                    [name],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)? as usize,
                            row.get::<_, i64>(1)? as usize,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)? as u64,
                        ))
                    },
                )
                .optional()?;

            let (dimension, connectivity, index_path, next_slot) = match registered {
                Some((dim, degree, path, slot)) => {
                    if dim != index_params.dimension || degree != index_params.connectivity {
                        return Err(StorageError::ParamMismatch {
                            table: name.to_string(),
                            persisted_dimension: dim,
                            persisted_connectivity: degree,
                            requested_dimension: index_params.dimension,
                            requested_connectivity: index_params.connectivity,
                        });
                    }
                    (dim, degree, PathBuf::from(path), slot)
                }
                None => {
                    let path = default_index_path(db.path(), name);
                    let path_str = path
                        .to_str()
                        .ok_or_else(|| invalid_argument("index path is not valid UTF-8"))?;
                    tx.execute(
                        "INSERT INTO __TABLE_MANAGE__ \
                         (tablename, vector_dimension, HNWS_max_connect, faiss_fullpath, faiss_new_id) \
                         VALUES (?1, ?2, ?3, ?4, 0)",
                        params![
                            name,
                            index_params.dimension as i64,
                            index_params.connectivity as i64,
                            path_str
                        ],
                    )?;
                    (index_params.dimension, index_params.connectivity, path, 0)
                }
            };

            tx.execute_batch(&table_ddl(name, db.tokenizer()))?;

            let index = if index_path.exists() {
                AnnIndex::load(&index_path, dimension, connectivity)?
            } else {
                if next_slot > 0 {
                    tracing::warn!(
                        table = name,
                        next_slot,
                        "index file missing; stored vectors need full_rebuild_index"
                    );
                }
                AnnIndex::new(dimension, connectivity)?
            };

            tx.commit()?;
            (dimension, connectivity, index_path, next_slot, index)
        };

        tracing::info!(
            table = name,
            dimension,
            connectivity,
            vectors = index.len(),
            "table opened"
        );

        let sql = TableSql::new(name, db.tokenizer());
        Ok(Self {
            db,
            name: name.to_string(),
            dimension,
            connectivity,
            index_path,
            next_slot,
            index,
            embedder: EmbeddingHooks::new(),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
            sql,
            dropped: false,
        })
    }

    // ------------------------------------------------------------------
    // accessors
    // ------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn connectivity(&self) -> usize {
        self.connectivity
    }

    /// Next ANN slot to be assigned.
    pub fn next_slot(&self) -> u64 {
        self.next_slot
    }

    /// On-disk location of the serialized index.
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Number of remembered messages.
    pub fn message_count(&self) -> Result<u64> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(&self.sql.count_rows)?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // embedding callbacks
    // ------------------------------------------------------------------

    /// Install the single-text embedding callback.
    pub fn set_embedder(
        &mut self,
        f: impl Fn(&str) -> std::result::Result<Vec<f32>, BoxedError> + Send + 'static,
    ) {
        self.embedder.set_single(f);
    }

    /// Install the batch embedding callback (preferred for `adds`).
    pub fn set_batch_embedder(
        &mut self,
        f: impl Fn(&[String]) -> std::result::Result<Vec<f32>, BoxedError> + Send + 'static,
    ) {
        self.embedder.set_batch(f);
    }

    /// Tune the index's query-time expansion factor.
    pub fn set_ef_search(&mut self, ef_search: usize) -> Result<()> {
        if ef_search == 0 {
            return Err(invalid_argument("ef_search must be greater than zero"));
        }
        self.index.set_ef_search(ef_search);
        Ok(())
    }

    // ------------------------------------------------------------------
    // inserts
    // ------------------------------------------------------------------

    /// Remember one message. Returns the assigned row id.
    pub fn add(&mut self, data: &InsertMessage) -> Result<i64> {
        validate_message(data)?;
        let vector = self.embedder.embed_one(&data.message)?;
        self.check_dimension(vector.len())?;

        // index first; a failure below leaves an orphaned slot that the
        // search paths skip and the next rebuild reclaims
        let slot = self.next_slot;
        self.index.add(slot, &vector)?;
        self.next_slot += 1;

        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let id = {
            let mut insert_main = tx.prepare_cached(&self.sql.insert_main)?;
            insert_main.execute(params![
                data.timestamp,
                normalize_sender(data.sender.as_deref()),
                data.sender_uuid,
                data.message,
                data.forget_probability,
                slot as i64,
            ])?;
            let id = tx.last_insert_rowid();
            let mut insert_fts = tx.prepare_cached(&self.sql.insert_fts)?;
            insert_fts.execute(params![id, data.message])?;
            id
        };
        tx.commit()?;
        Ok(id)
    }

    /// Remember a batch of messages. Embeds them in one callback invocation
    /// when a batch callback is installed; slots are assigned contiguously
    /// in input order. Returns the assigned row ids.
    pub fn adds(&mut self, datas: &[InsertMessage]) -> Result<Vec<i64>> {
        if datas.is_empty() {
            return Ok(Vec::new());
        }
        for data in datas {
            validate_message(data)?;
        }

        let texts: Vec<String> = datas.iter().map(|d| d.message.clone()).collect();
        let vectors = self.embedder.embed_many(&texts)?;
        let expected = datas.len() * self.dimension;
        if vectors.len() != expected {
            return Err(StorageError::DimensionMismatch {
                expected,
                got: vectors.len(),
            });
        }

        let first_slot = self.next_slot;
        self.index.add_batch(first_slot, &vectors)?;
        self.next_slot += datas.len() as u64;

        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let ids = {
            let mut insert_main = tx.prepare_cached(&self.sql.insert_main)?;
            let mut insert_fts = tx.prepare_cached(&self.sql.insert_fts)?;
            let mut ids = Vec::with_capacity(datas.len());
            for (offset, data) in datas.iter().enumerate() {
                insert_main.execute(params![
                    data.timestamp,
                    normalize_sender(data.sender.as_deref()),
                    data.sender_uuid,
                    data.message,
                    data.forget_probability,
                    (first_slot + offset as u64) as i64,
                ])?;
                let id = tx.last_insert_rowid();
                insert_fts.execute(params![id, data.message])?;
                ids.push(id);
            }
            ids
        };
        tx.commit()?;
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // metadata searches
    // ------------------------------------------------------------------

    /// Look up one message by primary key. Ids at or below 1 are rejected.
    pub fn search_id(&self, id: i64) -> Result<Option<StoredMessage>> {
        if id <= 1 {
            return Err(invalid_argument("id must be greater than 1"));
        }
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(&self.sql.select_by_id)?;
        Ok(stmt.query_row([id], StoredMessage::from_row).optional()?)
    }

    /// Messages of one speaker, newest id first.
    pub fn search_list_uuid(
        &self,
        sender_uuid: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let limit = check_limit(limit)?;
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let rows = if let Some(n) = limit {
            let mut stmt = tx.prepare_cached(&self.sql.select_by_uuid_limit)?;
            stmt.query_map(params![sender_uuid, n], StoredMessage::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = tx.prepare_cached(&self.sql.select_by_uuid)?;
            stmt.query_map(params![sender_uuid], StoredMessage::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        Ok(rows)
    }

    /// Messages with `timestamp >= start`, newest first.
    pub fn search_list_time_start(&self, start: i64) -> Result<Vec<StoredMessage>> {
        self.time_query(&self.sql.select_time_start, params![start])
    }

    /// Messages with `timestamp <= end`, newest first.
    pub fn search_list_time_end(&self, end: i64) -> Result<Vec<StoredMessage>> {
        self.time_query(&self.sql.select_time_end, params![end])
    }

    /// Messages with `start <= timestamp <= end`, newest first.
    pub fn search_list_time_start_end(&self, start: i64, end: i64) -> Result<Vec<StoredMessage>> {
        self.time_query(&self.sql.select_time_span, params![start, end])
    }

    fn time_query(
        &self,
        sql: &str,
        query_params: impl rusqlite::Params,
    ) -> Result<Vec<StoredMessage>> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare_cached(sql)?;
            stmt.query_map(query_params, StoredMessage::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // full-text searches
    // ------------------------------------------------------------------

    /// Full-text search with a raw FTS5 MATCH expression; hits newest first,
    /// metadata joined from the main row, message = matched text.
    pub fn search_list_fts(&self, fts: &str, limit: Option<usize>) -> Result<Vec<StoredMessage>> {
        let limit = check_limit(limit)?;
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let hits: Vec<(i64, String)> = if let Some(n) = limit {
            let mut stmt = tx.prepare_cached(&self.sql.fts_match_limit)?;
            stmt.query_map(params![fts, n], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = tx.prepare_cached(&self.sql.fts_match)?;
            stmt.query_map(params![fts], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let rows = self.attach_metadata(&tx, hits)?;
        tx.commit()?;
        Ok(rows)
    }

    /// As [`search_list_fts`](Self::search_list_fts), but `message` carries
    /// the tokenizer's highlight rendering with matches wrapped in
    /// `open`/`close`.
    pub fn search_list_highlight_fts(
        &self,
        fts: &str,
        open: &str,
        close: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let limit = check_limit(limit)?;
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let hits: Vec<(i64, String)> = if let Some(n) = limit {
            let mut stmt = tx.prepare_cached(&self.sql.fts_highlight_limit)?;
            stmt.query_map(params![fts, open, close, n], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = tx.prepare_cached(&self.sql.fts_highlight)?;
            stmt.query_map(params![fts, open, close], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let rows = self.attach_metadata(&tx, hits)?;
        tx.commit()?;
        Ok(rows)
    }

    /// Unified full-text search over an [`FtsFilter`]: raw expression or
    /// plain-text query, optional inclusive time bounds, optional limit.
    pub fn search_list_fts_filter(&self, filter: &FtsFilter) -> Result<Vec<StoredMessage>> {
        let (match_clause, match_text) =
            fts_match_clause(self.db.tokenizer().is_simple(), filter)?;

        let mut sql = format!(
            "SELECT f.rowid, f.message FROM {name}_fts f \
             JOIN {name} m ON m.id = f.rowid WHERE {match_clause}",
            name = self.name,
        );
        let mut bind_values: Vec<Value> = vec![Value::Text(match_text)];
        if let Some(start) = filter.start {
            sql.push_str(" AND m.timestamp >= ?");
            bind_values.push(Value::Integer(start));
        }
        if let Some(end) = filter.end {
            sql.push_str(" AND m.timestamp <= ?");
            bind_values.push(Value::Integer(end));
        }
        sql.push_str(" ORDER BY f.rowid DESC");
        if let Some(n) = check_limit(filter.limit)? {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(n));
        }

        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let hits: Vec<(i64, String)> = {
            let mut stmt = tx.prepare_cached(&sql)?;
            stmt.query_map(params_from_iter(bind_values), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        let rows = self.attach_metadata(&tx, hits)?;
        tx.commit()?;
        Ok(rows)
    }

    /// Join FTS hits with their main rows. A hit without a backing row is
    /// dropped (the cross-store recovery rule).
    fn attach_metadata(
        &self,
        tx: &Transaction<'_>,
        hits: Vec<(i64, String)>,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = tx.prepare_cached(&self.sql.select_meta_by_id)?;
        let mut rows = Vec::with_capacity(hits.len());
        for (id, message) in hits {
            let meta = stmt
                .query_row([id], |row| {
                    Ok((
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .optional()?;
            match meta {
                Some((timestamp, sender, sender_uuid)) => rows.push(StoredMessage {
                    id,
                    timestamp,
                    sender,
                    sender_uuid,
                    message,
                }),
                None => tracing::debug!(id, "full-text hit without a backing row, skipping"),
            }
        }
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // vector searches
    // ------------------------------------------------------------------

    /// Embed `text` and return its `k` nearest messages in ascending
    /// squared-L2 distance. Slots without a backing row are skipped, so
    /// fewer than `k` rows may come back.
    pub fn search_list_vector_text(&self, text: &str, k: usize) -> Result<Vec<VectorMatch>> {
        if k == 0 {
            return Err(invalid_argument("k must be greater than zero"));
        }
        let vector = self.query_embedding(text)?;
        let hits = self.index.search(&vector, k)?;

        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let rows = self.attach_vector_rows(&tx, &hits)?;
        tx.commit()?;
        Ok(rows)
    }

    /// Batch form: one list of up-to-`k` matches per input text, in input
    /// order.
    pub fn search_list_vector_texts(
        &self,
        texts: &[String],
        k: usize,
    ) -> Result<Vec<Vec<VectorMatch>>> {
        if k == 0 {
            return Err(invalid_argument("k must be greater than zero"));
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.embedder.embed_many(texts)?;
        let expected = texts.len() * self.dimension;
        if vectors.len() != expected {
            return Err(StorageError::DimensionMismatch {
                expected,
                got: vectors.len(),
            });
        }

        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let mut results = Vec::with_capacity(texts.len());
        for query in vectors.chunks_exact(self.dimension) {
            let hits = self.index.search(query, k)?;
            results.push(self.attach_vector_rows(&tx, &hits)?);
        }
        tx.commit()?;
        Ok(results)
    }

    fn attach_vector_rows(
        &self,
        tx: &Transaction<'_>,
        hits: &[(u64, f32)],
    ) -> Result<Vec<VectorMatch>> {
        let mut stmt = tx.prepare_cached(&self.sql.select_by_slot)?;
        let mut rows = Vec::with_capacity(hits.len());
        for &(slot, distance) in hits {
            let row = stmt
                .query_row([slot as i64], StoredMessage::from_row)
                .optional()?;
            match row {
                Some(message) => rows.push(VectorMatch::from_message(message, distance)),
                None => tracing::debug!(slot, "vector hit without a backing row, skipping"),
            }
        }
        Ok(rows)
    }

    /// Embed a query string through the per-table LRU cache. The callback
    /// itself runs with no store lock held.
    fn query_embedding(&self, text: &str) -> Result<Vec<f32>> {
        {
            let mut cache = self.query_cache.lock().map_err(|_| StorageError::Lock)?;
            if let Some(vector) = cache.get(text) {
                return Ok(vector.clone());
            }
        }
        let vector = self.embedder.embed_one(text)?;
        self.check_dimension(vector.len())?;
        let mut cache = self.query_cache.lock().map_err(|_| StorageError::Lock)?;
        cache.put(text.to_string(), vector.clone());
        Ok(vector)
    }

    fn check_dimension(&self, got: usize) -> Result<()> {
        if got != self.dimension {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimension,
                got,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // forgetting and rebuilds
    // ------------------------------------------------------------------

    /// Purge rows by Bernoulli trial on their `forget_probability`, then
    /// rebuild the index from the survivors. One IMMEDIATE transaction;
    /// rows at probability 0 always survive, rows at 1 never do.
    /// Returns the number of rows forgotten.
    pub fn forgotten(&mut self) -> Result<usize> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut rng = rand::rng();
        let doomed: Vec<i64> = {
            let mut stmt = tx.prepare_cached(&self.sql.scan_forget)?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?;
            let mut doomed = Vec::new();
            for row in rows {
                let (id, p) = row?;
                let p = if p >= 1.0 - f64::EPSILON {
                    1.0
                } else {
                    p.clamp(0.0, 1.0)
                };
                if p > 0.0 && rng.random_bool(p) {
                    doomed.push(id);
                }
            }
            doomed
        };

        {
            let mut delete_fts = tx.prepare_cached(&self.sql.delete_fts)?;
            let mut delete_main = tx.prepare_cached(&self.sql.delete_main)?;
            for id in &doomed {
                delete_fts.execute([id])?;
                delete_main.execute([id])?;
            }
        }

        let (index, next_slot) = self.rebuilt_from_store(&tx)?;
        // commit first: if it fails, the rows keep their old slot numbers and
        // the old index must stay live
        tx.commit()?;
        self.index = index;
        self.next_slot = next_slot;

        tracing::info!(
            table = %self.name,
            forgotten = doomed.len(),
            surviving = next_slot,
            "forgetting pass complete"
        );
        Ok(doomed.len())
    }

    /// Rebuild the index from the vectors it already stores, renumbering
    /// slots to `[0, N)` in id order. Reclaims orphaned slots.
    pub fn rebuild_index(&mut self) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (index, next_slot) = self.rebuilt_from_store(&tx)?;
        tx.commit()?;
        self.index = index;
        self.next_slot = next_slot;
        tracing::info!(table = %self.name, vectors = next_slot, "index rebuilt");
        Ok(())
    }

    /// Rebuild the index by re-embedding every surviving message. Use after
    /// an embedding-model change, or when the index file was lost.
    pub fn full_rebuild_index(&mut self) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (index, next_slot) = self.rebuilt_from_messages(&tx)?;
        tx.commit()?;
        self.index = index;
        self.next_slot = next_slot;
        tracing::info!(table = %self.name, vectors = next_slot, "index rebuilt from re-embedded messages");
        Ok(())
    }

    fn rebuilt_from_store(&self, tx: &Transaction<'_>) -> Result<(AnnIndex, u64)> {
        let survivors: Vec<(i64, u64)> = {
            let mut stmt = tx.prepare_cached(&self.sql.scan_slots)?;
            stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut vectors = vec![0.0f32; survivors.len() * self.dimension];
        for (i, (_, slot)) in survivors.iter().enumerate() {
            self.index
                .reconstruct(*slot, &mut vectors[i * self.dimension..(i + 1) * self.dimension])?;
        }

        let ids: Vec<i64> = survivors.into_iter().map(|(id, _)| id).collect();
        self.renumber(tx, &ids, &vectors)
    }

    fn rebuilt_from_messages(&self, tx: &Transaction<'_>) -> Result<(AnnIndex, u64)> {
        let survivors: Vec<(i64, String)> = {
            let mut stmt = tx.prepare_cached(&self.sql.scan_messages)?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let texts: Vec<String> = survivors.iter().map(|(_, text)| text.clone()).collect();
        let vectors = self.embedder.embed_many(&texts)?;
        let expected = texts.len() * self.dimension;
        if vectors.len() != expected {
            return Err(StorageError::DimensionMismatch {
                expected,
                got: vectors.len(),
            });
        }

        let ids: Vec<i64> = survivors.into_iter().map(|(id, _)| id).collect();
        self.renumber(tx, &ids, &vectors)
    }

    /// Build a fresh index holding `vectors` at slots `0..ids.len()` and
    /// point each row (in the given order) at its new slot.
    fn renumber(&self, tx: &Transaction<'_>, ids: &[i64], vectors: &[f32]) -> Result<(AnnIndex, u64)> {
        let mut rebuilt = AnnIndex::new(self.dimension, self.connectivity)?;
        rebuilt.add_batch(0, vectors)?;

        {
            let mut update_slot = tx.prepare_cached(&self.sql.update_slot)?;
            for (slot, id) in ids.iter().enumerate() {
                update_slot.execute(params![slot as i64, id])?;
            }
        }
        {
            let mut update_registry = tx.prepare_cached(&self.sql.update_registry)?;
            update_registry.execute(params![ids.len() as i64, self.name])?;
        }
        Ok((rebuilt, ids.len() as u64))
    }

    // ------------------------------------------------------------------
    // persistence and teardown
    // ------------------------------------------------------------------

    /// Persist `faiss_new_id` to the registry and serialize the index to its
    /// on-disk location. Idempotent; also runs on drop.
    pub fn save_index(&mut self) -> Result<()> {
        {
            let conn = self.db.conn()?;
            let mut stmt = conn.prepare_cached(&self.sql.update_registry)?;
            stmt.execute(params![self.next_slot as i64, self.name])?;
        }
        self.index.save(&self.index_path)?;
        Ok(())
    }

    /// Remove the logical table: both SQL tables, the registry row, the
    /// in-memory index, and the serialized index file.
    pub fn drop_table(mut self) -> Result<()> {
        {
            let mut conn = self.db.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
            tx.execute_batch(&format!(
                "DROP TABLE IF EXISTS {name}; DROP TABLE IF EXISTS {name}_fts;",
                name = self.name,
            ))?;
            tx.execute(
                "DELETE FROM __TABLE_MANAGE__ WHERE tablename = ?1",
                [&self.name],
            )?;
            tx.commit()?;
        }
        // only now is the table really gone; an early return above leaves the
        // drop-path save in place
        self.dropped = true;
        if let Err(e) = std::fs::remove_file(&self.index_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        tracing::info!(table = %self.name, "table dropped");
        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.dropped {
            return;
        }
        if let Err(e) = self.save_index() {
            tracing::warn!(table = %self.name, error = %e, "failed to persist index on drop");
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("dimension", &self.dimension)
            .field("connectivity", &self.connectivity)
            .field("next_slot", &self.next_slot)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Database, FtsTokenizer};
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const DIM: usize = 4;

    /// Deterministic stub embedding: the tail of SHA-256(text), one byte per
    /// dimension, scaled into [0, 1]. Identical text gives identical vectors.
    fn stub_vector(text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        digest[digest.len() - DIM..]
            .iter()
            .map(|b| *b as f32 / 255.0)
            .collect()
    }

    fn open_db(dir: &TempDir) -> Arc<Database> {
        Arc::new(Database::open(dir.path().join("memory.db"), FtsTokenizer::Unicode61).unwrap())
    }

    fn open_table(db: &Arc<Database>, name: &str) -> Table {
        let mut table = Table::open(
            Arc::clone(db),
            name,
            IndexParams::new(DIM).with_connectivity(8),
        )
        .unwrap();
        table.set_embedder(|text| Ok(stub_vector(text)));
        table
    }

    fn msg(uuid: &str, text: &str, timestamp: i64, p: f64) -> InsertMessage {
        InsertMessage {
            timestamp,
            sender: Some(uuid.to_string()),
            sender_uuid: uuid.to_string(),
            message: text.to_string(),
            forget_probability: p,
        }
    }

    fn probe(db: &Database) -> rusqlite::Connection {
        rusqlite::Connection::open(db.path()).unwrap()
    }

    // ---------------- inserts and id lookup ----------------

    #[test]
    fn add_then_search_id() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");

        // id 1 is below the input-check floor, so burn it on a throwaway row
        table.add(&msg("warmup", "warmup", 0, 0.0)).unwrap();
        let id = table.add(&msg("A", "hi", 1000, 0.0)).unwrap();
        assert_eq!(id, 2);

        let row = table.search_id(2).unwrap().unwrap();
        assert_eq!(row.id, 2);
        assert_eq!(row.timestamp, 1000);
        assert_eq!(row.sender.as_deref(), Some("A"));
        assert_eq!(row.sender_uuid, "A");
        assert_eq!(row.message, "hi");
    }

    #[test]
    fn search_id_rejects_small_ids() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let table = open_table(&db, "chat");
        for id in [-1, 0, 1] {
            assert!(matches!(
                table.search_id(id),
                Err(StorageError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn search_id_missing_row_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let table = open_table(&db, "chat");
        assert!(table.search_id(99).unwrap().is_none());
    }

    #[test]
    fn empty_sender_is_stored_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");

        table.add(&msg("warmup", "warmup", 0, 0.0)).unwrap();
        let mut message = msg("A", "anonymous hello", 5, 0.0);
        message.sender = Some(String::new());
        table.add(&message).unwrap();

        let row = table.search_id(2).unwrap().unwrap();
        assert_eq!(row.sender, None);
    }

    #[test]
    fn slots_are_assigned_contiguously() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        assert_eq!(table.next_slot(), 0);

        let batch = vec![
            msg("A", "one", 1, 0.0),
            msg("A", "two", 2, 0.0),
            msg("B", "three", 3, 0.0),
        ];
        let ids = table.adds(&batch).unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(table.next_slot(), 3);

        table.add(&msg("B", "four", 4, 0.0)).unwrap();
        assert_eq!(table.next_slot(), 4);

        let slots: Vec<i64> = probe(&db)
            .prepare("SELECT faiss_index_id FROM chat ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(slots, vec![0, 1, 2, 3]);
    }

    #[test]
    fn adds_uses_the_batch_hook_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = Table::open(
            Arc::clone(&db),
            "chat",
            IndexParams::new(DIM).with_connectivity(8),
        )
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        table.set_batch_embedder(move |texts| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().flat_map(|t| stub_vector(t)).collect())
        });

        table
            .adds(&[msg("A", "one", 1, 0.0), msg("A", "two", 2, 0.0)])
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(table.message_count().unwrap(), 2);
    }

    #[test]
    fn insert_and_shadow_row_counts_agree() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        for i in 0..5 {
            table.add(&msg("A", &format!("message {i}"), i, 0.0)).unwrap();
        }

        let probe = probe(&db);
        let main: i64 = probe
            .query_row("SELECT COUNT(*) FROM chat", [], |r| r.get(0))
            .unwrap();
        let fts: i64 = probe
            .query_row("SELECT COUNT(*) FROM chat_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(main, 5);
        assert_eq!(fts, 5);
    }

    // ---------------- input validation ----------------

    #[test]
    fn forget_probability_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");

        for bad in [-0.1, 1.5, f64::NAN] {
            let result = table.add(&msg("A", "x", 0, bad));
            assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
        }
        // nothing was inserted and no slot was burned
        assert_eq!(table.message_count().unwrap(), 0);
        assert_eq!(table.next_slot(), 0);
    }

    #[test]
    fn embedder_dimension_is_checked_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = Table::open(
            Arc::clone(&db),
            "chat",
            IndexParams::new(DIM).with_connectivity(8),
        )
        .unwrap();
        table.set_embedder(|_| Ok(vec![1.0, 2.0])); // wrong length

        assert!(matches!(
            table.add(&msg("A", "x", 0, 0.0)),
            Err(StorageError::DimensionMismatch { expected: DIM, got: 2 })
        ));
        assert_eq!(table.message_count().unwrap(), 0);
        assert_eq!(table.next_slot(), 0);
    }

    #[test]
    fn unset_embedder_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = Table::open(
            Arc::clone(&db),
            "chat",
            IndexParams::new(DIM).with_connectivity(8),
        )
        .unwrap();
        assert!(matches!(
            table.add(&msg("A", "x", 0, 0.0)),
            Err(StorageError::Embedding(_))
        ));
    }

    #[test]
    fn zero_limit_and_zero_k_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let table = open_table(&db, "chat");

        assert!(matches!(
            table.search_list_uuid("A", Some(0)),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.search_list_fts("x", Some(0)),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.search_list_vector_text("x", 0),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.search_list_vector_texts(&["x".to_string()], 0),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn table_names_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        for bad in ["", "1chat", "chat; DROP", "chat table", "sqlite_seq", "__chat"] {
            let result = Table::open(Arc::clone(&db), bad, IndexParams::new(DIM));
            assert!(
                matches!(result, Err(StorageError::InvalidArgument(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn reopening_with_different_params_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let table = open_table(&db, "chat");
        drop(table);

        let result = Table::open(
            Arc::clone(&db),
            "chat",
            IndexParams::new(DIM * 2).with_connectivity(8),
        );
        assert!(matches!(result, Err(StorageError::ParamMismatch { .. })));
    }

    // ---------------- metadata searches ----------------

    #[test]
    fn uuid_search_orders_newest_first_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");

        for i in 0..4 {
            table.add(&msg("alice", &format!("a{i}"), i, 0.0)).unwrap();
        }
        table.add(&msg("bob", "b0", 9, 0.0)).unwrap();

        let all = table.search_list_uuid("alice", None).unwrap();
        assert_eq!(all.len(), 4);
        let ids: Vec<i64> = all.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);

        let top2 = table.search_list_uuid("alice", Some(2)).unwrap();
        assert_eq!(top2.len(), 2);
        assert_eq!(top2[0].id, 4);
    }

    #[test]
    fn time_searches_use_inclusive_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        for t in [100, 200, 300] {
            table.add(&msg("A", &format!("t{t}"), t, 0.0)).unwrap();
        }

        let from_200 = table.search_list_time_start(200).unwrap();
        assert_eq!(
            from_200.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
            vec![300, 200]
        );

        let until_200 = table.search_list_time_end(200).unwrap();
        assert_eq!(
            until_200.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
            vec![200, 100]
        );

        let span = table.search_list_time_start_end(200, 300).unwrap();
        assert_eq!(
            span.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
            vec![300, 200]
        );
    }

    // ---------------- full-text searches ----------------

    #[test]
    fn fts_match_and_highlight() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        table.add(&msg("A", "hello world", 1, 0.0)).unwrap();
        table.add(&msg("B", "hello there", 2, 0.0)).unwrap();
        table.add(&msg("C", "world peace", 3, 0.0)).unwrap();

        let hits = table.search_list_fts("hello", None).unwrap();
        assert_eq!(hits.len(), 2);
        // newest rowid first
        assert_eq!(hits[0].id, 2);
        assert_eq!(hits[1].id, 1);
        assert_eq!(hits[0].sender_uuid, "B");

        let highlighted = table
            .search_list_highlight_fts("hello", "[", "]", None)
            .unwrap();
        assert_eq!(highlighted.len(), 2);
        for hit in &highlighted {
            assert!(hit.message.starts_with("[hello]"), "got {:?}", hit.message);
        }

        let limited = table
            .search_list_highlight_fts("hello", "[", "]", Some(1))
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, 2);
    }

    #[test]
    fn fts_filter_unifies_query_forms() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        table.add(&msg("A", "hello world", 1000, 0.0)).unwrap();
        table.add(&msg("B", "hello there", 2000, 0.0)).unwrap();
        table.add(&msg("C", "goodbye world", 3000, 0.0)).unwrap();

        // plain text, sanitized: implicit AND of tokens
        let both = table
            .search_list_fts_filter(&FtsFilter::simple("hello world"))
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].id, 1);

        // raw FTS5 expression
        let either = table
            .search_list_fts_filter(&FtsFilter::fts("hello OR goodbye"))
            .unwrap();
        assert_eq!(either.len(), 3);

        // inclusive time bounds narrow the hits
        let recent = table
            .search_list_fts_filter(&FtsFilter::simple("hello").between(Some(2000), None))
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, 2);

        // limit caps newest-first
        let capped = table
            .search_list_fts_filter(&FtsFilter::fts("world").limit(1))
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, 3);
    }

    #[test]
    fn fts_filter_rejects_ambiguous_input() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let table = open_table(&db, "chat");

        let both = FtsFilter {
            fts: Some("a".to_string()),
            simple_query: Some("b".to_string()),
            ..FtsFilter::default()
        };
        assert!(matches!(
            table.search_list_fts_filter(&both),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.search_list_fts_filter(&FtsFilter::default()),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.search_list_fts_filter(&FtsFilter::simple("  ")),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.search_list_fts_filter(&FtsFilter::simple("x").limit(0)),
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn fts_match_clause_picks_the_engine_side_helper() {
        let filter = FtsFilter::simple("你好 世界");

        let (clause, text) = fts_match_clause(true, &filter).unwrap();
        assert_eq!(clause, "f.message MATCH simple_query(?)");
        assert_eq!(text, "你好 世界");

        let (clause, text) = fts_match_clause(false, &filter).unwrap();
        assert_eq!(clause, "f.message MATCH ?");
        assert_eq!(text, "\"你好\" \"世界\"");
    }

    // ---------------- vector searches ----------------

    #[test]
    fn vector_search_finds_exact_match_first() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        table.add(&msg("A", "the weather is nice", 1, 0.0)).unwrap();
        table.add(&msg("B", "rust borrow checker", 2, 0.0)).unwrap();
        table.add(&msg("C", "tea ceremony", 3, 0.0)).unwrap();

        let hits = table
            .search_list_vector_text("rust borrow checker", 2)
            .unwrap();
        assert!(!hits.is_empty() && hits.len() <= 2);
        assert_eq!(hits[0].id, 2);
        assert!(hits[0].distance.abs() < 1e-6);
        // ascending distance
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn batch_vector_search_returns_one_list_per_query() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        table.add(&msg("A", "alpha", 1, 0.0)).unwrap();
        table.add(&msg("B", "beta", 2, 0.0)).unwrap();
        table.add(&msg("C", "gamma", 3, 0.0)).unwrap();

        let queries = vec!["beta".to_string(), "gamma".to_string()];
        let results = table.search_list_vector_texts(&queries, 1).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0][0].message, "beta");
        assert_eq!(results[1][0].message, "gamma");
    }

    #[test]
    fn orphaned_slots_are_skipped_and_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        table.add(&msg("A", "kept message", 1, 0.0)).unwrap();
        table.add(&msg("B", "orphaned message", 2, 0.0)).unwrap();

        // delete row 2 out-of-band; its vector stays in the index
        let probe = probe(&db);
        probe.execute("DELETE FROM chat WHERE id = 2", []).unwrap();
        probe
            .execute("DELETE FROM chat_fts WHERE rowid = 2", [])
            .unwrap();

        let hits = table
            .search_list_vector_text("orphaned message", 2)
            .unwrap();
        assert!(hits.iter().all(|h| h.message != "orphaned message"));

        // rebuild reclaims the orphan and renumbers the survivor
        table.rebuild_index().unwrap();
        assert_eq!(table.next_slot(), 1);
        let slots: Vec<i64> = probe
            .prepare("SELECT faiss_index_id FROM chat ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(slots, vec![0]);

        let hits = table.search_list_vector_text("kept message", 2).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message, "kept message");
    }

    #[test]
    fn query_embeddings_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = Table::open(
            Arc::clone(&db),
            "chat",
            IndexParams::new(DIM).with_connectivity(8),
        )
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        table.set_embedder(move |text| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(stub_vector(text))
        });

        table.add(&msg("A", "cached query", 1, 0.0)).unwrap();
        let after_insert = calls.load(Ordering::SeqCst);

        table.search_list_vector_text("cached query", 1).unwrap();
        table.search_list_vector_text("cached query", 1).unwrap();
        table.search_list_vector_text("cached query", 1).unwrap();
        // only the first query embeds; repeats hit the cache
        assert_eq!(calls.load(Ordering::SeqCst), after_insert + 1);
    }

    // ---------------- forgetting and rebuilds ----------------

    #[test]
    fn forgotten_is_deterministic_at_the_extremes() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        table.add(&msg("A", "keep one", 1, 0.0)).unwrap();
        table.add(&msg("B", "always forgotten", 2, 1.0)).unwrap();
        table.add(&msg("C", "keep two", 3, 0.0)).unwrap();

        let removed = table.forgotten().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(table.message_count().unwrap(), 2);
        assert_eq!(table.next_slot(), 2);

        let probe = probe(&db);
        let mut slots: Vec<i64> = probe
            .prepare("SELECT faiss_index_id FROM chat")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1]);

        let fts: i64 = probe
            .query_row("SELECT COUNT(*) FROM chat_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fts, 2);
        let registry: i64 = probe
            .query_row(
                "SELECT faiss_new_id FROM __TABLE_MANAGE__ WHERE tablename = 'chat'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(registry, 2);

        // the forgotten row is gone from all three retrieval paths
        assert!(table.search_id(2).unwrap().is_none());
        assert!(table.search_list_fts("forgotten", None).unwrap().is_empty());
        let hits = table.search_list_vector_text("always forgotten", 3).unwrap();
        assert!(hits.iter().all(|h| h.message != "always forgotten"));
    }

    #[test]
    fn rebuild_preserves_vectors_and_renumbers() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        let texts = ["first", "second", "third"];
        for (i, text) in texts.iter().enumerate() {
            table.add(&msg("A", text, i as i64, 0.0)).unwrap();
        }

        table.rebuild_index().unwrap();
        assert_eq!(table.next_slot(), 3);

        for text in texts {
            let hits = table.search_list_vector_text(text, 1).unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].message, text);
            assert!(hits[0].distance.abs() < 1e-6);
        }
    }

    #[test]
    fn full_rebuild_reembeds_every_message() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = Table::open(
            Arc::clone(&db),
            "chat",
            IndexParams::new(DIM).with_connectivity(8),
        )
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        table.set_embedder(move |text| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(stub_vector(text))
        });

        let texts = ["one", "two", "three"];
        for (i, text) in texts.iter().enumerate() {
            table.add(&msg("A", text, i as i64, 0.0)).unwrap();
        }
        let before = calls.load(Ordering::SeqCst);

        table.full_rebuild_index().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), before + texts.len());
        assert_eq!(table.next_slot(), 3);

        for text in texts {
            let hits = table.search_list_vector_text(text, 1).unwrap();
            assert_eq!(hits[0].message, text);
            assert!(hits[0].distance.abs() < 1e-6);
        }
    }

    // ---------------- drop ----------------

    #[test]
    fn drop_table_then_recreate_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let mut table = open_table(&db, "chat");
        table.add(&msg("A", "doomed", 1, 0.0)).unwrap();
        table.save_index().unwrap();
        let index_path = table.index_path().to_path_buf();
        assert!(index_path.exists());

        table.drop_table().unwrap();
        assert!(db.tables().unwrap().is_empty());
        assert!(!index_path.exists());

        let recreated = open_table(&db, "chat");
        assert_eq!(recreated.message_count().unwrap(), 0);
        assert_eq!(recreated.next_slot(), 0);
        assert!(recreated.search_list_fts("doomed", None).unwrap().is_empty());
    }
}
