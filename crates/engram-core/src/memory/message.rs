//! Message records - the unit of remembered conversation
//!
//! An [`InsertMessage`] flows in, a [`StoredMessage`] flows back out of the
//! metadata and full-text paths, and a [`VectorMatch`] carries the extra
//! squared-L2 distance from the vector path.

use chrono::Utc;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

// ============================================================================
// INPUT RECORD
// ============================================================================

/// A chat utterance to remember.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertMessage {
    /// Caller-defined epoch timestamp (the store never interprets it)
    pub timestamp: i64,
    /// Display name of the speaker; empty or absent is stored as NULL
    #[serde(default)]
    pub sender: Option<String>,
    /// Stable speaker identity
    pub sender_uuid: String,
    /// The message text; indexed by all three retrieval paths
    pub message: String,
    /// Bernoulli parameter for the forgetting pass, in [0, 1]
    pub forget_probability: f64,
}

impl InsertMessage {
    /// New message stamped with the current wall-clock time (milliseconds)
    /// and a forget probability of zero.
    pub fn new(sender_uuid: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            sender: None,
            sender_uuid: sender_uuid.into(),
            message: message.into(),
            forget_probability: 0.0,
        }
    }

    /// Set the display name of the speaker.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Override the timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the forget probability.
    pub fn with_forget_probability(mut self, p: f64) -> Self {
        self.forget_probability = p;
        self
    }
}

// ============================================================================
// OUTPUT RECORDS
// ============================================================================

/// A message read back from the store.
///
/// Returned by the metadata searches; the full-text searches reuse it with
/// `message` holding either the raw matched text or the highlight rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: i64,
    pub timestamp: i64,
    pub sender: Option<String>,
    pub sender_uuid: String,
    pub message: String,
}

impl StoredMessage {
    /// Map a `SELECT id, timestamp, sender, sender_uuid, message` row.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            sender: row.get(2)?,
            sender_uuid: row.get(3)?,
            message: row.get(4)?,
        })
    }
}

/// A vector-search hit: a stored message plus its squared-L2 distance to
/// the query embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMatch {
    pub id: i64,
    pub timestamp: i64,
    pub sender: Option<String>,
    pub sender_uuid: String,
    pub message: String,
    /// Squared L2 distance; 0 means an exact embedding match
    pub distance: f32,
}

impl VectorMatch {
    pub(crate) fn from_message(message: StoredMessage, distance: f32) -> Self {
        Self {
            id: message.id,
            timestamp: message.timestamp,
            sender: message.sender,
            sender_uuid: message.sender_uuid,
            message: message.message,
            distance,
        }
    }
}

// ============================================================================
// UNIFIED FULL-TEXT FILTER
// ============================================================================

/// Input for the unified full-text search.
///
/// Exactly one of `fts` and `simple_query` must be set: `fts` is passed to
/// the engine as a raw FTS5 MATCH expression, `simple_query` is plain text
/// that the store converts to a match expression itself (through the
/// tokenizer extension's `simple_query()` helper when one is loaded).
/// Time bounds are inclusive and optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtsFilter {
    /// Raw FTS5 MATCH expression
    pub fts: Option<String>,
    /// Plain-text query, tokenized and sanitized by the store
    pub simple_query: Option<String>,
    /// Inclusive lower timestamp bound
    pub start: Option<i64>,
    /// Inclusive upper timestamp bound
    pub end: Option<i64>,
    /// Maximum number of rows to return; must be positive when set
    pub limit: Option<usize>,
}

impl FtsFilter {
    /// Filter with a raw FTS5 MATCH expression.
    pub fn fts(expr: impl Into<String>) -> Self {
        Self {
            fts: Some(expr.into()),
            ..Self::default()
        }
    }

    /// Filter with a plain-text query.
    pub fn simple(query: impl Into<String>) -> Self {
        Self {
            simple_query: Some(query.into()),
            ..Self::default()
        }
    }

    /// Restrict to `start <= timestamp <= end`; either bound may be open.
    pub fn between(mut self, start: Option<i64>, end: Option<i64>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Cap the number of returned rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================
