//! HNSW Vector Index
//!
//! Adapter over USearch keyed by dense slot ids. The slot for each stored
//! message lives in the relational row (`faiss_index_id`); this index only
//! maps slot -> vector and never owns the association. HNSW has no per-slot
//! delete, so removal is always a rebuild: reconstruct (or re-embed) the
//! survivors into a fresh index and renumber.

use std::fs;
use std::path::Path;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default HNSW graph degree (higher = better recall, more memory)
pub const DEFAULT_CONNECTIVITY: usize = 32;

/// HNSW expansion factor while building the graph
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor at query time; tunable per index afterwards
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index error types
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum AnnError {
    /// Failed to create the index
    #[error("index creation failed: {0}")]
    Creation(String),
    /// Failed to add a vector
    #[error("failed to add vector at slot {slot}: {reason}")]
    Add { slot: u64, reason: String },
    /// Failed to search
    #[error("vector search failed: {0}")]
    Search(String),
    /// Failed to persist or load the index
    #[error("index persistence failed: {0}")]
    Persistence(String),
    /// Vector length does not match the index dimension
    #[error("invalid dimensions: expected {expected}, got {got}")]
    InvalidDimensions { expected: usize, got: usize },
    /// The file deserialized into an index of a different shape
    #[error("file holds an incompatible index: {0}")]
    ForeignIndex(String),
    /// No vector stored at the given slot
    #[error("no vector stored at slot {0}")]
    SlotNotFound(u64),
}

// ============================================================================
// ANN INDEX
// ============================================================================

/// HNSW index over float32 vectors, addressed by dense slot ids.
pub struct AnnIndex {
    index: Index,
    dimension: usize,
    connectivity: usize,
}

fn index_options(dimension: usize, connectivity: usize) -> IndexOptions {
    IndexOptions {
        dimensions: dimension,
        metric: MetricKind::L2sq,
        // f32 storage keeps reconstruct() exact; quantization would make
        // rebuild-by-reconstruction lossy
        quantization: ScalarKind::F32,
        connectivity,
        expansion_add: DEFAULT_EXPANSION_ADD,
        expansion_search: DEFAULT_EXPANSION_SEARCH,
        multi: false,
    }
}

impl AnnIndex {
    /// Create an empty index.
    pub fn new(dimension: usize, connectivity: usize) -> Result<Self, AnnError> {
        let index = Index::new(&index_options(dimension, connectivity))
            .map_err(|e| AnnError::Creation(e.to_string()))?;
        Ok(Self {
            index,
            dimension,
            connectivity,
        })
    }

    /// Load a serialized index from `path`.
    ///
    /// The deserialized index must carry the expected dimension; anything
    /// else (a foreign or corrupt file) is rejected.
    pub fn load(path: &Path, dimension: usize, connectivity: usize) -> Result<Self, AnnError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| AnnError::Persistence("index path is not valid UTF-8".to_string()))?;

        let index = Index::new(&index_options(dimension, connectivity))
            .map_err(|e| AnnError::Creation(e.to_string()))?;
        index
            .load(path_str)
            .map_err(|e| AnnError::ForeignIndex(e.to_string()))?;

        let loaded_dims = index.dimensions();
        if loaded_dims != dimension {
            return Err(AnnError::ForeignIndex(format!(
                "expected a {dimension}-dimensional index, file holds {loaded_dims} dimensions"
            )));
        }

        Ok(Self {
            index,
            dimension,
            connectivity,
        })
    }

    /// Serialize the index to `path`, creating parent directories if absent.
    pub fn save(&self, path: &Path) -> Result<(), AnnError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| AnnError::Persistence("index path is not valid UTF-8".to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AnnError::Persistence(e.to_string()))?;
        }
        self.index
            .save(path_str)
            .map_err(|e| AnnError::Persistence(e.to_string()))
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// Whether the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// HNSW graph degree.
    pub fn connectivity(&self) -> usize {
        self.connectivity
    }

    /// Tune the query-time expansion factor (recall/latency trade-off).
    /// Takes effect for subsequent searches.
    pub fn set_ef_search(&mut self, ef_search: usize) {
        let _ = self.index.change_expansion_search(ef_search);
    }

    /// USearch requires capacity to be reserved ahead of inserts.
    fn ensure_capacity(&mut self, extra: usize) -> Result<(), AnnError> {
        let needed = self.index.size() + extra;
        if needed > self.index.capacity() {
            let target = std::cmp::max(self.index.capacity() * 2, needed).max(16);
            self.index
                .reserve(target)
                .map_err(|e| AnnError::Creation(format!("failed to reserve capacity: {e}")))?;
        }
        Ok(())
    }

    /// Store `vector` at `slot`. The caller owns slot accounting.
    pub fn add(&mut self, slot: u64, vector: &[f32]) -> Result<(), AnnError> {
        if vector.len() != self.dimension {
            return Err(AnnError::InvalidDimensions {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        self.ensure_capacity(1)?;
        self.index.add(slot, vector).map_err(|e| AnnError::Add {
            slot,
            reason: e.to_string(),
        })
    }

    /// Store `data.len() / dimension` contiguous rows at slots
    /// `[first_slot, first_slot + n)`. Returns the number of rows added.
    pub fn add_batch(&mut self, first_slot: u64, data: &[f32]) -> Result<usize, AnnError> {
        if data.len() % self.dimension != 0 {
            return Err(AnnError::InvalidDimensions {
                expected: self.dimension,
                got: data.len(),
            });
        }
        let rows = data.len() / self.dimension;
        self.ensure_capacity(rows)?;
        for (i, chunk) in data.chunks_exact(self.dimension).enumerate() {
            let slot = first_slot + i as u64;
            self.index.add(slot, chunk).map_err(|e| AnnError::Add {
                slot,
                reason: e.to_string(),
            })?;
        }
        Ok(rows)
    }

    /// Nearest neighbours of `query`: up to `k` `(slot, squared-L2 distance)`
    /// pairs in ascending distance order. Fewer than `k` pairs come back when
    /// the index holds fewer points; absent results are simply not returned.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>, AnnError> {
        if query.len() != self.dimension {
            return Err(AnnError::InvalidDimensions {
                expected: self.dimension,
                got: query.len(),
            });
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let matches = self
            .index
            .search(query, k)
            .map_err(|e| AnnError::Search(e.to_string()))?;
        Ok(matches
            .keys
            .iter()
            .copied()
            .zip(matches.distances.iter().copied())
            .collect())
    }

    /// Copy the vector stored at `slot` into `out`.
    pub fn reconstruct(&self, slot: u64, out: &mut [f32]) -> Result<(), AnnError> {
        if out.len() != self.dimension {
            return Err(AnnError::InvalidDimensions {
                expected: self.dimension,
                got: out.len(),
            });
        }
        let found = self
            .index
            .get(slot, out)
            .map_err(|e| AnnError::Search(e.to_string()))?;
        if found == 0 {
            return Err(AnnError::SlotNotFound(slot));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AnnIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnIndex")
            .field("dimension", &self.dimension)
            .field("connectivity", &self.connectivity)
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
