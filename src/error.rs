// =============================================================================
// error.rs: WHAT CAN GO WRONG, SORTED BY WHO GETS BLAMED
// =============================================================================
//
// Three buckets. The cache fell over, the database fell over, or somebody
// asked about a subject that does not exist. Batch jobs swallow the last one
// and keep going; single-subject requests hand it straight back.
// =============================================================================

use thiserror::Error;

use crate::models::{SubjectId, SubjectKind};

/// Failures talking to the fast counter store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("counter cache unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    /// A key or member that should hold a numeric id did not.
    #[error("malformed cache entry `{key}`: {reason}")]
    Malformed { key: String, reason: String },
}

/// Failures talking to the authoritative store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored value out of range for {field}: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

/// The error surfaced by every public engine operation.
#[derive(Debug, Error)]
pub enum PopularityError {
    #[error("{kind} #{id} not found")]
    NotFound { kind: SubjectKind, id: SubjectId },

    #[error("{kind} subjects cannot be liked")]
    NotLikeable { kind: SubjectKind },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PopularityError {
    pub fn not_found(kind: SubjectKind, id: SubjectId) -> Self {
        PopularityError::NotFound { kind, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PopularityError::NotFound { .. })
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type Result<T> = std::result::Result<T, PopularityError>;
