// =============================================================================
// store/mod.rs: THE BOOKS OF RECORD
// =============================================================================
//
// The authoritative relational store, seen through the narrow window this
// crate needs: look a subject up, overwrite its counters, bump a view, and
// keep the like join table in step with what the cache says.
//
// `PgSubjectStore` is the production implementation. `MemorySubjectStore`
// behaves the same way without a database and backs the test suite.
// =============================================================================

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{ActorId, Subject, SubjectId, SubjectKind};

pub use self::memory::MemorySubjectStore;
pub use self::postgres::PgSubjectStore;

#[async_trait]
pub trait SubjectStore: Send + Sync {
    async fn find_subject(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<Option<Subject>>;

    async fn exists(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool>;

    /// Insert or overwrite the subject row, counters included.
    async fn save(&self, subject: &Subject) -> StoreResult<()>;

    /// Overwrite only the persisted like counter. Returns `false` when the
    /// subject no longer exists.
    async fn set_like_count(&self, kind: SubjectKind, id: SubjectId, like_count: u64) -> StoreResult<bool>;

    /// Add one to the persisted view counter. Returns `false` when the
    /// subject no longer exists.
    async fn increment_view_count(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool>;

    /// Remove the subject and its persisted likes. Returns `false` when
    /// there was nothing to remove.
    async fn delete(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool>;

    /// Top `limit` subjects by persisted view count, highest first, ties by
    /// id ascending.
    async fn top_by_view_count(&self, kind: SubjectKind, limit: usize) -> StoreResult<Vec<Subject>>;

    async fn like_exists(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<bool>;

    /// Persist one like record. Inserting a pair that already exists is a
    /// no-op, never a duplicate row, and so is inserting for a subject that
    /// no longer exists.
    async fn insert_like(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<()>;

    async fn delete_like(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<()>;

    /// Actors with a persisted like on the subject, ascending.
    async fn liked_actor_ids(&self, kind: SubjectKind, subject: SubjectId) -> StoreResult<Vec<ActorId>>;
}
