// =============================================================================
// cache/mod.rs: THE COUNTER CACHE CONTRACT
// =============================================================================
//
// Everything hot lives in the counter cache: who likes what right now, which
// visitors already counted today, and the daily view leaderboard. The rest of
// the crate talks to it only through `CounterCache`, a set of typed
// operations. Key names are an implementation detail of the Redis backend
// and never leak past `keys.rs`.
//
// Two implementations:
//   * `RedisCounterCache`, the production one.
//   * `MemoryCounterCache`, same semantics in-process, TTLs included. Tests
//     and local runs use it.
// =============================================================================

pub mod keys;
pub mod memory;
pub mod redis_cache;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::CacheResult;
use crate::models::{ActorId, SubjectId, SubjectKind, ToggleOutcome};
use crate::visitor::VisitorKey;

pub use self::memory::MemoryCounterCache;
pub use self::redis_cache::RedisCounterCache;

#[async_trait]
pub trait CounterCache: Send + Sync {
    // ---- dedup markers ------------------------------------------------------

    /// Create the (subject, visitor) view marker with `ttl` unless it already
    /// exists. Returns `true` when this call created it.
    async fn mark_view_if_absent(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        visitor: &VisitorKey,
        ttl: Duration,
    ) -> CacheResult<bool>;

    /// Drop every view marker of one subject. Returns how many went.
    async fn clear_view_markers(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<u64>;

    // ---- likes --------------------------------------------------------------

    /// Flip the actor's membership in the subject's like set as one atomic
    /// step, keeping the actor's own index and the dirty set in step with it.
    async fn toggle_like(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        actor: ActorId,
    ) -> CacheResult<ToggleOutcome>;

    async fn is_liked(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> CacheResult<bool>;

    /// Cardinality of the live like set.
    async fn like_count(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<u64>;

    /// Full membership of the live like set, in no particular order.
    async fn like_members(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<Vec<ActorId>>;

    /// Subjects of `kind` that currently have a non-empty live like set.
    async fn liked_subjects(&self, kind: SubjectKind) -> CacheResult<Vec<SubjectId>>;

    /// Subjects of `kind` the actor currently likes.
    async fn liked_by(&self, kind: SubjectKind, actor: ActorId) -> CacheResult<Vec<SubjectId>>;

    /// Move the subjects toggled since the last claim into the claimed set
    /// and return the whole claimed set. This is how a like set that dropped
    /// to zero members still gets reconciled.
    ///
    /// Claimed subjects stay claimed until `release_dirty`, so a pass that
    /// fails part way hands them to the next claim. Toggles landing after
    /// the claim go to a fresh dirty set.
    async fn claim_dirty(&self, kind: SubjectKind) -> CacheResult<Vec<SubjectId>>;

    /// Forget the claimed set once its subjects have been reconciled.
    async fn release_dirty(&self, kind: SubjectKind) -> CacheResult<()>;

    /// Delete a subject's live like set and its entries in actor indexes.
    async fn clear_likes(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<()>;

    // ---- leaderboard --------------------------------------------------------

    /// Add one to the subject's score and push the whole leaderboard's
    /// expiry out to `ttl`. Returns the new score.
    async fn bump_leaderboard(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        ttl: Duration,
    ) -> CacheResult<f64>;

    /// Highest scores first, at most `limit` entries.
    async fn leaderboard_top(&self, kind: SubjectKind, limit: usize) -> CacheResult<Vec<(SubjectId, f64)>>;

    /// Every entry scoring at least `min_score`, highest first. Used to pull
    /// in all members tied at a cut-off before tie-breaking.
    async fn leaderboard_from_score(
        &self,
        kind: SubjectKind,
        min_score: f64,
    ) -> CacheResult<Vec<(SubjectId, f64)>>;

    async fn leaderboard_score(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<Option<f64>>;

    async fn remove_from_leaderboard(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<()>;

    // ---- housekeeping -------------------------------------------------------

    async fn ping(&self) -> CacheResult<()>;
}
