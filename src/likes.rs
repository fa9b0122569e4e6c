// =============================================================================
// likes.rs: THE LIKE BUTTON
// =============================================================================
//
// A like is membership of an actor in a subject's live like set. Toggling
// flips that membership in one atomic step inside the cache and never
// touches the database; the reconciler carries the result over later.
// =============================================================================

use std::sync::Arc;
use tracing::debug;

use crate::cache::CounterCache;
use crate::error::CacheResult;
use crate::models::{ActorId, SubjectId, SubjectKind, ToggleOutcome};

pub struct LikeToggleEngine {
    cache: Arc<dyn CounterCache>,
}

impl LikeToggleEngine {
    pub fn new(cache: Arc<dyn CounterCache>) -> Self {
        Self { cache }
    }

    /// Like if not liked, unlike if liked. Concurrent toggles on the same
    /// subject are linearized by the cache, so two toggles by the same actor
    /// always cancel out.
    pub async fn toggle_like(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        actor: ActorId,
    ) -> CacheResult<ToggleOutcome> {
        let outcome = self.cache.toggle_like(kind, subject, actor).await?;
        debug!(%kind, %subject, %actor, ?outcome, "Like toggled");
        Ok(outcome)
    }

    pub async fn is_liked(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> CacheResult<bool> {
        self.cache.is_liked(kind, subject, actor).await
    }

    /// Current size of the live like set. Fresher than the persisted
    /// `like_count`, which lags by up to one reconciler interval.
    pub async fn live_like_count(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<u64> {
        self.cache.like_count(kind, subject).await
    }

    pub async fn liked_by(&self, kind: SubjectKind, actor: ActorId) -> CacheResult<Vec<SubjectId>> {
        self.cache.liked_by(kind, actor).await
    }
}
