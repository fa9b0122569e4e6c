// =============================================================================
// views.rs: COUNTING EYEBALLS
// =============================================================================
//
// A counted view does three things: passes the dedup gate, bumps the daily
// leaderboard, and adds one to the persisted view counter. A repeat view does
// none of them.
//
// The persisted counter is written straight away, unlike likes. Views only
// ever go up, so there is nothing to reconcile.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::CounterCache;
use crate::dedup::DedupGate;
use crate::error::{PopularityError, Result};
use crate::models::{Subject, SubjectId, SubjectKind, ViewOutcome};
use crate::store::SubjectStore;
use crate::visitor::VisitorKey;

pub struct ViewAccumulator {
    gate: Arc<DedupGate>,
    cache: Arc<dyn CounterCache>,
    store: Arc<dyn SubjectStore>,
    leaderboard_ttl: Duration,
}

impl ViewAccumulator {
    pub fn new(
        gate: Arc<DedupGate>,
        cache: Arc<dyn CounterCache>,
        store: Arc<dyn SubjectStore>,
        leaderboard_ttl: Duration,
    ) -> Self {
        Self {
            gate,
            cache,
            store,
            leaderboard_ttl,
        }
    }

    /// Offer one view. Counted at most once per visitor per dedup window.
    pub async fn record_view(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        visitor: &VisitorKey,
    ) -> Result<ViewOutcome> {
        if !self.gate.should_count(kind, subject, visitor).await? {
            return Ok(ViewOutcome::Repeat);
        }

        let score = self
            .cache
            .bump_leaderboard(kind, subject, self.leaderboard_ttl)
            .await?;

        if !self.store.increment_view_count(kind, subject).await? {
            // Deleted between the caller's lookup and now. The leaderboard
            // entry goes stale and trending evicts it.
            warn!(%kind, %subject, "View counted for a subject missing from the store");
        }

        debug!(%kind, %subject, score, "View counted");
        Ok(ViewOutcome::Counted { score })
    }

    /// The display read path: load the subject, count the view, and hand back
    /// the record with the live like count laid over the persisted one.
    ///
    /// An unknown subject fails before anything is recorded.
    pub async fn view_subject(
        &self,
        kind: SubjectKind,
        id: SubjectId,
        visitor: &VisitorKey,
    ) -> Result<(Subject, ViewOutcome)> {
        let mut subject = self
            .store
            .find_subject(kind, id)
            .await?
            .ok_or_else(|| PopularityError::not_found(kind, id))?;

        let outcome = self.record_view(kind, id, visitor).await?;
        if outcome.counted() {
            subject.view_count += 1;
        }
        subject.like_count = self.cache.like_count(kind, id).await?;

        Ok((subject, outcome))
    }
}
