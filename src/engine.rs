// =============================================================================
// engine.rs: THE FRONT DESK
// =============================================================================
//
// `PopularityEngine` wires the parts together and is what the rest of the
// backend holds on to. Each public method is one caller-facing operation;
// metrics are bumped here rather than in the parts, so the parts stay usable
// on their own.
// =============================================================================

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::cache::CounterCache;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::clicks::ClickCounter;
use crate::config::Config;
use crate::dedup::{DedupGate, DedupSnapshot};
use crate::error::{PopularityError, Result};
use crate::likes::LikeToggleEngine;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::models::{
    ActorId, ClickOutcome, Subject, SubjectId, SubjectKind, ToggleOutcome, Trending, TrendingSource, ViewOutcome,
};
use crate::reconciler::{PassOutcome, Reconciler};
use crate::store::SubjectStore;
use crate::trending::TrendingSelector;
use crate::views::ViewAccumulator;
use crate::visitor::VisitorKey;

/// What `delete_subject` removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeletionReport {
    pub store_row_deleted: bool,
    pub view_markers_cleared: u64,
}

/// Everything the stats endpoint serves.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub metrics: MetricsSnapshot,
    pub dedup: DedupSnapshot,
    pub reconciler_breaker: CircuitBreakerSnapshot,
}

pub struct PopularityEngine {
    cache: Arc<dyn CounterCache>,
    store: Arc<dyn SubjectStore>,
    metrics: Arc<MetricsCollector>,
    gate: Arc<DedupGate>,
    likes: LikeToggleEngine,
    views: ViewAccumulator,
    clicks: ClickCounter,
    trending: TrendingSelector,
    reconciler: Arc<Reconciler>,
    trending_limit: usize,
}

impl PopularityEngine {
    pub fn new(config: &Config, cache: Arc<dyn CounterCache>, store: Arc<dyn SubjectStore>) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let gate = Arc::new(
            DedupGate::new(cache.clone(), config.dedup_window)
                .with_window(SubjectKind::Link, config.click_dedup_window),
        );
        let breaker = CircuitBreaker::new(
            "reconciler",
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_reset_timeout,
            config.circuit_breaker_success_threshold,
        );

        Self {
            likes: LikeToggleEngine::new(cache.clone()),
            views: ViewAccumulator::new(gate.clone(), cache.clone(), store.clone(), config.leaderboard_ttl),
            clicks: ClickCounter::new(gate.clone(), store.clone()),
            trending: TrendingSelector::new(cache.clone(), store.clone()),
            reconciler: Arc::new(Reconciler::new(
                cache.clone(),
                store.clone(),
                metrics.clone(),
                breaker,
                config.reconcile_interval,
                config.reconcile_prune_unliked,
            )),
            trending_limit: config.trending_limit,
            cache,
            store,
            metrics,
            gate,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// The scheduled entrypoint, for spawning with `Reconciler::run`.
    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    // ---- likes --------------------------------------------------------------

    pub async fn toggle_like(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> Result<ToggleOutcome> {
        if !kind.is_likeable() {
            return Err(PopularityError::NotLikeable { kind });
        }
        let outcome = self.likes.toggle_like(kind, subject, actor).await?;
        self.metrics.record_toggle(outcome.is_liked());
        Ok(outcome)
    }

    pub async fn is_liked(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> Result<bool> {
        Ok(self.likes.is_liked(kind, subject, actor).await?)
    }

    pub async fn live_like_count(&self, kind: SubjectKind, subject: SubjectId) -> Result<u64> {
        Ok(self.likes.live_like_count(kind, subject).await?)
    }

    pub async fn liked_by(&self, kind: SubjectKind, actor: ActorId) -> Result<Vec<SubjectId>> {
        Ok(self.likes.liked_by(kind, actor).await?)
    }

    // ---- views --------------------------------------------------------------

    pub async fn record_view(&self, kind: SubjectKind, subject: SubjectId, visitor: &VisitorKey) -> Result<ViewOutcome> {
        let outcome = self.views.record_view(kind, subject, visitor).await?;
        self.metrics.record_view(outcome.counted());
        Ok(outcome)
    }

    pub async fn view_subject(&self, kind: SubjectKind, id: SubjectId, visitor: &VisitorKey) -> Result<Subject> {
        let (subject, outcome) = self.views.view_subject(kind, id, visitor).await?;
        self.metrics.record_view(outcome.counted());
        Ok(subject)
    }

    // ---- clicks -------------------------------------------------------------

    pub async fn record_click(&self, link: SubjectId, visitor: &VisitorKey) -> Result<ClickOutcome> {
        let outcome = self.clicks.record_click(link, visitor).await?;
        self.metrics.record_click(outcome.counted());
        Ok(outcome)
    }

    // ---- trending -----------------------------------------------------------

    /// Trending with the configured default size.
    pub async fn trending(&self, kind: SubjectKind) -> Result<Trending> {
        self.trending_top(kind, self.trending_limit).await
    }

    pub async fn trending_top(&self, kind: SubjectKind, limit: usize) -> Result<Trending> {
        let answer = self.trending.select(kind, limit).await?;
        self.metrics.add_stale_evicted(answer.evicted.len() as u64);
        self.metrics
            .record_trending(answer.trending.source == TrendingSource::Leaderboard);
        Ok(answer.trending)
    }

    // ---- lifecycle ----------------------------------------------------------

    /// Remove a subject everywhere: its row and persisted likes, its dedup
    /// markers, its leaderboard entry, its live like set and its place in
    /// every liker's index.
    ///
    /// Cache cleanup runs even when the row was already gone, so a retry
    /// after a partial failure finishes the job.
    pub async fn delete_subject(&self, kind: SubjectKind, id: SubjectId) -> Result<DeletionReport> {
        let store_row_deleted = self.store.delete(kind, id).await?;
        let view_markers_cleared = self.cache.clear_view_markers(kind, id).await?;
        self.cache.remove_from_leaderboard(kind, id).await?;
        self.cache.clear_likes(kind, id).await?;

        info!(%kind, %id, store_row_deleted, view_markers_cleared, "Subject deleted");
        Ok(DeletionReport {
            store_row_deleted,
            view_markers_cleared,
        })
    }

    /// Run one reconcile pass now, outside the schedule.
    pub async fn reconcile(&self) -> Result<PassOutcome> {
        self.reconciler.run_pass().await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            metrics: self.metrics.snapshot(),
            dedup: self.gate.snapshot(),
            reconciler_breaker: self.reconciler.breaker().snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounterCache;
    use crate::store::MemorySubjectStore;

    const KIND: SubjectKind = SubjectKind::Curation;

    struct Fixture {
        cache: Arc<MemoryCounterCache>,
        store: Arc<MemorySubjectStore>,
        engine: PopularityEngine,
    }

    fn fixture(ids: &[i64]) -> Fixture {
        let cache = Arc::new(MemoryCounterCache::new());
        let store = Arc::new(MemorySubjectStore::with_subjects(
            ids.iter()
                .map(|&id| Subject::new(KIND, SubjectId(id), format!("curation {id}"))),
        ));
        let engine = PopularityEngine::new(&Config::default(), cache.clone(), store.clone());
        Fixture { cache, store, engine }
    }

    fn visitor(raw: &str) -> VisitorKey {
        VisitorKey::from_raw(raw)
    }

    #[tokio::test]
    async fn test_delete_cascades_through_cache_and_store() {
        let f = fixture(&[1, 2]);
        let id = SubjectId(1);
        f.engine.record_view(KIND, id, &visitor("a")).await.unwrap();
        f.engine.record_view(KIND, id, &visitor("b")).await.unwrap();
        f.engine.record_view(KIND, SubjectId(2), &visitor("a")).await.unwrap();
        f.engine.toggle_like(KIND, id, ActorId(7)).await.unwrap();
        f.engine.toggle_like(KIND, SubjectId(2), ActorId(7)).await.unwrap();

        let report = f.engine.delete_subject(KIND, id).await.unwrap();
        assert!(report.store_row_deleted);
        assert_eq!(report.view_markers_cleared, 2);

        assert_eq!(f.cache.live_marker_count(), 1);
        assert_eq!(f.cache.leaderboard_score(KIND, id).await.unwrap(), None);
        assert_eq!(f.engine.live_like_count(KIND, id).await.unwrap(), 0);
        assert_eq!(f.engine.liked_by(KIND, ActorId(7)).await.unwrap(), vec![SubjectId(2)]);
        assert!(!f.store.exists(KIND, id).await.unwrap());

        let trending = f.engine.trending(KIND).await.unwrap();
        assert_eq!(trending.source, TrendingSource::Leaderboard);
        assert_eq!(trending.ids(), vec![SubjectId(2)]);

        assert!(matches!(f.engine.reconcile().await.unwrap(), PassOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_view_subject_counts_and_reports_not_found() {
        let f = fixture(&[1]);
        let subject = f.engine.view_subject(KIND, SubjectId(1), &visitor("a")).await.unwrap();
        assert_eq!(subject.view_count, 1);
        f.engine.view_subject(KIND, SubjectId(1), &visitor("a")).await.unwrap();

        let err = f.engine.view_subject(KIND, SubjectId(2), &visitor("a")).await.unwrap_err();
        assert!(err.is_not_found());

        let stats = f.engine.stats();
        assert_eq!(stats.metrics.views_counted, 1);
        assert_eq!(stats.metrics.views_repeated, 1);
        assert_eq!(stats.dedup.total_checks, 2);
    }

    #[tokio::test]
    async fn test_trending_metrics_distinguish_sources() {
        let f = fixture(&[1, 2]);
        f.engine.trending(KIND).await.unwrap();
        f.engine.record_view(KIND, SubjectId(1), &visitor("a")).await.unwrap();
        f.engine.trending(KIND).await.unwrap();

        let m = f.engine.stats().metrics;
        assert_eq!(m.trending_from_store, 1);
        assert_eq!(m.trending_from_leaderboard, 1);
    }

    #[tokio::test]
    async fn test_reconcile_through_the_facade() {
        let f = fixture(&[42]);
        f.engine.toggle_like(KIND, SubjectId(42), ActorId(7)).await.unwrap();
        f.engine.toggle_like(KIND, SubjectId(42), ActorId(9)).await.unwrap();
        f.engine.reconcile().await.unwrap();

        let stored = f.store.find_subject(KIND, SubjectId(42)).await.unwrap().unwrap();
        assert_eq!(stored.like_count, 2);
        assert_eq!(f.engine.stats().metrics.likes_persisted, 2);
    }

    #[tokio::test]
    async fn test_link_clicks_use_the_short_window() {
        let f = fixture(&[]);
        f.store
            .save(&Subject::new(SubjectKind::Link, SubjectId(5), "https://example.org"))
            .await
            .unwrap();
        let v = visitor("10.0.0.1");

        assert!(f.engine.record_click(SubjectId(5), &v).await.unwrap().counted());
        assert!(!f.engine.record_click(SubjectId(5), &v).await.unwrap().counted());
        let link = f.store.find_subject(SubjectKind::Link, SubjectId(5)).await.unwrap().unwrap();
        assert_eq!(link.view_count, 1);

        let stats = f.engine.stats();
        assert_eq!((stats.metrics.clicks_counted, stats.metrics.clicks_repeated), (1, 1));
        assert_eq!(stats.dedup.kind_window_secs.get(&SubjectKind::Link), Some(&600));
    }

    #[tokio::test]
    async fn test_links_cannot_be_liked() {
        let f = fixture(&[]);
        let err = f
            .engine
            .toggle_like(SubjectKind::Link, SubjectId(5), ActorId(7))
            .await
            .unwrap_err();
        assert!(matches!(err, PopularityError::NotLikeable { kind: SubjectKind::Link }));
        assert_eq!(f.cache.like_count(SubjectKind::Link, SubjectId(5)).await.unwrap(), 0);
    }
}
