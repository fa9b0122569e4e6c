// =============================================================================
// reconciler.rs: DRAINING THE CACHE INTO THE BOOKS
// =============================================================================
//
// Every few minutes, for every subject with live like activity:
//
//   1. read who likes it right now,
//   2. persist a like record for each actor not yet on file
//      (and, when pruning, delete records for actors who left),
//   3. read the live count and overwrite the persisted like_count.
//
// "Live like activity" is the union of subjects with a non-empty like set
// and the subjects toggled since the last pass. The second half matters: a
// set whose last member unliked is gone from Redis, and without the dirty
// set its persisted counter would stay stuck at 1 forever. Dirty subjects are
// claimed at the start of a pass and released only after it succeeds, so a
// failed pass leaves them for the next one.
//
// The pass is split in two. `plan` is a pure function from what was read to
// what must be written, so the interesting decisions are testable without
// any I/O. `execute` then applies the plan.
//
// Not transactional against concurrent toggles. A toggle landing between
// steps 1 and 3 can leave the persisted records and counter briefly out of
// step; the next pass fixes it.
// =============================================================================

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::CounterCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::models::{ActorId, SubjectId, SubjectKind};
use crate::store::SubjectStore;

/// Everything read about one subject before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectSnapshot {
    pub kind: SubjectKind,
    pub subject: SubjectId,
    /// `false` when the store no longer has the subject.
    pub exists: bool,
    pub live: Vec<ActorId>,
    pub persisted: Vec<ActorId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    InsertLike {
        kind: SubjectKind,
        subject: SubjectId,
        actor: ActorId,
    },
    PruneLike {
        kind: SubjectKind,
        subject: SubjectId,
        actor: ActorId,
    },
    /// Re-read the live cardinality and overwrite the persisted counter.
    RefreshLikeCount { kind: SubjectKind, subject: SubjectId },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub mutations: Vec<Mutation>,
    pub skipped: Vec<(SubjectKind, SubjectId)>,
}

/// Decide what one pass writes. Pure.
///
/// Per existing subject: an insert for every live actor without a persisted
/// record, a prune for every persisted actor no longer live (when `prune`),
/// then one counter refresh. Missing subjects are skipped whole.
pub fn plan(snapshots: &[SubjectSnapshot], prune: bool) -> Plan {
    let mut out = Plan::default();

    for snap in snapshots {
        let (kind, subject) = (snap.kind, snap.subject);
        if !snap.exists {
            out.skipped.push((kind, subject));
            continue;
        }

        let live: BTreeSet<ActorId> = snap.live.iter().copied().collect();
        let persisted: BTreeSet<ActorId> = snap.persisted.iter().copied().collect();

        out.mutations.extend(
            live.difference(&persisted)
                .map(|&actor| Mutation::InsertLike { kind, subject, actor }),
        );
        if prune {
            out.mutations.extend(
                persisted
                    .difference(&live)
                    .map(|&actor| Mutation::PruneLike { kind, subject, actor }),
            );
        }
        out.mutations.push(Mutation::RefreshLikeCount { kind, subject });
    }

    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub subjects_seen: u64,
    pub subjects_updated: u64,
    pub subjects_skipped: u64,
    pub likes_inserted: u64,
    pub likes_pruned: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Completed(ReconcileReport),
    /// Another pass held the guard; this one did nothing.
    Overlapped,
    /// The circuit breaker is open; this one did nothing.
    CircuitOpen,
}

pub struct Reconciler {
    cache: Arc<dyn CounterCache>,
    store: Arc<dyn SubjectStore>,
    metrics: Arc<MetricsCollector>,
    breaker: CircuitBreaker,
    interval: Duration,
    prune: bool,
    guard: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        cache: Arc<dyn CounterCache>,
        store: Arc<dyn SubjectStore>,
        metrics: Arc<MetricsCollector>,
        breaker: CircuitBreaker,
        interval: Duration,
        prune: bool,
    ) -> Self {
        Self {
            cache,
            store,
            metrics,
            breaker,
            interval,
            prune,
            guard: Mutex::new(()),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// One guarded pass, gated by the circuit breaker. Failures feed the
    /// breaker and are returned.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        if !self.breaker.allow_request() {
            debug!("Reconcile pass skipped, circuit open");
            return Ok(PassOutcome::CircuitOpen);
        }

        let Ok(_guard) = self.guard.try_lock() else {
            self.metrics.increment_reconcile_overlaps();
            warn!("Reconcile pass still running, skipping this one");
            return Ok(PassOutcome::Overlapped);
        };

        match self.pass().await {
            Ok(report) => {
                self.breaker.record_success();
                self.metrics.increment_reconcile_passes();
                self.metrics.add_likes_persisted(report.likes_inserted);
                self.metrics.add_likes_pruned(report.likes_pruned);
                info!(
                    seen = report.subjects_seen,
                    updated = report.subjects_updated,
                    skipped = report.subjects_skipped,
                    inserted = report.likes_inserted,
                    pruned = report.likes_pruned,
                    duration_ms = report.duration_ms,
                    "Reconcile pass complete"
                );
                Ok(PassOutcome::Completed(report))
            }
            Err(e) => {
                self.breaker.record_failure();
                self.metrics.increment_reconcile_failures();
                error!(error = %e, "Reconcile pass failed");
                Err(e)
            }
        }
    }

    /// Drive passes on the configured interval until `shutdown` flips.
    /// The first pass runs immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), prune = self.prune, "Reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Errors are logged and counted inside run_pass.
                    let _ = self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }
    }

    async fn pass(&self) -> Result<ReconcileReport> {
        let started = Instant::now();
        let mut snapshots = Vec::new();
        for kind in SubjectKind::LIKEABLE {
            for subject in self.candidates(kind).await? {
                snapshots.push(self.snapshot(kind, subject).await?);
            }
        }

        let plan = plan(&snapshots, self.prune);
        let mut report = self.execute(&plan).await?;
        for kind in SubjectKind::LIKEABLE {
            self.cache.release_dirty(kind).await?;
        }
        report.subjects_seen = snapshots.len() as u64;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn candidates(&self, kind: SubjectKind) -> Result<Vec<SubjectId>> {
        // Dirty first: anything toggled after the claim is either in a like
        // set read below or in the fresh dirty set for the next pass.
        let mut ids: BTreeSet<SubjectId> = self.cache.claim_dirty(kind).await?.into_iter().collect();
        ids.extend(self.cache.liked_subjects(kind).await?);
        Ok(ids.into_iter().collect())
    }

    async fn snapshot(&self, kind: SubjectKind, subject: SubjectId) -> Result<SubjectSnapshot> {
        if !self.store.exists(kind, subject).await? {
            return Ok(SubjectSnapshot {
                kind,
                subject,
                exists: false,
                live: Vec::new(),
                persisted: Vec::new(),
            });
        }
        Ok(SubjectSnapshot {
            kind,
            subject,
            exists: true,
            live: self.cache.like_members(kind, subject).await?,
            persisted: self.store.liked_actor_ids(kind, subject).await?,
        })
    }

    async fn execute(&self, plan: &Plan) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            subjects_skipped: plan.skipped.len() as u64,
            ..ReconcileReport::default()
        };
        for (kind, subject) in &plan.skipped {
            debug!(%kind, %subject, "Skipping likes for a deleted subject");
        }

        for mutation in &plan.mutations {
            match *mutation {
                Mutation::InsertLike { kind, subject, actor } => {
                    self.store.insert_like(kind, subject, actor).await?;
                    report.likes_inserted += 1;
                }
                Mutation::PruneLike { kind, subject, actor } => {
                    self.store.delete_like(kind, subject, actor).await?;
                    report.likes_pruned += 1;
                }
                Mutation::RefreshLikeCount { kind, subject } => {
                    let count = self.cache.like_count(kind, subject).await?;
                    if self.store.set_like_count(kind, subject, count).await? {
                        report.subjects_updated += 1;
                    } else {
                        // Deleted mid-pass.
                        report.subjects_skipped += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounterCache;
    use crate::error::{StoreError, StoreResult};
    use crate::models::Subject;
    use crate::store::MemorySubjectStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const KIND: SubjectKind = SubjectKind::Curation;

    struct Fixture {
        cache: Arc<MemoryCounterCache>,
        store: Arc<MemorySubjectStore>,
        reconciler: Reconciler,
    }

    fn fixture(ids: &[i64], prune: bool) -> Fixture {
        let cache = Arc::new(MemoryCounterCache::new());
        let store = Arc::new(MemorySubjectStore::with_subjects(
            ids.iter()
                .map(|&id| Subject::new(KIND, SubjectId(id), format!("curation {id}"))),
        ));
        let reconciler = Reconciler::new(
            cache.clone(),
            store.clone(),
            Arc::new(MetricsCollector::new()),
            CircuitBreaker::new("reconciler", 3, Duration::from_secs(60), 1),
            Duration::from_secs(600),
            prune,
        );
        Fixture { cache, store, reconciler }
    }

    fn completed(outcome: PassOutcome) -> ReconcileReport {
        match outcome {
            PassOutcome::Completed(report) => report,
            other => panic!("expected a completed pass, got {other:?}"),
        }
    }

    fn snap(id: i64, live: &[i64], persisted: &[i64]) -> SubjectSnapshot {
        SubjectSnapshot {
            kind: KIND,
            subject: SubjectId(id),
            exists: true,
            live: live.iter().map(|&a| ActorId(a)).collect(),
            persisted: persisted.iter().map(|&a| ActorId(a)).collect(),
        }
    }

    #[test]
    fn test_plan_inserts_missing_and_prunes_departed() {
        let p = plan(&[snap(42, &[9, 7], &[7, 3])], true);
        assert_eq!(
            p.mutations,
            vec![
                Mutation::InsertLike { kind: KIND, subject: SubjectId(42), actor: ActorId(9) },
                Mutation::PruneLike { kind: KIND, subject: SubjectId(42), actor: ActorId(3) },
                Mutation::RefreshLikeCount { kind: KIND, subject: SubjectId(42) },
            ]
        );
        assert!(p.skipped.is_empty());
    }

    #[test]
    fn test_plan_without_prune_keeps_departed_records() {
        let p = plan(&[snap(42, &[], &[7])], false);
        assert_eq!(p.mutations, vec![Mutation::RefreshLikeCount { kind: KIND, subject: SubjectId(42) }]);
    }

    #[test]
    fn test_plan_skips_missing_subjects() {
        let mut gone = snap(5, &[1, 2], &[]);
        gone.exists = false;
        let p = plan(&[gone, snap(6, &[], &[])], true);
        assert_eq!(p.skipped, vec![(KIND, SubjectId(5))]);
        assert_eq!(p.mutations, vec![Mutation::RefreshLikeCount { kind: KIND, subject: SubjectId(6) }]);
    }

    #[tokio::test]
    async fn test_subject_42_liked_by_7_and_9() {
        let f = fixture(&[42], true);
        let id = SubjectId(42);
        f.cache.toggle_like(KIND, id, ActorId(7)).await.unwrap();
        f.cache.toggle_like(KIND, id, ActorId(9)).await.unwrap();

        let first = completed(f.reconciler.run_pass().await.unwrap());
        assert_eq!(first.likes_inserted, 2);
        assert_eq!(first.subjects_updated, 1);

        let stored = f.store.find_subject(KIND, id).await.unwrap().unwrap();
        assert_eq!(stored.like_count, 2);
        assert!(f.store.like_exists(KIND, id, ActorId(7)).await.unwrap());
        assert!(f.store.like_exists(KIND, id, ActorId(9)).await.unwrap());

        let second = completed(f.reconciler.run_pass().await.unwrap());
        assert_eq!(second.likes_inserted, 0);
        assert_eq!(second.likes_pruned, 0);
        assert_eq!(f.store.like_row_count(), 2);
        let stored = f.store.find_subject(KIND, id).await.unwrap().unwrap();
        assert_eq!(stored.like_count, 2);
    }

    #[tokio::test]
    async fn test_persisted_count_matches_live_cardinality() {
        let f = fixture(&[1, 2], true);
        for actor in 0..5 {
            f.cache.toggle_like(KIND, SubjectId(1), ActorId(actor)).await.unwrap();
        }
        f.cache.toggle_like(KIND, SubjectId(2), ActorId(3)).await.unwrap();
        f.cache.toggle_like(KIND, SubjectId(1), ActorId(0)).await.unwrap();

        completed(f.reconciler.run_pass().await.unwrap());
        for id in [1, 2] {
            let live = f.cache.like_count(KIND, SubjectId(id)).await.unwrap();
            let stored = f.store.find_subject(KIND, SubjectId(id)).await.unwrap().unwrap();
            assert_eq!(stored.like_count, live);
        }
    }

    #[tokio::test]
    async fn test_last_unlike_still_reaches_the_store() {
        let f = fixture(&[1], true);
        let id = SubjectId(1);
        f.cache.toggle_like(KIND, id, ActorId(7)).await.unwrap();
        completed(f.reconciler.run_pass().await.unwrap());

        f.cache.toggle_like(KIND, id, ActorId(7)).await.unwrap();
        let report = completed(f.reconciler.run_pass().await.unwrap());
        assert_eq!(report.likes_pruned, 1);
        let stored = f.store.find_subject(KIND, id).await.unwrap().unwrap();
        assert_eq!(stored.like_count, 0);
        assert_eq!(f.store.like_row_count(), 0);
    }

    #[tokio::test]
    async fn test_deleted_subject_is_skipped_without_aborting() {
        let f = fixture(&[1], true);
        f.cache.toggle_like(KIND, SubjectId(1), ActorId(7)).await.unwrap();
        f.cache.toggle_like(KIND, SubjectId(404), ActorId(7)).await.unwrap();

        let report = completed(f.reconciler.run_pass().await.unwrap());
        assert_eq!(report.subjects_seen, 2);
        assert_eq!(report.subjects_skipped, 1);
        assert_eq!(report.subjects_updated, 1);
        assert!(!f.store.like_exists(KIND, SubjectId(404), ActorId(7)).await.unwrap());
    }

    /// Memory store whose `exists` fails while `down` is set.
    struct FlakyStore {
        inner: MemorySubjectStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl SubjectStore for FlakyStore {
        async fn find_subject(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<Option<Subject>> {
            self.inner.find_subject(kind, id).await
        }
        async fn exists(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.exists(kind, id).await
        }
        async fn save(&self, subject: &Subject) -> StoreResult<()> {
            self.inner.save(subject).await
        }
        async fn set_like_count(&self, kind: SubjectKind, id: SubjectId, like_count: u64) -> StoreResult<bool> {
            self.inner.set_like_count(kind, id, like_count).await
        }
        async fn increment_view_count(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool> {
            self.inner.increment_view_count(kind, id).await
        }
        async fn delete(&self, kind: SubjectKind, id: SubjectId) -> StoreResult<bool> {
            self.inner.delete(kind, id).await
        }
        async fn top_by_view_count(&self, kind: SubjectKind, limit: usize) -> StoreResult<Vec<Subject>> {
            self.inner.top_by_view_count(kind, limit).await
        }
        async fn like_exists(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<bool> {
            self.inner.like_exists(kind, subject, actor).await
        }
        async fn insert_like(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<()> {
            self.inner.insert_like(kind, subject, actor).await
        }
        async fn delete_like(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> StoreResult<()> {
            self.inner.delete_like(kind, subject, actor).await
        }
        async fn liked_actor_ids(&self, kind: SubjectKind, subject: SubjectId) -> StoreResult<Vec<ActorId>> {
            self.inner.liked_actor_ids(kind, subject).await
        }
    }

    #[tokio::test]
    async fn test_unlike_survives_a_failed_pass() {
        let cache = Arc::new(MemoryCounterCache::new());
        let store = Arc::new(FlakyStore {
            inner: MemorySubjectStore::with_subjects([Subject::new(KIND, SubjectId(1), "one")]),
            down: AtomicBool::new(false),
        });
        let reconciler = Reconciler::new(
            cache.clone(),
            store.clone(),
            Arc::new(MetricsCollector::new()),
            CircuitBreaker::new("reconciler", 3, Duration::from_secs(60), 1),
            Duration::from_secs(600),
            true,
        );
        let (id, actor) = (SubjectId(1), ActorId(7));

        cache.toggle_like(KIND, id, actor).await.unwrap();
        completed(reconciler.run_pass().await.unwrap());
        cache.toggle_like(KIND, id, actor).await.unwrap();

        store.down.store(true, Ordering::SeqCst);
        assert!(reconciler.run_pass().await.is_err());
        store.down.store(false, Ordering::SeqCst);

        completed(reconciler.run_pass().await.unwrap());
        let stored = store.find_subject(KIND, id).await.unwrap().unwrap();
        assert_eq!(stored.like_count, 0);
        assert_eq!(cache.like_count(KIND, id).await.unwrap(), 0);
        assert!(!store.like_exists(KIND, id, actor).await.unwrap());
    }

    #[tokio::test]
    async fn test_subject_deleted_before_execute_gets_no_like_rows() {
        let f = fixture(&[1], true);
        let stale = plan(&[snap(1, &[7, 9], &[])], true);
        f.store.delete(KIND, SubjectId(1)).await.unwrap();

        let report = f.reconciler.execute(&stale).await.unwrap();
        assert_eq!(report.subjects_updated, 0);
        assert_eq!(report.subjects_skipped, 1);
        assert_eq!(f.store.like_row_count(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_skipped() {
        let f = fixture(&[1], true);
        let held = f.reconciler.guard.try_lock().unwrap();
        assert_eq!(f.reconciler.run_pass().await.unwrap(), PassOutcome::Overlapped);
        drop(held);
        assert!(matches!(f.reconciler.run_pass().await.unwrap(), PassOutcome::Completed(_)));
        assert_eq!(f.reconciler.metrics.snapshot().reconcile_overlaps_skipped, 1);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let f = fixture(&[1], true);
        f.cache.toggle_like(KIND, SubjectId(1), ActorId(7)).await.unwrap();
        let reconciler = Arc::new(f.reconciler);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(reconciler.clone().run(rx));
        // The first tick fires immediately; wait for it to land.
        for _ in 0..100 {
            if reconciler.metrics.snapshot().reconcile_passes > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        let stored = f.store.find_subject(KIND, SubjectId(1)).await.unwrap().unwrap();
        assert_eq!(stored.like_count, 1);
    }
}
