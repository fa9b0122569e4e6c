// =============================================================================
// dedup.rs: ONE VISITOR, ONE VIEW, ONE DAY
// =============================================================================
//
// The gate in front of the view counter. A visitor refreshing the same
// curation forty times should move the needle once, not forty times.
//
// The state lives in the counter cache as a TTL'd marker per
// (subject, visitor). "Set if absent" is a single atomic operation there, so
// two requests from the same visitor racing each other cannot both win.
// When the marker expires the visitor counts again. The window is per kind:
// views hold for a day, link clicks for ten minutes.
//
// This is not exactly-once. If Redis evicts or loses a marker early, the
// visitor gets counted twice inside a window. For a popularity signal that
// is an acceptable trade.
// =============================================================================

use portable_atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::CounterCache;
use crate::error::CacheResult;
use crate::models::{SubjectId, SubjectKind};
use crate::visitor::VisitorKey;

pub struct DedupGate {
    cache: Arc<dyn CounterCache>,
    window: Duration,
    overrides: BTreeMap<SubjectKind, Duration>,
    pub stats: Arc<DedupStats>,
}

/// Counters behind the stats endpoint. Relaxed atomics; nobody orders on
/// them.
#[derive(Default)]
pub struct DedupStats {
    pub checks: AtomicU64,
    pub counted: AtomicU64,
    pub suppressed: AtomicU64,
}

impl DedupGate {
    pub fn new(cache: Arc<dyn CounterCache>, window: Duration) -> Self {
        Self {
            cache,
            window,
            overrides: BTreeMap::new(),
            stats: Arc::new(DedupStats::default()),
        }
    }

    /// Use `window` instead of the default for subjects of `kind`.
    pub fn with_window(mut self, kind: SubjectKind, window: Duration) -> Self {
        self.overrides.insert(kind, window);
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_for(&self, kind: SubjectKind) -> Duration {
        self.overrides.get(&kind).copied().unwrap_or(self.window)
    }

    /// `true` exactly when this is the visitor's first interaction with the
    /// subject inside the current window. The marker is created as a side
    /// effect of a `true` answer.
    pub async fn should_count(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        visitor: &VisitorKey,
    ) -> CacheResult<bool> {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);

        let fresh = self
            .cache
            .mark_view_if_absent(kind, subject, visitor, self.window_for(kind))
            .await?;

        if fresh {
            self.stats.counted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(%kind, %subject, %visitor, "Repeat view inside dedup window");
        }
        Ok(fresh)
    }

    pub fn snapshot(&self) -> DedupSnapshot {
        DedupSnapshot {
            total_checks: self.stats.checks.load(Ordering::Relaxed),
            counted: self.stats.counted.load(Ordering::Relaxed),
            suppressed: self.stats.suppressed.load(Ordering::Relaxed),
            window_secs: self.window.as_secs(),
            kind_window_secs: self
                .overrides
                .iter()
                .map(|(kind, window)| (*kind, window.as_secs()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DedupSnapshot {
    pub total_checks: u64,
    pub counted: u64,
    pub suppressed: u64,
    pub window_secs: u64,
    pub kind_window_secs: BTreeMap<SubjectKind, u64>,
}
