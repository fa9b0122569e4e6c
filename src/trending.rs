// =============================================================================
// trending.rs: WHAT EVERYONE IS LOOKING AT TODAY
// =============================================================================
//
// The leaderboard is the cheap answer. Read the top N ids, look each one up,
// sort by score. Subjects deleted since their last view are dropped from the
// answer and from the leaderboard, so they stop coming back.
//
// Redis orders equal scores by member string, so "10" sorts before "9". When
// the top N ends on a run of equal scores, the whole run is read and the tie
// is broken by id here.
//
// A cold leaderboard (first request of the day, or Redis was flushed) means
// the answer comes from the store instead: top N by lifetime view count. So
// does a leaderboard whose every entry turned out to be deleted. The two
// sources are never mixed in one answer.
// =============================================================================

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::CounterCache;
use crate::error::Result;
use crate::models::{SubjectId, SubjectKind, SubjectSummary, Trending, TrendingSource};
use crate::store::SubjectStore;

pub const DEFAULT_TRENDING_LIMIT: usize = 3;

pub struct TrendingSelector {
    cache: Arc<dyn CounterCache>,
    store: Arc<dyn SubjectStore>,
}

/// Entries evicted while building an answer, for the metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendingAnswer {
    pub trending: Trending,
    pub evicted: Vec<SubjectId>,
}

impl TrendingSelector {
    pub fn new(cache: Arc<dyn CounterCache>, store: Arc<dyn SubjectStore>) -> Self {
        Self { cache, store }
    }

    pub async fn trending(&self, kind: SubjectKind, limit: usize) -> Result<Trending> {
        Ok(self.select(kind, limit).await?.trending)
    }

    /// `trending`, also reporting which stale entries were evicted.
    pub async fn select(&self, kind: SubjectKind, limit: usize) -> Result<TrendingAnswer> {
        let mut candidates = self.cache.leaderboard_top(kind, limit).await?;
        if candidates.is_empty() {
            return self.from_store(kind, limit, Vec::new()).await;
        }
        if candidates.len() == limit {
            if let Some(&(_, cutoff)) = candidates.last() {
                candidates = self.cache.leaderboard_from_score(kind, cutoff).await?;
            }
        }
        candidates.sort_by(|(a, sa), (b, sb)| by_score_then_id((*sa, *a), (*sb, *b)));

        let mut scored = Vec::with_capacity(limit);
        let mut evicted = Vec::new();

        for (id, _) in candidates {
            if scored.len() == limit {
                break;
            }
            let Some(subject) = self.store.find_subject(kind, id).await? else {
                self.cache.remove_from_leaderboard(kind, id).await?;
                evicted.push(id);
                continue;
            };
            // Re-read: the score may have moved since the range read.
            let score = self.cache.leaderboard_score(kind, id).await?.unwrap_or(0.0);
            scored.push((score, subject));
        }

        if !evicted.is_empty() {
            info!(%kind, evicted = ?evicted, "Evicted deleted subjects from the leaderboard");
        }
        if scored.is_empty() {
            return self.from_store(kind, limit, evicted).await;
        }

        scored.sort_by(|(sa, a), (sb, b)| by_score_then_id((*sa, a.id), (*sb, b.id)));

        let subjects = scored
            .into_iter()
            .map(|(score, subject)| {
                let mut summary = SubjectSummary::from_subject(&subject);
                summary.view_count = score.max(0.0) as u64;
                summary
            })
            .collect();

        Ok(TrendingAnswer {
            trending: Trending {
                kind,
                source: TrendingSource::Leaderboard,
                subjects,
            },
            evicted,
        })
    }

    async fn from_store(
        &self,
        kind: SubjectKind,
        limit: usize,
        evicted: Vec<SubjectId>,
    ) -> Result<TrendingAnswer> {
        debug!(%kind, limit, "Leaderboard cold, ranking from the store");
        let rows = self.store.top_by_view_count(kind, limit).await?;
        Ok(TrendingAnswer {
            trending: Trending {
                kind,
                source: TrendingSource::Store,
                subjects: rows.iter().map(SubjectSummary::from_subject).collect(),
            },
            evicted,
        })
    }
}

/// Higher score first, then lower id.
fn by_score_then_id(a: (f64, SubjectId), b: (f64, SubjectId)) -> Ordering {
    b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal).then(a.1.cmp(&b.1))
}
