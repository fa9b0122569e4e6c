// =============================================================================
// cache/memory.rs: REDIS, IF REDIS FIT IN A MUTEX
// =============================================================================
//
// An in-process `CounterCache` with the same observable behaviour as the
// Redis backend: markers expire, the leaderboard expires as a whole, empty
// like sets disappear. Time is measured with `tokio::time::Instant`, so a
// test running on a paused runtime can jump a whole day with
// `tokio::time::advance` and watch markers lapse.
//
// One parking_lot mutex guards everything. Every operation holds it for the
// length of a map lookup, which also gives the toggle its atomicity.
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use super::CounterCache;
use crate::error::CacheResult;
use crate::models::{ActorId, SubjectId, SubjectKind, ToggleOutcome};
use crate::visitor::VisitorKey;

type SubjectRef = (SubjectKind, SubjectId);

#[derive(Default)]
struct Board {
    scores: HashMap<SubjectId, f64>,
    expires_at: Option<Instant>,
}

impl Board {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
struct State {
    markers: HashMap<(SubjectKind, SubjectId, VisitorKey), Instant>,
    like_sets: HashMap<SubjectRef, BTreeSet<ActorId>>,
    actor_index: HashMap<(SubjectKind, ActorId), BTreeSet<SubjectId>>,
    dirty: HashMap<SubjectKind, BTreeSet<SubjectId>>,
    claimed: HashMap<SubjectKind, BTreeSet<SubjectId>>,
    boards: HashMap<SubjectKind, Board>,
}

impl State {
    /// Drop the leaderboard of `kind` if its TTL has lapsed, the way Redis
    /// would have by now.
    fn live_board(&mut self, kind: SubjectKind, now: Instant) -> Option<&mut Board> {
        let expired = self.boards.get(&kind).is_some_and(|b| !b.is_live(now));
        if expired {
            self.boards.remove(&kind);
        }
        self.boards.get_mut(&kind)
    }
}

#[derive(Default)]
pub struct MemoryCounterCache {
    state: Mutex<State>,
}

impl MemoryCounterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything. The equivalent of FLUSHALL between test cases.
    pub fn clear(&self) {
        *self.state.lock() = State::default();
    }

    /// Number of unexpired view markers, across all subjects.
    pub fn live_marker_count(&self) -> usize {
        let now = Instant::now();
        self.state.lock().markers.values().filter(|at| now < **at).count()
    }
}

#[async_trait]
impl CounterCache for MemoryCounterCache {
    async fn mark_view_if_absent(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        visitor: &VisitorKey,
        ttl: Duration,
    ) -> CacheResult<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let key = (kind, subject, visitor.clone());

        match state.markers.get(&key) {
            Some(expires_at) if now < *expires_at => Ok(false),
            _ => {
                state.markers.insert(key, now + ttl);
                Ok(true)
            }
        }
    }

    async fn clear_view_markers(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<u64> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut live = 0;
        // Expired markers go too, but only live ones count: Redis would have
        // dropped the others already and SCAN never sees them.
        state.markers.retain(|(k, s, _), expires_at| {
            let hit = *k == kind && *s == subject;
            if hit && now < *expires_at {
                live += 1;
            }
            !hit
        });
        Ok(live)
    }

    async fn toggle_like(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        actor: ActorId,
    ) -> CacheResult<ToggleOutcome> {
        let mut state = self.state.lock();

        let members = state.like_sets.entry((kind, subject)).or_default();
        let outcome = if members.remove(&actor) {
            ToggleOutcome::Removed
        } else {
            members.insert(actor);
            ToggleOutcome::Added
        };
        if members.is_empty() {
            state.like_sets.remove(&(kind, subject));
        }

        let liked = state.actor_index.entry((kind, actor)).or_default();
        match outcome {
            ToggleOutcome::Added => {
                liked.insert(subject);
            }
            ToggleOutcome::Removed => {
                liked.remove(&subject);
            }
        }
        if liked.is_empty() {
            state.actor_index.remove(&(kind, actor));
        }

        state.dirty.entry(kind).or_default().insert(subject);
        Ok(outcome)
    }

    async fn is_liked(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> CacheResult<bool> {
        let state = self.state.lock();
        Ok(state
            .like_sets
            .get(&(kind, subject))
            .is_some_and(|members| members.contains(&actor)))
    }

    async fn like_count(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<u64> {
        let state = self.state.lock();
        Ok(state.like_sets.get(&(kind, subject)).map_or(0, |m| m.len() as u64))
    }

    async fn like_members(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<Vec<ActorId>> {
        let state = self.state.lock();
        Ok(state
            .like_sets
            .get(&(kind, subject))
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn liked_subjects(&self, kind: SubjectKind) -> CacheResult<Vec<SubjectId>> {
        let state = self.state.lock();
        let mut ids: Vec<SubjectId> = state
            .like_sets
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn liked_by(&self, kind: SubjectKind, actor: ActorId) -> CacheResult<Vec<SubjectId>> {
        let state = self.state.lock();
        Ok(state
            .actor_index
            .get(&(kind, actor))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn claim_dirty(&self, kind: SubjectKind) -> CacheResult<Vec<SubjectId>> {
        let mut state = self.state.lock();
        let fresh = state.dirty.remove(&kind).unwrap_or_default();
        let claimed = state.claimed.entry(kind).or_default();
        claimed.extend(fresh);
        let ids: Vec<SubjectId> = claimed.iter().copied().collect();
        if claimed.is_empty() {
            state.claimed.remove(&kind);
        }
        Ok(ids)
    }

    async fn release_dirty(&self, kind: SubjectKind) -> CacheResult<()> {
        self.state.lock().claimed.remove(&kind);
        Ok(())
    }

    async fn clear_likes(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let members = state.like_sets.remove(&(kind, subject)).unwrap_or_default();
        for actor in members {
            if let Some(liked) = state.actor_index.get_mut(&(kind, actor)) {
                liked.remove(&subject);
                if liked.is_empty() {
                    state.actor_index.remove(&(kind, actor));
                }
            }
        }
        for pending in [&mut state.dirty, &mut state.claimed] {
            if let Some(ids) = pending.get_mut(&kind) {
                ids.remove(&subject);
            }
        }
        Ok(())
    }

    async fn bump_leaderboard(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        ttl: Duration,
    ) -> CacheResult<f64> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.live_board(kind, now).is_none() {
            state.boards.insert(kind, Board::default());
        }
        let board = state.boards.entry(kind).or_default();
        let score = board.scores.entry(subject).or_insert(0.0);
        *score += 1.0;
        let score = *score;
        board.expires_at = Some(now + ttl);
        Ok(score)
    }

    async fn leaderboard_top(&self, kind: SubjectKind, limit: usize) -> CacheResult<Vec<(SubjectId, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(board) = state.live_board(kind, now) else {
            return Ok(Vec::new());
        };

        let mut entries: Vec<(SubjectId, f64)> =
            board.scores.iter().map(|(id, score)| (*id, *score)).collect();
        // ZREVRANGE order: score descending, then member descending.
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.to_string().cmp(&a.0.to_string())));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn leaderboard_from_score(
        &self,
        kind: SubjectKind,
        min_score: f64,
    ) -> CacheResult<Vec<(SubjectId, f64)>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(board) = state.live_board(kind, now) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(SubjectId, f64)> = board
            .scores
            .iter()
            .filter(|(_, score)| **score >= min_score)
            .map(|(id, score)| (*id, *score))
            .collect();
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.to_string().cmp(&a.0.to_string())));
        Ok(entries)
    }

    async fn leaderboard_score(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<Option<f64>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        Ok(state
            .live_board(kind, now)
            .and_then(|board| board.scores.get(&subject).copied()))
    }

    async fn remove_from_leaderboard(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let now_empty = match state.live_board(kind, now) {
            Some(board) => {
                board.scores.remove(&subject);
                board.scores.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.boards.remove(&kind);
        }
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn visitor(raw: &str) -> VisitorKey {
        VisitorKey::from_raw(raw)
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_blocks_until_ttl_lapses() {
        let cache = MemoryCounterCache::new();
        let (kind, id, v) = (SubjectKind::Curation, SubjectId(1), visitor("a"));

        assert!(cache.mark_view_if_absent(kind, id, &v, DAY).await.unwrap());
        assert!(!cache.mark_view_if_absent(kind, id, &v, DAY).await.unwrap());

        tokio::time::advance(DAY + Duration::from_secs(1)).await;
        assert!(cache.mark_view_if_absent(kind, id, &v, DAY).await.unwrap());
    }

    #[tokio::test]
    async fn test_markers_are_scoped_by_kind_and_subject() {
        let cache = MemoryCounterCache::new();
        let v = visitor("a");
        assert!(cache.mark_view_if_absent(SubjectKind::Curation, SubjectId(1), &v, DAY).await.unwrap());
        assert!(cache.mark_view_if_absent(SubjectKind::Playlist, SubjectId(1), &v, DAY).await.unwrap());
        assert!(cache.mark_view_if_absent(SubjectKind::Curation, SubjectId(2), &v, DAY).await.unwrap());

        let cleared = cache.clear_view_markers(SubjectKind::Curation, SubjectId(1)).await.unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(cache.live_marker_count(), 2);
    }

    #[tokio::test]
    async fn test_toggle_maintains_set_index_and_dirty() {
        let cache = MemoryCounterCache::new();
        let (kind, id, actor) = (SubjectKind::Playlist, SubjectId(5), ActorId(7));

        assert_eq!(cache.toggle_like(kind, id, actor).await.unwrap(), ToggleOutcome::Added);
        assert!(cache.is_liked(kind, id, actor).await.unwrap());
        assert_eq!(cache.liked_by(kind, actor).await.unwrap(), vec![id]);
        assert_eq!(cache.liked_subjects(kind).await.unwrap(), vec![id]);

        assert_eq!(cache.toggle_like(kind, id, actor).await.unwrap(), ToggleOutcome::Removed);
        assert_eq!(cache.like_count(kind, id).await.unwrap(), 0);
        assert!(cache.liked_by(kind, actor).await.unwrap().is_empty());
        assert!(cache.liked_subjects(kind).await.unwrap().is_empty());

        assert_eq!(cache.claim_dirty(kind).await.unwrap(), vec![id]);
        cache.release_dirty(kind).await.unwrap();
        assert!(cache.claim_dirty(kind).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreleased_claim_is_offered_again() {
        let cache = MemoryCounterCache::new();
        let kind = SubjectKind::Curation;
        cache.toggle_like(kind, SubjectId(1), ActorId(7)).await.unwrap();
        assert_eq!(cache.claim_dirty(kind).await.unwrap(), vec![SubjectId(1)]);

        // The holder never released; a later toggle joins the old claim.
        cache.toggle_like(kind, SubjectId(2), ActorId(7)).await.unwrap();
        assert_eq!(cache.claim_dirty(kind).await.unwrap(), vec![SubjectId(1), SubjectId(2)]);

        cache.release_dirty(kind).await.unwrap();
        assert!(cache.claim_dirty(kind).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_markers_count_only_live_ones() {
        let cache = MemoryCounterCache::new();
        let (kind, id) = (SubjectKind::Playlist, SubjectId(3));
        cache.mark_view_if_absent(kind, id, &visitor("old"), Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        cache.mark_view_if_absent(kind, id, &visitor("new"), DAY).await.unwrap();

        assert_eq!(cache.clear_view_markers(kind, id).await.unwrap(), 1);
        assert_eq!(cache.live_marker_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaderboard_expires_as_a_whole() {
        let cache = MemoryCounterCache::new();
        let kind = SubjectKind::Curation;

        cache.bump_leaderboard(kind, SubjectId(1), DAY).await.unwrap();
        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        // Touching any entry pushes the horizon out for all of them.
        cache.bump_leaderboard(kind, SubjectId(2), DAY).await.unwrap();
        tokio::time::advance(DAY - Duration::from_secs(60)).await;
        assert_eq!(cache.leaderboard_score(kind, SubjectId(1)).await.unwrap(), Some(1.0));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(cache.leaderboard_top(kind, 3).await.unwrap().is_empty());
        assert_eq!(cache.leaderboard_score(kind, SubjectId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_leaderboard_top_orders_by_score() {
        let cache = MemoryCounterCache::new();
        let kind = SubjectKind::Curation;
        for (id, views) in [(1, 2), (2, 5), (3, 1)] {
            for _ in 0..views {
                cache.bump_leaderboard(kind, SubjectId(id), DAY).await.unwrap();
            }
        }
        let top = cache.leaderboard_top(kind, 2).await.unwrap();
        assert_eq!(top, vec![(SubjectId(2), 5.0), (SubjectId(1), 2.0)]);
    }

    #[tokio::test]
    async fn test_clear_likes_scrubs_actor_indexes() {
        let cache = MemoryCounterCache::new();
        let kind = SubjectKind::Curation;
        cache.toggle_like(kind, SubjectId(1), ActorId(7)).await.unwrap();
        cache.toggle_like(kind, SubjectId(2), ActorId(7)).await.unwrap();

        cache.clear_likes(kind, SubjectId(1)).await.unwrap();
        assert_eq!(cache.liked_by(kind, ActorId(7)).await.unwrap(), vec![SubjectId(2)]);
        assert_eq!(cache.like_count(kind, SubjectId(1)).await.unwrap(), 0);
        assert_eq!(cache.claim_dirty(kind).await.unwrap(), vec![SubjectId(2)]);
    }

    #[tokio::test]
    async fn test_leaderboard_from_score_returns_every_tie() {
        let cache = MemoryCounterCache::new();
        let kind = SubjectKind::Curation;
        for id in [1, 2, 9, 10] {
            cache.bump_leaderboard(kind, SubjectId(id), DAY).await.unwrap();
        }
        cache.bump_leaderboard(kind, SubjectId(4), DAY).await.unwrap();
        cache.bump_leaderboard(kind, SubjectId(4), DAY).await.unwrap();

        let ties = cache.leaderboard_from_score(kind, 1.0).await.unwrap();
        assert_eq!(ties.len(), 5);
        assert_eq!(ties[0], (SubjectId(4), 2.0));
        assert_eq!(cache.leaderboard_from_score(kind, 2.0).await.unwrap(), vec![(SubjectId(4), 2.0)]);
    }
}
