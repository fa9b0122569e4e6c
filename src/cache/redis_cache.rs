// =============================================================================
// cache/redis_cache.rs: THE REAL THING
// =============================================================================
//
// `CounterCache` on top of Redis. One `ConnectionManager` is shared by every
// caller; it multiplexes commands over a single connection and reconnects on
// its own when Redis goes away, so handlers never hold a connection of their
// own for longer than one call.
//
// The like toggle is a Lua script. SISMEMBER followed by SADD or SREM from
// the client would let two concurrent toggles from the same actor both see
// "not a member" and both add. Inside a script Redis runs the whole thing
// without interleaving anything else. Claiming the dirty set is a script for
// the same reason: a toggle must land either before the merge or in the
// fresh dirty set after it, never in a set that is about to be deleted.
// =============================================================================

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::keys::KeySpace;
use super::CounterCache;
use crate::error::{CacheError, CacheResult};
use crate::models::{ActorId, SubjectId, SubjectKind, ToggleOutcome};
use crate::visitor::VisitorKey;

/// KEYS[1] like set, KEYS[2] actor index, KEYS[3] dirty set.
/// ARGV[1] actor id, ARGV[2] subject id.
/// Returns 1 when the like was added, 0 when it was removed.
const TOGGLE_LIKE_LUA: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
    redis.call('SREM', KEYS[1], ARGV[1])
    redis.call('SREM', KEYS[2], ARGV[2])
    redis.call('SADD', KEYS[3], ARGV[2])
    return 0
else
    redis.call('SADD', KEYS[1], ARGV[1])
    redis.call('SADD', KEYS[2], ARGV[2])
    redis.call('SADD', KEYS[3], ARGV[2])
    return 1
end
"#;

/// KEYS[1] dirty set, KEYS[2] claimed set.
/// Returns the claimed set after merging the dirty set into it.
const CLAIM_DIRTY_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('SUNIONSTORE', KEYS[2], KEYS[2], KEYS[1])
    redis.call('DEL', KEYS[1])
end
return redis.call('SMEMBERS', KEYS[2])
"#;

#[derive(Clone)]
pub struct RedisCounterCache {
    con: ConnectionManager,
    keys: KeySpace,
    toggle_script: Script,
    claim_script: Script,
    scan_batch: usize,
}

impl RedisCounterCache {
    /// Open a managed connection to `redis_url`.
    pub async fn connect(redis_url: &str, keys: KeySpace, scan_batch: usize) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let con = ConnectionManager::new(client).await?;
        info!(redis_url = redis_url, "Counter cache connected");
        Ok(Self::with_connection(con, keys, scan_batch))
    }

    pub fn with_connection(con: ConnectionManager, keys: KeySpace, scan_batch: usize) -> Self {
        Self {
            con,
            keys,
            toggle_script: Script::new(TOGGLE_LIKE_LUA),
            claim_script: Script::new(CLAIM_DIRTY_LUA),
            scan_batch: scan_batch.max(1),
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Walk the keyspace with SCAN rather than KEYS, so a large keyspace
    /// never blocks the server. SCAN may repeat keys; the result is deduped.
    async fn scan_keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut con = self.con.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_batch)
                .query_async(&mut con)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        debug!(pattern = pattern, found = keys.len(), "SCAN complete");
        Ok(keys)
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn parse_scored(key: &str, raw: Vec<(String, f64)>) -> CacheResult<Vec<(SubjectId, f64)>> {
    raw.into_iter()
        .map(|(member, score)| {
            member
                .parse::<SubjectId>()
                .map(|id| (id, score))
                .map_err(|_| CacheError::Malformed {
                    key: key.to_string(),
                    reason: format!("member `{member}` is not a subject id"),
                })
        })
        .collect()
}

fn parse_ids<T: std::str::FromStr>(key: &str, raw: Vec<String>) -> CacheResult<Vec<T>> {
    raw.into_iter()
        .map(|member| {
            member.parse::<T>().map_err(|_| CacheError::Malformed {
                key: key.to_string(),
                reason: format!("member `{member}` is not an id"),
            })
        })
        .collect()
}

#[async_trait]
impl CounterCache for RedisCounterCache {
    async fn mark_view_if_absent(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        visitor: &VisitorKey,
        ttl: Duration,
    ) -> CacheResult<bool> {
        let key = self.keys.view_marker(kind, subject, visitor);
        let mut con = self.con.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("true")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut con)
            .await?;
        debug!(key = %key, created = created.is_some(), "View marker SET NX");
        Ok(created.is_some())
    }

    async fn clear_view_markers(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<u64> {
        let pattern = self.keys.view_marker_pattern(kind, subject);
        let keys = self.scan_keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut con = self.con.clone();
        let removed: u64 = con.del(&keys).await?;
        Ok(removed)
    }

    async fn toggle_like(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        actor: ActorId,
    ) -> CacheResult<ToggleOutcome> {
        let mut con = self.con.clone();
        let added: i64 = self
            .toggle_script
            .key(self.keys.like_set(kind, subject))
            .key(self.keys.actor_likes(kind, actor))
            .key(self.keys.dirty_set(kind))
            .arg(actor.0)
            .arg(subject.0)
            .invoke_async(&mut con)
            .await?;

        match added {
            1 => Ok(ToggleOutcome::Added),
            0 => Ok(ToggleOutcome::Removed),
            other => Err(CacheError::Malformed {
                key: self.keys.like_set(kind, subject),
                reason: format!("toggle script returned {other}"),
            }),
        }
    }

    async fn is_liked(&self, kind: SubjectKind, subject: SubjectId, actor: ActorId) -> CacheResult<bool> {
        let mut con = self.con.clone();
        let member: bool = con.sismember(self.keys.like_set(kind, subject), actor.0).await?;
        Ok(member)
    }

    async fn like_count(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<u64> {
        let mut con = self.con.clone();
        let count: u64 = con.scard(self.keys.like_set(kind, subject)).await?;
        Ok(count)
    }

    async fn like_members(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<Vec<ActorId>> {
        let key = self.keys.like_set(kind, subject);
        let mut con = self.con.clone();
        let raw: Vec<String> = con.smembers(&key).await?;
        parse_ids(&key, raw)
    }

    async fn liked_subjects(&self, kind: SubjectKind) -> CacheResult<Vec<SubjectId>> {
        let keys = self.scan_keys(&self.keys.like_set_pattern(kind)).await?;
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            match self.keys.parse_like_set(kind, &key) {
                Some(id) => ids.push(id),
                // Someone else's key that happens to match the glob.
                None => warn!(key = %key, "Skipping unparseable like-set key"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn liked_by(&self, kind: SubjectKind, actor: ActorId) -> CacheResult<Vec<SubjectId>> {
        let key = self.keys.actor_likes(kind, actor);
        let mut con = self.con.clone();
        let raw: Vec<String> = con.smembers(&key).await?;
        let mut ids: Vec<SubjectId> = parse_ids(&key, raw)?;
        ids.sort();
        Ok(ids)
    }

    async fn claim_dirty(&self, kind: SubjectKind) -> CacheResult<Vec<SubjectId>> {
        let claimed = self.keys.dirty_claimed_set(kind);
        let mut con = self.con.clone();
        let raw: Vec<String> = self
            .claim_script
            .key(self.keys.dirty_set(kind))
            .key(&claimed)
            .invoke_async(&mut con)
            .await?;
        let mut ids: Vec<SubjectId> = parse_ids(&claimed, raw)?;
        ids.sort();
        Ok(ids)
    }

    async fn release_dirty(&self, kind: SubjectKind) -> CacheResult<()> {
        let mut con = self.con.clone();
        let _: () = con.del(self.keys.dirty_claimed_set(kind)).await?;
        Ok(())
    }

    async fn clear_likes(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<()> {
        let members = self.like_members(kind, subject).await?;
        let mut pipe = redis::pipe();
        for actor in &members {
            pipe.srem(self.keys.actor_likes(kind, *actor), subject.0).ignore();
        }
        pipe.del(self.keys.like_set(kind, subject)).ignore();
        pipe.srem(self.keys.dirty_set(kind), subject.0).ignore();
        pipe.srem(self.keys.dirty_claimed_set(kind), subject.0).ignore();

        let mut con = self.con.clone();
        let _: () = pipe.query_async(&mut con).await?;
        debug!(%kind, %subject, actors = members.len(), "Live like set cleared");
        Ok(())
    }

    async fn bump_leaderboard(
        &self,
        kind: SubjectKind,
        subject: SubjectId,
        ttl: Duration,
    ) -> CacheResult<f64> {
        let key = self.keys.leaderboard(kind);
        let mut con = self.con.clone();
        let (score,): (f64,) = redis::pipe()
            .atomic()
            .zincr(&key, subject.0, 1.0)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(score)
    }

    async fn leaderboard_top(&self, kind: SubjectKind, limit: usize) -> CacheResult<Vec<(SubjectId, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = self.keys.leaderboard(kind);
        let mut con = self.con.clone();
        let raw: Vec<(String, f64)> = con
            .zrevrange_withscores(&key, 0, limit as isize - 1)
            .await?;
        parse_scored(&key, raw)
    }

    async fn leaderboard_from_score(
        &self,
        kind: SubjectKind,
        min_score: f64,
    ) -> CacheResult<Vec<(SubjectId, f64)>> {
        let key = self.keys.leaderboard(kind);
        let mut con = self.con.clone();
        let raw: Vec<(String, f64)> = con
            .zrevrangebyscore_withscores(&key, "+inf", min_score)
            .await?;
        parse_scored(&key, raw)
    }

    async fn leaderboard_score(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<Option<f64>> {
        let mut con = self.con.clone();
        let score: Option<f64> = con.zscore(self.keys.leaderboard(kind), subject.0).await?;
        Ok(score)
    }

    async fn remove_from_leaderboard(&self, kind: SubjectKind, subject: SubjectId) -> CacheResult<()> {
        let mut con = self.con.clone();
        let _: () = con.zrem(self.keys.leaderboard(kind), subject.0).await?;
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut con = self.con.clone();
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}
