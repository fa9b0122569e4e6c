// =============================================================================
// cache/keys.rs: WHERE EVERY COUNTER LIVES IN REDIS
// =============================================================================
//
// The only place key strings are assembled. Layout, with an optional prefix
// in front of each:
//
//   {kind}_like:{subject}            SET of actor ids liking the subject
//   {kind}_like_dirty                SET of subjects toggled since last claim
//   {kind}_like_dirty:claimed        SET of subjects the reconciler is working on
//   member_liked_{kind}s:{actor}     SET of subject ids the actor likes
//   {kind}_view:{subject}:{visitor}  STRING marker, expires with the window
//   link_click:{link}:{visitor}      STRING marker for link clicks
//   {kind}_day_view_count            ZSET subject id -> views in the window
//
// View markers end their subject segment with ':' so a pattern for subject
// 42 never sweeps up subject 420.
// =============================================================================

use crate::models::{ActorId, SubjectId, SubjectKind};
use crate::visitor::VisitorKey;

#[derive(Debug, Clone, Default)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn like_set(&self, kind: SubjectKind, subject: SubjectId) -> String {
        format!("{}{}_like:{}", self.prefix, kind, subject)
    }

    pub fn like_set_pattern(&self, kind: SubjectKind) -> String {
        format!("{}{}_like:*", glob_escape(&self.prefix), kind)
    }

    /// Recover the subject id from a key produced by [`KeySpace::like_set`].
    pub fn parse_like_set(&self, kind: SubjectKind, key: &str) -> Option<SubjectId> {
        let head = format!("{}{}_like:", self.prefix, kind);
        key.strip_prefix(head.as_str())?.parse().ok()
    }

    pub fn dirty_set(&self, kind: SubjectKind) -> String {
        format!("{}{}_like_dirty", self.prefix, kind)
    }

    pub fn dirty_claimed_set(&self, kind: SubjectKind) -> String {
        format!("{}{}_like_dirty:claimed", self.prefix, kind)
    }

    pub fn actor_likes(&self, kind: SubjectKind, actor: ActorId) -> String {
        format!("{}member_liked_{}s:{}", self.prefix, kind, actor)
    }

    pub fn view_marker(&self, kind: SubjectKind, subject: SubjectId, visitor: &VisitorKey) -> String {
        format!("{}{}:{}:{}", self.prefix, marker_tag(kind), subject, visitor)
    }

    pub fn view_marker_pattern(&self, kind: SubjectKind, subject: SubjectId) -> String {
        format!("{}{}:{}:*", glob_escape(&self.prefix), marker_tag(kind), subject)
    }

    pub fn leaderboard(&self, kind: SubjectKind) -> String {
        format!("{}{}_day_view_count", self.prefix, kind)
    }
}

fn marker_tag(kind: SubjectKind) -> &'static str {
    match kind {
        SubjectKind::Curation => "curation_view",
        SubjectKind::Playlist => "playlist_view",
        SubjectKind::Link => "link_click",
    }
}

/// Escape the glob metacharacters SCAN MATCH understands.
fn glob_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
