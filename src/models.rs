// =============================================================================
// models.rs: THE NOUNS OF POPULARITY
// =============================================================================
//
// The handful of types every other module passes around. A subject is a
// curation, a playlist or an outbound link; an actor is a member who can like
// things; a visitor is whoever fetched the page, logged in or not.
//
// Only the counters live here. Titles ride along so trending results can be
// rendered without a second lookup, everything else about a curation or a
// playlist belongs to the CRUD layer and never reaches this crate.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which table a subject lives in. Every kind shares the counter
/// mechanisms, but never a key or a row.
///
/// Links are only ever clicked, never liked. Their `view_count` is the
/// click count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Curation,
    Playlist,
    Link,
}

impl SubjectKind {
    pub const ALL: [SubjectKind; 3] = [SubjectKind::Curation, SubjectKind::Playlist, SubjectKind::Link];

    /// Kinds that carry a like set and need reconciling.
    pub const LIKEABLE: [SubjectKind; 2] = [SubjectKind::Curation, SubjectKind::Playlist];

    pub fn is_likeable(&self) -> bool {
        Self::LIKEABLE.contains(self)
    }

    /// Short lowercase tag used in cache keys and SQL discriminators.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Curation => "curation",
            SubjectKind::Playlist => "playlist",
            SubjectKind::Link => "link",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "curation" => Ok(SubjectKind::Curation),
            "playlist" => Ok(SubjectKind::Playlist),
            "link" => Ok(SubjectKind::Link),
            other => Err(format!("unknown subject kind `{other}`")),
        }
    }
}

/// Primary key of a curation or playlist row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SubjectId(pub i64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubjectId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(SubjectId)
    }
}

/// Primary key of the member who likes something.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ActorId(pub i64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ActorId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ActorId)
    }
}

/// The authoritative record of a subject, as far as this crate cares.
///
/// `like_count` is only as fresh as the last reconciler pass. `view_count`
/// is written on every counted view, so it is fresh within one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: SubjectId,
    pub title: String,
    pub like_count: u64,
    pub view_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Subject {
    pub fn new(kind: SubjectKind, id: SubjectId, title: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            title: title.into(),
            like_count: 0,
            view_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_counts(mut self, like_count: u64, view_count: u64) -> Self {
        self.like_count = like_count;
        self.view_count = view_count;
        self
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} \"{}\" (likes: {}, views: {})",
            self.kind, self.id, self.title, self.like_count, self.view_count
        )
    }
}

/// What a toggle did. The script reports it so callers can tell a like from
/// an unlike without a second round trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToggleOutcome {
    Added,
    Removed,
}

impl ToggleOutcome {
    pub fn is_liked(&self) -> bool {
        matches!(self, ToggleOutcome::Added)
    }
}

/// Result of offering one view to the accumulator.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ViewOutcome {
    /// First view from this visitor inside the window. `score` is the
    /// subject's leaderboard score after the increment.
    Counted { score: f64 },
    /// The visitor already counted inside the window; nothing changed.
    Repeat,
}

impl ViewOutcome {
    pub fn counted(&self) -> bool {
        matches!(self, ViewOutcome::Counted { .. })
    }
}

/// Result of offering one link click.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClickOutcome {
    Counted,
    /// Same visitor, same link, inside the click window.
    Repeat,
}

impl ClickOutcome {
    pub fn counted(&self) -> bool {
        matches!(self, ClickOutcome::Counted)
    }
}

/// One row of a trending answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectSummary {
    pub kind: SubjectKind,
    pub id: SubjectId,
    pub title: String,
    pub like_count: u64,
    /// Today's leaderboard score when served from the cache, the persisted
    /// lifetime view count when served from the store.
    pub view_count: u64,
}

impl SubjectSummary {
    pub fn from_subject(subject: &Subject) -> Self {
        Self {
            kind: subject.kind,
            id: subject.id,
            title: subject.title.clone(),
            like_count: subject.like_count,
            view_count: subject.view_count,
        }
    }
}

/// Where a trending answer came from. Never both.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrendingSource {
    Leaderboard,
    Store,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Trending {
    pub kind: SubjectKind,
    pub source: TrendingSource,
    pub subjects: Vec<SubjectSummary>,
}

impl Trending {
    pub fn ids(&self) -> Vec<SubjectId> {
        self.subjects.iter().map(|s| s.id).collect()
    }
}
