//! Write-behind popularity counters for curations, playlists and links.
//!
//! Likes and views land in a fast counter cache (Redis) on the hot path. A
//! periodic reconciler drains like sets into the relational store, and a
//! daily view leaderboard answers "what is trending" without touching the
//! database. [`PopularityEngine`] is the entry point.

pub mod cache;
pub mod circuit_breaker;
pub mod clicks;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod likes;
pub mod metrics;
pub mod models;
pub mod reconciler;
pub mod store;
pub mod trending;
pub mod views;
pub mod visitor;

pub use crate::config::Config;
pub use crate::engine::{DeletionReport, EngineStats, PopularityEngine};
pub use crate::error::{CacheError, PopularityError, Result, StoreError};
pub use crate::models::{
    ActorId, ClickOutcome, Subject, SubjectId, SubjectKind, SubjectSummary, ToggleOutcome, Trending, TrendingSource,
    ViewOutcome,
};
pub use crate::reconciler::{PassOutcome, ReconcileReport};
pub use crate::visitor::VisitorKey;
