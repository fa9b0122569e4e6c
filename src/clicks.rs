// =============================================================================
// clicks.rs: COUNTING WHO FOLLOWED A LINK
// =============================================================================
//
// Outbound links carry a click count. A click passes the same dedup gate as a
// view, keyed `link_click:{link}:{visitor}`, but the window is much shorter:
// someone bouncing back and clicking again ten minutes later counts again.
//
// Clicks go straight to the store. There is no leaderboard for links.
// =============================================================================

use std::sync::Arc;
use tracing::{debug, warn};

use crate::dedup::DedupGate;
use crate::error::{PopularityError, Result};
use crate::models::{ClickOutcome, SubjectId, SubjectKind};
use crate::store::SubjectStore;
use crate::visitor::VisitorKey;

pub struct ClickCounter {
    gate: Arc<DedupGate>,
    store: Arc<dyn SubjectStore>,
}

impl ClickCounter {
    pub fn new(gate: Arc<DedupGate>, store: Arc<dyn SubjectStore>) -> Self {
        Self { gate, store }
    }

    /// Offer one click on `link`. An unknown link fails before a marker is
    /// written, so it cannot eat the visitor's window.
    pub async fn record_click(&self, link: SubjectId, visitor: &VisitorKey) -> Result<ClickOutcome> {
        let kind = SubjectKind::Link;
        if !self.store.exists(kind, link).await? {
            return Err(PopularityError::not_found(kind, link));
        }

        if !self.gate.should_count(kind, link, visitor).await? {
            return Ok(ClickOutcome::Repeat);
        }

        if !self.store.increment_view_count(kind, link).await? {
            warn!(%link, "Click counted for a link deleted mid-request");
        }
        debug!(%link, %visitor, "Click counted");
        Ok(ClickOutcome::Counted)
    }
}
