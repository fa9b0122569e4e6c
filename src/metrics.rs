// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR - counters for every hot-path decision
// ═══════════════════════════════════════════════════════════════
//
// Lock-free counters bumped by the engine, plus a tiny HTTP listener
// that answers every connection with a JSON snapshot. The backend's
// health checks poll it; nothing else is served.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub views_counted: u64,
    pub views_repeated: u64,
    pub clicks_counted: u64,
    pub clicks_repeated: u64,
    pub likes_added: u64,
    pub likes_removed: u64,
    pub trending_from_leaderboard: u64,
    pub trending_from_store: u64,
    pub stale_entries_evicted: u64,
    pub reconcile_passes: u64,
    pub reconcile_overlaps_skipped: u64,
    pub reconcile_failures: u64,
    pub likes_persisted: u64,
    pub likes_pruned: u64,
    pub uptime_seconds: u64,
    pub status: String,
}

pub struct MetricsCollector {
    views_counted: AtomicU64,
    views_repeated: AtomicU64,
    clicks_counted: AtomicU64,
    clicks_repeated: AtomicU64,
    likes_added: AtomicU64,
    likes_removed: AtomicU64,
    trending_from_leaderboard: AtomicU64,
    trending_from_store: AtomicU64,
    stale_entries_evicted: AtomicU64,
    reconcile_passes: AtomicU64,
    reconcile_overlaps_skipped: AtomicU64,
    reconcile_failures: AtomicU64,
    likes_persisted: AtomicU64,
    likes_pruned: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            views_counted: AtomicU64::new(0),
            views_repeated: AtomicU64::new(0),
            clicks_counted: AtomicU64::new(0),
            clicks_repeated: AtomicU64::new(0),
            likes_added: AtomicU64::new(0),
            likes_removed: AtomicU64::new(0),
            trending_from_leaderboard: AtomicU64::new(0),
            trending_from_store: AtomicU64::new(0),
            stale_entries_evicted: AtomicU64::new(0),
            reconcile_passes: AtomicU64::new(0),
            reconcile_overlaps_skipped: AtomicU64::new(0),
            reconcile_failures: AtomicU64::new(0),
            likes_persisted: AtomicU64::new(0),
            likes_pruned: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_view(&self, counted: bool) {
        let counter = if counted { &self.views_counted } else { &self.views_repeated };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_click(&self, counted: bool) {
        let counter = if counted { &self.clicks_counted } else { &self.clicks_repeated };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_toggle(&self, liked: bool) {
        let counter = if liked { &self.likes_added } else { &self.likes_removed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trending(&self, from_leaderboard: bool) {
        let counter = if from_leaderboard {
            &self.trending_from_leaderboard
        } else {
            &self.trending_from_store
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stale_evicted(&self, n: u64) {
        self.stale_entries_evicted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_reconcile_passes(&self) {
        self.reconcile_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconcile_overlaps(&self) {
        self.reconcile_overlaps_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconcile_failures(&self) {
        self.reconcile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_likes_persisted(&self, n: u64) {
        self.likes_persisted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_likes_pruned(&self, n: u64) {
        self.likes_pruned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            views_counted: self.views_counted.load(Ordering::Relaxed),
            views_repeated: self.views_repeated.load(Ordering::Relaxed),
            clicks_counted: self.clicks_counted.load(Ordering::Relaxed),
            clicks_repeated: self.clicks_repeated.load(Ordering::Relaxed),
            likes_added: self.likes_added.load(Ordering::Relaxed),
            likes_removed: self.likes_removed.load(Ordering::Relaxed),
            trending_from_leaderboard: self.trending_from_leaderboard.load(Ordering::Relaxed),
            trending_from_store: self.trending_from_store.load(Ordering::Relaxed),
            stale_entries_evicted: self.stale_entries_evicted.load(Ordering::Relaxed),
            reconcile_passes: self.reconcile_passes.load(Ordering::Relaxed),
            reconcile_overlaps_skipped: self.reconcile_overlaps_skipped.load(Ordering::Relaxed),
            reconcile_failures: self.reconcile_failures.load(Ordering::Relaxed),
            likes_persisted: self.likes_persisted.load(Ordering::Relaxed),
            likes_pruned: self.likes_pruned.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            status: "operational".to_string(),
        }
    }
}

/// Serve `report()` as JSON to every connection on `port` until shutdown.
pub async fn run_metrics_server<F>(port: u16, report: F, shutdown: &mut watch::Receiver<bool>)
where
    F: Fn() -> serde_json::Value + Send,
{
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind metrics server");
            return;
        }
    };

    info!(addr = %addr, "Metrics server listening");

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((mut stream, _peer)) => {
                        let json = serde_json::to_string_pretty(&report())
                            .unwrap_or_else(|_| "{}".to_string());
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                            json.len(),
                            json,
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Metrics server accept error");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Metrics server shutting down");
                break;
            }
        }
    }
}
