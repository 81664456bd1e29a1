use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::model::Ms;
use crate::observability::HOLDS_EXPIRED_TOTAL;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that releases expired checkout holds every `every`.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_once(&engine, now_ms()).await;
    }
}

/// Release every hold that expired at or before `now`. Returns how many were released.
pub async fn reap_once(engine: &Engine, now: Ms) -> usize {
    let mut released = 0;
    for (hold_id, session_id) in engine.collect_expired_holds(now) {
        match engine.release_hold(hold_id).await {
            Ok(_) => {
                released += 1;
                metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(1);
                info!("expired hold {hold_id} on session {session_id}");
            }
            // Confirmed or released in the meantime.
            Err(e) => debug!("reaper skip {hold_id}: {e}"),
        }
    }
    released
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
