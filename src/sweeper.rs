use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use ulid::Ulid;

use crate::engine::Engine;
use crate::limits::{COMPACTOR_INTERVAL, EXPIRY_SWEEP_INTERVAL, LIFECYCLE_SWEEP_INTERVAL};
use crate::model::Ms;

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Background task that periodically cancels lapsed holds. The durable
/// backstop behind the per-hold one-shot timers.
pub async fn run_expiry_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let cancelled = engine.sweep_expired_holds(now_ms()).await;
        if cancelled > 0 {
            info!("expiry sweep cancelled {cancelled} lapsed holds");
        }
    }
}

/// Daily lifecycle pass: checkout completions + cleaning buffers,
/// in-progress stays marked occupied, retention pruning.
pub async fn run_lifecycle_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(LIFECYCLE_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let today = chrono::Utc::now().date_naive();
        let transitions = engine.sweep_lifecycle(today).await;
        if transitions > 0 {
            info!("lifecycle sweep applied {transitions} transitions");
        }
    }
}

/// One-shot deferred expiry timer for a single hold, scheduled at creation
/// time. Losing the timer (crash, missed tick) is harmless — the periodic
/// sweeper is authoritative. A scheduling failure must never fail the
/// reservation itself, hence fire-and-forget.
pub fn schedule_expiry(engine: Arc<Engine>, reservation_id: Ulid, expires_at: Ms) {
    tokio::spawn(async move {
        let wait = (expires_at - now_ms()).max(0) as u64;
        tokio::time::sleep(Duration::from_millis(wait)).await;
        match engine.expire_hold(reservation_id, now_ms()).await {
            Ok(true) => info!("deferred expiry cancelled hold {reservation_id}"),
            Ok(false) => {} // confirmed or cancelled in the meantime
            Err(e) => tracing::debug!("deferred expiry skip {reservation_id}: {e}"),
        }
    });
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACTOR_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("WAL compacted after {appends} appends"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
