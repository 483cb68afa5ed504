use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const EXPIRY_INTERVAL: Duration = Duration::from_secs(60);
const COMPACT_INTERVAL: Duration = Duration::from_secs(30);

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Background task that marks passes Expired once their validity window closes.
pub async fn run_pass_expiry(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(EXPIRY_INTERVAL);
    loop {
        interval.tick().await;
        match engine.expire_passes(now_ms()).await {
            Ok(0) => {}
            Ok(n) => debug!("pass expiry sweep: {n} expired"),
            // Lock timeouts are retried on the next tick.
            Err(e) => warn!("pass expiry sweep failed: {e}"),
        }
    }
}

/// Background task that rewrites the WAL once enough records pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        if compact_if_due(&engine, threshold).await {
            info!("WAL compaction complete");
        }
    }
}

async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    if engine.wal_appends_since_compact().await < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::model::*;
    use crate::outbox::Outbox;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("studiodb_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str) -> Arc<Engine> {
        let (outbox, _rx) = Outbox::channel();
        Arc::new(Engine::new(test_wal_path(name), outbox, PolicyConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn sweep_expires_only_stale_passes() {
        let engine = engine("reaper_expiry.wal");
        let client = Ulid::new();
        engine.create_client(client, None).await.unwrap();
        let now = now_ms();
        let stale = Ulid::new();
        let fresh = Ulid::new();
        engine
            .create_pass(stale, client, 5, now - 10 * HOUR_MS, now + 50)
            .await
            .unwrap();
        engine
            .create_pass(fresh, client, 5, now - HOUR_MS, now + 10 * HOUR_MS)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.expire_passes(now_ms()).await.unwrap(), 1);

        let passes = engine.list_passes(client).await.unwrap();
        let status = |id: Ulid| passes.iter().find(|p| p.id == id).map(|p| p.status);
        assert_eq!(status(stale), Some(PassStatus::Expired));
        assert_eq!(status(fresh), Some(PassStatus::Active));
        assert_eq!(engine.total_available_credits(client).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let engine = engine("reaper_compact.wal");
        for _ in 0..3 {
            engine.create_client(Ulid::new(), None).await.unwrap();
        }
        assert!(!compact_if_due(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        assert!(compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
