use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::observability::WAL_COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        maybe_compact(&engine, threshold).await;
    }
}

/// Compact if the append count has passed `threshold`. Returns whether it did.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
            tracing::debug!(appends, "compaction finished");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "WAL compaction failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{AddressBook, Collaborators, HolidayCalendar};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn collab() -> Collaborators {
        Collaborators::new(Arc::new(AddressBook::new()), Arc::new(HolidayCalendar::new()))
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), collab()).unwrap();
        for i in 0..3 {
            engine
                .create_user(Ulid::new(), "User", &format!("u{i}@example.com"), "Somewhere 1", "IL")
                .await
                .unwrap();
        }

        assert!(!maybe_compact(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        assert!(maybe_compact(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let reopened = Engine::new(path, collab()).unwrap();
        assert_eq!(reopened.user_count(), 3);
    }
}
