//! Configuration file watcher for hot reload.
//!
//! # Responsibilities
//! - Poll the config file for modification-time changes
//! - Debounce so a partially-written file is not loaded mid-save
//! - Publish valid changes; keep the previous snapshot on any failure
//!
//! # Design Decisions
//! - Polling keeps the watcher portable and dependency-free; two seconds
//!   is far below any human edit cadence
//! - A reload error logs and leaves the active snapshot untouched

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::loader::load_config;
use crate::config::store::ConfigStore;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Watch `path` and publish changed configurations into `store`.
/// Runs until the task is dropped.
pub async fn watch_config(path: PathBuf, store: Arc<ConfigStore>) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut last_modified: Option<SystemTime> = None;
    let mut first_check = true;

    loop {
        ticker.tick().await;

        let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Cannot stat configuration file");
                continue;
            }
        };

        if last_modified.is_some_and(|seen| modified <= seen) {
            continue;
        }

        // Let the writer finish before reading.
        tokio::time::sleep(SETTLE_DELAY).await;

        match load_config(&path) {
            Ok(snapshot) => {
                if first_check {
                    first_check = false;
                } else if snapshot.raw != store.current().raw {
                    tracing::info!(path = %path.display(), "Configuration file changed, reloading");
                    store.publish(snapshot);
                }
                last_modified = Some(modified);
            }
            Err(e) => {
                // Keep serving with the previous snapshot.
                tracing::error!(path = %path.display(), error = %e, "Configuration reload failed");
                last_modified = Some(modified);
            }
        }
    }
}
