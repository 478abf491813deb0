//! Reaper loop: reclaim claims whose visibility window lapsed.
//!
//! This is an explicit background responsibility, not an implicit property
//! of the backend: the shared store re-admits expired claims to the pending
//! queue, the in-process store force-fails them (see
//! [`crate::store::TaskStore::reap_expired`]). The manager runs one reaper
//! next to the worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::store::TaskStore;

pub(crate) async fn reaper_loop(
    store: Arc<dyn TaskStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {
                match store.reap_expired().await {
                    Ok(reaped) if !reaped.is_empty() => {
                        info!(count = reaped.len(), "swept expired claims");
                    }
                    Ok(_) => {}
                    Err(error) => warn!(error = %error, "reap sweep failed"),
                }
            }
        }
    }
}
