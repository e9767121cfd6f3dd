//! Idle logout.
//!
//! The front end calls `touch()` on user activity; once no activity has been
//! seen for the configured timeout the session is logged out.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::session::{LogoutReason, SessionStore};

/// Default idle timeout (1 hour)
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

pub struct InactivityWatcher {
    activity_tx: watch::Sender<Instant>,
    handle: JoinHandle<()>,
}

impl InactivityWatcher {
    pub fn start(store: &SessionStore, timeout: Duration) -> Self {
        let (activity_tx, mut activity_rx) = watch::channel(Instant::now());
        let weak = store.downgrade();

        let handle = tokio::spawn(async move {
            loop {
                let deadline = *activity_rx.borrow_and_update() + timeout;
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let Some(store) = weak.upgrade() else { return };
                        if store.credential().is_some() {
                            info!(timeout_secs = timeout.as_secs(), "Logging out after inactivity");
                            store.logout_for(LogoutReason::Inactivity).await;
                        }
                        drop(store);
                        // Stay idle until the next sign of activity
                        if activity_rx.changed().await.is_err() {
                            return;
                        }
                    }
                    changed = activity_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        debug!(timeout_secs = timeout.as_secs(), "Inactivity watcher started");
        Self {
            activity_tx,
            handle,
        }
    }

    /// Record user activity, pushing the idle deadline out
    pub fn touch(&self) {
        self.activity_tx.send_replace(Instant::now());
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for InactivityWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
