//! Directory change monitoring.
//!
//! Watches the configuration and plugin binary directories and triggers a
//! registry resync when either changes. The watcher is advisory: events are
//! debounced into a single resync, and an unconditional periodic resync
//! covers dropped events, missing directories, and directories recreated
//! after the watch was established. Watches are re-armed on every tick so a
//! deleted-and-recreated directory re-attaches within one interval.

use crate::constants::{MONITOR_DEBOUNCE, RESYNC_INTERVAL};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Future returned by a resync callback.
pub type ResyncFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked on every change burst and periodic tick.
pub type ResyncFn = Arc<dyn Fn() -> ResyncFuture + Send + Sync>;

/// Handle to a running monitor task.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals the task to stop and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("monitor task did not exit cleanly: {e}");
        }
    }
}

/// Spawns the monitor over `dirs`, invoking `resync` on changes and on every
/// periodic tick.
pub fn spawn_monitor(dirs: Vec<PathBuf>, resync: ResyncFn) -> MonitorHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
        // Keeps the channel open even when the watcher cannot be built, so
        // the loop below stays alive on the periodic tick alone.
        let _event_tx = event_tx.clone();

        let mut watcher = match build_watcher(event_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("filesystem watcher unavailable, relying on periodic resync: {e}");
                None
            }
        };

        let mut ticker = tokio::time::interval(RESYNC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            arm_watches(watcher.as_mut(), &dirs);

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    resync().await;
                }
                received = event_rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                    // Coalesce the burst before resyncing once.
                    let deadline = tokio::time::sleep(MONITOR_DEBOUNCE);
                    tokio::pin!(deadline);
                    loop {
                        tokio::select! {
                            _ = &mut deadline => break,
                            more = event_rx.recv() => {
                                if more.is_none() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!("directory change detected, resyncing");
                    resync().await;
                }
            }
        }
    });

    MonitorHandle {
        shutdown: shutdown_tx,
        task,
    }
}

fn build_watcher(event_tx: mpsc::UnboundedSender<()>) -> notify::Result<RecommendedWatcher> {
    notify::recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) => {
            // Reads are noise; anything that can alter directory contents
            // triggers a resync.
            if !matches!(event.kind, EventKind::Access(_)) {
                let _ = event_tx.send(());
            }
        }
        Err(e) => warn!("filesystem watch error: {e}"),
    })
}

/// Re-arms the watch on every directory that currently exists. Errors are
/// ignored; the next tick retries, and the periodic resync covers the gap.
fn arm_watches(watcher: Option<&mut RecommendedWatcher>, dirs: &[PathBuf]) {
    let Some(watcher) = watcher else {
        return;
    };
    for dir in dirs {
        if dir.is_dir() {
            let _ = watcher.watch(dir, RecursiveMode::NonRecursive);
        }
    }
}
