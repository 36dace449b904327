//! Background persistence and snapshot rendering.
//!
//! The HTTP response returns as soon as the in-memory chunk is updated; disk
//! persistence and PNG rendering happen here, off the request path. The
//! worker is fed per-write notifications through a bounded channel and
//! additionally rescans for dirty chunks on a timer, which makes the design
//! latest-wins and self-healing:
//!
//! - Serialization always snapshots *current* chunk state, so however the
//!   notification queue is ordered or truncated, a stale write can never
//!   clobber a newer one on disk.
//! - A dropped notification (full queue) or a failed flush leaves the chunk
//!   dirty; the next rescan retries it. A crash loses at most the writes
//!   since the last successful flush, bounded by the rescan interval.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use mosaic_core::config::FlushConfig;
use mosaic_core::snapshot::{SnapshotError, SnapshotPublisher};
use mosaic_core::store::{CanvasStore, ChunkSnapshot};

/// Errors from one flush attempt.
#[derive(Debug, Error)]
pub enum FlushError {
    /// Chunk file persistence failed.
    #[error("chunk persistence failed: {0}")]
    Persist(#[from] std::io::Error),

    /// Image rendering or publication failed.
    #[error("chunk image publication failed: {0}")]
    Publish(#[from] SnapshotError),
}

/// Long-running worker that persists and renders dirty chunks.
pub struct FlushWorker {
    store: Arc<CanvasStore>,
    publisher: Arc<SnapshotPublisher>,
    rx: mpsc::Receiver<(u32, u32)>,
    rescan: Duration,
}

impl FlushWorker {
    /// Creates the worker and the notification sender handed to the write
    /// path. The channel is bounded by `config.queue_depth`; senders use
    /// `try_send` and rely on the rescan pass when the queue is full.
    #[must_use]
    pub fn new(
        store: Arc<CanvasStore>,
        publisher: Arc<SnapshotPublisher>,
        config: &FlushConfig,
    ) -> (mpsc::Sender<(u32, u32)>, Self) {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let worker = Self {
            store,
            publisher,
            rx,
            rescan: Duration::from_secs(config.rescan_secs.max(1)),
        };
        (tx, worker)
    }

    /// Runs until every sender is dropped, then drains remaining dirty
    /// chunks and exits.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.rescan);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(rescan_secs = self.rescan.as_secs(), "flush worker started");

        loop {
            tokio::select! {
                notified = self.rx.recv() => match notified {
                    Some((cx, cy)) => self.flush_chunk(cx, cy).await,
                    None => break,
                },
                _ = tick.tick() => self.rescan_dirty().await,
            }
        }

        self.rescan_dirty().await;
        info!("flush worker stopped");
    }

    async fn rescan_dirty(&self) {
        for (cx, cy) in self.store.dirty_chunks() {
            self.flush_chunk(cx, cy).await;
        }
    }

    /// Flushes one chunk if it is dirty. On failure the chunk is re-marked
    /// dirty so a later pass retries it; in-memory state stays the source of
    /// truth throughout.
    pub async fn flush_chunk(&self, cx: u32, cy: u32) {
        let Some(snapshot) = self.store.snapshot_if_dirty(cx, cy) else {
            return;
        };

        let store = Arc::clone(&self.store);
        let publisher = Arc::clone(&self.publisher);
        let result = tokio::task::spawn_blocking(move || flush_snapshot(&store, &publisher, &snapshot))
            .await;

        match result {
            Ok(Ok(())) => debug!(cx, cy, "chunk flushed"),
            Ok(Err(e)) => {
                warn!(cx, cy, error = %e, "chunk flush failed, will retry");
                self.store.mark_dirty(cx, cy);
            },
            Err(e) => {
                warn!(cx, cy, error = %e, "chunk flush task failed, will retry");
                self.store.mark_dirty(cx, cy);
            },
        }
    }
}

fn flush_snapshot(
    store: &CanvasStore,
    publisher: &SnapshotPublisher,
    snapshot: &ChunkSnapshot,
) -> Result<(), FlushError> {
    store.persist(snapshot)?;
    publisher.publish(snapshot)?;
    Ok(())
}

/// Synchronously flushes every dirty chunk; used on shutdown after the
/// worker has stopped.
pub fn flush_all_dirty(store: &CanvasStore, publisher: &SnapshotPublisher) {
    for (cx, cy) in store.dirty_chunks() {
        let Some(snapshot) = store.snapshot_if_dirty(cx, cy) else {
            continue;
        };
        if let Err(e) = flush_snapshot(store, publisher, &snapshot) {
            warn!(cx, cy, error = %e, "final chunk flush failed");
            store.mark_dirty(cx, cy);
        }
    }
}

/// Periodically deletes superseded chunk images. Runs forever; spawn it.
pub async fn sweep_loop(publisher: Arc<SnapshotPublisher>, config: FlushConfig) {
    let mut tick = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_age = Duration::from_secs(config.sweep_max_age_secs);
    loop {
        tick.tick().await;
        let publisher = Arc::clone(&publisher);
        let swept =
            tokio::task::spawn_blocking(move || publisher.sweep(max_age)).await;
        match swept {
            Ok(Ok(0)) => {},
            Ok(Ok(removed)) => debug!(removed, "swept stale chunk images"),
            Ok(Err(e)) => warn!(error = %e, "image sweep failed"),
            Err(e) => warn!(error = %e, "image sweep task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use mosaic_core::palette::Palette;
    use uuid::Uuid;

    use super::*;

    fn fixture(dir: &std::path::Path) -> (Arc<CanvasStore>, Arc<SnapshotPublisher>) {
        let store = Arc::new(
            CanvasStore::load(256, 256, 128, 32, &dir.join("data"), 1000).unwrap(),
        );
        let publisher = Arc::new(
            SnapshotPublisher::new(
                &dir.join("pngs"),
                Palette::default(),
                128,
                store.cols(),
                store.rows(),
                1000,
            )
            .unwrap(),
        );
        (store, publisher)
    }

    #[tokio::test]
    async fn flush_persists_and_publishes_dirty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (store, publisher) = fixture(dir.path());
        let (_tx, worker) = FlushWorker::new(
            Arc::clone(&store),
            Arc::clone(&publisher),
            &FlushConfig::default(),
        );

        store.set(10, 10, 5, Uuid::new_v4(), 2000).unwrap();
        worker.flush_chunk(0, 0).await;

        assert!(dir.path().join("data/c_0_0.bin").exists());
        assert!(dir.path().join("pngs/c_2000_0-0.png").exists());
        assert_eq!(publisher.manifest()[0], "c_2000_0-0.png");
        assert!(store.dirty_chunks().is_empty());
    }

    #[tokio::test]
    async fn flush_skips_clean_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (store, publisher) = fixture(dir.path());
        let (_tx, worker) = FlushWorker::new(
            Arc::clone(&store),
            Arc::clone(&publisher),
            &FlushConfig::default(),
        );

        worker.flush_chunk(0, 0).await;
        assert!(!dir.path().join("data/c_0_0.bin").exists());
    }

    #[test]
    fn shutdown_flush_drains_every_dirty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (store, publisher) = fixture(dir.path());

        store.set(0, 0, 1, Uuid::new_v4(), 2000).unwrap();
        store.set(200, 200, 2, Uuid::new_v4(), 2000).unwrap();
        flush_all_dirty(&store, &publisher);

        assert!(dir.path().join("data/c_0_0.bin").exists());
        assert!(dir.path().join("data/c_1_1.bin").exists());
        assert!(store.dirty_chunks().is_empty());
    }
}
