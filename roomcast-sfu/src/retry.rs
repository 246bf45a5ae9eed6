//! Deferred sync retries
//!
//! Rooms that exhaust their immediate sync attempts hand their id to a single
//! scheduler task, which re-runs the room's sync once the retry delay has
//! passed. Requests for a room already waiting are coalesced, and rooms that
//! were reclaimed in the meantime are skipped.

use crate::directory::RoomDirectory;
use crate::types::RoomId;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use tracing::{debug, info};

/// Cheap handle for requesting a deferred retry
#[derive(Clone)]
pub struct RetryHandle {
    tx: mpsc::UnboundedSender<RoomId>,
    requested: Arc<AtomicU64>,
}

impl RetryHandle {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RoomId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            tx,
            requested: Arc::new(AtomicU64::new(0)),
        };
        (handle, rx)
    }

    pub fn schedule(&self, room_id: RoomId) {
        self.requested.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(room_id).is_err() {
            debug!("Retry scheduler is gone");
        }
    }

    /// Deferred retries requested so far.
    #[must_use]
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }
}

pub struct RetryScheduler;

impl RetryScheduler {
    /// Start the scheduler task for `directory`.
    pub fn spawn(directory: Weak<RoomDirectory>, delay: Duration) -> RetryHandle {
        let (handle, rx) = RetryHandle::channel();
        tokio::spawn(run(directory, rx, delay));
        handle
    }
}

async fn run(directory: Weak<RoomDirectory>, mut rx: mpsc::UnboundedReceiver<RoomId>, delay: Duration) {
    let mut queue: DelayQueue<RoomId> = DelayQueue::new();
    let mut pending: HashSet<RoomId> = HashSet::new();

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(room_id) = request else {
                    break;
                };
                if pending.insert(room_id.clone()) {
                    queue.insert(room_id, delay);
                }
            }
            Some(expired) = queue.next() => {
                let room_id = expired.into_inner();
                pending.remove(&room_id);

                let Some(directory) = directory.upgrade() else {
                    break;
                };
                match directory.get(&room_id) {
                    Some(room) => {
                        info!(room_id = %room_id, "Running deferred sync");
                        tokio::spawn(async move {
                            room.sync().await;
                        });
                    }
                    None => debug!(room_id = %room_id, "Deferred sync skipped, room is gone"),
                }
            }
        }
    }
    debug!("Retry scheduler stopped");
}
