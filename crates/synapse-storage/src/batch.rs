//! Pending-piece queue behind a context's batched commits
//!
//! Uploads that finished storing wait here until a flush commits them in
//! one add-pieces call. Only one flush runs per context at a time; the
//! guard is taken synchronously before any suspension point.

use crate::types::{CommitResult, PieceToAdd, UploadResult};
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// A stored piece waiting for its batch to commit
pub(crate) struct PendingPiece {
    pub piece: PieceToAdd,
    pub size: u64,
    pub completion: oneshot::Sender<Result<UploadResult>>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingPiece>,
    /// Uploads still transferring or waiting to be parked
    in_flight: usize,
}

#[derive(Default)]
pub(crate) struct BatchQueue {
    state: Mutex<QueueState>,
    flushing: AtomicBool,
}

impl BatchQueue {
    /// Register an upload that will join the queue later
    pub fn begin_upload(self: &Arc<Self>) -> InFlight {
        self.state.lock().in_flight += 1;
        InFlight {
            queue: Arc::clone(self),
            done: false,
        }
    }

    /// Take the flush guard; `false` if another flush holds it
    pub fn try_begin_flush(&self) -> bool {
        !self.flushing.swap(true, Ordering::AcqRel)
    }

    /// Release the flush guard, reporting whether work is still queued
    pub fn end_flush(&self) -> bool {
        self.flushing.store(false, Ordering::Release);
        !self.state.lock().pending.is_empty()
    }

    /// (queued, in flight)
    pub fn snapshot(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.pending.len(), state.in_flight)
    }

    /// Pop up to `max` entries in FIFO order
    pub fn take(&self, max: usize) -> Vec<PendingPiece> {
        let mut state = self.state.lock();
        let n = state.pending.len().min(max);
        state.pending.drain(..n).collect()
    }

    /// Give in-flight uploads a chance to join a partial batch
    ///
    /// Returns when nothing is in flight, the queue already fills a batch,
    /// or `max_wait` has passed.
    pub async fn wait_for_in_flight(&self, batch_size: usize, poll: Duration, max_wait: Duration) {
        let start = Instant::now();
        loop {
            let (queued, in_flight) = self.snapshot();
            if in_flight == 0 || queued >= batch_size || start.elapsed() >= max_wait {
                return;
            }
            debug!(queued, in_flight, "waiting for in-flight uploads");
            tokio::time::sleep(poll).await;
        }
    }
}

/// Counts an upload as in flight until it is queued or dropped
pub(crate) struct InFlight {
    queue: Arc<BatchQueue>,
    done: bool,
}

impl InFlight {
    /// Move the upload from in flight to queued under one lock
    pub fn enqueue(mut self, piece: PendingPiece) {
        let mut state = self.queue.state.lock();
        state.pending.push_back(piece);
        state.in_flight -= 1;
        self.done = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.done {
            self.queue.state.lock().in_flight -= 1;
        }
    }
}

/// Resolve every entry of a batch exactly once
pub(crate) fn settle(batch: Vec<PendingPiece>, outcome: Result<CommitResult>) {
    match outcome {
        Ok(commit) => {
            for (i, entry) in batch.into_iter().enumerate() {
                let result = match commit.piece_ids.get(i) {
                    Some(&piece_id) => Ok(UploadResult {
                        piece_cid: entry.piece.piece_cid,
                        size: entry.size,
                        piece_id,
                        data_set_id: commit.data_set_id,
                    }),
                    None => Err(StorageError::Unconfirmed {
                        piece_cid: entry.piece.piece_cid.to_string(),
                        data_set_id: commit.data_set_id,
                    }),
                };
                // Receiver gone means the caller stopped waiting
                let _ = entry.completion.send(result);
            }
        }
        Err(err) => {
            let pieces = batch.len();
            let source = Arc::new(err);
            for entry in batch {
                let _ = entry.completion.send(Err(StorageError::BatchFailed {
                    pieces,
                    source: Arc::clone(&source),
                }));
            }
        }
    }
}
