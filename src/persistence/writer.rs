//! The single writer.
//!
//! `sled` is used here under a single-writer discipline: every mutation of a
//! store runs on one dedicated thread, one unit of work at a time, in the
//! order the units were submitted. Callers wait on a oneshot for their own
//! result, never on each other. Reads go straight to the trees and never pass
//! through this thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use sled::Db;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::utils::{QueueError, Result};

/// A unit of work as the writer thread sees it. Replying to the submitter is
/// the job's own responsibility.
pub(crate) type Job = Box<dyn FnOnce(&Db) + Send + 'static>;

pub(crate) struct Writer {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Writer {
    /// Spawn the writer thread for `db` with room for `capacity` queued units.
    pub(crate) fn spawn(db: Db, capacity: usize) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));

        let handle = thread::Builder::new()
            .name("relayq-writer".to_string())
            .spawn(move || {
                info!("writer started");
                while let Some(job) = rx.blocking_recv() {
                    // A job that panics outside its own guard must not take
                    // the remaining queue down with it.
                    if panic::catch_unwind(AssertUnwindSafe(|| job(&db))).is_err() {
                        error!("writer job panicked");
                    }
                }
                info!("writer stopped");
            })
            .map_err(|e| QueueError::Storage(format!("failed to spawn writer: {e}")))?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(QueueError::WriterClosed)
    }

    /// Queue a job, waiting for room if the queue is full.
    pub(crate) async fn submit(&self, job: Job) -> Result<()> {
        self.sender()?
            .send(job)
            .await
            .map_err(|_| QueueError::WriterClosed)
    }

    /// Blocking variant of [`Writer::submit`]. Must not be called from an
    /// async context.
    pub(crate) fn submit_blocking(&self, job: Job) -> Result<()> {
        self.sender()?
            .blocking_send(job)
            .map_err(|_| QueueError::WriterClosed)
    }

    /// Stop accepting work, let queued units finish and join the thread.
    pub(crate) fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // The last store handle can be dropped by a job running on the
            // writer itself; joining there would never return.
            if handle.thread().id() == thread::current().id() {
                debug!("writer released from its own thread, detaching");
                return;
            }
            if handle.join().is_err() {
                error!("writer thread panicked");
            }
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
