//! Background fuel map persistence
//!
//! The control cycle hands snapshots of dirty maps to a bounded queue and
//! never touches the disk itself. A worker task saves them on the blocking
//! pool and reports failures back so the cycle can mark the map dirty again
//! and retry on the next cadence.
//!
//! [`PersistHandle::close`] stops the worker from writing anything further
//! and waits for an in-flight save, after which the shutdown path can write
//! the final copies without racing an older snapshot.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::fuel_map::{FuelMap, FuelMapStore, PersistenceError, Profile};

/// Default queue depth; one slot per (profile, cylinder) is plenty
pub const PERSIST_QUEUE_DEPTH: usize = 16;

/// Snapshot of one map to be written
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub profile: Profile,
    pub cylinder: u8,
    pub map: FuelMap,
}

/// A save that did not make it to disk
#[derive(Debug)]
pub struct PersistFailure {
    pub profile: Profile,
    pub cylinder: u8,
    pub error: PersistenceError,
}

/// Create a connected handle/worker pair writing through `store`
pub fn persistence(store: FuelMapStore, depth: usize) -> (PersistHandle, PersistWorker) {
    let (job_tx, job_rx) = mpsc::channel(depth.max(1));
    let (fail_tx, fail_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(Mutex::new(false));

    let handle = PersistHandle {
        jobs: job_tx,
        failures: fail_rx,
        closed: closed.clone(),
    };
    let worker = PersistWorker {
        store,
        jobs: job_rx,
        failures: fail_tx,
        closed,
    };
    (handle, worker)
}

/// Control-loop side of the persistence queue
#[derive(Debug)]
pub struct PersistHandle {
    jobs: mpsc::Sender<PersistJob>,
    failures: mpsc::UnboundedReceiver<PersistFailure>,
    closed: Arc<Mutex<bool>>,
}

impl PersistHandle {
    /// Queue a snapshot without waiting; the job is handed back if the queue
    /// is full or the worker has stopped
    pub fn submit(&self, job: PersistJob) -> Result<(), PersistJob> {
        self.jobs.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        })
    }

    /// Failures reported since the last call
    pub fn take_failures(&mut self) -> Vec<PersistFailure> {
        let mut failures = Vec::new();
        while let Ok(failure) = self.failures.try_recv() {
            failures.push(failure);
        }
        failures
    }

    /// Block further writes by the worker, waiting for one in progress
    pub fn close(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        *closed = true;
    }
}

/// Disk side of the persistence queue
pub struct PersistWorker {
    store: FuelMapStore,
    jobs: mpsc::Receiver<PersistJob>,
    failures: mpsc::UnboundedSender<PersistFailure>,
    closed: Arc<Mutex<bool>>,
}

impl PersistWorker {
    /// Save queued jobs until cancelled or the handle is dropped
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::debug!(dir = %self.store.dir().display(), "persistence worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => self.persist(job).await,
                    None => break,
                },
            }
        }
        tracing::debug!("persistence worker stopped");
    }

    async fn persist(&self, job: PersistJob) {
        let store = self.store.clone();
        let closed = self.closed.clone();
        let profile = job.profile;
        let cylinder = job.cylinder;

        let result = tokio::task::spawn_blocking(move || {
            let closed = closed.lock().unwrap_or_else(|e| e.into_inner());
            if *closed {
                return Ok(false);
            }
            store.save(&job.map, job.profile, job.cylinder).map(|()| true)
        })
        .await;

        let error = match result {
            Ok(Ok(_)) => return,
            Ok(Err(error)) => error,
            Err(join) => PersistenceError::Io {
                path: self.store.path_for(profile, cylinder),
                source: std::io::Error::other(join.to_string()),
            },
        };

        tracing::warn!(profile = %profile, cylinder, "fuel map save failed: {error}");
        let _ = self.failures.send(PersistFailure {
            profile,
            cylinder,
            error,
        });
    }
}
