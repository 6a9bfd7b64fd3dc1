//! Io worker
//!
//! Every device exchange runs on one dedicated thread. Public operations
//! are dispatched here as jobs through a bounded queue; the poll loop only
//! submits a tick when the queue is empty, so slow foreground work (a long
//! upload, a stuck retry loop) starves polling instead of piling tick upon
//! tick.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tracing::{debug, warn};

use crate::protocol::ProtocolError;

type Job = Box<dyn FnOnce() + Send>;

/// Capacity of the job queue
const QUEUE_CAPACITY: usize = 16;

/// Single-thread job executor for device io
pub(crate) struct IoWorker {
    tx: Option<SyncSender<Job>>,
    queued: Arc<AtomicUsize>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl IoWorker {
    /// Spawn the worker thread
    pub fn spawn(name: &str) -> io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Job>(QUEUE_CAPACITY);
        let queued = Arc::new(AtomicUsize::new(0));
        let queued_in_worker = queued.clone();
        let (id_tx, id_rx) = mpsc::channel();

        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let _ = id_tx.send(thread::current().id());
            for job in rx {
                queued_in_worker.fetch_sub(1, Ordering::SeqCst);
                job();
            }
            debug!("Io worker stopped");
        })?;

        let thread_id = id_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "io worker died during startup"))?;

        Ok(Self {
            tx: Some(tx),
            queued,
            thread_id,
            handle: Some(handle),
        })
    }

    /// Whether no job is waiting in the queue (a running job doesn't count)
    pub fn queue_is_empty(&self) -> bool {
        self.queued.load(Ordering::SeqCst) == 0
    }

    /// Thread id of the worker, for execution assertions
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Submit a job without waiting for it; the job is dropped when the
    /// queue is full or the worker is gone
    pub fn try_submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(tx) = &self.tx else { return false };
        self.queued.fetch_add(1, Ordering::SeqCst);
        if tx.try_send(Box::new(job)).is_ok() {
            true
        } else {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    /// Run `job` on the worker and wait for its result, optionally bounded.
    ///
    /// When already on the worker thread the job runs inline, so nested
    /// operations cannot deadlock the single thread. A bounded wait that
    /// elapses leaves the job queued; its result is discarded.
    pub fn call<T, F>(&self, job: F, wait: Option<Duration>) -> Result<T, ProtocolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if thread::current().id() == self.thread_id {
            return Ok(job());
        }
        let Some(tx) = &self.tx else {
            return Err(ProtocolError::WorkerGone);
        };

        let (result_tx, result_rx) = mpsc::sync_channel(1);
        self.queued.fetch_add(1, Ordering::SeqCst);
        let wrapped: Job = Box::new(move || {
            let _ = result_tx.send(job());
        });
        if tx.send(wrapped).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(ProtocolError::WorkerGone);
        }

        match wait {
            None => result_rx.recv().map_err(|_| ProtocolError::WorkerGone),
            Some(bound) => result_rx.recv_timeout(bound).map_err(|e| match e {
                RecvTimeoutError::Timeout => ProtocolError::Timeout,
                RecvTimeoutError::Disconnected => ProtocolError::WorkerGone,
            }),
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit
        self.tx = None;
        // A job can end up dropping the last owner of this worker on the
        // worker thread itself; joining would self-deadlock, so leave the
        // handle detached and let the loop run out on its own
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Io worker panicked");
            }
        }
    }
}
