// src/loader/workers.rs
//
// Thread pool behind `DataLoader`. Each worker owns one clone of the dataset
// and answers batch requests from its own bounded queue; results come back on
// a shared channel tagged with their batch position.

use anyhow::{anyhow, Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::dataset::{Batch, Dataset, WorkerInfo};

type Request = (usize, Vec<usize>);
type Response = (usize, Result<Batch>);

pub(crate) struct WorkerPool {
    senders: Vec<SyncSender<Request>>,
    results: Receiver<Response>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_workers` threads, each with its own copy of `dataset`.
    pub(crate) fn spawn<D>(dataset: &D, num_workers: usize, queue_depth: usize, epoch: u64) -> Result<Self>
    where
        D: Dataset + Clone + 'static,
    {
        let (result_tx, results) = mpsc::channel::<Response>();
        let mut senders = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let (tx, rx) = mpsc::sync_channel::<Request>(queue_depth.max(1));
            let info = WorkerInfo { id, num_workers, epoch };
            let worker_dataset = dataset.clone();
            let result_tx = result_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("genoload-worker-{}", id))
                .spawn(move || worker_loop(worker_dataset, info, rx, result_tx))
                .with_context(|| format!("Failed to spawn loader worker {}", id))?;
            senders.push(tx);
            handles.push(handle);
        }
        debug!("spawned {} loader workers for epoch {}", num_workers, epoch);

        Ok(Self { senders, results, handles })
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.senders.len()
    }

    /// Queue `indices` as batch `position` on worker `position % num_workers`.
    pub(crate) fn submit(&self, position: usize, indices: Vec<usize>) -> Result<()> {
        let worker = position % self.senders.len();
        self.senders[worker]
            .send((position, indices))
            .map_err(|_| anyhow!("loader worker {} is no longer running", worker))
    }

    /// Block until any worker finishes a batch.
    pub(crate) fn recv(&self) -> Result<Response> {
        self.results
            .recv()
            .map_err(|_| anyhow!("all loader workers exited unexpectedly"))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the request queues ends each worker loop.
        self.senders.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("loader worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop<D: Dataset>(mut dataset: D, info: WorkerInfo, requests: Receiver<Request>, results: mpsc::Sender<Response>) {
    // Once set, every remaining request is answered with this message so the
    // consumer never waits on a batch that will not arrive.
    let mut failed: Option<String> = match panic::catch_unwind(AssertUnwindSafe(|| dataset.worker_init(info))) {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("loader worker {} failed to initialise: {:#}", info.id, e)),
        Err(payload) => {
            let message = format!(
                "loader worker {} panicked during initialisation: {}",
                info.id,
                panic_message(&*payload)
            );
            warn!("{}", message);
            Some(message)
        }
    };

    while let Ok((position, indices)) = requests.recv() {
        let result = if let Some(message) = failed.clone() {
            Err(anyhow!(message))
        } else {
            match panic::catch_unwind(AssertUnwindSafe(|| dataset.get_batch(&indices))) {
                Ok(result) => result,
                Err(payload) => {
                    let message = format!("loader worker {} panicked: {}", info.id, panic_message(&*payload));
                    warn!("{}", message);
                    failed = Some(message.clone());
                    Err(anyhow!(message))
                }
            }
        };
        if results.send((position, result)).is_err() {
            break;
        }
    }
    debug!("loader worker {} exiting", info.id);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
