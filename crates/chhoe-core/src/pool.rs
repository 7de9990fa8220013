//! Owns the collection of per-dataset search workers and the fan-out plumbing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chhoe_types::{DatasetDescriptor, DatasetId, SearchId, WorkerCommand, WorkerReply};

use crate::searcher::{DatasetProvider, Searcher};
use crate::worker::spawn_worker;

struct WorkerHandle {
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
    join: JoinHandle<()>,
}

pub struct WorkerPool {
    workers: HashMap<DatasetId, WorkerHandle>,
    /// Datasets that reported a finished load. Fed by the controller; used to
    /// skip still-loading workers on fan-out.
    loaded: HashSet<DatasetId>,
    /// Kept so the reply channel outlives a pool with no workers.
    _reply_tx: mpsc::UnboundedSender<WorkerReply>,
}

impl WorkerPool {
    /// Spawn one worker per descriptor, bind it, and trigger its load. All
    /// worker replies arrive on the returned receiver.
    pub fn start_all(
        descriptors: &[DatasetDescriptor],
        provider: Arc<dyn DatasetProvider>,
        searcher: Arc<dyn Searcher>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerReply>) {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let mut workers = HashMap::new();
        for descriptor in descriptors {
            let (cmd_tx, join) =
                spawn_worker(provider.clone(), searcher.clone(), reply_tx.clone());
            let _ = cmd_tx.send(WorkerCommand::Init {
                descriptor: descriptor.clone(),
            });
            let _ = cmd_tx.send(WorkerCommand::Load);
            workers.insert(descriptor.id.clone(), WorkerHandle { cmd_tx, join });
        }
        (
            Self {
                workers,
                loaded: HashSet::new(),
                _reply_tx: reply_tx,
            },
            reply_rx,
        )
    }

    /// Fan one query out to every loaded worker. Still-loading workers are
    /// skipped; the controller re-issues to them when their load lands.
    pub fn search_all(&self, query: &str, search_id: SearchId) {
        for (dataset_id, handle) in &self.workers {
            if !self.loaded.contains(dataset_id) {
                debug!(dataset_id = %dataset_id, "skipping still-loading dataset on fan-out");
                continue;
            }
            let _ = handle.cmd_tx.send(WorkerCommand::Search {
                query: query.to_string(),
                search_id,
            });
        }
    }

    /// Targeted search used for retries and the late-load path.
    pub fn search_one(&self, dataset_id: &str, query: &str, search_id: SearchId) {
        match self.workers.get(dataset_id) {
            Some(handle) => {
                let _ = handle.cmd_tx.send(WorkerCommand::Search {
                    query: query.to_string(),
                    search_id,
                });
            }
            None => warn!(dataset_id, "search requested for unknown dataset"),
        }
    }

    pub fn cancel_all(&self) {
        for handle in self.workers.values() {
            let _ = handle.cmd_tx.send(WorkerCommand::Cancel);
        }
    }

    pub fn mark_loaded(&mut self, dataset_id: &str) {
        self.loaded.insert(dataset_id.to_string());
    }

    /// Identifiers of every bound worker, loading or not.
    pub fn active_dataset_ids(&self) -> Vec<DatasetId> {
        let mut ids: Vec<DatasetId> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tear every worker down. Idempotent.
    pub fn stop_all(&mut self) {
        for (_, handle) in self.workers.drain() {
            // Dropping the sender ends the worker loop; abort covers a worker
            // wedged inside a provider call.
            drop(handle.cmd_tx);
            handle.join.abort();
        }
        self.loaded.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_all();
    }
}
