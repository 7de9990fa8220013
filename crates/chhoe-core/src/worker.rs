//! Per-dataset search worker.
//!
//! Each worker is one tokio task owning a four-state lifecycle:
//! `Uninitialized -> Loading -> Ready <-> Searching`. The states are a sum
//! type so that illegal combinations (searching an unloaded dataset, two
//! concurrent operations on one worker) are unrepresentable. A worker emits
//! exactly one reply per completed, non-cancelled search and at most one
//! `DatasetLoaded` per lifetime.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chhoe_types::{Dataset, DatasetDescriptor, SearchHit, SearchId, WorkerCommand, WorkerReply};

use crate::searcher::{DatasetProvider, Searcher};

enum WorkerState {
    Uninitialized,
    Loading {
        descriptor: DatasetDescriptor,
        load_started: bool,
    },
    Ready {
        dataset: Arc<Dataset>,
    },
    Searching {
        dataset: Arc<Dataset>,
        op: ActiveSearch,
    },
}

impl WorkerState {
    fn name(&self) -> &'static str {
        match self {
            WorkerState::Uninitialized => "uninitialized",
            WorkerState::Loading { .. } => "loading",
            WorkerState::Ready { .. } => "ready",
            WorkerState::Searching { .. } => "searching",
        }
    }
}

/// Handle to the one in-flight search operation. Cancelling the token is the
/// only way the operation's result is suppressed; the underlying future may
/// keep running invisibly but its settlement will no longer match `op_id`.
struct ActiveSearch {
    op_id: Uuid,
    query: String,
    search_id: SearchId,
    cancel: CancellationToken,
}

enum InternalEvent {
    LoadFinished {
        descriptor: DatasetDescriptor,
        result: anyhow::Result<Dataset>,
    },
    SearchSettled {
        op_id: Uuid,
        query: String,
        search_id: SearchId,
        /// None means the operation observed cancellation before settling.
        outcome: Option<Result<Vec<SearchHit>, String>>,
    },
}

pub(crate) fn spawn_worker(
    provider: Arc<dyn DatasetProvider>,
    searcher: Arc<dyn Searcher>,
    reply_tx: mpsc::UnboundedSender<WorkerReply>,
) -> (mpsc::UnboundedSender<WorkerCommand>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let join = tokio::spawn(async move {
        SearchWorker::new(provider, searcher, reply_tx).run(cmd_rx).await;
    });
    (cmd_tx, join)
}

struct SearchWorker {
    state: WorkerState,
    provider: Arc<dyn DatasetProvider>,
    searcher: Arc<dyn Searcher>,
    reply_tx: mpsc::UnboundedSender<WorkerReply>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
}

impl SearchWorker {
    fn new(
        provider: Arc<dyn DatasetProvider>,
        searcher: Arc<dyn Searcher>,
        reply_tx: mpsc::UnboundedSender<WorkerReply>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            state: WorkerState::Uninitialized,
            provider,
            searcher,
            reply_tx,
            internal_tx,
            internal_rx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // Pool dropped our sender: tear down.
                    None => break,
                },
                Some(event) = self.internal_rx.recv() => self.handle_internal(event),
            }
        }
        if let WorkerState::Searching { op, .. } = &self.state {
            op.cancel.cancel();
        }
    }

    fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Init { descriptor } => self.bind(descriptor),
            WorkerCommand::Load => self.start_load(),
            WorkerCommand::Search { query, search_id } => self.search(query, search_id),
            WorkerCommand::Cancel => self.cancel(),
        }
    }

    fn bind(&mut self, descriptor: DatasetDescriptor) {
        match self.state {
            WorkerState::Uninitialized => {
                debug!(dataset_id = %descriptor.id, "worker bound");
                self.state = WorkerState::Loading {
                    descriptor,
                    load_started: false,
                };
            }
            _ => {
                // Sequencing error upstream; never fatal.
                error!(
                    dataset_id = %descriptor.id,
                    state = self.state.name(),
                    "init requested on an already initialized worker"
                );
            }
        }
    }

    fn start_load(&mut self) {
        match &mut self.state {
            WorkerState::Loading {
                descriptor,
                load_started,
            } => {
                if *load_started {
                    warn!(dataset_id = %descriptor.id, "load already in progress");
                    return;
                }
                *load_started = true;
                let descriptor = descriptor.clone();
                let provider = self.provider.clone();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = provider.load(&descriptor).await;
                    let _ = internal.send(InternalEvent::LoadFinished { descriptor, result });
                });
            }
            WorkerState::Uninitialized => {
                error!("load requested before worker initialization");
            }
            WorkerState::Ready { .. } | WorkerState::Searching { .. } => {
                warn!(state = self.state.name(), "load requested but dataset already loaded");
            }
        }
    }

    fn search(&mut self, query: String, search_id: SearchId) {
        match &self.state {
            WorkerState::Uninitialized => {
                error!(search_id = search_id.0, "search requested before initialization");
            }
            WorkerState::Loading { descriptor, .. } => {
                // The controller re-issues this search once the load lands.
                warn!(
                    dataset_id = %descriptor.id,
                    search_id = search_id.0,
                    "search requested before dataset finished loading"
                );
            }
            WorkerState::Ready { dataset } => {
                let dataset = dataset.clone();
                self.start_search(dataset, query, search_id);
            }
            WorkerState::Searching { .. } => {
                self.cancel();
                self.search(query, search_id);
            }
        }
    }

    fn start_search(&mut self, dataset: Arc<Dataset>, query: String, search_id: SearchId) {
        let op = ActiveSearch {
            op_id: Uuid::new_v4(),
            query: query.clone(),
            search_id,
            cancel: CancellationToken::new(),
        };
        let op_id = op.op_id;
        let cancel = op.cancel.clone();
        let searcher = self.searcher.clone();
        let internal = self.internal_tx.clone();
        let op_dataset = dataset.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = searcher.search(&op_dataset, &query) => Some(result),
            };
            let _ = internal.send(InternalEvent::SearchSettled {
                op_id,
                query,
                search_id,
                outcome,
            });
        });
        self.state = WorkerState::Searching { dataset, op };
    }

    /// Stop the active operation without emitting a result envelope. The
    /// state rolls back to `Ready` synchronously; a `Canceled` notice is the
    /// only trace the operation leaves.
    fn cancel(&mut self) {
        match std::mem::replace(&mut self.state, WorkerState::Uninitialized) {
            WorkerState::Searching { dataset, op } => {
                op.cancel.cancel();
                self.send_reply(WorkerReply::Canceled {
                    dataset_id: dataset.id.clone(),
                    query: op.query,
                    search_id: op.search_id,
                });
                self.state = WorkerState::Ready { dataset };
            }
            other => {
                debug!(state = other.name(), "cancel requested with no active search");
                self.state = other;
            }
        }
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::LoadFinished { descriptor, result } => {
                self.load_finished(descriptor, result)
            }
            InternalEvent::SearchSettled {
                op_id,
                query,
                search_id,
                outcome,
            } => self.search_settled(op_id, query, search_id, outcome),
        }
    }

    fn load_finished(&mut self, descriptor: DatasetDescriptor, result: anyhow::Result<Dataset>) {
        if !matches!(self.state, WorkerState::Loading { .. }) {
            debug!(dataset_id = %descriptor.id, state = self.state.name(), "stale load completion");
            return;
        }
        match result {
            Ok(dataset) => {
                let dataset_id = dataset.id.clone();
                info!(dataset_id = %dataset_id, entries = dataset.entries.len(), "dataset loaded");
                self.state = WorkerState::Ready {
                    dataset: Arc::new(dataset),
                };
                self.send_reply(WorkerReply::DatasetLoaded { dataset_id });
            }
            Err(err) => {
                // Stay bound so a later LOAD can retry; worst case this
                // dataset never answers, which is a tolerated failure mode.
                error!(dataset_id = %descriptor.id, error = %err, "dataset load failed");
                self.state = WorkerState::Loading {
                    descriptor,
                    load_started: false,
                };
            }
        }
    }

    fn search_settled(
        &mut self,
        op_id: Uuid,
        query: String,
        search_id: SearchId,
        outcome: Option<Result<Vec<SearchHit>, String>>,
    ) {
        let matches_active = matches!(
            &self.state,
            WorkerState::Searching { op, .. } if op.op_id == op_id
        );
        if !matches_active {
            // A cancelled or superseded operation settles without effect.
            debug!(search_id = search_id.0, "discarding settlement of inactive operation");
            return;
        }

        let WorkerState::Searching { dataset, .. } = std::mem::replace(
            &mut self.state,
            WorkerState::Uninitialized,
        ) else {
            unreachable!("state checked above");
        };
        let dataset_id = dataset.id.clone();
        self.state = WorkerState::Ready { dataset };

        match outcome {
            Some(Ok(results)) => {
                self.send_reply(WorkerReply::SearchSuccess {
                    dataset_id,
                    query,
                    search_id,
                    results,
                });
            }
            Some(Err(failure)) => {
                self.send_reply(WorkerReply::SearchFailure {
                    dataset_id,
                    query,
                    search_id,
                    failure,
                });
            }
            None => {
                // Token fired before the cancel command reached us; the
                // Canceled notice goes out when that command lands.
                debug!(dataset_id = %dataset_id, search_id = search_id.0, "operation observed cancellation");
            }
        }
    }

    fn send_reply(&self, reply: WorkerReply) {
        if self.reply_tx.send(reply).is_err() {
            debug!("reply channel closed; controller gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use chhoe_types::DictionaryEntry;

    struct InstantProvider;

    #[async_trait::async_trait]
    impl DatasetProvider for InstantProvider {
        async fn load(&self, descriptor: &DatasetDescriptor) -> anyhow::Result<Dataset> {
            Ok(Dataset {
                id: descriptor.id.clone(),
                entries: vec![DictionaryEntry {
                    head: "cat".into(),
                    definition: "niau".into(),
                    tags: vec![],
                }],
            })
        }
    }

    struct FailingProvider;

    #[async_trait::async_trait]
    impl DatasetProvider for FailingProvider {
        async fn load(&self, _descriptor: &DatasetDescriptor) -> anyhow::Result<Dataset> {
            anyhow::bail!("disk on fire")
        }
    }

    /// Searcher that blocks per-query until the matching gate is released.
    /// Queries without a gate resolve immediately.
    #[derive(Default)]
    struct GatedSearcher {
        gates: HashMap<String, Arc<Notify>>,
    }

    impl GatedSearcher {
        fn gate(&mut self, query: &str) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            self.gates.insert(query.to_string(), gate.clone());
            gate
        }
    }

    #[async_trait::async_trait]
    impl Searcher for GatedSearcher {
        async fn search(&self, _dataset: &Dataset, query: &str) -> Result<Vec<SearchHit>, String> {
            if let Some(gate) = self.gates.get(query) {
                gate.notified().await;
            }
            Ok(vec![SearchHit {
                head: query.to_string(),
                definition: "hit".into(),
                score: 1,
            }])
        }
    }

    fn descriptor(id: &str) -> DatasetDescriptor {
        DatasetDescriptor {
            id: id.into(),
            name: id.into(),
            source: String::new(),
        }
    }

    async fn recv(
        rx: &mut mpsc::UnboundedReceiver<WorkerReply>,
    ) -> WorkerReply {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("reply before timeout")
            .expect("reply channel open")
    }

    fn start(
        provider: Arc<dyn DatasetProvider>,
        searcher: Arc<dyn Searcher>,
    ) -> (
        mpsc::UnboundedSender<WorkerCommand>,
        mpsc::UnboundedReceiver<WorkerReply>,
        JoinHandle<()>,
    ) {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (cmd_tx, join) = spawn_worker(provider, searcher, reply_tx);
        (cmd_tx, reply_rx, join)
    }

    #[tokio::test]
    async fn load_emits_dataset_loaded_once() {
        let (cmd_tx, mut reply_rx, _join) =
            start(Arc::new(InstantProvider), Arc::new(GatedSearcher::default()));
        cmd_tx
            .send(WorkerCommand::Init {
                descriptor: descriptor("mk"),
            })
            .unwrap();
        cmd_tx.send(WorkerCommand::Load).unwrap();
        assert_eq!(
            recv(&mut reply_rx).await,
            WorkerReply::DatasetLoaded {
                dataset_id: "mk".into()
            }
        );
        // A second LOAD is a logged no-op; no second event may arrive.
        cmd_tx.send(WorkerCommand::Load).unwrap();
        cmd_tx
            .send(WorkerCommand::Search {
                query: "cat".into(),
                search_id: SearchId(1),
            })
            .unwrap();
        match recv(&mut reply_rx).await {
            WorkerReply::SearchSuccess { query, .. } => assert_eq!(query, "cat"),
            other => panic!("expected search success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn search_before_init_and_before_load_are_noops() {
        let (cmd_tx, mut reply_rx, _join) =
            start(Arc::new(InstantProvider), Arc::new(GatedSearcher::default()));
        cmd_tx
            .send(WorkerCommand::Search {
                query: "early".into(),
                search_id: SearchId(1),
            })
            .unwrap();
        cmd_tx
            .send(WorkerCommand::Init {
                descriptor: descriptor("mk"),
            })
            .unwrap();
        cmd_tx
            .send(WorkerCommand::Search {
                query: "early".into(),
                search_id: SearchId(1),
            })
            .unwrap();
        cmd_tx.send(WorkerCommand::Load).unwrap();

        // The only reply is the load event; both early searches were dropped.
        assert_eq!(
            recv(&mut reply_rx).await,
            WorkerReply::DatasetLoaded {
                dataset_id: "mk".into()
            }
        );
        assert!(reply_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn search_while_searching_cancels_prior_operation() {
        let mut searcher = GatedSearcher::default();
        let _first_gate = searcher.gate("first"); // never released
        let (cmd_tx, mut reply_rx, _join) = start(Arc::new(InstantProvider), Arc::new(searcher));
        cmd_tx
            .send(WorkerCommand::Init {
                descriptor: descriptor("mk"),
            })
            .unwrap();
        cmd_tx.send(WorkerCommand::Load).unwrap();
        assert!(matches!(
            recv(&mut reply_rx).await,
            WorkerReply::DatasetLoaded { .. }
        ));

        cmd_tx
            .send(WorkerCommand::Search {
                query: "first".into(),
                search_id: SearchId(1),
            })
            .unwrap();
        cmd_tx
            .send(WorkerCommand::Search {
                query: "second".into(),
                search_id: SearchId(2),
            })
            .unwrap();

        assert_eq!(
            recv(&mut reply_rx).await,
            WorkerReply::Canceled {
                dataset_id: "mk".into(),
                query: "first".into(),
                search_id: SearchId(1),
            }
        );
        match recv(&mut reply_rx).await {
            WorkerReply::SearchSuccess {
                query, search_id, ..
            } => {
                assert_eq!(query, "second");
                assert_eq!(search_id, SearchId(2));
            }
            other => panic!("expected success for the new search, got {other:?}"),
        }
        // The first operation must never settle into an envelope.
        assert!(reply_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_rolls_back_to_ready() {
        let mut searcher = GatedSearcher::default();
        let _gate = searcher.gate("slow");
        let (cmd_tx, mut reply_rx, _join) = start(Arc::new(InstantProvider), Arc::new(searcher));
        cmd_tx
            .send(WorkerCommand::Init {
                descriptor: descriptor("mk"),
            })
            .unwrap();
        cmd_tx.send(WorkerCommand::Load).unwrap();
        assert!(matches!(
            recv(&mut reply_rx).await,
            WorkerReply::DatasetLoaded { .. }
        ));

        cmd_tx
            .send(WorkerCommand::Search {
                query: "slow".into(),
                search_id: SearchId(1),
            })
            .unwrap();
        cmd_tx.send(WorkerCommand::Cancel).unwrap();
        assert!(matches!(
            recv(&mut reply_rx).await,
            WorkerReply::Canceled { .. }
        ));

        // Worker is Ready again and can serve a fresh search.
        cmd_tx
            .send(WorkerCommand::Search {
                query: "fresh".into(),
                search_id: SearchId(2),
            })
            .unwrap();
        match recv(&mut reply_rx).await {
            WorkerReply::SearchSuccess { query, .. } => assert_eq!(query, "fresh"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_load_keeps_worker_bound() {
        let (cmd_tx, mut reply_rx, _join) =
            start(Arc::new(FailingProvider), Arc::new(GatedSearcher::default()));
        cmd_tx
            .send(WorkerCommand::Init {
                descriptor: descriptor("mk"),
            })
            .unwrap();
        cmd_tx.send(WorkerCommand::Load).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // No loaded event, and a search is still a warn-level no-op.
        assert!(reply_rx.try_recv().is_err());
        cmd_tx
            .send(WorkerCommand::Search {
                query: "cat".into(),
                search_id: SearchId(1),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reply_rx.try_recv().is_err());
    }
}
