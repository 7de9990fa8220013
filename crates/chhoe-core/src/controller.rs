//! Top-level search orchestration.
//!
//! `SearchController` is the façade between the UI layer and the worker
//! pool. All mutable orchestration state (validity ledger, loaded map,
//! current query) lives on one actor task, so ledger reads and writes are
//! linearized and `acquire_retry` cannot race. Workers communicate back only
//! through reply envelopes; outward effects go through the broadcast
//! `EventBus`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};

use chhoe_observability::{emit_event, redact_text, short_hash, ObservabilityEvent, ProcessKind};
use chhoe_types::{DatasetId, SearchEvent, SearchId, WorkerReply};

use crate::config::SearchConfig;
use crate::event_bus::EventBus;
use crate::pool::WorkerPool;
use crate::searcher::{DatasetProvider, Searcher};
use crate::validity::SearchValidity;

enum ControllerCommand {
    Query(String),
    Shutdown,
}

pub struct SearchController {
    ctrl_tx: mpsc::UnboundedSender<ControllerCommand>,
    event_bus: EventBus,
    join: JoinHandle<()>,
}

impl SearchController {
    /// Spawn workers for every configured dataset and start the controller
    /// actor. `initial_query` pre-seeds the live query under the reserved
    /// initial generation, so datasets search it as soon as they load even
    /// though no query was explicitly submitted yet.
    ///
    /// The returned receiver is subscribed before any worker spawns, so it
    /// cannot miss load events that land during startup.
    pub fn start(
        config: SearchConfig,
        provider: Arc<dyn DatasetProvider>,
        searcher: Arc<dyn Searcher>,
        initial_query: Option<String>,
    ) -> (Self, broadcast::Receiver<SearchEvent>) {
        let event_bus = EventBus::new();
        let events = event_bus.subscribe();
        let (pool, reply_rx) = WorkerPool::start_all(&config.datasets, provider, searcher);
        let state = ControllerState::new(&config, pool, event_bus.clone(), initial_query);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(run(state, ctrl_rx, reply_rx));
        (
            Self {
                ctrl_tx,
                event_bus,
                join,
            },
            events,
        )
    }

    pub fn submit_query(&self, text: &str) {
        let _ = self.ctrl_tx.send(ControllerCommand::Query(text.to_string()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SearchEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub async fn shutdown(self) {
        let _ = self.ctrl_tx.send(ControllerCommand::Shutdown);
        let _ = self.join.await;
    }
}

async fn run(
    mut state: ControllerState,
    mut ctrl_rx: mpsc::UnboundedReceiver<ControllerCommand>,
    mut reply_rx: mpsc::UnboundedReceiver<WorkerReply>,
) {
    loop {
        tokio::select! {
            cmd = ctrl_rx.recv() => match cmd {
                Some(ControllerCommand::Query(text)) => state.handle_query(&text),
                Some(ControllerCommand::Shutdown) | None => break,
            },
            reply = reply_rx.recv() => match reply {
                Some(reply) => state.handle_reply(reply),
                None => break,
            },
        }
    }
    state.pool.stop_all();
}

struct ControllerState {
    pool: WorkerPool,
    validity: SearchValidity,
    event_bus: EventBus,
    loaded: HashMap<DatasetId, bool>,
    current_query: Option<String>,
    all_loaded_announced: bool,
    retry_budget: u32,
    retry_on_late_load: bool,
}

impl ControllerState {
    fn new(
        config: &SearchConfig,
        pool: WorkerPool,
        event_bus: EventBus,
        initial_query: Option<String>,
    ) -> Self {
        let loaded = pool
            .active_dataset_ids()
            .into_iter()
            .map(|id| (id, false))
            .collect();
        Self {
            pool,
            validity: SearchValidity::new(config.retry_budget),
            event_bus,
            loaded,
            current_query: initial_query.filter(|q| !q.is_empty()),
            all_loaded_announced: false,
            retry_budget: config.retry_budget,
            retry_on_late_load: config.retry_on_late_load,
        }
    }

    fn handle_query(&mut self, text: &str) {
        if text.is_empty() {
            // No live query: everything outstanding becomes stale right now.
            self.validity.invalidate();
            self.pool.cancel_all();
            self.current_query = None;
            self.event_bus.publish(SearchEvent::ResultsCleared);
            debug!("empty query; cleared results and cancelled searches");
            return;
        }

        self.current_query = Some(text.to_string());
        let active = self.pool.active_dataset_ids();
        let search_id = self.validity.start_search(&active);
        self.pool.search_all(text, search_id);
        debug!(search_id = search_id.0, query = %redact_text(text), "query fanned out");

        let query_hash = short_hash(text);
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "search.fanout",
                component: "controller",
                dataset_id: None,
                search_id: Some(search_id.0),
                query_hash: Some(&query_hash),
                status: Some("start"),
                error_code: None,
                detail: None,
            },
        );
    }

    fn handle_reply(&mut self, reply: WorkerReply) {
        if !self.loaded.contains_key(reply.dataset_id()) {
            warn!(dataset_id = reply.dataset_id(), "envelope from unknown dataset; dropping");
            return;
        }
        match reply {
            WorkerReply::Canceled {
                dataset_id,
                search_id,
                ..
            } => {
                debug!(dataset_id = %dataset_id, search_id = search_id.0, "search cancelled");
            }
            WorkerReply::SearchSuccess {
                dataset_id,
                query,
                search_id,
                results,
            } => {
                if self.validity.is_invalidated(search_id) {
                    debug!(
                        dataset_id = %dataset_id,
                        search_id = search_id.0,
                        "dropping results for superseded generation"
                    );
                    self.validity.mark_completed(&dataset_id, search_id);
                    return;
                }
                self.event_bus.publish(SearchEvent::ResultsAppended {
                    dataset_id: dataset_id.clone(),
                    query,
                    hits: results,
                });
                self.validity.mark_completed(&dataset_id, search_id);
                if self.validity.generation_complete(search_id) {
                    debug!(search_id = search_id.0, "every dataset answered");
                }
            }
            WorkerReply::SearchFailure {
                dataset_id,
                query,
                search_id,
                failure,
            } => self.handle_failure(dataset_id, query, search_id, failure),
            WorkerReply::DatasetLoaded { dataset_id } => self.handle_loaded(dataset_id),
        }
    }

    fn handle_failure(
        &mut self,
        dataset_id: DatasetId,
        query: String,
        search_id: SearchId,
        failure: String,
    ) {
        if self.validity.is_invalidated(search_id) {
            debug!(
                dataset_id = %dataset_id,
                search_id = search_id.0,
                "dropping failure for superseded generation"
            );
            self.validity.mark_completed(&dataset_id, search_id);
            return;
        }
        if self.validity.acquire_retry(&dataset_id, search_id) {
            warn!(
                dataset_id = %dataset_id,
                search_id = search_id.0,
                failure = %failure,
                "search failed; retrying"
            );
            self.pool.search_one(&dataset_id, &query, search_id);
            return;
        }

        error!(
            dataset_id = %dataset_id,
            search_id = search_id.0,
            failure = %failure,
            "search failed; retries exhausted"
        );
        let query_hash = short_hash(&query);
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "search.retries_exhausted",
                component: "controller",
                dataset_id: Some(&dataset_id),
                search_id: Some(search_id.0),
                query_hash: Some(&query_hash),
                status: Some("failed"),
                error_code: Some("RETRIES_EXHAUSTED"),
                detail: Some(&failure),
            },
        );
        self.validity.mark_completed(&dataset_id, search_id);
        self.event_bus
            .publish(SearchEvent::RetriesExhausted { dataset_id, query });
    }

    fn handle_loaded(&mut self, dataset_id: DatasetId) {
        self.loaded.insert(dataset_id.clone(), true);
        self.pool.mark_loaded(&dataset_id);
        self.event_bus.publish(SearchEvent::DatasetLoaded {
            dataset_id: dataset_id.clone(),
        });

        // Close the race where the user typed before this dataset finished
        // loading: re-issue the live query to the newly ready worker. The
        // live generation is the current one, or the reserved initial
        // generation when the query was pre-seeded before any submission.
        if let Some(query) = self.current_query.clone() {
            let search_id = self.validity.current_search_id();
            // A query pre-seeded before any submission was never fanned out,
            // so this is its first issue and carries the full budget. For a
            // submitted query the fan-out already seeded the entry and
            // `register_single` keeps it.
            let first_issue = search_id == self.validity.initial_search_id();
            let budget = if first_issue || self.retry_on_late_load {
                self.retry_budget
            } else {
                0
            };
            self.validity.register_single(&dataset_id, search_id, budget);
            self.pool.search_one(&dataset_id, &query, search_id);
        }

        if !self.all_loaded_announced && self.loaded.values().all(|ready| *ready) {
            self.all_loaded_announced = true;
            info!("all datasets loaded");
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "datasets.all_loaded",
                    component: "controller",
                    dataset_id: None,
                    search_id: None,
                    query_hash: None,
                    status: Some("ok"),
                    error_code: None,
                    detail: None,
                },
            );
            self.event_bus.publish(SearchEvent::AllDatasetsLoaded);
        }
    }
}
