//! Generation bookkeeping for in-flight searches.
//!
//! Every submitted query gets a strictly increasing `SearchId`; an envelope
//! whose id is older than the current one is stale. The ledger also tracks
//! per-(dataset, generation) completion and the remaining retry budget. All
//! access is linearized on the controller task, which is what makes
//! `acquire_retry` race-free.

use std::collections::HashMap;

use tracing::debug;

use chhoe_types::{DatasetId, SearchId};

pub const DEFAULT_RETRY_BUDGET: u32 = 1;

pub struct SearchValidity {
    next_search_id: SearchId,
    current_search_id: SearchId,
    initial_search_id: SearchId,
    completion: HashMap<SearchId, HashMap<DatasetId, bool>>,
    retries: HashMap<SearchId, HashMap<DatasetId, u32>>,
    retry_budget: u32,
}

impl SearchValidity {
    pub fn new(retry_budget: u32) -> Self {
        Self {
            next_search_id: SearchId::INITIAL.next(),
            current_search_id: SearchId::INITIAL,
            initial_search_id: SearchId::INITIAL,
            completion: HashMap::new(),
            retries: HashMap::new(),
            retry_budget,
        }
    }

    pub fn current_search_id(&self) -> SearchId {
        self.current_search_id
    }

    /// The reserved generation used for automatic searches issued when a
    /// dataset finishes loading before any query was explicitly submitted.
    pub fn initial_search_id(&self) -> SearchId {
        self.initial_search_id
    }

    /// Allocate the generation for a newly submitted query and seed
    /// completion/retry entries for every dataset that will be fanned out to.
    /// Must be called before the fan-out itself.
    pub fn start_search(&mut self, dataset_ids: &[DatasetId]) -> SearchId {
        let id = self.next_search_id;
        self.next_search_id = id.next();
        self.current_search_id = id;

        let completion = self.completion.entry(id).or_default();
        let retries = self.retries.entry(id).or_default();
        for dataset_id in dataset_ids {
            completion.insert(dataset_id.clone(), false);
            retries.insert(dataset_id.clone(), self.retry_budget);
        }

        self.prune();
        debug!(search_id = id.0, datasets = dataset_ids.len(), "generation allocated");
        id
    }

    /// Invalidate the current generation without allocating one for a query.
    /// Used when an empty query is submitted: there is no live search, and
    /// every outstanding envelope becomes stale the moment this returns.
    pub fn invalidate(&mut self) {
        self.current_search_id = self.next_search_id;
        self.next_search_id = self.next_search_id.next();
        self.prune();
        debug!(cutoff = self.current_search_id.0, "generations invalidated");
    }

    pub fn is_invalidated(&self, id: SearchId) -> bool {
        id < self.current_search_id
    }

    /// Ensure ledger entries exist for a targeted single-dataset search
    /// (late-load path). Entries seeded by the original fan-out are kept.
    pub fn register_single(&mut self, dataset_id: &str, id: SearchId, retry_budget: u32) {
        if self.is_invalidated(id) {
            debug!(dataset_id, search_id = id.0, "not registering invalidated generation");
            return;
        }
        self.completion
            .entry(id)
            .or_default()
            .entry(dataset_id.to_string())
            .or_insert(false);
        self.retries
            .entry(id)
            .or_default()
            .entry(dataset_id.to_string())
            .or_insert(retry_budget);
    }

    /// Record that a dataset answered for a generation. For an invalidated
    /// generation this has no outward effect; the report is still kept so the
    /// generation can be garbage-collected once every dataset has answered.
    pub fn mark_completed(&mut self, dataset_id: &str, id: SearchId) {
        if self.is_invalidated(id) {
            debug!(dataset_id, search_id = id.0, "completion for invalidated generation");
        }
        match self.completion.get_mut(&id).and_then(|m| m.get_mut(dataset_id)) {
            Some(done) => *done = true,
            None => {
                debug!(dataset_id, search_id = id.0, "completion for untracked dataset");
                return;
            }
        }
        self.prune();
    }

    /// Atomically consume one retry for (dataset, generation). False once the
    /// budget is exhausted or the generation is invalidated.
    pub fn acquire_retry(&mut self, dataset_id: &str, id: SearchId) -> bool {
        if self.is_invalidated(id) {
            return false;
        }
        match self.retries.get_mut(&id).and_then(|m| m.get_mut(dataset_id)) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// True once every dataset seeded for this generation has answered.
    pub fn generation_complete(&self, id: SearchId) -> bool {
        self.completion
            .get(&id)
            .map(|m| !m.is_empty() && m.values().all(|done| *done))
            .unwrap_or(false)
    }

    // Drop generations that are invalidated and fully answered.
    fn prune(&mut self) {
        let cutoff = self.current_search_id;
        self.completion.retain(|id, datasets| {
            *id >= cutoff || !datasets.values().all(|done| *done)
        });
        let completion = &self.completion;
        self.retries
            .retain(|id, _| *id >= cutoff || completion.contains_key(id));
    }
}
