//! Message protocol between the worker pool and its search workers, plus the
//! outward event stream consumed by the embedding UI layer.
//!
//! In-process transport is typed tokio channels, so the serde shape only
//! matters to external embedders; it is pinned by the tests below and must
//! stay stable.

use serde::{Deserialize, Serialize};

use crate::dataset::{DatasetDescriptor, DatasetId, SearchHit, SearchId};

/// Commands sent from the pool to one search worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerCommand {
    /// Bind the worker to a dataset. Valid once, from the uninitialized state.
    Init { descriptor: DatasetDescriptor },
    /// Start the asynchronous dataset load.
    Load,
    Search {
        query: String,
        #[serde(rename = "generationID")]
        search_id: SearchId,
    },
    Cancel,
}

/// Replies emitted by a search worker. Exactly one reply per completed
/// (non-cancelled) search; at most one `DatasetLoaded` per worker lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerReply {
    SearchSuccess {
        #[serde(rename = "datasetID")]
        dataset_id: DatasetId,
        query: String,
        #[serde(rename = "generationID")]
        search_id: SearchId,
        results: Vec<SearchHit>,
    },
    SearchFailure {
        #[serde(rename = "datasetID")]
        dataset_id: DatasetId,
        query: String,
        #[serde(rename = "generationID")]
        search_id: SearchId,
        failure: String,
    },
    DatasetLoaded {
        #[serde(rename = "datasetID")]
        dataset_id: DatasetId,
    },
    /// Diagnostic notice for a cancelled operation. Never carries results and
    /// is only ever logged downstream.
    Canceled {
        #[serde(rename = "datasetID")]
        dataset_id: DatasetId,
        query: String,
        #[serde(rename = "generationID")]
        search_id: SearchId,
    },
}

impl WorkerReply {
    pub fn dataset_id(&self) -> &str {
        match self {
            WorkerReply::SearchSuccess { dataset_id, .. }
            | WorkerReply::SearchFailure { dataset_id, .. }
            | WorkerReply::DatasetLoaded { dataset_id }
            | WorkerReply::Canceled { dataset_id, .. } => dataset_id,
        }
    }
}

/// Outward effects published on the controller's event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SearchEvent {
    ResultsAppended {
        dataset_id: DatasetId,
        query: String,
        hits: Vec<SearchHit>,
    },
    ResultsCleared,
    DatasetLoaded {
        dataset_id: DatasetId,
    },
    AllDatasetsLoaded,
    RetriesExhausted {
        dataset_id: DatasetId,
        query: String,
    },
}
