use std::fmt;

use serde::{Deserialize, Serialize};

/// Short human-readable identifier for one searchable dictionary dataset.
pub type DatasetId = String;

/// Generation id assigned to one submitted query. Strictly increasing per
/// controller instance; an envelope tagged with an older id than the current
/// one is stale and must be discarded.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SearchId(pub u64);

impl SearchId {
    /// Reserved generation used for searches issued automatically when a
    /// dataset finishes loading before any query was explicitly submitted.
    pub const INITIAL: SearchId = SearchId(0);

    pub fn next(self) -> SearchId {
        SearchId(self.0 + 1)
    }
}

impl fmt::Display for SearchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a dataset comes from. The core never loads datasets itself; a
/// `DatasetProvider` turns a descriptor into entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: DatasetId,
    /// Display name shown to the user, e.g. "Maryknoll".
    pub name: String,
    /// Provider-interpreted source, typically a file path.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    pub head: String,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A fully loaded, searchable dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub entries: Vec<DictionaryEntry>,
}

/// One ranked match produced by a searcher. Higher score ranks first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub head: String,
    pub definition: String,
    pub score: i64,
}
