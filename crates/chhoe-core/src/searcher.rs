//! The opaque matching capability and dataset loading seams.
//!
//! The orchestration core treats "how a query matches entries" and "how a
//! dataset is obtained" as external collaborators behind these traits. The
//! default implementations here are enough for the engine binary and tests.

use std::cmp::Reverse;

use async_trait::async_trait;

use chhoe_types::{Dataset, DatasetDescriptor, DictionaryEntry, SearchHit};

const MAX_HITS: usize = 50;

/// Given a loaded dataset and a query, produce ranked matches or a failure
/// reason. Implementations may suspend for arbitrary durations; the worker
/// wraps every call in a cancellation scope.
#[async_trait]
pub trait Searcher: Send + Sync + 'static {
    async fn search(&self, dataset: &Dataset, query: &str) -> Result<Vec<SearchHit>, String>;
}

/// Turns a dataset descriptor into loaded entries. The core only reacts to
/// the outcome; retrieval policy (disk, network, cache) lives behind this.
#[async_trait]
pub trait DatasetProvider: Send + Sync + 'static {
    async fn load(&self, descriptor: &DatasetDescriptor) -> anyhow::Result<Dataset>;
}

/// Case-insensitive scored substring matcher. Exact headword matches rank
/// first, then headword prefixes, then headword substrings, then definition
/// substrings.
pub struct SubstringSearcher;

impl SubstringSearcher {
    fn score(entry: &DictionaryEntry, needle: &str) -> Option<i64> {
        let head = entry.head.to_lowercase();
        if head == needle {
            return Some(100);
        }
        if head.starts_with(needle) {
            return Some(80 - (head.len() as i64 - needle.len() as i64).min(30));
        }
        if head.contains(needle) {
            return Some(40);
        }
        if entry.definition.to_lowercase().contains(needle) {
            return Some(20);
        }
        None
    }
}

#[async_trait]
impl Searcher for SubstringSearcher {
    async fn search(&self, dataset: &Dataset, query: &str) -> Result<Vec<SearchHit>, String> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = dataset
            .entries
            .iter()
            .filter_map(|entry| {
                Self::score(entry, &needle).map(|score| SearchHit {
                    head: entry.head.clone(),
                    definition: entry.definition.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by_key(|hit| (Reverse(hit.score), hit.head.clone()));
        hits.truncate(MAX_HITS);
        Ok(hits)
    }
}

/// Loads a dataset from `descriptor.source` interpreted as a path to a JSON
/// array of dictionary entries.
pub struct JsonFileProvider;

#[async_trait]
impl DatasetProvider for JsonFileProvider {
    async fn load(&self, descriptor: &DatasetDescriptor) -> anyhow::Result<Dataset> {
        let raw = tokio::fs::read_to_string(&descriptor.source).await?;
        let entries: Vec<DictionaryEntry> = serde_json::from_str(&raw)?;
        Ok(Dataset {
            id: descriptor.id.clone(),
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        Dataset {
            id: "test".into(),
            entries: vec![
                DictionaryEntry {
                    head: "cat".into(),
                    definition: "niau".into(),
                    tags: vec![],
                },
                DictionaryEntry {
                    head: "catfish".into(),
                    definition: "a fish".into(),
                    tags: vec![],
                },
                DictionaryEntry {
                    head: "dog".into(),
                    definition: "káu; not a cat".into(),
                    tags: vec![],
                },
            ],
        }
    }

    #[tokio::test]
    async fn exact_head_match_ranks_first() {
        let hits = SubstringSearcher
            .search(&dataset(), "cat")
            .await
            .expect("hits");
        assert_eq!(hits[0].head, "cat");
        assert_eq!(hits[0].score, 100);
        // "catfish" is a prefix match, "dog" only matches in its definition.
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[2].head, "dog");
    }

    #[tokio::test]
    async fn blank_query_matches_nothing() {
        let hits = SubstringSearcher
            .search(&dataset(), "   ")
            .await
            .expect("hits");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn json_file_provider_reads_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mini.json");
        std::fs::write(
            &path,
            r#"[{"head":"niau","definition":"cat","tags":["animal"]}]"#,
        )
        .expect("write");

        let descriptor = DatasetDescriptor {
            id: "mini".into(),
            name: "Mini".into(),
            source: path.display().to_string(),
        };
        let loaded = JsonFileProvider.load(&descriptor).await.expect("load");
        assert_eq!(loaded.id, "mini");
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].tags, vec!["animal".to_string()]);
    }

    #[tokio::test]
    async fn json_file_provider_fails_on_missing_file() {
        let descriptor = DatasetDescriptor {
            id: "missing".into(),
            name: "Missing".into(),
            source: "/nonexistent/chhoe-dataset.json".into(),
        };
        assert!(JsonFileProvider.load(&descriptor).await.is_err());
    }
}
