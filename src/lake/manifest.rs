// src/lake/manifest.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-day completeness index: `source_id -> messages ingested`.
///
/// A source is present only if its ingestion finished for the day; aborted
/// sources are left out so that downstream can tell "failed" from "empty".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Manifest {
    counts: BTreeMap<String, usize>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, source_id: impl Into<String>, count: usize) {
        self.counts.insert(source_id.into(), count);
    }

    pub fn get(&self, source_id: &str) -> Option<usize> {
        self.counts.get(source_id).copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Configured sources with no entry, in configured order.
    pub fn missing<'a>(&self, configured: &'a [String]) -> Vec<&'a str> {
        configured
            .iter()
            .map(String::as_str)
            .filter(|s| !self.counts.contains_key(*s))
            .collect()
    }

    /// `keys ⊇ configured`: the day is ready for downstream stages.
    pub fn is_complete(&self, configured: &[String]) -> bool {
        self.missing(configured).is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, usize)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (K, usize)>>(iter: I) -> Self {
        Self {
            counts: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
