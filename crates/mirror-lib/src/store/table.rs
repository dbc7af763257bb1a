//! Keyed table with secondary indexes

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use crate::models::EntityKind;

/// A row type the store can hold
pub trait Entity: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Unique key; two rows with the same key collapse to one
    fn key(&self) -> String;

    /// `(index name, value)` pairs this row is reachable under
    fn index_values(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

/// Rows of one entity kind, addressed by primary key and secondary indexes
pub struct Table<T: Entity> {
    rows: DashMap<String, T>,
    index: DashMap<(&'static str, String), BTreeSet<String>>,
}

impl<T: Entity> Default for Table<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Table<T> {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Build a table from previously persisted rows
    pub fn from_rows(rows: Vec<T>) -> Self {
        let table = Self::new();
        for row in rows {
            table.upsert(row);
        }
        table
    }

    /// Insert or wholesale replace the row with the same key
    pub fn upsert(&self, row: T) -> Upsert {
        let key = row.key();
        let new_index = row.index_values();

        let previous = self.rows.insert(key.clone(), row.clone());
        let outcome = match &previous {
            None => Upsert::Inserted,
            Some(old) if *old == row => return Upsert::Unchanged,
            Some(_) => Upsert::Updated,
        };

        if let Some(old) = previous {
            self.unindex(&key, old.index_values());
        }
        for entry in new_index {
            self.index.entry(entry).or_default().insert(key.clone());
        }

        debug!(kind = %T::KIND, key = %key, outcome = ?outcome, "Upserted row");
        outcome
    }

    fn unindex(&self, key: &str, entries: Vec<(&'static str, String)>) {
        for entry in entries {
            let now_empty = match self.index.get_mut(&entry) {
                Some(mut keys) => {
                    keys.remove(key);
                    keys.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.index.remove_if(&entry, |_, keys| keys.is_empty());
            }
        }
    }

    /// Row by primary key
    pub fn find_one(&self, key: &str) -> Option<T> {
        self.rows.get(key).map(|r| r.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    /// Rows matching a predicate, ordered by key
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let mut found: Vec<(String, T)> = self
            .rows
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found.into_iter().map(|(_, row)| row).collect()
    }

    /// Rows reachable under a secondary index value, ordered by key
    pub fn find_by(&self, index: &'static str, value: &str) -> Vec<T> {
        let keys: Vec<String> = self
            .index
            .get(&(index, value.to_string()))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.iter().filter_map(|k| self.find_one(k)).collect()
    }

    /// Remove a row by primary key
    pub fn delete(&self, key: &str) -> Option<T> {
        let (_, row) = self.rows.remove(key)?;
        self.unindex(key, row.index_values());
        debug!(kind = %T::KIND, key = %key, "Deleted row");
        Some(row)
    }

    /// Every row, ordered by key
    pub fn all(&self) -> Vec<T> {
        self.find(|_| true)
    }

    pub fn keys(&self) -> HashSet<String> {
        self.rows.iter().map(|r| r.key().clone()).collect()
    }

    /// Delete every row whose key is not in `observed`, returning the removed rows
    pub fn retain_keys(&self, observed: &HashSet<String>) -> Vec<T> {
        let stale: Vec<String> = self
            .keys()
            .into_iter()
            .filter(|k| !observed.contains(k))
            .collect();
        stale.iter().filter_map(|k| self.delete(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
