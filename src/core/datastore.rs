// src/core/datastore.rs

//! Concurrent keyed map with atomic read-modify-write (`spec.md` §4.1).
//!
//! Source workers write the latest `Report` under their config name;
//! destination workers read from the source keys they're configured with;
//! a reserved `"consumers"` key holds a `hypervisor_id -> [hostname]` map.
//! Grounded on the teacher's use of `DashMap` entries for atomic
//! read-modify-write (`examples/spineldb-spineldb/src/core/storage/db/shard.rs`).

use dashmap::DashMap;
use std::collections::HashMap;

use crate::core::report::Report;

/// Everything the datastore can hold under a key.
#[derive(Debug, Clone)]
pub enum Value {
    Report(Report),
    Consumers(HashMap<String, Vec<String>>),
}

impl Value {
    pub fn as_report(&self) -> Option<&Report> {
        match self {
            Value::Report(r) => Some(r),
            Value::Consumers(_) => None,
        }
    }

    pub fn as_consumers(&self) -> Option<&HashMap<String, Vec<String>>> {
        match self {
            Value::Consumers(c) => Some(c),
            Value::Report(_) => None,
        }
    }
}

/// The reserved key under which the consumers map is stored.
pub const CONSUMERS_KEY: &str = "consumers";

/// A linearizable, concurrent keyed store. All three operations complete
/// within a single critical section and never block beyond it
/// (`spec.md` §4.1, §5).
#[derive(Debug, Default)]
pub struct Datastore {
    map: DashMap<String, Value>,
}

impl Datastore {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Returns a clone of the current value for `key`, or `None` if unset.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.map.get(key).map(|v| v.clone())
    }

    /// Unconditional replace.
    pub fn put(&self, key: impl Into<String>, value: Value) {
        self.map.insert(key.into(), value);
    }

    /// Atomically reads `key` (falling back to `default` when unset),
    /// invokes `f(current)`, and writes the result back. `f` executes
    /// under the shard's exclusive lock via `DashMap::entry`, so the whole
    /// operation is one critical section; `f` must be pure and must not
    /// itself touch the datastore (`spec.md` §4.1, §9).
    pub fn update<F>(&self, key: &str, default: Value, f: F)
    where
        F: FnOnce(Value) -> Value,
    {
        let entry = self.map.entry(key.to_string()).or_insert_with(|| default.clone());
        let mut guard = entry;
        let current = guard.clone();
        *guard = f(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::ErrorReport;

    #[test]
    fn get_returns_default_equivalent_none_when_unset() {
        let store = Datastore::new();
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = Datastore::new();
        store.put("s1", Value::Report(Report::Error(ErrorReport::new("s1"))));
        let got = store.get("s1").unwrap();
        assert_eq!(got.as_report().unwrap().config_name(), "s1");
    }

    #[test]
    fn update_applies_function_atomically() {
        let store = Datastore::new();
        store.update(CONSUMERS_KEY, Value::Consumers(HashMap::new()), |current| {
            let mut map = match current {
                Value::Consumers(m) => m,
                _ => HashMap::new(),
            };
            map.entry("h1".to_string()).or_default().push("dest-a".to_string());
            Value::Consumers(map)
        });
        let consumers = store.get(CONSUMERS_KEY).unwrap();
        assert_eq!(
            consumers.as_consumers().unwrap().get("h1").unwrap(),
            &vec!["dest-a".to_string()]
        );
    }

    #[test]
    fn consumers_are_set_semantics_no_duplicates() {
        let store = Datastore::new();
        let append = |store: &Datastore| {
            store.update(CONSUMERS_KEY, Value::Consumers(HashMap::new()), |current| {
                let mut map = match current {
                    Value::Consumers(m) => m,
                    _ => HashMap::new(),
                };
                let list = map.entry("h1".to_string()).or_default();
                if !list.contains(&"dest-a".to_string()) {
                    list.push("dest-a".to_string());
                }
                Value::Consumers(map)
            });
        };
        append(&store);
        append(&store);
        let consumers = store.get(CONSUMERS_KEY).unwrap();
        assert_eq!(consumers.as_consumers().unwrap().get("h1").unwrap().len(), 1);
    }
}
