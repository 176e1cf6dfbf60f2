use std::collections::BTreeSet;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

/// `dependent` sleeps while `dependency` is stopped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct LockEdge {
    pub dependent: String,
    pub dependency: String,
}

/// Collected `lockOn` declarations, one set per dependent addon.
#[derive(Debug, Default)]
pub struct LockTracker {
    locks: DashMap<String, BTreeSet<String>>,
}

impl LockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the lock set of `dependent`.
    pub fn register<I, S>(&self, dependent: &str, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for dependency in dependencies {
            let dependency = dependency.into();
            if dependency == dependent {
                warn!(addon = dependent, "ignoring lockOn on itself");
                continue;
            }
            set.insert(dependency);
        }
        debug!(addon = dependent, locks = ?set, "lock set updated");
        self.locks.insert(dependent.to_string(), set);
    }

    pub fn remove(&self, dependent: &str) {
        self.locks.remove(dependent);
    }

    pub fn locks_of(&self, dependent: &str) -> BTreeSet<String> {
        self.locks
            .get(dependent)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    /// Every addon whose lock set names `dependency`. Linear in the number of addons.
    pub fn dependents_of(&self, dependency: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| entry.value().contains(dependency))
            .map(|entry| entry.key().clone())
            .collect();
        dependents.sort();
        dependents
    }

    pub fn edges(&self) -> Vec<LockEdge> {
        let mut edges: Vec<LockEdge> = self
            .locks
            .iter()
            .flat_map(|entry| {
                let dependent = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .map(|dependency| LockEdge {
                        dependent: dependent.clone(),
                        dependency: dependency.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        edges.sort();
        edges
    }
}
