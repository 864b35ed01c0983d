//! Desired-set derivation and diffing against the running set.
//!
//! Everything here is pure: the supervisor applies the resulting plan.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::config::{MAX_LOAD_TEST_CONCURRENCY, RejectedService, ServiceSpec};

// ──────────────────── keys ────────────────────

/// Identity of one watcher: the service name, or `<name>_<index>` when the
/// service runs more than one instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatcherKey(String);

impl WatcherKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WatcherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WatcherKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Keys one service expands to. Concurrency must lie in
/// `1..=MAX_LOAD_TEST_CONCURRENCY`.
pub fn expand_service(name: &str, spec: &ServiceSpec) -> Result<Vec<WatcherKey>, String> {
    match spec.load_test_concurrency {
        n if n < 1 => Err(format!("load_test_concurrency must be at least 1, got {n}")),
        n if n > MAX_LOAD_TEST_CONCURRENCY => Err(format!(
            "load_test_concurrency must be at most {MAX_LOAD_TEST_CONCURRENCY}, got {n}"
        )),
        1 => Ok(vec![WatcherKey::new(name)]),
        n => Ok((0..n).map(|i| WatcherKey::new(format!("{name}_{i}"))).collect()),
    }
}

/// Result of expanding every service in a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expansion {
    pub specs: BTreeMap<WatcherKey, ServiceSpec>,
    pub rejected: Vec<RejectedService>,
}

/// Expand services in name order. A service whose expansion fails, or whose
/// keys collide with an earlier service's, is rejected whole.
pub fn expand(services: &BTreeMap<String, ServiceSpec>) -> Expansion {
    let mut expansion = Expansion::default();
    for (name, spec) in services {
        let keys = match expand_service(name, spec) {
            Ok(keys) => keys,
            Err(reason) => {
                expansion.rejected.push(RejectedService {
                    name: name.clone(),
                    reason,
                });
                continue;
            }
        };
        if let Some(clash) = keys.iter().find(|k| expansion.specs.contains_key(*k)) {
            expansion.rejected.push(RejectedService {
                name: name.clone(),
                reason: format!("watcher key {clash} collides with another service"),
            });
            continue;
        }
        for key in keys {
            expansion.specs.insert(key, spec.clone());
        }
    }
    expansion
}

// ──────────────────── plan ────────────────────

/// Actions converging the known set onto the desired set.
///
/// Apply order: reap `to_reap ∪ to_replace`, then launch
/// `to_launch ∪ to_replace`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub to_launch: BTreeSet<WatcherKey>,
    pub to_replace: BTreeSet<WatcherKey>,
    pub to_reap: BTreeSet<WatcherKey>,
    pub expanded: BTreeMap<WatcherKey, ServiceSpec>,
    pub rejected: Vec<RejectedService>,
}

impl ReconcilePlan {
    /// No launches, replacements or reaps.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.to_launch.is_empty() && self.to_replace.is_empty() && self.to_reap.is_empty()
    }
}

/// Diff desired services against the keys the supervisor already knows.
///
/// `previous` holds the spec each known key was last launched with; a key
/// whose spec differs by value is replaced.
pub fn diff(
    desired: &BTreeMap<String, ServiceSpec>,
    known: &BTreeSet<WatcherKey>,
    previous: &BTreeMap<WatcherKey, ServiceSpec>,
) -> ReconcilePlan {
    let Expansion { specs, rejected } = expand(desired);

    let to_reap = known
        .iter()
        .filter(|k| !specs.contains_key(*k))
        .cloned()
        .collect();
    let to_replace = known
        .iter()
        .filter(|k| specs.get(*k).is_some_and(|spec| previous.get(*k) != Some(spec)))
        .cloned()
        .collect();
    let to_launch = specs
        .keys()
        .filter(|k| !known.contains(*k))
        .cloned()
        .collect();

    ReconcilePlan {
        to_launch,
        to_replace,
        to_reap,
        expanded: specs,
        rejected,
    }
}
