use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{
    sync::{read, write},
    SwitchModel,
};

/// `RuleRegistry` maps switch names to their current ruleset and allows concurrent access for
/// readers and writers.
///
/// Writes are version-monotonic: a ruleset replaces the installed one only if its version is
/// strictly greater, so duplicated or reordered deliveries are dropped.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<SwitchModel>>>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> RuleRegistry {
        RuleRegistry::default()
    }

    /// Install `model` under `name`. Returns `true` if it was installed, `false` if a ruleset with
    /// the same or a newer version is already present.
    pub fn register(&self, name: &str, model: SwitchModel) -> bool {
        // Constructing new value before requesting the lock to minimize lock span.
        let version = model.version;
        let model = Arc::new(model);

        let mut rules = write(&self.rules);
        match rules.get(name) {
            Some(current) if current.version >= version => {
                log::debug!(target: "switch",
                    switch = name,
                    version,
                    current_version = current.version;
                    "dropping stale switch update");
                false
            }
            _ => {
                rules.insert(name.to_owned(), model);
                drop(rules);
                log::debug!(target: "switch", switch = name, version; "installed switch ruleset");
                true
            }
        }
    }

    /// The ruleset installed under `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<SwitchModel>> {
        read(&self.rules).get(name).cloned()
    }

    /// Remove the ruleset installed under `name`, returning it.
    pub fn unregister(&self, name: &str) -> Option<Arc<SwitchModel>> {
        let removed = write(&self.rules).remove(name);
        if removed.is_some() {
            log::debug!(target: "switch", switch = name; "removed switch ruleset");
        }
        removed
    }

    /// Remove every ruleset.
    pub fn clear_all(&self) {
        let mut rules = write(&self.rules);
        let count = rules.len();
        rules.clear();
        drop(rules);
        log::debug!(target: "switch", count; "cleared all switch rulesets");
    }

    /// Number of installed rulesets.
    pub fn len(&self) -> usize {
        read(&self.rules).len()
    }

    /// Returns `true` if no ruleset is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
