//! Factor result caching: single-flight coalescing plus a last-value slot per (switch, factor).
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, PoisonError, RwLock},
};

use serde_json::Value;

use crate::{
    middleware::{Handler, Invocation},
    sync::{lock, read, write},
};

/// Per-context factor cache.
///
/// Created by [`Context::use_cache`](crate::Context::use_cache). Holds the last config and result
/// seen for every (switch, factor) pair. Entries never expire.
#[derive(Debug, Default)]
pub struct FactorCache {
    slots: RwLock<HashMap<SlotKey, Slot>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    switch: String,
    factor: String,
}

#[derive(Debug)]
struct Slot {
    config: Value,
    result: bool,
}

impl FactorCache {
    pub(crate) fn new() -> FactorCache {
        FactorCache::default()
    }

    /// The stored result, if the last config seen for (switch, factor) equals `config`.
    pub(crate) fn get(&self, switch: &str, factor: &str, config: &Value) -> Option<bool> {
        let slots = read(&self.slots);
        let slot = slots.get(&SlotKey {
            switch: switch.to_owned(),
            factor: factor.to_owned(),
        })?;
        (slot.config == *config).then_some(slot.result)
    }

    /// Overwrite the slot for (switch, factor).
    pub(crate) fn set(&self, switch: &str, factor: &str, config: &Value, result: bool) {
        let key = SlotKey {
            switch: switch.to_owned(),
            factor: factor.to_owned(),
        };
        let slot = Slot {
            config: config.clone(),
            result,
        };
        write(&self.slots).insert(key, slot);
    }

    /// Number of (switch, factor) slots.
    pub fn len(&self) -> usize {
        read(&self.slots).len()
    }

    /// Returns `true` if nothing was cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The leader of a flight panicked before producing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Abandoned;

#[derive(Debug, Default)]
struct Call {
    outcome: Mutex<Option<Result<bool, Abandoned>>>,
    done: Condvar,
}

impl Call {
    fn complete(&self, outcome: Result<bool, Abandoned>) {
        *lock(&self.outcome) = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<bool, Abandoned> {
        let mut guard = lock(&self.outcome);
        loop {
            match &*guard {
                Some(outcome) => return *outcome,
                None => {
                    guard = self
                        .done
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

/// Collapses concurrent calls with the same key into one execution.
///
/// Waiting is unbounded: followers block for as long as the leader runs.
#[derive(Debug, Default)]
pub(crate) struct SingleFlight {
    calls: Mutex<HashMap<String, Arc<Call>>>,
}

/// Completes the flight when the leader returns or unwinds.
struct Leader<'a> {
    flight: &'a SingleFlight,
    key: &'a str,
    call: Arc<Call>,
    outcome: Result<bool, Abandoned>,
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        // Remove first: a caller arriving after this point starts a new flight.
        lock(&self.flight.calls).remove(self.key);
        self.call.complete(self.outcome);
    }
}

impl SingleFlight {
    /// Run `f` unless a call for `key` is already in flight, in which case wait for its result.
    ///
    /// Returns the result together with `true` if it was shared from another caller's run.
    pub fn run(&self, key: &str, f: impl FnOnce() -> bool) -> (Result<bool, Abandoned>, bool) {
        let mut calls = lock(&self.calls);
        if let Some(call) = calls.get(key).map(Arc::clone) {
            drop(calls);
            return (call.wait(), true);
        }

        let call = Arc::new(Call::default());
        calls.insert(key.to_owned(), Arc::clone(&call));
        drop(calls);

        let mut leader = Leader {
            flight: self,
            key,
            call,
            outcome: Err(Abandoned),
        };
        let result = f();
        leader.outcome = Ok(result);
        drop(leader);

        (Ok(result), false)
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        lock(&self.calls).len()
    }
}

/// Coalescing key of a factor dispatch: md5 of `switch#factor#config`.
///
/// Scalars are formatted directly, other configs as JSON.
pub(crate) fn coalescing_key(
    switch: &str,
    factor: &str,
    config: &Value,
) -> Result<String, serde_json::Error> {
    let condition = match config {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other)?,
    };
    let digest = md5::compute(format!("{switch}#{factor}#{condition}"));
    Ok(format!("{digest:x}"))
}

/// The cache layer.
///
/// Inert unless the switch has `use_cache` set and the context was opted in with
/// [`Context::use_cache`](crate::Context::use_cache). The in-flight table belongs to the layer, so
/// identical dispatches coalesce across every opted-in context. Last values stay per context.
pub(crate) fn cache_middleware(next: Handler) -> Handler {
    let in_flight = SingleFlight::default();
    Arc::new(move |inv: &Invocation<'_>| {
        let Some(cache) = inv.context.factor_cache() else {
            return next(inv);
        };
        if !inv.switch.use_cache {
            return next(inv);
        }

        let switch = inv.switch.name.as_str();
        let factor = inv.node.factor.as_str();
        let config = &inv.node.config;

        let key = match coalescing_key(switch, factor, config) {
            Ok(key) => key,
            Err(err) => {
                inv.stats.add_error(format!("failed to build cache key: {err}"));
                return false;
            }
        };

        let (outcome, shared) = in_flight.run(&key, || {
            if let Some(result) = cache.get(switch, factor, config) {
                log::trace!(target: "switch", switch, factor; "factor cache hit");
                return result;
            }
            log::trace!(target: "switch", switch, factor; "factor cache miss");
            let result = next(inv);
            cache.set(switch, factor, config, result);
            result
        });
        match outcome {
            Ok(result) => {
                if shared {
                    log::trace!(target: "switch", switch, factor; "joined in-flight factor dispatch");
                    // The leader may have run on behalf of another context.
                    cache.set(switch, factor, config, result);
                }
                result
            }
            Err(Abandoned) => {
                inv.stats.add_error("in-flight factor dispatch was abandoned");
                false
            }
        }
    })
}
