//! The inbound side of ruleset delivery.
//!
//! Transports (websocket, kafka, webhook, polling, ...) live outside this crate. They implement
//! [`UpdateSource`] and push [`SwitchUpdate`]s into the [`UpdateSink`] handed to them on start.
//! Delivery may be duplicated or reordered; the registry only ever moves forward in version.
use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use crate::{sync::lock, ClientConfig, Result, RuleRegistry, SwitchModel};

/// An update delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchUpdate {
    /// Install a ruleset, if newer than the installed one.
    Upsert(SwitchModel),
    /// Remove a switch.
    Remove(String),
    /// Install every ruleset of a full snapshot, each if newer than the installed one.
    FullSync(Vec<SwitchModel>),
}

impl SwitchUpdate {
    /// Decode a single switch payload as delivered by the drivers.
    pub fn from_json(payload: &[u8]) -> std::result::Result<SwitchUpdate, serde_json::Error> {
        serde_json::from_slice(payload).map(SwitchUpdate::Upsert)
    }
}

/// Applies [`SwitchUpdate`]s to a [`RuleRegistry`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct UpdateSink {
    registry: Arc<RuleRegistry>,
}

impl UpdateSink {
    pub(crate) fn new(registry: Arc<RuleRegistry>) -> UpdateSink {
        UpdateSink { registry }
    }

    /// Apply `update`, returning the number of rulesets installed or removed.
    pub fn apply(&self, update: SwitchUpdate) -> usize {
        match update {
            SwitchUpdate::Upsert(model) => {
                let name = model.name.clone();
                usize::from(self.registry.register(&name, model))
            }
            SwitchUpdate::Remove(name) => usize::from(self.registry.unregister(&name).is_some()),
            SwitchUpdate::FullSync(models) => {
                let total = models.len();
                let applied = models
                    .into_iter()
                    .map(|model| {
                        let name = model.name.clone();
                        self.registry.register(&name, model)
                    })
                    .filter(|installed| *installed)
                    .count();
                log::debug!(target: "switch", total, applied; "applied full switch sync");
                applied
            }
        }
    }

    /// Decode and apply a single switch payload. Payloads that fail to decode are logged and
    /// dropped.
    pub fn apply_json(&self, payload: &[u8]) -> usize {
        match SwitchUpdate::from_json(payload) {
            Ok(update) => self.apply(update),
            Err(err) => {
                log::warn!(target: "switch", "failed to decode switch update: {err}");
                0
            }
        }
    }
}

/// Cancellation handle shared between a client and its update source.
///
/// Once triggered it stays triggered.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    /// Create an untriggered signal.
    pub fn new() -> ShutdownSignal {
        ShutdownSignal::default()
    }

    /// Trigger the signal and wake every waiter.
    pub fn trigger(&self) {
        *lock(&self.state.0) = true;
        self.state.1.notify_all();
    }

    /// Returns `true` once triggered.
    pub fn is_triggered(&self) -> bool {
        *lock(&self.state.0)
    }

    /// Block until triggered or until `timeout` elapses. Returns `true` if triggered.
    ///
    /// Transports use this as an interruptible sleep between reconnect attempts.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.state.0);
        let (guard, _) = self
            .state
            .1
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Block until triggered.
    pub fn wait(&self) {
        let guard = lock(&self.state.0);
        let _guard = self
            .state
            .1
            .wait_while(guard, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// A transport delivering ruleset updates.
pub trait UpdateSource: Send + Sync {
    /// Connect and start delivering updates into `sink` until `shutdown` is triggered.
    ///
    /// Called once per client. Must not block for the lifetime of the connection: long-running
    /// work belongs on the source's own threads.
    fn start(
        &self,
        sink: UpdateSink,
        config: &ClientConfig,
        shutdown: ShutdownSignal,
    ) -> Result<()>;

    /// Stop delivering updates. Called on client shutdown, after `shutdown` was triggered.
    fn stop(&self) {}
}

/// An [`UpdateSource`] that never delivers anything. Rulesets are registered by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUpdateSource;

impl UpdateSource for NoopUpdateSource {
    fn start(&self, _: UpdateSink, _: &ClientConfig, _: ShutdownSignal) -> Result<()> {
        Ok(())
    }
}
