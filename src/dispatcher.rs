//! Factor dispatch.
//!
//! A factor is a named boolean predicate over the caller's [`Context`] and an opaque config taken
//! from the rule tree. The engine only knows the [`FactorDispatcher`] contract. [`FactorRegistry`]
//! is a ready-made dispatcher that decodes the config into a typed struct before calling the
//! factor.
use std::{collections::HashMap, sync::Arc, sync::RwLock};

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::{
    sync::{read, write},
    Context, Error,
};

/// Errors returned by factor dispatch.
///
/// These never leave the engine: the leaf is closed and the error is recorded in the session.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FactorError {
    /// No factor is registered under this name.
    #[error("no factor registered under name {0:?}")]
    UnknownFactor(String),

    /// The config could not be decoded into the type the factor expects.
    #[error("failed to decode config for factor {factor:?}")]
    InvalidConfig {
        /// The factor whose config was rejected.
        factor: String,
        /// The decoding error.
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// The factor failed.
    #[error("{0}")]
    Failed(String),
}

impl FactorError {
    /// Create a [`FactorError::Failed`] from a message.
    pub fn failed(message: impl Into<String>) -> FactorError {
        FactorError::Failed(message.into())
    }
}

/// Evaluates one factor leaf.
///
/// Implementations must not assume anything about evaluation order and must be safe to call from
/// several threads at once. They are free to call out to other systems; honoring deadlines or
/// cancellation is up to them, as the engine imposes none.
pub trait FactorDispatcher: Send + Sync {
    /// Evaluate `factor` with `config` against `ctx`.
    fn dispatch(&self, ctx: &Context, factor: &str, config: &Value) -> Result<bool, FactorError>;
}

impl<F> FactorDispatcher for F
where
    F: Fn(&Context, &str, &Value) -> Result<bool, FactorError> + Send + Sync,
{
    fn dispatch(&self, ctx: &Context, factor: &str, config: &Value) -> Result<bool, FactorError> {
        self(ctx, factor, config)
    }
}

type FactorFn = Box<dyn Fn(&Context, &Value) -> Result<bool, FactorError> + Send + Sync>;

struct RegisteredFactor {
    description: String,
    call: FactorFn,
}

/// A [`FactorDispatcher`] backed by a table of named, typed factors.
///
/// ```
/// # use serde::Deserialize;
/// # use switch_sdk::{Context, FactorRegistry};
/// #[derive(Deserialize)]
/// struct SingleConfig {
///     enabled: bool,
/// }
///
/// let registry = FactorRegistry::new();
/// registry
///     .register("single", "a plain on/off switch", |_ctx: &Context, config: SingleConfig| {
///         Ok(config.enabled)
///     })
///     .unwrap();
/// assert!(registry.contains("single"));
/// ```
#[derive(Default)]
pub struct FactorRegistry {
    factors: RwLock<HashMap<String, Arc<RegisteredFactor>>>,
}

impl FactorRegistry {
    /// Create an empty registry.
    pub fn new() -> FactorRegistry {
        FactorRegistry::default()
    }

    /// Register `factor` under `name`, replacing any previous registration.
    ///
    /// The rule's config is decoded into `C` on every dispatch; a config that does not decode
    /// closes the leaf with [`FactorError::InvalidConfig`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidFactor`] if `name` or `description` is empty.
    pub fn register<C, F>(&self, name: &str, description: &str, factor: F) -> crate::Result<()>
    where
        C: DeserializeOwned + 'static,
        F: Fn(&Context, C) -> Result<bool, FactorError> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(Error::InvalidFactor("factor name must not be empty"));
        }
        if description.is_empty() {
            return Err(Error::InvalidFactor("factor description must not be empty"));
        }

        let factor_name = name.to_owned();
        let call: FactorFn = Box::new(move |ctx: &Context, config: &Value| {
            let config = C::deserialize(config).map_err(|err| FactorError::InvalidConfig {
                factor: factor_name.clone(),
                source: Arc::new(err),
            })?;
            factor(ctx, config)
        });

        let replaced = write(&self.factors)
            .insert(
                name.to_owned(),
                Arc::new(RegisteredFactor {
                    description: description.to_owned(),
                    call,
                }),
            )
            .is_some();
        log::debug!(target: "switch", factor = name, replaced; "registered factor");

        Ok(())
    }

    /// Returns `true` if a factor is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        read(&self.factors).contains_key(name)
    }

    /// The description given when `name` was registered.
    pub fn description(&self, name: &str) -> Option<String> {
        read(&self.factors)
            .get(name)
            .map(|factor| factor.description.clone())
    }
}

impl FactorDispatcher for FactorRegistry {
    fn dispatch(&self, ctx: &Context, factor: &str, config: &Value) -> Result<bool, FactorError> {
        // Released before the call, so factors may dispatch other factors.
        let registered = read(&self.factors)
            .get(factor)
            .cloned()
            .ok_or_else(|| FactorError::UnknownFactor(factor.to_owned()))?;
        (registered.call)(ctx, config)
    }
}
