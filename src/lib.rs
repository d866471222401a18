//! The evaluation core of the switch feature-flag SDK.
//!
//! # Overview
//!
//! A switch is a feature flag whose ruleset is a boolean expression tree ([`RuleNode`]). Logical
//! nodes combine their children with `AND`/`OR`; leaves name a factor, a predicate evaluated by
//! your [`FactorDispatcher`] (usually a [`FactorRegistry`]) against the caller's [`Context`].
//!
//! The [`Engine`] owns the versioned [`RuleRegistry`] of rulesets and the [`Middleware`] pipeline
//! around factor dispatch. The [`Client`] gates evaluation on its lifecycle and connects the
//! [`UpdateSource`] that keeps rulesets current.
//!
//! Every evaluation records per-factor statistics into a [`Session`]. When the
//! `is_open_switch_statistic` switch is open, one statistics line is logged per evaluation.
//!
//! # Caching
//!
//! Switches with `use_cache` set coalesce identical concurrent factor dispatches and reuse the
//! last result per (switch, factor) for contexts opted in with [`Context::use_cache`].
//!
//! # Error Handling
//!
//! Switch evaluation never fails. Faults close the switch (it evaluates to `false`) and are
//! recorded in the [`Session`]. Setup and lifecycle errors are represented by the [`Error`] enum.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, under the `switch` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.
//!
//! # Examples
//!
//! A runnable example lives in the `demos/` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod cache;
mod client;
mod config;
mod context;
mod dispatcher;
mod engine;
mod error;
mod evaluator;
mod middleware;
mod model;
mod registry;
mod session;
mod sync;
mod update;

pub use cache::FactorCache;
pub use client::Client;
pub use config::{parse_duration, ClientConfig, DriverKind, DriverReplaceConfig, ReconnectStrategy};
pub use context::{AttributeValue, Attributes, Context};
pub use dispatcher::{FactorDispatcher, FactorError, FactorRegistry};
pub use engine::Engine;
pub use error::{Error, Result};
pub use middleware::{Handler, Invocation, Middleware};
pub use model::{NodeType, RuleNode, SwitchModel};
pub use registry::RuleRegistry;
pub use session::{ErrorDetails, FactorExecutionRecord, FactorRecorder, FactorStats, Session};
pub use update::{NoopUpdateSource, ShutdownSignal, SwitchUpdate, UpdateSink, UpdateSource};
