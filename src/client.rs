use std::sync::{
    atomic::{AtomicBool, Ordering},
    OnceLock,
};

use crate::{
    update::{NoopUpdateSource, ShutdownSignal, UpdateSink, UpdateSource},
    ClientConfig, Context, Engine, Error, Middleware, Result, Session, SwitchModel,
};

/// A switch client.
///
/// The client gates evaluation on its lifecycle: until [`Client::start`] succeeds every switch is
/// closed. Starting validates the configuration and connects the [`UpdateSource`] that keeps the
/// engine's rulesets current.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use switch_sdk::{Client, ClientConfig, Context, Engine, FactorRegistry};
/// let mut config = ClientConfig::new();
/// config
///     .domain("http://127.0.0.1:8081")
///     .namespace_tag("test-ns")
///     .env_tag("pre");
///
/// let client = Client::new(config, Engine::new(Arc::new(FactorRegistry::new())));
/// client.start().unwrap();
/// assert!(!client.is_open(&Context::new(), "feature_enabled"));
/// client.shutdown();
/// ```
pub struct Client {
    config: ClientConfig,
    engine: Engine,
    update_source: Box<dyn UpdateSource>,
    initialized: AtomicBool,
    /// Holds the outcome of the one and only initialization.
    started: OnceLock<Result<()>>,
    shutdown: ShutdownSignal,
}

impl Client {
    /// Create a new `Client`. Unset options are filled with their defaults.
    pub fn new(mut config: ClientConfig, engine: Engine) -> Client {
        config.apply_defaults();
        Client {
            config,
            engine,
            update_source: Box::new(NoopUpdateSource),
            initialized: AtomicBool::new(false),
            started: OnceLock::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Deliver ruleset updates from `source`. The default source delivers nothing.
    pub fn with_update_source(mut self, source: impl UpdateSource + 'static) -> Client {
        self.update_source = Box::new(source);
        self
    }

    /// The configuration, with defaults applied.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The engine evaluating switches for this client.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Initialize the client.
    ///
    /// Initialization runs at most once, however many threads call `start`. Every call, concurrent
    /// or later, returns the outcome of that single run.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingOption`] or [`Error::InvalidDomain`] if the configuration is incomplete.
    /// - Any error of [`UpdateSource::start`].
    /// - [`Error::ShutDown`] after [`Client::shutdown`].
    pub fn start(&self) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(Error::ShutDown);
        }
        self.started.get_or_init(|| self.initialize()).clone()
    }

    fn initialize(&self) -> Result<()> {
        log::info!(target: "switch",
            domain = self.config.domain.as_str(),
            namespace_tag = self.config.namespace_tag.as_str(),
            env_tag = self.config.env_tag.as_str();
            "starting switch client");

        let result = self.config.validate().and_then(|()| {
            let sink = UpdateSink::new(self.engine.registry().clone());
            self.update_source
                .start(sink, &self.config, self.shutdown.clone())
        });
        if let Err(err) = &result {
            log::warn!(target: "switch", "failed to start switch client: {err}");
            return result;
        }

        // Publish before checking the signal: a shutdown racing with this start either sees the
        // flag and resets it, or is seen here.
        self.initialized.store(true, Ordering::SeqCst);
        if self.shutdown.is_triggered() {
            self.initialized.store(false, Ordering::SeqCst);
            self.update_source.stop();
            self.engine.clear_all_rules();
            log::warn!(target: "switch", "switch client was shut down while starting");
            return Err(Error::ShutDown);
        }

        log::info!(target: "switch", "switch client initialized");
        Ok(())
    }

    /// Returns `true` once [`Client::start`] has succeeded, until [`Client::shutdown`].
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Stop the update source and drop every ruleset. The client cannot be started again.
    ///
    /// A [`Client::start`] still in progress fails with [`Error::ShutDown`] and leaves the client
    /// uninitialized.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
        self.initialized.store(false, Ordering::SeqCst);
        self.update_source.stop();
        self.engine.clear_all_rules();
        log::info!(target: "switch", "switch client shut down");
    }

    /// Evaluate the switch registered under `name` with a fresh [`Session`].
    pub fn is_open(&self, ctx: &Context, name: &str) -> bool {
        self.is_open_with_session(ctx, &Session::new(), name)
    }

    /// Evaluate the switch registered under `name`, recording into `session`.
    pub fn is_open_with_session(&self, ctx: &Context, session: &Session, name: &str) -> bool {
        if !self.is_initialized() {
            log::warn!(target: "switch", switch = name; "evaluating a switch before the client has been initialized");
            return false;
        }
        self.engine.is_open(ctx, session, name)
    }

    /// Evaluate `model` directly, bypassing the registry, with a fresh [`Session`].
    pub fn is_switch_open(&self, ctx: &Context, model: &SwitchModel) -> bool {
        self.is_switch_open_with_session(ctx, &Session::new(), model)
    }

    /// Evaluate `model` directly, bypassing the registry, recording into `session`.
    pub fn is_switch_open_with_session(
        &self,
        ctx: &Context,
        session: &Session,
        model: &SwitchModel,
    ) -> bool {
        if !self.is_initialized() {
            log::warn!(target: "switch", switch = model.name.as_str(); "evaluating a switch before the client has been initialized");
            return false;
        }
        self.engine.is_switch_open(ctx, session, model)
    }

    /// See [`Engine::register_rule`].
    pub fn register_rule(&self, model: SwitchModel) -> bool {
        self.engine.register_rule(model)
    }

    /// See [`Engine::unregister_rule`].
    pub fn unregister_rule(&self, name: &str) -> bool {
        self.engine.unregister_rule(name)
    }

    /// See [`Engine::clear_all_rules`].
    pub fn clear_all_rules(&self) {
        self.engine.clear_all_rules();
    }

    /// See [`Engine::with_middleware`].
    pub fn with_middleware(&self, middleware: impl Middleware + 'static) {
        self.engine.with_middleware(middleware);
    }
}
