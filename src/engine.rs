use std::sync::{Arc, RwLock};

use crate::{
    cache::cache_middleware,
    dispatcher::FactorDispatcher,
    evaluator::RuleEvaluator,
    middleware::{dispatch_handler, Middleware, Pipeline},
    session::{format_duration, format_factor_records, Timer},
    sync::{read, write},
    Context, ErrorDetails, RuleRegistry, Session, SwitchModel,
};

/// The switch evaluation engine.
///
/// An `Engine` owns the rule registry and the middleware pipeline around factor dispatch.
/// Evaluation never fails: any fault closes the switch and is recorded in the [`Session`].
///
/// ```
/// # use std::sync::Arc;
/// # use serde::Deserialize;
/// # use serde_json::json;
/// # use switch_sdk::{Context, Engine, FactorRegistry, RuleNode, Session, SwitchModel};
/// #[derive(Deserialize)]
/// struct SingleConfig {
///     enabled: bool,
/// }
///
/// let factors = FactorRegistry::new();
/// factors
///     .register("single", "a plain on/off switch", |_: &Context, config: SingleConfig| {
///         Ok(config.enabled)
///     })
///     .unwrap();
///
/// let engine = Engine::new(Arc::new(factors));
/// engine.register_rule(SwitchModel::new(
///     "dark_mode",
///     1,
///     RuleNode::leaf("single", json!({"enabled": true})),
/// ));
///
/// assert!(engine.is_open(&Context::new(), &Session::new(), "dark_mode"));
/// assert!(!engine.is_open(&Context::new(), &Session::new(), "unknown"));
/// ```
pub struct Engine {
    registry: Arc<RuleRegistry>,
    pipeline: RwLock<Pipeline>,
    statistics_switch: String,
}

impl Engine {
    /// Name of the switch that decides whether evaluation statistics are logged.
    pub const STATISTICS_SWITCH: &'static str = "is_open_switch_statistic";

    /// Create an engine dispatching factor leaves to `dispatcher`.
    pub fn new(dispatcher: Arc<dyn FactorDispatcher>) -> Engine {
        let base = cache_middleware(dispatch_handler(dispatcher));
        Engine {
            registry: Arc::new(RuleRegistry::new()),
            pipeline: RwLock::new(Pipeline::new(base)),
            statistics_switch: Engine::STATISTICS_SWITCH.to_owned(),
        }
    }

    /// Use another switch to decide whether statistics are logged.
    pub fn with_statistics_switch(mut self, name: impl Into<String>) -> Engine {
        self.statistics_switch = name.into();
        self
    }

    /// The rulesets known to this engine.
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Append `middleware` to the pipeline.
    ///
    /// Middlewares run in registration order, the first registered being the outermost. The cache
    /// layer always sits innermost, right around factor dispatch. Evaluations already in progress
    /// keep the pipeline they started with.
    pub fn with_middleware(&self, middleware: impl Middleware + 'static) {
        let mut pipeline = write(&self.pipeline);
        pipeline.push(Arc::new(middleware));
        log::debug!(target: "switch", middlewares = pipeline.len(); "added middleware");
    }

    /// Install `model` under its name, if newer than the installed ruleset.
    pub fn register_rule(&self, model: SwitchModel) -> bool {
        let name = model.name.clone();
        self.registry.register(&name, model)
    }

    /// Remove the switch registered under `name`. Returns `false` if there was none.
    pub fn unregister_rule(&self, name: &str) -> bool {
        self.registry.unregister(name).is_some()
    }

    /// Remove every switch.
    pub fn clear_all_rules(&self) {
        self.registry.clear_all();
    }

    /// Evaluate the switch registered under `name`. Unknown switches are closed.
    pub fn is_open(&self, ctx: &Context, session: &Session, name: &str) -> bool {
        if name.is_empty() {
            log::warn!(target: "switch", "evaluating a switch without a name");
            session.add_error("switch name is empty");
            return false;
        }

        match self.registry.lookup(name) {
            Some(model) => self.is_switch_open(ctx, session, &model),
            None => {
                log::warn!(target: "switch", switch = name; "switch not found");
                session.add_error(format!("switch {name} not found"));
                false
            }
        }
    }

    /// Evaluate `model`, logging statistics if the statistics switch is open.
    pub fn is_switch_open(&self, ctx: &Context, session: &Session, model: &SwitchModel) -> bool {
        let result = self.evaluate(ctx, session, model);

        // The statistics switch never decides about its own statistics.
        if model.name != self.statistics_switch {
            let enabled = self.statistics_enabled(ctx);
            session.set_statistics_enabled(enabled);
            if enabled {
                log_statistics(session, model);
            }
        }

        result
    }

    fn evaluate(&self, ctx: &Context, session: &Session, model: &SwitchModel) -> bool {
        let timer = Timer::start();
        let result = match &model.rules {
            Some(rules) => {
                let evaluator = RuleEvaluator::new(read(&self.pipeline).handler());
                evaluator.evaluate(ctx, session, model, rules)
            }
            None => {
                session.add_error(format!("switch {} has no rules", model.name));
                false
            }
        };
        session.set_outcome(result, timer.elapsed());
        result
    }

    /// Evaluated with a scratch session, so its factors never show up in the caller's records.
    fn statistics_enabled(&self, ctx: &Context) -> bool {
        match self.registry.lookup(&self.statistics_switch) {
            Some(model) => self.evaluate(ctx, &Session::new(), &model),
            None => false,
        }
    }
}

/// The key-values of one statistics line.
#[derive(Debug, PartialEq)]
struct Statistics {
    request_id: String,
    switch: String,
    result: bool,
    duration: String,
    factors: String,
    errors: ErrorDetails,
}

impl Statistics {
    fn collect(session: &Session, model: &SwitchModel) -> Statistics {
        Statistics {
            request_id: session.request_id(),
            switch: model.name.clone(),
            result: session.result(),
            duration: session.duration().map(format_duration).unwrap_or_default(),
            factors: format_factor_records(&session.records()),
            errors: session.errors(),
        }
    }
}

fn log_statistics(session: &Session, model: &SwitchModel) {
    let stats = Statistics::collect(session, model);
    log::info!(target: "switch",
        request_id = stats.request_id.as_str(),
        switch = stats.switch.as_str(),
        result = stats.result,
        duration = stats.duration.as_str(),
        factors = stats.factors.as_str(),
        errors:serde = stats.errors;
        "switch statistics");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        time::Duration,
    };

    use serde_json::{json, Value};

    use super::{Engine, Statistics};
    use crate::{
        dispatcher::FactorError,
        middleware::{Handler, Invocation},
        Context, RuleNode, Session, SwitchModel,
    };

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Dispatcher whose factors return their config, counting dispatches.
    fn engine(calls: Arc<AtomicUsize>) -> Engine {
        Engine::new(Arc::new(
            move |_: &Context, factor: &str, config: &Value| -> Result<bool, FactorError> {
                calls.fetch_add(1, Ordering::SeqCst);
                config
                    .as_bool()
                    .ok_or_else(|| FactorError::failed(format!("{factor}: config is not a bool")))
            },
        ))
    }

    /// Like [`engine`], but every dispatch takes `delay`.
    fn slow_engine(calls: Arc<AtomicUsize>, delay: Duration) -> Engine {
        Engine::new(Arc::new(
            move |_: &Context, _: &str, _: &Value| -> Result<bool, FactorError> {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(delay);
                Ok(true)
            },
        ))
    }

    #[test]
    fn unknown_and_unnamed_switches_are_closed() {
        init();
        let engine = engine(Arc::default());
        let session = Session::new();

        assert!(!engine.is_open(&Context::new(), &session, "missing"));
        assert!(!engine.is_open(&Context::new(), &session, ""));
        assert_eq!(session.errors().len(), 2);
    }

    #[test]
    fn switch_without_rules_is_closed() {
        init();
        let engine = engine(Arc::default());
        let mut model = SwitchModel::new("empty", 1, RuleNode::default());
        model.rules = None;

        let session = Session::new();
        assert!(!engine.is_switch_open(&Context::new(), &session, &model));
        assert_eq!(session.errors().to_string(), "[switch empty has no rules]");
        assert!(session.duration().is_some());
    }

    #[test]
    fn factor_errors_close_the_leaf_and_are_recorded() {
        init();
        let engine = engine(Arc::default());
        engine.register_rule(SwitchModel::new(
            "broken",
            1,
            RuleNode::or([RuleNode::leaf("ip", json!("10.0.0.0/8"))]),
        ));

        let session = Session::new();
        assert!(!engine.is_open(&Context::new(), &session, "broken"));
        assert!(!session.result());
        assert_eq!(session.errors().to_string(), "[ip: ip: config is not a bool]");
    }

    #[test]
    fn statistics_follow_the_statistics_switch() {
        init();
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine(Arc::clone(&calls));
        engine.register_rule(SwitchModel::new("feature", 1, RuleNode::leaf("single", json!(true))));

        let session = Session::with_request_id("req-1");
        assert!(engine.is_open(&Context::new(), &session, "feature"));
        assert!(!session.statistics_enabled());

        engine.register_rule(SwitchModel::new(
            Engine::STATISTICS_SWITCH,
            1,
            RuleNode::leaf("stats", json!(true)),
        ));
        let session = Session::with_request_id("req-2");
        assert!(engine.is_open(&Context::new(), &session, "feature"));
        assert!(session.statistics_enabled());
        // The statistics switch's own factor stays out of the caller's records.
        let records = session.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "single");
    }

    #[test]
    fn statistics_switch_does_not_evaluate_itself_twice() {
        init();
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine(Arc::clone(&calls)).with_statistics_switch("stats");
        engine.register_rule(SwitchModel::new("stats", 1, RuleNode::leaf("single", json!(true))));

        let session = Session::new();
        assert!(engine.is_open(&Context::new(), &session, "stats"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!session.statistics_enabled());
    }

    #[test]
    fn middlewares_wrap_every_leaf() {
        init();
        let engine = engine(Arc::default());
        engine.register_rule(SwitchModel::new(
            "feature",
            1,
            RuleNode::and([
                RuleNode::leaf("a", json!(true)),
                RuleNode::leaf("b", json!(true)),
            ]),
        ));
        assert!(engine.is_open(&Context::new(), &Session::new(), "feature"));

        let wrapped = Arc::new(AtomicUsize::new(0));
        {
            let wrapped = Arc::clone(&wrapped);
            // Forces factor "b" closed.
            engine.with_middleware(move |next: Handler| -> Handler {
                let wrapped = Arc::clone(&wrapped);
                Arc::new(move |inv: &Invocation<'_>| {
                    wrapped.fetch_add(1, Ordering::SeqCst);
                    inv.node.factor != "b" && next(inv)
                })
            });
        }

        assert!(!engine.is_open(&Context::new(), &Session::new(), "feature"));
        assert_eq!(wrapped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cached_switches_reuse_factor_results_per_context() {
        init();
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine(Arc::clone(&calls));
        engine.register_rule(
            SwitchModel::new("cached", 1, RuleNode::leaf("single", json!(true))).with_cache(true),
        );

        let ctx = Context::new().use_cache();
        for _ in 0..5 {
            assert!(engine.is_open(&ctx, &Session::new(), "cached"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A context without the opt-in dispatches every time.
        assert!(engine.is_open(&Context::new(), &Session::new(), "cached"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn coalesces_identical_evaluations_across_contexts() {
        init();
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = slow_engine(Arc::clone(&calls), Duration::from_millis(200));
        engine.register_rule(
            SwitchModel::new("cached", 1, RuleNode::leaf("user_id", json!({"ids": [1]})))
                .with_cache(true),
        );

        const N: usize = 8;
        let barrier = Barrier::new(N);
        let results = std::thread::scope(|s| {
            let mut handles = Vec::new();
            for _ in 0..N {
                handles.push(s.spawn(|| {
                    let ctx = Context::new().use_cache();
                    barrier.wait();
                    engine.is_open(&ctx, &Session::new(), "cached")
                }));
            }
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|result| *result));

        // Contexts without the opt-in never coalesce.
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| engine.is_open(&Context::new(), &Session::new(), "cached"));
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn statistics_line_carries_the_evaluation() {
        init();
        let engine = engine(Arc::default());
        let model = SwitchModel::new(
            "feature",
            1,
            RuleNode::and([
                RuleNode::leaf("a", json!(true)),
                RuleNode::leaf("b", json!("on")),
            ]),
        );
        engine.register_rule(SwitchModel::new(
            Engine::STATISTICS_SWITCH,
            1,
            RuleNode::leaf("stats", json!(true)),
        ));

        let session = Session::with_request_id("req-7");
        assert!(!engine.is_switch_open(&Context::new(), &session, &model));
        assert!(session.statistics_enabled());

        let stats = Statistics::collect(&session, &model);
        assert_eq!(stats.request_id, "req-7");
        assert_eq!(stats.switch, "feature");
        assert!(!stats.result);
        assert!(stats.duration.ends_with("ms"));
        assert!(stats.factors.starts_with("[a("), "{}", stats.factors);
        assert!(stats.factors.contains("ms,true); b("), "{}", stats.factors);
        assert!(stats.factors.ends_with("ms,false)]"), "{}", stats.factors);
        assert_eq!(stats.errors.to_string(), "[b: b: config is not a bool]");
    }
}
