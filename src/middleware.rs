//! Interceptors around factor dispatch.
use std::sync::Arc;

use crate::{
    dispatcher::FactorDispatcher, model::RuleNode, session::FactorRecorder, Context, SwitchModel,
};

/// Everything a [`Handler`] knows about the leaf being dispatched.
pub struct Invocation<'a> {
    /// The caller's context.
    pub context: &'a Context,
    /// The switch being evaluated.
    pub switch: &'a SwitchModel,
    /// The factor leaf.
    pub node: &'a RuleNode,
    /// Statistics entry of this leaf execution. Record faults here.
    pub stats: &'a FactorRecorder,
}

/// Dispatches one factor leaf and returns its result. Faults close the leaf (`false`).
pub type Handler = Arc<dyn Fn(&Invocation<'_>) -> bool + Send + Sync>;

/// Wraps a [`Handler`] into another [`Handler`].
///
/// A middleware may run code before and after the inner handler, or skip it altogether by
/// returning a result of its own.
///
/// Any `Fn(Handler) -> Handler` closure is a middleware:
///
/// ```
/// # use std::sync::Arc;
/// # use switch_sdk::{Handler, Invocation};
/// let log_leaves = |next: Handler| -> Handler {
///     Arc::new(move |inv: &Invocation<'_>| {
///         let result = next(inv);
///         println!("{} -> {}", inv.node.factor, result);
///         result
///     })
/// };
/// # let _ = log_leaves;
/// ```
pub trait Middleware: Send + Sync {
    /// Build the handler that runs around `next`.
    fn wrap(&self, next: Handler) -> Handler;
}

impl<T: Fn(Handler) -> Handler + Send + Sync> Middleware for T {
    fn wrap(&self, next: Handler) -> Handler {
        self(next)
    }
}

/// Ordered middlewares composed around a base handler.
///
/// The first registered middleware is the outermost one.
pub(crate) struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    base: Handler,
    handler: Handler,
}

impl Pipeline {
    pub fn new(base: Handler) -> Pipeline {
        Pipeline {
            middlewares: Vec::new(),
            handler: Arc::clone(&base),
            base,
        }
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
        self.handler = self
            .middlewares
            .iter()
            .rev()
            .fold(Arc::clone(&self.base), |next, middleware| {
                middleware.wrap(next)
            });
    }

    /// The composed handler.
    pub fn handler(&self) -> Handler {
        Arc::clone(&self.handler)
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }
}

/// The innermost handler: a direct call to `dispatcher`.
///
/// Dispatch errors are recorded on the leaf's statistics and close the leaf.
pub(crate) fn dispatch_handler(dispatcher: Arc<dyn FactorDispatcher>) -> Handler {
    Arc::new(move |inv: &Invocation<'_>| {
        match dispatcher.dispatch(inv.context, &inv.node.factor, &inv.node.config) {
            Ok(result) => result,
            Err(err) => {
                log::debug!(
                    target: "switch",
                    switch = inv.switch.name.as_str(),
                    factor = inv.node.factor.as_str(),
                    error:display = err;
                    "factor dispatch failed"
                );
                inv.stats.add_error(err.to_string());
                false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value};

    use super::{dispatch_handler, Handler, Invocation, Pipeline};
    use crate::{
        dispatcher::FactorError, model::RuleNode, session::FactorRecorder, Context, SwitchModel,
    };

    fn tracing(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> impl Fn(Handler) -> Handler {
        move |next: Handler| -> Handler {
            let trace = Arc::clone(&trace);
            Arc::new(move |inv: &Invocation<'_>| {
                trace.lock().unwrap().push(format!("{name}:before"));
                let result = next(inv);
                trace.lock().unwrap().push(format!("{name}:after"));
                result
            })
        }
    }

    fn invoke(handler: &Handler, node: &RuleNode, stats: &FactorRecorder) -> bool {
        let switch = SwitchModel::new("switch", 1, node.clone());
        handler(&Invocation {
            context: &Context::new(),
            switch: &switch,
            node,
            stats,
        })
    }

    #[test]
    fn first_registered_middleware_is_outermost() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let base: Handler = {
            let trace = Arc::clone(&trace);
            Arc::new(move |_: &Invocation<'_>| {
                trace.lock().unwrap().push("dispatch".to_owned());
                true
            })
        };

        let mut pipeline = Pipeline::new(base);
        pipeline.push(Arc::new(tracing("first", Arc::clone(&trace))));
        pipeline.push(Arc::new(tracing("second", Arc::clone(&trace))));
        assert_eq!(pipeline.len(), 2);

        let node = RuleNode::leaf("single", Value::Null);
        assert!(invoke(&pipeline.handler(), &node, &FactorRecorder::default()));
        assert_eq!(
            *trace.lock().unwrap(),
            [
                "first:before",
                "second:before",
                "dispatch",
                "second:after",
                "first:after"
            ]
        );
    }

    #[test]
    fn middleware_can_skip_inner_layers() {
        let base: Handler = Arc::new(|_: &Invocation<'_>| -> bool { panic!("must not be dispatched") });
        let mut pipeline = Pipeline::new(base);
        pipeline.push(Arc::new(|_next: Handler| -> Handler {
            Arc::new(|_: &Invocation<'_>| false)
        }));

        let node = RuleNode::leaf("single", Value::Null);
        assert!(!invoke(&pipeline.handler(), &node, &FactorRecorder::default()));
    }

    #[test]
    fn dispatch_errors_close_the_leaf() {
        let handler = dispatch_handler(Arc::new(
            |_: &Context, _: &str, _: &Value| -> Result<bool, FactorError> {
                Err(FactorError::failed("backend unavailable"))
            },
        ));

        let stats = FactorRecorder::default();
        let node = RuleNode::leaf("ip", json!({"cidr": "10.0.0.0/8"}));
        assert!(!invoke(&handler, &node, &stats));
        assert_eq!(
            stats.snapshot().error.iter().collect::<Vec<_>>(),
            ["backend unavailable"]
        );
    }
}
