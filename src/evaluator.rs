use crate::{
    middleware::{Handler, Invocation},
    model::{NodeType, RuleNode},
    session::{Session, Timer},
    Context, SwitchModel,
};

/// Walks a rule tree, sending every reached leaf through the middleware pipeline.
///
/// Logical nodes evaluate their children left to right and stop at the first child that decides
/// the result. A logical node without children is `true`, for `OR` as well as `AND`.
pub(crate) struct RuleEvaluator {
    handler: Handler,
}

impl RuleEvaluator {
    pub fn new(handler: Handler) -> RuleEvaluator {
        RuleEvaluator { handler }
    }

    pub fn evaluate(
        &self,
        ctx: &Context,
        session: &Session,
        switch: &SwitchModel,
        node: &RuleNode,
    ) -> bool {
        match node.node_type {
            NodeType::And => node
                .children
                .iter()
                .all(|child| self.evaluate(ctx, session, switch, child)),
            NodeType::Or => {
                node.children.is_empty()
                    || node
                        .children
                        .iter()
                        .any(|child| self.evaluate(ctx, session, switch, child))
            }
            NodeType::Leaf => self.evaluate_leaf(ctx, session, switch, node),
        }
    }

    fn evaluate_leaf(
        &self,
        ctx: &Context,
        session: &Session,
        switch: &SwitchModel,
        node: &RuleNode,
    ) -> bool {
        if node.factor.is_empty() {
            session.add_error(format!(
                "switch {}: rule node {} has no factor",
                switch.name, node.id
            ));
            return false;
        }

        let timer = Timer::start();
        let stats = session.begin_factor(&node.factor);
        let result = (self.handler)(&Invocation {
            context: ctx,
            switch,
            node,
            stats: &stats,
        });
        stats.finish(result, timer.elapsed());
        result
    }
}
