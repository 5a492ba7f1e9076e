use std::collections::{BTreeSet, HashMap};

use weir_dsl::ConditionNode;

/// Direction of a truth-value transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// Pure condition-tracking state machine for one rule instance.
///
/// Holds the last observed value per referenced metric and the last
/// truth value the rule acted on. Evaluation only begins once every
/// referenced metric has reported at least one value; before that,
/// [`RuleState::update`] never reports an edge.
///
/// `update` does not advance `last_fired` itself: the caller confirms the
/// transition with [`RuleState::confirm`] only after the action dispatch
/// succeeded, so a failed dispatch is retried on the next qualifying edge.
#[derive(Debug, Clone)]
pub struct RuleState {
    condition: ConditionNode,
    referenced: BTreeSet<String>,
    observed: HashMap<String, f64>,
    last_fired: bool,
}

impl RuleState {
    pub fn new(condition: ConditionNode) -> Self {
        let referenced = condition.referenced_metrics();
        Self {
            condition,
            referenced,
            observed: HashMap::new(),
            last_fired: false,
        }
    }

    pub fn referenced_metrics(&self) -> &BTreeSet<String> {
        &self.referenced
    }

    pub fn last_fired(&self) -> bool {
        self.last_fired
    }

    /// Whether every referenced metric has reported at least one value.
    pub fn has_all_metrics(&self) -> bool {
        self.referenced
            .iter()
            .all(|metric| self.observed.contains_key(metric))
    }

    /// Stores the new value and evaluates the tree. Returns the edge when
    /// the new truth value differs from the last confirmed one.
    pub fn update(&mut self, metric: &str, value: f64) -> Option<Edge> {
        if !self.referenced.contains(metric) {
            return None;
        }
        self.observed.insert(metric.to_string(), value);

        let result = self.condition.evaluate(&self.observed)?;
        if result == self.last_fired {
            return None;
        }
        Some(if result { Edge::Rising } else { Edge::Falling })
    }

    /// Records that the action for the given truth value was applied.
    pub fn confirm(&mut self, fired: bool) {
        self.last_fired = fired;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_dsl::{BoolOp, CompareOp};

    fn state() -> RuleState {
        // get_ops > 10 AND put_ops < 5
        RuleState::new(ConditionNode::binary(
            BoolOp::And,
            ConditionNode::leaf("get_ops", CompareOp::Gt, 10.0),
            ConditionNode::leaf("put_ops", CompareOp::Lt, 5.0),
        ))
    }

    #[test]
    fn no_edge_until_all_metrics_reported() {
        let mut state = state();
        assert_eq!(state.update("get_ops", 100.0), None);
        assert!(!state.has_all_metrics());
        assert_eq!(state.update("put_ops", 1.0), Some(Edge::Rising));
    }

    #[test]
    fn unreferenced_metrics_are_ignored() {
        let mut state = state();
        assert_eq!(state.update("slowdown", 3.0), None);
        assert!(state.observed.is_empty());
    }

    #[test]
    fn unconfirmed_edges_repeat() {
        let mut state = state();
        state.update("get_ops", 100.0);
        assert_eq!(state.update("put_ops", 1.0), Some(Edge::Rising));
        // The dispatch failed: last_fired was not confirmed, so the same
        // truth value reports the edge again.
        assert_eq!(state.update("put_ops", 2.0), Some(Edge::Rising));

        state.confirm(true);
        assert_eq!(state.update("put_ops", 3.0), None);
        assert_eq!(state.update("get_ops", 5.0), Some(Edge::Falling));
    }

    #[test]
    fn toggles_on_each_confirmed_flip() {
        let mut state = state();
        state.update("put_ops", 0.0);

        assert_eq!(state.update("get_ops", 20.0), Some(Edge::Rising));
        state.confirm(true);
        assert_eq!(state.update("get_ops", 5.0), Some(Edge::Falling));
        state.confirm(false);
        assert_eq!(state.update("get_ops", 30.0), Some(Edge::Rising));
    }
}
