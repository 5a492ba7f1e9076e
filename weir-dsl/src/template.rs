use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::action::{ActionSpec, ObjectFilter};
use crate::ast::ConditionNode;
use crate::target::Target;

/// Parsed form of one rule text: everything the engine needs to activate a
/// rule per target. Immutable after parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleTemplate {
    pub targets: Vec<Target>,
    pub condition: Option<ConditionNode>,
    pub actions: Vec<ActionSpec>,
    pub object_filter: Option<ObjectFilter>,
    pub transient: bool,
}

impl RuleTemplate {
    /// Whether the rule is guarded by a `WHEN` clause. Unconditioned rules
    /// fire their actions immediately on activation.
    pub fn has_condition(&self) -> bool {
        self.condition.is_some()
    }

    /// Metric names the rule must subscribe to before it can evaluate.
    pub fn referenced_metrics(&self) -> BTreeSet<String> {
        self.condition
            .as_ref()
            .map(ConditionNode::referenced_metrics)
            .unwrap_or_default()
    }
}
