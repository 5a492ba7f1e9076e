use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DslError;

/// Comparison operator allowed in condition leaves and object-size filters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn parse(token: &str) -> Result<Self, DslError> {
        match token {
            "<" => Ok(CompareOp::Lt),
            "<=" => Ok(CompareOp::Le),
            ">" => Ok(CompareOp::Gt),
            ">=" => Ok(CompareOp::Ge),
            "==" => Ok(CompareOp::Eq),
            "!=" => Ok(CompareOp::Ne),
            other => Err(DslError::syntax(format!(
                "expected comparison operator, found '{}'",
                other
            ))),
        }
    }

    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean connective. AND binds tighter than OR.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoolOp {
    And,
    Or,
}

/// Immutable condition tree built once at parse time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionNode {
    Leaf {
        metric: String,
        op: CompareOp,
        threshold: f64,
    },
    Binary {
        op: BoolOp,
        left: Box<ConditionNode>,
        right: Box<ConditionNode>,
    },
}

impl ConditionNode {
    pub fn leaf(metric: impl Into<String>, op: CompareOp, threshold: f64) -> Self {
        ConditionNode::Leaf {
            metric: metric.into(),
            op,
            threshold,
        }
    }

    pub fn binary(op: BoolOp, left: ConditionNode, right: ConditionNode) -> Self {
        ConditionNode::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Every metric name referenced anywhere in the tree.
    pub fn referenced_metrics(&self) -> BTreeSet<String> {
        let mut metrics = BTreeSet::new();
        self.collect_metrics(&mut metrics);
        metrics
    }

    fn collect_metrics(&self, into: &mut BTreeSet<String>) {
        match self {
            ConditionNode::Leaf { metric, .. } => {
                into.insert(metric.clone());
            }
            ConditionNode::Binary { left, right, .. } => {
                left.collect_metrics(into);
                right.collect_metrics(into);
            }
        }
    }

    /// Strict recursive evaluation: both operands of a binary node are
    /// always evaluated, there is no short-circuit. Returns `None` when a
    /// referenced metric has not reported a value yet.
    pub fn evaluate(&self, observed: &HashMap<String, f64>) -> Option<bool> {
        match self {
            ConditionNode::Leaf {
                metric,
                op,
                threshold,
            } => observed.get(metric).map(|value| op.apply(*value, *threshold)),
            ConditionNode::Binary { op, left, right } => {
                let lhs = left.evaluate(observed);
                let rhs = right.evaluate(observed);
                match (lhs, rhs, op) {
                    (Some(l), Some(r), BoolOp::And) => Some(l && r),
                    (Some(l), Some(r), BoolOp::Or) => Some(l || r),
                    _ => None,
                }
            }
        }
    }
}
