use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ast::CompareOp;

/// Whether the action deploys or undeploys the named filter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    Set,
    Delete,
}

impl ActionKind {
    /// The action that reverses this one, used by transient rules when the
    /// condition clears.
    pub fn inverse(&self) -> Self {
        match self {
            ActionKind::Set => ActionKind::Delete,
            ActionKind::Delete => ActionKind::Set,
        }
    }
}

/// Where the filter runs, when the rule pins it with `ON`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    Proxy,
    Object,
}

/// Optional `TO` clause narrowing the objects a filter applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObjectFilter {
    pub object_type: Option<String>,
    pub object_size: Option<(CompareOp, f64)>,
}

/// One parsed action clause, immutable after parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionSpec {
    pub kind: ActionKind,
    pub filter: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub object_filter: Option<ObjectFilter>,
}

impl ActionSpec {
    pub fn new(kind: ActionKind, filter: impl Into<String>) -> Self {
        Self {
            kind,
            filter: filter.into(),
            params: BTreeMap::new(),
            scope: None,
            object_filter: None,
        }
    }
}
