//! Rule language for the weir control plane.
//!
//! Operators express policies as one-line rules:
//!
//! ```text
//! FOR TENANT:1234 WHEN get_ops > 100 DO SET compression WITH level=5 TRANSIENT
//! ```
//!
//! This crate parses that text into an immutable template: a target list, an
//! optional boolean condition tree over named metrics, an ordered action
//! list and an optional object filter. Metric names, filter parameters and
//! tenant groups are validated against the live catalog at parse time.

mod action;
mod ast;
mod error;
mod parser;
mod target;
mod template;

pub use action::{ActionKind, ActionSpec, ObjectFilter, Scope};
pub use ast::{BoolOp, CompareOp, ConditionNode};
pub use error::DslError;
pub use parser::RuleParser;
pub use target::Target;
pub use template::RuleTemplate;
