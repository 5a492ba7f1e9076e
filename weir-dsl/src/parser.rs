use std::collections::BTreeMap;
use std::collections::HashSet;

use weir_core::catalog::Catalog;

use crate::action::{ActionKind, ActionSpec, ObjectFilter, Scope};
use crate::ast::{BoolOp, CompareOp, ConditionNode};
use crate::error::DslError;
use crate::target::Target;
use crate::template::RuleTemplate;

/// Grammar, informally:
///
/// ```text
/// rule        := "FOR" target_list ["WHEN" condition] "DO" action_list
///                ["TO" object_filter] ["TRANSIENT"]
/// target_list := target {"," target}
/// target      := "TENANT:" id | "CONTAINER:" id "/" id
///              | "OBJECT:" id "/" id "/" id | "G:" group
/// condition   := conjunction {"OR" condition}
/// conjunction := leaf {"AND" conjunction}
/// leaf        := metric op number
/// action      := ("SET"|"DELETE") filter ["WITH" param {"," param}]
///                ["ON" ("PROXY"|"OBJECT")]
/// ```
///
/// `AND` binds tighter than `OR`; both associate to the right.
pub struct RuleParser {
    catalog: Catalog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Comma,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for raw in text.split_whitespace() {
        let mut word = String::new();
        for c in raw.chars() {
            if c == ',' {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
                tokens.push(Token::Comma);
            } else {
                word.push(c);
            }
        }
        if !word.is_empty() {
            tokens.push(Token::Word(word));
        }
    }
    tokens
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_word(&self) -> Option<&str> {
        match self.tokens.get(self.pos) {
            Some(Token::Word(word)) => Some(word.as_str()),
            _ => None,
        }
    }

    /// Word after a comma, without consuming anything.
    fn word_after_comma(&self) -> Option<&str> {
        match (self.tokens.get(self.pos), self.tokens.get(self.pos + 1)) {
            (Some(Token::Comma), Some(Token::Word(word))) => Some(word.as_str()),
            _ => None,
        }
    }

    fn next_word(&mut self, expected: &str) -> Result<String, DslError> {
        match self.tokens.get(self.pos) {
            Some(Token::Word(word)) => {
                self.pos += 1;
                Ok(word.clone())
            }
            Some(Token::Comma) => Err(DslError::syntax(format!(
                "expected {}, found ','",
                expected
            ))),
            None => Err(DslError::syntax(format!(
                "expected {}, found end of rule",
                expected
            ))),
        }
    }

    fn eat_comma(&mut self) {
        if matches!(self.peek(), Some(Token::Comma)) {
            self.pos += 1;
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_word() == Some(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), DslError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(DslError::syntax(format!(
                "expected '{}', found {}",
                keyword,
                self.describe_current()
            )))
        }
    }

    fn describe_current(&self) -> String {
        match self.peek() {
            Some(Token::Word(word)) => format!("'{}'", word),
            Some(Token::Comma) => "','".to_string(),
            None => "end of rule".to_string(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

impl RuleParser {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// Parses a rule text into an activation-ready template. Group targets
    /// are expanded against the catalog; metric names and `WITH` parameters
    /// are validated against the live catalogs.
    pub fn parse(&self, text: &str) -> Result<RuleTemplate, DslError> {
        let mut cursor = Cursor {
            tokens: tokenize(text),
            pos: 0,
        };

        cursor.expect_keyword("FOR")?;
        let targets = self.parse_targets(&mut cursor)?;

        let condition = if cursor.eat_keyword("WHEN") {
            Some(self.parse_condition(&mut cursor)?)
        } else {
            None
        };

        cursor.expect_keyword("DO")?;
        let mut actions = self.parse_actions(&mut cursor)?;

        let object_filter = if cursor.eat_keyword("TO") {
            Some(self.parse_object_filter(&mut cursor)?)
        } else {
            None
        };

        let transient = cursor.eat_keyword("TRANSIENT");

        if !cursor.at_end() {
            return Err(DslError::syntax(format!(
                "unexpected trailing input: {}",
                cursor.describe_current()
            )));
        }

        if let Some(filter) = &object_filter {
            for action in &mut actions {
                action.object_filter = Some(filter.clone());
            }
        }

        Ok(RuleTemplate {
            targets,
            condition,
            actions,
            object_filter,
            transient,
        })
    }

    fn parse_targets(&self, cursor: &mut Cursor) -> Result<Vec<Target>, DslError> {
        let mut targets = Vec::new();
        let mut seen: HashSet<Target> = HashSet::new();

        loop {
            let word = cursor.next_word("a target")?;
            for target in self.resolve_target(&word)? {
                if seen.insert(target.clone()) {
                    targets.push(target);
                }
            }
            if cursor.word_after_comma().is_some() {
                cursor.eat_comma();
            } else {
                break;
            }
        }

        if targets.is_empty() {
            return Err(DslError::syntax("rule has no targets"));
        }
        Ok(targets)
    }

    fn resolve_target(&self, word: &str) -> Result<Vec<Target>, DslError> {
        if let Some(id) = word.strip_prefix("TENANT:") {
            if id.is_empty() {
                return Err(DslError::syntax("empty tenant id"));
            }
            return Ok(vec![Target::tenant(id)]);
        }
        if let Some(rest) = word.strip_prefix("CONTAINER:") {
            let parts: Vec<&str> = rest.split('/').collect();
            return match parts.as_slice() {
                [tenant, container] if !tenant.is_empty() && !container.is_empty() => {
                    Ok(vec![Target::Container {
                        tenant: tenant.to_string(),
                        container: container.to_string(),
                    }])
                }
                _ => Err(DslError::syntax(format!(
                    "container target must be CONTAINER:tenant/container, found '{}'",
                    word
                ))),
            };
        }
        if let Some(rest) = word.strip_prefix("OBJECT:") {
            let parts: Vec<&str> = rest.split('/').collect();
            return match parts.as_slice() {
                [tenant, container, object]
                    if !tenant.is_empty() && !container.is_empty() && !object.is_empty() =>
                {
                    Ok(vec![Target::Object {
                        tenant: tenant.to_string(),
                        container: container.to_string(),
                        object: object.to_string(),
                    }])
                }
                _ => Err(DslError::syntax(format!(
                    "object target must be OBJECT:tenant/container/object, found '{}'",
                    word
                ))),
            };
        }
        if let Some(group) = word.strip_prefix("G:") {
            let members = self
                .catalog
                .group(group)
                .ok_or_else(|| DslError::UnknownGroup(group.to_string()))?;
            return Ok(members.into_iter().map(Target::tenant).collect());
        }
        Err(DslError::syntax(format!(
            "unknown target prefix in '{}'",
            word
        )))
    }

    fn parse_condition(&self, cursor: &mut Cursor) -> Result<ConditionNode, DslError> {
        let left = self.parse_conjunction(cursor)?;
        if cursor.eat_keyword("OR") {
            let right = self.parse_condition(cursor)?;
            Ok(ConditionNode::binary(BoolOp::Or, left, right))
        } else {
            Ok(left)
        }
    }

    fn parse_conjunction(&self, cursor: &mut Cursor) -> Result<ConditionNode, DslError> {
        let left = self.parse_leaf(cursor)?;
        if cursor.eat_keyword("AND") {
            let right = self.parse_conjunction(cursor)?;
            Ok(ConditionNode::binary(BoolOp::And, left, right))
        } else {
            Ok(left)
        }
    }

    fn parse_leaf(&self, cursor: &mut Cursor) -> Result<ConditionNode, DslError> {
        let metric = cursor.next_word("a metric name")?;
        if !self.catalog.has_metric(&metric) {
            return Err(DslError::UnknownMetric(metric));
        }
        let op = CompareOp::parse(&cursor.next_word("a comparison operator")?)?;
        let raw = cursor.next_word("a numeric threshold")?;
        let threshold: f64 = raw
            .parse()
            .map_err(|_| DslError::syntax(format!("invalid threshold '{}'", raw)))?;
        Ok(ConditionNode::leaf(metric, op, threshold))
    }

    fn parse_actions(&self, cursor: &mut Cursor) -> Result<Vec<ActionSpec>, DslError> {
        let mut actions = vec![self.parse_action(cursor)?];
        while matches!(cursor.word_after_comma(), Some("SET" | "DELETE")) {
            cursor.eat_comma();
            actions.push(self.parse_action(cursor)?);
        }
        Ok(actions)
    }

    fn parse_action(&self, cursor: &mut Cursor) -> Result<ActionSpec, DslError> {
        let kind = match cursor.next_word("SET or DELETE")?.as_str() {
            "SET" => ActionKind::Set,
            "DELETE" => ActionKind::Delete,
            other => {
                return Err(DslError::syntax(format!(
                    "expected SET or DELETE, found '{}'",
                    other
                )))
            }
        };

        let filter_name = cursor.next_word("a filter name")?;
        let filter = self
            .catalog
            .filter(&filter_name)
            .ok_or_else(|| DslError::UnknownFilter(filter_name.clone()))?;

        let mut action = ActionSpec::new(kind, filter_name.clone());

        if cursor.eat_keyword("WITH") {
            action.params = self.parse_params(cursor, &filter_name, &filter.valid_parameters)?;
        }

        if cursor.eat_keyword("ON") {
            action.scope = Some(match cursor.next_word("PROXY or OBJECT")?.as_str() {
                "PROXY" => Scope::Proxy,
                "OBJECT" => Scope::Object,
                other => {
                    return Err(DslError::syntax(format!(
                        "expected PROXY or OBJECT, found '{}'",
                        other
                    )))
                }
            });
        }

        Ok(action)
    }

    fn parse_params(
        &self,
        cursor: &mut Cursor,
        filter: &str,
        schema: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, DslError> {
        let mut params = BTreeMap::new();
        loop {
            let raw = cursor.next_word("a key=value parameter")?;
            let (key, value) = raw.split_once('=').ok_or_else(|| {
                DslError::syntax(format!("parameter '{}' is not of the form key=value", raw))
            })?;
            if !schema.contains_key(key) {
                return Err(DslError::UnknownActionParam {
                    filter: filter.to_string(),
                    param: key.to_string(),
                });
            }
            params.insert(key.to_string(), value.to_string());

            // Another parameter only when the word after the comma carries
            // '='; otherwise the comma starts the next action.
            match cursor.word_after_comma() {
                Some(word) if word.contains('=') => cursor.eat_comma(),
                _ => break,
            }
        }
        Ok(params)
    }

    fn parse_object_filter(&self, cursor: &mut Cursor) -> Result<ObjectFilter, DslError> {
        let mut filter = ObjectFilter::default();
        loop {
            let word = cursor.next_word("an object filter")?;
            if let Some(value) = word.strip_prefix("OBJECT_TYPE=") {
                if value.is_empty() {
                    return Err(DslError::syntax("empty OBJECT_TYPE value"));
                }
                filter.object_type = Some(value.to_string());
            } else if word == "OBJECT_SIZE" {
                let op = CompareOp::parse(&cursor.next_word("a comparison operator")?)?;
                let raw = cursor.next_word("an object size")?;
                let size: f64 = raw
                    .parse()
                    .map_err(|_| DslError::syntax(format!("invalid object size '{}'", raw)))?;
                filter.object_size = Some((op, size));
            } else {
                return Err(DslError::syntax(format!(
                    "expected OBJECT_TYPE= or OBJECT_SIZE, found '{}'",
                    word
                )));
            }

            match cursor.word_after_comma() {
                Some(word) if word.starts_with("OBJECT_TYPE=") || word == "OBJECT_SIZE" => {
                    cursor.eat_comma();
                }
                _ => break,
            }
        }
        Ok(filter)
    }
}
