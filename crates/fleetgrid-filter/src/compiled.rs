//! Predicates prepared for repeated evaluation.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};

use crate::error::{FilterError, FilterResult};
use crate::predicate::{Comparison, Literal, Operator, Predicate};
use crate::schema::{Field, FieldValue, Filterable};

/// A predicate with wildcard patterns compiled to regexes.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    root: Node,
}

#[derive(Debug, Clone)]
enum Node {
    All(Vec<Node>),
    Any(Vec<Node>),
    Not(Box<Node>),
    Test { field: Field, op: Operator, matchers: Vec<Matcher> },
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Lower-cased text, compared case-insensitively.
    Text(String),
    Pattern(Regex),
    Number(u64),
    Bool(bool),
}

impl Predicate {
    pub fn compile(&self) -> FilterResult<CompiledFilter> {
        Ok(CompiledFilter {
            root: compile_node(self)?,
        })
    }
}

fn compile_node(predicate: &Predicate) -> FilterResult<Node> {
    Ok(match predicate {
        Predicate::And(parts) => Node::All(parts.iter().map(compile_node).collect::<FilterResult<_>>()?),
        Predicate::Or(parts) => Node::Any(parts.iter().map(compile_node).collect::<FilterResult<_>>()?),
        Predicate::Not(inner) => Node::Not(Box::new(compile_node(inner)?)),
        Predicate::Compare(c) => compile_comparison(c)?,
    })
}

fn compile_comparison(c: &Comparison) -> FilterResult<Node> {
    let matchers = c
        .values
        .iter()
        .map(|value| match value {
            Literal::Text(s) if !c.op.is_ordering() && s.contains('*') => {
                wildcard_regex(s).map(Matcher::Pattern).map_err(|e| FilterError::InvalidValue {
                    field: c.field.to_string(),
                    value: s.clone(),
                    reason: e.to_string(),
                })
            }
            Literal::Text(s) => Ok(Matcher::Text(s.to_lowercase())),
            Literal::Number(n) => Ok(Matcher::Number(*n)),
            Literal::Bool(b) => Ok(Matcher::Bool(*b)),
        })
        .collect::<FilterResult<_>>()?;
    Ok(Node::Test {
        field: c.field.clone(),
        op: c.op,
        matchers,
    })
}

/// `*` becomes `.*`; everything else is literal. Anchored, case-insensitive.
fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&format!("^{body}$"))
        .case_insensitive(true)
        .build()
}

impl CompiledFilter {
    pub fn matches<T: Filterable>(&self, item: &T) -> bool {
        eval(&self.root, item)
    }
}

fn eval<T: Filterable>(node: &Node, item: &T) -> bool {
    match node {
        Node::All(parts) => parts.iter().all(|p| eval(p, item)),
        Node::Any(parts) => parts.iter().any(|p| eval(p, item)),
        Node::Not(inner) => !eval(inner, item),
        Node::Test { field, op, matchers } => {
            let Some(value) = item.field_value(field) else {
                // Missing values only satisfy negative comparisons.
                return matches!(op, Operator::Ne | Operator::Out);
            };
            match op {
                Operator::Eq | Operator::In => matchers.iter().any(|m| equals(m, &value)),
                Operator::Ne | Operator::Out => !matchers.iter().any(|m| equals(m, &value)),
                Operator::Gt => compare(matchers, &value) == Some(Ordering::Greater),
                Operator::Lt => compare(matchers, &value) == Some(Ordering::Less),
                Operator::Ge => matches!(compare(matchers, &value), Some(Ordering::Greater | Ordering::Equal)),
                Operator::Le => matches!(compare(matchers, &value), Some(Ordering::Less | Ordering::Equal)),
            }
        }
    }
}

fn equals(matcher: &Matcher, value: &FieldValue<'_>) -> bool {
    match (matcher, value) {
        (Matcher::Text(expected), FieldValue::Text(actual)) => actual.to_lowercase() == *expected,
        (Matcher::Pattern(re), FieldValue::Text(actual)) => re.is_match(actual),
        (Matcher::Number(expected), FieldValue::Number(actual)) => actual == expected,
        (Matcher::Bool(expected), FieldValue::Bool(actual)) => actual == expected,
        _ => false,
    }
}

/// Ordering of `value` relative to the single operand.
fn compare(matchers: &[Matcher], value: &FieldValue<'_>) -> Option<Ordering> {
    match (matchers.first()?, value) {
        (Matcher::Text(operand), FieldValue::Text(actual)) => Some(actual.to_lowercase().as_str().cmp(operand.as_str())),
        (Matcher::Number(operand), FieldValue::Number(actual)) => Some(actual.cmp(operand)),
        _ => None,
    }
}
