//! Parsed filter expressions and their canonical text form.

use std::fmt;

use crate::schema::Field;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    Out,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::In => "=in=",
            Operator::Out => "=out=",
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le)
    }

    /// Whether the operator takes a value list.
    pub fn is_set(&self) -> bool {
        matches!(self, Operator::In | Operator::Out)
    }
}

/// A typed literal from the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Literal {
    /// Text as written; `*` is a wildcard under `==`, `!=` and set operators.
    Text(String),
    Number(u64),
    Bool(bool),
}

impl Literal {
    pub fn has_wildcard(&self) -> bool {
        matches!(self, Literal::Text(s) if s.contains('*'))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Number(n) => write!(f, "{n}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Text(s) if is_bare(s) => f.write_str(s),
            Literal::Text(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    if matches!(c, '"' | '\\') {
                        f.write_str("\\")?;
                    }
                    write!(f, "{c}")?;
                }
                f.write_str("\"")
            }
        }
    }
}

/// Text that re-lexes as one word without quoting.
fn is_bare(s: &str) -> bool {
    !s.is_empty()
        && !["and", "or", "not"].iter().any(|k| s.eq_ignore_ascii_case(k))
        && s.chars().all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '*' | ':' | '/' | '+' | '@'))
}

/// `field op value(s)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Comparison {
    pub field: Field,
    pub op: Operator,
    /// Exactly one value unless `op` is a set operator.
    pub values: Vec<Literal>,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.field, self.op.as_str())?;
        if self.op.is_set() {
            f.write_str("(")?;
            for (i, value) in self.values.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{value}")?;
            }
            f.write_str(")")
        } else {
            match self.values.first() {
                Some(value) => write!(f, "{value}"),
                None => Ok(()),
            }
        }
    }
}

/// A boolean filter expression.
///
/// Built through [`Predicate::and`], [`Predicate::or`] and
/// [`Predicate::not`], which flatten nested conjunctions and disjunctions so
/// equivalent groupings compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare(Comparison),
}

impl Predicate {
    pub fn compare(field: Field, op: Operator, values: Vec<Literal>) -> Self {
        Predicate::Compare(Comparison { field, op, values })
    }

    pub fn and(parts: Vec<Predicate>) -> Self {
        Self::flatten(parts, true)
    }

    pub fn or(parts: Vec<Predicate>) -> Self {
        Self::flatten(parts, false)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Predicate) -> Self {
        Predicate::Not(Box::new(inner))
    }

    fn flatten(parts: Vec<Predicate>, conjunction: bool) -> Self {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match (part, conjunction) {
                (Predicate::And(inner), true) | (Predicate::Or(inner), false) => flat.extend(inner),
                (other, _) => flat.push(other),
            }
        }
        if flat.len() == 1
            && let Some(only) = flat.pop()
        {
            return only;
        }
        if conjunction {
            Predicate::And(flat)
        } else {
            Predicate::Or(flat)
        }
    }

    /// Every comparison in the expression, depth-first.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Comparison>) {
        match self {
            Predicate::And(parts) | Predicate::Or(parts) => {
                parts.iter().for_each(|p| p.collect(out))
            }
            Predicate::Not(inner) => inner.collect(out),
            Predicate::Compare(c) => out.push(c),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare(c) => write!(f, "{c}"),
            Predicate::Not(inner) => match inner.as_ref() {
                Predicate::Compare(_) | Predicate::Not(_) => write!(f, "not {inner}"),
                _ => write!(f, "not ({inner})"),
            },
            Predicate::And(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    match part {
                        Predicate::Or(_) => write!(f, "({part})")?,
                        _ => write!(f, "{part}")?,
                    }
                }
                Ok(())
            }
            Predicate::Or(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{part}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(field: Field, value: &str) -> Predicate {
        Predicate::compare(field, Operator::Eq, vec![Literal::Text(value.into())])
    }

    #[test]
    fn nested_groups_flatten() {
        let a = eq(Field::Name, "a");
        let b = eq(Field::Name, "b");
        let c = eq(Field::Name, "c");

        let left = Predicate::and(vec![Predicate::and(vec![a.clone(), b.clone()]), c.clone()]);
        let right = Predicate::and(vec![a.clone(), Predicate::and(vec![b.clone(), c.clone()])]);
        assert_eq!(left, right);
        assert_eq!(left, Predicate::And(vec![a.clone(), b, c]));

        assert_eq!(Predicate::or(vec![a.clone()]), a);
    }

    #[test]
    fn canonical_form_parenthesizes_only_where_needed() {
        let p = Predicate::and(vec![
            Predicate::or(vec![eq(Field::Name, "a"), eq(Field::Name, "b")]),
            Predicate::not(eq(Field::UpdateStatus, "ERROR")),
        ]);
        assert_eq!(p.to_string(), "(name==a,name==b);not updateStatus==ERROR");
    }

    #[test]
    fn literals_quote_when_needed() {
        assert_eq!(Literal::Text("dev-*".into()).to_string(), "dev-*");
        assert_eq!(Literal::Text("two words".into()).to_string(), "\"two words\"");
        assert_eq!(Literal::Text("or".into()).to_string(), "\"or\"");
        assert_eq!(Literal::Text("a\"b".into()).to_string(), r#""a\"b""#);
        assert_eq!(Literal::Text(String::new()).to_string(), "\"\"");
    }

    #[test]
    fn set_operators_render_lists() {
        let p = Predicate::compare(
            Field::AssignedDs,
            Operator::Out,
            vec![Literal::Number(1), Literal::Number(2)],
        );
        assert_eq!(p.to_string(), "assignedDs=out=(1,2)");
    }
}
