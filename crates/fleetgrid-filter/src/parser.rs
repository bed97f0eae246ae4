//! Recursive-descent parser producing a [`Predicate`].

use crate::error::{FilterError, FilterResult};
use crate::lexer::{Token, TokenKind, tokenize};
use crate::predicate::{Literal, Operator, Predicate};
use crate::schema::{Field, Schema, ValueType};

/// Deepest accepted nesting of parentheses and `not`.
pub const MAX_NESTING: usize = 64;

/// Parse `input` against `schema`.
pub fn parse(input: &str, schema: Schema) -> FilterResult<Predicate> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
        depth: 0,
        schema,
    };
    if parser.tokens.is_empty() {
        return Err(FilterError::syntax(0, "empty expression"));
    }
    let predicate = parser.or()?;
    if let Some(token) = parser.peek() {
        return Err(FilterError::syntax(token.position, "unexpected trailing input"));
    }
    Ok(predicate)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    depth: usize,
    schema: Schema,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    /// Offset for errors at the current token (or end of input).
    fn here(&self) -> usize {
        self.peek().map_or(self.end, |t| t.position)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> FilterResult<()> {
        match self.next() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(FilterError::syntax(token.position, format!("expected {what}"))),
            None => Err(FilterError::syntax(self.end, format!("expected {what}"))),
        }
    }

    /// Run `f` one nesting level deeper, refusing to exceed [`MAX_NESTING`].
    fn nested(
        &mut self,
        position: usize,
        f: impl FnOnce(&mut Self) -> FilterResult<Predicate>,
    ) -> FilterResult<Predicate> {
        if self.depth >= MAX_NESTING {
            return Err(FilterError::syntax(
                position,
                format!("expression nested deeper than {MAX_NESTING} levels"),
            ));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn or(&mut self) -> FilterResult<Predicate> {
        let mut parts = vec![self.and()?];
        while let Some(token) = self.peek() {
            if token.kind == TokenKind::Comma || token.is_keyword("or") {
                self.pos += 1;
                parts.push(self.and()?);
            } else {
                break;
            }
        }
        Ok(Predicate::or(parts))
    }

    fn and(&mut self) -> FilterResult<Predicate> {
        let mut parts = vec![self.unary()?];
        while let Some(token) = self.peek() {
            if token.kind == TokenKind::Semicolon || token.is_keyword("and") {
                self.pos += 1;
                parts.push(self.unary()?);
            } else {
                break;
            }
        }
        Ok(Predicate::and(parts))
    }

    fn unary(&mut self) -> FilterResult<Predicate> {
        if self.peek().is_some_and(|t| t.is_keyword("not")) {
            let position = self.here();
            self.pos += 1;
            return self.nested(position, |p| Ok(Predicate::not(p.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> FilterResult<Predicate> {
        if self.peek().is_some_and(|t| t.kind == TokenKind::LParen) {
            let position = self.here();
            self.pos += 1;
            return self.nested(position, |p| {
                let inner = p.or()?;
                p.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> FilterResult<Predicate> {
        let position = self.here();
        let name = match self.next() {
            Some(Token {
                kind: TokenKind::Word(word),
                ..
            }) => word,
            _ => return Err(FilterError::syntax(position, "expected field name")),
        };
        let field = self
            .schema
            .resolve(&name)
            .ok_or_else(|| FilterError::UnsupportedField { field: name.clone() })?;

        let op_position = self.here();
        let op = match self.next() {
            Some(Token {
                kind: TokenKind::Op(op),
                ..
            }) => op,
            _ => return Err(FilterError::syntax(op_position, "expected comparison operator")),
        };

        let raw = if op.is_set() && self.peek().is_some_and(|t| t.kind == TokenKind::LParen) {
            self.pos += 1;
            let mut values = vec![self.value()?];
            while self.peek().is_some_and(|t| t.kind == TokenKind::Comma) {
                self.pos += 1;
                values.push(self.value()?);
            }
            self.expect(TokenKind::RParen, "')' closing value list")?;
            values
        } else {
            vec![self.value()?]
        };

        let values = raw
            .into_iter()
            .map(|v| self.typed(&field, op, v))
            .collect::<FilterResult<Vec<_>>>()?;
        Ok(Predicate::compare(field, op, values))
    }

    fn value(&mut self) -> FilterResult<String> {
        let position = self.here();
        match self.next() {
            Some(Token {
                kind: TokenKind::Word(w) | TokenKind::Quoted(w),
                ..
            }) => Ok(w),
            _ => Err(FilterError::syntax(position, "expected value")),
        }
    }

    /// Type a raw value for `field`.
    fn typed(&self, field: &Field, op: Operator, raw: String) -> FilterResult<Literal> {
        let invalid = |reason: &str| FilterError::InvalidValue {
            field: field.to_string(),
            value: raw.clone(),
            reason: reason.to_string(),
        };

        match self.schema.value_type(field) {
            ValueType::Text => {
                if op.is_ordering() && raw.contains('*') {
                    return Err(invalid("wildcards are only allowed in equality comparisons"));
                }
                Ok(Literal::Text(raw))
            }
            ValueType::Number => raw
                .parse()
                .map(Literal::Number)
                .map_err(|_| invalid("expected a non-negative integer")),
            ValueType::Bool => {
                if op.is_ordering() {
                    return Err(invalid("booleans cannot be ordered"));
                }
                match raw.to_ascii_lowercase().as_str() {
                    "true" => Ok(Literal::Bool(true)),
                    "false" => Ok(Literal::Bool(false)),
                    _ => Err(invalid("expected true or false")),
                }
            }
            ValueType::Enum(allowed) => {
                if op.is_ordering() {
                    return Err(invalid("status values cannot be ordered"));
                }
                let upper = raw.to_ascii_uppercase();
                if raw.contains('*') || allowed.iter().any(|a| *a == upper) {
                    Ok(Literal::Text(upper))
                } else {
                    Err(invalid(&format!("expected one of {}", allowed.join(", "))))
                }
            }
        }
    }
}
