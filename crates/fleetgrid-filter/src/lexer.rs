//! Tokenizer for filter expressions.

use crate::error::{FilterError, FilterResult};
use crate::predicate::Operator;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    LParen,
    RParen,
    Comma,
    Semicolon,
    Op(Operator),
    /// Unquoted run of characters. Keywords (`and`, `or`, `not`) arrive as
    /// words and are recognized by the parser from context.
    Word(String),
    Quoted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

impl Token {
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Word(w) if w.eq_ignore_ascii_case(keyword))
    }
}

/// Named operators, matched case-insensitively after the leading `=`.
const NAMED_OPERATORS: [(&str, Operator); 6] = [
    ("=in=", Operator::In),
    ("=out=", Operator::Out),
    ("=gt=", Operator::Gt),
    ("=lt=", Operator::Lt),
    ("=ge=", Operator::Ge),
    ("=le=", Operator::Le),
];

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | ',' | ';' | '\'' | '"' | '=' | '!' | '<' | '>')
}

pub(crate) fn tokenize(input: &str) -> FilterResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(position, c)) = chars.peek() {
        let single = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            ',' => Some(TokenKind::Comma),
            ';' => Some(TokenKind::Semicolon),
            _ => None,
        };
        if let Some(kind) = single {
            chars.next();
            tokens.push(Token { kind, position });
            continue;
        }

        let rest = &input[position..];
        let kind = match c {
            '\'' | '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        ch if ch == c => {
                            closed = true;
                            break;
                        }
                        ch => value.push(ch),
                    }
                }
                if !closed {
                    return Err(FilterError::syntax(position, "unterminated quoted value"));
                }
                TokenKind::Quoted(value)
            }
            '=' | '!' | '<' | '>' => {
                let (op, len) = operator_at(rest)
                    .ok_or_else(|| FilterError::syntax(position, "unknown operator"))?;
                for _ in 0..len {
                    chars.next();
                }
                TokenKind::Op(op)
            }
            _ => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if !is_word_char(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                TokenKind::Word(word)
            }
        };
        tokens.push(Token { kind, position });
    }

    Ok(tokens)
}

/// Operator at the start of `s` and its length in chars (all ASCII).
fn operator_at(s: &str) -> Option<(Operator, usize)> {
    for (text, op) in NAMED_OPERATORS {
        if s.len() >= text.len() && s.is_char_boundary(text.len()) && s[..text.len()].eq_ignore_ascii_case(text) {
            return Some((op, text.len()));
        }
    }
    let symbolic = [
        ("==", Operator::Eq),
        ("!=", Operator::Ne),
        (">=", Operator::Ge),
        ("<=", Operator::Le),
        (">", Operator::Gt),
        ("<", Operator::Lt),
    ];
    symbolic
        .into_iter()
        .find(|(text, _)| s.starts_with(text))
        .map(|(text, op)| (op, text.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn simple_comparison() {
        assert_eq!(
            kinds("name==dev*"),
            vec![
                TokenKind::Word("name".into()),
                TokenKind::Op(Operator::Eq),
                TokenKind::Word("dev*".into()),
            ]
        );
    }

    #[test]
    fn named_operators_ignore_case() {
        assert_eq!(kinds("a=IN=b")[1], TokenKind::Op(Operator::In));
        assert_eq!(kinds("a=ge=1")[1], TokenKind::Op(Operator::Ge));
        assert_eq!(kinds("a>=1")[1], TokenKind::Op(Operator::Ge));
    }

    #[test]
    fn quoted_values_keep_spaces_and_escapes() {
        assert_eq!(
            kinds(r#"description=="a \"b\" c""#)[2],
            TokenKind::Quoted(r#"a "b" c"#.into())
        );
        assert_eq!(kinds("name=='x;y'")[2], TokenKind::Quoted("x;y".into()));
    }

    #[test]
    fn positions_are_byte_offsets() {
        let tokens = tokenize("a==1 and b!=2").unwrap();
        let positions: Vec<_> = tokens.iter().map(|t| t.position).collect();
        assert_eq!(positions, [0, 1, 3, 5, 9, 10, 12]);
    }

    #[test]
    fn unterminated_quote_is_a_syntax_error() {
        let err = tokenize("name=='abc").unwrap_err();
        assert!(matches!(err, FilterError::Syntax { position: 6, .. }));
    }

    #[test]
    fn unknown_operator_is_a_syntax_error() {
        assert!(matches!(
            tokenize("name=~x"),
            Err(FilterError::Syntax { position: 4, .. })
        ));
    }
}
