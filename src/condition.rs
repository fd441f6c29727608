//! Boolean guard expressions.
//!
//! Guards are parsed once into a [`Condition`] tree and then evaluated
//! against any [`Lookup`] scope. Supported forms:
//!
//! - truthiness: `vip`, `{vip}`, `client.active`
//! - equality: `tier == 'gold'`, `{status} != "closed"`
//! - numeric comparison: `budget > 5000`, `score <= 3.5`
//! - length: `items.length > 0`
//! - contains: `tags.includes('beach')`
//! - combinators: `!a`, `a && b`, `a || b`, parentheses
//!
//! ```rust
//! use chainflow::{Condition, Variables};
//!
//! let guard = Condition::parse("items.length > 1 && tier == 'gold'").unwrap();
//! let vars: Variables = serde_json::from_str(r#"{"items": [1, 2], "tier": "gold"}"#).unwrap();
//! assert!(guard.evaluate(&vars));
//! ```

use crate::error::ChainError;
use crate::value::{as_number, is_truthy, lookup_path, loosely_equal, Lookup};
use serde_json::Value;

/// Parse failure with the byte offset it was detected at.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionError {
    pub offset: usize,
    pub message: String,
}

impl std::fmt::Display for ConditionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (at offset {})", self.message, self.offset)
    }
}

impl From<ConditionError> for ChainError {
    fn from(err: ConditionError) -> Self {
        ChainError::Condition {
            offset: err.offset,
            message: err.message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Value-producing side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Path(Vec<String>),
    /// A bare word on the right of `==`/`!=`: a variable if one exists,
    /// otherwise its own text.
    Word(Vec<String>),
    Length(Vec<String>),
    Literal(Value),
}

/// Parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Truthy(Operand),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Contains {
        path: Vec<String>,
        needle: Value,
    },
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let condition = parser.or()?;
        match parser.peek() {
            None => Ok(condition),
            Some(token) => Err(ConditionError {
                offset: token.offset,
                message: format!("unexpected {}", token.kind.describe()),
            }),
        }
    }

    pub fn evaluate(&self, scope: &dyn Lookup) -> bool {
        match self {
            Condition::Truthy(operand) => match operand {
                Operand::Length(_) => resolve(operand, scope)
                    .as_ref()
                    .and_then(as_number)
                    .map(|n| n != 0.0)
                    .unwrap_or(false),
                _ => is_truthy(resolve(operand, scope).as_ref()),
            },
            Condition::Compare { left, op, right } => {
                let l = resolve(left, scope);
                let r = resolve(right, scope);
                match op {
                    CompareOp::Eq => loosely_equal(l.as_ref(), r.as_ref()),
                    CompareOp::Ne => !loosely_equal(l.as_ref(), r.as_ref()),
                    _ => {
                        let (Some(a), Some(b)) =
                            (l.as_ref().and_then(as_number), r.as_ref().and_then(as_number))
                        else {
                            return false;
                        };
                        match op {
                            CompareOp::Gt => a > b,
                            CompareOp::Lt => a < b,
                            CompareOp::Ge => a >= b,
                            CompareOp::Le => a <= b,
                            CompareOp::Eq | CompareOp::Ne => unreachable!(),
                        }
                    }
                }
            }
            Condition::Contains { path, needle } => match lookup_path(scope, path) {
                Some(Value::Array(items)) => {
                    items.iter().any(|item| loosely_equal(Some(item), Some(needle)))
                }
                Some(Value::String(s)) => match needle {
                    Value::String(n) => s.contains(n.as_str()),
                    other => s.contains(&other.to_string()),
                },
                _ => false,
            },
            Condition::Not(inner) => !inner.evaluate(scope),
            Condition::And(a, b) => a.evaluate(scope) && b.evaluate(scope),
            Condition::Or(a, b) => a.evaluate(scope) || b.evaluate(scope),
        }
    }
}

fn resolve(operand: &Operand, scope: &dyn Lookup) -> Option<Value> {
    match operand {
        Operand::Path(path) => lookup_path(scope, path).cloned(),
        Operand::Word(path) => Some(
            lookup_path(scope, path)
                .cloned()
                .unwrap_or_else(|| Value::String(path.join("."))),
        ),
        Operand::Length(path) => {
            let len = match lookup_path(scope, path) {
                Some(Value::Array(items)) => items.len(),
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Object(map)) => map.len(),
                _ => 0,
            };
            Some(Value::from(len))
        }
        Operand::Literal(value) => Some(value.clone()),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Number(f64),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBrace,
    RBrace,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier '{}'", name),
            TokenKind::Str(s) => format!("string '{}'", s),
            TokenKind::Number(n) => format!("number {}", n),
            TokenKind::Op(_) => "comparison operator".to_string(),
            TokenKind::And => "'&&'".to_string(),
            TokenKind::Or => "'||'".to_string(),
            TokenKind::Not => "'!'".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::LBrace => "'{'".to_string(),
            TokenKind::RBrace => "'}'".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                TokenKind::LParen
            }
            b')' => {
                i += 1;
                TokenKind::RParen
            }
            b'{' => {
                i += 1;
                TokenKind::LBrace
            }
            b'}' => {
                i += 1;
                TokenKind::RBrace
            }
            b'&' | b'|' => {
                if bytes.get(i + 1) != Some(&c) {
                    return Err(ConditionError {
                        offset: i,
                        message: format!("expected '{0}{0}'", c as char),
                    });
                }
                i += 2;
                if c == b'&' {
                    TokenKind::And
                } else {
                    TokenKind::Or
                }
            }
            b'=' | b'!' | b'>' | b'<' => {
                let next = bytes.get(i + 1).copied();
                let (kind, width) = match (c, next) {
                    (b'=', Some(b'=')) => (TokenKind::Op(CompareOp::Eq), 2),
                    (b'!', Some(b'=')) => (TokenKind::Op(CompareOp::Ne), 2),
                    (b'>', Some(b'=')) => (TokenKind::Op(CompareOp::Ge), 2),
                    (b'<', Some(b'=')) => (TokenKind::Op(CompareOp::Le), 2),
                    (b'>', _) => (TokenKind::Op(CompareOp::Gt), 1),
                    (b'<', _) => (TokenKind::Op(CompareOp::Lt), 1),
                    (b'!', _) => (TokenKind::Not, 1),
                    _ => {
                        return Err(ConditionError {
                            offset: i,
                            message: "expected '=='".to_string(),
                        })
                    }
                };
                i += width;
                // `===` and `!==` behave like their two-character forms
                if matches!(kind, TokenKind::Op(CompareOp::Eq | CompareOp::Ne))
                    && bytes.get(i) == Some(&b'=')
                {
                    i += 1;
                }
                kind
            }
            b'\'' | b'"' => {
                let quote = c;
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(ConditionError {
                        offset: i,
                        message: "unterminated string literal".to_string(),
                    });
                }
                let text = source[i + 1..j].to_string();
                i = j + 1;
                TokenKind::Str(text)
            }
            b'0'..=b'9' | b'-' => {
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j].is_ascii_digit() || bytes[j] == b'.') {
                    j += 1;
                }
                let text = &source[i..j];
                let number = text.parse::<f64>().map_err(|_| ConditionError {
                    offset: i,
                    message: format!("invalid number '{}'", text),
                })?;
                i = j;
                TokenKind::Number(number)
            }
            c if c.is_ascii_alphabetic() || c == b'_' || c == b'$' => {
                let mut j = i + 1;
                while j < bytes.len()
                    && (bytes[j].is_ascii_alphanumeric() || matches!(bytes[j], b'_' | b'.' | b'$'))
                {
                    j += 1;
                }
                let text = &source[i..j];
                if text.ends_with('.') || text.contains("..") {
                    return Err(ConditionError {
                        offset: i,
                        message: format!("invalid variable path '{}'", text),
                    });
                }
                i = j;
                TokenKind::Ident(text.to_string())
            }
            _ => {
                let ch = source[i..].chars().next().unwrap_or('?');
                return Err(ConditionError {
                    offset: i,
                    message: format!("unexpected character '{}'", ch),
                });
            }
        };
        tokens.push(Token {
            kind,
            offset: start,
        });
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.peek().map(|t| t.offset).unwrap_or(self.end)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ConditionError> {
        let offset = self.offset();
        match self.next() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(ConditionError {
                offset,
                message: format!("expected {}, found {}", kind.describe(), token.kind.describe()),
            }),
            None => Err(ConditionError {
                offset,
                message: format!("expected {}, found end of expression", kind.describe()),
            }),
        }
    }

    fn or(&mut self) -> Result<Condition, ConditionError> {
        let mut left = self.and()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Or)) {
            self.pos += 1;
            let right = self.and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Condition, ConditionError> {
        let mut left = self.unary()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::And)) {
            self.pos += 1;
            let right = self.unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Condition, ConditionError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Not) => {
                self.pos += 1;
                Ok(Condition::Not(Box::new(self.unary()?)))
            }
            Some(TokenKind::LParen) => {
                self.pos += 1;
                let inner = self.or()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            _ => self.comparison(),
        }
    }

    fn comparison(&mut self) -> Result<Condition, ConditionError> {
        let left = match self.operand(false)? {
            Parsed::Operand(op) => op,
            Parsed::Contains(condition) => return Ok(condition),
        };

        let op = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Op(op)) => *op,
            _ => return Ok(Condition::Truthy(left)),
        };
        self.pos += 1;

        let bare_word = matches!(op, CompareOp::Eq | CompareOp::Ne);
        let offset = self.offset();
        let right = match self.operand(bare_word)? {
            Parsed::Operand(op) => op,
            Parsed::Contains(_) => {
                return Err(ConditionError {
                    offset,
                    message: "'includes' cannot be compared".to_string(),
                })
            }
        };

        Ok(Condition::Compare { left, op, right })
    }

    fn operand(&mut self, bare_word: bool) -> Result<Parsed, ConditionError> {
        let offset = self.offset();
        let token = self.next().ok_or_else(|| ConditionError {
            offset,
            message: "expected operand, found end of expression".to_string(),
        })?;

        match token.kind {
            TokenKind::Str(s) => Ok(Parsed::Operand(Operand::Literal(Value::String(s)))),
            TokenKind::Number(n) => Ok(Parsed::Operand(Operand::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            ))),
            TokenKind::LBrace => {
                let inner_offset = self.offset();
                let path = match self.next().map(|t| t.kind) {
                    Some(TokenKind::Ident(name)) => name,
                    _ => {
                        return Err(ConditionError {
                            offset: inner_offset,
                            message: "expected variable name inside braces".to_string(),
                        })
                    }
                };
                self.expect(TokenKind::RBrace)?;
                self.path_operand(&path, token.offset, false)
            }
            TokenKind::Ident(name) => match name.as_str() {
                "true" => Ok(Parsed::Operand(Operand::Literal(Value::Bool(true)))),
                "false" => Ok(Parsed::Operand(Operand::Literal(Value::Bool(false)))),
                "null" | "undefined" => Ok(Parsed::Operand(Operand::Literal(Value::Null))),
                _ => self.path_operand(&name, token.offset, bare_word),
            },
            other => Err(ConditionError {
                offset: token.offset,
                message: format!("expected operand, found {}", other.describe()),
            }),
        }
    }

    fn path_operand(
        &mut self,
        name: &str,
        offset: usize,
        bare_word: bool,
    ) -> Result<Parsed, ConditionError> {
        let mut path: Vec<String> = name.split('.').map(str::to_string).collect();
        let last = path.last().cloned().unwrap_or_default();

        match last.as_str() {
            "length" if path.len() > 1 => {
                path.pop();
                Ok(Parsed::Operand(Operand::Length(path)))
            }
            "includes" if path.len() > 1 => {
                path.pop();
                self.expect(TokenKind::LParen)?;
                let needle = match self.operand(false)? {
                    Parsed::Operand(Operand::Literal(value)) => value,
                    _ => {
                        return Err(ConditionError {
                            offset,
                            message: "includes() expects a literal argument".to_string(),
                        })
                    }
                };
                self.expect(TokenKind::RParen)?;
                Ok(Parsed::Contains(Condition::Contains { path, needle }))
            }
            _ if bare_word => Ok(Parsed::Operand(Operand::Word(path))),
            _ => Ok(Parsed::Operand(Operand::Path(path))),
        }
    }
}

enum Parsed {
    Operand(Operand),
    Contains(Condition),
}
