//! Key paths over resource documents.
//!
//! Supports the JMESPath subset used by policies: fields (bare or `"quoted"`),
//! `[N]` indexing, `[]` flatten, `[*]` and `.*` projections, `[?cond]` filter
//! projections, comparators, `&&`, `||`, `!`, pipes, `@`, raw `'strings'` and
//! `` `json` `` literals.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyPathError {
    #[error("empty key path")]
    Empty,
    #[error("unexpected character '{ch}' at offset {offset} in '{expression}'")]
    UnexpectedCharacter {
        expression: String,
        ch: char,
        offset: usize,
    },
    #[error("unterminated {what} in '{expression}'")]
    Unterminated {
        expression: String,
        what: &'static str,
    },
    #[error("unexpected {found} at offset {offset} in '{expression}'")]
    UnexpectedToken {
        expression: String,
        found: String,
        offset: usize,
    },
    #[error("invalid literal in '{expression}': {reason}")]
    InvalidLiteral { expression: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    QuotedIdentifier(String),
    Number(i64),
    Literal(Value),
    Dot,
    Star,
    Flatten,
    Filter,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Pipe,
    Or,
    And,
    Not,
    At,
    Comma,
    Cmp(Comparator),
    Eof,
}

impl Token {
    fn binding_power(&self) -> u8 {
        match self {
            Token::Pipe => 1,
            Token::Or => 2,
            Token::And => 3,
            Token::Cmp(_) => 5,
            Token::Flatten => 9,
            Token::Star => 20,
            Token::Filter => 21,
            Token::Dot => 40,
            Token::Not => 45,
            Token::LBracket => 55,
            Token::LParen => 60,
            _ => 0,
        }
    }

    fn describe(&self) -> String {
        match self {
            Token::Identifier(name) | Token::QuotedIdentifier(name) => format!("identifier '{name}'"),
            Token::Number(n) => format!("number {n}"),
            Token::Literal(value) => format!("literal {value}"),
            Token::Eof => "end of expression".to_string(),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Current,
    Field(String),
    Index(i64),
    Literal(Value),
    Sub(Box<Node>, Box<Node>),
    Projection(Box<Node>, Box<Node>),
    ValueProjection(Box<Node>, Box<Node>),
    Flatten(Box<Node>),
    FilterProjection(Box<Node>, Box<Node>, Box<Node>),
    Comparison(Comparator, Box<Node>, Box<Node>),
    Pipe(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Not(Box<Node>),
}

/// A compiled key path.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPath {
    expression: String,
    ast: Node,
}

impl KeyPath {
    pub fn parse(expression: &str) -> Result<Self, KeyPathError> {
        if expression.trim().is_empty() {
            return Err(KeyPathError::Empty);
        }
        let tokens = Lexer::new(expression).tokenize()?;
        let mut parser = Parser {
            expression,
            tokens,
            pos: 0,
        };
        let ast = parser.expression(0)?;
        let (token, offset) = parser.peek_with_offset();
        if *token != Token::Eof {
            return Err(KeyPathError::UnexpectedToken {
                expression: expression.to_string(),
                found: token.describe(),
                offset,
            });
        }
        Ok(Self {
            expression: expression.to_string(),
            ast,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expression
    }

    pub fn search(&self, value: &Value) -> Value {
        evaluate(&self.ast, value)
    }
}

impl FromStr for KeyPath {
    type Err = KeyPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

pub fn search(expression: &str, value: &Value) -> Result<Value, KeyPathError> {
    Ok(KeyPath::parse(expression)?.search(value))
}

/// JMESPath truthiness: null, false, and empty strings/arrays/objects are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Number(_) => true,
    }
}

struct Lexer<'a> {
    expression: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(expression: &'a str) -> Self {
        Self {
            expression,
            chars: expression.char_indices().collect(),
            pos: 0,
        }
    }

    fn peek_char(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, ch)| *ch)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.expression.len())
    }

    fn unexpected(&self, ch: char) -> KeyPathError {
        KeyPathError::UnexpectedCharacter {
            expression: self.expression.to_string(),
            ch,
            offset: self.offset(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, KeyPathError> {
        let mut tokens = Vec::new();
        while let Some(ch) = self.peek_char(0) {
            let offset = self.offset();
            let token = match ch {
                ' ' | '\t' | '\n' | '\r' => {
                    self.pos += 1;
                    continue;
                }
                'a'..='z' | 'A'..='Z' | '_' => self.identifier(),
                '0'..='9' => self.number()?,
                '-' if self.peek_char(1).is_some_and(|next| next.is_ascii_digit()) => {
                    self.number()?
                }
                '"' => Token::QuotedIdentifier(self.quoted_identifier()?),
                '\'' => Token::Literal(Value::String(self.delimited('\'', "raw string")?)),
                '`' => self.json_literal()?,
                '.' => self.single(Token::Dot),
                '*' => self.single(Token::Star),
                '@' => self.single(Token::At),
                ',' => self.single(Token::Comma),
                ']' => self.single(Token::RBracket),
                '(' => self.single(Token::LParen),
                ')' => self.single(Token::RParen),
                '[' => match self.peek_char(1) {
                    Some(']') => self.double(Token::Flatten),
                    Some('?') => self.double(Token::Filter),
                    _ => self.single(Token::LBracket),
                },
                '|' => match self.peek_char(1) {
                    Some('|') => self.double(Token::Or),
                    _ => self.single(Token::Pipe),
                },
                '&' => match self.peek_char(1) {
                    Some('&') => self.double(Token::And),
                    _ => return Err(self.unexpected(ch)),
                },
                '!' => match self.peek_char(1) {
                    Some('=') => self.double(Token::Cmp(Comparator::Ne)),
                    _ => self.single(Token::Not),
                },
                '=' => match self.peek_char(1) {
                    Some('=') => self.double(Token::Cmp(Comparator::Eq)),
                    _ => return Err(self.unexpected(ch)),
                },
                '<' => match self.peek_char(1) {
                    Some('=') => self.double(Token::Cmp(Comparator::Lte)),
                    _ => self.single(Token::Cmp(Comparator::Lt)),
                },
                '>' => match self.peek_char(1) {
                    Some('=') => self.double(Token::Cmp(Comparator::Gte)),
                    _ => self.single(Token::Cmp(Comparator::Gt)),
                },
                other => return Err(self.unexpected(other)),
            };
            tokens.push((token, offset));
        }
        tokens.push((Token::Eof, self.expression.len()));
        Ok(tokens)
    }

    fn single(&mut self, token: Token) -> Token {
        self.pos += 1;
        token
    }

    fn double(&mut self, token: Token) -> Token {
        self.pos += 2;
        token
    }

    fn identifier(&mut self) -> Token {
        let mut name = String::new();
        while let Some(ch) = self.peek_char(0) {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                name.push(ch);
                self.pos += 1;
            } else {
                break;
            }
        }
        Token::Identifier(name)
    }

    fn number(&mut self) -> Result<Token, KeyPathError> {
        let mut text = String::new();
        if self.peek_char(0) == Some('-') {
            text.push('-');
            self.pos += 1;
        }
        while let Some(ch) = self.peek_char(0).filter(char::is_ascii_digit) {
            text.push(ch);
            self.pos += 1;
        }
        text.parse::<i64>()
            .map(Token::Number)
            .map_err(|err| KeyPathError::InvalidLiteral {
                expression: self.expression.to_string(),
                reason: format!("bad number '{text}': {err}"),
            })
    }

    fn delimited(&mut self, delimiter: char, what: &'static str) -> Result<String, KeyPathError> {
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.peek_char(0) {
                None => {
                    return Err(KeyPathError::Unterminated {
                        expression: self.expression.to_string(),
                        what,
                    });
                }
                Some('\\') if self.peek_char(1) == Some(delimiter) => {
                    text.push(delimiter);
                    self.pos += 2;
                }
                Some(ch) if ch == delimiter => {
                    self.pos += 1;
                    return Ok(text);
                }
                Some(ch) => {
                    text.push(ch);
                    self.pos += 1;
                }
            }
        }
    }

    fn quoted_identifier(&mut self) -> Result<String, KeyPathError> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.peek_char(0) {
                None => {
                    return Err(KeyPathError::Unterminated {
                        expression: self.expression.to_string(),
                        what: "quoted identifier",
                    });
                }
                Some('\\') => self.pos += 2,
                Some('"') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
            }
        }
        let raw: String = self.chars[start..self.pos].iter().map(|(_, ch)| *ch).collect();
        serde_json::from_str::<String>(&raw).map_err(|err| KeyPathError::InvalidLiteral {
            expression: self.expression.to_string(),
            reason: err.to_string(),
        })
    }

    fn json_literal(&mut self) -> Result<Token, KeyPathError> {
        let raw = self.delimited('`', "json literal")?;
        let trimmed = raw.trim();
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => Ok(Token::Literal(value)),
            // Bare words inside backticks are accepted as strings.
            Err(_) if !trimmed.is_empty() => Ok(Token::Literal(Value::String(trimmed.to_string()))),
            Err(err) => Err(KeyPathError::InvalidLiteral {
                expression: self.expression.to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn peek_with_offset(&self) -> (&Token, usize) {
        let (token, offset) = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        (token, *offset)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self) -> KeyPathError {
        let (token, offset) = self.peek_with_offset();
        KeyPathError::UnexpectedToken {
            expression: self.expression.to_string(),
            found: token.describe(),
            offset,
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), KeyPathError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn expression(&mut self, rbp: u8) -> Result<Node, KeyPathError> {
        let mut left = self.nud()?;
        while rbp < self.peek().binding_power() {
            left = self.led(left)?;
        }
        Ok(left)
    }

    fn nud(&mut self) -> Result<Node, KeyPathError> {
        if matches!(self.peek(), Token::Eof | Token::Number(_) | Token::Comma) {
            return Err(self.unexpected());
        }
        match self.advance() {
            Token::Identifier(name) | Token::QuotedIdentifier(name) => Ok(Node::Field(name)),
            Token::Literal(value) => Ok(Node::Literal(value)),
            Token::At => Ok(Node::Current),
            Token::Star => {
                let right = self.projection_rhs(Token::Star.binding_power())?;
                Ok(Node::ValueProjection(Box::new(Node::Current), Box::new(right)))
            }
            Token::Flatten => {
                let right = self.projection_rhs(Token::Flatten.binding_power())?;
                Ok(Node::Projection(
                    Box::new(Node::Flatten(Box::new(Node::Current))),
                    Box::new(right),
                ))
            }
            Token::Filter => self.filter_projection(Node::Current),
            Token::LBracket => self.bracket(Node::Current),
            Token::Not => {
                let inner = self.expression(Token::Not.binding_power())?;
                Ok(Node::Not(Box::new(inner)))
            }
            Token::LParen => {
                let inner = self.expression(0)?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected())
            }
        }
    }

    fn led(&mut self, left: Node) -> Result<Node, KeyPathError> {
        match self.advance() {
            Token::Dot => {
                if *self.peek() == Token::Star {
                    self.advance();
                    let right = self.projection_rhs(Token::Star.binding_power())?;
                    return Ok(Node::ValueProjection(Box::new(left), Box::new(right)));
                }
                let right = self.dot_rhs(Token::Dot.binding_power())?;
                Ok(Node::Sub(Box::new(left), Box::new(right)))
            }
            Token::Pipe => {
                let right = self.expression(Token::Pipe.binding_power())?;
                Ok(Node::Pipe(Box::new(left), Box::new(right)))
            }
            Token::Or => {
                let right = self.expression(Token::Or.binding_power())?;
                Ok(Node::Or(Box::new(left), Box::new(right)))
            }
            Token::And => {
                let right = self.expression(Token::And.binding_power())?;
                Ok(Node::And(Box::new(left), Box::new(right)))
            }
            Token::Cmp(comparator) => {
                let right = self.expression(Token::Cmp(comparator).binding_power())?;
                Ok(Node::Comparison(comparator, Box::new(left), Box::new(right)))
            }
            Token::Flatten => {
                let right = self.projection_rhs(Token::Flatten.binding_power())?;
                Ok(Node::Projection(
                    Box::new(Node::Flatten(Box::new(left))),
                    Box::new(right),
                ))
            }
            Token::Filter => self.filter_projection(left),
            Token::LBracket => self.bracket(left),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected())
            }
        }
    }

    // Called after '[' has been consumed.
    fn bracket(&mut self, left: Node) -> Result<Node, KeyPathError> {
        match self.peek().clone() {
            Token::Number(index) => {
                self.advance();
                self.expect(&Token::RBracket)?;
                Ok(chain(left, Node::Index(index)))
            }
            Token::Star => {
                self.advance();
                self.expect(&Token::RBracket)?;
                let right = self.projection_rhs(Token::Star.binding_power())?;
                Ok(Node::Projection(Box::new(left), Box::new(right)))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn filter_projection(&mut self, left: Node) -> Result<Node, KeyPathError> {
        let condition = self.expression(0)?;
        self.expect(&Token::RBracket)?;
        let right = if *self.peek() == Token::Flatten {
            Node::Current
        } else {
            self.projection_rhs(Token::Filter.binding_power())?
        };
        Ok(Node::FilterProjection(
            Box::new(left),
            Box::new(condition),
            Box::new(right),
        ))
    }

    fn projection_rhs(&mut self, rbp: u8) -> Result<Node, KeyPathError> {
        let next = self.peek().clone();
        if next.binding_power() < 10 {
            return Ok(Node::Current);
        }
        match next {
            Token::LBracket | Token::Filter => self.expression(rbp),
            Token::Dot => {
                self.advance();
                self.dot_rhs(rbp)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn dot_rhs(&mut self, rbp: u8) -> Result<Node, KeyPathError> {
        match self.peek() {
            Token::Identifier(_) | Token::QuotedIdentifier(_) | Token::Star => self.expression(rbp),
            _ => Err(self.unexpected()),
        }
    }
}

fn chain(left: Node, right: Node) -> Node {
    match left {
        Node::Current => right,
        left => Node::Sub(Box::new(left), Box::new(right)),
    }
}

fn evaluate(node: &Node, value: &Value) -> Value {
    match node {
        Node::Current => value.clone(),
        Node::Field(name) => value
            .as_object()
            .and_then(|map| map.get(name))
            .cloned()
            .unwrap_or(Value::Null),
        Node::Index(index) => match value.as_array() {
            Some(items) => {
                let len = items.len() as i64;
                let resolved = if *index < 0 { len + index } else { *index };
                if resolved < 0 || resolved >= len {
                    Value::Null
                } else {
                    items[resolved as usize].clone()
                }
            }
            None => Value::Null,
        },
        Node::Literal(literal) => literal.clone(),
        Node::Sub(left, right) => {
            let base = evaluate(left, value);
            if base.is_null() {
                return Value::Null;
            }
            evaluate(right, &base)
        }
        Node::Projection(left, right) => match evaluate(left, value) {
            Value::Array(items) => project(items.iter(), right),
            _ => Value::Null,
        },
        Node::ValueProjection(left, right) => match evaluate(left, value) {
            Value::Object(map) => project(map.values(), right),
            _ => Value::Null,
        },
        Node::Flatten(inner) => match evaluate(inner, value) {
            Value::Array(items) => {
                let mut flattened = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Array(nested) => flattened.extend(nested),
                        other => flattened.push(other),
                    }
                }
                Value::Array(flattened)
            }
            _ => Value::Null,
        },
        Node::FilterProjection(left, condition, right) => match evaluate(left, value) {
            Value::Array(items) => {
                let kept: Vec<&Value> = items
                    .iter()
                    .filter(|item| is_truthy(&evaluate(condition, item)))
                    .collect();
                project(kept.into_iter(), right)
            }
            _ => Value::Null,
        },
        Node::Comparison(comparator, left, right) => {
            compare(*comparator, &evaluate(left, value), &evaluate(right, value))
        }
        Node::Pipe(left, right) => evaluate(right, &evaluate(left, value)),
        Node::Or(left, right) => {
            let lhs = evaluate(left, value);
            if is_truthy(&lhs) {
                lhs
            } else {
                evaluate(right, value)
            }
        }
        Node::And(left, right) => {
            let lhs = evaluate(left, value);
            if is_truthy(&lhs) {
                evaluate(right, value)
            } else {
                lhs
            }
        }
        Node::Not(inner) => Value::Bool(!is_truthy(&evaluate(inner, value))),
    }
}

fn project<'v>(items: impl Iterator<Item = &'v Value>, right: &Node) -> Value {
    Value::Array(
        items
            .map(|item| evaluate(right, item))
            .filter(|projected| !projected.is_null())
            .collect(),
    )
}

fn compare(comparator: Comparator, lhs: &Value, rhs: &Value) -> Value {
    match comparator {
        Comparator::Eq => Value::Bool(json_equal(lhs, rhs)),
        Comparator::Ne => Value::Bool(!json_equal(lhs, rhs)),
        ordering => {
            let (Some(lhs), Some(rhs)) = (lhs.as_f64(), rhs.as_f64()) else {
                return Value::Null;
            };
            let Some(order) = lhs.partial_cmp(&rhs) else {
                return Value::Null;
            };
            Value::Bool(match ordering {
                Comparator::Lt => order == Ordering::Less,
                Comparator::Lte => order != Ordering::Greater,
                Comparator::Gt => order == Ordering::Greater,
                Comparator::Gte => order != Ordering::Less,
                Comparator::Eq | Comparator::Ne => false,
            })
        }
    }
}

/// Structural equality that treats `1` and `1.0` as equal.
pub fn json_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| json_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| json_equal(x, y)))
        }
        _ => lhs == rhs,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{KeyPath, KeyPathError, search};

    fn doc() -> serde_json::Value {
        json!({
            "State": {"Name": "running", "Code": 16},
            "Tags": [
                {"Key": "Env", "Value": "prod"},
                {"Key": "Owner", "Value": "ops"}
            ],
            "BlockDeviceMappings": [
                {"DeviceName": "/dev/sda1", "Ebs": {"VolumeId": "vol-1", "Size": 8}},
                {"DeviceName": "/dev/sdb", "Ebs": {"VolumeId": "vol-2", "Size": 100}}
            ],
            "Nested": [[1, 2], [3], 4],
            "my-key": "dashed"
        })
    }

    #[test]
    fn dotted_fields_resolve_nested_maps() {
        assert_eq!(search("State.Name", &doc()).unwrap(), json!("running"));
        assert_eq!(search("State.Missing", &doc()).unwrap(), json!(null));
        assert_eq!(search("Missing.Deeper", &doc()).unwrap(), json!(null));
        assert_eq!(search("my-key", &doc()).unwrap(), json!("dashed"));
    }

    #[test]
    fn list_projection_collects_non_null_values() {
        assert_eq!(
            search("BlockDeviceMappings[*].Ebs.VolumeId", &doc()).unwrap(),
            json!(["vol-1", "vol-2"])
        );
        assert_eq!(
            search("BlockDeviceMappings[].Ebs.Size", &doc()).unwrap(),
            json!([8, 100])
        );
    }

    #[test]
    fn filter_projection_selects_tag_value() {
        assert_eq!(
            search("Tags[?Key=='Env'].Value", &doc()).unwrap(),
            json!(["prod"])
        );
        assert_eq!(
            search("Tags[?Key=='Env'].Value | [0]", &doc()).unwrap(),
            json!("prod")
        );
        assert_eq!(
            search("BlockDeviceMappings[?Ebs.Size > `10`].DeviceName", &doc()).unwrap(),
            json!(["/dev/sdb"])
        );
    }

    #[test]
    fn indexing_and_flatten() {
        assert_eq!(search("Tags[0].Key", &doc()).unwrap(), json!("Env"));
        assert_eq!(search("Tags[-1].Key", &doc()).unwrap(), json!("Owner"));
        assert_eq!(search("Tags[5]", &doc()).unwrap(), json!(null));
        assert_eq!(search("Nested[]", &doc()).unwrap(), json!([1, 2, 3, 4]));
    }

    #[test]
    fn value_projection_and_boolean_operators() {
        let values = search("State.*", &doc()).unwrap();
        let values = values.as_array().expect("projection yields a list");
        assert_eq!(values.len(), 2);
        assert!(values.contains(&json!("running")));
        assert_eq!(
            search("Missing || State.Name", &doc()).unwrap(),
            json!("running")
        );
        assert_eq!(search("!Missing", &doc()).unwrap(), json!(true));
        assert_eq!(
            search("State.Code == `16` && State.Name == 'running'", &doc()).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn quoted_identifiers_allow_special_characters() {
        let value = json!({"c7n:matched": ["sg-1"]});
        assert_eq!(search("\"c7n:matched\"[0]", &value).unwrap(), json!("sg-1"));
    }

    #[test]
    fn malformed_paths_are_rejected() {
        assert_eq!(KeyPath::parse("  "), Err(KeyPathError::Empty));
        assert!(matches!(
            KeyPath::parse("Tags[?Key=='Env'"),
            Err(KeyPathError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            KeyPath::parse("State.#"),
            Err(KeyPathError::UnexpectedCharacter { ch: '#', .. })
        ));
        assert!(matches!(
            KeyPath::parse("'open"),
            Err(KeyPathError::Unterminated { .. })
        ));
    }
}
