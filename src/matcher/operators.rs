use std::{cmp::Ordering, fmt, str::FromStr};

use ipnetwork::IpNetwork;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    error::{CustodianError, Result, policy_validation},
    keypath::json_equal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    Present,
    Absent,
    Empty,
    NotNull,
    Glob,
    Regex,
    RegexCase,
    Difference,
    Intersect,
}

const OPERATOR_NAMES: &[(&str, Operator)] = &[
    ("eq", Operator::Eq),
    ("equal", Operator::Eq),
    ("ne", Operator::Ne),
    ("not-equal", Operator::Ne),
    ("gt", Operator::Gt),
    ("greater-than", Operator::Gt),
    ("gte", Operator::Gte),
    ("ge", Operator::Gte),
    ("lt", Operator::Lt),
    ("less-than", Operator::Lt),
    ("lte", Operator::Lte),
    ("le", Operator::Lte),
    ("in", Operator::In),
    ("ni", Operator::NotIn),
    ("not-in", Operator::NotIn),
    ("contains", Operator::Contains),
    ("present", Operator::Present),
    ("absent", Operator::Absent),
    ("empty", Operator::Empty),
    ("not-null", Operator::NotNull),
    ("glob", Operator::Glob),
    ("regex", Operator::Regex),
    ("regex-case", Operator::RegexCase),
    ("difference", Operator::Difference),
    ("intersect", Operator::Intersect),
];

impl Operator {
    pub fn names() -> Vec<&'static str> {
        OPERATOR_NAMES.iter().map(|(name, _)| *name).collect()
    }

    pub fn as_str(self) -> &'static str {
        OPERATOR_NAMES
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(name, _)| *name)
            .unwrap_or("eq")
    }

    pub fn is_presence(self) -> bool {
        matches!(
            self,
            Operator::Present | Operator::Absent | Operator::Empty | Operator::NotNull
        )
    }

    pub fn is_pattern(self) -> bool {
        matches!(self, Operator::Glob | Operator::Regex | Operator::RegexCase)
    }

    /// Presence operators applied to the raw (pre-coercion) left value.
    pub fn check_presence(self, left: &Value) -> bool {
        match self {
            Operator::Absent => left.is_null(),
            Operator::Present => !left.is_null(),
            Operator::NotNull => !is_empty_value(left),
            Operator::Empty => is_empty_value(left),
            _ => false,
        }
    }
}

impl FromStr for Operator {
    type Err = CustodianError;

    fn from_str(name: &str) -> Result<Self> {
        OPERATOR_NAMES
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, op)| *op)
            .ok_or_else(|| {
                policy_validation(format!(
                    "invalid operator '{name}'; valid choices: {}",
                    Operator::names().join(", ")
                ))
            })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Number(number) => number.as_f64() == Some(0.0),
    }
}

/// A match side after value-type coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Json(Value),
    Number(f64),
    Date(OffsetDateTime),
    Network(IpNetwork),
    Version(Vec<u64>),
    List(Vec<Operand>),
}

impl Operand {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(number) => number
                .as_f64()
                .map(Operand::Number)
                .unwrap_or_else(|| Operand::Json(value.clone())),
            Value::Array(items) => Operand::List(items.iter().map(Operand::from_json).collect()),
            other => Operand::Json(other.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Operand::Json(Value::Null))
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            Operand::Json(Value::String(text)) => Some(text),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Operand::Number(number) => Some(*number),
            Operand::Json(Value::String(text)) => text.trim().parse().ok(),
            _ => None,
        }
    }

    fn equals(&self, other: &Operand) -> bool {
        match (self, other) {
            (Operand::Json(lhs), Operand::Json(rhs)) => json_equal(lhs, rhs),
            (Operand::Number(lhs), Operand::Number(rhs)) => lhs == rhs,
            (Operand::Number(_), Operand::Json(Value::String(_)))
            | (Operand::Json(Value::String(_)), Operand::Number(_)) => {
                match (self.as_number(), other.as_number()) {
                    (Some(lhs), Some(rhs)) => lhs == rhs,
                    _ => false,
                }
            }
            (Operand::Date(lhs), Operand::Date(rhs)) => lhs == rhs,
            (Operand::Network(lhs), Operand::Network(rhs)) => lhs == rhs,
            (Operand::Version(lhs), Operand::Version(rhs)) => lhs == rhs,
            (Operand::List(lhs), Operand::List(rhs)) => {
                lhs.len() == rhs.len() && lhs.iter().zip(rhs).all(|(a, b)| a.equals(b))
            }
            _ => false,
        }
    }

    fn compare(&self, other: &Operand) -> Option<Ordering> {
        match (self, other) {
            (Operand::Json(Value::String(lhs)), Operand::Json(Value::String(rhs))) => {
                Some(lhs.cmp(rhs))
            }
            (Operand::Json(Value::Bool(lhs)), Operand::Json(Value::Bool(rhs))) => {
                Some(lhs.cmp(rhs))
            }
            (Operand::Date(lhs), Operand::Date(rhs)) => Some(lhs.cmp(rhs)),
            (Operand::Version(lhs), Operand::Version(rhs)) => Some(lhs.cmp(rhs)),
            (Operand::Network(lhs), Operand::Network(rhs)) => {
                Some(lhs.prefix().cmp(&rhs.prefix()))
            }
            _ => {
                let lhs = self.as_number()?;
                let rhs = other.as_number()?;
                lhs.partial_cmp(&rhs)
            }
        }
    }

    fn contains_member(&self, needle: &Operand) -> bool {
        match self {
            Operand::List(items) => items
                .iter()
                .any(|item| item.equals(needle) || item.network_contains(needle)),
            Operand::Network(_) => self.network_contains(needle),
            Operand::Json(Value::String(haystack)) => {
                needle.as_text().is_some_and(|text| haystack.contains(text))
            }
            Operand::Json(Value::Object(map)) => {
                needle.as_text().is_some_and(|key| map.contains_key(key))
            }
            _ => false,
        }
    }

    fn network_contains(&self, needle: &Operand) -> bool {
        match (self, needle) {
            (Operand::Network(outer), Operand::Network(inner)) => {
                outer.contains(inner.network()) && outer.prefix() <= inner.prefix()
            }
            _ => false,
        }
    }

    fn members(&self) -> Vec<&Operand> {
        match self {
            Operand::List(items) => items.iter().collect(),
            Operand::Json(Value::Null) => Vec::new(),
            other => vec![other],
        }
    }
}

/// Compiled text pattern for `glob`, `regex` and `regex-case`.
#[derive(Debug, Clone)]
pub struct Pattern {
    regex: Regex,
}

impl Pattern {
    pub fn compile(op: Operator, pattern: &str) -> Result<Self> {
        let source = match op {
            Operator::Glob => glob_to_regex(pattern),
            _ => pattern.to_string(),
        };
        let regex = RegexBuilder::new(&source)
            .case_insensitive(op == Operator::Regex)
            .build()
            .map_err(|err| policy_validation(format!("invalid {op} pattern '{pattern}': {err}")))?;
        Ok(Self { regex })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Anchored translation of shell-style globs: `*`, `?`, `[...]`, `[!...]`.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        class.push('\\');
                    }
                    class.push(inner);
                }
                if closed && !class.is_empty() {
                    out.push('[');
                    out.push_str(&class);
                    out.push(']');
                } else {
                    out.push_str(&regex::escape("["));
                    out.push_str(&regex::escape(&class));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// Applies a non-presence operator to coerced operands. Undefined combinations are false.
pub fn apply(op: Operator, left: &Operand, right: &Operand, pattern: Option<&Pattern>) -> bool {
    match op {
        Operator::Eq => left.equals(right),
        Operator::Ne => !left.equals(right),
        Operator::Gt => left.compare(right) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            left.compare(right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => left.compare(right) == Some(Ordering::Less),
        Operator::Lte => matches!(left.compare(right), Some(Ordering::Less | Ordering::Equal)),
        Operator::In => membership(left, right).unwrap_or(false),
        Operator::NotIn => membership(left, right).map(|found| !found).unwrap_or(true),
        Operator::Contains => match right {
            Operand::List(needles) => needles.iter().all(|needle| left.contains_member(needle)),
            needle => left.contains_member(needle),
        },
        Operator::Glob | Operator::Regex | Operator::RegexCase => {
            let compiled;
            let pattern = match pattern {
                Some(pattern) => pattern,
                None => {
                    let Some(text) = right.as_text() else {
                        return false;
                    };
                    match Pattern::compile(op, text) {
                        Ok(built) => {
                            compiled = built;
                            &compiled
                        }
                        Err(_) => return false,
                    }
                }
            };
            match left {
                Operand::Json(Value::String(text)) => pattern.is_match(text),
                Operand::List(items) => items
                    .iter()
                    .filter_map(Operand::as_text)
                    .any(|text| pattern.is_match(text)),
                _ => false,
            }
        }
        Operator::Difference => {
            let rights = right.members();
            left.members()
                .iter()
                .any(|item| !rights.iter().any(|other| item.equals(other)))
        }
        Operator::Intersect => {
            let rights = right.members();
            left.members()
                .iter()
                .any(|item| rights.iter().any(|other| item.equals(other)))
        }
        Operator::Present | Operator::Absent | Operator::Empty | Operator::NotNull => false,
    }
}

/// `None` when the left side is missing, so `in` fails and `ni` passes.
fn membership(left: &Operand, right: &Operand) -> Option<bool> {
    if left.is_null() {
        return None;
    }
    match left {
        Operand::List(items) => Some(items.iter().all(|item| right.contains_member(item))),
        scalar => Some(right.contains_member(scalar)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Operand, Operator, Pattern, apply, glob_to_regex};

    fn op(name: &str) -> Operator {
        name.parse().expect("operator should parse")
    }

    fn check(name: &str, left: serde_json::Value, right: serde_json::Value) -> bool {
        apply(
            op(name),
            &Operand::from_json(&left),
            &Operand::from_json(&right),
            None,
        )
    }

    #[test]
    fn aliases_resolve_to_the_same_operator() {
        assert_eq!(op("equal"), Operator::Eq);
        assert_eq!(op("not-in"), Operator::NotIn);
        assert_eq!(op("greater-than"), Operator::Gt);
        assert!("approximately".parse::<Operator>().is_err());
    }

    #[test]
    fn numeric_strings_compare_numerically() {
        assert!(check("eq", json!("10"), json!(10)));
        assert!(check("gt", json!("10"), json!(9)));
        assert!(!check("gt", json!("abc"), json!(9)));
        assert!(check("lt", json!("abc"), json!("abd")));
        assert!(!check("eq", json!(true), json!("true")));
    }

    #[test]
    fn membership_handles_scalars_lists_and_missing_values() {
        assert!(check("in", json!("a"), json!(["a", "b"])));
        assert!(check("in", json!(["a", "b"]), json!(["a", "b", "c"])));
        assert!(!check("in", json!(["a", "z"]), json!(["a", "b"])));
        assert!(!check("in", json!("a"), json!([])));
        assert!(check("ni", json!("a"), json!([])));
        assert!(!check("in", json!(null), json!(["a"])));
        assert!(check("ni", json!(null), json!(["a"])));
        assert!(check("contains", json!(["x", "y"]), json!("y")));
        assert!(check("in", json!("prod"), json!("production")));
    }

    #[test]
    fn glob_is_anchored_and_regex_is_not() {
        assert!(check("glob", json!("web-01"), json!("web-*")));
        assert!(!check("glob", json!("my-web-01"), json!("web-*")));
        assert!(check("glob", json!("db1"), json!("db[0-9]")));
        assert!(check("regex", json!("my-WEB-01"), json!("web")));
        assert!(!check("regex-case", json!("my-WEB-01"), json!("web")));
        assert_eq!(glob_to_regex("a.b?"), r"^a\.b.$");
    }

    #[test]
    fn set_operators() {
        assert!(check("intersect", json!(["a", "b"]), json!(["b", "c"])));
        assert!(!check("intersect", json!(["a"]), json!(["b"])));
        assert!(check("difference", json!(["a", "b"]), json!(["a"])));
        assert!(!check("difference", json!(["a"]), json!(["a", "b"])));
    }

    #[test]
    fn presence_checks_on_raw_values() {
        assert!(Operator::Absent.check_presence(&json!(null)));
        assert!(!Operator::Present.check_presence(&json!(null)));
        assert!(Operator::Empty.check_presence(&json!([])));
        assert!(Operator::NotNull.check_presence(&json!("x")));
        assert!(!Operator::NotNull.check_presence(&json!("")));
    }

    #[test]
    fn precompiled_pattern_is_used() {
        let pattern = Pattern::compile(Operator::Regex, "^i-").expect("pattern should compile");
        assert!(apply(
            Operator::Regex,
            &Operand::from_json(&json!("i-123")),
            &Operand::from_json(&json!("ignored")),
            Some(&pattern),
        ));
        assert!(Pattern::compile(Operator::Regex, "(").is_err());
    }
}
