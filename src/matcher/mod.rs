//! Value matching: key resolution, coercion and operators.

pub mod dates;
pub mod operators;
pub mod value_from;
pub mod value_type;

use regex::Regex;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{
    context::{ExecutionContext, RunWarning, WarningKind},
    error::{Result, policy_validation},
    keypath::KeyPath,
    resources::tags::{TAGS_KEY, tags_from_value},
};

pub use operators::{Operand, Operator, Pattern};
pub use value_from::{ValuesFormat, ValuesFrom};
pub use value_type::ValueType;

/// Magic right-hand values that select a presence operator.
const PRESENCE_VALUES: &[&str] = &["absent", "present", "empty", "not-null"];

#[derive(Debug, Clone, PartialEq)]
pub enum MatchKey {
    Tag(String),
    Path { raw: String, path: Option<KeyPath> },
}

impl MatchKey {
    pub fn parse(key: &str) -> Result<Self> {
        if let Some(tag) = key.strip_prefix("tag:") {
            if tag.is_empty() {
                return Err(policy_validation("tag key must name a tag, e.g. 'tag:Env'"));
            }
            return Ok(MatchKey::Tag(tag.to_string()));
        }
        if key.is_empty() {
            return Err(policy_validation("value filter key must not be empty"));
        }
        Ok(MatchKey::Path {
            raw: key.to_string(),
            path: KeyPath::parse(key).ok(),
        })
    }

    pub fn as_str(&self) -> String {
        match self {
            MatchKey::Tag(tag) => format!("tag:{tag}"),
            MatchKey::Path { raw, .. } => raw.clone(),
        }
    }

    /// Direct key first, then the `tag:` lookup, then a key-path search.
    pub fn resolve(&self, resource: &Value) -> Value {
        match self {
            MatchKey::Tag(tag) => resource
                .get(TAGS_KEY)
                .map(tags_from_value)
                .unwrap_or_default()
                .into_iter()
                .find(|candidate| &candidate.key == tag)
                .map(|candidate| Value::String(candidate.value))
                .unwrap_or(Value::Null),
            MatchKey::Path { raw, path } => {
                if let Some(direct) = resource.get(raw) {
                    return direct.clone();
                }
                path.as_ref()
                    .map(|path| path.search(resource))
                    .unwrap_or(Value::Null)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchValue {
    Literal(Value),
    From(ValuesFrom),
}

/// A configured `value` predicate.
#[derive(Debug, Clone)]
pub struct ValueMatcher {
    key: Option<MatchKey>,
    op: Operator,
    value: MatchValue,
    value_type: Option<ValueType>,
    default: Option<Value>,
    value_regex: Option<Regex>,
    value_path: Option<KeyPath>,
    pattern: Option<Pattern>,
}

impl ValueMatcher {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        let value_type = data
            .get("value_type")
            .and_then(Value::as_str)
            .map(str::parse::<ValueType>)
            .transpose()?;

        let key = match data.get("key") {
            Some(Value::String(key)) => Some(MatchKey::parse(key)?),
            Some(_) => return Err(policy_validation("value filter key must be a string")),
            None if value_type == Some(ValueType::ResourceCount) => None,
            None => return Err(policy_validation("value filter requires 'key'")),
        };

        let value = match (data.get("value"), data.get("value_from")) {
            (Some(_), Some(_)) => {
                return Err(policy_validation(
                    "value filter accepts either 'value' or 'value_from', not both",
                ));
            }
            (_, Some(source)) => {
                let source: ValuesFrom = serde_json::from_value(source.clone())
                    .map_err(|err| policy_validation(format!("invalid value_from: {err}")))?;
                source.validate()?;
                MatchValue::From(source)
            }
            (Some(value), None) => MatchValue::Literal(value.clone()),
            (None, None) => MatchValue::Literal(Value::Null),
        };

        let mut op = match data.get("op").and_then(Value::as_str) {
            Some(name) => name.parse::<Operator>()?,
            None => Operator::Eq,
        };
        if let MatchValue::Literal(Value::String(magic)) = &value
            && PRESENCE_VALUES.contains(&magic.as_str())
            && matches!(op, Operator::Eq)
        {
            op = magic.parse::<Operator>()?;
        }
        let has_right = data.contains_key("value") || data.contains_key("value_from");
        if !op.is_presence() && !has_right {
            return Err(policy_validation(format!(
                "value filter with op '{op}' requires 'value' or 'value_from'"
            )));
        }

        let pattern = match (&value, op.is_pattern()) {
            (MatchValue::Literal(Value::String(text)), true) => Some(Pattern::compile(op, text)?),
            (MatchValue::Literal(_), true) => {
                return Err(policy_validation(format!("op '{op}' requires a string value")));
            }
            _ => None,
        };

        let value_path = match (value_type, &value) {
            (Some(ValueType::Expr), MatchValue::Literal(Value::String(expr))) => {
                Some(KeyPath::parse(expr).map_err(|err| {
                    policy_validation(format!("invalid expr value '{expr}': {err}"))
                })?)
            }
            (Some(ValueType::Expr), _) => {
                return Err(policy_validation("value_type 'expr' requires a key path value"));
            }
            _ => None,
        };

        let value_regex = match data.get("value_regex") {
            Some(Value::String(source)) => {
                let regex = Regex::new(source).map_err(|err| {
                    policy_validation(format!("invalid value_regex '{source}': {err}"))
                })?;
                if regex.captures_len() != 2 {
                    return Err(policy_validation(
                        "value_regex must contain exactly one capture group",
                    ));
                }
                Some(regex)
            }
            Some(_) => return Err(policy_validation("value_regex must be a string")),
            None => None,
        };

        Ok(Self {
            key,
            op,
            value,
            value_type,
            default: data.get("default").cloned(),
            value_regex,
            value_path,
            pattern,
        })
    }

    pub fn key(&self) -> Option<&MatchKey> {
        self.key.as_ref()
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn value_type(&self) -> Option<ValueType> {
        self.value_type
    }

    pub fn is_resource_count(&self) -> bool {
        self.value_type == Some(ValueType::ResourceCount)
    }

    /// Left-hand value: key resolution, `default`, then `value_regex` extraction.
    pub fn resolve_left(&self, resource: &Value) -> Value {
        let mut left = self
            .key
            .as_ref()
            .map(|key| key.resolve(resource))
            .unwrap_or(Value::Null);
        if left.is_null()
            && let Some(default) = &self.default
        {
            left = default.clone();
        }
        if let Some(regex) = &self.value_regex {
            left = match left.as_str().and_then(|text| regex.captures(text)) {
                Some(captures) => captures
                    .get(1)
                    .map(|capture| Value::from(capture.as_str()))
                    .unwrap_or(Value::Null),
                None => Value::Null,
            };
        }
        left
    }

    /// Right-hand value, loading `value_from` once per run through the context cache.
    pub async fn resolve_right(&self, ctx: &ExecutionContext) -> Result<Value> {
        let source = match &self.value {
            MatchValue::Literal(value) => return Ok(value.clone()),
            MatchValue::From(source) => source,
        };
        let cache_key = format!("value_from:{}", source.cache_key());
        if let Some(cached) = ctx.cached_value(&cache_key) {
            return Ok(cached);
        }

        let values = source.fetch(ctx.value_from_timeout()).await?;
        if values.as_array().is_some_and(Vec::is_empty) {
            ctx.warn(
                RunWarning::new(
                    WarningKind::ValueFromEmpty,
                    "value",
                    format!("value_from '{}' returned no values", source.url),
                )
                .with_key(self.key.as_ref().map(MatchKey::as_str).unwrap_or_default()),
            );
        }
        ctx.store_value(cache_key, values.clone());
        Ok(values)
    }

    /// Evaluates against one resource with an already-resolved right-hand value.
    pub fn matches(&self, resource: &Value, right: &Value, now: OffsetDateTime) -> bool {
        let left = self.resolve_left(resource);
        if self.op.is_presence() {
            return self.op.check_presence(&left);
        }
        let right = match &self.value_path {
            Some(path) => path.search(resource),
            None => right.clone(),
        };
        self.compare(&left, &right, now)
    }

    /// `resource_count` comparison over the size of the whole set.
    pub fn matches_count(&self, count: usize, right: &Value, now: OffsetDateTime) -> bool {
        self.compare(&Value::from(count as u64), right, now)
    }

    fn compare(&self, left: &Value, right: &Value, now: OffsetDateTime) -> bool {
        let (lhs, rhs) = value_type::coerce(self.value_type, left, right, now);
        operators::apply(self.op, &lhs, &rhs, self.pattern.as_ref())
    }
}
