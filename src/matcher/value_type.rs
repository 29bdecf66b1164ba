use std::{fmt, str::FromStr};

use ipnetwork::IpNetwork;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::{
    error::{CustodianError, Result, policy_validation},
    matcher::{dates::parse_date, operators::Operand},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Age,
    Expiration,
    Date,
    Integer,
    Normalize,
    Size,
    UniqueSize,
    Cidr,
    CidrSize,
    Swap,
    Version,
    ResourceCount,
    Expr,
}

const VALUE_TYPE_NAMES: &[(&str, ValueType)] = &[
    ("age", ValueType::Age),
    ("expiration", ValueType::Expiration),
    ("date", ValueType::Date),
    ("integer", ValueType::Integer),
    ("normalize", ValueType::Normalize),
    ("size", ValueType::Size),
    ("unique_size", ValueType::UniqueSize),
    ("cidr", ValueType::Cidr),
    ("cidr_size", ValueType::CidrSize),
    ("swap", ValueType::Swap),
    ("version", ValueType::Version),
    ("resource_count", ValueType::ResourceCount),
    ("expr", ValueType::Expr),
];

impl ValueType {
    pub fn names() -> Vec<&'static str> {
        VALUE_TYPE_NAMES.iter().map(|(name, _)| *name).collect()
    }

    pub fn as_str(self) -> &'static str {
        VALUE_TYPE_NAMES
            .iter()
            .find(|(_, value_type)| *value_type == self)
            .map(|(name, _)| *name)
            .unwrap_or("expr")
    }
}

impl FromStr for ValueType {
    type Err = CustodianError;

    fn from_str(name: &str) -> Result<Self> {
        VALUE_TYPE_NAMES
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, value_type)| *value_type)
            .ok_or_else(|| {
                policy_validation(format!(
                    "invalid value_type '{name}'; valid choices: {}",
                    ValueType::names().join(", ")
                ))
            })
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coerces `(left, right)` into the operand pair the operator is applied to.
///
/// `age` puts the sentinel `now - N days` on the left so `gt N` reads "older than N
/// days"; `expiration` compares the resource date with `now + N days`.
pub fn coerce(
    value_type: Option<ValueType>,
    left: &Value,
    right: &Value,
    now: OffsetDateTime,
) -> (Operand, Operand) {
    let Some(value_type) = value_type else {
        return (Operand::from_json(left), Operand::from_json(right));
    };
    match value_type {
        ValueType::Age => (
            days_offset(now, right, -1.0),
            date_operand(left),
        ),
        ValueType::Expiration => (date_operand(left), days_offset(now, right, 1.0)),
        ValueType::Date => (date_operand(left), date_operand(right)),
        ValueType::Integer => (Operand::Number(integer(left)), Operand::Number(integer(right))),
        ValueType::Normalize => (normalize(left), normalize(right)),
        ValueType::Size => (size(left, false), Operand::from_json(right)),
        ValueType::UniqueSize => (size(left, true), Operand::from_json(right)),
        ValueType::Cidr => (network(left), network(right)),
        ValueType::CidrSize => (
            parse_network(left)
                .map(|net| Operand::Number(f64::from(net.prefix())))
                .unwrap_or(Operand::Json(Value::Null)),
            Operand::from_json(right),
        ),
        ValueType::Swap => (Operand::from_json(right), Operand::from_json(left)),
        ValueType::Version => (version(left), version(right)),
        ValueType::ResourceCount | ValueType::Expr => {
            (Operand::from_json(left), Operand::from_json(right))
        }
    }
}

fn days_offset(now: OffsetDateTime, days: &Value, sign: f64) -> Operand {
    let days = match days {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    days.and_then(|days| Duration::checked_seconds_f64(sign * days * 86_400.0))
        .and_then(|offset| now.checked_add(offset))
        .map(Operand::Date)
        .unwrap_or(Operand::Json(Value::Null))
}

fn date_operand(value: &Value) -> Operand {
    parse_date(value)
        .map(Operand::Date)
        .unwrap_or(Operand::Json(Value::Null))
}

fn integer(value: &Value) -> f64 {
    match value {
        Value::Number(number) => number.as_f64().map(f64::trunc).unwrap_or(0.0),
        Value::String(text) => text.trim().parse::<i64>().map(|n| n as f64).unwrap_or(0.0),
        Value::Bool(flag) => f64::from(u8::from(*flag)),
        _ => 0.0,
    }
}

fn normalize(value: &Value) -> Operand {
    match value {
        Value::String(text) => Operand::Json(Value::String(text.trim().to_lowercase())),
        Value::Array(items) => Operand::List(items.iter().map(normalize).collect()),
        other => Operand::from_json(other),
    }
}

fn size(value: &Value, unique: bool) -> Operand {
    let len = match value {
        Value::Array(items) if unique => {
            let mut seen: Vec<&Value> = Vec::with_capacity(items.len());
            for item in items {
                if !seen.contains(&item) {
                    seen.push(item);
                }
            }
            seen.len()
        }
        Value::Array(items) => items.len(),
        Value::String(text) => text.chars().count(),
        Value::Object(map) => map.len(),
        _ => 0,
    };
    Operand::Number(len as f64)
}

fn parse_network(value: &Value) -> Option<IpNetwork> {
    value.as_str().and_then(|text| text.trim().parse().ok())
}

fn network(value: &Value) -> Operand {
    match value {
        Value::Array(items) => Operand::List(items.iter().map(network).collect()),
        other => parse_network(other)
            .map(Operand::Network)
            .unwrap_or_else(|| Operand::from_json(other)),
    }
}

fn version(value: &Value) -> Operand {
    let text = match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) => return Operand::List(items.iter().map(version).collect()),
        _ => return Operand::Json(Value::Null),
    };
    let parts: Option<Vec<u64>> = text
        .trim()
        .trim_start_matches(['v', 'V'])
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<u64>().ok()
        })
        .collect();
    parts
        .map(Operand::Version)
        .unwrap_or(Operand::Json(Value::Null))
}
