use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use time::{
    Date, Duration, OffsetDateTime, PrimitiveDateTime, format_description::BorrowedFormatItem,
    macros::format_description,
};

use crate::{
    error::{Result, policy_validation},
    filters::{Filter, FilterContext, FilterFactory},
    matcher::{Operand, Operator, operators},
    registry::Registry,
    resources::{
        Resource,
        tags::{tag_value, tags_of},
    },
    schema::type_schema,
};

pub const DEFAULT_MARK_TAG: &str = "maid_status";
pub const DEFAULT_MARK_OP: &str = "stop";
pub const DEFAULT_MARK_MESSAGE: &str = "Resource does not meet policy: {op}@{action_date}";
pub const MAX_MARK_DAYS: u64 = 36_500;
pub const MAX_MARK_HOURS: u64 = MAX_MARK_DAYS * 24;

const DAY_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]/[month]/[day]");
const HOUR_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]/[month]/[day] [hour][minute] UTC");

/// Renders the action date written by `mark-for-op`.
pub fn format_action_date(when: OffsetDateTime, with_hours: bool) -> String {
    let when = when.to_offset(time::UtcOffset::UTC);
    let format = if with_hours { HOUR_FORMAT } else { DAY_FORMAT };
    when.format(format).unwrap_or_default()
}

/// Renders a mark message, substituting `{op}` and `{action_date}`.
pub fn render_mark(template: &str, op: &str, action_date: &str) -> String {
    let mut message = template
        .replace("{op}", op)
        .replace("{action_date}", action_date);
    if !template.contains("{op}") || !template.contains("{action_date}") {
        message = format!("{message}: {op}@{action_date}");
    }
    message
}

/// Parses `"<msg>: <op>@<YYYY/MM/DD>[ HHMM UTC]"` into the op and the action time.
pub fn parse_mark(value: &str) -> Option<(String, OffsetDateTime)> {
    let (_, target) = value.rsplit_once(':')?;
    let (op, date) = target.trim().split_once('@')?;
    let date = date.trim();
    let when = match PrimitiveDateTime::parse(date, HOUR_FORMAT) {
        Ok(datetime) => datetime.assume_utc(),
        Err(_) => Date::parse(date, DAY_FORMAT).ok()?.midnight().assume_utc(),
    };
    Some((op.trim().to_string(), when))
}

/// Matches resources whose count of user tags satisfies `op` against `count`.
#[derive(Debug)]
pub struct TagCountFilter {
    count: u64,
    op: Operator,
}

impl TagCountFilter {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        let count = match data.get("count") {
            None => 10,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| policy_validation("tag-count 'count' must be a non-negative integer"))?,
        };
        let op = match data.get("op").and_then(Value::as_str) {
            Some(name) => Operator::from_str(name)?,
            None => Operator::Gte,
        };
        Ok(Self { count, op })
    }
}

#[async_trait]
impl Filter for TagCountFilter {
    fn type_name(&self) -> &str {
        "tag-count"
    }

    async fn process(
        &self,
        resources: Vec<Resource>,
        _ctx: &FilterContext<'_>,
    ) -> Result<Vec<Resource>> {
        let right = Operand::Number(self.count as f64);
        Ok(resources
            .into_iter()
            .filter(|resource| {
                let user_tags = tags_of(resource)
                    .iter()
                    .filter(|tag| !tag.key.starts_with("aws:"))
                    .count();
                operators::apply(self.op, &Operand::Number(user_tags as f64), &right, None)
            })
            .collect())
    }
}

/// Matches resources tagged by `mark-for-op` whose action date has arrived.
#[derive(Debug)]
pub struct MarkedForOpFilter {
    tag: String,
    op: String,
    skew: Duration,
}

impl MarkedForOpFilter {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        let tag = data
            .get("tag")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MARK_TAG)
            .to_string();
        let op = data
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MARK_OP)
            .to_string();
        let days = bounded_offset(data, "skew", 0, MAX_MARK_DAYS)?;
        let hours = bounded_offset(data, "skew_hours", 0, MAX_MARK_HOURS)?;
        Ok(Self {
            tag,
            op,
            skew: Duration::days(days) + Duration::hours(hours),
        })
    }

    fn is_due(&self, resource: &Resource, now: OffsetDateTime) -> bool {
        let Some(value) = tag_value(resource, &self.tag) else {
            return false;
        };
        match parse_mark(&value) {
            Some((op, when)) => op == self.op && when <= now.saturating_add(self.skew),
            None => {
                tracing::debug!(
                    target: "filters",
                    tag = %self.tag,
                    value = %value,
                    "mark_tag_unparsable"
                );
                false
            }
        }
    }
}

/// Reads a day or hour offset, rejecting values beyond `max`.
pub fn bounded_offset(data: &Map<String, Value>, key: &str, default: u64, max: u64) -> Result<i64> {
    let value = match data.get(key) {
        None => default,
        Some(value) => value
            .as_u64()
            .ok_or_else(|| policy_validation(format!("'{key}' must be a non-negative integer")))?,
    };
    if value > max {
        return Err(policy_validation(format!("'{key}' must be at most {max}")));
    }
    Ok(value as i64)
}

#[async_trait]
impl Filter for MarkedForOpFilter {
    fn type_name(&self) -> &str {
        "marked-for-op"
    }

    async fn process(
        &self,
        resources: Vec<Resource>,
        ctx: &FilterContext<'_>,
    ) -> Result<Vec<Resource>> {
        Ok(resources
            .into_iter()
            .filter(|resource| self.is_due(resource, ctx.now))
            .collect())
    }
}

pub fn register(registry: &mut Registry<FilterFactory>) -> Result<()> {
    let tag_count: FilterFactory =
        Arc::new(|data, _builder| Ok(Box::new(TagCountFilter::from_data(data)?)));
    registry.register(
        "tag-count",
        type_schema(
            "tag-count",
            json!({
                "count": {"type": "integer", "minimum": 0},
                "op": {"enum": Operator::names()}
            }),
            &[],
        ),
        tag_count,
    )?;

    let marked: FilterFactory =
        Arc::new(|data, _builder| Ok(Box::new(MarkedForOpFilter::from_data(data)?)));
    registry.register(
        "marked-for-op",
        type_schema(
            "marked-for-op",
            json!({
                "tag": {"type": "string"},
                "op": {"type": "string"},
                "skew": {"type": "integer", "minimum": 0, "maximum": MAX_MARK_DAYS},
                "skew_hours": {"type": "integer", "minimum": 0, "maximum": MAX_MARK_HOURS}
            }),
            &[],
        ),
        marked,
    )
}
