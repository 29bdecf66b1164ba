use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::{
    error::Result,
    filters::{Filter, FilterContext, FilterFactory},
    matcher::{MatchKey, Operator, ValueMatcher, ValueType, ValuesFrom},
    registry::Registry,
    resources::{MATCHED_FILTERS_ANNOTATION, Resource, annotate_append},
    schema::{type_schema, typed_schema},
};

#[derive(Debug)]
pub struct ValueFilter {
    matcher: ValueMatcher,
}

impl ValueFilter {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        Ok(Self {
            matcher: ValueMatcher::from_data(data)?,
        })
    }

    pub fn matcher(&self) -> &ValueMatcher {
        &self.matcher
    }
}

#[async_trait]
impl Filter for ValueFilter {
    fn type_name(&self) -> &str {
        "value"
    }

    async fn process(
        &self,
        resources: Vec<Resource>,
        ctx: &FilterContext<'_>,
    ) -> Result<Vec<Resource>> {
        let right = self.matcher.resolve_right(ctx.execution).await?;

        if self.matcher.is_resource_count() {
            return Ok(if self.matcher.matches_count(resources.len(), &right, ctx.now) {
                resources
            } else {
                Vec::new()
            });
        }

        let key = self.matcher.key().map(MatchKey::as_str);
        let mut matched = Vec::with_capacity(resources.len());
        for resource in resources {
            let document = Value::Object(resource);
            let hit = self.matcher.matches(&document, &right, ctx.now);
            let Value::Object(mut resource) = document else {
                continue;
            };
            if hit {
                if let Some(key) = &key {
                    annotate_append(
                        &mut resource,
                        MATCHED_FILTERS_ANNOTATION,
                        [Value::from(key.as_str())],
                    );
                }
                matched.push(resource);
            }
        }
        Ok(matched)
    }
}

pub fn value_schema_properties() -> Value {
    json!({
        "key": {"type": "string"},
        "value_type": {"enum": ValueType::names()},
        "default": {},
        "value_regex": {"type": "string"},
        "value_from": typed_schema::<ValuesFrom>(),
        "value": {"oneOf": [
            {"type": "array"},
            {"type": "string"},
            {"type": "boolean"},
            {"type": "number"},
            {"type": "null"}
        ]},
        "op": {"enum": Operator::names()}
    })
}

pub fn register(registry: &mut Registry<FilterFactory>) -> Result<()> {
    let factory: FilterFactory =
        Arc::new(|data, _builder| Ok(Box::new(ValueFilter::from_data(data)?)));
    registry.register("value", type_schema("value", value_schema_properties(), &[]), factory)
}
