use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{
    error::Result,
    filters::{Filter, FilterContext, FilterFactory, value::value_schema_properties},
    matcher::ValueMatcher,
    registry::Registry,
    resources::Resource,
    schema::type_schema,
};

/// Value match against the triggering event rather than each resource.
#[derive(Debug)]
pub struct EventFilter {
    matcher: ValueMatcher,
}

impl EventFilter {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        Ok(Self {
            matcher: ValueMatcher::from_data(data)?,
        })
    }
}

#[async_trait]
impl Filter for EventFilter {
    fn type_name(&self) -> &str {
        "event"
    }

    async fn process(
        &self,
        resources: Vec<Resource>,
        ctx: &FilterContext<'_>,
    ) -> Result<Vec<Resource>> {
        let Some(event) = ctx.event else {
            return Ok(resources);
        };
        let right = self.matcher.resolve_right(ctx.execution).await?;
        if self.matcher.matches(event, &right, ctx.now) {
            Ok(resources)
        } else {
            Ok(Vec::new())
        }
    }
}

pub fn register(registry: &mut Registry<FilterFactory>) -> Result<()> {
    let factory: FilterFactory =
        Arc::new(|data, _builder| Ok(Box::new(EventFilter::from_data(data)?)));
    registry.register(
        "event",
        type_schema("event", value_schema_properties(), &[]),
        factory,
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::EventFilter;
    use crate::{
        context::ExecutionContext,
        filters::{Filter, FilterContext},
        resources::Resource,
    };

    #[tokio::test]
    async fn gates_on_event_payload() {
        let filter = EventFilter::from_data(
            json!({"type": "event", "key": "detail.eventName", "value": "RunInstances"})
                .as_object()
                .unwrap(),
        )
        .expect("filter should build");
        let ctx = ExecutionContext::new("p");
        let input = vec![Resource::new()];

        let matching = json!({"detail": {"eventName": "RunInstances"}});
        let fctx = FilterContext::new(&ctx, None, Some(&matching));
        assert_eq!(filter.process(input.clone(), &fctx).await.unwrap().len(), 1);

        let other = json!({"detail": {"eventName": "StopInstances"}});
        let fctx = FilterContext::new(&ctx, None, Some(&other));
        assert!(filter.process(input.clone(), &fctx).await.unwrap().is_empty());

        let fctx = FilterContext::new(&ctx, None, None);
        assert_eq!(filter.process(input, &fctx).await.unwrap().len(), 1);
    }
}
