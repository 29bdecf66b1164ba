use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::{
    error::{Result, policy_validation},
    filters::{Filter, FilterBuilder, FilterContext, FilterFactory, prefix_path},
    registry::Registry,
    resources::Resource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanOp {
    And,
    Or,
    Not,
}

impl BooleanOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BooleanOp::And => "and",
            BooleanOp::Or => "or",
            BooleanOp::Not => "not",
        }
    }

    /// Recognises `{"or": [...]}` as well as `{"type": "or", "filters": [...]}`.
    pub fn from_mapping(map: &Map<String, Value>) -> Option<Self> {
        let name = if map.len() == 1 {
            map.keys().next().map(String::as_str)
        } else {
            map.get("type").and_then(Value::as_str)
        }?;
        match name {
            "and" => Some(BooleanOp::And),
            "or" => Some(BooleanOp::Or),
            "not" => Some(BooleanOp::Not),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct BooleanFilter {
    op: BooleanOp,
    children: Vec<Box<dyn Filter>>,
}

impl BooleanFilter {
    pub fn new(op: BooleanOp, children: Vec<Box<dyn Filter>>) -> Self {
        Self { op, children }
    }

    async fn all(
        &self,
        mut resources: Vec<Resource>,
        ctx: &FilterContext<'_>,
    ) -> Result<Vec<Resource>> {
        for child in &self.children {
            if resources.is_empty() {
                break;
            }
            resources = child.process(resources, ctx).await?;
        }
        Ok(resources)
    }

    /// Each child sees only resources no earlier child matched.
    async fn any(
        &self,
        resources: Vec<Resource>,
        ctx: &FilterContext<'_>,
    ) -> Result<Vec<Resource>> {
        let ids: Vec<String> = resources.iter().map(|r| ctx.identity(r)).collect();
        let mut matched: Vec<Option<Resource>> = vec![None; resources.len()];
        let mut open: Vec<usize> = (0..resources.len()).collect();

        for child in &self.children {
            if open.is_empty() {
                break;
            }
            let input = open.iter().map(|&i| resources[i].clone()).collect();
            let output = child.process(input, ctx).await?;
            for (position, resource) in claim_positions(&ids, &open, output, ctx) {
                matched[position] = Some(resource);
            }
            open.retain(|&i| matched[i].is_none());
        }

        Ok(matched.into_iter().flatten().collect())
    }

    async fn none(
        &self,
        resources: Vec<Resource>,
        ctx: &FilterContext<'_>,
    ) -> Result<Vec<Resource>> {
        let ids: Vec<String> = resources.iter().map(|r| ctx.identity(r)).collect();
        let open: Vec<usize> = (0..resources.len()).collect();
        let hits = self.all(resources.clone(), ctx).await?;
        let mut excluded = vec![false; resources.len()];
        for (position, _) in claim_positions(&ids, &open, hits, ctx) {
            excluded[position] = true;
        }
        Ok(resources
            .into_iter()
            .zip(excluded)
            .filter_map(|(resource, hit)| (!hit).then_some(resource))
            .collect())
    }
}

/// Maps each returned resource back to the first unclaimed input position with its identity,
/// so inputs sharing an identity are counted once each.
fn claim_positions(
    ids: &[String],
    open: &[usize],
    output: Vec<Resource>,
    ctx: &FilterContext<'_>,
) -> Vec<(usize, Resource)> {
    let mut claimed = vec![false; open.len()];
    let mut placed = Vec::with_capacity(output.len());
    for resource in output {
        let id = ctx.identity(&resource);
        let slot = open
            .iter()
            .enumerate()
            .find(|(slot, position)| !claimed[*slot] && ids[**position] == id);
        if let Some((slot, &position)) = slot {
            claimed[slot] = true;
            placed.push((position, resource));
        }
    }
    placed
}

#[async_trait]
impl Filter for BooleanFilter {
    fn type_name(&self) -> &str {
        self.op.as_str()
    }

    fn permissions(&self) -> Vec<String> {
        self.children
            .iter()
            .flat_map(|child| child.permissions())
            .collect()
    }

    async fn process(
        &self,
        resources: Vec<Resource>,
        ctx: &FilterContext<'_>,
    ) -> Result<Vec<Resource>> {
        match self.op {
            BooleanOp::And => self.all(resources, ctx).await,
            BooleanOp::Or => self.any(resources, ctx).await,
            BooleanOp::Not => self.none(resources, ctx).await,
        }
    }
}

/// Children of a boolean node, under either the op key or `filters`.
pub fn children(op: BooleanOp, map: &Map<String, Value>) -> Option<&Vec<Value>> {
    map.get(op.as_str())
        .or_else(|| map.get("filters"))
        .and_then(Value::as_array)
}

pub fn build(
    op: BooleanOp,
    map: &Map<String, Value>,
    builder: &FilterBuilder<'_>,
) -> Result<Box<dyn Filter>> {
    let items = children(op, map).ok_or_else(|| {
        policy_validation(format!("'{}' requires a list of filters", op.as_str()))
    })?;
    let children = builder
        .build_all(items)
        .map_err(|err| prefix_path(err, &format!("/{}", op.as_str())))?;
    Ok(Box::new(BooleanFilter::new(op, children)))
}

pub fn register(registry: &mut Registry<FilterFactory>) -> Result<()> {
    for op in [BooleanOp::And, BooleanOp::Or, BooleanOp::Not] {
        let name = op.as_str();
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "required": [name],
            "properties": {
                name: {"type": "array", "items": {"type": "object"}}
            }
        });
        let factory: FilterFactory = Arc::new(move |data, builder| build(op, data, builder));
        registry.register(name, schema, factory)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use crate::{
        context::ExecutionContext,
        filters::{FilterBuilder, FilterContext, FilterFactory, register_defaults},
        registry::Registry,
        resources::Resource,
    };

    fn resources(value: Value) -> Vec<Resource> {
        value
            .as_array()
            .expect("array")
            .iter()
            .map(|item| item.as_object().cloned().expect("object"))
            .collect()
    }

    async fn run(filter: Value, input: Value) -> Vec<Value> {
        let mut registry: Registry<FilterFactory> = Registry::new("filter");
        register_defaults(&mut registry).unwrap();
        let builder = FilterBuilder::new(&registry, None);
        let filter = builder.build(&filter).expect("filter should build");
        let ctx = ExecutionContext::new("p");
        let fctx = FilterContext::new(&ctx, None, None);
        filter
            .process(resources(input), &fctx)
            .await
            .expect("filter should run")
            .into_iter()
            .map(|mut r| {
                r.retain(|key, _| !key.starts_with("c7n:"));
                Value::Object(r)
            })
            .collect()
    }

    #[tokio::test]
    async fn or_of_and_preserves_input_order() {
        let out = run(
            json!({"or": [
                {"type": "value", "key": "x", "value": 2},
                {"and": [
                    {"type": "value", "key": "x", "value": 1},
                    {"type": "value", "key": "y", "value": 7}
                ]}
            ]}),
            json!([{"x": 1, "y": 7}, {"x": 2, "y": 5}, {"x": 1, "y": 5}]),
        )
        .await;
        assert_eq!(out, vec![json!({"x": 1, "y": 7}), json!({"x": 2, "y": 5})]);
    }

    #[tokio::test]
    async fn not_returns_the_complement() {
        let out = run(
            json!({"not": [{"type": "value", "key": "x", "value": 1}]}),
            json!([{"x": 1}, {"x": 2}, {"x": 3}]),
        )
        .await;
        assert_eq!(out, vec![json!({"x": 2}), json!({"x": 3})]);
    }

    #[tokio::test]
    async fn identical_resources_are_kept_once_each() {
        let out = run(
            json!({"or": [
                {"type": "value", "key": "x", "value": 9},
                {"type": "value", "key": "x", "value": 1}
            ]}),
            json!([{"x": 1}, {"x": 2}, {"x": 1}]),
        )
        .await;
        assert_eq!(out, vec![json!({"x": 1}), json!({"x": 1})]);

        let out = run(
            json!({"not": [{"type": "value", "key": "x", "value": 1}]}),
            json!([{"x": 2}, {"x": 1}, {"x": 2}]),
        )
        .await;
        assert_eq!(out, vec![json!({"x": 2}), json!({"x": 2})]);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let out = run(
            json!({"or": [{"type": "value", "key": "x", "value": 1}]}),
            json!([]),
        )
        .await;
        assert!(out.is_empty());
    }
}
