use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use time::{Duration, OffsetDateTime};

use crate::{
    actions::{Action, ActionBuilder, ActionContext, ActionFactory, ActionResult, ResourceFailure},
    error::{Result, policy_validation},
    filters::tags::{
        DEFAULT_MARK_MESSAGE, DEFAULT_MARK_OP, DEFAULT_MARK_TAG, MAX_MARK_DAYS, MAX_MARK_HOURS,
        bounded_offset, format_action_date, render_mark,
    },
    pool::{chunked, map_chunks},
    registry::Registry,
    resources::{
        Resource, ResourceRef,
        tags::{Tag, remove_local_tags, set_local_tags},
    },
    schema::type_schema,
};

enum TagChange<'a> {
    Add(&'a [Tag]),
    Remove(&'a [String]),
}

/// Pushes a tag change through the resource type's adapter in bounded chunks, then mirrors
/// it onto the local `Tags` of every resource that did not fail.
async fn apply_tag_change(
    resources: &mut [Resource],
    ctx: &ActionContext<'_>,
    change: TagChange<'_>,
) -> Result<ActionResult> {
    let adapter = ctx.manager.tag_adapter().clone();
    let session = ctx.session();
    let ids: Vec<String> = resources.iter().map(|r| ctx.resource_id(r)).collect();
    let chunks = chunked((0..resources.len()).collect::<Vec<_>>(), adapter.chunk_size());

    let view: &[Resource] = resources;
    let results = map_chunks(chunks.clone(), ctx.workers(), ctx.execution, |_, positions| {
        let adapter = &adapter;
        let session = &session;
        let ids = &ids;
        let change = &change;
        async move {
            let targets: Vec<ResourceRef<'_>> = positions
                .iter()
                .map(|&position| ResourceRef {
                    id: &ids[position],
                    resource: &view[position],
                })
                .collect();
            match change {
                TagChange::Add(tags) => adapter.add_tags(session.as_ref(), &targets, tags).await,
                TagChange::Remove(keys) => {
                    adapter.remove_tags(session.as_ref(), &targets, keys).await
                }
            }
        }
    })
    .await;

    let mut failures = Vec::new();
    for chunk in results {
        match chunk.result {
            Ok(partial) => failures.extend(partial),
            Err(err) => failures.extend(
                chunks[chunk.index]
                    .iter()
                    .map(|&position| ResourceFailure::from_error(ids[position].clone(), &err)),
            ),
        }
    }

    let untouched: HashSet<&str> = failures.iter().map(|f| f.resource_id.as_str()).collect();
    for (resource, id) in resources.iter_mut().zip(&ids) {
        if untouched.contains(id.as_str()) {
            continue;
        }
        match &change {
            TagChange::Add(tags) => set_local_tags(resource, tags),
            TagChange::Remove(keys) => remove_local_tags(resource, keys),
        }
    }
    Ok(ActionResult::with_failures(failures))
}

fn tag_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(_) | Value::Bool(_) => Some(value.to_string()),
        _ => None,
    }
}

#[derive(Debug)]
pub struct TagAction {
    config: Map<String, Value>,
    tags: Vec<Tag>,
}

impl TagAction {
    pub fn from_data(data: &Map<String, Value>) -> Result<Self> {
        let mut tags = Vec::new();
        if let Some(Value::Object(map)) = data.get("tags") {
            for (key, value) in map {
                let value = tag_string(value).ok_or_else(|| {
                    policy_validation(format!("tag '{key}' value must be a scalar"))
                })?;
                tags.push(Tag::new(key.clone(), value));
            }
        }
        let key = data.get("key").or_else(|| data.get("tag")).and_then(Value::as_str);
        if let Some(key) = key {
            let value = data
                .get("value")
                .and_then(tag_string)
                .ok_or_else(|| policy_validation(format!("tag '{key}' requires a scalar 'value'")))?;
            tags.push(Tag::new(key, value));
        }
        if tags.is_empty() {
            return Err(policy_validation("tag action requires 'key'/'value' or 'tags'"));
        }
        Ok(Self {
            config: data.clone(),
            tags,
        })
    }
}

#[async_trait]
impl Action for TagAction {
    fn type_name(&self) -> &str {
        "tag"
    }

    fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    async fn process(
        &self,
        resources: &mut [Resource],
        ctx: &ActionContext<'_>,
    ) -> Result<ActionResult> {
        apply_tag_change(resources, ctx, TagChange::Add(&self.tags)).await
    }
}

#[derive(Debug)]
pub struct RemoveTagAction {
    name: &'static str,
    config: Map<String, Value>,
    keys: Vec<String>,
}

impl RemoveTagAction {
    pub fn from_data(name: &'static str, data: &Map<String, Value>) -> Result<Self> {
        let keys = match data.get("tags") {
            None => vec![DEFAULT_MARK_TAG.to_string()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| policy_validation("tag keys must be strings"))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(policy_validation("'tags' must be a list of tag keys")),
        };
        Ok(Self {
            name,
            config: data.clone(),
            keys,
        })
    }
}

#[async_trait]
impl Action for RemoveTagAction {
    fn type_name(&self) -> &str {
        self.name
    }

    fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    async fn process(
        &self,
        resources: &mut [Resource],
        ctx: &ActionContext<'_>,
    ) -> Result<ActionResult> {
        apply_tag_change(resources, ctx, TagChange::Remove(&self.keys)).await
    }
}

/// Tags resources with a future operation, read back by the `marked-for-op` filter.
#[derive(Debug)]
pub struct MarkForOpAction {
    config: Map<String, Value>,
    tag: String,
    op: String,
    message: String,
    offset: Duration,
    with_hours: bool,
}

impl MarkForOpAction {
    pub fn from_data(data: &Map<String, Value>, builder: &ActionBuilder<'_>) -> Result<Self> {
        let op = data
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MARK_OP)
            .to_string();
        if op == "mark-for-op" || !builder.registry.contains(&op) {
            return Err(policy_validation(format!(
                "mark-for-op op '{op}' is not a valid action for this resource"
            )));
        }
        let days = bounded_offset(data, "days", 4, MAX_MARK_DAYS)?;
        let hours = bounded_offset(data, "hours", 0, MAX_MARK_HOURS)?;
        let with_hours = hours > 0;
        let offset = if with_hours {
            Duration::hours(hours)
        } else {
            Duration::days(days)
        };
        Ok(Self {
            config: data.clone(),
            tag: data
                .get("tag")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_MARK_TAG)
                .to_string(),
            message: data
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_MARK_MESSAGE)
                .to_string(),
            op,
            offset,
            with_hours,
        })
    }

    pub fn mark_value(&self, now: OffsetDateTime) -> String {
        let action_date = format_action_date(now.saturating_add(self.offset), self.with_hours);
        render_mark(&self.message, &self.op, &action_date)
    }
}

#[async_trait]
impl Action for MarkForOpAction {
    fn type_name(&self) -> &str {
        "mark-for-op"
    }

    fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    async fn process(
        &self,
        resources: &mut [Resource],
        ctx: &ActionContext<'_>,
    ) -> Result<ActionResult> {
        let tags = [Tag::new(
            self.tag.clone(),
            self.mark_value(OffsetDateTime::now_utc()),
        )];
        apply_tag_change(resources, ctx, TagChange::Add(&tags)).await
    }
}

pub fn register(registry: &mut Registry<ActionFactory>) -> Result<()> {
    let tag: ActionFactory = Arc::new(|data, _builder| Ok(Box::new(TagAction::from_data(data)?)));
    registry.register(
        "tag",
        type_schema(
            "tag",
            json!({
                "key": {"type": "string"},
                "tag": {"type": "string"},
                "value": {"type": ["string", "number", "boolean"]},
                "tags": {"type": "object"}
            }),
            &[],
        ),
        tag,
    )?;

    let remove_schema = |name: &str| {
        type_schema(
            name,
            json!({"tags": {"type": "array", "items": {"type": "string"}}}),
            &[],
        )
    };
    let remove: ActionFactory = Arc::new(|data, _builder| {
        Ok(Box::new(RemoveTagAction::from_data("remove-tag", data)?))
    });
    registry.register("remove-tag", remove_schema("remove-tag"), remove)?;
    let unmark: ActionFactory =
        Arc::new(|data, _builder| Ok(Box::new(RemoveTagAction::from_data("unmark", data)?)));
    registry.register("unmark", remove_schema("unmark"), unmark)?;
    registry.register_alias("untag", "unmark")?;

    let mark: ActionFactory =
        Arc::new(|data, builder| Ok(Box::new(MarkForOpAction::from_data(data, builder)?)));
    registry.register(
        "mark-for-op",
        type_schema(
            "mark-for-op",
            json!({
                "tag": {"type": "string"},
                "op": {"type": "string"},
                "msg": {"type": "string"},
                "days": {"type": "integer", "minimum": 0, "maximum": MAX_MARK_DAYS},
                "hours": {"type": "integer", "minimum": 0, "maximum": MAX_MARK_HOURS}
            }),
            &[],
        ),
        mark,
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::{MarkForOpAction, RemoveTagAction, TagAction};
    use crate::{
        actions::{ActionBuilder, ActionFactory, register_defaults},
        error::ErrorKind,
        filters::tags::parse_mark,
        registry::Registry,
    };

    #[test]
    fn tag_accepts_pair_and_map() {
        let action = TagAction::from_data(
            json!({"type": "tag", "key": "Env", "value": "prod", "tags": {"Cost": 42}})
                .as_object()
                .unwrap(),
        )
        .expect("tag should build");
        let keys: Vec<&str> = action.tags.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["Cost", "Env"]);
        assert_eq!(action.tags[0].value, "42");

        let err = TagAction::from_data(json!({"type": "tag"}).as_object().unwrap())
            .expect_err("empty tag should fail");
        assert_eq!(err.kind, ErrorKind::PolicyValidation);
    }

    #[test]
    fn remove_tag_defaults_to_mark_tag() {
        let action = RemoveTagAction::from_data("unmark", json!({"type": "unmark"}).as_object().unwrap())
            .expect("unmark should build");
        assert_eq!(action.keys, vec!["maid_status"]);
    }

    #[test]
    fn mark_for_op_validates_op_and_renders_message() {
        let mut registry: Registry<ActionFactory> = Registry::new("action");
        register_defaults(&mut registry).unwrap();
        let builder = ActionBuilder::new(&registry);

        let err = MarkForOpAction::from_data(
            json!({"type": "mark-for-op", "op": "stop"}).as_object().unwrap(),
            &builder,
        )
        .expect_err("stop is not registered on this registry");
        assert!(err.message.contains("not a valid action"));

        let action = MarkForOpAction::from_data(
            json!({"type": "mark-for-op", "op": "notify", "days": 2}).as_object().unwrap(),
            &builder,
        )
        .expect("mark should build");
        let value = action.mark_value(datetime!(2026-01-30 10:00 UTC));
        assert_eq!(value, "Resource does not meet policy: notify@2026/02/01");
        let (op, when) = parse_mark(&value).unwrap();
        assert_eq!(op, "notify");
        assert_eq!(when, datetime!(2026-02-01 00:00 UTC));
    }

    #[test]
    fn mark_for_op_rejects_offsets_beyond_a_century() {
        let mut registry: Registry<ActionFactory> = Registry::new("action");
        register_defaults(&mut registry).unwrap();
        let builder = ActionBuilder::new(&registry);

        for data in [
            json!({"type": "mark-for-op", "op": "notify", "days": 10_000_000}),
            json!({"type": "mark-for-op", "op": "notify", "hours": u64::MAX}),
        ] {
            let err = MarkForOpAction::from_data(data.as_object().unwrap(), &builder)
                .expect_err("offset should be rejected");
            assert_eq!(err.kind, ErrorKind::PolicyValidation);
        }

        let action = MarkForOpAction::from_data(
            json!({"type": "mark-for-op", "op": "notify", "days": 36_500}).as_object().unwrap(),
            &builder,
        )
        .expect("a century is accepted");
        assert!(
            action
                .mark_value(datetime!(2026-01-30 10:00 UTC))
                .ends_with("@2126/01/06")
        );
    }
}
