//! Enumerate, augment, filter and act for one bound resource manager.

use std::{
    collections::{BTreeMap, HashSet},
    time::Instant,
};

use serde_json::{Map, Value};

use crate::{
    actions::{Action, ActionContext, Collaborators, engine},
    context::{ExecutionContext, RunWarning, WarningKind},
    error::{ErrorKind, Result, augment_error, filter_error},
    filters::{Filter, FilterContext, apply_all},
    metrics::{Dimensions, RESOURCE_COUNT_METRIC, RESOURCE_TIME_METRIC},
    pool::{chunked, map_chunks},
    resources::{CacheKey, PARENT_ID_ANNOTATION, Resource, ResourceManager, scalar_string},
};

/// Caps on how many resources a policy may act on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceLimits {
    pub max_resources: Option<u64>,
    pub max_percent: Option<f64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.max_resources.is_none() && self.max_percent.is_none()
    }

    pub fn check(&self, policy: &str, enumerated: usize, selected: usize) -> Result<()> {
        if let Some(max) = self.max_resources
            && selected as u64 > max
        {
            return Err(filter_error(format!(
                "policy '{policy}' matched {selected} resources, exceeding max-resources {max}"
            )));
        }
        if let Some(percent) = self.max_percent
            && enumerated > 0
        {
            let actual = selected as f64 * 100.0 / enumerated as f64;
            if actual > percent {
                return Err(filter_error(format!(
                    "policy '{policy}' matched {actual:.1}% of resources, exceeding max-resources-percent {percent}"
                )));
            }
        }
        Ok(())
    }
}

/// Which resources feed the filter stage.
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    All,
    Ids(&'a [String]),
}

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub enumerated: usize,
    pub resources: Vec<Resource>,
}

/// Everything the pipeline needs beyond the run context.
pub struct Pipeline<'a> {
    pub manager: &'a ResourceManager,
    pub filters: &'a [Box<dyn Filter>],
    pub actions: &'a [Box<dyn Action>],
    pub limits: ResourceLimits,
    pub collaborators: &'a Collaborators,
    pub event: Option<&'a Value>,
}

impl Pipeline<'_> {
    pub async fn run(&self, source: Source<'_>, ctx: &ExecutionContext) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let resources = match source {
            Source::All => self.manager.resources(ctx).await?,
            Source::Ids(ids) => self.manager.get_resources(ids, ctx).await?,
        };
        let enumerated = resources.len();

        let fctx = FilterContext::new(ctx, Some(self.manager), self.event);
        let mut selected = apply_all(self.filters, resources, &fctx).await?;

        let mut dims = Dimensions::new();
        dims.insert("resource_type".to_string(), self.manager.type_name());
        ctx.gauge(RESOURCE_COUNT_METRIC, selected.len() as f64, dims.clone());
        ctx.histogram(RESOURCE_TIME_METRIC, started.elapsed().as_secs_f64(), dims);
        tracing::info!(
            target: "pipeline",
            policy = ctx.policy(),
            resource_type = %self.manager.type_name(),
            enumerated = enumerated,
            selected = selected.len(),
            "resources_selected"
        );

        self.limits.check(ctx.policy(), enumerated, selected.len())?;

        if !selected.is_empty() && !self.actions.is_empty() {
            let actx = ActionContext::new(ctx, self.manager, self.event, self.collaborators);
            engine::run_actions(self.actions, &mut selected, &actx).await?;
        }
        Ok(PipelineOutcome {
            enumerated,
            resources: selected,
        })
    }
}

pub(crate) async fn load_resources(
    manager: &ResourceManager,
    ctx: &ExecutionContext,
) -> Result<Vec<Resource>> {
    let options = &manager.options().session;
    let key = CacheKey::new(
        options.account_id.clone(),
        options.region.clone(),
        manager.type_name(),
        Value::Object(manager.descriptor().enum_spec.params.clone()),
    );
    if let Some(cached) = manager.cache().load(&key) {
        tracing::debug!(
            target: "cache",
            resource_type = %manager.type_name(),
            count = cached.len(),
            "cache_hit"
        );
        return Ok(cached);
    }

    let raw = enumerate(manager, ctx).await?;
    let resources = dedup(manager, augment(manager, raw, ctx).await?, ctx);
    if let Err(err) = manager.cache().save(&key, &resources) {
        tracing::warn!(
            target: "cache",
            resource_type = %manager.type_name(),
            error = %err,
            "cache_save_failed"
        );
    }
    Ok(resources)
}

pub(crate) async fn load_by_ids(
    manager: &ResourceManager,
    ids: &[String],
    ctx: &ExecutionContext,
) -> Result<Vec<Resource>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let descriptor = manager.descriptor();
    let adapter = &manager.resource_type().adapter;
    if !adapter.supports_ids(descriptor) || descriptor.parent_spec.is_some() {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        return Ok(load_resources(manager, ctx)
            .await?
            .into_iter()
            .filter(|resource| {
                descriptor
                    .native_id(resource)
                    .is_some_and(|id| wanted.contains(id.as_str()))
                    || wanted.contains(manager.resource_id(resource).as_str())
            })
            .collect());
    }

    let mut raw = Vec::new();
    for batch in ids.chunks(manager.options().chunk_size.max(1)) {
        let params = adapter.ids_params(descriptor, batch);
        raw.extend(list_all(manager, &params, ctx).await?);
    }
    Ok(dedup(manager, augment(manager, raw, ctx).await?, ctx))
}

async fn enumerate(manager: &ResourceManager, ctx: &ExecutionContext) -> Result<Vec<Resource>> {
    let descriptor = manager.descriptor();
    let Some(parent_spec) = &descriptor.parent_spec else {
        return list_all(manager, &descriptor.enum_spec.params, ctx).await;
    };

    let parents = manager.related_manager(&parent_spec.parent_type)?;
    let mut children = Vec::new();
    for parent in parents.resources(ctx).await? {
        let parent_value = match &parent_spec.parent_key {
            Some(key) => parent.get(key).cloned(),
            None => parents
                .descriptor()
                .native_id(&parent)
                .map(Value::from),
        };
        let Some(parent_value) = parent_value else {
            continue;
        };
        let mut params = descriptor.enum_spec.params.clone();
        params.insert(parent_spec.param.clone(), parent_value);
        let parent_id = parents.resource_id(&parent);
        for mut child in list_all(manager, &params, ctx).await? {
            child.insert(PARENT_ID_ANNOTATION.to_string(), Value::from(parent_id.as_str()));
            children.push(child);
        }
    }
    Ok(children)
}

async fn list_all(
    manager: &ResourceManager,
    params: &Map<String, Value>,
    ctx: &ExecutionContext,
) -> Result<Vec<Resource>> {
    let adapter = &manager.resource_type().adapter;
    let mut items = Vec::new();
    let mut token: Option<Value> = None;
    let mut pages = 0usize;
    loop {
        ctx.check_deadline()?;
        let page = adapter
            .list_page(
                manager.session().as_ref(),
                manager.descriptor(),
                params,
                token.as_ref(),
            )
            .await?;
        pages += 1;
        items.extend(page.items);
        match page.next {
            Some(next) if token.as_ref() != Some(&next) => token = Some(next),
            _ => break,
        }
    }
    tracing::debug!(
        target: "pipeline",
        resource_type = %manager.type_name(),
        pages = pages,
        count = items.len(),
        "resources_listed"
    );
    Ok(items)
}

async fn augment(
    manager: &ResourceManager,
    resources: Vec<Resource>,
    ctx: &ExecutionContext,
) -> Result<Vec<Resource>> {
    let descriptor = manager.descriptor();
    let Some(detail) = &descriptor.detail_spec else {
        return Ok(resources);
    };
    if resources.is_empty() {
        return Ok(resources);
    }

    let chunks = chunked(resources, detail.batch_size);
    let chunk_ids: Vec<Vec<String>> = chunks
        .iter()
        .map(|chunk| chunk.iter().map(|r| manager.resource_id(r)).collect())
        .collect();
    let adapter = &manager.resource_type().adapter;
    let session = manager.session().as_ref();
    let results = map_chunks(chunks, manager.options().workers, ctx, |_, chunk| async move {
        adapter.augment(session, descriptor, chunk).await
    })
    .await;

    let mut augmented = Vec::new();
    let mut dropped: BTreeMap<String, String> = BTreeMap::new();
    for chunk in results {
        match chunk.result {
            Ok(batch) => {
                augmented.extend(batch.resources);
                for failure in batch.dropped {
                    dropped.insert(failure.resource_id, failure.reason);
                }
            }
            Err(err) if matches!(err.kind, ErrorKind::Timeout | ErrorKind::Cancelled) => {
                return Err(err);
            }
            Err(err) => {
                for id in &chunk_ids[chunk.index] {
                    dropped.insert(id.clone(), err.message.clone());
                }
            }
        }
    }

    if !dropped.is_empty() {
        if detail.fatal {
            return Err(augment_error(format!(
                "{} detail fetch failed for {} resource(s)",
                manager.type_name(),
                dropped.len()
            )));
        }
        for (id, reason) in &dropped {
            tracing::warn!(
                target: "pipeline",
                resource_type = %manager.type_name(),
                resource_id = %id,
                reason = %reason,
                "augment_dropped"
            );
        }
        let ids: Vec<String> = dropped.into_keys().collect();
        ctx.warn(
            RunWarning::new(
                WarningKind::AugmentDropped,
                manager.type_name(),
                format!("dropped {} resource(s) whose detail fetch failed", ids.len()),
            )
            .with_count(ids.len())
            .with_ids(ids),
        );
    }
    Ok(augmented)
}

/// Drops repeated identities, keeping the first occurrence.
fn dedup(manager: &ResourceManager, resources: Vec<Resource>, ctx: &ExecutionContext) -> Vec<Resource> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    let mut unique = Vec::with_capacity(resources.len());
    for resource in resources {
        let id = manager.resource_id(&resource);
        if seen.insert(id.clone()) {
            unique.push(resource);
        } else {
            duplicates.push(id);
        }
    }
    if !duplicates.is_empty() {
        ctx.warn(
            RunWarning::new(
                WarningKind::DuplicateIdentity,
                manager.type_name(),
                format!("dropped {} duplicate resource(s)", duplicates.len()),
            )
            .with_count(duplicates.len())
            .with_ids(duplicates),
        );
    }
    unique
}

/// Native identities named by an event, via `expression`.
pub fn event_ids(expression: &str, event: &Value) -> Result<Vec<String>> {
    let found = crate::keypath::search(expression, event).map_err(|err| {
        crate::error::policy_validation(format!("invalid event ids expression '{expression}': {err}"))
    })?;
    let mut ids = Vec::new();
    let mut push = |value: &Value| {
        if let Some(id) = scalar_string(value)
            && !ids.contains(&id)
        {
            ids.push(id);
        }
    };
    match &found {
        Value::Array(items) => items.iter().for_each(&mut push),
        other => push(other),
    }
    Ok(ids)
}
