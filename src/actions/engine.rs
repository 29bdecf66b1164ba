use std::{collections::HashMap, time::Instant};

use serde_json::Value;

use crate::{
    actions::{Action, ActionContext, summarize},
    error::Result,
    ledger::{OutcomeRecord, OutcomeStatus},
    metrics::{ACTION_TIME_METRIC, Dimensions},
    resources::{ACTIONS_ANNOTATION, Resource, annotate_append},
};

pub const PREVIOUSLY_FAILED: &str = "previously failed";
pub const ALREADY_APPLIED: &str = "already applied";

/// Ledger slot names: `tag`, `tag#2`, ... for repeated types.
pub fn action_labels(actions: &[Box<dyn Action>]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    actions
        .iter()
        .map(|action| {
            let count = seen.entry(action.type_name()).or_insert(0);
            *count += 1;
            if *count == 1 {
                action.type_name().to_string()
            } else {
                format!("{}#{count}", action.type_name())
            }
        })
        .collect()
}

/// Label of the first earlier action with the same type and configuration.
fn earlier_identical<'a>(
    actions: &[Box<dyn Action>],
    labels: &'a [String],
    index: usize,
) -> Option<&'a str> {
    let current = &actions[index];
    (0..index)
        .find(|&earlier| {
            actions[earlier].type_name() == current.type_name()
                && actions[earlier].config() == current.config()
        })
        .map(|earlier| labels[earlier].as_str())
}

fn commit(ctx: &ActionContext<'_>, resource: &mut Resource, id: &str, record: OutcomeRecord) {
    if ctx.execution.ledger().record(id, record.clone())
        && let Ok(value) = serde_json::to_value(&record)
    {
        annotate_append(resource, ACTIONS_ANNOTATION, [value]);
    }
}

/// Runs `actions` in order over `resources`, recording one outcome per resource and action.
///
/// Per-resource failures stay in the ledger. An action-level error marks every resource
/// it was given as failed; it only propagates when the run is fail-fast.
pub async fn run_actions(
    actions: &[Box<dyn Action>],
    resources: &mut [Resource],
    ctx: &ActionContext<'_>,
) -> Result<()> {
    let labels = action_labels(actions);
    let ids: Vec<String> = resources.iter().map(|r| ctx.resource_id(r)).collect();

    for (index, action) in actions.iter().enumerate() {
        let label = labels[index].as_str();
        let previous = earlier_identical(actions, &labels, index);

        let mut eligible = Vec::new();
        for (position, id) in ids.iter().enumerate() {
            let skip_reason = {
                let ledger = ctx.execution.ledger();
                if ledger.has_error(id) {
                    Some(PREVIOUSLY_FAILED)
                } else if previous.is_some_and(|prev| {
                    ledger
                        .outcome(id, prev)
                        .is_some_and(|record| record.status == OutcomeStatus::Ok)
                }) {
                    Some(ALREADY_APPLIED)
                } else {
                    None
                }
            };
            match skip_reason {
                Some(reason) => commit(
                    ctx,
                    &mut resources[position],
                    id,
                    OutcomeRecord::skip(label, reason),
                ),
                None => eligible.push(position),
            }
        }
        if eligible.is_empty() {
            continue;
        }
        ctx.execution.check_deadline()?;

        let mut batch: Vec<Resource> = eligible
            .iter()
            .map(|&position| std::mem::take(&mut resources[position]))
            .collect();
        let started = Instant::now();
        let outcome = action.process(&mut batch, ctx).await;
        let elapsed = started.elapsed();

        let records: Vec<OutcomeRecord> = match &outcome {
            Err(err) if err.is_dry_run() => {
                batch.iter().map(|_| OutcomeRecord::ok(label)).collect()
            }
            Err(err) => {
                tracing::warn!(
                    target: "actions",
                    policy = ctx.execution.policy(),
                    action = label,
                    resources = batch.len(),
                    error = %err,
                    "action_failed"
                );
                batch
                    .iter()
                    .map(|_| OutcomeRecord::error(label, err.message.clone()))
                    .collect()
            }
            Ok(result) => {
                if !result.failures.is_empty() {
                    tracing::warn!(
                        target: "actions",
                        policy = ctx.execution.policy(),
                        action = label,
                        failed = result.failures.len(),
                        reasons = ?summarize(&result.failures),
                        "action_partially_failed"
                    );
                }
                let failures: HashMap<&str, _> = result
                    .failures
                    .iter()
                    .map(|failure| (failure.resource_id.as_str(), failure))
                    .collect();
                let skipped: HashMap<&str, _> = result
                    .skipped
                    .iter()
                    .map(|skip| (skip.resource_id.as_str(), skip))
                    .collect();
                eligible
                    .iter()
                    .map(|&position| {
                        let id = ids[position].as_str();
                        match (failures.get(id), skipped.get(id)) {
                            (Some(failure), _) if !failure.is_dry_run() => {
                                OutcomeRecord::error(label, failure.reason.clone())
                            }
                            (Some(_), _) => OutcomeRecord::ok(label),
                            (None, Some(skip)) => OutcomeRecord::skip(label, skip.reason.clone()),
                            (None, None) => OutcomeRecord::ok(label),
                        }
                    })
                    .collect()
            }
        };

        let mut tally = [0u64; 3];
        for ((position, mut resource), record) in eligible.iter().zip(batch).zip(records) {
            tally[match record.status {
                OutcomeStatus::Ok => 0,
                OutcomeStatus::Skip => 1,
                OutcomeStatus::Error => 2,
            }] += 1;
            commit(ctx, &mut resource, &ids[*position], record);
            resources[*position] = resource;
        }

        let mut dims = Dimensions::new();
        dims.insert("action".to_string(), label.to_string());
        for (status, count) in ["ok", "skip", "error"].iter().zip(tally) {
            ctx.execution.counter(
                &format!("action.{}.{status}", action.type_name()),
                count as f64,
                dims.clone(),
            );
        }
        ctx.execution
            .histogram(ACTION_TIME_METRIC, elapsed.as_secs_f64(), dims);
        tracing::info!(
            target: "actions",
            policy = ctx.execution.policy(),
            action = label,
            ok = tally[0],
            skip = tally[1],
            error = tally[2],
            elapsed_ms = elapsed.as_millis() as u64,
            "action_completed"
        );

        if let Err(err) = outcome
            && !err.is_dry_run()
            && ctx.execution.fail_fast()
        {
            return Err(err);
        }
    }
    Ok(())
}

/// Outcome annotations recorded on a resource, in order.
pub fn recorded_outcomes(resource: &Resource) -> Vec<OutcomeRecord> {
    resource
        .get(ACTIONS_ANNOTATION)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
