use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use custodian::{
    Core, CoreOptions, Policy,
    actions::{
        Action, ActionContext, ActionFactory, ActionResult, Collaborators, Notifier,
        NotifyMessage, ResourceFailure,
    },
    error::Result,
    ledger::{OutcomeRecord, OutcomeStatus},
    metrics::MemoryMetricsSink,
    provider::ResourceType,
    resources::{Resource, tags::tags_of},
    schema::type_schema,
    testing::{
        FIXTURE_TAG_OPERATION, FixtureProvider, FixtureSession, fixture_descriptor,
        list_operation,
    },
};

const DELETE_OPERATION: &str = "DeleteTask";

#[derive(Debug)]
struct DeleteAction {
    config: Map<String, Value>,
}

#[async_trait]
impl Action for DeleteAction {
    fn type_name(&self) -> &str {
        "delete"
    }

    fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    async fn process(
        &self,
        resources: &mut [Resource],
        ctx: &ActionContext<'_>,
    ) -> Result<ActionResult> {
        let session = ctx.session();
        let mut failures = Vec::new();
        for resource in resources.iter() {
            let id = ctx.resource_id(resource);
            if let Err(err) = session.call(DELETE_OPERATION, &json!({"TaskId": id})).await {
                failures.push(ResourceFailure::from_error(id, &err));
            }
        }
        Ok(ActionResult::with_failures(failures))
    }
}

fn task_type() -> ResourceType {
    let delete: ActionFactory = Arc::new(|data, _builder| {
        Ok(Box::new(DeleteAction {
            config: data.clone(),
        }))
    });
    ResourceType::declarative(fixture_descriptor("task", "TaskId"))
        .expect("descriptor should be valid")
        .with_action("delete", type_schema("delete", json!({}), &[]), delete)
        .expect("delete should register")
}

struct Harness {
    session: Arc<FixtureSession>,
    metrics: Arc<MemoryMetricsSink>,
    core: Arc<Core>,
}

fn harness(session: FixtureSession, dry_run: bool, collaborators: Collaborators) -> Harness {
    let session = Arc::new(session.with_collection(
        &list_operation("task"),
        "TaskId",
        json!([
            {"TaskId": "r1", "Tags": [{"Key": "Env", "Value": "prod"}]},
            {"TaskId": "r2", "Tags": [{"Key": "Env", "Value": "prod"}]},
            {"TaskId": "r3", "Tags": [{"Key": "Env", "Value": "dev"}]}
        ]),
    ));
    let provider = FixtureProvider::new(session.clone())
        .with_type(task_type())
        .expect("task type should register");
    let metrics = Arc::new(MemoryMetricsSink::new());
    let core = Core::builder()
        .expect("builder should start")
        .provider(Arc::new(provider))
        .expect("provider should register")
        .collaborators(collaborators)
        .metrics(metrics.clone())
        .options(CoreOptions {
            account_id: "123456789012".to_string(),
            region: "us-east-1".to_string(),
            dry_run,
            ..CoreOptions::default()
        })
        .build()
        .expect("core should build");
    Harness {
        session,
        metrics,
        core,
    }
}

fn policy(core: &Arc<Core>, actions: Value) -> Policy {
    Policy::from_value(
        &json!({"name": "act", "resource": "test.task", "actions": actions}),
        core,
    )
    .expect("policy should load")
}

#[tokio::test]
async fn given_tag_fails_on_one_resource_when_actions_run_then_later_actions_skip_it() {
    let h = harness(
        FixtureSession::new().with_failure(FIXTURE_TAG_OPERATION, "r2", "tag limit exceeded"),
        false,
        Collaborators::default(),
    );
    let report = policy(
        &h.core,
        json!([{"type": "tag", "key": "Reviewed", "value": "yes"}, "delete"]),
    )
    .run(None)
    .await
    .expect("partial failure should not fail the run");

    let ledger = &report.ledger;
    for id in ["r1", "r3"] {
        assert_eq!(
            ledger.outcomes(id),
            &[OutcomeRecord::ok("tag"), OutcomeRecord::ok("delete")]
        );
    }
    let r2 = ledger.outcomes("r2");
    assert_eq!(r2.len(), 2);
    assert_eq!(r2[0].status, OutcomeStatus::Error);
    assert_eq!(r2[0].action, "tag");
    assert_eq!(r2[1], OutcomeRecord::skip("delete", "previously failed"));

    let deleted: Vec<Value> = h
        .session
        .calls_to(DELETE_OPERATION)
        .into_iter()
        .map(|call| call.params["TaskId"].clone())
        .collect();
    assert_eq!(deleted, vec![json!("r1"), json!("r3")]);
}

#[tokio::test]
async fn given_dry_run_when_actions_run_then_all_ok_and_nothing_mutated() {
    let h = harness(FixtureSession::new(), true, Collaborators::default());
    let report = policy(
        &h.core,
        json!([{"type": "tag", "key": "Reviewed", "value": "yes"}, "delete"]),
    )
    .run(None)
    .await
    .expect("dry run should succeed");

    let totals = report.ledger.totals();
    assert_eq!(totals.ok, 6);
    assert_eq!(totals.error, 0);
    assert!(h.session.mutations().is_empty());
    assert!(
        h.session
            .calls_to(FIXTURE_TAG_OPERATION)
            .iter()
            .all(|call| call.is_dry_run())
    );
    assert_eq!(h.metrics.counter_total("action.tag.ok"), 3.0);
    assert_eq!(h.metrics.counter_total("action.tag.error"), 0.0);
    assert_eq!(h.metrics.counter_total("action.delete.ok"), 3.0);

    let untouched = h.session.items(&list_operation("task"));
    assert!(untouched.iter().all(|item| tags_of(item).len() == 1));
}

#[tokio::test]
async fn given_tag_then_remove_tag_when_run_then_tags_return_to_prior_contents() {
    let h = harness(FixtureSession::new(), false, Collaborators::default());
    let before: Vec<_> = h
        .session
        .items(&list_operation("task"))
        .iter()
        .map(tags_of)
        .collect();

    let report = policy(
        &h.core,
        json!([
            {"type": "tag", "tags": {"Owner": "ops", "CostCenter": "42"}},
            {"type": "remove-tag", "tags": ["Owner", "CostCenter"]}
        ]),
    )
    .run(None)
    .await
    .expect("run should succeed");

    assert_eq!(report.ledger.totals().ok, 6);
    let after: Vec<_> = h
        .session
        .items(&list_operation("task"))
        .iter()
        .map(tags_of)
        .collect();
    assert_eq!(before, after);
    let local: Vec<_> = report.resources.iter().map(tags_of).collect();
    assert_eq!(local, before);
}

#[tokio::test]
async fn given_identical_action_twice_when_run_then_one_ok_and_one_skip_per_resource() {
    let h = harness(FixtureSession::new(), false, Collaborators::default());
    let report = policy(
        &h.core,
        json!([
            {"type": "tag", "key": "Reviewed", "value": "yes"},
            {"type": "tag", "key": "Reviewed", "value": "yes"}
        ]),
    )
    .run(None)
    .await
    .expect("run should succeed");

    for id in ["r1", "r2", "r3"] {
        assert_eq!(
            report.ledger.outcomes(id),
            &[
                OutcomeRecord::ok("tag"),
                OutcomeRecord::skip("tag#2", "already applied")
            ]
        );
    }
    assert_eq!(h.session.calls_to(FIXTURE_TAG_OPERATION).len(), 3);
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<NotifyMessage>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &NotifyMessage) -> Result<()> {
        self.messages
            .lock()
            .expect("lock poisoned")
            .push(message.clone());
        Ok(())
    }
}

#[tokio::test]
async fn given_notify_action_when_run_then_collaborator_receives_rendered_message() {
    let notifier = Arc::new(RecordingNotifier::default());
    let h = harness(
        FixtureSession::new(),
        false,
        Collaborators::default().with_notifier(notifier.clone()),
    );
    let report = Policy::from_value(
        &json!({
            "name": "prod-report",
            "resource": "test.task",
            "filters": [{"tag:Env": "prod"}],
            "actions": [{
                "type": "notify",
                "to": ["ops@example.com"],
                "subject": "{count} resources in {region} for {policy}"
            }]
        }),
        &h.core,
    )
    .expect("policy should load")
    .run(None)
    .await
    .expect("run should succeed");

    assert_eq!(report.ledger.counters("notify").ok, 2);
    let messages = notifier.messages.lock().expect("lock poisoned");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].subject, "2 resources in us-east-1 for prod-report");
    assert_eq!(messages[0].to, vec!["ops@example.com"]);
    assert_eq!(messages[0].resources.len(), 2);
    assert!(h.session.mutations().is_empty());
}

#[test]
fn given_mark_for_op_with_unsupported_setting_when_loaded_then_rejected() {
    let h = harness(FixtureSession::new(), false, Collaborators::default());
    let err = Policy::from_value(
        &json!({
            "name": "mark",
            "resource": "test.task",
            "actions": [{"type": "mark-for-op", "op": "delete", "days": 1, "tz": "America/New_York"}]
        }),
        &h.core,
    )
    .expect_err("tz is not a mark-for-op setting");
    assert_eq!(err.kind, custodian::error::ErrorKind::PolicyValidation);

    Policy::from_value(
        &json!({
            "name": "mark",
            "resource": "test.task",
            "actions": [{"type": "mark-for-op", "op": "delete", "days": 1}]
        }),
        &h.core,
    )
    .expect("mark-for-op without tz should load");
}
