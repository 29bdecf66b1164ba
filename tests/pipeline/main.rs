use std::sync::Arc;

use serde_json::{Value, json};

use custodian::{
    Core, CoreOptions, Policy,
    context::WarningKind,
    error::ErrorKind,
    resources::{DetailSpec, ParentSpec, ResourceTypeDescriptor},
    testing::{FixtureProvider, FixtureSession, fixture_descriptor, list_operation},
};

fn core_with(
    session: Arc<FixtureSession>,
    descriptors: Vec<ResourceTypeDescriptor>,
    options: CoreOptions,
) -> Arc<Core> {
    let mut provider = FixtureProvider::new(session);
    for descriptor in descriptors {
        provider = provider
            .with_descriptor(descriptor)
            .expect("fixture descriptor should register");
    }
    Core::builder()
        .expect("builder should start")
        .provider(Arc::new(provider))
        .expect("provider should register")
        .options(options)
        .build()
        .expect("core should build")
}

fn options() -> CoreOptions {
    CoreOptions {
        account_id: "123456789012".to_string(),
        region: "us-east-1".to_string(),
        ..CoreOptions::default()
    }
}

fn names(resources: &[serde_json::Map<String, Value>], key: &str) -> Vec<String> {
    resources
        .iter()
        .filter_map(|r| r.get(key).and_then(Value::as_str).map(str::to_string))
        .collect()
}

#[tokio::test]
async fn given_tagged_resources_when_value_filter_on_tag_then_only_matching_tag_selected() {
    let session = Arc::new(FixtureSession::new().with_collection(
        &list_operation("task"),
        "Name",
        json!([
            {"Name": "a", "Tags": [{"Key": "Env", "Value": "prod"}]},
            {"Name": "b", "Tags": [{"Key": "Env", "Value": "dev"}]}
        ]),
    ));
    let core = core_with(session, vec![fixture_descriptor("task", "Name")], options());
    let policy = Policy::from_value(
        &json!({
            "name": "prod-tasks",
            "resource": "test.task",
            "filters": [{"type": "value", "key": "tag:Env", "value": "prod"}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(report.enumerated, 2);
    assert_eq!(names(&report.resources, "Name"), vec!["a"]);
}

#[tokio::test]
async fn given_boolean_composition_when_run_then_or_of_and_is_honoured() {
    let session = Arc::new(FixtureSession::new().with_collection(
        &list_operation("point"),
        "id",
        json!([
            {"id": "p1", "x": 1, "y": 5},
            {"id": "p2", "x": 2, "y": 5},
            {"id": "p3", "x": 1, "y": 7}
        ]),
    ));
    let core = core_with(session, vec![fixture_descriptor("point", "id")], options());
    let policy = Policy::from_value(
        &json!({
            "name": "points",
            "resource": "point",
            "filters": [{"or": [
                {"type": "value", "key": "x", "value": 2},
                {"and": [
                    {"type": "value", "key": "x", "value": 1},
                    {"type": "value", "key": "y", "value": 7}
                ]}
            ]}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(names(&report.resources, "id"), vec!["p2", "p3"]);
}

#[tokio::test]
async fn given_no_resources_when_policy_with_actions_runs_then_nothing_is_scheduled() {
    let session = Arc::new(FixtureSession::new().with_collection(
        &list_operation("task"),
        "TaskId",
        json!([]),
    ));
    let core = core_with(session.clone(), vec![fixture_descriptor("task", "TaskId")], options());
    let policy = Policy::from_value(
        &json!({
            "name": "empty",
            "resource": "test.task",
            "filters": [{"tag:Env": "absent"}],
            "actions": [{"type": "tag", "key": "Env", "value": "unknown"}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("empty run should succeed");
    assert_eq!(report.enumerated, 0);
    assert!(report.resources.is_empty());
    assert!(report.ledger.is_empty());
    assert!(session.mutations().is_empty());
}

#[tokio::test]
async fn given_more_resources_than_a_page_and_chunk_when_enumerated_then_all_are_counted() {
    let items: Vec<Value> = (0..45)
        .map(|i| {
            let state = if i % 3 == 0 { "stopped" } else { "running" };
            json!({"TaskId": format!("t-{i:02}"), "State": state})
        })
        .collect();
    let session = Arc::new(
        FixtureSession::new()
            .with_page_size(7)
            .with_collection(&list_operation("task"), "TaskId", Value::Array(items)),
    );
    let core = core_with(session.clone(), vec![fixture_descriptor("task", "TaskId")], options());
    let policy = Policy::from_value(
        &json!({
            "name": "stopped",
            "resource": "test.task",
            "filters": [{"State": "stopped"}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(report.enumerated, 45);
    assert_eq!(report.matched, 15);
    assert_eq!(session.calls_to(&list_operation("task")).len(), 7);
}

#[tokio::test]
async fn given_duplicate_identities_when_enumerated_then_first_wins_with_warning() {
    let session = Arc::new(FixtureSession::new().with_collection(
        &list_operation("task"),
        "TaskId",
        json!([
            {"TaskId": "t-1", "Owner": "first"},
            {"TaskId": "t-1", "Owner": "second"},
            {"TaskId": "t-2", "Owner": "other"}
        ]),
    ));
    let core = core_with(session, vec![fixture_descriptor("task", "TaskId")], options());
    let policy = Policy::from_value(&json!({"name": "all", "resource": "task"}), &core)
        .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(names(&report.resources, "Owner"), vec!["first", "other"]);
    let warning = report
        .warnings
        .iter()
        .find(|w| w.kind == WarningKind::DuplicateIdentity)
        .expect("duplicate warning should be recorded");
    assert_eq!(warning.ids, vec!["t-1"]);
}

#[tokio::test]
async fn given_max_resources_exceeded_when_run_then_actions_never_execute() {
    let session = Arc::new(FixtureSession::new().with_collection(
        &list_operation("task"),
        "TaskId",
        json!([{"TaskId": "t-1"}, {"TaskId": "t-2"}, {"TaskId": "t-3"}]),
    ));
    let core = core_with(session.clone(), vec![fixture_descriptor("task", "TaskId")], options());
    let policy = Policy::from_value(
        &json!({
            "name": "capped",
            "resource": "test.task",
            "max-resources": 2,
            "actions": [{"type": "tag", "key": "Reviewed", "value": "yes"}]
        }),
        &core,
    )
    .expect("policy should load");

    let err = policy.run(None).await.expect_err("limit should abort the run");
    assert_eq!(err.kind, ErrorKind::Filter);
    assert!(session.mutations().is_empty());
}

#[tokio::test]
async fn given_event_mode_when_event_names_ids_then_only_those_are_fetched() {
    let mut descriptor = fixture_descriptor("task", "TaskId");
    descriptor.event_ids = Some("detail.taskIds".to_string());
    let session = Arc::new(FixtureSession::new().with_collection(
        &list_operation("task"),
        "TaskId",
        json!([{"TaskId": "t-1"}, {"TaskId": "t-2"}, {"TaskId": "t-3"}]),
    ));
    let core = core_with(session.clone(), vec![descriptor], options());
    let policy = Policy::from_value(
        &json!({
            "name": "on-create",
            "resource": "test.task",
            "mode": {"type": "event", "events": ["CreateTask"]}
        }),
        &core,
    )
    .expect("policy should load");

    let event = json!({"detail": {"taskIds": ["t-2", "t-3"]}});
    let report = policy.run(Some(&event)).await.expect("run should succeed");
    assert_eq!(report.mode, "event");
    assert_eq!(names(&report.resources, "TaskId"), vec!["t-2", "t-3"]);

    let listing = session.calls_to(&list_operation("task"));
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].params["Ids"], json!(["t-2", "t-3"]));

    let quiet = policy
        .run(Some(&json!({"detail": {}})))
        .await
        .expect("event without ids should succeed");
    assert!(quiet.resources.is_empty());
}

#[tokio::test]
async fn given_conditions_not_met_when_run_then_policy_is_skipped_without_calls() {
    let session = Arc::new(FixtureSession::new().with_collection(
        &list_operation("task"),
        "TaskId",
        json!([{"TaskId": "t-1"}]),
    ));
    let core = core_with(session.clone(), vec![fixture_descriptor("task", "TaskId")], options());
    let policy = Policy::from_value(
        &json!({
            "name": "eu-only",
            "resource": "test.task",
            "conditions": [{"type": "value", "key": "region", "value": "eu-west-1"}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("skipped run should succeed");
    assert!(report.skipped);
    assert!(session.calls().is_empty());
}

#[tokio::test]
async fn given_pure_filter_policy_when_run_twice_then_same_resources_returned() {
    let session = Arc::new(FixtureSession::new().with_collection(
        &list_operation("task"),
        "TaskId",
        json!([
            {"TaskId": "t-1", "Size": 10},
            {"TaskId": "t-2", "Size": 200},
            {"TaskId": "t-3", "Size": 300}
        ]),
    ));
    let core = core_with(session, vec![fixture_descriptor("task", "TaskId")], options());
    let policy = Policy::from_value(
        &json!({
            "name": "large",
            "resource": "test.task",
            "filters": [{"type": "value", "key": "Size", "op": "gte", "value": 100}]
        }),
        &core,
    )
    .expect("policy should load");

    let first = policy.run(None).await.expect("first run");
    let second = policy.run(None).await.expect("second run");
    assert_eq!(names(&first.resources, "TaskId"), vec!["t-2", "t-3"]);
    assert_eq!(first.resources, second.resources);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn given_throttled_listing_when_run_then_retries_until_success() {
    let session = Arc::new(
        FixtureSession::new()
            .with_collection(&list_operation("task"), "TaskId", json!([{"TaskId": "t-1"}]))
            .with_throttling(&list_operation("task"), 2),
    );
    let mut opts = options();
    opts.retry.backoff_base_ms = 1;
    opts.retry.backoff_max_ms = 5;
    let core = core_with(session.clone(), vec![fixture_descriptor("task", "TaskId")], opts);
    let policy = Policy::from_value(&json!({"name": "all", "resource": "test.task"}), &core)
        .expect("policy should load");

    let report = policy.run(None).await.expect("throttling should be retried");
    assert_eq!(report.matched, 1);
    assert_eq!(session.calls_to(&list_operation("task")).len(), 3);
}

#[tokio::test]
async fn given_child_type_when_enumerated_then_children_carry_parent_scoped_ids() {
    let mut service = fixture_descriptor("service", "ServiceName");
    service.parent_spec = Some(ParentSpec {
        parent_type: "test.cluster".to_string(),
        param: "ClusterId".to_string(),
        parent_key: None,
    });
    let session = Arc::new(
        FixtureSession::new()
            .with_collection(
                &list_operation("cluster"),
                "ClusterId",
                json!([{"ClusterId": "c1"}, {"ClusterId": "c2"}]),
            )
            .with_collection(
                &list_operation("service"),
                "ServiceName",
                json!([
                    {"ServiceName": "web", "ClusterId": "c1"},
                    {"ServiceName": "web", "ClusterId": "c2"},
                    {"ServiceName": "api", "ClusterId": "c1"}
                ]),
            ),
    );
    let core = core_with(
        session.clone(),
        vec![fixture_descriptor("cluster", "ClusterId"), service],
        options(),
    );
    let policy = Policy::from_value(&json!({"name": "services", "resource": "test.service"}), &core)
        .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(report.enumerated, 3);
    let manager = policy.manager().expect("manager should bind");
    let ids: Vec<String> = report
        .resources
        .iter()
        .map(|resource| manager.resource_id(resource))
        .collect();
    assert_eq!(ids, vec!["c1/web", "c1/api", "c2/web"]);
    assert_eq!(names(&report.resources, "c7n:parent-id"), vec!["c1", "c1", "c2"]);

    let listings: Vec<Value> = session
        .calls_to(&list_operation("service"))
        .into_iter()
        .map(|call| call.params["ClusterId"].clone())
        .collect();
    assert_eq!(listings, vec![json!("c1"), json!("c2")]);
}

fn detailed_task(fatal: bool) -> ResourceTypeDescriptor {
    let mut descriptor = fixture_descriptor("task", "TaskId");
    descriptor.detail_spec = Some(DetailSpec {
        operation: "DescribeTask".to_string(),
        param: "TaskId".to_string(),
        id_key: None,
        result_path: Some("Task".to_string()),
        batch_size: 1,
        annotate_key: None,
        fatal,
    });
    descriptor
}

fn detail_session() -> Arc<FixtureSession> {
    Arc::new(
        FixtureSession::new()
            .with_collection(
                &list_operation("task"),
                "TaskId",
                json!([{"TaskId": "t-1"}, {"TaskId": "t-2"}, {"TaskId": "t-3"}]),
            )
            .with_response("DescribeTask", json!({"Task": {"Launch": "fargate"}}))
            .with_failure("DescribeTask", "t-2", "access denied"),
    )
}

#[tokio::test]
async fn given_detail_failure_when_augmenting_then_item_dropped_with_warning() {
    let session = detail_session();
    let core = core_with(session.clone(), vec![detailed_task(false)], options());
    let policy = Policy::from_value(&json!({"name": "all", "resource": "test.task"}), &core)
        .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(names(&report.resources, "TaskId"), vec!["t-1", "t-3"]);
    assert!(report
        .resources
        .iter()
        .all(|resource| resource.get("Launch") == Some(&json!("fargate"))));
    assert_eq!(session.calls_to("DescribeTask").len(), 3);

    let dropped = report
        .warnings
        .iter()
        .find(|w| w.kind == WarningKind::AugmentDropped)
        .expect("dropped warning should be recorded");
    assert_eq!(dropped.ids, vec!["t-2"]);
}

#[tokio::test]
async fn given_fatal_detail_failure_when_augmenting_then_run_fails() {
    let session = detail_session();
    let core = core_with(session.clone(), vec![detailed_task(true)], options());
    let policy = Policy::from_value(
        &json!({
            "name": "all",
            "resource": "test.task",
            "actions": [{"type": "tag", "key": "Seen", "value": "yes"}]
        }),
        &core,
    )
    .expect("policy should load");

    let err = policy.run(None).await.expect_err("fatal augment should fail the run");
    assert_eq!(err.kind, ErrorKind::Augment);
    assert!(session.mutations().iter().all(|call| call.operation == "DescribeTask"));
}
