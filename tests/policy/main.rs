use std::sync::Arc;

use serde_json::{Value, json};

use custodian::{
    Core, CoreOptions, Policy, PolicyCollection,
    error::ErrorKind,
    policy::parse_document,
    resources::tags::tag_value,
    testing::{FixtureProvider, FixtureSession, fixture_descriptor, list_operation},
};

fn fixture() -> (Arc<FixtureSession>, Arc<Core>) {
    let session = Arc::new(FixtureSession::new().with_collection(
        &list_operation("task"),
        "TaskId",
        json!([{"TaskId": "t-1", "State": "running"}, {"TaskId": "t-2", "State": "stopped"}]),
    ));
    let provider = FixtureProvider::new(session.clone())
        .with_descriptor(fixture_descriptor("task", "TaskId"))
        .expect("task should register")
        .with_descriptor(fixture_descriptor("bucket", "Name"))
        .expect("bucket should register");
    let core = Core::builder()
        .expect("builder should start")
        .provider(Arc::new(provider))
        .expect("provider should register")
        .options(CoreOptions {
            account_id: "123456789012".to_string(),
            region: "us-east-1".to_string(),
            ..CoreOptions::default()
        })
        .build()
        .expect("core should build");
    (session, core)
}

const DOCUMENT: &str = r#"
policies:
  - name: stopped-tasks
    resource: test.task
    description: tasks nobody is running
    tags: [hygiene]
    metadata:
      owner: platform
    filters:
      - State: stopped
    actions:
      - type: tag
        key: Seen
        value: "{policy}"
  - name: nightly-buckets
    resource: bucket
    mode:
      type: periodic
      schedule: "cron(0 2 * * ? *)"
      timezone: UTC
"#;

#[test]
fn given_valid_document_when_loaded_then_policies_bind_in_order() {
    let (session, core) = fixture();
    let collection = PolicyCollection::from_yaml(DOCUMENT, &core).expect("document should load");

    assert_eq!(collection.names(), vec!["stopped-tasks", "nightly-buckets"]);
    assert_eq!(collection.resource_types(), vec!["test.bucket", "test.task"]);
    let stopped = collection.get("stopped-tasks").expect("policy by name");
    assert_eq!(stopped.data().tags, vec!["hygiene"]);
    assert_eq!(stopped.data().metadata["owner"], json!("platform"));
    assert_eq!(stopped.mode().type_name(), "pull");
    assert!(session.calls().is_empty(), "loading must not touch the provider");
}

#[test]
fn given_invalid_policies_when_validated_then_every_error_has_a_path() {
    let (session, core) = fixture();
    let document = parse_document(
        r#"
policies:
  - name: ok
    resource: test.task
  - name: bad-filter
    resource: test.task
    filters:
      - or:
          - type: value
            key: State
            value: running
          - type: no-such-filter
  - name: bad-resource
    resource: test.volume
  - name: ok
    resource: test.task
extra: true
"#,
    )
    .expect("yaml should parse");

    let errors = core.validate_document(&document);
    let paths: Vec<&str> = errors.iter().filter_map(|err| err.path.as_deref()).collect();
    assert_eq!(errors.len(), 4, "{errors:?}");
    assert!(errors.iter().all(|err| err.kind == ErrorKind::PolicyValidation));
    assert!(paths.contains(&"/extra"));
    assert!(paths.contains(&"/policies/1/filters/0/or/1/type"));
    assert!(paths.contains(&"/policies/2/resource"));
    assert!(paths.contains(&"/policies/3/name"));

    let unknown = errors
        .iter()
        .find(|err| err.path.as_deref() == Some("/policies/2/resource"))
        .expect("resource error");
    assert!(unknown.message.contains("test.task"), "{}", unknown.message);

    assert!(PolicyCollection::from_document(&document, &core).is_err());
    assert!(session.calls().is_empty());
}

#[tokio::test]
async fn given_schema_invalid_policy_when_loaded_then_no_cloud_call_is_made() {
    let (session, core) = fixture();
    let err = Policy::from_value(
        &json!({
            "name": "bad",
            "resource": "test.task",
            "filters": [{"type": "value", "key": "State", "op": "roughly", "value": 1}],
            "actions": [{"type": "tag", "key": "x", "value": "y"}]
        }),
        &core,
    )
    .expect_err("unknown operator should be rejected");
    assert_eq!(err.kind, ErrorKind::PolicyValidation);
    assert!(session.calls().is_empty());
}

#[test]
fn given_bad_policy_names_or_keys_when_validated_then_rejected() {
    let (_, core) = fixture();
    for raw in [
        json!({"name": "has spaces", "resource": "test.task"}),
        json!({"name": "ok", "resource": "test.task", "filtres": []}),
        json!({"name": "ok", "resource": "test.task", "max-resources-percent": 150}),
        json!({"name": "ok", "resource": "test.task", "mode": {"type": "periodic"}}),
        json!({"name": "ok", "resource": "test.task", "mode": {"type": "event"}}),
        json!({"resource": "test.task"}),
    ] {
        let err = Policy::from_value(&raw, &core).expect_err("policy should be rejected");
        assert_eq!(err.kind, ErrorKind::PolicyValidation, "{raw}: {err}");
    }
}

#[tokio::test]
async fn given_policy_variables_when_run_then_placeholders_are_expanded() {
    let (session, core) = fixture();
    let policy = Policy::from_value(
        &json!({
            "name": "label-stopped",
            "resource": "test.task",
            "filters": [{"State": "stopped"}],
            "actions": [{"type": "tag", "key": "Audit", "value": "{policy}@{account_id}/{region}"}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(report.matched, 1);
    let stored = session.items(&list_operation("task"));
    let stopped = stored
        .iter()
        .find(|item| item["TaskId"] == json!("t-2"))
        .expect("t-2 in collection");
    assert_eq!(
        tag_value(stopped, "Audit").as_deref(),
        Some("label-stopped@123456789012/us-east-1")
    );
}

#[test]
fn given_periodic_and_event_modes_when_provisioned_then_descriptors_describe_triggers() {
    let (_, core) = fixture();
    let collection = PolicyCollection::from_yaml(DOCUMENT, &core).expect("document should load");
    let nightly = collection.get("nightly-buckets").expect("policy by name");
    assert_eq!(
        nightly.provision(),
        json!({
            "mode": "periodic",
            "policy": "nightly-buckets",
            "resource": "test.bucket",
            "schedule": "cron(0 2 * * ? *)",
            "timezone": "UTC"
        })
    );

    let on_create = Policy::from_value(
        &json!({
            "name": "on-create",
            "resource": "test.task",
            "mode": {"type": "event", "events": ["CreateTask"], "ids": "detail.taskId"}
        }),
        &core,
    )
    .expect("event policy should load");
    assert_eq!(on_create.provision()["ids"], json!("detail.taskId"));
    assert_eq!(on_create.provision()["events"], json!(["CreateTask"]));
}

#[test]
fn given_core_when_schema_requested_then_resources_filters_and_actions_are_listed() {
    let (_, core) = fixture();
    let schema = core.schema(None).expect("schema should assemble");
    let resources = schema
        .pointer("/definitions/resources")
        .and_then(Value::as_object)
        .expect("resources definition");
    assert!(resources.contains_key("test.task"));
    assert!(resources.contains_key("test.bucket"));
    assert!(schema.pointer("/definitions/resources/test.task/actions/mark-for-op").is_some());

    let single = core.schema(Some("bucket")).expect("single resource schema");
    let only: Vec<&String> = single
        .pointer("/definitions/resources")
        .and_then(Value::as_object)
        .expect("resources definition")
        .keys()
        .collect();
    assert_eq!(only, vec!["test.bucket"]);

    assert!(core.schema(Some("test.volume")).is_err());
}
