use std::sync::Arc;

use serde_json::{Value, json};
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use custodian::{
    Core, CoreOptions, Policy,
    context::WarningKind,
    filters::related::RelatedSpec,
    resources::ResourceTypeDescriptor,
    testing::{FixtureProvider, FixtureSession, fixture_descriptor, list_operation},
};

fn core_with(session: Arc<FixtureSession>, descriptors: Vec<ResourceTypeDescriptor>) -> Arc<Core> {
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
        .options(CoreOptions {
            account_id: "123456789012".to_string(),
            region: "us-east-1".to_string(),
            ..CoreOptions::default()
        })
        .build()
        .expect("core should build")
}

fn single_type(items: Value) -> (Arc<FixtureSession>, Arc<Core>) {
    let session =
        Arc::new(FixtureSession::new().with_collection(&list_operation("task"), "TaskId", items));
    let core = core_with(session.clone(), vec![fixture_descriptor("task", "TaskId")]);
    (session, core)
}

fn ids(resources: &[serde_json::Map<String, Value>]) -> Vec<String> {
    resources
        .iter()
        .filter_map(|r| r.get("TaskId").and_then(Value::as_str).map(str::to_string))
        .collect()
}

fn kms_descriptors() -> Vec<ResourceTypeDescriptor> {
    let mut volume = fixture_descriptor("volume", "id");
    volume.related.push(RelatedSpec {
        name: "kms-key".to_string(),
        resource: "test.kms-key".to_string(),
        ids: "kms".to_string(),
        fetch_threshold: 10,
        annotation_key: None,
        required_state: None,
        permissions: Vec::new(),
    });
    vec![volume, fixture_descriptor("kms-key", "KeyId")]
}

#[tokio::test]
async fn given_related_id_missing_when_related_filter_runs_then_no_match_and_warning_names_id() {
    let session = Arc::new(
        FixtureSession::new()
            .with_collection(&list_operation("volume"), "id", json!([{"id": "a", "kms": "k1"}]))
            .with_collection(&list_operation("kms-key"), "KeyId", json!([{"KeyId": "k2"}])),
    );
    let core = core_with(session.clone(), kms_descriptors());
    let policy = Policy::from_value(
        &json!({
            "name": "cmk-volumes",
            "resource": "test.volume",
            "filters": [{"type": "kms-key", "key": "KeyId", "value": "k1"}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert!(report.resources.is_empty());

    let missing: Vec<_> = report
        .warnings
        .iter()
        .filter(|w| w.kind == WarningKind::RelatedResourceMissing)
        .collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].ids, vec!["k1"]);

    let lookups = session.calls_to(&list_operation("kms-key"));
    assert_eq!(lookups.len(), 1, "below the fetch threshold ids are fetched directly");
    assert_eq!(lookups[0].params["Ids"], json!(["k1"]));
}

#[tokio::test]
async fn given_related_resource_present_when_related_filter_runs_then_primary_matches() {
    let session = Arc::new(
        FixtureSession::new()
            .with_collection(
                &list_operation("volume"),
                "id",
                json!([{"id": "a", "kms": "k1"}, {"id": "b", "kms": "k2"}, {"id": "c"}]),
            )
            .with_collection(
                &list_operation("kms-key"),
                "KeyId",
                json!([{"KeyId": "k1", "KeyManager": "CUSTOMER"}, {"KeyId": "k2", "KeyManager": "AWS"}]),
            ),
    );
    let core = core_with(session, kms_descriptors());
    let policy = Policy::from_value(
        &json!({
            "name": "customer-keys",
            "resource": "volume",
            "filters": [{"type": "kms-key", "key": "KeyManager", "value": "CUSTOMER"}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    let matched: Vec<&str> = report
        .resources
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_str))
        .collect();
    assert_eq!(matched, vec!["a"]);
    assert!(report.resources[0].contains_key("c7n:matched-kms-key"));
}

#[tokio::test]
async fn given_resource_ten_days_old_when_age_greater_than_seven_then_it_matches() {
    let now = OffsetDateTime::now_utc();
    let old = (now - Duration::days(10)).format(&Rfc3339).expect("format date");
    let fresh = (now - Duration::days(2)).format(&Rfc3339).expect("format date");
    let (_, core) = single_type(json!([
        {"TaskId": "old", "CreatedAt": old},
        {"TaskId": "fresh", "CreatedAt": fresh}
    ]));
    let policy = Policy::from_value(
        &json!({
            "name": "stale",
            "resource": "test.task",
            "filters": [{
                "type": "value",
                "key": "CreatedAt",
                "value_type": "age",
                "op": "greater-than",
                "value": 7
            }]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(ids(&report.resources), vec!["old"]);
}

#[tokio::test]
async fn given_empty_value_from_list_when_in_and_ni_then_treated_as_empty_set() {
    let path = std::env::temp_dir().join(format!("custodian-allowed-{}.json", Uuid::now_v7()));
    std::fs::write(&path, "[]").expect("value list should be written");
    let url = format!("file://{}", path.display());
    let (_, core) = single_type(json!([{"TaskId": "t-1"}, {"TaskId": "t-2"}]));

    let allowed = Policy::from_value(
        &json!({
            "name": "allowed",
            "resource": "test.task",
            "filters": [{"type": "value", "key": "TaskId", "op": "in", "value_from": {"url": url}}]
        }),
        &core,
    )
    .expect("policy should load");
    let report = allowed.run(None).await.expect("run should succeed");
    assert!(report.resources.is_empty());
    assert!(report.warnings.iter().any(|w| w.kind == WarningKind::ValueFromEmpty));

    let unlisted = Policy::from_value(
        &json!({
            "name": "unlisted",
            "resource": "test.task",
            "filters": [{"type": "value", "key": "TaskId", "op": "ni", "value_from": {"url": url}}]
        }),
        &core,
    )
    .expect("policy should load");
    let report = unlisted.run(None).await.expect("run should succeed");
    assert_eq!(ids(&report.resources), vec!["t-1", "t-2"]);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn given_system_tags_when_tag_count_then_only_user_tags_count() {
    let (_, core) = single_type(json!([
        {"TaskId": "busy", "Tags": [
            {"Key": "a", "Value": "1"}, {"Key": "b", "Value": "2"}, {"Key": "c", "Value": "3"}
        ]},
        {"TaskId": "system", "Tags": [
            {"Key": "aws:cloudformation:stack-name", "Value": "s"},
            {"Key": "aws:cloudformation:logical-id", "Value": "l"},
            {"Key": "a", "Value": "1"}
        ]}
    ]));
    let policy = Policy::from_value(
        &json!({
            "name": "tag-heavy",
            "resource": "test.task",
            "filters": [{"type": "tag-count", "count": 3}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(ids(&report.resources), vec!["busy"]);
}

#[tokio::test]
async fn given_mark_in_the_past_when_marked_for_op_then_only_due_resources_match() {
    let (_, core) = single_type(json!([
        {"TaskId": "due", "Tags": [
            {"Key": "maid_status", "Value": "Resource does not meet policy: stop@2020/01/01"}
        ]},
        {"TaskId": "later", "Tags": [
            {"Key": "maid_status", "Value": "Resource does not meet policy: stop@2999/01/01"}
        ]},
        {"TaskId": "other-op", "Tags": [
            {"Key": "maid_status", "Value": "Resource does not meet policy: delete@2020/01/01"}
        ]},
        {"TaskId": "unmarked"}
    ]));
    let policy = Policy::from_value(
        &json!({
            "name": "stop-marked",
            "resource": "test.task",
            "filters": [{"type": "marked-for-op", "op": "stop"}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(ids(&report.resources), vec!["due"]);
}

#[tokio::test]
async fn given_not_and_presence_filters_when_run_then_absent_tags_are_selected() {
    let (_, core) = single_type(json!([
        {"TaskId": "owned", "Tags": [{"Key": "Owner", "Value": "ops"}]},
        {"TaskId": "orphan", "Tags": []},
        {"TaskId": "bare"}
    ]));
    let policy = Policy::from_value(
        &json!({
            "name": "orphans",
            "resource": "test.task",
            "filters": [{"not": [{"tag:Owner": "present"}]}]
        }),
        &core,
    )
    .expect("policy should load");

    let report = policy.run(None).await.expect("run should succeed");
    assert_eq!(ids(&report.resources), vec!["orphan", "bare"]);
}

#[tokio::test]
async fn given_day_count_beyond_the_calendar_when_age_filter_runs_then_nothing_matches() {
    let old = (OffsetDateTime::now_utc() - Duration::days(10))
        .format(&Rfc3339)
        .expect("format date");
    let (_, core) = single_type(json!([{"TaskId": "old", "CreatedAt": old}]));
    for op in ["gt", "lt"] {
        let policy = Policy::from_value(
            &json!({
                "name": "ancient",
                "resource": "test.task",
                "filters": [{
                    "type": "value",
                    "key": "CreatedAt",
                    "value_type": "age",
                    "op": op,
                    "value": 10_000_000
                }]
            }),
            &core,
        )
        .expect("policy should load");

        let report = policy.run(None).await.expect("run should succeed");
        assert!(report.resources.is_empty(), "op {op}");
    }
}

#[test]
fn given_unbounded_skew_when_marked_for_op_loads_then_policy_is_rejected() {
    let (session, core) = single_type(json!([{"TaskId": "t-1"}]));
    let err = Policy::from_value(
        &json!({
            "name": "far-future",
            "resource": "test.task",
            "filters": [{"type": "marked-for-op", "skew": 10_000_000}]
        }),
        &core,
    )
    .expect_err("skew should be rejected");
    assert_eq!(err.kind, custodian::error::ErrorKind::PolicyValidation);
    assert!(session.calls().is_empty());
}
