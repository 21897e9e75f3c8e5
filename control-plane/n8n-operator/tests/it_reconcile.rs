// Drives the full reconcile loop against the in-memory store.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ObjectReference, PersistentVolumeClaim, Service},
    networking::v1::Ingress,
};
use n8n_operator::controller::conditions;
use n8n_operator::controller::finalizer::{FINALIZER, has_finalizer};
use n8n_operator::controller::{EventSink, Notice, NoticeType, ReconcileErr};
use n8n_operator::crd::gateway::HttpRoute;
use n8n_operator::crd::monitoring::ServiceMonitor;
use n8n_operator::crd::n8n::{
    Condition, ConditionStatus, ConditionType, GatewayRef, HostnameConfig, HttpRouteConfig,
    IngressConfig, MetricsConfig, N8n, N8nSpec, N8nStatus, PersistentStorageConfig,
};
use n8n_operator::store::{MemoryStore, Store, StoreError, Verb, Write};
use n8n_operator::templates::SynthesisError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

mod common;
use common::{Harness, NS, env_value, postgres};

fn storage(size: &str) -> Option<PersistentStorageConfig> {
    Some(PersistentStorageConfig {
        enable: true,
        storage_class_name: None,
        size: size.to_string(),
    })
}

fn write(verb: Verb, kind: &str, name: &str) -> Write {
    Write {
        verb,
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

#[test_log::test(tokio::test)]
async fn missing_record_is_a_noop() {
    let h = Harness::new();
    h.reconcile("ghost").await.expect("reconcile");
    assert!(h.store.writes().await.is_empty());
}

#[test_log::test(tokio::test)]
async fn first_pass_initializes_and_creates_base_children() {
    let h = Harness::new();
    h.submit("demo", N8nSpec::default()).await;
    h.store.clear_writes().await;

    h.reconcile("demo").await.expect("reconcile");

    assert_eq!(
        h.store.writes().await,
        vec![
            write(Verb::UpdateStatus, "N8n", "demo"),
            write(Verb::Update, "N8n", "demo"),
            write(Verb::Create, "Deployment", "demo"),
            write(Verb::Create, "Service", "demo"),
            write(Verb::UpdateStatus, "N8n", "demo"),
        ]
    );
    let n8n = h.record("demo").await.unwrap();
    assert!(has_finalizer(&n8n));
    assert_eq!(n8n.conditions().len(), 1);
    let available = n8n.condition(ConditionType::Available).unwrap();
    assert_eq!(available.status, ConditionStatus::True);
    assert_eq!(available.reason, conditions::REASON_RECONCILING);

    let svc: Service = h.get("demo").await.unwrap();
    let owner = &svc.metadata.owner_references.unwrap()[0];
    assert_eq!(owner.uid, n8n.metadata.uid.unwrap());
    assert!(h.get::<PersistentVolumeClaim>("demo-data").await.is_none());
    assert!(h.get::<Ingress>("demo").await.is_none());
    assert!(h.get::<ServiceMonitor>("demo").await.is_none());
}

#[test_log::test(tokio::test)]
async fn second_pass_on_unchanged_record_writes_nothing() {
    let h = Harness::new();
    h.submit(
        "demo",
        N8nSpec {
            database: Some(postgres()),
            ingress: Some(IngressConfig {
                enable: true,
                ..Default::default()
            }),
            persistent_storage: storage("10Gi"),
            metrics: Some(MetricsConfig { enable: true }),
            hostname: Some(HostnameConfig {
                enable: true,
                url: Some("n8n.example.com".into()),
            }),
            ..Default::default()
        },
    )
    .await;

    h.reconcile("demo").await.expect("first pass");
    let before = h.record("demo").await.unwrap();
    h.store.clear_writes().await;

    h.reconcile("demo").await.expect("second pass");

    assert!(h.store.writes().await.is_empty());
    let after = h.record("demo").await.unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.metadata.resource_version, before.metadata.resource_version);
}

#[test_log::test(tokio::test)]
async fn volume_claim_is_created_exactly_once_with_declared_size() {
    let h = Harness::new();
    h.submit(
        "demo",
        N8nSpec {
            persistent_storage: storage("5Gi"),
            ..Default::default()
        },
    )
    .await;

    for _ in 0..3 {
        h.reconcile("demo").await.expect("reconcile");
    }

    assert_eq!(h.store.count::<PersistentVolumeClaim>(NS).await, 1);
    let pvc: PersistentVolumeClaim = h.get("demo-data").await.unwrap();
    let requests = pvc.spec.unwrap().resources.unwrap().requests.unwrap();
    assert_eq!(requests["storage"].0, "5Gi");

    // Size edits are not applied to an existing claim
    h.edit_spec("demo", |s| s.persistent_storage = storage("20Gi"))
        .await;
    h.reconcile("demo").await.expect("reconcile after resize");
    let pvc: PersistentVolumeClaim = h.get("demo-data").await.unwrap();
    let requests = pvc.spec.unwrap().resources.unwrap().requests.unwrap();
    assert_eq!(requests["storage"].0, "5Gi");
}

#[test_log::test(tokio::test)]
async fn negative_volume_size_is_refused() {
    let h = Harness::new();
    h.submit(
        "demo",
        N8nSpec {
            persistent_storage: storage("-1Gi"),
            ..Default::default()
        },
    )
    .await;

    let err = h.reconcile("demo").await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileErr::Synthesis {
            source: SynthesisError::InvalidQuantity(ref q),
            ..
        } if q == "-1Gi"
    ));
    assert!(h.get::<PersistentVolumeClaim>("demo-data").await.is_none());
    assert!(h.get::<Deployment>("demo").await.is_none());
    let available = h.condition("demo", ConditionType::Available).await.unwrap();
    assert_eq!(available.status, ConditionStatus::False);
}

#[test_log::test(tokio::test)]
async fn enabling_storage_later_creates_the_claim() {
    let h = Harness::new();
    h.submit("demo", N8nSpec::default()).await;
    h.reconcile("demo").await.expect("reconcile");

    h.edit_spec("demo", |s| s.persistent_storage = storage("1Gi")).await;
    h.reconcile("demo").await.expect("reconcile");

    assert!(h.get::<PersistentVolumeClaim>("demo-data").await.is_some());
}

#[test_log::test(tokio::test)]
async fn metrics_flag_toggles_service_monitor() {
    let h = Harness::new();
    h.submit(
        "demo",
        N8nSpec {
            metrics: Some(MetricsConfig { enable: true }),
            ..Default::default()
        },
    )
    .await;

    h.reconcile("demo").await.expect("enable");
    let sm: ServiceMonitor = h.get("demo").await.expect("service monitor created");
    assert_eq!(sm.spec.endpoints[0].path.as_deref(), Some("/metrics"));

    h.edit_spec("demo", |s| s.metrics = Some(MetricsConfig { enable: false }))
        .await;
    h.reconcile("demo").await.expect("disable");
    assert!(h.get::<ServiceMonitor>("demo").await.is_none());
    assert!(h.get::<Deployment>("demo").await.is_some());
}

#[test_log::test(tokio::test)]
async fn failed_service_monitor_removal_marks_unavailable() {
    let h = Harness::new();
    h.submit(
        "demo",
        N8nSpec {
            metrics: Some(MetricsConfig { enable: true }),
            ..Default::default()
        },
    )
    .await;
    h.reconcile("demo").await.expect("enable");

    h.edit_spec("demo", |s| s.metrics = Some(MetricsConfig { enable: false }))
        .await;
    h.store.fail_next(Verb::Delete, "ServiceMonitor").await;
    let err = h.reconcile("demo").await.unwrap_err();
    assert!(matches!(err, ReconcileErr::Store(StoreError::Injected(_))));
    let available = h.condition("demo", ConditionType::Available).await.unwrap();
    assert_eq!(available.status, ConditionStatus::False);
    assert_eq!(
        available.message,
        "Failed to manage ServiceMonitor for the custom resource (demo): \
         injected failure: Delete ServiceMonitor"
    );
    assert!(h.get::<ServiceMonitor>("demo").await.is_some());

    h.reconcile("demo").await.expect("retry");
    assert!(h.get::<ServiceMonitor>("demo").await.is_none());
    let available = h.condition("demo", ConditionType::Available).await.unwrap();
    assert_eq!(available.status, ConditionStatus::True);
}

#[test_log::test(tokio::test)]
async fn service_monitor_removed_concurrently_counts_as_absent() {
    let h = Harness::new();
    h.submit(
        "demo",
        N8nSpec {
            metrics: Some(MetricsConfig { enable: true }),
            ..Default::default()
        },
    )
    .await;
    h.reconcile("demo").await.expect("enable");

    h.edit_spec("demo", |s| s.metrics = Some(MetricsConfig { enable: false }))
        .await;
    h.store.lose_next(Verb::Delete, "ServiceMonitor").await;
    h.reconcile("demo").await.expect("delete raced with another writer");
    assert!(h.get::<ServiceMonitor>("demo").await.is_none());
    let available = h.condition("demo", ConditionType::Available).await.unwrap();
    assert_eq!(available.status, ConditionStatus::True);
}

#[test_log::test(tokio::test)]
async fn ingress_and_route_together_create_neither() {
    let h = Harness::new();
    h.submit(
        "demo",
        N8nSpec {
            ingress: Some(IngressConfig {
                enable: true,
                ..Default::default()
            }),
            http_route: Some(HttpRouteConfig {
                enable: true,
                gateway_ref: Some(GatewayRef {
                    name: "public".into(),
                    namespace: None,
                }),
            }),
            ..Default::default()
        },
    )
    .await;

    for _ in 0..2 {
        let err = h.reconcile("demo").await.unwrap_err();
        match err {
            ReconcileErr::Synthesis { kind, source } => {
                assert_eq!(kind, "Ingress");
                assert_eq!(source, SynthesisError::ExposureConflict);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    assert!(h.get::<Ingress>("demo").await.is_none());
    assert!(h.get::<HttpRoute>("demo").await.is_none());
    let available = h.condition("demo", ConditionType::Available).await.unwrap();
    assert_eq!(available.status, ConditionStatus::False);
    assert!(
        available
            .message
            .starts_with("Failed to manage Ingress for the custom resource (demo):")
    );
}

#[test_log::test(tokio::test)]
async fn route_is_created_against_the_gateway() {
    let h = Harness::new();
    h.submit(
        "demo",
        N8nSpec {
            http_route: Some(HttpRouteConfig {
                enable: true,
                gateway_ref: Some(GatewayRef {
                    name: "public".into(),
                    namespace: Some("gateways".into()),
                }),
            }),
            hostname: Some(HostnameConfig {
                enable: true,
                url: Some("n8n.example.com".into()),
            }),
            ..Default::default()
        },
    )
    .await;

    h.reconcile("demo").await.expect("reconcile");

    let route: HttpRoute = h.get("demo").await.expect("route created");
    assert_eq!(route.spec.parent_refs[0].name, "public");
    assert_eq!(route.spec.parent_refs[0].namespace.as_deref(), Some("gateways"));
    assert_eq!(route.spec.hostnames, vec!["n8n.example.com".to_string()]);
    assert!(h.get::<Ingress>("demo").await.is_none());
}

#[test_log::test(tokio::test)]
async fn route_without_gateway_fails_after_base_children() {
    let h = Harness::new();
    h.submit(
        "demo",
        N8nSpec {
            http_route: Some(HttpRouteConfig {
                enable: true,
                gateway_ref: None,
            }),
            ..Default::default()
        },
    )
    .await;

    let err = h.reconcile("demo").await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileErr::Synthesis { ref kind, source: SynthesisError::MissingGatewayRef } if kind == "HTTPRoute"
    ));
    assert!(h.get::<Deployment>("demo").await.is_some());
    assert!(h.get::<Service>("demo").await.is_some());
}

#[test_log::test(tokio::test)]
async fn database_section_shapes_workload_environment() {
    let h = Harness::new();
    h.submit(
        "with-db",
        N8nSpec {
            database: Some(postgres()),
            ..Default::default()
        },
    )
    .await;
    h.submit("plain", N8nSpec::default()).await;

    h.reconcile("with-db").await.expect("reconcile with db");
    h.reconcile("plain").await.expect("reconcile plain");

    let dep: Deployment = h.get("with-db").await.unwrap();
    let env = dep.spec.unwrap().template.spec.unwrap().containers[0]
        .env
        .clone()
        .unwrap();
    assert_eq!(env.len(), 8);
    assert_eq!(env_value(&env, "DB_POSTGRESDB_SSL_REJECT_UNAUTHORIZED"), Some("true"));
    assert_eq!(env_value(&env, "DB_POSTGRESDB_HOST"), Some("db"));

    let dep: Deployment = h.get("plain").await.unwrap();
    let env = dep.spec.unwrap().template.spec.unwrap().containers[0]
        .env
        .clone()
        .unwrap();
    assert_eq!(env.len(), 1);
}

#[test_log::test(tokio::test)]
async fn create_failure_marks_unavailable_and_next_pass_resumes() {
    let h = Harness::new();
    h.submit("demo", N8nSpec::default()).await;
    h.store.fail_next(Verb::Create, "Service").await;

    let err = h.reconcile("demo").await.unwrap_err();
    assert!(matches!(err, ReconcileErr::Store(StoreError::Injected(_))));
    let available = h.condition("demo", ConditionType::Available).await.unwrap();
    assert_eq!(available.status, ConditionStatus::False);
    assert_eq!(
        available.message,
        "Failed to manage Service for the custom resource (demo): injected failure: Create Service"
    );
    assert!(h.get::<Deployment>("demo").await.is_some());

    h.store.clear_writes().await;
    h.reconcile("demo").await.expect("retry");
    let writes = h.store.writes().await;
    assert!(!writes.contains(&write(Verb::Create, "Deployment", "demo")));
    assert!(writes.contains(&write(Verb::Create, "Service", "demo")));
    let available = h.condition("demo", ConditionType::Available).await.unwrap();
    assert_eq!(available.status, ConditionStatus::True);
}

#[test_log::test(tokio::test)]
async fn failed_child_read_marks_unavailable() {
    let h = Harness::new();
    h.submit("demo", N8nSpec::default()).await;
    h.store.fail_next(Verb::Get, "Deployment").await;

    let err = h.reconcile("demo").await.unwrap_err();
    assert!(matches!(err, ReconcileErr::Store(StoreError::Injected(_))));
    let available = h.condition("demo", ConditionType::Available).await.unwrap();
    assert_eq!(available.status, ConditionStatus::False);
    assert_eq!(
        available.message,
        "Failed to manage Deployment for the custom resource (demo): \
         injected failure: Get Deployment"
    );
    assert!(h.get::<Deployment>("demo").await.is_none());
    assert!(h.get::<Service>("demo").await.is_none());
}

#[test_log::test(tokio::test)]
async fn foreign_conditions_survive_a_pass() {
    let h = Harness::new();
    let mut n8n = h.submit("demo", N8nSpec::default()).await;
    let foreign: Vec<Condition> = ["Progressing", "Ready"]
        .into_iter()
        .map(|t| Condition {
            type_: ConditionType::Other(t.to_string()),
            status: ConditionStatus::True,
            reason: "External".into(),
            message: "set by another controller".into(),
            last_transition_time: Some("2024-01-01T00:00:00Z".into()),
        })
        .collect();
    n8n.status = Some(N8nStatus {
        conditions: foreign.clone(),
    });
    h.store.update_status(NS, &n8n).await.expect("seed status");

    h.reconcile("demo").await.expect("reconcile");

    let n8n = h.record("demo").await.unwrap();
    let types: Vec<&str> = n8n.conditions().iter().map(|c| c.type_.as_str()).collect();
    assert_eq!(types, ["Progressing", "Ready", "Available"]);
    assert_eq!(&n8n.conditions()[..2], &foreign[..]);
    let raw = serde_json::to_value(&n8n).unwrap();
    assert_eq!(raw["status"]["conditions"][0]["type"], "Progressing");
}

#[test_log::test(tokio::test)]
async fn failed_status_write_surfaces_both_errors() {
    let h = Harness::new();
    h.submit("demo", N8nSpec::default()).await;
    h.reconcile("demo").await.expect("first pass");

    h.edit_spec("demo", |s| s.persistent_storage = storage("ten gigs"))
        .await;
    h.store.fail_next(Verb::UpdateStatus, "N8n").await;

    let err = h.reconcile("demo").await.unwrap_err();
    match err {
        ReconcileErr::StatusUpdate { source, status } => {
            assert!(matches!(
                *source,
                ReconcileErr::Synthesis {
                    source: SynthesisError::InvalidQuantity(_),
                    ..
                }
            ));
            assert!(matches!(*status, ReconcileErr::Store(StoreError::Injected(_))));
        }
        other => panic!("unexpected error {other:?}"),
    }
    // The last persisted condition is still the successful one
    let available = h.condition("demo", ConditionType::Available).await.unwrap();
    assert_eq!(available.status, ConditionStatus::True);
}

#[test_log::test(tokio::test)]
async fn cancelled_pass_writes_nothing() {
    let h = Harness::new();
    h.submit("demo", N8nSpec::default()).await;
    h.store.clear_writes().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.reconcile_with("demo", &cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(h.store.writes().await.is_empty());
}

#[test_log::test(tokio::test)]
async fn stale_copy_conflicts_on_persist() {
    let h = Harness::new();
    h.submit("demo", N8nSpec::default()).await;
    let mut stale = h.record("demo").await.unwrap();
    h.edit_spec("demo", |s| s.metrics = Some(MetricsConfig { enable: true }))
        .await;

    let err = conditions::record(
        h.store.as_ref(),
        NS,
        &mut stale,
        ConditionType::Available,
        ConditionStatus::Unknown,
        conditions::REASON_RECONCILING,
        "Starting reconciliation",
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StoreError::Conflict(_)));
    assert!(err.is_transient());
}

#[test_log::test(tokio::test)]
async fn deletion_emits_event_releases_finalizer_and_collects_children() {
    let h = Harness::new();
    h.submit(
        "demo",
        N8nSpec {
            persistent_storage: storage("1Gi"),
            metrics: Some(MetricsConfig { enable: true }),
            ..Default::default()
        },
    )
    .await;
    h.reconcile("demo").await.expect("reconcile");

    h.request_delete("demo").await;
    assert!(h.record("demo").await.is_some(), "finalizer holds the record");
    h.reconcile("demo").await.expect("finalize");

    assert!(h.record("demo").await.is_none());
    assert!(h.get::<Deployment>("demo").await.is_none());
    assert!(h.get::<Service>("demo").await.is_none());
    assert!(h.get::<PersistentVolumeClaim>("demo-data").await.is_none());
    assert!(h.get::<ServiceMonitor>("demo").await.is_none());

    let published = h.events.published().await;
    assert_eq!(published.len(), 1);
    let (reference, notice) = &published[0];
    assert_eq!(reference.name.as_deref(), Some("demo"));
    assert_eq!(reference.namespace.as_deref(), Some(NS));
    assert_eq!(notice.type_, NoticeType::Warning);
    assert_eq!(notice.reason, "Deleting");
    assert_eq!(
        notice.note.as_deref(),
        Some("Custom Resource demo is being deleted from the namespace automation")
    );
}

/// Looks the record up while the deletion event is being published.
struct FinalizerWitness {
    store: Arc<MemoryStore>,
    seen: Mutex<Vec<bool>>,
}

#[async_trait]
impl EventSink for FinalizerWitness {
    async fn publish(&self, reference: &ObjectReference, _notice: Notice) {
        let name = reference.name.clone().unwrap_or_default();
        let present = self
            .store
            .get::<N8n>(NS, &name)
            .await
            .ok()
            .flatten()
            .is_some_and(|n| has_finalizer(&n));
        self.seen.lock().await.push(present);
    }
}

#[test_log::test(tokio::test)]
async fn finalizer_is_present_while_the_deletion_event_runs() {
    let mut h = Harness::new();
    let witness = Arc::new(FinalizerWitness {
        store: h.store.clone(),
        seen: Mutex::default(),
    });
    h.ctx.events = witness.clone();
    h.submit("demo", N8nSpec::default()).await;
    h.reconcile("demo").await.expect("reconcile");
    h.request_delete("demo").await;
    h.reconcile("demo").await.expect("finalize");

    assert_eq!(*witness.seen.lock().await, vec![true]);
    assert!(h.record("demo").await.is_none());
}

#[test_log::test(tokio::test)]
async fn deleting_record_gets_no_new_children() {
    let h = Harness::new();
    let mut record = N8n::new("demo", N8nSpec::default());
    record.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
    h.store.create(NS, &record).await.unwrap();
    h.reconcile("demo").await.expect("reconcile");

    h.request_delete("demo").await;
    h.edit_spec("demo", |s| {
        s.metrics = Some(MetricsConfig { enable: true });
        s.persistent_storage = storage("1Gi");
    })
    .await;
    h.reconcile("demo").await.expect("finalize");
    h.reconcile("demo").await.expect("already finalized");

    let n8n = h.record("demo").await.expect("held by foreign finalizer");
    assert!(!has_finalizer(&n8n));
    assert_eq!(
        n8n.metadata.finalizers.as_deref(),
        Some(&["example.com/hold".to_string()][..])
    );
    let degraded = n8n.condition(ConditionType::Degraded).unwrap();
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.reason, conditions::REASON_FINALIZING);
    assert!(h.get::<ServiceMonitor>("demo").await.is_none());
    assert!(h.get::<PersistentVolumeClaim>("demo-data").await.is_none());
    assert_eq!(h.events.published().await.len(), 1);
}

#[test_log::test(tokio::test)]
async fn deletion_before_finalizer_attached_is_left_alone() {
    let h = Harness::new();
    let mut record = N8n::new("demo", N8nSpec::default());
    record.metadata.finalizers = Some(vec!["example.com/hold".to_string()]);
    h.store.create(NS, &record).await.unwrap();
    h.request_delete("demo").await;

    h.reconcile("demo").await.expect("reconcile");

    let n8n = h.record("demo").await.unwrap();
    assert!(!has_finalizer(&n8n));
    assert!(n8n.metadata.finalizers.as_ref().unwrap().iter().all(|f| f != FINALIZER));
    assert!(h.get::<Deployment>("demo").await.is_none());
    assert!(h.events.published().await.is_empty());
}

/// Cancels the invocation from inside the deletion event.
struct CancelOnPublish(CancellationToken);

#[async_trait]
impl EventSink for CancelOnPublish {
    async fn publish(&self, _reference: &ObjectReference, _notice: Notice) {
        self.0.cancel();
    }
}

#[test_log::test(tokio::test)]
async fn cancellation_mid_finalize_keeps_finalizer_for_next_pass() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let h = Harness::with_sink(move |_| Arc::new(CancelOnPublish(trigger)));
    h.submit("demo", N8nSpec::default()).await;
    h.reconcile("demo").await.expect("reconcile");
    h.request_delete("demo").await;

    let err = h.reconcile_with("demo", &cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    let n8n = h.record("demo").await.expect("still held");
    assert!(has_finalizer(&n8n));
    let degraded = n8n.condition(ConditionType::Degraded).unwrap();
    assert_eq!(degraded.status, ConditionStatus::Unknown);

    h.reconcile("demo").await.expect("resume");
    assert!(h.record("demo").await.is_none());
}
