#![allow(dead_code)]

use std::sync::Arc;

use k8s_openapi::api::core::v1::EnvVar;
use kube::runtime::controller::Action;
use n8n_operator::controller::{
    EventSink, Images, ReconcileContext, ReconcileErr, RecordingEvents, reconcile_n8n,
};
use n8n_operator::crd::n8n::{Condition, ConditionType, Database, N8n, N8nSpec, Postgres};
use n8n_operator::store::{MemoryStore, Store};
use tokio_util::sync::CancellationToken;

pub const NS: &str = "automation";
pub const IMAGE: &str = "ghcr.io/n8n-io/n8n:1.85.3";
pub const INIT_IMAGE: &str = "busybox";

pub fn images() -> Images {
    Images {
        n8n: IMAGE.to_string(),
        init: INIT_IMAGE.to_string(),
    }
}

pub fn postgres() -> Database {
    Database {
        postgres: Postgres {
            host: "db".into(),
            port: 5432,
            database: "n8n".into(),
            user: "u".into(),
            password: "p".into(),
            ssl: false,
        },
    }
}

pub fn env_value<'a>(env: &'a [EnvVar], name: &str) -> Option<&'a str> {
    env.iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.as_deref())
}

/// The reconciler wired to an in-memory store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub events: Arc<RecordingEvents>,
    pub ctx: ReconcileContext<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingEvents::new());
        let ctx = ReconcileContext {
            store: store.clone(),
            events: events.clone(),
            images: images(),
        };
        Self { store, events, ctx }
    }

    /// Swap in a different event sink, built with access to the store.
    pub fn with_sink(f: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn EventSink>) -> Self {
        let mut h = Self::new();
        h.ctx.events = f(h.store.clone());
        h
    }

    pub async fn submit(&self, name: &str, spec: N8nSpec) -> N8n {
        self.store
            .create(NS, &N8n::new(name, spec))
            .await
            .expect("create N8n")
    }

    pub async fn reconcile(&self, name: &str) -> Result<Action, ReconcileErr> {
        self.reconcile_with(name, &CancellationToken::new()).await
    }

    pub async fn reconcile_with(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileErr> {
        reconcile_n8n(&self.ctx, NS, name, cancel).await
    }

    pub async fn record(&self, name: &str) -> Option<N8n> {
        self.store.get::<N8n>(NS, name).await.expect("get N8n")
    }

    pub async fn condition(&self, name: &str, type_: ConditionType) -> Option<Condition> {
        self.record(name).await?.condition(type_).cloned()
    }

    pub async fn edit_spec(&self, name: &str, f: impl FnOnce(&mut N8nSpec)) {
        let mut n8n = self.record(name).await.expect("record exists");
        f(&mut n8n.spec);
        self.store.update(NS, &n8n).await.expect("update N8n");
    }

    pub async fn request_delete(&self, name: &str) {
        self.store
            .delete::<N8n>(NS, name)
            .await
            .expect("delete N8n");
    }

    pub async fn get<K: n8n_operator::store::StoreObject>(&self, name: &str) -> Option<K> {
        self.store.get::<K>(NS, name).await.expect("get child")
    }
}
