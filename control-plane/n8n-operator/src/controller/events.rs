use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use tokio::sync::Mutex;
use tracing::warn;

pub const REASON_DELETING: &str = "Deleting";
pub const ACTION_FINALIZE: &str = "Finalize";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeType {
    Normal,
    Warning,
}

/// Event payload, detached from any particular recorder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub type_: NoticeType,
    pub reason: String,
    pub note: Option<String>,
    pub action: String,
}

/// Fire-and-forget event emission. Delivery failures are logged by the
/// implementation and never reach the reconciler.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, reference: &ObjectReference, notice: Notice);
}

pub struct KubeEvents {
    recorder: Recorder,
}

impl KubeEvents {
    pub fn new(client: Client, reporter: &str) -> Self {
        let reporter = Reporter {
            controller: reporter.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, reference: &ObjectReference, notice: Notice) {
        let event = Event {
            type_: match notice.type_ {
                NoticeType::Normal => EventType::Normal,
                NoticeType::Warning => EventType::Warning,
            },
            reason: notice.reason,
            note: notice.note,
            action: notice.action,
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!(error = %e, reason = %event.reason, "failed to publish event");
        }
    }
}

/// Keeps published events in memory.
#[derive(Default)]
pub struct RecordingEvents {
    published: Mutex<Vec<(ObjectReference, Notice)>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<(ObjectReference, Notice)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, reference: &ObjectReference, notice: Notice) {
        self.published.lock().await.push((reference.clone(), notice));
    }
}
