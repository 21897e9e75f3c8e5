//! Keyed status conditions on the [`N8n`] record.

use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::crd::n8n::{Condition, ConditionStatus, ConditionType, N8n, N8nStatus};
use crate::store::{Store, StoreError};

pub const REASON_RECONCILING: &str = "Reconciling";
pub const REASON_FINALIZING: &str = "Finalizing";

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Upsert the condition for `type_`. The transition time moves only when
/// the status value changes. Returns whether anything changed.
pub fn set_condition(
    status: &mut N8nStatus,
    type_: ConditionType,
    value: ConditionStatus,
    reason: &str,
    message: &str,
    at: &str,
) -> bool {
    match status.conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            let transitioned = existing.status != value;
            let changed =
                transitioned || existing.reason != reason || existing.message != message;
            if transitioned {
                existing.status = value;
                existing.last_transition_time = Some(at.to_string());
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            changed
        }
        None => {
            status.conditions.push(Condition {
                type_,
                status: value,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Some(at.to_string()),
            });
            true
        }
    }
}

/// Set one condition and persist the status subresource if it changed.
/// `obj` is replaced with the stored copy after a write.
pub async fn record<S: Store>(
    store: &S,
    namespace: &str,
    obj: &mut N8n,
    type_: ConditionType,
    value: ConditionStatus,
    reason: &str,
    message: &str,
) -> Result<bool, StoreError> {
    let mut status = obj.status.clone().unwrap_or_default();
    if !set_condition(&mut status, type_.clone(), value, reason, message, &now()) {
        return Ok(false);
    }
    let mut next = obj.clone();
    next.status = Some(status);
    *obj = store.update_status(namespace, &next).await?;
    debug!(%namespace, type_ = type_.as_str(), ?value, reason, "status: condition recorded");
    Ok(true)
}
