//! In-process [`Store`] that mimics the API server semantics the
//! reconciler relies on: resourceVersion conflicts, a separate status
//! write, finalizer-gated deletion and owner-reference garbage collection.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{ObjectKey, Store, StoreError, StoreObject};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// One mutating call that reached the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub verb: Verb,
    pub kind: String,
    pub name: String,
}

type Key = (String, String, String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fault {
    Fail,
    /// Another writer removes the object just before the call lands.
    Vanish,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    version: u64,
    writes: Vec<Write>,
    failures: Vec<(Verb, String, Fault)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn type_key<K: StoreObject>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn key_of<K: StoreObject>(namespace: &str, name: &str) -> Key {
    (type_key::<K>(), namespace.to_string(), name.to_string())
}

fn metadata_mut(value: &mut Value) -> Option<&mut serde_json::Map<String, Value>> {
    value.get_mut("metadata").and_then(Value::as_object_mut)
}

fn has_finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(value: &Value) -> bool {
    !value["metadata"]["deletionTimestamp"].is_null()
}

fn owner_uids(value: &Value) -> Vec<&str> {
    value["metadata"]["ownerReferences"]
        .as_array()
        .map(|refs| refs.iter().filter_map(|r| r["uid"].as_str()).collect())
        .unwrap_or_default()
}

impl Inner {
    fn take_failure<K: StoreObject>(
        &mut self,
        verb: Verb,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let kind = K::kind(&()).to_string();
        let Some(i) = self
            .failures
            .iter()
            .position(|(v, k, _)| *v == verb && *k == kind)
        else {
            return Ok(());
        };
        let (_, _, fault) = self.failures.remove(i);
        match fault {
            Fault::Fail => Err(StoreError::Injected(format!("{verb:?} {kind}"))),
            Fault::Vanish => {
                let key = key_of::<K>(namespace, name);
                if self.objects.contains_key(&key) {
                    self.remove_cascading(&key);
                }
                Err(StoreError::NotFound(ObjectKey::of::<K>(namespace, name)))
            }
        }
    }

    fn log(&mut self, verb: Verb, kind: &str, name: &str) {
        self.writes.push(Write {
            verb,
            kind: kind.to_string(),
            name: name.to_string(),
        });
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn check_version(&self, key: &Key, stored: &Value, obj: &Value) -> Result<(), StoreError> {
        let incoming = &obj["metadata"]["resourceVersion"];
        if !incoming.is_null() && *incoming != stored["metadata"]["resourceVersion"] {
            let (kind, namespace, name) = key;
            return Err(StoreError::Conflict(ObjectKey {
                kind: kind.rsplit('/').next().unwrap_or(kind).to_string(),
                namespace: namespace.clone(),
                name: name.clone(),
            }));
        }
        Ok(())
    }

    /// Drop `key` and, transitively, every object owned by it.
    fn remove_cascading(&mut self, key: &Key) {
        let mut pending = vec![key.clone()];
        while let Some(next) = pending.pop() {
            let Some(removed) = self.objects.remove(&next) else {
                continue;
            };
            let Some(uid) = removed["metadata"]["uid"].as_str() else {
                continue;
            };
            let owned: BTreeSet<Key> = self
                .objects
                .iter()
                .filter(|(_, v)| owner_uids(v).contains(&uid))
                .map(|(k, _)| k.clone())
                .collect();
            pending.extend(owned);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `verb` call on `kind` fail with [`StoreError::Injected`].
    pub async fn fail_next(&self, verb: Verb, kind: &str) {
        let mut inner = self.inner.lock().await;
        inner.failures.push((verb, kind.to_string(), Fault::Fail));
    }

    /// Make the object targeted by the next `verb` call on `kind` disappear
    /// first, so that call reports [`StoreError::NotFound`].
    pub async fn lose_next(&self, verb: Verb, kind: &str) {
        let mut inner = self.inner.lock().await;
        inner.failures.push((verb, kind.to_string(), Fault::Vanish));
    }

    /// Mutating calls seen so far, oldest first.
    pub async fn writes(&self) -> Vec<Write> {
        self.inner.lock().await.writes.clone()
    }

    pub async fn clear_writes(&self) {
        self.inner.lock().await.writes.clear();
    }

    pub async fn contains<K: StoreObject>(&self, namespace: &str, name: &str) -> bool {
        self.inner
            .lock()
            .await
            .objects
            .contains_key(&key_of::<K>(namespace, name))
    }

    /// Number of stored objects of kind `K` in `namespace`.
    pub async fn count<K: StoreObject>(&self, namespace: &str) -> usize {
        let type_key = type_key::<K>();
        self.inner
            .lock()
            .await
            .objects
            .keys()
            .filter(|(t, ns, _)| *t == type_key && ns == namespace)
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.take_failure::<K>(Verb::Get, namespace, name)?;
        match inner.objects.get(&key_of::<K>(namespace, name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn create<K: StoreObject>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        let kind = K::kind(&()).to_string();
        let name = obj.name_any();
        let key = key_of::<K>(namespace, &name);
        let mut inner = self.inner.lock().await;
        inner.take_failure::<K>(Verb::Create, namespace, &name)?;
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(ObjectKey::of::<K>(namespace, &name)));
        }

        let mut created = obj.clone();
        let version = inner.next_version();
        let meta = created.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.uid = Some(format!("{kind}-{name}-{version}").to_lowercase());
        meta.resource_version = Some(version);
        meta.generation = Some(1);
        meta.creation_timestamp = None;
        meta.deletion_timestamp = None;

        inner.objects.insert(key, serde_json::to_value(&created)?);
        inner.log(Verb::Create, &kind, &name);
        Ok(created)
    }

    async fn update<K: StoreObject>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        let kind = K::kind(&()).to_string();
        let name = obj.name_any();
        let key = key_of::<K>(namespace, &name);
        let mut inner = self.inner.lock().await;
        inner.take_failure::<K>(Verb::Update, namespace, &name)?;
        let Some(stored) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(ObjectKey::of::<K>(namespace, &name)));
        };
        let mut next = serde_json::to_value(obj)?;
        inner.check_version(&key, &stored, &next)?;

        let version = inner.next_version();
        if let Some(meta) = metadata_mut(&mut next) {
            // Server-owned fields survive a body update
            for field in ["uid", "deletionTimestamp", "generation", "namespace"] {
                match stored["metadata"].get(field) {
                    Some(v) => meta.insert(field.to_string(), v.clone()),
                    None => meta.remove(field),
                };
            }
            meta.insert("resourceVersion".to_string(), Value::String(version));
        }
        if let Some(body) = next.as_object_mut() {
            match stored.get("status") {
                Some(status) => body.insert("status".to_string(), status.clone()),
                None => body.remove("status"),
            };
        }

        inner.log(Verb::Update, &kind, &name);
        let updated: K = serde_json::from_value(next.clone())?;
        if is_deleting(&next) && !has_finalizers(&next) {
            inner.remove_cascading(&key);
        } else {
            inner.objects.insert(key, next);
        }
        Ok(updated)
    }

    async fn update_status<K: StoreObject>(
        &self,
        namespace: &str,
        obj: &K,
    ) -> Result<K, StoreError> {
        let kind = K::kind(&()).to_string();
        let name = obj.name_any();
        let key = key_of::<K>(namespace, &name);
        let mut inner = self.inner.lock().await;
        inner.take_failure::<K>(Verb::UpdateStatus, namespace, &name)?;
        let Some(mut stored) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(ObjectKey::of::<K>(namespace, &name)));
        };
        let incoming = serde_json::to_value(obj)?;
        inner.check_version(&key, &stored, &incoming)?;

        let version = inner.next_version();
        if let Some(meta) = metadata_mut(&mut stored) {
            meta.insert("resourceVersion".to_string(), Value::String(version));
        }
        if let Some(body) = stored.as_object_mut() {
            match incoming.get("status") {
                Some(status) => body.insert("status".to_string(), status.clone()),
                None => body.remove("status"),
            };
        }

        inner.log(Verb::UpdateStatus, &kind, &name);
        let updated = serde_json::from_value(stored.clone())?;
        inner.objects.insert(key, stored);
        Ok(updated)
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let kind = K::kind(&()).to_string();
        let key = key_of::<K>(namespace, name);
        let mut inner = self.inner.lock().await;
        inner.take_failure::<K>(Verb::Delete, namespace, name)?;
        let Some(mut stored) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(ObjectKey::of::<K>(namespace, name)));
        };
        inner.log(Verb::Delete, &kind, name);

        if !has_finalizers(&stored) {
            inner.remove_cascading(&key);
            return Ok(());
        }
        if !is_deleting(&stored) {
            let version = inner.next_version();
            if let Some(meta) = metadata_mut(&mut stored) {
                meta.insert(
                    "deletionTimestamp".to_string(),
                    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
                meta.insert("resourceVersion".to_string(), Value::String(version));
            }
            inner.objects.insert(key, stored);
        }
        Ok(())
    }
}
