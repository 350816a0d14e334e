//! In-memory cluster double. Mimics the API-server behaviors the
//! reconciler depends on: creation timestamps, uid assignment,
//! already-exists on create, and immutable-field rejection when a job's
//! pod template changes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::{kind_of, DeletePropagation, ObjectStore, StoreError, StoreObject};

type Key = (String, String, String); // (kind, namespace, name)

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    job_logs: HashMap<String, String>,
    creations: Vec<String>,
    next_uid: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canned log text returned by `job_logs` for the named job.
    pub fn set_job_logs(&self, job_name: &str, text: &str) {
        self.lock().job_logs.insert(job_name.into(), text.into());
    }

    /// Every create performed, as `Kind/namespace/name`, in order.
    pub fn creations(&self) -> Vec<String> {
        self.lock().creations.clone()
    }

    /// Rewrite an object's creation timestamp to `age` in the past.
    pub fn backdate_creation<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        age: chrono::Duration,
    ) {
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let mut st = self.lock();
        if let Some(obj) = st.objects.get_mut(&key) {
            let ts = (Utc::now() - age).to_rfc3339_opts(SecondsFormat::Secs, true);
            obj["metadata"]["creationTimestamp"] = Value::String(ts);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn meta_str(obj: &Value, field: &str) -> Option<String> {
    obj.get("metadata")
        .and_then(|m| m.get(field))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn label_matches(obj: &Value, key: &str, value: &str) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.get(key))
        .and_then(|v| v.as_str())
        .map(|v| v == value)
        .unwrap_or(false)
}

fn parse_selector(selector: &str) -> Result<(String, String), StoreError> {
    selector
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| StoreError::Api(format!("unsupported label selector: {selector}")))
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        match self.lock().objects.get(&key) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        let mut raw = serde_json::to_value(obj)?;
        let namespace = meta_str(&raw, "namespace").unwrap_or_default();
        let name = meta_str(&raw, "name").unwrap_or_default();
        let key = (kind.clone(), namespace.clone(), name.clone());

        let mut st = self.lock();
        if st.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind,
                namespace,
                name,
            });
        }
        if meta_str(&raw, "creationTimestamp").is_none() {
            let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            raw["metadata"]["creationTimestamp"] = Value::String(ts);
        }
        if meta_str(&raw, "uid").is_none() {
            st.next_uid += 1;
            raw["metadata"]["uid"] = Value::String(format!("mem-uid-{}", st.next_uid));
        }
        raw["metadata"]["resourceVersion"] = Value::String("1".into());
        st.creations.push(format!("{kind}/{namespace}/{name}"));
        st.objects.insert(key, raw.clone());
        Ok(serde_json::from_value(raw)?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        let mut raw = serde_json::to_value(obj)?;
        let namespace = meta_str(&raw, "namespace").unwrap_or_default();
        let name = meta_str(&raw, "name").unwrap_or_default();
        let key = (kind.clone(), namespace.clone(), name.clone());

        let mut st = self.lock();
        let Some(existing) = st.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound {
                kind,
                namespace,
                name,
            });
        };

        // The pod template of a running job is immutable, as on a real
        // API server.
        if kind == "Job" {
            let prev = existing.pointer("/spec/template");
            let next = raw.pointer("/spec/template");
            if prev.is_some() && prev != next {
                return Err(StoreError::Immutable {
                    kind,
                    namespace,
                    name,
                    message: "field is immutable: spec.template".into(),
                });
            }
        }

        // Server-owned metadata survives a replace.
        if meta_str(&raw, "creationTimestamp").is_none() {
            raw["metadata"]["creationTimestamp"] =
                existing["metadata"]["creationTimestamp"].clone();
        }
        if meta_str(&raw, "uid").is_none() {
            raw["metadata"]["uid"] = existing["metadata"]["uid"].clone();
        }
        let rv = meta_str(&existing, "resourceVersion")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(1);
        raw["metadata"]["resourceVersion"] = Value::String((rv + 1).to_string());

        st.objects.insert(key, raw.clone());
        Ok(serde_json::from_value(raw)?)
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        _propagation: DeletePropagation,
    ) -> Result<(), StoreError> {
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        self.lock().objects.remove(&key);
        Ok(())
    }

    async fn delete_labeled<K: StoreObject>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<(), StoreError> {
        let (k, v) = parse_selector(selector)?;
        let kind = kind_of::<K>();
        let mut st = self.lock();
        st.objects.retain(|(obj_kind, obj_ns, _), obj| {
            !(obj_kind == &kind && obj_ns == namespace && label_matches(obj, &k, &v))
        });
        Ok(())
    }

    async fn job_logs(
        &self,
        _namespace: &str,
        job_name: &str,
        _tail_lines: i64,
    ) -> Result<String, StoreError> {
        Ok(self.lock().job_logs.get(job_name).cloned().unwrap_or_default())
    }
}
