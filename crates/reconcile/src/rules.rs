//! Rule table and entry-level list operations.
//!
//! Cached lists are JSON arrays of flat objects. An entry's identity is its
//! `(namespace, name)` pair; cluster-scoped entries carry no `namespace`.

use kdash_core::{CacheKey, ChangeEvent, ResourceKind};
use serde_json::{Map, Value};

/// How events of a kind reach the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Patch cached lists and details in place.
    Merge,
    /// Mark dependent keys stale and let the pull path refetch them.
    Invalidate,
}

/// Reconciliation rule per kind. In-place merging is opt-in; everything else
/// falls back to invalidate-and-refetch.
pub fn rule_for(kind: ResourceKind) -> Rule {
    match kind {
        ResourceKind::Deployment
        | ResourceKind::Pod
        | ResourceKind::StatefulSet
        | ResourceKind::DaemonSet
        | ResourceKind::Job
        | ResourceKind::Service
        | ResourceKind::Node => Rule::Merge,
        ResourceKind::Namespace
        | ResourceKind::ReplicaSet
        | ResourceKind::CronJob
        | ResourceKind::Ingress
        | ResourceKind::ConfigMap
        | ResourceKind::Secret
        | ResourceKind::PersistentVolumeClaim
        | ResourceKind::ServiceAccount
        | ResourceKind::Role
        | ResourceKind::RoleBinding
        | ResourceKind::ClusterRole
        | ResourceKind::ClusterRoleBinding
        | ResourceKind::NetworkPolicy
        | ResourceKind::Event => Rule::Invalidate,
    }
}

/// Whether list `key` of `kind` holds entries from namespace `ns`.
pub(crate) fn list_covers(key: &CacheKey, kind: ResourceKind, ns: Option<&str>) -> bool {
    match key {
        CacheKey::List { kind: k, namespace } => {
            *k == kind && (namespace.is_none() || namespace.as_deref() == ns)
        }
        _ => false,
    }
}

/// Whether `key` is a primary view (list or detail) holding the event's resource.
pub(crate) fn holds_resource(key: &CacheKey, event: &ChangeEvent) -> bool {
    match key {
        CacheKey::List { .. } => list_covers(key, event.kind, event.ns()),
        CacheKey::Detail { kind, namespace, name } => {
            *kind == event.kind && namespace.as_deref() == event.ns() && *name == event.name
        }
        CacheKey::Children { .. } => false,
    }
}

pub(crate) fn same_identity(entry: &Value, ns: Option<&str>, name: &str) -> bool {
    entry.get("name").and_then(Value::as_str) == Some(name)
        && entry.get("namespace").and_then(Value::as_str) == ns
}

/// Shallow merge: fields present in `patch` overwrite, everything else stays.
/// Identity fields are never taken from the patch. Returns whether any value changed.
pub(crate) fn merge_fields(target: &mut Map<String, Value>, patch: &Map<String, Value>) -> bool {
    let mut changed = false;
    for (k, v) in patch {
        if is_identity_field(k) {
            continue;
        }
        if target.get(k) != Some(v) {
            target.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

fn is_identity_field(key: &str) -> bool {
    key == "name" || key == "namespace"
}

pub(crate) fn new_entry(event: &ChangeEvent, patch: Option<&Map<String, Value>>) -> Value {
    let mut obj = patch.cloned().unwrap_or_default();
    match event.ns() {
        Some(ns) => {
            obj.insert("namespace".to_string(), Value::String(ns.to_string()));
        }
        None => {
            obj.remove("namespace");
        }
    }
    obj.insert("name".to_string(), Value::String(event.name.clone()));
    Value::Object(obj)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListEdit {
    Inserted,
    Merged { changed: bool },
}

/// Value under a list key is not an array; the key is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NotAList(pub &'static str);

pub(crate) fn upsert_entry(
    list: &mut Value,
    event: &ChangeEvent,
    patch: Option<&Map<String, Value>>,
) -> Result<ListEdit, NotAList> {
    let found = json_type(list);
    let items = list.as_array_mut().ok_or(NotAList(found))?;
    let pos = items.iter().position(|e| e.is_object() && same_identity(e, event.ns(), &event.name));
    match pos.and_then(|i| items.get_mut(i)).and_then(Value::as_object_mut) {
        Some(obj) => {
            let changed = patch.map(|p| merge_fields(obj, p)).unwrap_or(false);
            Ok(ListEdit::Merged { changed })
        }
        None => {
            items.push(new_entry(event, patch));
            Ok(ListEdit::Inserted)
        }
    }
}

/// Remove every entry with the event's identity; returns how many were removed.
pub(crate) fn remove_entry(list: &mut Value, event: &ChangeEvent) -> Result<usize, NotAList> {
    let found = json_type(list);
    let items = list.as_array_mut().ok_or(NotAList(found))?;
    let before = items.len();
    items.retain(|e| !same_identity(e, event.ns(), &event.name));
    Ok(before - items.len())
}

pub(crate) fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdash_core::ChangeVerb;
    use serde_json::json;

    fn ev(ns: Option<&str>, name: &str, data: Value) -> ChangeEvent {
        ChangeEvent {
            kind: ResourceKind::Deployment,
            verb: ChangeVerb::Modified,
            namespace: ns.map(str::to_string),
            name: name.to_string(),
            data: Some(data),
        }
    }

    #[test]
    fn rule_table_opts_in_workloads_only() {
        assert_eq!(rule_for(ResourceKind::Deployment), Rule::Merge);
        assert_eq!(rule_for(ResourceKind::Pod), Rule::Merge);
        assert_eq!(rule_for(ResourceKind::Ingress), Rule::Invalidate);
        assert_eq!(rule_for(ResourceKind::NetworkPolicy), Rule::Invalidate);
    }

    #[test]
    fn list_scope_matching() {
        let all = CacheKey::list(ResourceKind::Pod, None);
        let dflt = CacheKey::list(ResourceKind::Pod, Some("default"));
        let prod = CacheKey::list(ResourceKind::Pod, Some("prod"));
        assert!(list_covers(&all, ResourceKind::Pod, Some("default")));
        assert!(list_covers(&dflt, ResourceKind::Pod, Some("default")));
        assert!(!list_covers(&prod, ResourceKind::Pod, Some("default")));
        assert!(!list_covers(&all, ResourceKind::Service, Some("default")));
    }

    #[test]
    fn upsert_merges_by_identity_and_keeps_other_fields() {
        let mut list = json!([
            {"namespace": "default", "name": "api", "replicas_desired": 3, "status": "Progressing"},
            {"namespace": "prod", "name": "api", "replicas_desired": 5},
        ]);
        let patch = json!({"status": "Healthy"});
        let e = ev(Some("default"), "api", patch.clone());
        let edit = upsert_entry(&mut list, &e, patch.as_object()).unwrap();
        assert_eq!(edit, ListEdit::Merged { changed: true });
        assert_eq!(list[0], json!({"namespace": "default", "name": "api", "replicas_desired": 3, "status": "Healthy"}));
        assert_eq!(list[1], json!({"namespace": "prod", "name": "api", "replicas_desired": 5}));
    }

    #[test]
    fn upsert_inserts_with_identity_fields_winning() {
        let mut list = json!([]);
        let patch = json!({"name": "spoofed", "replicas_ready": 1});
        let e = ev(Some("default"), "api", patch.clone());
        assert_eq!(upsert_entry(&mut list, &e, patch.as_object()).unwrap(), ListEdit::Inserted);
        assert_eq!(list, json!([{"namespace": "default", "name": "api", "replicas_ready": 1}]));
    }

    #[test]
    fn merge_never_rewrites_identity() {
        let mut entry = json!({"namespace": "default", "name": "api", "replicas_desired": 3});
        let patch = json!({"name": "api-v2", "namespace": "prod", "status": "Healthy"});
        let changed = merge_fields(entry.as_object_mut().unwrap(), patch.as_object().unwrap());
        assert!(changed);
        assert_eq!(entry, json!({"namespace": "default", "name": "api", "replicas_desired": 3, "status": "Healthy"}));

        let identity_only = json!({"name": "other"});
        assert!(!merge_fields(entry.as_object_mut().unwrap(), identity_only.as_object().unwrap()));
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let mut list = json!([{"namespace": "default", "name": "web"}]);
        let e = ev(Some("default"), "api", json!({}));
        assert_eq!(remove_entry(&mut list, &e).unwrap(), 0);
        assert_eq!(list, json!([{"namespace": "default", "name": "web"}]));
    }

    #[test]
    fn non_array_lists_are_reported() {
        let mut bogus = json!({"items": []});
        let e = ev(Some("default"), "api", json!({}));
        assert_eq!(remove_entry(&mut bogus, &e), Err(NotAList("object")));
        assert_eq!(upsert_entry(&mut bogus, &e, None), Err(NotAList("object")));
    }
}
