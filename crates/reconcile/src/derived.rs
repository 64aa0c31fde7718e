//! Secondary invalidations for derived views ("pods of deployment X", ...).

use kdash_core::{CacheKey, ChangeEvent, ChangeVerb, ResourceKind};
use serde_json::Value;
use smallvec::SmallVec;

/// A set of derived cache keys to mark stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Derived {
    /// Exactly this key.
    Key(CacheKey),
    /// Every children view of `child` in `namespace` (or cluster-wide views).
    ChildViews { child: ResourceKind, namespace: Option<String> },
    /// Every children view whose parent is this resource.
    ParentViews { parent: ResourceKind, namespace: Option<String>, name: String },
    /// Every key scoped to a namespace.
    Namespace(String),
}

impl Derived {
    pub(crate) fn matches(&self, key: &CacheKey) -> bool {
        match (self, key) {
            (Derived::Key(k), key) => k == key,
            (Derived::ChildViews { child, namespace }, CacheKey::Children { child: c, namespace: ns, .. }) => {
                c == child && (ns.is_none() || ns == namespace)
            }
            (
                Derived::ParentViews { parent, namespace, name },
                CacheKey::Children { parent: p, namespace: ns, name: n, .. },
            ) => p == parent && ns == namespace && n == name,
            (Derived::Namespace(ns), key) => key.namespace() == Some(ns.as_str()),
            _ => false,
        }
    }
}

/// Derived views touched by `event`.
pub(crate) fn derived_for(event: &ChangeEvent) -> SmallVec<[Derived; 4]> {
    let mut out: SmallVec<[Derived; 4]> = SmallVec::new();
    let ns = event.ns();

    let owners = owners_of(event.data.as_ref());
    if owners.is_empty() {
        if event.kind == ResourceKind::Pod {
            out.push(Derived::ChildViews { child: ResourceKind::Pod, namespace: event.namespace.clone() });
        }
    } else {
        for (kind, name) in owners {
            let owner_ns = if kind.is_namespaced() { ns } else { None };
            out.push(Derived::Key(CacheKey::children(kind, owner_ns, &name, event.kind)));
        }
    }

    if event.kind == ResourceKind::Pod {
        if let Some(node) = node_of(event.data.as_ref()) {
            out.push(Derived::Key(CacheKey::children(ResourceKind::Node, None, node, ResourceKind::Pod)));
        }
    }

    out.push(Derived::ParentViews { parent: event.kind, namespace: event.namespace.clone(), name: event.name.clone() });

    if event.kind == ResourceKind::Namespace && event.verb == ChangeVerb::Deleted {
        out.push(Derived::Namespace(event.name.clone()));
    }
    out
}

/// Owners named by the payload: `owner_kind`/`owner_name`, or a Kubernetes-style
/// `owner_references` array. A ReplicaSet owner also yields its Deployment.
fn owners_of(data: Option<&Value>) -> SmallVec<[(ResourceKind, String); 2]> {
    let mut out: SmallVec<[(ResourceKind, String); 2]> = SmallVec::new();
    let Some(data) = data else { return out };
    let mut push = |kind: Option<&str>, name: Option<&str>| {
        if let (Some(kind), Some(name)) = (kind.and_then(|k| k.parse::<ResourceKind>().ok()), name) {
            if name.is_empty() {
                return;
            }
            if kind == ResourceKind::ReplicaSet {
                if let Some(deploy) = deployment_of_replicaset(name) {
                    out.push((ResourceKind::Deployment, deploy.to_string()));
                }
            }
            out.push((kind, name.to_string()));
        }
    };
    push(
        data.get("owner_kind").and_then(Value::as_str),
        data.get("owner_name").and_then(Value::as_str),
    );
    if let Some(refs) = data.get("owner_references").and_then(Value::as_array) {
        for r in refs {
            push(r.get("kind").and_then(Value::as_str), r.get("name").and_then(Value::as_str));
        }
    }
    out
}

fn node_of(data: Option<&Value>) -> Option<&str> {
    let data = data?;
    data.get("node_name")
        .or_else(|| data.get("node"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
}

/// `api-7d9f8b6c5` -> `api`: strip the pod-template-hash a Deployment appends
/// to its ReplicaSets.
pub(crate) fn deployment_of_replicaset(name: &str) -> Option<&str> {
    let (base, hash) = name.rsplit_once('-')?;
    let looks_like_hash = (5..=10).contains(&hash.len())
        && hash.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    (looks_like_hash && !base.is_empty()).then_some(base)
}
