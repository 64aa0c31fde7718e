//! kdash core types: wire messages, decoded change events and cache keys.
//!
//! Everything here is plain data shared by the stream client, the cache and the
//! reconciler. Nothing in this crate performs I/O.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Liveness ping sent by the client while connected.
pub const HEARTBEAT_PING: &str = "ping";
/// Liveness acknowledgment sent by the server; never forwarded to listeners.
pub const HEARTBEAT_PONG: &str = "pong";

/// Inbound message as it appears on the wire (server -> client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Event type, e.g. `deployment_modified` or `pod_added`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub resource_type: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    /// Kind-specific partial fields. Left untyped here; the reconciler validates shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Known resource kinds. Adding a kind forces every exhaustive match over it
/// (notably the reconciliation rule table) to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Namespace,
    Node,
    Pod,
    Deployment,
    ReplicaSet,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    Service,
    Ingress,
    ConfigMap,
    Secret,
    PersistentVolumeClaim,
    ServiceAccount,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    NetworkPolicy,
    Event,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 21] = [
        ResourceKind::Namespace,
        ResourceKind::Node,
        ResourceKind::Pod,
        ResourceKind::Deployment,
        ResourceKind::ReplicaSet,
        ResourceKind::StatefulSet,
        ResourceKind::DaemonSet,
        ResourceKind::Job,
        ResourceKind::CronJob,
        ResourceKind::Service,
        ResourceKind::Ingress,
        ResourceKind::ConfigMap,
        ResourceKind::Secret,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::ServiceAccount,
        ResourceKind::Role,
        ResourceKind::RoleBinding,
        ResourceKind::ClusterRole,
        ResourceKind::ClusterRoleBinding,
        ResourceKind::NetworkPolicy,
        ResourceKind::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Node => "Node",
            ResourceKind::Pod => "Pod",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::ReplicaSet => "ReplicaSet",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Job => "Job",
            ResourceKind::CronJob => "CronJob",
            ResourceKind::Service => "Service",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::NetworkPolicy => "NetworkPolicy",
            ResourceKind::Event => "Event",
        }
    }

    /// Whether instances of this kind live inside a namespace.
    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            ResourceKind::Namespace
                | ResourceKind::Node
                | ResourceKind::ClusterRole
                | ResourceKind::ClusterRoleBinding
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = DecodeError;

    /// Case-insensitive; `deployment`, `Deployment` and `DEPLOYMENT` all parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DecodeError::UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeVerb {
    Added,
    Modified,
    Deleted,
}

impl ChangeVerb {
    /// Parse the verb from the suffix of a wire `type`, e.g. `pod_added`.
    pub fn from_event_type(event_type: &str) -> Result<Self, DecodeError> {
        let suffix = event_type.rsplit('_').next().unwrap_or(event_type);
        match suffix.to_ascii_lowercase().as_str() {
            "added" | "created" => Ok(ChangeVerb::Added),
            "modified" | "updated" => Ok(ChangeVerb::Modified),
            "deleted" | "removed" => Ok(ChangeVerb::Deleted),
            _ => Err(DecodeError::UnknownVerb(event_type.to_string())),
        }
    }
}

impl fmt::Display for ChangeVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeVerb::Added => "added",
            ChangeVerb::Modified => "modified",
            ChangeVerb::Deleted => "deleted",
        })
    }
}

/// A decoded notification that one resource instance changed on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ResourceKind,
    pub verb: ChangeVerb,
    /// `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
    pub data: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn ns(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl TryFrom<&WireMessage> for ChangeEvent {
    type Error = DecodeError;

    fn try_from(msg: &WireMessage) -> Result<Self, Self::Error> {
        let kind: ResourceKind = msg.resource_type.parse()?;
        let verb = ChangeVerb::from_event_type(&msg.event_type)?;
        if msg.name.trim().is_empty() {
            return Err(DecodeError::MissingName);
        }
        let namespace = if kind.is_namespaced() {
            match msg.namespace.as_deref().map(str::trim) {
                Some(ns) if !ns.is_empty() => Some(ns.to_string()),
                _ => return Err(DecodeError::MissingNamespace(kind)),
            }
        } else {
            None
        };
        Ok(ChangeEvent { kind, verb, namespace, name: msg.name.clone(), data: msg.data.clone() })
    }
}

/// Errors turning a wire message into a [`ChangeEvent`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),
    #[error("unknown change verb in event type: {0}")]
    UnknownVerb(String),
    #[error("message has an empty resource name")]
    MissingName,
    #[error("namespaced kind {0} arrived without a namespace")]
    MissingNamespace(ResourceKind),
}

/// Connection phase of an event-stream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
    /// Terminal: explicitly disposed or out of reconnect attempts.
    Disposed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disposed => "disposed",
        })
    }
}

/// Key shape of the read cache the UI observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheKey {
    /// All instances of a kind; `namespace: None` means across all namespaces.
    List { kind: ResourceKind, namespace: Option<String> },
    /// A single instance.
    Detail { kind: ResourceKind, namespace: Option<String>, name: String },
    /// Derived projection: `child` resources owned by (or scheduled on) `parent`.
    Children { parent: ResourceKind, namespace: Option<String>, name: String, child: ResourceKind },
}

impl CacheKey {
    pub fn list(kind: ResourceKind, namespace: Option<&str>) -> Self {
        CacheKey::List { kind, namespace: namespace.map(str::to_string) }
    }

    pub fn detail(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        CacheKey::Detail { kind, namespace: namespace.map(str::to_string), name: name.to_string() }
    }

    pub fn children(parent: ResourceKind, namespace: Option<&str>, name: &str, child: ResourceKind) -> Self {
        CacheKey::Children {
            parent,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            child,
        }
    }

    /// The kind of the entries stored under this key.
    pub fn kind(&self) -> ResourceKind {
        match self {
            CacheKey::List { kind, .. } | CacheKey::Detail { kind, .. } => *kind,
            CacheKey::Children { child, .. } => *child,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            CacheKey::List { namespace, .. }
            | CacheKey::Detail { namespace, .. }
            | CacheKey::Children { namespace, .. } => namespace.as_deref(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = |n: &Option<String>| n.clone().unwrap_or_else(|| "*".to_string());
        match self {
            CacheKey::List { kind, namespace } => write!(f, "list/{}/{}", kind, ns(namespace)),
            CacheKey::Detail { kind, namespace, name } => write!(f, "detail/{}/{}/{}", kind, ns(namespace), name),
            CacheKey::Children { parent, namespace, name, child } => {
                write!(f, "children/{}/{}/{}/{}", parent, ns(namespace), name, child)
            }
        }
    }
}

pub mod prelude {
    pub use super::{CacheKey, ChangeEvent, ChangeVerb, ConnectionStatus, DecodeError, ResourceKind, WireMessage};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(t: &str, kind: &str, ns: Option<&str>, name: &str) -> WireMessage {
        WireMessage {
            event_type: t.to_string(),
            resource_type: kind.to_string(),
            namespace: ns.map(|s| s.to_string()),
            name: name.to_string(),
            data: None,
        }
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("deployment".parse::<ResourceKind>().unwrap(), ResourceKind::Deployment);
        assert_eq!("NetworkPolicy".parse::<ResourceKind>().unwrap(), ResourceKind::NetworkPolicy);
        assert!(matches!("Gadget".parse::<ResourceKind>(), Err(DecodeError::UnknownKind(_))));
    }

    #[test]
    fn every_kind_round_trips_through_its_label() {
        for k in ResourceKind::ALL {
            assert_eq!(k.as_str().parse::<ResourceKind>().unwrap(), k);
        }
    }

    #[test]
    fn verb_comes_from_type_suffix() {
        assert_eq!(ChangeVerb::from_event_type("deployment_added").unwrap(), ChangeVerb::Added);
        assert_eq!(ChangeVerb::from_event_type("persistent_volume_claim_updated").unwrap(), ChangeVerb::Modified);
        assert_eq!(ChangeVerb::from_event_type("deleted").unwrap(), ChangeVerb::Deleted);
        assert!(ChangeVerb::from_event_type("pod_exploded").is_err());
    }

    #[test]
    fn wire_message_parses_with_null_namespace_and_no_data() {
        let raw = r#"{"type":"node_modified","resource_type":"Node","namespace":null,"name":"worker-1"}"#;
        let msg: WireMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.namespace, None);
        assert!(msg.data.is_none());
        let ev = ChangeEvent::try_from(&msg).unwrap();
        assert_eq!(ev.kind, ResourceKind::Node);
        assert_eq!(ev.verb, ChangeVerb::Modified);
    }

    #[test]
    fn cluster_scoped_events_drop_namespace() {
        let ev = ChangeEvent::try_from(&wire("node_added", "Node", Some("default"), "n1")).unwrap();
        assert_eq!(ev.namespace, None);
    }

    #[test]
    fn namespaced_kinds_require_a_namespace() {
        let err = ChangeEvent::try_from(&wire("pod_added", "Pod", Some(""), "p")).unwrap_err();
        assert_eq!(err, DecodeError::MissingNamespace(ResourceKind::Pod));
        let err = ChangeEvent::try_from(&wire("deployment_modified", "Deployment", None, "api")).unwrap_err();
        assert_eq!(err, DecodeError::MissingNamespace(ResourceKind::Deployment));
        let ev = ChangeEvent::try_from(&wire("pod_added", "Pod", Some("default"), "p")).unwrap();
        assert_eq!(ev.ns(), Some("default"));
    }

    #[test]
    fn decode_rejects_empty_name() {
        let err = ChangeEvent::try_from(&wire("pod_added", "Pod", Some("default"), " ")).unwrap_err();
        assert_eq!(err, DecodeError::MissingName);
    }

    #[test]
    fn cache_key_accessors() {
        let k = CacheKey::children(ResourceKind::Deployment, Some("default"), "api", ResourceKind::Pod);
        assert_eq!(k.kind(), ResourceKind::Pod);
        assert_eq!(k.namespace(), Some("default"));
        assert_eq!(k.to_string(), "children/Deployment/default/api/Pod");
        assert_eq!(CacheKey::list(ResourceKind::Node, None).to_string(), "list/Node/*");
    }

    #[test]
    fn status_labels_are_lowercase() {
        assert_eq!(ConnectionStatus::Connected.to_string(), "connected");
        assert_eq!(ConnectionStatus::Error.to_string(), "error");
    }
}
