//! Adapter-neutral view of ingress resources and the traits through which
//! the sync pipeline reads them and writes status back.

use async_trait::async_trait;
use futures::Stream;
use std::{collections::BTreeMap, fmt, pin::Pin};

use crate::{
    endpoint::BalancerError,
    status::{ServiceRecord, StatusEntry},
};

/// Annotation that selects which controller owns an ingress.
pub const INGRESS_CLASS_KEY: &str = "kubernetes.io/ingress.class";
/// The class value this controller accepts at bootstrap.
pub const INGRESS_CLASS: &str = "divvy";

/// What happened to an ingress, as reported by the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "ADDED",
            ChangeKind::Modified => "MODIFIED",
            ChangeKind::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathBackend {
    pub path: String,
    pub service_name: String,
    pub service_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRule {
    /// Empty when the rule matches any host.
    pub host: String,
    pub paths: Vec<PathBackend>,
}

/// Identifies an ingress for status write-back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IngressRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for IngressRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressResource {
    pub namespace: String,
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub rules: Vec<HostRule>,
}

impl IngressResource {
    pub fn reference(&self) -> IngressRef {
        IngressRef { namespace: self.namespace.clone(), name: self.name.clone() }
    }

    /// Returns `true` only when the ingress class annotation is exactly `divvy`.
    /// A missing annotation is rejected.
    pub fn has_divvy_class(&self) -> bool {
        self.annotations.get(INGRESS_CLASS_KEY).is_some_and(|class| class == INGRESS_CLASS)
    }
}

/// One event from a live watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressEvent {
    pub kind: ChangeKind,
    pub ingress: IngressResource,
}

pub type IngressEventStream =
    Pin<Box<dyn Stream<Item = Result<IngressEvent, BalancerError>> + Send>>;

/// Supplies ingress resources to the sync pipeline.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Every ingress currently known.
    async fn list(&self) -> Result<Vec<IngressResource>, BalancerError>;

    /// A live stream of ingress events. The stream ends only when the
    /// underlying transport fails or the source shuts down.
    async fn watch(&self) -> Result<IngressEventStream, BalancerError>;
}

/// Resolves the balancer's public addresses and writes them onto ingresses.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    /// Looks up the well-known service fronting the dispatcher.
    async fn resolve_service(&self) -> Result<ServiceRecord, BalancerError>;

    /// Replaces the load balancer status of `ingress` with `entries`.
    async fn publish(&self, ingress: &IngressRef, entries: &[StatusEntry])
        -> Result<(), BalancerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_annotations(pairs: &[(&str, &str)]) -> IngressResource {
        IngressResource {
            namespace: "default".into(),
            name: "web".into(),
            annotations: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            rules: vec![],
        }
    }

    #[test]
    fn test_class_divvy_accepted() {
        assert!(with_annotations(&[(INGRESS_CLASS_KEY, "divvy")]).has_divvy_class());
    }

    #[test]
    fn test_class_missing_rejected() {
        assert!(!with_annotations(&[]).has_divvy_class());
        assert!(!with_annotations(&[("other", "divvy")]).has_divvy_class());
    }

    #[test]
    fn test_class_mismatch_rejected() {
        assert!(!with_annotations(&[(INGRESS_CLASS_KEY, "nginx")]).has_divvy_class());
        assert!(!with_annotations(&[(INGRESS_CLASS_KEY, "")]).has_divvy_class());
        assert!(!with_annotations(&[(INGRESS_CLASS_KEY, "Divvy")]).has_divvy_class());
    }

    #[test]
    fn test_change_kind_labels() {
        assert_eq!(ChangeKind::Added.to_string(), "ADDED");
        assert_eq!(ChangeKind::Modified.as_str(), "MODIFIED");
        assert_eq!(ChangeKind::Deleted.as_str(), "DELETED");
    }

    #[test]
    fn test_reference_display() {
        assert_eq!(with_annotations(&[]).reference().to_string(), "default/web");
    }
}
