//! Kubernetes adapter for the sync pipeline: lists and watches
//! `networking.k8s.io/v1` Ingresses and writes load balancer status back.

use async_trait::async_trait;
use futures::{stream::BoxStream, Stream, StreamExt};
use k8s_openapi::api::{
    core::v1::Service,
    networking::v1::{HTTPIngressPath, Ingress},
};
use kube::{
    api::{ListParams, Patch, PatchParams, WatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config, ResourceExt,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::KubernetesConfig,
    endpoint::BalancerError,
    ingress::{
        ChangeKind, ChangeSource, HostRule, IngressEvent, IngressEventStream, IngressRef,
        IngressResource, PathBackend, StatusPublisher,
    },
    status::{IngressPoint, ServiceRecord, StatusEntry},
};

const WATCH_BUFFER: usize = 16;

type RawWatchStream = BoxStream<'static, kube::Result<WatchEvent<Ingress>>>;
type EventSender = mpsc::Sender<Result<IngressEvent, BalancerError>>;

/// Builds a client from an explicit kubeconfig, or infers one from the
/// environment (in-cluster service account or the default kubeconfig).
pub async fn connect(cfg: &KubernetesConfig) -> Result<Client, BalancerError> {
    let kube_config = match &cfg.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                BalancerError::ConfigError(format!("Failed to read kubeconfig from {}: {}", path, e))
            })?;
            let options = KubeConfigOptions { context: cfg.context.clone(), cluster: None, user: None };
            Config::from_custom_kubeconfig(kubeconfig, &options).await.map_err(|e| {
                BalancerError::ConfigError(format!("Failed to create Kubernetes config: {}", e))
            })?
        }
        None => Config::infer().await.map_err(|e| {
            BalancerError::ConfigError(format!("Failed to infer Kubernetes config: {}", e))
        })?,
    };
    Client::try_from(kube_config).map_err(|e| {
        BalancerError::ConfigError(format!("Failed to create Kubernetes client: {}", e))
    })
}

#[derive(Clone)]
pub struct KubeIngressSource {
    client: Client,
    namespace: Option<String>,
    service_name: String,
    service_namespace: String,
}

impl KubeIngressSource {
    /// `namespace` of `None` watches every namespace.
    pub fn new(
        client: Client,
        namespace: Option<String>,
        service_name: impl Into<String>,
        service_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace,
            service_name: service_name.into(),
            service_namespace: service_namespace.into(),
        }
    }

    fn ingresses(&self) -> Api<Ingress> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl ChangeSource for KubeIngressSource {
    async fn list(&self) -> Result<Vec<IngressResource>, BalancerError> {
        let list = self
            .ingresses()
            .list(&ListParams::default())
            .await
            .map_err(|e| BalancerError::SourceError(format!("Failed to list ingresses: {}", e)))?;
        debug!(count = list.items.len(), "Listed ingresses");
        Ok(list.items.iter().map(ingress_from_k8s).collect())
    }

    /// Opens the watch and keeps it alive across server-side closes by
    /// resuming from the last seen resource version. A transport error or
    /// an error event is delivered as the stream's last item.
    async fn watch(&self) -> Result<IngressEventStream, BalancerError> {
        let api = self.ingresses();
        let stream = open_watch(&api, "").await?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(pump_watch(api, stream, tx));
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

async fn open_watch(api: &Api<Ingress>, version: &str) -> Result<RawWatchStream, BalancerError> {
    let stream = api
        .watch(&WatchParams::default(), version)
        .await
        .map_err(|e| BalancerError::SourceError(format!("Failed to watch ingresses: {}", e)))?;
    Ok(stream.boxed())
}

/// How one watch connection ended.
#[derive(Debug, PartialEq, Eq)]
enum WatchEnd {
    /// The server closed the stream cleanly; resume from the last version.
    Closed,
    /// An error was delivered downstream, or the receiver went away.
    Stopped,
}

/// Relays one watch connection to `tx`, tracking the last resource version
/// seen on objects and bookmarks in `version`.
async fn relay_events<S>(mut stream: S, version: &mut String, tx: &EventSender) -> WatchEnd
where
    S: Stream<Item = kube::Result<WatchEvent<Ingress>>> + Unpin,
{
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = tx.closed() => return WatchEnd::Stopped,
        };
        let (kind, ingress) = match item {
            None => return WatchEnd::Closed,
            Some(Ok(WatchEvent::Added(ingress))) => (ChangeKind::Added, ingress),
            Some(Ok(WatchEvent::Modified(ingress))) => (ChangeKind::Modified, ingress),
            Some(Ok(WatchEvent::Deleted(ingress))) => (ChangeKind::Deleted, ingress),
            Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                *version = bookmark.metadata.resource_version;
                continue;
            }
            Some(Ok(WatchEvent::Error(e))) => {
                let _ = tx
                    .send(Err(BalancerError::SourceError(format!(
                        "watch error {}: {}",
                        e.code, e.message
                    ))))
                    .await;
                return WatchEnd::Stopped;
            }
            Some(Err(e)) => {
                let _ = tx.send(Err(BalancerError::SourceError(e.to_string()))).await;
                return WatchEnd::Stopped;
            }
        };
        if let Some(v) = ingress.resource_version() {
            *version = v;
        }
        if tx.send(Ok(IngressEvent { kind, ingress: ingress_from_k8s(&ingress) })).await.is_err() {
            return WatchEnd::Stopped;
        }
    }
}

async fn pump_watch(api: Api<Ingress>, mut stream: RawWatchStream, tx: EventSender) {
    let mut version = String::new();
    while relay_events(&mut stream, &mut version, &tx).await == WatchEnd::Closed {
        debug!(resource_version = %version, "Ingress watch closed by server, resuming");
        stream = match open_watch(&api, &version).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
    }
}

#[async_trait]
impl StatusPublisher for KubeIngressSource {
    async fn resolve_service(&self) -> Result<ServiceRecord, BalancerError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.service_namespace);
        let service = api.get(&self.service_name).await.map_err(|e| {
            BalancerError::StatusUpdateError(format!(
                "Failed to get service {}/{}: {}",
                self.service_namespace, self.service_name, e
            ))
        })?;
        Ok(service_record(&service))
    }

    async fn publish(
        &self,
        ingress: &IngressRef,
        entries: &[StatusEntry],
    ) -> Result<(), BalancerError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &ingress.namespace);
        let patch = json!({ "status": { "loadBalancer": { "ingress": entries } } });
        api.patch_status(&ingress.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                BalancerError::StatusUpdateError(format!(
                    "Failed to update status of {}: {}",
                    ingress, e
                ))
            })?;
        info!(ingress = %ingress, entries = entries.len(), "Updated ingress status");
        Ok(())
    }
}

/// Reads how the service exposes the dispatcher.
pub fn service_record(service: &Service) -> ServiceRecord {
    if let Some(spec) = &service.spec {
        if spec.type_.as_deref() == Some("ExternalName") {
            return ServiceRecord::ExternalName(spec.external_name.clone().unwrap_or_default());
        }
    }
    let points = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .map(|point| IngressPoint { ip: point.ip.clone(), hostname: point.hostname.clone() })
                .collect()
        })
        .unwrap_or_default();
    ServiceRecord::LoadBalancer(points)
}

/// Converts an Ingress to the pipeline's view. Backends that are not a
/// service with a numeric port are skipped; a rule without a host keeps an
/// empty host.
pub fn ingress_from_k8s(ingress: &Ingress) -> IngressResource {
    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();
    let rules = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_ref())
        .map(|rules| {
            rules
                .iter()
                .map(|rule| HostRule {
                    host: rule.host.clone().unwrap_or_default(),
                    paths: rule
                        .http
                        .as_ref()
                        .map(|http| {
                            http.paths
                                .iter()
                                .filter_map(|path| path_backend(&namespace, &name, path))
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    IngressResource { annotations: ingress.annotations().clone(), namespace, name, rules }
}

fn path_backend(namespace: &str, name: &str, path: &HTTPIngressPath) -> Option<PathBackend> {
    let Some(service) = path.backend.service.as_ref() else {
        warn!(ingress = %format!("{}/{}", namespace, name), "Skipping non-service backend");
        return None;
    };
    let number = service.port.as_ref().and_then(|port| port.number);
    let Some(port) = number.and_then(|n| u16::try_from(n).ok()) else {
        warn!(
            ingress = %format!("{}/{}", namespace, name),
            service = %service.name,
            "Skipping backend without a numeric service port"
        );
        return None;
    };
    Some(PathBackend {
        path: path.path.clone().unwrap_or_default(),
        service_name: service.name.clone(),
        service_port: port,
    })
}
