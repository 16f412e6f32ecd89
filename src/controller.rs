//! The sync pipeline: turns observed ingress resources into worker
//! registrations.
//!
//! Two producers feed one channel. The bootstrap producer lists existing
//! ingresses once and keeps only those of class `divvy`. The watch producer
//! forwards every live event, whatever its class. A single consumer drains
//! the channel in order, registers workers for ADDED changes through the
//! registration API and, when enabled, writes the balancer's address back
//! onto the originating ingress.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    endpoint::{BalancerError, Worker},
    ingress::{ChangeKind, ChangeSource, IngressResource, StatusPublisher},
    metrics::{REGISTRATIONS_FAILED, STATUS_UPDATES_FAILED, SYNC_CHANGES_TOTAL},
    registration::RegistrationClient,
    status::endpoints_to_status,
};

/// Producers wait for the consumer once this many changes are queued.
pub const CHANGE_CHANNEL_CAPACITY: usize = 1;

/// One (host, path) translation of an observed ingress.
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub worker: Worker,
    /// The ingress this change came from, for status write-back.
    pub origin: Arc<IngressResource>,
}

/// How far a single change made it through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not an ADDED change; nothing to do.
    Ignored,
    RegistrationFailed,
    Registered,
    StatusPublished,
}

/// Emits one change of `kind` per (rule host, path) pair of `ingress`.
pub fn changes_for(kind: ChangeKind, ingress: IngressResource) -> Vec<Change> {
    let origin = Arc::new(ingress);
    let mut changes = Vec::new();
    for rule in &origin.rules {
        for backend in &rule.paths {
            changes.push(Change {
                kind,
                worker: Worker::new(&rule.host, &backend.service_name, backend.service_port),
                origin: Arc::clone(&origin),
            });
        }
    }
    changes
}

/// Translates a bootstrap listing into ADDED changes, skipping every
/// ingress that is not of class `divvy`.
pub fn bootstrap_changes(resources: Vec<IngressResource>) -> Vec<Change> {
    resources
        .into_iter()
        .filter(|ingress| {
            let accepted = ingress.has_divvy_class();
            if !accepted {
                debug!(ingress = %ingress.reference(), "Skipping ingress of another class");
            }
            accepted
        })
        .flat_map(|ingress| changes_for(ChangeKind::Added, ingress))
        .collect()
}

pub struct Controller {
    source: Arc<dyn ChangeSource>,
    registrar: RegistrationClient,
    publisher: Option<Arc<dyn StatusPublisher>>,
}

impl Controller {
    pub fn new(source: Arc<dyn ChangeSource>, registrar: RegistrationClient) -> Self {
        Self { source, registrar, publisher: None }
    }

    /// Enables status write-back after each successful registration.
    pub fn with_status_publisher(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Runs both producers and the consumer until the producers are done
    /// and the channel is drained, or until shutdown is signalled.
    pub async fn run(self: Arc<Self>, shutdown_rx: watch::Receiver<()>) {
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);

        let producers = [
            tokio::spawn(bootstrap(self.source.clone(), tx.clone(), shutdown_rx.clone())),
            tokio::spawn(watch_changes(self.source.clone(), tx, shutdown_rx.clone())),
        ];

        self.sync_state(rx, shutdown_rx).await;

        for producer in producers {
            if let Err(e) = producer.await {
                error!(error = %e, "Change producer panicked");
            }
        }
        info!("Sync pipeline stopped");
    }

    async fn sync_state(&self, mut rx: mpsc::Receiver<Change>, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            let change = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("Sync consumer received shutdown signal, exiting.");
                    return;
                }
                change = rx.recv() => change,
            };
            match change {
                Some(change) => {
                    self.apply(change).await;
                }
                None => {
                    info!("All change producers finished");
                    return;
                }
            }
        }
    }

    /// Applies a single change. Only ADDED changes touch the registry;
    /// MODIFIED and DELETED are observed and dropped.
    pub async fn apply(&self, change: Change) -> SyncState {
        SYNC_CHANGES_TOTAL.with_label_values(&[change.kind.as_str()]).inc();

        if change.kind != ChangeKind::Added {
            debug!(
                kind = %change.kind,
                worker = %change.worker,
                ingress = %change.origin.reference(),
                "Change has no registry action"
            );
            return SyncState::Ignored;
        }

        match self.registrar.register(&change.worker).await {
            Ok(body) => {
                info!(worker = %change.worker, response = %body.trim(), "Registered worker");
            }
            Err(e) => {
                REGISTRATIONS_FAILED.inc();
                error!(worker = %change.worker, error = %e, "Failed to register worker");
                return SyncState::RegistrationFailed;
            }
        }

        let Some(publisher) = &self.publisher else {
            return SyncState::Registered;
        };
        match publish_status(publisher.as_ref(), &change.origin).await {
            Ok(()) => SyncState::StatusPublished,
            Err(e) => {
                STATUS_UPDATES_FAILED.inc();
                warn!(ingress = %change.origin.reference(), error = %e, "Failed to publish ingress status");
                SyncState::Registered
            }
        }
    }
}

async fn publish_status(
    publisher: &dyn StatusPublisher,
    ingress: &IngressResource,
) -> Result<(), BalancerError> {
    let record = publisher.resolve_service().await?;
    let entries = endpoints_to_status(&record.addresses());
    publisher.publish(&ingress.reference(), &entries).await?;
    info!(ingress = %ingress.reference(), entries = entries.len(), "Published ingress status");
    Ok(())
}

/// Sends `change` unless shutdown comes first. Returns `false` when the
/// producer should stop.
async fn send(
    tx: &mpsc::Sender<Change>,
    change: Change,
    shutdown_rx: &mut watch::Receiver<()>,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown_rx.changed() => false,
        res = tx.send(change) => res.is_ok(),
    }
}

async fn bootstrap(
    source: Arc<dyn ChangeSource>,
    tx: mpsc::Sender<Change>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let listed = tokio::select! {
        biased;
        _ = shutdown_rx.changed() => return,
        listed = source.list() => listed,
    };
    let resources = match listed {
        Ok(resources) => resources,
        Err(e) => {
            error!(error = %e, "Failed to list ingresses");
            return;
        }
    };

    let changes = bootstrap_changes(resources);
    info!(changes = changes.len(), "Bootstrapping existing ingresses");
    for change in changes {
        if !send(&tx, change, &mut shutdown_rx).await {
            return;
        }
    }
}

async fn watch_changes(
    source: Arc<dyn ChangeSource>,
    tx: mpsc::Sender<Change>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let subscribed = tokio::select! {
        biased;
        _ = shutdown_rx.changed() => return,
        subscribed = source.watch() => subscribed,
    };
    let mut events = match subscribed {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "Failed to watch ingresses");
            return;
        }
    };

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                debug!(kind = %event.kind, ingress = %event.ingress.reference(), "Observed ingress event");
                for change in changes_for(event.kind, event.ingress) {
                    if !send(&tx, change, &mut shutdown_rx).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "Ingress watch failed");
                return;
            }
            None => {
                warn!("Ingress watch stream ended");
                return;
            }
        }
    }
}
