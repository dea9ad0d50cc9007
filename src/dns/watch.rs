//! Endpoint watch loop
//!
//! A long-lived, label-filtered subscription to service change events.
//! Before the first subscription (and on every resubscription) the
//! current listing is replayed as synthetic added events, so state that
//! predates the process or slipped through a reconnect gap is captured;
//! idempotent upserts downstream absorb the re-delivery. The loop never
//! terminates on a transient error, only on shutdown.

use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An ordered service-change notification
#[derive(Clone, Debug)]
pub enum EndpointEvent {
    /// Service appeared (or was replayed from a listing)
    Added(Service),
    /// Service changed, typically gaining or changing its address
    Modified(Service),
    /// Service was removed
    Deleted(Service),
}

impl EndpointEvent {
    /// The service this event describes
    pub fn service(&self) -> &Service {
        match self {
            Self::Added(s) | Self::Modified(s) | Self::Deleted(s) => s,
        }
    }
}

/// Watches platform-managed services and forwards ordered events
pub struct EndpointWatcher {
    client: Client,
    selector: String,
    watch_timeout: u32,
    reconnect_delay: Duration,
}

impl EndpointWatcher {
    /// Create a watcher over all platform-managed services.
    ///
    /// `watch_timeout` bounds each subscription in seconds; the server
    /// ends the stream cleanly when it elapses and the loop resubscribes.
    pub fn new(client: Client, watch_timeout: u32, reconnect_delay: Duration) -> Self {
        Self {
            client,
            selector: crate::MANAGED_SELECTOR.to_string(),
            watch_timeout,
            reconnect_delay,
        }
    }

    /// Run until shutdown, sending events in arrival order.
    ///
    /// Per-environment ordering holds because everything funnels through
    /// the single `events` channel in the order the cluster delivered it,
    /// across reconnects included.
    pub async fn run(&self, events: mpsc::Sender<EndpointEvent>, cancel: CancellationToken) {
        let api: Api<Service> = Api::all(self.client.clone());
        info!(selector = %self.selector, "endpoint watch loop started");

        'subscription: loop {
            if cancel.is_cancelled() {
                break;
            }

            // Replay the current listing as synthetic added events
            let listing = ListParams::default().labels(&self.selector);
            let services = match api.list(&listing).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "service listing failed, retrying");
                    if self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };
            let version = services.metadata.resource_version.clone().unwrap_or_default();
            for service in services.items {
                if events.send(EndpointEvent::Added(service)).await.is_err() {
                    break 'subscription;
                }
            }

            let params = WatchParams::default()
                .labels(&self.selector)
                .timeout(self.watch_timeout);
            let mut stream = match api.watch(&params, &version).await {
                Ok(stream) => stream.boxed(),
                Err(e) => {
                    warn!(error = %e, "watch subscription failed, retrying");
                    if self.pause(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break 'subscription,
                    item = stream.try_next() => item,
                };
                let event = match item {
                    Ok(Some(WatchEvent::Added(s))) => EndpointEvent::Added(s),
                    Ok(Some(WatchEvent::Modified(s))) => EndpointEvent::Modified(s),
                    Ok(Some(WatchEvent::Deleted(s))) => EndpointEvent::Deleted(s),
                    Ok(Some(WatchEvent::Bookmark(_))) => continue,
                    Ok(Some(WatchEvent::Error(e))) => {
                        warn!(code = e.code, message = %e.message, "watch stream error, resubscribing");
                        break;
                    }
                    Ok(None) => {
                        debug!("watch timed out, resubscribing");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "watch transport error, resubscribing");
                        break;
                    }
                };
                if events.send(event).await.is_err() {
                    break 'subscription;
                }
            }

            if self.pause(&cancel).await {
                break;
            }
        }

        info!("endpoint watch loop stopped");
    }

    /// Fixed back-off between subscriptions; true when shutdown arrived
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.reconnect_delay) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn named_service(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_event_exposes_its_service() {
        let events = [
            EndpointEvent::Added(named_service("a")),
            EndpointEvent::Modified(named_service("b")),
            EndpointEvent::Deleted(named_service("c")),
        ];
        let names: Vec<_> = events
            .iter()
            .map(|e| e.service().metadata.name.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
