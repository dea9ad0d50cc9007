//! Stale-record sweeper
//!
//! The watch stream can miss deletions (reconnect gaps), and a failed
//! provider delete can leave an external record behind after its map
//! entry is gone locally elsewhere. The sweeper is the correctness
//! backstop: on a fixed period it takes every record older than the
//! grace window, re-verifies its backing service with a direct point
//! lookup, and clears records whose service no longer exists.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::{DnsProvider, DnsSettings, RecordStore};
use crate::{Error, Result};

/// Trait abstracting service point lookups
///
/// Deliberately not the watch stream: the stream is exactly what may
/// have missed the deletion being checked for.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceLookup: Send + Sync {
    /// Whether the named service still exists
    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// Real service lookups backed by a kube [`Client`]
pub struct KubeServiceLookup {
    client: Client,
}

impl KubeServiceLookup {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceLookup for KubeServiceLookup {
    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await.map_err(Error::from) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Periodically clears DNS records whose backing service is gone
pub struct StaleRecordSweeper {
    store: RecordStore,
    provider: Arc<dyn DnsProvider>,
    lookup: Arc<dyn ServiceLookup>,
    settings: DnsSettings,
    period: Duration,
    grace: chrono::Duration,
}

impl StaleRecordSweeper {
    /// Create a sweeper over the synchronizer's record store.
    ///
    /// `grace` is the minimum record age before a record is eligible;
    /// it keeps the sweeper away from records whose backing service is
    /// still propagating.
    pub fn new(
        store: RecordStore,
        provider: Arc<dyn DnsProvider>,
        lookup: Arc<dyn ServiceLookup>,
        settings: DnsSettings,
        period: Duration,
        grace: chrono::Duration,
    ) -> Self {
        Self {
            store,
            provider,
            lookup,
            settings,
            period,
            grace,
        }
    }

    /// Sweep on the fixed period until shutdown.
    ///
    /// An in-flight sweep finishes before shutdown is honored, so no
    /// provider change is abandoned halfway.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(period_secs = self.period.as_secs(), "stale-record sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
            let removed = self.sweep_once().await;
            if removed > 0 {
                info!(removed, "stale dns records cleared");
            }
        }
        info!("stale-record sweeper stopped");
    }

    /// One sweep pass; returns how many records were cleared.
    ///
    /// Per-record failures are logged and skipped; the pass always
    /// completes.
    pub async fn sweep_once(&self) -> usize {
        let cutoff = Utc::now() - self.grace;
        let mut removed = 0;

        for record in self.store.snapshot().await {
            if record.created_at >= cutoff {
                continue;
            }
            let Some((namespace, name)) = record.service.split_once('/') else {
                warn!(
                    environment = %record.env_id,
                    service = %record.service,
                    "malformed service reference, skipping"
                );
                continue;
            };

            match self.lookup.service_exists(namespace, name).await {
                Ok(true) => {
                    debug!(environment = %record.env_id, "backing service still exists");
                }
                Ok(false) => {
                    if let Err(e) = self
                        .provider
                        .delete(
                            &record.hostname,
                            record.kind,
                            &record.target,
                            self.settings.record_ttl,
                        )
                        .await
                    {
                        // Keep the entry so the next pass retries
                        warn!(
                            environment = %record.env_id,
                            hostname = %record.hostname,
                            error = %e,
                            "stale record delete failed, keeping for next sweep"
                        );
                        continue;
                    }
                    self.store.remove(&record.env_id).await;
                    info!(
                        environment = %record.env_id,
                        hostname = %record.hostname,
                        "stale dns record removed"
                    );
                    removed += 1;
                }
                Err(e) => {
                    warn!(
                        environment = %record.env_id,
                        error = %e,
                        "service lookup failed, skipping"
                    );
                }
            }
        }

        removed
    }
}
