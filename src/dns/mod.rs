//! DNS reconciliation for environment services
//!
//! The [`watch`] loop turns cluster service events into an ordered stream
//! of [`EndpointEvent`]s; the [`DnsSynchronizer`] consumes them and keeps
//! Route53 converged with the services' external addresses; the [`sweep`]
//! task clears records whose backing service disappeared while the watch
//! stream was down.
//!
//! The synchronizer owns the managed-record state in a [`RecordStore`].
//! The store is shared with the sweeper only, and every read-modify-write
//! against it happens under a single mutex guard.

pub mod route53;
pub mod sweep;
pub mod watch;

pub use route53::Route53Provider;
pub use sweep::{KubeServiceLookup, ServiceLookup, StaleRecordSweeper};
pub use watch::{EndpointEvent, EndpointWatcher};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::EnvironmentId;
use crate::retry::{with_backoff, Backoff};
use crate::Result;

/// Kind of a managed DNS record
///
/// Chosen by inspecting the target: provider-assigned load balancer
/// hostnames become aliases, raw network addresses become address
/// records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    /// Alias to a provider-assigned hostname (CNAME)
    Alias,
    /// Raw network address (A)
    Address,
}

impl RecordKind {
    /// Classify a target address
    pub fn classify(target: &str) -> Self {
        if target.ends_with(crate::ELB_ALIAS_SUFFIX) {
            Self::Alias
        } else {
            Self::Address
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alias => write!(f, "alias"),
            Self::Address => write!(f, "address"),
        }
    }
}

/// One externally visible DNS record managed by this process
#[derive(Clone, Debug, PartialEq)]
pub struct ManagedDnsRecord {
    /// Full environment identifier from the service's labels
    pub env_id: String,
    /// Fully qualified record name
    pub hostname: String,
    /// Current target address
    pub target: String,
    /// Record kind derived from the target
    pub kind: RecordKind,
    /// Backing service as `namespace/name`
    pub service: String,
    /// When the record was first created
    pub created_at: DateTime<Utc>,
    /// Last time an upsert touched the record
    pub last_updated: DateTime<Utc>,
}

/// Mutex-serialized map of environment id to managed record
///
/// Owned by the synchronizer and shared with the sweeper. All access goes
/// through these methods; each one is a single critical section.
#[derive(Clone, Default)]
pub struct RecordStore {
    inner: Arc<Mutex<HashMap<String, ManagedDnsRecord>>>,
}

impl RecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the record for an environment
    pub async fn get(&self, env_id: &str) -> Option<ManagedDnsRecord> {
        self.inner.lock().await.get(env_id).cloned()
    }

    /// Insert or overwrite a record, preserving the original creation
    /// time across overwrites
    pub async fn upsert(&self, mut record: ManagedDnsRecord) {
        let mut map = self.inner.lock().await;
        if let Some(existing) = map.get(&record.env_id) {
            record.created_at = existing.created_at;
        }
        map.insert(record.env_id.clone(), record);
    }

    /// Remove and return the record for an environment
    pub async fn remove(&self, env_id: &str) -> Option<ManagedDnsRecord> {
        self.inner.lock().await.remove(env_id)
    }

    /// All current records, for the sweeper's pass
    pub async fn snapshot(&self) -> Vec<ManagedDnsRecord> {
        self.inner.lock().await.values().cloned().collect()
    }

    /// Number of managed records
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// True when no records are managed
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Trait abstracting the external DNS provider
///
/// Both operations are change-batch submissions against a hosted zone;
/// the provider accepts and propagates asynchronously. Upsert is
/// create-or-update, so re-delivered events are harmless.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create or update a record
    async fn upsert(&self, hostname: &str, kind: RecordKind, target: &str, ttl: i64)
        -> Result<()>;

    /// Delete a record
    async fn delete(&self, hostname: &str, kind: RecordKind, target: &str, ttl: i64)
        -> Result<()>;
}

/// Settings for DNS record management
#[derive(Clone, Debug)]
pub struct DnsSettings {
    /// Domain under which environment hostnames are created
    pub domain_suffix: String,
    /// Fixed time-to-live for every managed record, in seconds
    pub record_ttl: i64,
}

/// Converges endpoint notifications into external DNS records
pub struct DnsSynchronizer {
    provider: Arc<dyn DnsProvider>,
    store: RecordStore,
    settings: DnsSettings,
    backoff: Backoff,
}

impl DnsSynchronizer {
    /// Create a synchronizer writing through the given provider
    pub fn new(provider: Arc<dyn DnsProvider>, store: RecordStore, settings: DnsSettings) -> Self {
        Self {
            provider,
            store,
            settings,
            backoff: Backoff::attempts(3),
        }
    }

    /// Consume endpoint events until shutdown.
    ///
    /// Events are handled strictly in arrival order; the in-flight event
    /// finishes before a shutdown request is honored.
    pub async fn run(&self, mut events: mpsc::Receiver<EndpointEvent>, cancel: CancellationToken) {
        info!("dns synchronizer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        info!("dns synchronizer stopped");
    }

    /// Apply one endpoint notification.
    ///
    /// Failures are logged and never propagate: the event loop moves on
    /// to the next notification regardless.
    pub async fn handle_event(&self, event: EndpointEvent) {
        match event {
            EndpointEvent::Added(service) | EndpointEvent::Modified(service) => {
                if let Err(e) = self.converge_record(&service).await {
                    error!(
                        service = %service_key(&service),
                        stage = "upsert",
                        error = %e,
                        "failed to converge dns record"
                    );
                }
            }
            EndpointEvent::Deleted(service) => {
                if let Err(e) = self.remove_record(&service).await {
                    error!(
                        service = %service_key(&service),
                        stage = "delete",
                        error = %e,
                        "failed to remove dns record"
                    );
                }
            }
        }
    }

    async fn converge_record(&self, service: &Service) -> Result<()> {
        let Some(env_id) = environment_id(service) else {
            warn!(
                service = %service_key(service),
                "service has no environment-id label, skipping"
            );
            return Ok(());
        };
        let Some(target) = external_address(service) else {
            // Address assignment is asynchronous; a later modified event
            // will carry it.
            debug!(
                service = %service_key(service),
                "no external address assigned yet"
            );
            return Ok(());
        };

        let hostname = EnvironmentId::new(env_id).hostname(&self.settings.domain_suffix);
        let kind = RecordKind::classify(&target);

        with_backoff(&self.backoff, "dns upsert", || {
            self.provider
                .upsert(&hostname, kind, &target, self.settings.record_ttl)
        })
        .await?;

        let now = Utc::now();
        self.store
            .upsert(ManagedDnsRecord {
                env_id: env_id.to_string(),
                hostname: hostname.clone(),
                target: target.clone(),
                kind,
                service: service_key(service),
                created_at: now,
                last_updated: now,
            })
            .await;

        info!(
            environment = env_id,
            hostname = %hostname,
            target = %target,
            kind = %kind,
            "dns record converged"
        );
        Ok(())
    }

    async fn remove_record(&self, service: &Service) -> Result<()> {
        let Some(env_id) = environment_id(service) else {
            return Ok(());
        };
        let Some(record) = self.store.get(env_id).await else {
            debug!(environment = env_id, "no managed record, nothing to remove");
            return Ok(());
        };

        // Delete with the recorded target and kind: the service's own
        // status may already be gone by the time this event arrives.
        let result = with_backoff(&self.backoff, "dns delete", || {
            self.provider.delete(
                &record.hostname,
                record.kind,
                &record.target,
                self.settings.record_ttl,
            )
        })
        .await;

        if let Err(e) = result {
            // The entry is dropped either way; a leaked provider record is
            // cleared by the sweeper after the grace window.
            warn!(
                environment = env_id,
                hostname = %record.hostname,
                error = %e,
                "provider delete failed, accepting bounded drift"
            );
        }

        self.store.remove(env_id).await;
        info!(environment = env_id, hostname = %record.hostname, "dns record removed");
        Ok(())
    }
}

/// Full environment identifier from a service's labels
pub fn environment_id(service: &Service) -> Option<&str> {
    service
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(crate::LABEL_ENVIRONMENT_ID))
        .map(String::as_str)
}

/// The externally routable address from a service's load-balancer status
fn external_address(service: &Service) -> Option<String> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    ingress.hostname.clone().or_else(|| ingress.ip.clone())
}

/// `namespace/name` key for logging and for sweeper point lookups
fn service_key(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::predicate::eq;
    use mockall::Sequence;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    const ENV_ID: &str = "abc12345-6789-0000-1111-222233334444";
    const DOMAIN: &str = "dev-platform.company.com";
    const HOSTNAME: &str = "abc12345.dev-platform.company.com";

    fn make_service(env_id: Option<&str>, address: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("dev-env-abc12345-svc".to_string()),
                namespace: Some("dev-env-abc12345".to_string()),
                labels: env_id.map(|id| {
                    BTreeMap::from([(crate::LABEL_ENVIRONMENT_ID.to_string(), id.to_string())])
                }),
                ..Default::default()
            },
            status: address.map(|addr| {
                let is_hostname = addr.chars().any(|c| c.is_ascii_alphabetic());
                ServiceStatus {
                    load_balancer: Some(LoadBalancerStatus {
                        ingress: Some(vec![LoadBalancerIngress {
                            hostname: is_hostname.then(|| addr.to_string()),
                            ip: (!is_hostname).then(|| addr.to_string()),
                            ..Default::default()
                        }]),
                    }),
                    ..Default::default()
                }
            }),
            ..Default::default()
        }
    }

    fn synchronizer(provider: MockDnsProvider, store: RecordStore) -> DnsSynchronizer {
        DnsSynchronizer::new(
            Arc::new(provider),
            store,
            DnsSettings {
                domain_suffix: DOMAIN.to_string(),
                record_ttl: 300,
            },
        )
    }

    // =========================================================================
    // Record Kind Classification
    // =========================================================================

    #[test]
    fn test_elb_hostnames_classify_as_alias() {
        assert_eq!(
            RecordKind::classify("a1b2.elb.amazonaws.com"),
            RecordKind::Alias
        );
        assert_eq!(RecordKind::classify("203.0.113.7"), RecordKind::Address);
        assert_eq!(
            RecordKind::classify("something.example.com"),
            RecordKind::Address
        );
    }

    // =========================================================================
    // Synchronizer Stories
    // =========================================================================

    /// Story: the full lifecycle preserves order and delete history
    ///
    /// added(addr=x), modified(addr=y), deleted arrive in order. The
    /// provider sees two upserts then one delete, and the delete names
    /// the last recorded target y, not a freshly computed one. The map
    /// ends empty.
    #[tokio::test]
    async fn story_event_sequence_preserves_order_and_delete_history() {
        let mut provider = MockDnsProvider::new();
        let mut seq = Sequence::new();
        provider
            .expect_upsert()
            .with(
                eq(HOSTNAME),
                eq(RecordKind::Address),
                eq("203.0.113.7"),
                eq(300),
            )
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        provider
            .expect_upsert()
            .with(
                eq(HOSTNAME),
                eq(RecordKind::Address),
                eq("203.0.113.8"),
                eq(300),
            )
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        provider
            .expect_delete()
            .with(
                eq(HOSTNAME),
                eq(RecordKind::Address),
                eq("203.0.113.8"),
                eq(300),
            )
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));

        let store = RecordStore::new();
        let sync = synchronizer(provider, store.clone());

        sync.handle_event(EndpointEvent::Added(make_service(
            Some(ENV_ID),
            Some("203.0.113.7"),
        )))
        .await;
        sync.handle_event(EndpointEvent::Modified(make_service(
            Some(ENV_ID),
            Some("203.0.113.8"),
        )))
        .await;
        // The deletion event may arrive with the address already stripped
        sync.handle_event(EndpointEvent::Deleted(make_service(Some(ENV_ID), None)))
            .await;

        assert!(store.is_empty().await);
    }

    /// Story: a load-balancer hostname yields an alias record
    ///
    /// Service labeled with the environment id and an ELB hostname
    /// produces `<short>.<domain>` as an alias, not an address record.
    #[tokio::test]
    async fn story_elb_backed_service_produces_alias_record() {
        let mut provider = MockDnsProvider::new();
        provider
            .expect_upsert()
            .with(
                eq(HOSTNAME),
                eq(RecordKind::Alias),
                eq("lb-7.elb.amazonaws.com"),
                eq(300),
            )
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let store = RecordStore::new();
        let sync = synchronizer(provider, store.clone());

        sync.handle_event(EndpointEvent::Added(make_service(
            Some("abc12345"),
            Some("lb-7.elb.amazonaws.com"),
        )))
        .await;

        let record = store.get("abc12345").await.unwrap();
        assert_eq!(record.hostname, HOSTNAME);
        assert_eq!(record.kind, RecordKind::Alias);
        assert_eq!(record.service, "dev-env-abc12345/dev-env-abc12345-svc");
    }

    /// Story: services without the platform label are skipped
    ///
    /// No provider expectation exists, so any DNS call would panic.
    #[tokio::test]
    async fn story_unlabeled_service_is_skipped() {
        let provider = MockDnsProvider::new();
        let store = RecordStore::new();
        let sync = synchronizer(provider, store.clone());

        sync.handle_event(EndpointEvent::Added(make_service(None, Some("203.0.113.7"))))
            .await;

        assert!(store.is_empty().await);
    }

    /// Story: a service whose address is not yet assigned is skipped
    ///
    /// Not an error: assignment is asynchronous and a later modified
    /// event supplies the address.
    #[tokio::test]
    async fn story_unassigned_address_is_skipped_without_error() {
        let provider = MockDnsProvider::new();
        let store = RecordStore::new();
        let sync = synchronizer(provider, store.clone());

        sync.handle_event(EndpointEvent::Added(make_service(Some(ENV_ID), None)))
            .await;

        assert!(store.is_empty().await);
    }

    /// Story: re-delivered added events never duplicate state
    ///
    /// After a watch reconnect the full listing is replayed; the second
    /// added produces another idempotent upsert but the store keeps one
    /// entry with its original creation time.
    #[tokio::test]
    async fn story_replayed_added_event_keeps_single_entry() {
        let mut provider = MockDnsProvider::new();
        provider
            .expect_upsert()
            .times(2)
            .returning(|_, _, _, _| Ok(()));

        let store = RecordStore::new();
        let original_created = Utc::now() - chrono::Duration::hours(2);
        store
            .upsert(ManagedDnsRecord {
                env_id: ENV_ID.to_string(),
                hostname: HOSTNAME.to_string(),
                target: "203.0.113.7".to_string(),
                kind: RecordKind::Address,
                service: "dev-env-abc12345/dev-env-abc12345-svc".to_string(),
                created_at: original_created,
                last_updated: original_created,
            })
            .await;

        let sync = synchronizer(provider, store.clone());
        let service = make_service(Some(ENV_ID), Some("203.0.113.7"));
        sync.handle_event(EndpointEvent::Added(service.clone())).await;
        sync.handle_event(EndpointEvent::Added(service)).await;

        assert_eq!(store.len().await, 1);
        let record = store.get(ENV_ID).await.unwrap();
        assert_eq!(record.created_at, original_created);
        assert!(record.last_updated > original_created);
    }

    /// Story: deleting an unknown environment is a no-op
    ///
    /// Already removed, or never completed address assignment; either way
    /// there is nothing to delete.
    #[tokio::test]
    async fn story_delete_without_entry_is_noop() {
        let provider = MockDnsProvider::new();
        let store = RecordStore::new();
        let sync = synchronizer(provider, store.clone());

        sync.handle_event(EndpointEvent::Deleted(make_service(Some(ENV_ID), None)))
            .await;

        assert!(store.is_empty().await);
    }

    /// Story: a failed provider delete still drops the map entry
    ///
    /// The resulting provider-side leak is bounded: the sweeper clears it
    /// after the grace window.
    #[tokio::test]
    async fn story_failed_provider_delete_still_drops_entry() {
        let mut provider = MockDnsProvider::new();
        provider
            .expect_upsert()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        provider
            .expect_delete()
            .returning(|_, _, _, _| Err(crate::Error::dns("zone unavailable")));

        let store = RecordStore::new();
        let sync = synchronizer(provider, store.clone());

        sync.handle_event(EndpointEvent::Added(make_service(
            Some(ENV_ID),
            Some("203.0.113.7"),
        )))
        .await;
        assert_eq!(store.len().await, 1);

        sync.handle_event(EndpointEvent::Deleted(make_service(Some(ENV_ID), None)))
            .await;
        assert!(store.is_empty().await);
    }
}
