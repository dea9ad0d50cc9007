//! Route53 implementation of the DNS provider
//!
//! Both operations submit a single-change batch against the configured
//! hosted zone. Route53 accepts the change and propagates it
//! asynchronously; callers only learn that submission succeeded.

use async_trait::async_trait;
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use aws_sdk_route53::Client;
use tracing::debug;

use super::{DnsProvider, RecordKind};
use crate::{Error, Result};

/// DNS provider backed by an AWS Route53 hosted zone
pub struct Route53Provider {
    client: Client,
    hosted_zone_id: String,
}

impl Route53Provider {
    /// Build a provider from the ambient AWS configuration
    pub async fn new(hosted_zone_id: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: Client::new(&config),
            hosted_zone_id: hosted_zone_id.into(),
        }
    }

    async fn submit(
        &self,
        action: ChangeAction,
        hostname: &str,
        kind: RecordKind,
        target: &str,
        ttl: i64,
    ) -> Result<()> {
        let action_name = action.as_str().to_string();
        let record_set = ResourceRecordSet::builder()
            .name(hostname)
            .r#type(rr_type(kind))
            .ttl(ttl)
            .resource_records(
                ResourceRecord::builder()
                    .value(target)
                    .build()
                    .map_err(|e| Error::dns(e.to_string()))?,
            )
            .build()
            .map_err(|e| Error::dns(e.to_string()))?;
        let change = Change::builder()
            .action(action)
            .resource_record_set(record_set)
            .build()
            .map_err(|e| Error::dns(e.to_string()))?;
        let batch = ChangeBatch::builder()
            .comment(format!("atelier environment record for {hostname}"))
            .changes(change)
            .build()
            .map_err(|e| Error::dns(e.to_string()))?;

        self.client
            .change_resource_record_sets()
            .hosted_zone_id(&self.hosted_zone_id)
            .change_batch(batch)
            .send()
            .await
            .map_err(|e| Error::dns(e.to_string()))?;

        debug!(hostname, action = %action_name, "route53 change submitted");
        Ok(())
    }
}

/// Route53 record type for a managed record kind
fn rr_type(kind: RecordKind) -> RrType {
    match kind {
        RecordKind::Alias => RrType::Cname,
        RecordKind::Address => RrType::A,
    }
}

#[async_trait]
impl DnsProvider for Route53Provider {
    async fn upsert(
        &self,
        hostname: &str,
        kind: RecordKind,
        target: &str,
        ttl: i64,
    ) -> Result<()> {
        self.submit(ChangeAction::Upsert, hostname, kind, target, ttl)
            .await
    }

    async fn delete(
        &self,
        hostname: &str,
        kind: RecordKind,
        target: &str,
        ttl: i64,
    ) -> Result<()> {
        self.submit(ChangeAction::Delete, hostname, kind, target, ttl)
            .await
    }
}
