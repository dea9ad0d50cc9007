//! DevEnvironment controller implementation
//!
//! Converges a declared environment into its cluster objects. The phase
//! machine lives in status: `Pending -> Creating -> Running`, with
//! `Error` on a terminal apply failure and `Stopping` while the owning
//! namespace is torn down. Creation is idempotent: every object apply
//! treats "already exists" as success, so a partially-applied create is
//! safely re-driven on the next reconcile rather than rolled back.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolumeClaim, ResourceRequirements, Service,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{DevEnvironment, DevEnvironmentStatus, EnvironmentId, EnvironmentPhase};
use crate::materialize::{main_container_resources, Materializer, MAIN_CONTAINER};
use crate::retry::{with_backoff, Backoff};
use crate::{Error, Result};

/// Trait abstracting cluster operations for environment reconciliation
///
/// The real implementation talks to the Kubernetes API; tests mock it.
/// Apply methods are create-or-tolerate-conflict, deletion tolerates
/// not-found, so every method is safe to repeat.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Create the environment namespace, tolerating "already exists"
    async fn apply_namespace(&self, namespace: &Namespace) -> Result<()>;

    /// Create the isolation policy, tolerating "already exists"
    async fn apply_network_policy(&self, namespace: &str, policy: &NetworkPolicy) -> Result<()>;

    /// Create the workspace claim, tolerating "already exists"
    async fn apply_storage(&self, namespace: &str, claim: &PersistentVolumeClaim) -> Result<()>;

    /// Create the workload, tolerating "already exists"
    async fn apply_workload(&self, namespace: &str, workload: &Deployment) -> Result<()>;

    /// Create the service, tolerating "already exists"
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<()>;

    /// Patch the main container's resource quantities on a live workload
    async fn patch_workload_resources(
        &self,
        namespace: &str,
        name: &str,
        resources: &ResourceRequirements,
    ) -> Result<()>;

    /// Delete the environment namespace, tolerating "not found";
    /// cluster-side cascading deletion removes all child objects
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Patch the status subresource of a DevEnvironment
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DevEnvironmentStatus,
    ) -> Result<()>;
}

/// Real cluster operations backed by a kube [`Client`]
pub struct KubeClusterOps {
    client: Client,
    backoff: Backoff,
}

impl KubeClusterOps {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            backoff: Backoff::default(),
        }
    }

    async fn create_tolerating_conflict<K>(&self, api: &Api<K>, what: &str, obj: &K) -> Result<()>
    where
        K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        with_backoff(&self.backoff, what, || async {
            match api.create(&PostParams::default(), obj).await.map_err(Error::from) {
                Ok(_) => Ok(()),
                Err(e) if e.is_conflict() => {
                    debug!(object = what, "already exists, treating as success");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await
    }
}

#[async_trait]
impl ClusterOps for KubeClusterOps {
    async fn apply_namespace(&self, namespace: &Namespace) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        self.create_tolerating_conflict(&api, "namespace", namespace)
            .await
    }

    async fn apply_network_policy(&self, namespace: &str, policy: &NetworkPolicy) -> Result<()> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        self.create_tolerating_conflict(&api, "network policy", policy)
            .await
    }

    async fn apply_storage(&self, namespace: &str, claim: &PersistentVolumeClaim) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        self.create_tolerating_conflict(&api, "workspace claim", claim)
            .await
    }

    async fn apply_workload(&self, namespace: &str, workload: &Deployment) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        self.create_tolerating_conflict(&api, "workload", workload)
            .await
    }

    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.create_tolerating_conflict(&api, "service", service)
            .await
    }

    async fn patch_workload_resources(
        &self,
        namespace: &str,
        name: &str,
        resources: &ResourceRequirements,
    ) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "template": { "spec": { "containers": [
                { "name": MAIN_CONTAINER, "resources": resources }
            ]}}}
        });
        with_backoff(&self.backoff, "patch workload resources", || async {
            api.patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
                .await
        })
        .await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        with_backoff(&self.backoff, "delete namespace", || async {
            match api.delete(name, &DeleteParams::default()).await.map_err(Error::from) {
                Ok(_) => Ok(()),
                Err(e) if e.is_not_found() => {
                    debug!(namespace = name, "already gone, treating as success");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DevEnvironmentStatus,
    ) -> Result<()> {
        let api: Api<DevEnvironment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Operator-wide settings shared by reconciles
#[derive(Clone, Debug)]
pub struct OperatorSettings {
    /// DNS suffix under which environments become reachable
    pub domain_suffix: String,
}

/// Shared state handed to every reconcile invocation
pub struct Context {
    client: Option<Client>,
    /// Cluster operations (trait object for testability)
    pub cluster: Arc<dyn ClusterOps>,
    /// Cluster-object generation
    pub materializer: Materializer,
    /// Operator-wide settings
    pub settings: OperatorSettings,
}

impl Context {
    /// Create a context backed by the real cluster
    pub fn new(client: Client, materializer: Materializer, settings: OperatorSettings) -> Self {
        Self {
            cluster: Arc::new(KubeClusterOps::new(client.clone())),
            client: Some(client),
            materializer,
            settings,
        }
    }

    /// Create a context with a mocked cluster, for unit tests
    #[cfg(test)]
    pub fn for_testing(cluster: Arc<dyn ClusterOps>, settings: OperatorSettings) -> Self {
        Self {
            client: None,
            cluster,
            materializer: Materializer::new("gp3"),
            settings,
        }
    }
}

/// Reconcile a DevEnvironment resource
///
/// Wraps the phase machine in finalizer bookkeeping so that deletion of
/// the resource always runs namespace cleanup before the object is
/// released.
#[instrument(skip(env, ctx), fields(environment = %env.name_any()))]
pub async fn reconcile(env: Arc<DevEnvironment>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = env
        .namespace()
        .ok_or_else(|| Error::validation("DevEnvironment must be namespaced"))?;
    let client = ctx
        .client
        .clone()
        .ok_or_else(|| Error::finalizer("context has no client"))?;
    let api: Api<DevEnvironment> = Api::namespaced(client, &namespace);

    finalizer(&api, crate::ENVIRONMENT_FINALIZER, env, |event| async {
        match event {
            Finalizer::Apply(env) => apply(env, ctx.clone()).await,
            Finalizer::Cleanup(env) => cleanup(env, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::finalizer(e.to_string()))
}

/// Drive one environment toward its declared state
pub(crate) async fn apply(env: Arc<DevEnvironment>, ctx: Arc<Context>) -> Result<Action> {
    let name = env.name_any();
    let namespace = env
        .namespace()
        .ok_or_else(|| Error::validation("DevEnvironment must be namespaced"))?;
    let id = env.environment_id()?;

    // Validation failures are user errors: mark and wait for a spec change
    if let Err(e) = env.spec.validate() {
        warn!(environment = %id, error = %e, "spec validation failed");
        let status = transition(&env, EnvironmentPhase::Error, e.to_string());
        ctx.cluster.patch_status(&namespace, &name, &status).await?;
        return Ok(Action::await_change());
    }

    let phase = env
        .status
        .as_ref()
        .map(|s| s.phase.clone())
        .unwrap_or_default();
    debug!(environment = %id, %phase, "reconciling environment");

    match phase {
        EnvironmentPhase::Pending => {
            let mut status = transition(&env, EnvironmentPhase::Creating, "applying cluster objects");
            if status.created_at.is_none() {
                let now = Utc::now();
                status.created_at = Some(now);
                status.expires_at =
                    Some(now + chrono::Duration::hours(i64::from(env.spec.ttl_hours)));
            }
            ctx.cluster.patch_status(&namespace, &name, &status).await?;
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        EnvironmentPhase::Creating => match create_environment(&env, &id, &ctx).await {
            Ok(()) => {
                info!(environment = %id, "environment created");
                let mut status = transition(&env, EnvironmentPhase::Running, "environment is ready");
                let host = id.hostname(&ctx.settings.domain_suffix);
                status.ssh_endpoint = env.spec.enable_ssh.then(|| format!("{host}:22"));
                status.jupyter_url = env.spec.enable_jupyter.then(|| format!("http://{host}:8888"));
                status.vscode_url = env.spec.enable_vscode.then(|| format!("http://{host}:8080"));
                ctx.cluster.patch_status(&namespace, &name, &status).await?;
                Ok(Action::requeue(Duration::from_secs(300)))
            }
            Err(e) => {
                // Terminal for this attempt. Partially-created objects stay
                // for inspection; deleting the environment removes them via
                // namespace cascade.
                error!(environment = %id, stage = "create", error = %e, "environment creation failed");
                let status = transition(&env, EnvironmentPhase::Error, e.to_string());
                ctx.cluster.patch_status(&namespace, &name, &status).await?;
                Ok(Action::await_change())
            }
        },
        EnvironmentPhase::Running => {
            // A scale replaces spec.resources; converge the live workload
            let resources = main_container_resources(&env.spec)?;
            ctx.cluster
                .patch_workload_resources(&id.namespace(), &id.deployment_name(), &resources)
                .await?;
            Ok(Action::requeue(Duration::from_secs(300)))
        }
        EnvironmentPhase::Error | EnvironmentPhase::Stopping => Ok(Action::await_change()),
    }
}

/// Apply the environment's objects in dependency order.
///
/// Namespace first; policy, storage, and workload next (mutually
/// independent, applied concurrently); service last, since it selects
/// workload pods by label.
async fn create_environment(
    env: &DevEnvironment,
    id: &EnvironmentId,
    ctx: &Context,
) -> Result<()> {
    let objects = ctx.materializer.materialize(&env.spec, id)?;
    let ns = id.namespace();

    ctx.cluster.apply_namespace(&objects.namespace).await?;
    tokio::try_join!(
        ctx.cluster.apply_network_policy(&ns, &objects.network_policy),
        ctx.cluster.apply_storage(&ns, &objects.storage),
        ctx.cluster.apply_workload(&ns, &objects.workload),
    )?;
    ctx.cluster.apply_service(&ns, &objects.service).await?;

    Ok(())
}

/// Tear an environment down on deletion
pub(crate) async fn cleanup(env: Arc<DevEnvironment>, ctx: Arc<Context>) -> Result<Action> {
    let name = env.name_any();
    let namespace = env
        .namespace()
        .ok_or_else(|| Error::validation("DevEnvironment must be namespaced"))?;
    let id = env.environment_id()?;

    info!(environment = %id, "deleting environment");
    let status = transition(&env, EnvironmentPhase::Stopping, "removing cluster objects");
    if let Err(e) = ctx.cluster.patch_status(&namespace, &name, &status).await {
        // The resource may already be disappearing; cleanup continues
        debug!(environment = %id, error = %e, "could not record stopping phase");
    }

    ctx.cluster.delete_namespace(&id.namespace()).await?;
    Ok(Action::await_change())
}

/// The error policy for failed reconciliations: retry shortly
pub fn error_policy(env: Arc<DevEnvironment>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(environment = %env.name_any(), error = %error, "reconciliation failed, requeueing");
    Action::requeue(Duration::from_secs(5))
}

/// Next status for a phase transition, preserving accepted timestamps
fn transition(
    env: &DevEnvironment,
    phase: EnvironmentPhase,
    message: impl Into<String>,
) -> DevEnvironmentStatus {
    let mut status = env.status.clone().unwrap_or_default();
    status.phase = phase;
    status.message = Some(message.into());
    status.updated_at = Some(Utc::now());
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use crate::crd::{BaseImage, DevEnvironmentSpec, PackageManager, PackageSpec};

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_spec() -> DevEnvironmentSpec {
        DevEnvironmentSpec {
            name: "sandbox".to_string(),
            base_image: BaseImage::Ubuntu2204,
            custom_image: None,
            packages: vec![PackageSpec {
                manager: PackageManager::Apt,
                packages: vec!["git".to_string()],
            }],
            resources: Default::default(),
            limits: Default::default(),
            enable_ssh: true,
            enable_jupyter: false,
            enable_vscode: false,
            environment_variables: BTreeMap::new(),
            team: "eng".to_string(),
            project: "search".to_string(),
            ttl_hours: 24,
        }
    }

    fn make_env(phase: Option<EnvironmentPhase>) -> Arc<DevEnvironment> {
        let mut env = DevEnvironment::new("sandbox", sample_spec());
        env.metadata.uid = Some("abc12345-6789-0000-1111-222233334444".to_string());
        env.metadata.namespace = Some("atelier-system".to_string());
        env.status = phase.map(|p| DevEnvironmentStatus::default().phase(p));
        Arc::new(env)
    }

    fn settings() -> OperatorSettings {
        OperatorSettings {
            domain_suffix: "dev-platform.company.com".to_string(),
        }
    }

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "synthetic".to_string(),
            reason: String::new(),
            code,
        }))
    }

    // =========================================================================
    // Creation Stories
    // =========================================================================

    /// Story: a pending environment is accepted and stamped with its TTL
    ///
    /// The first reconcile only records the Creating phase together with
    /// created/expires timestamps; objects are applied on the next pass.
    #[tokio::test]
    async fn story_pending_environment_moves_to_creating_with_expiry() {
        let mut cluster = MockClusterOps::new();
        cluster
            .expect_patch_status()
            .withf(|ns, name, status| {
                ns == "atelier-system"
                    && name == "sandbox"
                    && status.phase == EnvironmentPhase::Creating
                    && status.created_at.is_some()
                    && status.expires_at.is_some()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(cluster), settings()));
        let action = apply(make_env(None), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    /// Story: creation applies objects in dependency order
    ///
    /// Namespace must land before anything inside it; the service, which
    /// selects workload pods, lands last. The middle three are mutually
    /// independent.
    #[tokio::test]
    async fn story_create_applies_objects_in_dependency_order() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut cluster = MockClusterOps::new();

        let log = order.clone();
        cluster.expect_apply_namespace().times(1).returning(move |_| {
            log.lock().unwrap().push("namespace");
            Ok(())
        });
        let log = order.clone();
        cluster
            .expect_apply_network_policy()
            .times(1)
            .returning(move |_, _| {
                log.lock().unwrap().push("policy");
                Ok(())
            });
        let log = order.clone();
        cluster.expect_apply_storage().times(1).returning(move |_, _| {
            log.lock().unwrap().push("storage");
            Ok(())
        });
        let log = order.clone();
        cluster.expect_apply_workload().times(1).returning(move |_, _| {
            log.lock().unwrap().push("workload");
            Ok(())
        });
        let log = order.clone();
        cluster.expect_apply_service().times(1).returning(move |_, _| {
            log.lock().unwrap().push("service");
            Ok(())
        });
        cluster
            .expect_patch_status()
            .withf(|_, _, status| {
                status.phase == EnvironmentPhase::Running
                    && status.ssh_endpoint.as_deref()
                        == Some("abc12345.dev-platform.company.com:22")
                    && status.jupyter_url.is_none()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(cluster), settings()));
        let action = apply(make_env(Some(EnvironmentPhase::Creating)), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(300)));

        let order = order.lock().unwrap();
        assert_eq!(order.len(), 5);
        assert_eq!(order[0], "namespace");
        assert_eq!(order[4], "service");
        for middle in ["policy", "storage", "workload"] {
            assert!(order[1..4].contains(&middle));
        }
    }

    /// Story: re-driving a create is a no-op, not a failure
    ///
    /// Simulates the retry after a crash mid-create: every apply reports
    /// success (conflicts are absorbed below this layer) and the
    /// environment converges to Running exactly as on the first attempt.
    #[tokio::test]
    async fn story_repeated_create_is_idempotent() {
        let mut cluster = MockClusterOps::new();
        cluster.expect_apply_namespace().times(2).returning(|_| Ok(()));
        cluster
            .expect_apply_network_policy()
            .times(2)
            .returning(|_, _| Ok(()));
        cluster.expect_apply_storage().times(2).returning(|_, _| Ok(()));
        cluster.expect_apply_workload().times(2).returning(|_, _| Ok(()));
        cluster.expect_apply_service().times(2).returning(|_, _| Ok(()));
        cluster
            .expect_patch_status()
            .withf(|_, _, status| status.phase == EnvironmentPhase::Running)
            .times(2)
            .returning(|_, _, _| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(cluster), settings()));
        let env = make_env(Some(EnvironmentPhase::Creating));

        apply(env.clone(), ctx.clone()).await.unwrap();
        apply(env, ctx).await.unwrap();
    }

    /// Story: a terminal apply failure marks the environment Error
    ///
    /// The service is never attempted after the workload fails, no
    /// rollback happens, and the reconcile itself succeeds so the
    /// controller does not spin on a hopeless create.
    #[tokio::test]
    async fn story_apply_failure_surfaces_error_phase() {
        let mut cluster = MockClusterOps::new();
        cluster.expect_apply_namespace().returning(|_| Ok(()));
        cluster.expect_apply_network_policy().returning(|_, _| Ok(()));
        cluster.expect_apply_storage().returning(|_, _| Ok(()));
        cluster
            .expect_apply_workload()
            .returning(|_, _| Err(api_error(500)));
        cluster
            .expect_patch_status()
            .withf(|_, _, status| {
                status.phase == EnvironmentPhase::Error
                    && status.message.as_deref().unwrap_or("").contains("kubernetes")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(cluster), settings()));
        let action = apply(make_env(Some(EnvironmentPhase::Creating)), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
    }

    /// Story: validation failures never reach the cluster
    ///
    /// No apply method has an expectation here: any cluster call would
    /// panic the mock. The environment lands in Error awaiting a spec fix.
    #[tokio::test]
    async fn story_validation_failure_never_touches_cluster() {
        let mut env = DevEnvironment::new("sandbox", sample_spec());
        env.metadata.uid = Some("abc12345-uid".to_string());
        env.metadata.namespace = Some("atelier-system".to_string());
        env.spec.limits.memory = "10GB".to_string();

        let mut cluster = MockClusterOps::new();
        cluster
            .expect_patch_status()
            .withf(|_, _, status| status.phase == EnvironmentPhase::Error)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(cluster), settings()));
        let action = apply(Arc::new(env), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Running / Scale Stories
    // =========================================================================

    /// Story: a scaled resource request converges onto the live workload
    #[tokio::test]
    async fn story_running_environment_converges_scaled_resources() {
        let mut env = DevEnvironment::new("sandbox", sample_spec());
        env.metadata.uid = Some("abc12345-uid".to_string());
        env.metadata.namespace = Some("atelier-system".to_string());
        env.spec.resources.memory = "8Gi".to_string();
        env.status = Some(DevEnvironmentStatus::default().phase(EnvironmentPhase::Running));

        let mut cluster = MockClusterOps::new();
        cluster
            .expect_patch_workload_resources()
            .withf(|ns, name, resources| {
                ns == "dev-env-abc12345"
                    && name == "dev-env-abc12345"
                    && resources
                        .requests
                        .as_ref()
                        .and_then(|r| r.get("memory"))
                        .map(|q| q.0 == "8Gi")
                        .unwrap_or(false)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(cluster), settings()));
        let action = apply(Arc::new(env), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
    }

    // =========================================================================
    // Deletion Stories
    // =========================================================================

    /// Story: deletion removes the owning namespace and nothing else
    ///
    /// Child objects go with the namespace via cluster-side cascading
    /// deletion; no per-object deletes are issued.
    #[tokio::test]
    async fn story_cleanup_deletes_owning_namespace() {
        let mut cluster = MockClusterOps::new();
        cluster
            .expect_patch_status()
            .withf(|_, _, status| status.phase == EnvironmentPhase::Stopping)
            .times(1)
            .returning(|_, _, _| Ok(()));
        cluster
            .expect_delete_namespace()
            .withf(|name| name == "dev-env-abc12345")
            .times(1)
            .returning(|_| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(cluster), settings()));
        let action = cleanup(make_env(Some(EnvironmentPhase::Running)), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
    }

    /// Story: cleanup proceeds even when the stopping phase cannot be
    /// recorded (the resource may already be going away)
    #[tokio::test]
    async fn story_cleanup_survives_status_patch_failure() {
        let mut cluster = MockClusterOps::new();
        cluster
            .expect_patch_status()
            .returning(|_, _, _| Err(api_error(404)));
        cluster
            .expect_delete_namespace()
            .times(1)
            .returning(|_| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(cluster), settings()));
        cleanup(make_env(Some(EnvironmentPhase::Running)), ctx)
            .await
            .unwrap();
    }

    // =========================================================================
    // Error Policy
    // =========================================================================

    #[tokio::test]
    async fn test_error_policy_requeues_shortly() {
        let cluster = MockClusterOps::new();
        let ctx = Arc::new(Context::for_testing(Arc::new(cluster), settings()));
        let action = error_policy(make_env(None), &api_error(500), ctx);

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }
}
