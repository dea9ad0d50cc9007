//! Cluster-object generation for development environments
//!
//! [`Materializer::materialize`] turns one environment spec plus its
//! identity into the full set of cluster objects: isolated namespace,
//! network policy, workspace claim, workload, and service. Generation is
//! pure and deterministic; the same input always yields structurally
//! identical output, with every name derived from the identity's short
//! form. Nothing here talks to the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, Namespace,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements, SeccompProfile,
    SecurityContext, Service, ServicePort, ServiceSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{environment_labels, DevEnvironmentSpec, EnvironmentId};
use crate::{Error, Result};

/// Name of the environment's long-running container; the scale patch
/// targets it by name
pub const MAIN_CONTAINER: &str = "dev-environment";

/// Workload user and group for the main container
const WORKLOAD_UID: i64 = 1000;

/// Memory limit at which an environment routes to the high-memory pool
const HIGH_MEMORY_BYTES: u128 = 100 * (1 << 30);

/// Namespace label consumed by same-namespace network-policy peers
const NAMESPACE_NAME_LABEL: &str = "name";

/// Namespace hosting the platform ingress controllers
const INGRESS_NAMESPACE: &str = "ingress-nginx";

/// Parse a memory or storage quantity into bytes.
///
/// Accepts a bare integer (bytes) or an integer with a binary suffix
/// (`Ki`, `Mi`, `Gi`, `Ti`). Anything else is a validation error; this
/// runs before any cluster call is made.
pub fn parse_quantity(value: &str) -> Result<u128> {
    let v = value.trim();
    let (digits, multiplier): (&str, u128) = if let Some(d) = v.strip_suffix("Ki") {
        (d, 1 << 10)
    } else if let Some(d) = v.strip_suffix("Mi") {
        (d, 1 << 20)
    } else if let Some(d) = v.strip_suffix("Gi") {
        (d, 1 << 30)
    } else if let Some(d) = v.strip_suffix("Ti") {
        (d, 1 << 40)
    } else {
        (v, 1)
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::validation(format!(
            "'{value}' is not a recognized quantity (expected digits with an optional Ki/Mi/Gi/Ti suffix)"
        )));
    }

    digits
        .parse::<u128>()
        .map(|n| n * multiplier)
        .map_err(|_| Error::validation(format!("'{value}' is out of range")))
}

/// Node pool an environment is placed on
///
/// Selector and toleration are both derived from the same value, so a
/// workload can never receive one without the matching other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodePool {
    /// Accelerator nodes
    Gpu,
    /// Nodes with memory limits of 100Gi and above
    HighMemory,
    /// General development nodes
    Development,
}

impl NodePool {
    /// Choose the pool from the environment's resource shape.
    ///
    /// An accelerator request wins over the memory threshold; anything
    /// else lands on the development pool.
    pub fn for_spec(spec: &DevEnvironmentSpec) -> Result<Self> {
        if spec.resources.gpu.is_some() || spec.limits.gpu.is_some() {
            return Ok(Self::Gpu);
        }
        if parse_quantity(&spec.limits.memory)? >= HIGH_MEMORY_BYTES {
            return Ok(Self::HighMemory);
        }
        Ok(Self::Development)
    }

    /// The `workload-type` node label value for this pool
    pub fn value(&self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::HighMemory => "high-memory",
            Self::Development => "development",
        }
    }

    /// Node selector placing pods on this pool
    pub fn selector(&self) -> BTreeMap<String, String> {
        let mut selector = BTreeMap::new();
        selector.insert("kubernetes.io/arch".to_string(), "amd64".to_string());
        selector.insert("workload-type".to_string(), self.value().to_string());
        selector
    }

    /// Toleration matching this pool's taint
    pub fn toleration(&self) -> Toleration {
        Toleration {
            key: Some("workload-type".to_string()),
            operator: Some("Equal".to_string()),
            value: Some(self.value().to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        }
    }
}

/// The ordered set of cluster objects backing one environment
///
/// Apply order is namespace first, then policy/storage/workload (mutually
/// independent), then service, which selects workload pods by label.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvironmentObjects {
    /// Isolated namespace owning everything below
    pub namespace: Namespace,
    /// Default-deny isolation policy
    pub network_policy: NetworkPolicy,
    /// Persistent workspace claim
    pub storage: PersistentVolumeClaim,
    /// The environment workload
    pub workload: Deployment,
    /// Service exposing the enabled access ports
    pub service: Service,
}

/// Generates cluster objects from environment specs
#[derive(Clone, Debug)]
pub struct Materializer {
    storage_class: String,
}

impl Materializer {
    /// Create a materializer writing claims against the given storage class
    pub fn new(storage_class: impl Into<String>) -> Self {
        Self {
            storage_class: storage_class.into(),
        }
    }

    /// Produce the object set for one environment.
    ///
    /// Pure: same (spec, identity) input yields byte-identical output.
    /// Malformed quantities and an unresolvable image are rejected here,
    /// before anything reaches the cluster.
    pub fn materialize(
        &self,
        spec: &DevEnvironmentSpec,
        id: &EnvironmentId,
    ) -> Result<EnvironmentObjects> {
        let image = spec.image()?;
        let labels = environment_labels(id, &spec.team, &spec.project);

        Ok(EnvironmentObjects {
            namespace: self.namespace(spec, id, &labels),
            network_policy: self.network_policy(id, &labels),
            storage: self.storage(spec, id, &labels)?,
            workload: self.workload(spec, id, &labels, &image)?,
            service: self.service(spec, id, &labels),
        })
    }

    fn namespace(
        &self,
        spec: &DevEnvironmentSpec,
        id: &EnvironmentId,
        labels: &BTreeMap<String, String>,
    ) -> Namespace {
        let mut ns_labels = labels.clone();
        for tier in ["enforce", "audit", "warn"] {
            ns_labels.insert(
                format!("pod-security.kubernetes.io/{tier}"),
                "restricted".to_string(),
            );
        }

        let mut annotations = BTreeMap::new();
        annotations.insert(
            "atelier.dev/ttl-hours".to_string(),
            spec.ttl_hours.to_string(),
        );

        Namespace {
            metadata: ObjectMeta {
                name: Some(id.namespace()),
                labels: Some(ns_labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn network_policy(
        &self,
        id: &EnvironmentId,
        labels: &BTreeMap<String, String>,
    ) -> NetworkPolicy {
        let same_namespace = NetworkPolicyPeer {
            namespace_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    NAMESPACE_NAME_LABEL.to_string(),
                    id.namespace(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let platform_ingress = NetworkPolicyPeer {
            namespace_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    NAMESPACE_NAME_LABEL.to_string(),
                    INGRESS_NAMESPACE.to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let tcp = |port: i32| NetworkPolicyPort {
            port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        };
        let udp = |port: i32| NetworkPolicyPort {
            port: Some(IntOrString::Int(port)),
            protocol: Some("UDP".to_string()),
            ..Default::default()
        };

        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some("dev-env-isolation".to_string()),
                namespace: Some(id.namespace()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        crate::LABEL_ENVIRONMENT_ID.to_string(),
                        id.as_str().to_string(),
                    )])),
                    ..Default::default()
                },
                // Listing both directions makes everything not matched
                // below default-deny.
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                ingress: Some(vec![
                    NetworkPolicyIngressRule {
                        from: Some(vec![platform_ingress]),
                        ..Default::default()
                    },
                    NetworkPolicyIngressRule {
                        from: Some(vec![same_namespace.clone()]),
                        ..Default::default()
                    },
                ]),
                egress: Some(vec![
                    // DNS over both transports
                    NetworkPolicyEgressRule {
                        ports: Some(vec![udp(53), tcp(53)]),
                        ..Default::default()
                    },
                    // Outbound web for package downloads
                    NetworkPolicyEgressRule {
                        ports: Some(vec![tcp(443), tcp(80)]),
                        ..Default::default()
                    },
                    NetworkPolicyEgressRule {
                        to: Some(vec![same_namespace]),
                        ..Default::default()
                    },
                ]),
            }),
        }
    }

    fn storage(
        &self,
        spec: &DevEnvironmentSpec,
        id: &EnvironmentId,
        labels: &BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim> {
        parse_quantity(&spec.resources.storage)?;

        Ok(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("workspace-storage".to_string()),
                namespace: Some(id.namespace()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(spec.resources.storage.clone()),
                    )])),
                    ..Default::default()
                }),
                storage_class_name: Some(self.storage_class.clone()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn workload(
        &self,
        spec: &DevEnvironmentSpec,
        id: &EnvironmentId,
        labels: &BTreeMap<String, String>,
        image: &str,
    ) -> Result<Deployment> {
        let pool = NodePool::for_spec(spec)?;

        let mut pod_labels = labels.clone();
        pod_labels.insert("app".to_string(), id.app_label());

        let init_containers: Vec<Container> = spec
            .packages
            .iter()
            .enumerate()
            .map(|(idx, directive)| {
                let security_context = if directive.manager.needs_root() {
                    // System package managers must write below /usr; the
                    // init step is the only place root is permitted.
                    SecurityContext {
                        run_as_user: Some(0),
                        allow_privilege_escalation: Some(true),
                        ..Default::default()
                    }
                } else {
                    SecurityContext {
                        run_as_user: Some(WORKLOAD_UID),
                        run_as_group: Some(WORKLOAD_UID),
                        allow_privilege_escalation: Some(false),
                        ..Default::default()
                    }
                };
                Container {
                    name: format!("install-{idx}-{}", directive.manager),
                    image: Some(image.to_string()),
                    command: Some(vec!["/bin/bash".to_string(), "-c".to_string()]),
                    args: Some(vec![directive.manager.install_command(&directive.packages)]),
                    security_context: Some(security_context),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "workspace".to_string(),
                        mount_path: "/workspace".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }
            })
            .collect();

        let mut env: Vec<EnvVar> = spec
            .environment_variables
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();
        env.extend([
            EnvVar {
                name: "ENVIRONMENT_ID".to_string(),
                value: Some(id.as_str().to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "TEAM".to_string(),
                value: Some(spec.team.clone()),
                ..Default::default()
            },
            EnvVar {
                name: "PROJECT".to_string(),
                value: Some(spec.project.clone()),
                ..Default::default()
            },
        ]);

        let main = Container {
            name: MAIN_CONTAINER.to_string(),
            image: Some(image.to_string()),
            resources: Some(main_container_resources(spec)?),
            env: Some(env),
            ports: Some(vec![
                ContainerPort {
                    name: Some("ssh".to_string()),
                    container_port: crate::PORT_SSH,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("jupyter".to_string()),
                    container_port: crate::PORT_JUPYTER,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("vscode".to_string()),
                    container_port: crate::PORT_VSCODE,
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: "workspace".to_string(),
                    mount_path: "/workspace".to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: "tmp".to_string(),
                    mount_path: "/tmp".to_string(),
                    ..Default::default()
                },
            ]),
            security_context: Some(SecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(WORKLOAD_UID),
                run_as_group: Some(WORKLOAD_UID),
                allow_privilege_escalation: Some(false),
                // Dev tools expect a writable root filesystem
                read_only_root_filesystem: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            command: Some(vec!["/bin/bash".to_string(), "-c".to_string()]),
            args: Some(vec!["while true; do sleep 30; done".to_string()]),
            ..Default::default()
        };

        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(id.deployment_name()),
                namespace: Some(id.namespace()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".to_string(), id.app_label())])),
                    ..Default::default()
                },
                // Recreate: the workspace claim is ReadWriteOnce, so two
                // pods must never overlap.
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        init_containers: if init_containers.is_empty() {
                            None
                        } else {
                            Some(init_containers)
                        },
                        containers: vec![main],
                        volumes: Some(vec![
                            Volume {
                                name: "workspace".to_string(),
                                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                    claim_name: "workspace-storage".to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                            Volume {
                                name: "tmp".to_string(),
                                empty_dir: Some(EmptyDirVolumeSource {
                                    size_limit: Some(Quantity("1Gi".to_string())),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        security_context: Some(PodSecurityContext {
                            run_as_non_root: Some(true),
                            run_as_user: Some(WORKLOAD_UID),
                            run_as_group: Some(WORKLOAD_UID),
                            fs_group: Some(WORKLOAD_UID),
                            seccomp_profile: Some(SeccompProfile {
                                type_: "RuntimeDefault".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        node_selector: Some(pool.selector()),
                        tolerations: Some(vec![pool.toleration()]),
                        termination_grace_period_seconds: Some(30),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn service(
        &self,
        spec: &DevEnvironmentSpec,
        id: &EnvironmentId,
        labels: &BTreeMap<String, String>,
    ) -> Service {
        let mut ports = Vec::new();
        if spec.enable_ssh {
            ports.push(service_port("ssh", crate::PORT_SSH));
        }
        if spec.enable_jupyter {
            ports.push(service_port("jupyter", crate::PORT_JUPYTER));
        }
        if spec.enable_vscode {
            ports.push(service_port("vscode", crate::PORT_VSCODE));
        }

        let mut annotations = BTreeMap::new();
        annotations.insert(
            "service.beta.kubernetes.io/aws-load-balancer-type".to_string(),
            "nlb".to_string(),
        );
        annotations.insert(
            "service.beta.kubernetes.io/aws-load-balancer-scheme".to_string(),
            "internet-facing".to_string(),
        );

        Service {
            metadata: ObjectMeta {
                name: Some(id.service_name()),
                namespace: Some(id.namespace()),
                labels: Some(labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                selector: Some(BTreeMap::from([("app".to_string(), id.app_label())])),
                ports: Some(ports),
                session_affinity: Some("ClientIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Resource requirements for the environment's main container.
///
/// Also used by the reconciler to converge a scaled resource request onto
/// the running workload.
pub fn main_container_resources(spec: &DevEnvironmentSpec) -> Result<ResourceRequirements> {
    parse_quantity(&spec.resources.memory)?;
    parse_quantity(&spec.limits.memory)?;

    let mut requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(spec.resources.cpu.clone())),
        ("memory".to_string(), Quantity(spec.resources.memory.clone())),
    ]);
    let mut limits = BTreeMap::from([
        ("cpu".to_string(), Quantity(spec.limits.cpu.clone())),
        ("memory".to_string(), Quantity(spec.limits.memory.clone())),
    ]);

    if let Some(gpu) = &spec.resources.gpu {
        requests.insert("nvidia.com/gpu".to_string(), Quantity(gpu.clone()));
        let limit = spec.limits.gpu.as_ref().unwrap_or(gpu);
        limits.insert("nvidia.com/gpu".to_string(), Quantity(limit.clone()));
    }

    Ok(ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    })
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}
