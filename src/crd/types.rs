//! Supporting types for the DevEnvironment CRD

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Catalog of supported base images
///
/// The serialized form is the image reference itself, so manifests read
/// naturally (`baseImage: "python:3.11"`). `custom` requires the spec's
/// `customImage` field to carry the full reference.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum BaseImage {
    /// Ubuntu 20.04 LTS
    #[serde(rename = "ubuntu:20.04")]
    Ubuntu2004,
    /// Ubuntu 22.04 LTS (default)
    #[default]
    #[serde(rename = "ubuntu:22.04")]
    Ubuntu2204,
    /// CentOS 8
    #[serde(rename = "centos:8")]
    Centos8,
    /// Minimal Alpine Linux
    #[serde(rename = "alpine:latest")]
    Alpine,
    /// Python 3.11 with pip
    #[serde(rename = "python:3.11")]
    Python311,
    /// Jupyter with the data science stack preinstalled
    #[serde(rename = "jupyter/datascience-notebook")]
    JupyterDataScience,
    /// User-supplied image reference
    #[serde(rename = "custom")]
    Custom,
}

impl BaseImage {
    /// The image reference for catalog entries; `None` for `Custom`
    pub fn reference(&self) -> Option<&'static str> {
        match self {
            Self::Ubuntu2004 => Some("ubuntu:20.04"),
            Self::Ubuntu2204 => Some("ubuntu:22.04"),
            Self::Centos8 => Some("centos:8"),
            Self::Alpine => Some("alpine:latest"),
            Self::Python311 => Some("python:3.11"),
            Self::JupyterDataScience => Some("jupyter/datascience-notebook"),
            Self::Custom => None,
        }
    }
}

/// Package managers available for init-time package installation
///
/// A closed set: manifests naming anything else are rejected at
/// deserialization, before any cluster object is generated.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum PackageManager {
    /// Debian/Ubuntu system packages
    Apt,
    /// RHEL/CentOS system packages
    Yum,
    /// Conda environments
    Conda,
    /// Python packages
    Pip,
    /// Node.js packages (installed globally)
    Npm,
}

impl PackageManager {
    /// Shell command installing the given packages with this manager
    pub fn install_command(&self, packages: &[String]) -> String {
        let list = packages.join(" ");
        match self {
            Self::Apt => format!("apt-get update && apt-get install -y {list}"),
            Self::Yum => format!("yum install -y {list}"),
            Self::Conda => format!("conda install -y {list}"),
            Self::Pip => format!("pip install {list}"),
            Self::Npm => format!("npm install -g {list}"),
        }
    }

    /// System package managers need root inside the init container;
    /// language package managers run as the workload user.
    pub fn needs_root(&self) -> bool {
        matches!(self, Self::Apt | Self::Yum)
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apt => write!(f, "apt"),
            Self::Yum => write!(f, "yum"),
            Self::Conda => write!(f, "conda"),
            Self::Pip => write!(f, "pip"),
            Self::Npm => write!(f, "npm"),
        }
    }
}

/// One package-install directive: a manager and the packages it installs
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PackageSpec {
    /// Which package manager runs this directive
    pub manager: PackageManager,
    /// Packages to install, in manager-native naming
    pub packages: Vec<String>,
}

/// Requested resources for an environment
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    /// CPU request (e.g. "1", "500m")
    #[serde(default = "default_cpu_request")]
    pub cpu: String,
    /// Memory request (e.g. "2Gi", "512Mi")
    #[serde(default = "default_memory_request")]
    pub memory: String,
    /// GPU count, when accelerator hardware is needed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    /// Workspace volume size
    #[serde(default = "default_storage_request")]
    pub storage: String,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu: default_cpu_request(),
            memory: default_memory_request(),
            gpu: None,
            storage: default_storage_request(),
        }
    }
}

/// Resource ceilings for an environment
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimit {
    /// CPU limit
    #[serde(default = "default_cpu_limit")]
    pub cpu: String,
    /// Memory limit
    #[serde(default = "default_memory_limit")]
    pub memory: String,
    /// GPU limit; defaults to the requested count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

impl Default for ResourceLimit {
    fn default() -> Self {
        Self {
            cpu: default_cpu_limit(),
            memory: default_memory_limit(),
            gpu: None,
        }
    }
}

fn default_cpu_request() -> String {
    "1".to_string()
}

fn default_memory_request() -> String {
    "2Gi".to_string()
}

fn default_storage_request() -> String {
    "10Gi".to_string()
}

fn default_cpu_limit() -> String {
    "2".to_string()
}

fn default_memory_limit() -> String {
    "4Gi".to_string()
}

/// Lifecycle phase of a development environment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EnvironmentPhase {
    /// Accepted but not yet acted on
    #[default]
    Pending,
    /// Cluster objects are being applied
    Creating,
    /// All objects applied; the workload is scheduled
    Running,
    /// Deletion requested; namespace teardown in flight
    Stopping,
    /// Creation hit a terminal failure; deletion is the recovery path
    Error,
}

impl std::fmt::Display for EnvironmentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Stable environment identifier, assigned at creation time
///
/// Wraps the resource's uid. Every generated cluster-object name and the
/// DNS hostname derive from [`EnvironmentId::short`], an 8-character
/// prefix that keeps names inside platform length limits while staying
/// collision-resistant for the environment counts we run.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// Wrap a full environment identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The full identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed-length short form used as the basis of generated names
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// Namespace owning every object of this environment
    pub fn namespace(&self) -> String {
        format!("dev-env-{}", self.short())
    }

    /// Name of the environment's workload
    pub fn deployment_name(&self) -> String {
        format!("dev-env-{}", self.short())
    }

    /// Name of the environment's service
    pub fn service_name(&self) -> String {
        format!("dev-env-{}-svc", self.short())
    }

    /// Pod selector label value tying service to workload
    pub fn app_label(&self) -> String {
        format!("dev-env-{}", self.short())
    }

    /// Externally routable hostname under the platform domain
    pub fn hostname(&self, domain_suffix: &str) -> String {
        format!("{}.{domain_suffix}", self.short())
    }
}

impl std::fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-environment labels stamped onto every generated object
pub fn environment_labels(
    id: &EnvironmentId,
    team: &str,
    project: &str,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        crate::LABEL_MANAGED_BY.to_string(),
        crate::MANAGED_BY.to_string(),
    );
    labels.insert(
        crate::LABEL_ENVIRONMENT_ID.to_string(),
        id.as_str().to_string(),
    );
    labels.insert(crate::LABEL_TEAM.to_string(), team.to_string());
    labels.insert(crate::LABEL_PROJECT.to_string(), project.to_string());
    labels
}
