//! DevEnvironment Custom Resource Definition
//!
//! A DevEnvironment declares one ephemeral development environment: base
//! image, packages, resources, enabled access ports, ownership, and
//! time-to-live. The spec is immutable once submitted except for the
//! resource-request sub-object, which a scale operation may replace.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    BaseImage, EnvironmentId, EnvironmentPhase, PackageSpec, ResourceLimit, ResourceRequest,
};
use crate::materialize::parse_quantity;

/// Specification for a development environment
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "atelier.dev",
    version = "v1",
    kind = "DevEnvironment",
    plural = "devenvironments",
    shortname = "denv",
    status = "DevEnvironmentStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Team","type":"string","jsonPath":".spec.team"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.baseImage"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevEnvironmentSpec {
    /// Human-readable environment name
    pub name: String,

    /// Base image from the platform catalog
    #[serde(default)]
    pub base_image: BaseImage,

    /// Full image reference when `baseImage` is `custom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image: Option<String>,

    /// Package-install directives, executed in declared order at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<PackageSpec>,

    /// Requested resources
    #[serde(default)]
    pub resources: ResourceRequest,

    /// Resource ceilings
    #[serde(default)]
    pub limits: ResourceLimit,

    /// Expose SSH (port 22)
    #[serde(default = "default_true")]
    pub enable_ssh: bool,

    /// Expose Jupyter (port 8888)
    #[serde(default)]
    pub enable_jupyter: bool,

    /// Expose VS Code server (port 8080)
    #[serde(default)]
    pub enable_vscode: bool,

    /// Extra environment variables injected into the workload
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_variables: BTreeMap<String, String>,

    /// Owning team, used for resource segregation
    pub team: String,

    /// Owning project
    pub project: String,

    /// Hours until the environment expires
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u32,
}

fn default_true() -> bool {
    true
}

fn default_ttl_hours() -> u32 {
    24
}

impl DevEnvironmentSpec {
    /// Resolve the container image to run
    pub fn image(&self) -> crate::Result<String> {
        match (&self.base_image, &self.custom_image) {
            (BaseImage::Custom, Some(image)) if !image.is_empty() => Ok(image.clone()),
            (BaseImage::Custom, _) => Err(crate::Error::validation(
                "base image is 'custom' but no custom image was given",
            )),
            (catalog, _) => catalog
                .reference()
                .map(str::to_string)
                .ok_or_else(|| crate::Error::validation("base image has no catalog reference")),
        }
    }

    /// Validate the environment specification
    ///
    /// Runs before any cluster call; a failure here is never retried.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::validation("environment name must not be empty"));
        }
        if self.team.trim().is_empty() {
            return Err(crate::Error::validation("team must not be empty"));
        }
        if self.project.trim().is_empty() {
            return Err(crate::Error::validation("project must not be empty"));
        }
        if self.ttl_hours == 0 {
            return Err(crate::Error::validation("ttlHours must be at least 1"));
        }

        // Resolves the custom-image escape hatch or fails
        self.image()?;

        for (idx, directive) in self.packages.iter().enumerate() {
            if directive.packages.is_empty() {
                return Err(crate::Error::validation(format!(
                    "package directive {idx} ({}) lists no packages",
                    directive.manager
                )));
            }
        }

        // Malformed quantities are caught here, not at apply time
        parse_quantity(&self.resources.memory)
            .map_err(|e| crate::Error::validation(format!("resources.memory: {e}")))?;
        parse_quantity(&self.limits.memory)
            .map_err(|e| crate::Error::validation(format!("limits.memory: {e}")))?;
        parse_quantity(&self.resources.storage)
            .map_err(|e| crate::Error::validation(format!("resources.storage: {e}")))?;

        for (field, gpu) in [
            ("resources.gpu", &self.resources.gpu),
            ("limits.gpu", &self.limits.gpu),
        ] {
            if let Some(count) = gpu {
                count.parse::<u32>().map_err(|_| {
                    crate::Error::validation(format!("{field}: '{count}' is not a whole GPU count"))
                })?;
            }
        }

        Ok(())
    }
}

impl DevEnvironment {
    /// The stable identity assigned by the cluster at admission
    pub fn environment_id(&self) -> crate::Result<EnvironmentId> {
        self.metadata
            .uid
            .as_deref()
            .map(EnvironmentId::new)
            .ok_or_else(|| crate::Error::validation("environment has no metadata.uid yet"))
    }
}

/// Status for a development environment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevEnvironmentStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: EnvironmentPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the environment was accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Last status transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// When the environment's time-to-live elapses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// SSH endpoint, once running with shell access enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_endpoint: Option<String>,

    /// Jupyter URL, once running with notebook access enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jupyter_url: Option<String>,

    /// VS Code URL, once running with editor access enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vscode_url: Option<String>,

    /// Last-known resource usage, keyed by resource name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_usage: BTreeMap<String, String>,
}

impl DevEnvironmentStatus {
    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: EnvironmentPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::PackageManager;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn sample_spec() -> DevEnvironmentSpec {
        DevEnvironmentSpec {
            name: "ml-sandbox".to_string(),
            base_image: BaseImage::Python311,
            custom_image: None,
            packages: vec![PackageSpec {
                manager: PackageManager::Pip,
                packages: vec!["numpy".to_string(), "pandas".to_string()],
            }],
            resources: ResourceRequest::default(),
            limits: ResourceLimit::default(),
            enable_ssh: true,
            enable_jupyter: true,
            enable_vscode: false,
            environment_variables: BTreeMap::new(),
            team: "data-science".to_string(),
            project: "forecasting".to_string(),
            ttl_hours: 24,
        }
    }

    // =========================================================================
    // Validation Stories
    // =========================================================================
    //
    // Validation runs before any cluster call and is never retried; these
    // stories pin down what gets rejected and the shape of the messages.

    /// Story: a well-formed spec passes validation
    #[test]
    fn story_valid_spec_passes_validation() {
        assert!(sample_spec().validate().is_ok());
    }

    /// Story: the custom-image escape hatch requires an image reference
    ///
    /// Choosing `custom` without supplying `customImage` is a user error
    /// caught up front, not a broken deployment discovered later.
    #[test]
    fn story_custom_base_image_requires_custom_image() {
        let mut spec = sample_spec();
        spec.base_image = BaseImage::Custom;
        spec.custom_image = None;

        let result = spec.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("custom image"));

        spec.custom_image = Some("registry.company.com/team/image:v3".to_string());
        assert!(spec.validate().is_ok());
        assert_eq!(
            spec.image().unwrap(),
            "registry.company.com/team/image:v3"
        );
    }

    /// Story: malformed quantities are rejected before any cluster call
    ///
    /// "10GB" is not a recognized suffix ("10Gi" is); the reconciler must
    /// never learn about such a spec.
    #[test]
    fn story_malformed_memory_quantity_fails_validation() {
        let mut spec = sample_spec();
        spec.limits.memory = "10GB".to_string();

        let result = spec.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("limits.memory"));
    }

    /// Story: empty package directives are rejected, not silently skipped
    #[test]
    fn story_empty_package_directive_fails_validation() {
        let mut spec = sample_spec();
        spec.packages.push(PackageSpec {
            manager: PackageManager::Apt,
            packages: vec![],
        });

        let result = spec.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("apt"));
    }

    /// Story: GPU counts must be whole numbers
    #[test]
    fn story_fractional_gpu_count_fails_validation() {
        let mut spec = sample_spec();
        spec.resources.gpu = Some("0.5".to_string());

        assert!(spec.validate().is_err());

        spec.resources.gpu = Some("2".to_string());
        assert!(spec.validate().is_ok());
    }

    /// Story: ownership fields are mandatory
    #[test]
    fn story_missing_team_fails_validation() {
        let mut spec = sample_spec();
        spec.team = "  ".to_string();
        assert!(spec.validate().is_err());
    }

    // =========================================================================
    // Serialization Stories
    // =========================================================================

    /// Story: a user manifest round-trips with defaults filled in
    ///
    /// Users write minimal YAML; defaults (ubuntu:22.04, ssh on, 24h TTL)
    /// land in the parsed spec.
    #[test]
    fn story_minimal_yaml_manifest_gets_defaults() {
        let yaml = r#"
name: quick-shell
team: platform
project: tooling
"#;
        let spec: DevEnvironmentSpec = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(spec.base_image, BaseImage::Ubuntu2204);
        assert!(spec.enable_ssh);
        assert!(!spec.enable_jupyter);
        assert_eq!(spec.ttl_hours, 24);
        assert_eq!(spec.resources.memory, "2Gi");
        assert_eq!(spec.limits.cpu, "2");
        assert!(spec.validate().is_ok());
    }

    /// Story: a full manifest survives a YAML round trip
    #[test]
    fn story_spec_survives_yaml_roundtrip() {
        let spec = sample_spec();
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let parsed: DevEnvironmentSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(spec, parsed);
    }

    /// Story: unknown package managers in manifests are rejected at parse
    #[test]
    fn story_unknown_package_manager_rejected_at_parse() {
        let yaml = r#"
name: bad
team: t
project: p
packages:
  - manager: brew
    packages: [htop]
"#;
        let parsed = serde_yaml::from_str::<DevEnvironmentSpec>(yaml);
        assert!(parsed.is_err(), "brew is not a supported manager");
    }

    // =========================================================================
    // Status Stories
    // =========================================================================

    /// Story: the reconciler builds status transitions fluently
    #[test]
    fn story_status_builder_chains_phase_and_message() {
        let status = DevEnvironmentStatus::default()
            .phase(EnvironmentPhase::Creating)
            .message("applying cluster objects");

        assert_eq!(status.phase, EnvironmentPhase::Creating);
        assert_eq!(status.message.as_deref(), Some("applying cluster objects"));
    }

    /// Story: phase serializes with Kubernetes-style capitalization
    #[test]
    fn story_phase_serialization_matches_conventions() {
        let json = serde_json::to_string(&EnvironmentPhase::Running).unwrap();
        assert_eq!(json, r#""Running""#);
        assert_eq!(EnvironmentPhase::default(), EnvironmentPhase::Pending);
    }
}
