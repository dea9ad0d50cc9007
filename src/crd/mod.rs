//! Custom Resource Definitions for Atelier
//!
//! One resource, `DevEnvironment`, declares an ephemeral development
//! environment. Supporting enums and the environment identity live in
//! [`types`].

mod environment;
mod types;

pub use environment::{DevEnvironment, DevEnvironmentSpec, DevEnvironmentStatus};
pub use types::{
    environment_labels, BaseImage, EnvironmentId, EnvironmentPhase, PackageManager, PackageSpec,
    ResourceLimit, ResourceRequest,
};
