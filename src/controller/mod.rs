//! Controller implementations for Atelier resources

mod environment;

pub use environment::{
    error_policy, reconcile, ClusterOps, Context, KubeClusterOps, OperatorSettings,
};
