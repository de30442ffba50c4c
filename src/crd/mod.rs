//! Custom Resource Definitions for the Gitea Operator

mod gitea;

pub use gitea::*;

use kube::CustomResourceExt;

use crate::{Error, Result};

/// Generate CRD YAML manifests for all custom resources
pub fn generate_crds() -> Result<Vec<String>> {
    let crd = serde_yaml::to_string(&Gitea::crd())
        .map_err(|e| Error::ConfigError(format!("Failed to serialize CRD: {}", e)))?;
    Ok(vec![crd])
}
