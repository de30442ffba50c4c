//! Adapters from a Gitea resource to cluster manifests

pub mod parameters;
pub mod secrets;
pub mod templates;
