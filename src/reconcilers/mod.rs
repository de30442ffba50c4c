//! Reconcilers turning Gitea resources into applied manifests

pub mod gitea;
