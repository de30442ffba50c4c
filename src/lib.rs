//! Gitea Kubernetes Operator
//!
//! This operator installs Gitea and its PostgreSQL database from a single
//! `Gitea` custom resource. Every manifest is rendered from a template
//! library against one parameter set per instance, whose generated
//! credentials are persisted and reused across reconciliations.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;

pub use error::{Error, Result};
