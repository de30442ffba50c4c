//! Operator configuration
//!
//! Everything here is read once at startup and then shared by reference.

use std::env;
use std::path::PathBuf;

use crate::{Error, Result};

/// Environment variable overriding the template root
pub const TEMPLATE_PATH_ENV: &str = "TEMPLATE_PATH";

/// Environment variable naming the namespace to watch
pub const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";

/// Environment variable overriding the metrics port
pub const METRICS_PORT_ENV: &str = "METRICS_PORT";

/// Default template root, relative to the working directory
pub const DEFAULT_TEMPLATE_PATH: &str = "./templates";

/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Runtime configuration for the operator process
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Directory holding one `<kind>.yaml` template per manifest
    pub template_path: PathBuf,
    /// Namespace to watch; `None` means cluster scope
    pub watch_namespace: Option<String>,
    /// Port for the metrics and health server
    pub metrics_port: u16,
    /// Fixed resource names shared by every instance
    pub names: ResourceNames,
}

impl OperatorConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let template_path = lookup(TEMPLATE_PATH_ENV)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATE_PATH));

        let watch_namespace = match lookup(WATCH_NAMESPACE_ENV) {
            None => {
                return Err(Error::ConfigError(format!(
                    "{} must be set",
                    WATCH_NAMESPACE_ENV
                )))
            }
            Some(ns) if ns.is_empty() => None,
            Some(ns) => Some(ns),
        };

        let metrics_port = match lookup(METRICS_PORT_ENV) {
            None => DEFAULT_METRICS_PORT,
            Some(port) => port.parse().map_err(|e| {
                Error::ConfigError(format!(
                    "{} must be a port number, got '{}': {}",
                    METRICS_PORT_ENV, port, e
                ))
            })?,
        };

        Ok(Self {
            template_path,
            watch_namespace,
            metrics_port,
            names: ResourceNames::default(),
        })
    }
}

/// Names of every resource the operator manages in a namespace.
///
/// One Gitea instance is managed per namespace, so these are identical
/// across instances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    pub config_map: String,
    pub deployment: String,
    pub ingress: String,
    pub pg_deployment: String,
    pub pg_pvc: String,
    pub pg_service: String,
    pub repos_pvc: String,
    pub service_account: String,
    pub service: String,
    /// Secret holding the generated credentials
    pub credentials_secret: String,
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self {
            config_map: "gitea-config".to_string(),
            deployment: "gitea".to_string(),
            ingress: "gitea-ingress".to_string(),
            pg_deployment: "postgres".to_string(),
            pg_pvc: "gitea-postgres-pvc".to_string(),
            pg_service: "gitea-postgres-service".to_string(),
            repos_pvc: "gitea-repos-pvc".to_string(),
            service_account: "gitea-service-account".to_string(),
            service: "gitea-service".to_string(),
            credentials_secret: "gitea-credentials".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config =
            OperatorConfig::from_lookup(lookup(&[("WATCH_NAMESPACE", "gitea")])).unwrap();
        assert_eq!(config.template_path, PathBuf::from("./templates"));
        assert_eq!(config.watch_namespace.as_deref(), Some("gitea"));
        assert_eq!(config.metrics_port, 8080);
        assert_eq!(config.names, ResourceNames::default());
    }

    #[test]
    fn template_path_is_overridable() {
        let config = OperatorConfig::from_lookup(lookup(&[
            ("WATCH_NAMESPACE", ""),
            ("TEMPLATE_PATH", "/opt/gitea/templates"),
        ]))
        .unwrap();
        assert_eq!(config.template_path, PathBuf::from("/opt/gitea/templates"));
        assert!(config.watch_namespace.is_none());
    }

    #[test]
    fn missing_watch_namespace_is_an_error() {
        let err = OperatorConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("WATCH_NAMESPACE"));
    }

    #[test]
    fn invalid_metrics_port_is_an_error() {
        let err = OperatorConfig::from_lookup(lookup(&[
            ("WATCH_NAMESPACE", "gitea"),
            ("METRICS_PORT", "http"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
