//! Parameter and credential generation for Gitea instances
//!
//! A [`GiteaParameters`] value is the only data source templates render
//! against. Its generated credentials are issued once per instance and then
//! handed back unchanged on every later pass: rotating them would leave the
//! running database with a password the application no longer knows.

use std::collections::HashMap;
use std::fmt;

use kube::ResourceExt;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResourceNames;
use crate::crd::Gitea;
use crate::{Error, Result};

/// Length of generated passwords and the secret key
pub const PASSWORD_LENGTH: usize = 10;

/// Length of the internal signing token
pub const INTERNAL_TOKEN_LENGTH: usize = 105;

pub const APPLICATION_NAME: &str = "gitea";
pub const DATABASE_USER: &str = "gitea";
pub const DATABASE_NAME: &str = "gitea";
pub const DATABASE_MAX_CONNECTIONS: &str = "100";
pub const DATABASE_SHARED_BUFFERS: &str = "12MB";
pub const GITEA_IMAGE: &str = "quay.io/integreatly/gitea";
pub const GITEA_VERSION: &str = "1.10.3";
pub const GITEA_VOLUME_CAPACITY: &str = "1Gi";
pub const DB_VOLUME_CAPACITY: &str = "1Gi";

/// Identity of one logical Gitea instance
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub namespace: String,
    pub name: String,
}

impl InstanceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a Gitea resource. Fails when the resource carries no namespace.
    pub fn for_gitea(gitea: &Gitea) -> Result<Self> {
        let namespace = gitea
            .namespace()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| {
                Error::InvalidInput(format!("Gitea {} has no namespace", gitea.name_any()))
            })?;
        Ok(Self::new(namespace, gitea.name_any()))
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Credentials generated for one instance
#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedSecrets {
    pub database_password: String,
    pub database_admin_password: String,
    pub internal_token: String,
    pub secret_key: String,
}

impl fmt::Debug for GeneratedSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedSecrets")
            .field("database_password", &"<redacted>")
            .field("database_admin_password", &"<redacted>")
            .field("internal_token", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Values every manifest template renders against.
///
/// Field names are the names templates look up.
#[derive(Clone, PartialEq, Serialize)]
pub struct GiteaParameters {
    // Resource names
    pub gitea_config_map_name: String,
    pub gitea_deployment_name: String,
    pub gitea_ingress_name: String,
    pub gitea_pg_deployment_name: String,
    pub gitea_pg_pvc_name: String,
    pub gitea_pg_service_name: String,
    pub gitea_repos_pvc_name: String,
    pub gitea_service_account_name: String,
    pub gitea_service_name: String,
    pub gitea_credentials_secret_name: String,

    // Resource properties
    pub application_namespace: String,
    pub application_name: String,
    pub hostname: String,
    pub database_user: String,
    pub database_password: String,
    pub database_admin_password: String,
    pub database_name: String,
    pub database_max_connections: String,
    pub database_shared_buffers: String,
    pub install_lock: bool,
    pub gitea_internal_token: String,
    pub gitea_secret_key: String,
    pub gitea_image: String,
    pub gitea_version: String,
    pub gitea_volume_capacity: String,
    pub db_volume_capacity: String,
}

impl fmt::Debug for GiteaParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GiteaParameters")
            .field("gitea_config_map_name", &self.gitea_config_map_name)
            .field("gitea_deployment_name", &self.gitea_deployment_name)
            .field("gitea_ingress_name", &self.gitea_ingress_name)
            .field("gitea_pg_deployment_name", &self.gitea_pg_deployment_name)
            .field("gitea_pg_pvc_name", &self.gitea_pg_pvc_name)
            .field("gitea_pg_service_name", &self.gitea_pg_service_name)
            .field("gitea_repos_pvc_name", &self.gitea_repos_pvc_name)
            .field("gitea_service_account_name", &self.gitea_service_account_name)
            .field("gitea_service_name", &self.gitea_service_name)
            .field(
                "gitea_credentials_secret_name",
                &self.gitea_credentials_secret_name,
            )
            .field("application_namespace", &self.application_namespace)
            .field("application_name", &self.application_name)
            .field("hostname", &self.hostname)
            .field("database_user", &self.database_user)
            .field("database_password", &"<redacted>")
            .field("database_admin_password", &"<redacted>")
            .field("database_name", &self.database_name)
            .field("database_max_connections", &self.database_max_connections)
            .field("database_shared_buffers", &self.database_shared_buffers)
            .field("install_lock", &self.install_lock)
            .field("gitea_internal_token", &"<redacted>")
            .field("gitea_secret_key", &"<redacted>")
            .field("gitea_image", &self.gitea_image)
            .field("gitea_version", &self.gitea_version)
            .field("gitea_volume_capacity", &self.gitea_volume_capacity)
            .field("db_volume_capacity", &self.db_volume_capacity)
            .finish()
    }
}

impl GiteaParameters {
    /// Assemble the parameter set from fixed names, user input and
    /// previously issued credentials.
    pub fn new(
        names: &ResourceNames,
        namespace: &str,
        hostname: &str,
        secrets: &GeneratedSecrets,
    ) -> Self {
        Self {
            gitea_config_map_name: names.config_map.clone(),
            gitea_deployment_name: names.deployment.clone(),
            gitea_ingress_name: names.ingress.clone(),
            gitea_pg_deployment_name: names.pg_deployment.clone(),
            gitea_pg_pvc_name: names.pg_pvc.clone(),
            gitea_pg_service_name: names.pg_service.clone(),
            gitea_repos_pvc_name: names.repos_pvc.clone(),
            gitea_service_account_name: names.service_account.clone(),
            gitea_service_name: names.service.clone(),
            gitea_credentials_secret_name: names.credentials_secret.clone(),
            application_namespace: namespace.to_string(),
            application_name: APPLICATION_NAME.to_string(),
            hostname: hostname.to_string(),
            database_user: DATABASE_USER.to_string(),
            database_password: secrets.database_password.clone(),
            database_admin_password: secrets.database_admin_password.clone(),
            database_name: DATABASE_NAME.to_string(),
            database_max_connections: DATABASE_MAX_CONNECTIONS.to_string(),
            database_shared_buffers: DATABASE_SHARED_BUFFERS.to_string(),
            install_lock: true,
            gitea_internal_token: secrets.internal_token.clone(),
            gitea_secret_key: secrets.secret_key.clone(),
            gitea_image: GITEA_IMAGE.to_string(),
            gitea_version: GITEA_VERSION.to_string(),
            gitea_volume_capacity: GITEA_VOLUME_CAPACITY.to_string(),
            db_volume_capacity: DB_VOLUME_CAPACITY.to_string(),
        }
    }

    /// The credential fields of this parameter set
    pub fn secrets(&self) -> GeneratedSecrets {
        GeneratedSecrets {
            database_password: self.database_password.clone(),
            database_admin_password: self.database_admin_password.clone(),
            internal_token: self.gitea_internal_token.clone(),
            secret_key: self.gitea_secret_key.clone(),
        }
    }
}

/// Issues parameter sets, generating each instance's credentials exactly once.
///
/// The random source is owned by the generator and seeded once; concurrent
/// reconcile passes serialize on it.
pub struct ParameterGenerator {
    names: ResourceNames,
    rng: Mutex<StdRng>,
    issued: Mutex<HashMap<InstanceKey, GeneratedSecrets>>,
}

impl ParameterGenerator {
    /// Create a generator drawing from the given random source
    pub fn new(names: ResourceNames, rng: StdRng) -> Self {
        Self {
            names,
            rng: Mutex::new(rng),
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Create a generator seeded from operating system entropy
    pub fn from_entropy(names: ResourceNames) -> Self {
        Self::new(names, StdRng::from_entropy())
    }

    /// Fixed resource names used for every parameter set
    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    /// Draw a token of `len` symbols from `[a-zA-Z0-9]`
    pub fn generate_token(&self, len: usize) -> String {
        let mut rng = self.rng.lock();
        (0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect()
    }

    /// Draw a fresh set of credentials. This never consults previously
    /// issued values; use [`ParameterGenerator::secrets_for`] for an instance.
    pub fn generate_secrets(&self) -> GeneratedSecrets {
        GeneratedSecrets {
            database_password: self.generate_token(PASSWORD_LENGTH),
            database_admin_password: self.generate_token(PASSWORD_LENGTH),
            internal_token: self.generate_token(INTERNAL_TOKEN_LENGTH),
            secret_key: self.generate_token(PASSWORD_LENGTH),
        }
    }

    /// Credentials for an instance.
    ///
    /// Persisted values always win and replace whatever is cached. Without
    /// them the cached values are returned, and only an instance seen for the
    /// first time gets freshly generated ones.
    pub fn secrets_for(
        &self,
        key: &InstanceKey,
        persisted: Option<GeneratedSecrets>,
    ) -> GeneratedSecrets {
        let mut issued = self.issued.lock();

        if let Some(persisted) = persisted {
            if let Some(previous) = issued.insert(key.clone(), persisted.clone()) {
                if previous != persisted {
                    warn!(
                        "Cached credentials for {} differ from persisted ones, using persisted",
                        key
                    );
                }
            }
            return persisted;
        }

        issued
            .entry(key.clone())
            .or_insert_with(|| {
                info!("Generating credentials for new instance {}", key);
                self.generate_secrets()
            })
            .clone()
    }

    /// Whether credentials have been issued for the instance in this process
    pub fn has_issued(&self, key: &InstanceKey) -> bool {
        self.issued.lock().contains_key(key)
    }

    /// Number of instances credentials have been issued for
    pub fn issued_count(&self) -> usize {
        self.issued.lock().len()
    }

    /// Parameter set for an instance with the given hostname
    pub fn parameters(
        &self,
        key: &InstanceKey,
        hostname: &str,
        persisted: Option<GeneratedSecrets>,
    ) -> GiteaParameters {
        let secrets = self.secrets_for(key, persisted);
        debug!("Built parameters for {} (hostname '{}')", key, hostname);
        GiteaParameters::new(&self.names, &key.namespace, hostname, &secrets)
    }

    /// Parameter set for a Gitea resource
    pub fn build_parameters(
        &self,
        gitea: &Gitea,
        persisted: Option<GeneratedSecrets>,
    ) -> Result<GiteaParameters> {
        let key = InstanceKey::for_gitea(gitea)?;
        Ok(self.parameters(&key, &gitea.spec.hostname, persisted))
    }

    /// Drop the cached credentials of a deleted instance
    pub fn forget(&self, key: &InstanceKey) {
        if self.issued.lock().remove(key).is_some() {
            debug!("Forgot credentials for {}", key);
        }
    }
}

impl fmt::Debug for ParameterGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterGenerator")
            .field("names", &self.names)
            .field("issued", &self.issued.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> ParameterGenerator {
        ParameterGenerator::new(ResourceNames::default(), StdRng::seed_from_u64(seed))
    }

    #[test]
    fn tokens_have_requested_length_and_alphabet() {
        let generator = seeded(7);
        for len in [0, 1, PASSWORD_LENGTH, INTERNAL_TOKEN_LENGTH] {
            let token = generator.generate_token(len);
            assert_eq!(token.len(), len);
            assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let secrets = seeded(1).generate_secrets();
        let rendered = format!("{:?}", secrets);
        assert!(!rendered.contains(&secrets.database_password));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn parameter_debug_output_redacts_credentials() {
        let generator = seeded(5);
        let key = InstanceKey::new("gitea", "example");
        let params = generator.parameters(&key, "git.example.com", None);
        let rendered = format!("{:?}", params);

        for secret in [
            &params.database_password,
            &params.database_admin_password,
            &params.gitea_internal_token,
            &params.gitea_secret_key,
        ] {
            assert!(!rendered.contains(secret.as_str()));
        }
        assert!(rendered.contains("git.example.com"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn parameters_round_trip_their_secrets() {
        let generator = seeded(3);
        let key = InstanceKey::new("gitea", "example");
        let params = generator.parameters(&key, "git.example.com", None);
        assert_eq!(params.secrets(), generator.secrets_for(&key, None));
    }

    #[test]
    fn forget_drops_cached_credentials() {
        let generator = seeded(11);
        let key = InstanceKey::new("gitea", "example");
        generator.secrets_for(&key, None);
        assert!(generator.has_issued(&key));
        generator.forget(&key);
        assert!(!generator.has_issued(&key));
    }
}
