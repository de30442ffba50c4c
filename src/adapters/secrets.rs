//! Persistence of generated credentials in a Kubernetes Secret

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Api, Client};

use crate::adapters::parameters::{GeneratedSecrets, GiteaParameters};
use crate::{Error, Result};

pub const DATABASE_PASSWORD_KEY: &str = "database-password";
pub const DATABASE_ADMIN_PASSWORD_KEY: &str = "database-admin-password";
pub const INTERNAL_TOKEN_KEY: &str = "internal-token";
pub const SECRET_KEY_KEY: &str = "secret-key";

/// Fetch a secret by name, `None` when it does not exist
pub async fn get_secret(client: &Client, namespace: &str, name: &str) -> Result<Option<Secret>> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets
        .get_opt(name)
        .await
        .map_err(|e| Error::KubeError(format!("Failed to get secret {}: {}", name, e)))
}

/// Get a specific key from a secret
pub fn get_secret_key(secret: &Secret, key: &str) -> Result<String> {
    if let Some(value) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Ok(value.clone());
    }

    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| Error::SecretError("Secret has no data".to_string()))?;

    let value = data
        .get(key)
        .ok_or_else(|| Error::SecretError(format!("Key '{}' not found in secret", key)))?;

    String::from_utf8(value.0.clone())
        .map_err(|e| Error::SecretError(format!("Invalid UTF-8 in secret key '{}': {}", key, e)))
}

/// Recover previously generated credentials from their Secret
pub fn secrets_from_secret(secret: &Secret) -> Result<GeneratedSecrets> {
    Ok(GeneratedSecrets {
        database_password: get_secret_key(secret, DATABASE_PASSWORD_KEY)?,
        database_admin_password: get_secret_key(secret, DATABASE_ADMIN_PASSWORD_KEY)?,
        internal_token: get_secret_key(secret, INTERNAL_TOKEN_KEY)?,
        secret_key: get_secret_key(secret, SECRET_KEY_KEY)?,
    })
}

/// Build the Secret that persists the credentials of a parameter set
pub fn build_credentials_secret(
    params: &GiteaParameters,
    owner: Option<OwnerReference>,
) -> Secret {
    let mut string_data = BTreeMap::new();
    string_data.insert(
        DATABASE_PASSWORD_KEY.to_string(),
        params.database_password.clone(),
    );
    string_data.insert(
        DATABASE_ADMIN_PASSWORD_KEY.to_string(),
        params.database_admin_password.clone(),
    );
    string_data.insert(
        INTERNAL_TOKEN_KEY.to_string(),
        params.gitea_internal_token.clone(),
    );
    string_data.insert(SECRET_KEY_KEY.to_string(), params.gitea_secret_key.clone());

    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        params.application_name.clone(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "gitea-operator".to_string(),
    );

    Secret {
        metadata: ObjectMeta {
            name: Some(params.gitea_credentials_secret_name.clone()),
            namespace: Some(params.application_namespace.clone()),
            labels: Some(labels),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::parameters::{InstanceKey, ParameterGenerator};
    use crate::config::ResourceNames;
    use k8s_openapi::ByteString;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn params() -> GiteaParameters {
        let generator =
            ParameterGenerator::new(ResourceNames::default(), StdRng::seed_from_u64(42));
        generator.parameters(&InstanceKey::new("gitea", "example"), "", None)
    }

    #[test]
    fn credentials_secret_round_trips_through_string_data() {
        let params = params();
        let secret = build_credentials_secret(&params, None);

        assert_eq!(secret.metadata.name.as_deref(), Some("gitea-credentials"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("gitea"));
        assert_eq!(secrets_from_secret(&secret).unwrap(), params.secrets());
    }

    #[test]
    fn credentials_are_read_from_encoded_data() {
        let params = params();
        let stored = build_credentials_secret(&params, None);

        // What the API server hands back: data only, string_data folded in
        let data = stored
            .string_data
            .clone()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k, ByteString(v.into_bytes())))
            .collect();
        let fetched = Secret {
            data: Some(data),
            ..Default::default()
        };

        assert_eq!(secrets_from_secret(&fetched).unwrap(), params.secrets());
    }

    #[test]
    fn missing_key_is_a_secret_error() {
        let mut data = BTreeMap::new();
        data.insert(
            DATABASE_PASSWORD_KEY.to_string(),
            ByteString(b"abc".to_vec()),
        );
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };

        let err = secrets_from_secret(&secret).unwrap_err();
        assert!(matches!(err, Error::SecretError(_)));
        assert!(err.to_string().contains(DATABASE_ADMIN_PASSWORD_KEY));
    }
}
