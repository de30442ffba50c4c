//! Reconciliation logic for Gitea resources

use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DynamicObject, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::adapters::parameters::{GiteaParameters, InstanceKey, ParameterGenerator};
use crate::adapters::secrets;
use crate::adapters::templates::{RenderedResource, TemplateRenderer};
use crate::config::ResourceNames;
use crate::crd::{self, Condition, Gitea, GiteaStatus};
use crate::{Error, Result};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "gitea-operator";

/// Template of the Gitea configuration
pub const CONFIG_TEMPLATE: &str = "gitea-config";

/// Template of the Gitea workload
pub const DEPLOYMENT_TEMPLATE: &str = "gitea-deployment";

/// Every template a full installation needs, in apply order
pub const MANIFESTS: &[&str] = &[
    "gitea-service-account",
    "postgres-pvc",
    "postgres-deployment",
    "postgres-service",
    CONFIG_TEMPLATE,
    "gitea-pvc",
    DEPLOYMENT_TEMPLATE,
    "gitea-service",
    "gitea-ingress",
];

/// Pod template annotation carrying the configuration checksum
pub const CONFIG_CHECKSUM_ANNOTATION: &str = "checksum/config";

const MAX_HOSTNAME_LENGTH: usize = 253;
const MAX_LABEL_LENGTH: usize = 63;

/// Validate a Gitea resource
pub fn validate(gitea: &Gitea) -> Result<()> {
    InstanceKey::for_gitea(gitea)?;

    let hostname = &gitea.spec.hostname;
    if hostname.is_empty() {
        return Ok(());
    }

    if hostname.len() > MAX_HOSTNAME_LENGTH {
        return Err(Error::InvalidInput(format!(
            "spec.hostname must be at most {} characters",
            MAX_HOSTNAME_LENGTH
        )));
    }

    for label in hostname.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LENGTH
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid {
            return Err(Error::InvalidInput(format!(
                "spec.hostname '{}' is not a valid DNS name",
                hostname
            )));
        }
    }

    Ok(())
}

/// Render every manifest of an installation.
///
/// Stops at the first failing template; nothing is returned for a partial
/// set.
pub fn materialize(
    renderer: &TemplateRenderer,
    params: &GiteaParameters,
) -> Result<Vec<RenderedResource>> {
    let mut resources = Vec::with_capacity(MANIFESTS.len());

    for template in MANIFESTS {
        let resource = renderer.create_resource(template, params)?;
        if resource.name().is_empty() {
            return Err(Error::Parse {
                template: template.to_string(),
                message: "rendered resource has no metadata.name".to_string(),
            });
        }
        debug!(
            "Materialized {} {} from {}",
            resource.kind(),
            resource.name(),
            template
        );
        resources.push(resource);
    }

    annotate_config_checksum(&mut resources, params)?;

    Ok(resources)
}

/// Hash of a ConfigMap's data, so configuration changes roll the pods
pub fn config_checksum(config_map: &RenderedResource) -> String {
    let mut hasher = Sha256::new();
    let data = config_map.body().get("data").cloned().unwrap_or(Value::Null);
    hasher.update(data.to_string().as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

fn annotate_config_checksum(
    resources: &mut [RenderedResource],
    params: &GiteaParameters,
) -> Result<()> {
    let checksum = resources
        .iter()
        .find(|r| r.kind() == "ConfigMap" && r.name() == params.gitea_config_map_name)
        .map(config_checksum);

    let (Some(checksum), Some(deployment)) = (
        checksum,
        resources
            .iter_mut()
            .find(|r| r.kind() == "Deployment" && r.name() == params.gitea_deployment_name),
    ) else {
        return Ok(());
    };

    let annotations = ["spec", "template", "metadata", "annotations"]
        .iter()
        .try_fold(deployment.body_mut(), |node, key| {
            let object = node.as_object_mut()?;
            Some(
                object
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
            )
        })
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::Parse {
            template: DEPLOYMENT_TEMPLATE.to_string(),
            message: "spec.template.metadata.annotations is not a mapping".to_string(),
        })?;

    annotations.insert(
        CONFIG_CHECKSUM_ANNOTATION.to_string(),
        Value::String(checksum),
    );
    Ok(())
}

/// Owner reference making a resource garbage-collected with its Gitea
pub fn build_owner_reference(gitea: &Gitea) -> OwnerReference {
    OwnerReference {
        api_version: crd::API_VERSION.to_string(),
        kind: crd::KIND.to_string(),
        name: gitea.name_any(),
        uid: gitea.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Parameters for one pass, plus the Secret still to be written when the
/// credentials were not persisted yet
pub struct ResolvedParameters {
    pub params: GiteaParameters,
    pub pending_secret: Option<Secret>,
}

impl fmt::Debug for ResolvedParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The pending Secret holds the credentials in clear text
        f.debug_struct("ResolvedParameters")
            .field("params", &self.params)
            .field("pending_secret", &self.pending_secret.is_some())
            .finish()
    }
}

/// Decide between persisted and generated credentials.
///
/// An existing Secret always wins. A Secret that cannot be read is an error,
/// never a reason to generate new credentials.
pub fn resolve_parameters(
    gitea: &Gitea,
    generator: &ParameterGenerator,
    existing: Option<&Secret>,
) -> Result<ResolvedParameters> {
    let persisted = existing
        .map(|secret| {
            secrets::secrets_from_secret(secret).map_err(|e| {
                Error::SecretError(format!(
                    "Credentials secret {}/{} is unusable: {}",
                    gitea.namespace().unwrap_or_default(),
                    generator.names().credentials_secret,
                    e
                ))
            })
        })
        .transpose()?;
    let was_persisted = persisted.is_some();

    let params = generator.build_parameters(gitea, persisted)?;
    let pending_secret = (!was_persisted).then(|| {
        secrets::build_credentials_secret(&params, Some(build_owner_reference(gitea)))
    });

    Ok(ResolvedParameters {
        params,
        pending_secret,
    })
}

/// Resolve the parameter set for a Gitea, persisting credentials the first
/// time they are generated.
///
/// Runs before any manifest is applied, so nothing references credentials
/// the cluster does not hold yet.
pub async fn reconcile_parameters(
    gitea: &Gitea,
    client: &Client,
    generator: &ParameterGenerator,
    namespace: &str,
) -> Result<GiteaParameters> {
    let existing =
        secrets::get_secret(client, namespace, &generator.names().credentials_secret).await?;
    let ResolvedParameters {
        params,
        pending_secret,
    } = resolve_parameters(gitea, generator, existing.as_ref())?;

    if let Some(secret) = pending_secret {
        let secrets_api: Api<Secret> = Api::namespaced(client.clone(), namespace);
        secrets_api
            .patch(
                &params.gitea_credentials_secret_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Apply(&secret),
            )
            .await
            .map_err(|e| {
                Error::KubeError(format!("Failed to persist credentials secret: {}", e))
            })?;

        info!(
            "Persisted credentials secret {}/{}",
            namespace, params.gitea_credentials_secret_name
        );
    }

    Ok(params)
}

/// Server-side apply one rendered resource, owned by the Gitea
pub async fn apply_resource(
    client: &Client,
    namespace: &str,
    mut resource: RenderedResource,
    owner: &OwnerReference,
) -> Result<String> {
    let ar = resource.api_resource();
    let kind = resource.kind().to_string();
    let name = resource.name().to_string();

    let metadata = resource.metadata_mut();
    metadata.namespace = Some(namespace.to_string());
    metadata.owner_references = Some(vec![owner.clone()]);

    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(resource.object()),
    )
    .await
    .map_err(|e| Error::KubeError(format!("Failed to apply {} {}: {}", kind, name, e)))?;

    info!("Reconciled {} {}/{}", kind, namespace, name);

    Ok(kind)
}

/// Outcome of one apply pass, as reported in the status
#[derive(Debug)]
pub struct PassOutcome {
    /// Whether credentials were resolved in this pass
    pub credentials_ready: bool,
    /// Applied manifest kinds, or why the pass stopped
    pub result: std::result::Result<Vec<String>, String>,
}

/// Condition carrying over its transition time while its status holds
fn condition(
    previous: Option<&GiteaStatus>,
    type_: &str,
    holds: bool,
    reason: &str,
    message: Option<String>,
    now: DateTime<Utc>,
) -> Condition {
    let status = if holds { "True" } else { "False" };
    let last_transition_time = previous
        .and_then(|s| s.conditions.iter().find(|c| c.type_ == type_))
        .filter(|c| c.status == status)
        .map(|c| c.last_transition_time)
        .unwrap_or(now);

    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time,
        reason: Some(reason.to_string()),
        message,
    }
}

/// Build the status for a pass outcome
pub fn build_status(gitea: &Gitea, names: &ResourceNames, outcome: &PassOutcome) -> GiteaStatus {
    let now = Utc::now();
    let previous = gitea.status.as_ref();

    let (phase, message, applied) = match &outcome.result {
        Ok(applied) => (
            "Installed",
            format!("{} manifests applied", applied.len()),
            applied.clone(),
        ),
        Err(e) => ("Failed", e.clone(), Vec::new()),
    };
    let ok = outcome.result.is_ok();

    let conditions = vec![
        condition(
            previous,
            "CredentialsReady",
            outcome.credentials_ready,
            if outcome.credentials_ready {
                "CredentialsPersisted"
            } else {
                "CredentialsPending"
            },
            None,
            now,
        ),
        condition(
            previous,
            "ManifestsApplied",
            ok,
            phase,
            Some(message.clone()),
            now,
        ),
        condition(
            previous,
            "Ready",
            ok,
            phase,
            Some(format!("Gitea is {}", phase.to_lowercase())),
            now,
        ),
    ];

    GiteaStatus {
        phase: Some(phase.to_string()),
        message: Some(message),
        applied_manifests: applied,
        credentials_secret: outcome
            .credentials_ready
            .then(|| names.credentials_secret.clone()),
        observed_generation: gitea.metadata.generation,
        last_update_time: Some(now),
        conditions,
    }
}

/// Whether `next` reports nothing beyond what `current` already says,
/// ignoring the update timestamp.
///
/// Every status write is a watch event and starts another pass.
pub fn status_unchanged(current: Option<&GiteaStatus>, next: &GiteaStatus) -> bool {
    current.is_some_and(|current| {
        let current = GiteaStatus {
            last_update_time: next.last_update_time,
            ..current.clone()
        };
        current == *next
    })
}

/// Update the status of a Gitea, skipping the write when nothing changed
pub async fn update_status(
    gitea: &Gitea,
    client: &Client,
    namespace: &str,
    names: &ResourceNames,
    outcome: &PassOutcome,
) -> Result<()> {
    let name = gitea.name_any();
    let status = build_status(gitea, names, outcome);
    let phase = status.phase.clone().unwrap_or_default();

    if status_unchanged(gitea.status.as_ref(), &status) {
        debug!("Status of {}/{} unchanged (phase={})", namespace, name, phase);
        return Ok(());
    }

    let giteas: Api<Gitea> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({
        "status": status
    });

    giteas
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| Error::KubeError(format!("Failed to update status: {}", e)))?;

    if outcome.result.is_ok() {
        info!("Updated status for {}/{}: phase={}", namespace, name, phase);
    } else {
        warn!("Updated status for {}/{}: phase={}", namespace, name, phase);
    }

    Ok(())
}
