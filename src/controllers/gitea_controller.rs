//! Controller for Gitea resources

use futures::StreamExt;
use kube::{
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event},
        watcher::Config,
    },
    Api, ResourceExt,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

use crate::adapters::parameters::{GiteaParameters, InstanceKey};
use crate::controllers::Context;
use crate::crd::Gitea;
use crate::metrics::prometheus::{
    MANAGED_INSTANCES, MANIFESTS_APPLIED, RECONCILE_DURATION, RECONCILIATIONS,
    RECONCILIATION_ERRORS,
};
use crate::reconcilers::gitea::{self as reconciler, PassOutcome};
use crate::Error;

/// Finalizer name for cleanup
pub const FINALIZER: &str = "integreatly.org/gitea-finalizer";

/// Requeue interval after a successful pass
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Run the Gitea controller
pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let giteas: Api<Gitea> = match ctx.config.watch_namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    info!(
        "Starting Gitea controller (namespace: {})",
        ctx.config.watch_namespace.as_deref().unwrap_or("<all>")
    );

    Controller::new(giteas, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("Reconciled {:?}", o),
                Err(e) => error!("Reconcile failed: {:?}", e),
            }
        })
        .await;

    info!("Gitea controller stopped");
}

/// Reconcile a Gitea resource
#[instrument(skip(gitea, ctx), fields(name = %gitea.name_any(), namespace = gitea.namespace().unwrap_or_default()))]
async fn reconcile(gitea: Arc<Gitea>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = std::time::Instant::now();
    let ns = gitea.namespace().unwrap_or_default();
    let name = gitea.name_any();

    RECONCILIATIONS.with_label_values(&["Gitea"]).inc();

    let giteas: Api<Gitea> = Api::namespaced(ctx.client.clone(), &ns);

    let result = finalizer(&giteas, FINALIZER, gitea, |event| async {
        match event {
            Event::Apply(gitea) => apply(&gitea, &ctx).await,
            Event::Cleanup(gitea) => cleanup(&gitea, &ctx).await,
        }
    })
    .await;

    let duration = start.elapsed().as_secs_f64();
    RECONCILE_DURATION
        .with_label_values(&["Gitea"])
        .observe(duration);
    MANAGED_INSTANCES.set(ctx.generator.issued_count() as f64);

    match &result {
        Ok(_) => info!("Successfully reconciled {}/{} in {:.2}s", ns, name, duration),
        Err(e) => {
            RECONCILIATION_ERRORS.with_label_values(&["Gitea"]).inc();
            error!("Failed to reconcile {}/{}: {:?}", ns, name, e);
        }
    }

    Ok(result?)
}

/// Materialize and apply every manifest for a Gitea
async fn apply(gitea: &Gitea, ctx: &Context) -> Result<Action, Error> {
    let ns = gitea.namespace().unwrap_or_default();
    let name = gitea.name_any();

    info!("Applying Gitea {}/{}", ns, name);

    let (credentials_ready, result) = match prepare(gitea, ctx, &ns).await {
        Ok(params) => (true, apply_manifests(gitea, ctx, &ns, &params).await),
        Err(e) => (false, Err(e)),
    };

    let outcome = PassOutcome {
        credentials_ready,
        result: result.as_ref().cloned().map_err(ToString::to_string),
    };
    let status =
        reconciler::update_status(gitea, &ctx.client, &ns, &ctx.config.names, &outcome).await;

    // A failed pass reports its own error, not the status update's
    let applied = result?;
    status?;

    info!("Applied {} manifests for Gitea {}/{}", applied.len(), ns, name);
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Validate the resource and resolve its parameters
async fn prepare(gitea: &Gitea, ctx: &Context, ns: &str) -> Result<GiteaParameters, Error> {
    reconciler::validate(gitea)?;
    reconciler::reconcile_parameters(gitea, &ctx.client, &ctx.generator, ns).await
}

async fn apply_manifests(
    gitea: &Gitea,
    ctx: &Context,
    ns: &str,
    params: &GiteaParameters,
) -> Result<Vec<String>, Error> {
    let resources = reconciler::materialize(&ctx.renderer, params)?;
    let owner = reconciler::build_owner_reference(gitea);

    let mut applied = Vec::with_capacity(resources.len());
    for resource in resources {
        let kind = reconciler::apply_resource(&ctx.client, ns, resource, &owner).await?;
        MANIFESTS_APPLIED.with_label_values(&[kind.as_str()]).inc();
        applied.push(kind);
    }

    Ok(applied)
}

/// Cleanup when a Gitea is deleted
async fn cleanup(gitea: &Gitea, ctx: &Context) -> Result<Action, Error> {
    let ns = gitea.namespace().unwrap_or_default();
    let name = gitea.name_any();

    info!("Cleaning up Gitea {}/{}", ns, name);

    // Owned resources, the credentials secret included, are garbage
    // collected through their owner references.
    ctx.generator.forget(&InstanceKey::new(ns, name));

    Ok(Action::await_change())
}

/// Error policy for the controller
fn error_policy(gitea: Arc<Gitea>, err: &Error, _ctx: Arc<Context>) -> Action {
    let ns = gitea.namespace().unwrap_or_default();
    let name = gitea.name_any();

    error!("Reconciliation error for {}/{}: {:?}", ns, name, err);

    if err.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::requeue(Duration::from_secs(300))
    }
}
