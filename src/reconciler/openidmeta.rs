//! Shoot OpenID metadata reconciler.
//!
//! Watches the issuer secrets that carry shoot service account public keys
//! and projects them into the OpenID metadata store. The secret name doubles
//! as the store key (`projectName--shootUID`), so this reconciler keeps no
//! state of its own.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::garden::{self, GardenAccess};
use crate::store::openidmeta::Data;
use crate::store::Store;
use crate::utils;
use crate::Error;

/// Shared state of the OpenID metadata reconciler.
pub struct Context {
    /// Read access to the garden control plane.
    pub garden: Arc<dyn GardenAccess>,
    /// Destination store for validated metadata.
    pub store: Arc<Store<Data>>,
    /// Interval after which a successfully reconciled key is revisited.
    pub resync_period: Duration,
}

fn remove(ctx: &Context, key: &str, reason: &str) -> Action {
    info!(%reason, "removing openid metadata from store");
    ctx.store.delete(key);
    Action::await_change()
}

/// Reconcile a single issuer secret into the OpenID metadata store.
///
/// Any validation failure evicts the entry and returns success; only
/// control plane transport errors are surfaced for retry. The whole
/// reconcile, control plane calls included, is bounded by the resync
/// period; exceeding it is a retryable error.
#[instrument(skip_all, fields(secret = %secret.name_any()))]
pub async fn reconcile(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Action, Error> {
    let deadline = ctx.resync_period;
    tokio::time::timeout(deadline, reconcile_secret(secret, ctx))
        .await
        .map_err(|_| Error::Timeout(deadline))?
}

async fn reconcile_secret(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = secret.name_any();
    let namespace = secret
        .namespace()
        .unwrap_or_else(|| garden::ISSUER_NAMESPACE.to_string());

    let Some(secret) = ctx.garden.get_secret(&namespace, &name).await? else {
        return Ok(remove(&ctx, &name, "secret not found"));
    };

    if secret.metadata.deletion_timestamp.is_some() {
        return Ok(remove(&ctx, &name, "deletion timestamp present"));
    }

    let empty = Default::default();
    let data = secret.data.as_ref().unwrap_or(&empty);
    let Some(config) = data
        .get(garden::DATA_KEY_OPENID_CONFIG)
        .filter(|v| !v.0.is_empty())
    else {
        return Ok(remove(&ctx, &name, "secret is missing openid-config data"));
    };
    let Some(jwks) = data.get(garden::DATA_KEY_JWKS).filter(|v| !v.0.is_empty()) else {
        return Ok(remove(&ctx, &name, "secret is missing jwks data"));
    };

    let labels = secret.labels();
    if labels.get(garden::LABEL_PUBLIC_KEYS).map(String::as_str)
        != Some(garden::PUBLIC_KEYS_SERVICE_ACCOUNT)
    {
        return Ok(remove(&ctx, &name, "secret lacks the public keys label"));
    }

    let Some(project_name) = labels.get(garden::LABEL_PROJECT_NAME) else {
        return Ok(remove(&ctx, &name, "secret lacks the project label"));
    };
    let Some(shoot_name) = labels.get(garden::LABEL_SHOOT_NAME) else {
        return Ok(remove(&ctx, &name, "secret lacks the shoot name label"));
    };
    let Some(shoot_namespace) = labels.get(garden::LABEL_SHOOT_NAMESPACE) else {
        return Ok(remove(&ctx, &name, "secret lacks the shoot namespace label"));
    };

    let Some((name_project, shoot_uid)) = utils::split_project_name_and_shoot_uid(&name) else {
        return Ok(remove(&ctx, &name, "secret name is not projectName--shootUID"));
    };
    if project_name != name_project {
        return Ok(remove(
            &ctx,
            &name,
            "project label does not match the secret name",
        ));
    }

    let Some(project) = ctx.garden.get_project(project_name).await? else {
        return Ok(remove(&ctx, &name, "project not found"));
    };
    match project.spec.namespace.as_deref() {
        None => return Ok(remove(&ctx, &name, "project has no namespace")),
        Some(ns) if ns != shoot_namespace => {
            return Ok(remove(
                &ctx,
                &name,
                "shoot namespace label does not match the project namespace",
            ));
        }
        Some(_) => {}
    }

    let Some(shoot) = ctx.garden.get_shoot(shoot_namespace, shoot_name).await? else {
        return Ok(remove(&ctx, &name, "shoot not found"));
    };
    if shoot.uid().as_deref() != Some(shoot_uid) {
        return Ok(remove(
            &ctx,
            &name,
            "shoot UID does not match the secret name",
        ));
    }
    if shoot
        .annotations()
        .get(garden::ANNOTATION_AUTHENTICATION_ISSUER)
        .map(String::as_str)
        != Some(garden::AUTHENTICATION_ISSUER_MANAGED)
    {
        return Ok(remove(&ctx, &name, "shoot issuer is not garden managed"));
    }

    // best effort check that the served documents point at https endpoints
    let Ok(openid_config) = utils::load_openid_config(&config.0) else {
        return Ok(remove(&ctx, &name, "cannot parse openid-config"));
    };
    if !openid_config.issuer.starts_with("https://")
        || !openid_config.jwks_uri.starts_with("https://")
    {
        return Ok(remove(
            &ctx,
            &name,
            "issuer or jwks_uri does not start with https://",
        ));
    }

    let Ok(key_set) = utils::load_key_set(&jwks.0) else {
        return Ok(remove(&ctx, &name, "cannot parse jwks"));
    };
    for key in &key_set.keys {
        if !utils::key_is_public(key) {
            return Ok(remove(&ctx, &name, "jwks contains a non public key"));
        }
        if !utils::key_is_valid(key) {
            return Ok(remove(&ctx, &name, "jwks contains an invalid key"));
        }
    }

    info!("adding openid metadata to store");
    ctx.store.write(
        name,
        Data {
            config: config.0.clone(),
            jwks: jwks.0.clone(),
        },
    );

    Ok(Action::requeue(ctx.resync_period))
}

/// Requeue failed keys with a short delay on top of the watcher backoff.
pub fn error_policy(secret: Arc<Secret>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(secret = %secret.name_any(), %error, "openid metadata reconciliation failed");
    Action::requeue(super::ERROR_REQUEUE_DELAY)
}

/// Run the issuer secret controller until `shutdown` fires.
pub async fn run(client: Client, ctx: Arc<Context>, shutdown: CancellationToken) {
    let secrets: Api<Secret> = Api::namespaced(client, garden::ISSUER_NAMESPACE);
    let watch = watcher::Config::default().labels(&garden::openid_secret_selector());

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        let _ = stop_tx.send(());
    });

    Controller::new(secrets, watch)
        .with_config(ControllerConfig::default().concurrency(super::MAX_CONCURRENT_RECONCILES))
        .graceful_shutdown_on(stop_rx.map(|_| ()))
        .run(
            |secret, ctx| {
                std::panic::AssertUnwindSafe(reconcile(secret, ctx))
                    .catch_unwind()
                    .map(super::flatten_panic)
            },
            error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(object = %object, "reconciled issuer secret"),
                Err(error) => error!(%error, "issuer secret controller error"),
            }
        })
        .await;

    info!("issuer secret controller stopped");
}
