//! Shoot cluster CA reconciler.
//!
//! Watches the update-restricted configmaps that publish shoot CA bundles
//! and projects them into the certificate store. Unlike the issuer secrets,
//! the configmap name does not embed the shoot UID, so the reconciler keeps
//! a mapping from the upstream `namespace/name` to the store key it last
//! resolved to; a later deletion event uses it to evict the right entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use x509_parser::oid_registry;
use x509_parser::prelude::*;

use crate::garden::{self, GardenAccess};
use crate::store::certificate::Data;
use crate::store::Store;
use crate::Error;

#[derive(Serialize)]
struct CaBundle<'a> {
    certs: &'a str,
}

/// Shared state of the CA bundle reconciler.
pub struct Context {
    /// Read access to the garden control plane.
    pub garden: Arc<dyn GardenAccess>,
    /// Destination store for validated CA bundles.
    pub store: Arc<Store<Data>>,
    /// Interval after which a successfully reconciled key is revisited.
    pub resync_period: Duration,
    /// Maps upstream `namespace/name` to the store key it populated.
    mapping: Mutex<HashMap<String, String>>,
}

impl Context {
    /// Create the reconciler state with an empty mapping.
    pub fn new(garden: Arc<dyn GardenAccess>, store: Arc<Store<Data>>, resync_period: Duration) -> Self {
        Self {
            garden,
            store,
            resync_period,
            mapping: Mutex::new(HashMap::new()),
        }
    }

    fn remove(&self, mapping_key: &str, reason: &str) -> Action {
        info!(%reason, "removing certificates from store");
        let mut mapping = self.mapping.lock();
        if let Some(store_key) = mapping.remove(mapping_key) {
            self.store.delete(&store_key);
        }
        Action::await_change()
    }

    fn commit(&self, mapping_key: String, store_key: String, bundle: Vec<u8>) {
        let mut mapping = self.mapping.lock();
        mapping.insert(mapping_key, store_key.clone());
        self.store.write(store_key, Data { ca_bundle: bundle });
    }
}

fn certificate_is_ca(cert: &X509Certificate<'_>) -> bool {
    cert.tbs_certificate
        .extensions()
        .iter()
        .find(|ext| ext.oid == oid_registry::OID_X509_EXT_BASIC_CONSTRAINTS)
        .map(|ext| matches!(ext.parsed_extension(), ParsedExtension::BasicConstraints(bc) if bc.ca))
        .unwrap_or(false)
}

/// Reconcile a single CA bundle configmap into the certificate store.
///
/// The whole reconcile, control plane calls included, is bounded by the
/// resync period; exceeding it is a retryable error.
#[instrument(skip_all, fields(configmap = %configmap.name_any(), namespace = ?configmap.namespace()))]
pub async fn reconcile(configmap: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action, Error> {
    let deadline = ctx.resync_period;
    tokio::time::timeout(deadline, reconcile_config_map(configmap, ctx))
        .await
        .map_err(|_| Error::Timeout(deadline))?
}

async fn reconcile_config_map(configmap: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = configmap.name_any();
    let namespace = configmap.namespace().unwrap_or_default();
    let mapping_key = format!("{namespace}/{name}");

    let Some(configmap) = ctx.garden.get_config_map(&namespace, &name).await? else {
        return Ok(ctx.remove(&mapping_key, "configmap not found"));
    };

    if configmap.metadata.deletion_timestamp.is_some() {
        return Ok(ctx.remove(&mapping_key, "deletion timestamp present"));
    }

    let Some(ca_data) = configmap
        .data
        .as_ref()
        .and_then(|d| d.get(garden::DATA_KEY_CA_CRT))
        .filter(|v| !v.is_empty())
    else {
        return Ok(ctx.remove(&mapping_key, "configmap is missing ca.crt data"));
    };

    let labels = configmap.labels();
    if labels.get(garden::LABEL_DISCOVERY_PUBLIC).map(String::as_str)
        != Some(garden::DISCOVERY_PUBLIC_SHOOT_CA)
        || labels
            .get(garden::LABEL_UPDATE_RESTRICTION)
            .map(String::as_str)
            != Some("true")
    {
        return Ok(ctx.remove(&mapping_key, "configmap lacks the selection labels"));
    }

    let Some(project_namespace) = ctx.garden.get_namespace(&namespace).await? else {
        return Ok(ctx.remove(&mapping_key, "namespace not found"));
    };
    let Some(project_name) = project_namespace
        .labels()
        .get(garden::LABEL_PROJECT_NAME)
        .cloned()
    else {
        return Ok(ctx.remove(&mapping_key, "namespace lacks the project label"));
    };

    let Some(project) = ctx.garden.get_project(&project_name).await? else {
        return Ok(ctx.remove(&mapping_key, "project not found"));
    };
    match project.spec.namespace.as_deref() {
        None => return Ok(ctx.remove(&mapping_key, "project has no namespace")),
        Some(ns) if ns != namespace => {
            return Ok(ctx.remove(
                &mapping_key,
                "configmap namespace does not match the project namespace",
            ));
        }
        Some(_) => {}
    }

    let Some(shoot_name) = labels.get(garden::LABEL_SHOOT_NAME) else {
        return Ok(ctx.remove(&mapping_key, "configmap lacks the shoot name label"));
    };
    let Some(shoot_uid) = labels.get(garden::LABEL_SHOOT_UID) else {
        return Ok(ctx.remove(&mapping_key, "configmap lacks the shoot uid label"));
    };

    let Some(shoot) = ctx.garden.get_shoot(&namespace, shoot_name).await? else {
        return Ok(ctx.remove(&mapping_key, "shoot not found"));
    };
    if shoot.uid().as_deref() != Some(shoot_uid.as_str()) {
        return Ok(ctx.remove(
            &mapping_key,
            "shoot UID does not match the configmap label",
        ));
    }

    let Ok(blocks) = ::pem::parse_many(ca_data.as_bytes()) else {
        return Ok(ctx.remove(&mapping_key, "ca.crt is not valid PEM"));
    };
    for block in &blocks {
        if block.tag() != "CERTIFICATE" {
            return Ok(ctx.remove(&mapping_key, "PEM block type is not CERTIFICATE"));
        }
        if block.headers().iter().next().is_some() {
            return Ok(ctx.remove(&mapping_key, "PEM block carries unexpected headers"));
        }
        let Ok((_, certificate)) = parse_x509_certificate(block.contents()) else {
            return Ok(ctx.remove(&mapping_key, "cannot parse certificate"));
        };
        if !certificate_is_ca(&certificate) {
            return Ok(ctx.remove(&mapping_key, "certificate is not a CA"));
        }
    }

    let bundle = serde_json::to_vec(&CaBundle { certs: ca_data })
        .map_err(|e| Error::config(format!("cannot serialize CA bundle: {e}")))?;

    info!(project = %project_name, shoot = %shoot_name, "adding certificates to store");
    ctx.commit(mapping_key, format!("{project_name}--{shoot_uid}"), bundle);

    Ok(Action::requeue(ctx.resync_period))
}

/// Requeue failed keys with a short delay on top of the watcher backoff.
pub fn error_policy(configmap: Arc<ConfigMap>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(configmap = %configmap.name_any(), %error, "certificate reconciliation failed");
    Action::requeue(super::ERROR_REQUEUE_DELAY)
}

/// Run the CA bundle controller until `shutdown` fires.
pub async fn run(client: Client, ctx: Arc<Context>, shutdown: CancellationToken) {
    let configmaps: Api<ConfigMap> = Api::all(client);
    let watch = watcher::Config::default().labels(&garden::shoot_ca_selector());

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        let _ = stop_tx.send(());
    });

    Controller::new(configmaps, watch)
        .with_config(ControllerConfig::default().concurrency(super::MAX_CONCURRENT_RECONCILES))
        .graceful_shutdown_on(stop_rx.map(|_| ()))
        .run(
            |configmap, ctx| {
                std::panic::AssertUnwindSafe(reconcile(configmap, ctx))
                    .catch_unwind()
                    .map(super::flatten_panic)
            },
            error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(object = %object, "reconciled CA configmap"),
                Err(error) => error!(%error, "CA configmap controller error"),
            }
        })
        .await;

    info!("CA configmap controller stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{Namespace, Secret};
    use kube::api::ObjectMeta;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    use super::*;
    use crate::garden::{MockGardenAccess, Project, ProjectSpec, Shoot, ShootSpec};

    const PROJECT: &str = "foo";
    const PROJECT_NS: &str = "garden-foo";
    const SHOOT_UID: &str = "7a25a9b8-f7fc-4e1e-a421-31b4deaa3086";
    const CONFIGMAP: &str = "bar.ca-cluster";

    fn store_key() -> String {
        format!("{PROJECT}--{SHOOT_UID}")
    }

    fn mapping_key() -> String {
        format!("{PROJECT_NS}/{CONFIGMAP}")
    }

    fn ca_pem() -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.self_signed(&key).unwrap().pem()
    }

    fn leaf_pem() -> String {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["bar.local".to_string()]).unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    fn ca_configmap(ca_crt: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(CONFIGMAP.to_string()),
                namespace: Some(PROJECT_NS.to_string()),
                labels: Some(BTreeMap::from([
                    (
                        garden::LABEL_DISCOVERY_PUBLIC.to_string(),
                        garden::DISCOVERY_PUBLIC_SHOOT_CA.to_string(),
                    ),
                    (
                        garden::LABEL_UPDATE_RESTRICTION.to_string(),
                        "true".to_string(),
                    ),
                    (garden::LABEL_SHOOT_NAME.to_string(), "bar".to_string()),
                    (garden::LABEL_SHOOT_UID.to_string(), SHOOT_UID.to_string()),
                ])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                garden::DATA_KEY_CA_CRT.to_string(),
                ca_crt.to_string(),
            )])),
            ..Default::default()
        }
    }

    fn project_namespace() -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(PROJECT_NS.to_string()),
                labels: Some(BTreeMap::from([(
                    garden::LABEL_PROJECT_NAME.to_string(),
                    PROJECT.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn project() -> Project {
        Project::new(
            PROJECT,
            ProjectSpec {
                namespace: Some(PROJECT_NS.to_string()),
            },
        )
    }

    fn shoot() -> Shoot {
        let mut shoot = Shoot::new("bar", ShootSpec::default());
        shoot.metadata.namespace = Some(PROJECT_NS.to_string());
        shoot.metadata.uid = Some(SHOOT_UID.to_string());
        shoot
    }

    fn garden_with(
        configmap: Option<ConfigMap>,
        namespace: Option<Namespace>,
        project: Option<Project>,
        shoot: Option<Shoot>,
    ) -> MockGardenAccess {
        let mut garden = MockGardenAccess::new();
        garden
            .expect_get_config_map()
            .returning(move |_, _| Ok(configmap.clone()));
        garden
            .expect_get_namespace()
            .returning(move |_| Ok(namespace.clone()));
        garden
            .expect_get_project()
            .returning(move |_| Ok(project.clone()));
        garden
            .expect_get_shoot()
            .returning(move |_, _| Ok(shoot.clone()));
        garden
    }

    fn context(garden: MockGardenAccess) -> Arc<Context> {
        Arc::new(Context::new(
            Arc::new(garden),
            Arc::new(Store::new()),
            Duration::from_secs(1800),
        ))
    }

    #[tokio::test]
    async fn valid_bundle_is_wrapped_and_stored() {
        let pem_text = format!("{}{}", ca_pem(), ca_pem());
        let configmap = ca_configmap(&pem_text);
        let ctx = context(garden_with(
            Some(configmap.clone()),
            Some(project_namespace()),
            Some(project()),
            Some(shoot()),
        ));

        let action = reconcile(Arc::new(configmap), Arc::clone(&ctx)).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(1800)));
        let data = ctx.store.read(&store_key()).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&data.ca_bundle).unwrap();
        assert_eq!(parsed["certs"].as_str().unwrap(), pem_text);
    }

    #[tokio::test]
    async fn deletion_event_evicts_via_the_mapping() {
        let configmap = ca_configmap(&ca_pem());
        let ctx = context(garden_with(
            Some(configmap.clone()),
            Some(project_namespace()),
            Some(project()),
            Some(shoot()),
        ));
        reconcile(Arc::new(configmap.clone()), Arc::clone(&ctx))
            .await
            .unwrap();
        assert_eq!(ctx.store.len(), 1);

        let mut gone = MockGardenAccess::new();
        gone.expect_get_config_map().returning(|_, _| Ok(None));
        let ctx_gone = Arc::new(Context {
            garden: Arc::new(gone),
            store: Arc::clone(&ctx.store),
            resync_period: ctx.resync_period,
            mapping: Mutex::new(HashMap::from([(mapping_key(), store_key())])),
        });

        let action = reconcile(Arc::new(configmap), Arc::clone(&ctx_gone))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert!(ctx_gone.store.is_empty());
    }

    #[tokio::test]
    async fn non_certificate_pem_block_evicts_the_entry() {
        let key = KeyPair::generate().unwrap();
        let pem_text = format!("{}{}", ca_pem(), key.serialize_pem());
        let configmap = ca_configmap(&pem_text);
        let ctx = context(garden_with(
            Some(configmap.clone()),
            Some(project_namespace()),
            Some(project()),
            Some(shoot()),
        ));

        reconcile(Arc::new(configmap), Arc::clone(&ctx)).await.unwrap();

        assert!(ctx.store.is_empty());
    }

    #[tokio::test]
    async fn leaf_certificate_evicts_the_entry() {
        let configmap = ca_configmap(&leaf_pem());
        let ctx = context(garden_with(
            Some(configmap.clone()),
            Some(project_namespace()),
            Some(project()),
            Some(shoot()),
        ));

        reconcile(Arc::new(configmap), Arc::clone(&ctx)).await.unwrap();

        assert!(ctx.store.is_empty());
    }

    #[tokio::test]
    async fn missing_update_restriction_label_evicts_the_entry() {
        let mut configmap = ca_configmap(&ca_pem());
        configmap
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .remove(garden::LABEL_UPDATE_RESTRICTION);
        let ctx = context(garden_with(Some(configmap.clone()), None, None, None));

        reconcile(Arc::new(configmap), Arc::clone(&ctx)).await.unwrap();

        assert!(ctx.store.is_empty());
    }

    #[tokio::test]
    async fn shoot_uid_label_mismatch_evicts_the_entry() {
        let configmap = ca_configmap(&ca_pem());
        let mut shoot = shoot();
        shoot.metadata.uid = Some("00000000-0000-0000-0000-000000000000".to_string());
        let ctx = context(garden_with(
            Some(configmap.clone()),
            Some(project_namespace()),
            Some(project()),
            Some(shoot),
        ));

        reconcile(Arc::new(configmap), Arc::clone(&ctx)).await.unwrap();

        assert!(ctx.store.is_empty());
    }

    struct HangingGarden;

    #[async_trait::async_trait]
    impl GardenAccess for HangingGarden {
        async fn get_secret(&self, _: &str, _: &str) -> Result<Option<Secret>, Error> {
            futures::future::pending().await
        }
        async fn get_config_map(&self, _: &str, _: &str) -> Result<Option<ConfigMap>, Error> {
            futures::future::pending().await
        }
        async fn get_namespace(&self, _: &str) -> Result<Option<Namespace>, Error> {
            futures::future::pending().await
        }
        async fn get_project(&self, _: &str) -> Result<Option<Project>, Error> {
            futures::future::pending().await
        }
        async fn get_shoot(&self, _: &str, _: &str) -> Result<Option<Shoot>, Error> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_is_bounded_by_the_resync_period() {
        let ctx = Arc::new(Context::new(
            Arc::new(HangingGarden),
            Arc::new(Store::new()),
            Duration::from_secs(10),
        ));

        let err = reconcile(Arc::new(ca_configmap(&ca_pem())), ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn namespace_without_project_label_evicts_the_entry() {
        let configmap = ca_configmap(&ca_pem());
        let mut namespace = project_namespace();
        namespace.metadata.labels = None;
        let ctx = context(garden_with(
            Some(configmap.clone()),
            Some(namespace),
            None,
            None,
        ));

        reconcile(Arc::new(configmap), Arc::clone(&ctx)).await.unwrap();

        assert!(ctx.store.is_empty());
    }
}
