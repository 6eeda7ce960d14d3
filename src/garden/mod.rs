//! Garden cluster resource types and access.
//!
//! The discovery server consumes four resource kinds from the garden
//! cluster: issuer `Secret`s, CA bundle `ConfigMap`s, and the gardener
//! `Project`/`Shoot` custom resources used to verify tenant bindings.
//! All reads go through [`GardenAccess`] so reconcilers can be tested
//! against a mock control plane.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::{Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Namespace holding the published shoot issuer secrets.
pub const ISSUER_NAMESPACE: &str = "gardener-system-shoot-issuer";

/// Label marking a secret as published service account public keys.
pub const LABEL_PUBLIC_KEYS: &str = "authentication.gardener.cloud/public-keys";
/// Required value of [`LABEL_PUBLIC_KEYS`].
pub const PUBLIC_KEYS_SERVICE_ACCOUNT: &str = "serviceaccount";

/// Label carrying the owning project name.
pub const LABEL_PROJECT_NAME: &str = "project.gardener.cloud/name";
/// Label carrying the shoot name.
pub const LABEL_SHOOT_NAME: &str = "shoot.gardener.cloud/name";
/// Label carrying the shoot's project namespace.
pub const LABEL_SHOOT_NAMESPACE: &str = "shoot.gardener.cloud/namespace";
/// Label carrying the shoot UID.
pub const LABEL_SHOOT_UID: &str = "shoot.gardener.cloud/uid";

/// Label marking a configmap as publicly discoverable material.
pub const LABEL_DISCOVERY_PUBLIC: &str = "discovery.gardener.cloud/public";
/// Value of [`LABEL_DISCOVERY_PUBLIC`] for shoot CA bundles.
pub const DISCOVERY_PUBLIC_SHOOT_CA: &str = "shoot-ca";
/// Label asserting the resource cannot be mutated by tenant users.
///
/// Load-bearing: it is not safe to republish data from resources that
/// project users may overwrite.
pub const LABEL_UPDATE_RESTRICTION: &str = "gardener.cloud/update-restriction";

/// Annotation selecting the issuer mode of a shoot.
pub const ANNOTATION_AUTHENTICATION_ISSUER: &str = "authentication.gardener.cloud/issuer";
/// Value of [`ANNOTATION_AUTHENTICATION_ISSUER`] for garden managed issuers.
pub const AUTHENTICATION_ISSUER_MANAGED: &str = "managed";

/// Secret data key holding the openid-configuration document.
pub const DATA_KEY_OPENID_CONFIG: &str = "openid-config";
/// Secret data key holding the JWKS document.
pub const DATA_KEY_JWKS: &str = "jwks";
/// ConfigMap data key holding the CA bundle PEM.
pub const DATA_KEY_CA_CRT: &str = "ca.crt";

/// Label selector for the issuer secret watch.
pub fn openid_secret_selector() -> String {
    format!("{LABEL_PUBLIC_KEYS}={PUBLIC_KEYS_SERVICE_ACCOUNT}")
}

/// Label selector for the shoot CA configmap watch.
pub fn shoot_ca_selector() -> String {
    format!("{LABEL_DISCOVERY_PUBLIC}={DISCOVERY_PUBLIC_SHOOT_CA},{LABEL_UPDATE_RESTRICTION}=true")
}

/// Spec of a gardener Project.
///
/// Only the fields the discovery server validates against are modelled;
/// unknown fields of the upstream resource are ignored on deserialization.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "core.gardener.cloud",
    version = "v1beta1",
    kind = "Project",
    plural = "projects"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// The namespace dedicated to this project, set by the project controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Spec of a gardener Shoot.
///
/// The discovery server only consults shoot metadata (UID, annotations),
/// so the spec carries no fields.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "core.gardener.cloud",
    version = "v1beta1",
    kind = "Shoot",
    plural = "shoots",
    namespaced
)]
pub struct ShootSpec {}

/// Read access to the garden control plane.
///
/// `Ok(None)` means the resource does not exist; `Err` is reserved for
/// transport failures, which reconcilers surface as retryable errors.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GardenAccess: Send + Sync {
    /// Fetch a secret by namespace and name.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Fetch a configmap by namespace and name.
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Fetch a namespace by name.
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Fetch a project by name.
    async fn get_project(&self, name: &str) -> Result<Option<Project>, Error>;

    /// Fetch a shoot by namespace and name.
    async fn get_shoot(&self, namespace: &str, name: &str) -> Result<Option<Shoot>, Error>;
}

/// [`GardenAccess`] implementation backed by a kube client.
#[derive(Clone)]
pub struct KubeGarden {
    client: Client,
}

impl KubeGarden {
    /// Create a new accessor wrapping the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn ok_or_not_found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl GardenAccess for KubeGarden {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        ok_or_not_found(api.get(name).await)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ok_or_not_found(api.get(name).await)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        ok_or_not_found(api.get(name).await)
    }

    async fn get_project(&self, name: &str) -> Result<Option<Project>, Error> {
        let api: Api<Project> = Api::all(self.client.clone());
        ok_or_not_found(api.get(name).await)
    }

    async fn get_shoot(&self, namespace: &str, name: &str) -> Result<Option<Shoot>, Error> {
        let api: Api<Shoot> = Api::namespaced(self.client.clone(), namespace);
        ok_or_not_found(api.get(name).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_match_the_published_label_contract() {
        assert_eq!(
            openid_secret_selector(),
            "authentication.gardener.cloud/public-keys=serviceaccount"
        );
        assert_eq!(
            shoot_ca_selector(),
            "discovery.gardener.cloud/public=shoot-ca,gardener.cloud/update-restriction=true"
        );
    }

    #[test]
    fn project_spec_tolerates_unknown_upstream_fields() {
        let spec: ProjectSpec = serde_json::from_str(
            r#"{"namespace":"garden-foo","owner":{"kind":"User","name":"dev"}}"#,
        )
        .unwrap();
        assert_eq!(spec.namespace.as_deref(), Some("garden-foo"));
    }
}
