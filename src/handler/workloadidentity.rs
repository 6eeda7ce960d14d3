//! Routes serving the garden workload identity documents.
//!
//! Unlike the shoot routes these are preloaded at startup and immutable for
//! the process lifetime; no per-request I/O or store lookup happens.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use url::Url;

use super::{content_response, method_not_allowed};
use crate::utils;
use crate::Error;

/// Serves the preloaded workload identity discovery documents under paths
/// derived from the issuer URL.
#[derive(Debug)]
pub struct Handler {
    openid_config: Vec<u8>,
    jwks: Vec<u8>,
    issuer_path: String,
    jwks_path: String,
}

impl Handler {
    /// Validate the preloaded documents and derive the serving paths.
    ///
    /// The issuer must be an https URL without query or fragment, the
    /// `jwks_uri` an https URL, and every key in the JWKS public.
    pub fn new(openid_config: Vec<u8>, jwks: Vec<u8>) -> Result<Self, Error> {
        let meta = utils::load_openid_config(&openid_config)
            .map_err(|e| Error::workload_identity(format!("cannot parse openid config: {e}")))?;

        let issuer = Url::parse(&meta.issuer)
            .map_err(|e| Error::workload_identity(format!("cannot parse issuer url: {e}")))?;
        if issuer.scheme() != "https" {
            return Err(Error::workload_identity("issuer url scheme must be https"));
        }
        if issuer.query().is_some() {
            return Err(Error::workload_identity("issuer url must not contain a query"));
        }
        if issuer.fragment().is_some() {
            return Err(Error::workload_identity(
                "issuer url must not contain a fragment",
            ));
        }

        let jwks_url = Url::parse(&meta.jwks_uri)
            .map_err(|e| Error::workload_identity(format!("cannot parse jwks url: {e}")))?;
        if jwks_url.scheme() != "https" {
            return Err(Error::workload_identity("jwks url scheme must be https"));
        }

        let key_set = utils::load_key_set(&jwks)
            .map_err(|e| Error::workload_identity(format!("cannot parse jwks: {e}")))?;
        for key in &key_set.keys {
            if !utils::key_is_public(key) {
                return Err(Error::workload_identity(format!(
                    "jwks key {:?} is not public",
                    key.common.key_id
                )));
            }
        }

        Ok(Self {
            openid_config,
            jwks,
            issuer_path: issuer.path().trim_end_matches('/').to_string(),
            jwks_path: jwks_url.path().to_string(),
        })
    }

    /// Path under which the openid-configuration document is served.
    pub fn openid_configuration_path(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.issuer_path)
    }

    /// Path under which the JWKS document is served.
    pub fn jwks_path(&self) -> &str {
        &self.jwks_path
    }

    /// Router serving both documents.
    pub fn router(self) -> Router {
        let config_path = self.openid_configuration_path();
        let jwks_path = self.jwks_path.clone();
        let state = Arc::new(self);
        Router::new()
            .route(
                &config_path,
                get(openid_configuration).fallback(method_not_allowed),
            )
            .route(&jwks_path, get(jwks).fallback(method_not_allowed))
            .with_state(state)
    }
}

async fn openid_configuration(State(handler): State<Arc<Handler>>) -> Response {
    content_response(handler.openid_config.clone())
}

async fn jwks(State(handler): State<Arc<Handler>>) -> Response {
    content_response(handler.jwks.clone())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::testdata;

    const ISSUER: &str = "https://local.gardener.cloud/garden/workload-identity/issuer";

    fn valid_handler() -> Handler {
        Handler::new(
            testdata::openid_config(ISSUER).into_bytes(),
            testdata::rsa_jwks().into_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn derives_paths_from_the_issuer() {
        let handler = valid_handler();
        assert_eq!(
            handler.openid_configuration_path(),
            "/garden/workload-identity/issuer/.well-known/openid-configuration"
        );
        assert_eq!(handler.jwks_path(), "/garden/workload-identity/issuer/jwks");
    }

    #[test]
    fn rejects_non_https_issuers() {
        let err = Handler::new(
            testdata::openid_config("http://local.gardener.cloud/issuer").into_bytes(),
            testdata::rsa_jwks().into_bytes(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("https"));
    }

    #[test]
    fn rejects_issuer_urls_with_query_or_fragment() {
        for issuer in [
            "https://local.gardener.cloud/issuer?x=1",
            "https://local.gardener.cloud/issuer#frag",
        ] {
            assert!(Handler::new(
                testdata::openid_config(issuer).into_bytes(),
                testdata::rsa_jwks().into_bytes(),
            )
            .is_err());
        }
    }

    #[test]
    fn rejects_non_public_keys() {
        let err = Handler::new(
            testdata::openid_config(ISSUER).into_bytes(),
            testdata::oct_jwks().as_bytes().to_vec(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not public"));
    }

    #[tokio::test]
    async fn serves_the_preloaded_documents() {
        let router = valid_handler().router();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/garden/workload-identity/issuer/.well-known/openid-configuration")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "public, max-age=3600"
        );
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        assert_eq!(body.as_ref(), testdata::openid_config(ISSUER).as_bytes());

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/garden/workload-identity/issuer/jwks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        assert_eq!(body.as_ref(), testdata::rsa_jwks().as_bytes());
    }

    #[tokio::test]
    async fn post_to_workload_identity_routes_is_rejected() {
        let router = valid_handler().router();

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/garden/workload-identity/issuer/jwks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
