//! Routes serving shoot OpenID discovery documents.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use super::{method_not_allowed, store_response};
use crate::store::openidmeta::Data;
use crate::store::Store;

/// Path of the shoot openid-configuration route.
pub const WELL_KNOWN_PATH: &str =
    "/projects/{projectName}/shoots/{shootUID}/issuer/.well-known/openid-configuration";
/// Path of the shoot JWKS route.
pub const JWKS_PATH: &str = "/projects/{projectName}/shoots/{shootUID}/issuer/jwks";

/// Router serving the shoot issuer discovery documents from the store.
pub fn router(store: Arc<Store<Data>>) -> Router {
    Router::new()
        .route(WELL_KNOWN_PATH, get(well_known).fallback(method_not_allowed))
        .route(JWKS_PATH, get(jwks).fallback(method_not_allowed))
        .with_state(store)
}

async fn well_known(
    State(store): State<Arc<Store<Data>>>,
    Path((project_name, shoot_uid)): Path<(String, String)>,
) -> Response {
    store_response(&store, &project_name, &shoot_uid, |data| data.config)
}

async fn jwks(
    State(store): State<Arc<Store<Data>>>,
    Path((project_name, shoot_uid)): Path<(String, String)>,
) -> Response {
    store_response(&store, &project_name, &shoot_uid, |data| data.jwks)
}
