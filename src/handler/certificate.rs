//! Route serving shoot cluster CA bundles.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use super::{method_not_allowed, store_response};
use crate::store::certificate::Data;
use crate::store::Store;

/// Path of the shoot cluster CA route.
pub const CLUSTER_CA_PATH: &str = "/projects/{projectName}/shoots/{shootUID}/cluster-ca";

/// Router serving shoot CA bundles from the store.
pub fn router(store: Arc<Store<Data>>) -> Router {
    Router::new()
        .route(
            CLUSTER_CA_PATH,
            get(cluster_ca).fallback(method_not_allowed),
        )
        .with_state(store)
}

async fn cluster_ca(
    State(store): State<Arc<Store<Data>>>,
    Path((project_name, shoot_uid)): Path<(String, String)>,
) -> Response {
    store_response(&store, &project_name, &shoot_uid, |data| data.ca_bundle)
}
