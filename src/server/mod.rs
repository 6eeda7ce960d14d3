//! Server composition.
//!
//! Wires stores, reconcilers, the TLS content listener and the admin plane
//! together and supervises them until shutdown. The watch engine and the
//! HTTPS listener cancel each other: whichever stops first tears the other
//! down, and the process exits once both have drained.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use prometheus_client::encoding::text;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::dynamiccert::{self, DynamicCertificate};
use crate::garden::{self, GardenAccess, KubeGarden};
use crate::handler;
use crate::metrics::{self, HttpMetrics};
use crate::reconciler;
use crate::store::Store;
use crate::Error;

/// Port of the Prometheus exposition endpoint.
pub const METRICS_PORT: u16 = 8080;
/// Port of the health and readiness probes.
pub const HEALTH_PORT: u16 = 8081;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CERT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Resolved runtime configuration of the discovery server.
#[derive(Debug)]
pub struct Settings {
    /// Bind address of the HTTPS content listener.
    pub bind_addr: SocketAddr,
    /// Path to the server certificate.
    pub tls_cert_file: PathBuf,
    /// Path to the server private key.
    pub tls_key_file: PathBuf,
    /// Interval between two successful reconciles of the same key.
    pub resync_period: Duration,
    /// Preloaded workload identity documents (openid config, jwks).
    pub workload_identity_files: Option<(PathBuf, PathBuf)>,
    /// Explicit kubeconfig path; in-cluster or inferred configuration otherwise.
    pub kubeconfig: Option<PathBuf>,
}

/// Run the discovery server until a signal arrives or a subsystem fails.
pub async fn run(settings: Settings) -> Result<(), Error> {
    let client = build_client(settings.kubeconfig.as_deref()).await?;
    let garden: Arc<dyn GardenAccess> = Arc::new(KubeGarden::new(client.clone()));

    let oidc_store = Arc::new(Store::new());
    let ca_store = Arc::new(Store::new());

    let mut registry = Registry::with_prefix(metrics::SUBSYSTEM);
    let http_metrics = HttpMetrics::register(&mut registry);
    let registry = Arc::new(registry);

    let dynamic_cert = Arc::new(
        DynamicCertificate::new(&settings.tls_cert_file, &settings.tls_key_file)?
            .with_refresh_interval(CERT_REFRESH_INTERVAL),
    );
    let tls_config =
        RustlsConfig::from_config(Arc::new(dynamiccert::server_config(Arc::clone(&dynamic_cert))));

    let mut router = Router::new()
        .merge(handler::openidmeta::router(Arc::clone(&oidc_store)))
        .merge(handler::certificate::router(Arc::clone(&ca_store)));
    if let Some((config_file, jwks_file)) = &settings.workload_identity_files {
        let openid_config = tokio::fs::read(config_file).await?;
        let jwks = tokio::fs::read(jwks_file).await?;
        let workload_identity = handler::workloadidentity::Handler::new(openid_config, jwks)?;
        info!(
            path = %workload_identity.openid_configuration_path(),
            "serving workload identity documents"
        );
        router = router.merge(workload_identity.router());
    }
    let router = router
        .fallback(handler::not_found)
        .layer(axum::middleware::from_fn_with_state(
            http_metrics,
            metrics::track,
        ))
        .layer(axum::middleware::from_fn(handler::hsts))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let ready = Arc::new(AtomicBool::new(false));
    tokio::spawn(wait_for_initial_sync(
        client.clone(),
        Arc::clone(&ready),
        shutdown.clone(),
    ));

    let refresh = tokio::spawn(Arc::clone(&dynamic_cert).refresh(shutdown.clone()));

    let engine = {
        let shutdown = shutdown.clone();
        let oidc_ctx = Arc::new(reconciler::openidmeta::Context {
            garden: Arc::clone(&garden),
            store: Arc::clone(&oidc_store),
            resync_period: settings.resync_period,
        });
        let ca_ctx = Arc::new(reconciler::certificate::Context::new(
            Arc::clone(&garden),
            Arc::clone(&ca_store),
            settings.resync_period,
        ));
        let client = client.clone();
        tokio::spawn(async move {
            tokio::join!(
                reconciler::openidmeta::run(client.clone(), oidc_ctx, shutdown.clone()),
                reconciler::certificate::run(client, ca_ctx, shutdown.clone()),
            );
            // the watch engine only stops on shutdown; make sure the
            // serving tasks follow either way
            shutdown.cancel();
        })
    };

    let server = {
        let shutdown = shutdown.clone();
        let addr = settings.bind_addr;
        tokio::spawn(async move {
            let result = run_https(addr, tls_config, router, shutdown.clone()).await;
            shutdown.cancel();
            result
        })
    };

    let admin = {
        let shutdown = shutdown.clone();
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let result = run_admin(registry, ready, shutdown.clone()).await;
            shutdown.cancel();
            result
        })
    };

    let (server_result, admin_result, engine_result, refresh_result) =
        tokio::join!(server, admin, engine, refresh);

    engine_result.map_err(|e| Error::config(format!("watch engine task panicked: {e}")))?;
    refresh_result.map_err(|e| Error::config(format!("certificate refresh task panicked: {e}")))?;
    admin_result.map_err(|e| Error::config(format!("admin task panicked: {e}")))??;
    server_result.map_err(|e| Error::config(format!("server task panicked: {e}")))??;

    info!("shutdown complete");
    Ok(())
}

async fn build_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::config(format!("cannot read kubeconfig: {e}")))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("cannot load kubeconfig: {e}")))?
        }
        None => kube::Config::infer()
            .await
            .map_err(|e| Error::config(format!("cannot infer kube config: {e}")))?,
    };
    Ok(Client::try_from(config)?)
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(error) => {
                warn!(%error, "cannot listen for SIGTERM");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        shutdown.cancel();
    });
}

/// Flip the readiness flag once the initial label-selected lists of both
/// watched resource kinds succeed.
async fn wait_for_initial_sync(
    client: Client,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), garden::ISSUER_NAMESPACE);
    let configmaps: Api<ConfigMap> = Api::all(client);
    let secret_params = ListParams::default()
        .labels(&garden::openid_secret_selector())
        .limit(1);
    let configmap_params = ListParams::default()
        .labels(&garden::shoot_ca_selector())
        .limit(1);

    loop {
        let lists = tokio::try_join!(
            secrets.list_metadata(&secret_params),
            configmaps.list_metadata(&configmap_params)
        );
        match lists {
            Ok(_) => {
                ready.store(true, Ordering::Relaxed);
                info!("initial resource lists succeeded, marking ready");
                return;
            }
            Err(error) => warn!(%error, "initial resource list failed, retrying"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(SYNC_RETRY_DELAY) => {}
        }
    }
}

async fn run_https(
    addr: SocketAddr,
    tls_config: RustlsConfig,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("shutting down discovery server");
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });
    }

    info!(%addr, "discovery server listening");
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    info!("discovery server stopped listening");
    Ok(())
}

async fn run_admin(
    registry: Arc<Registry>,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let metrics_router = Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(registry);
    let health_router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(ready);

    let metrics_listener =
        tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], METRICS_PORT))).await?;
    let health_listener =
        tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], HEALTH_PORT))).await?;
    info!(metrics_port = METRICS_PORT, health_port = HEALTH_PORT, "admin endpoints listening");

    let metrics_shutdown = shutdown.clone();
    let metrics_server = async move {
        axum::serve(metrics_listener, metrics_router)
            .with_graceful_shutdown(async move { metrics_shutdown.cancelled().await })
            .await
    };
    let health_server = async move {
        axum::serve(health_listener, health_router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    };

    tokio::try_join!(metrics_server, health_server)?;
    Ok(())
}

async fn serve_metrics(State(registry): State<Arc<Registry>>) -> Response {
    let mut body = String::new();
    match text::encode(&mut body, &registry) {
        Ok(()) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(ready): State<Arc<AtomicBool>>) -> Response {
    if ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "informers not synced").into_response()
    }
}
