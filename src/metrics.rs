//! Request metrics for the discovery routes.
//!
//! Every instrumented route is labelled by its matched path template and
//! reports a latency histogram, a total-by-code counter and an in-flight
//! gauge under the `gardener_discovery_server` prefix.

use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};

/// Prefix under which all server metrics are registered.
pub const SUBSYSTEM: &str = "gardener_discovery_server";

const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PathLabels {
    path: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PathCodeLabels {
    path: String,
    code: String,
}

/// Families of per-path request metrics.
#[derive(Clone)]
pub struct HttpMetrics {
    latency: Family<PathLabels, Histogram>,
    total: Family<PathCodeLabels, Counter>,
    in_flight: Family<PathLabels, Gauge>,
}

impl HttpMetrics {
    /// Register the metric families on the given registry.
    pub fn register(registry: &mut Registry) -> Self {
        let latency = Family::<PathLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(LATENCY_BUCKETS.iter().copied())
        });
        registry.register_with_unit(
            "path_latency",
            "Histogram of the latency of processing HTTP requests",
            Unit::Seconds,
            latency.clone(),
        );

        let total = Family::<PathCodeLabels, Counter>::default();
        registry.register(
            "path_requests",
            "Total number of HTTP requests by path and code",
            total.clone(),
        );

        let in_flight = Family::<PathLabels, Gauge>::default();
        registry.register(
            "path_requests_in_flight",
            "Number of currently served HTTP requests",
            in_flight.clone(),
        );

        Self {
            latency,
            total,
            in_flight,
        }
    }

    #[cfg(test)]
    fn requests_total(&self, path: &str, code: &str) -> u64 {
        self.total
            .get_or_create(&PathCodeLabels {
                path: path.to_string(),
                code: code.to_string(),
            })
            .get()
    }
}

/// Middleware recording request metrics for routes with a matched path.
///
/// Requests that did not match a route carry no path label and are not
/// recorded.
pub async fn track(
    State(metrics): State<HttpMetrics>,
    request: Request,
    next: Next,
) -> Response {
    let Some(path) = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
    else {
        return next.run(request).await;
    };

    let labels = PathLabels { path: path.clone() };
    metrics.in_flight.get_or_create(&labels).inc();
    let start = Instant::now();

    let response = next.run(request).await;

    metrics.in_flight.get_or_create(&labels).dec();
    metrics
        .latency
        .get_or_create(&labels)
        .observe(start.elapsed().as_secs_f64());
    metrics
        .total
        .get_or_create(&PathCodeLabels {
            path,
            code: response.status().as_u16().to_string(),
        })
        .inc();

    response
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use prometheus_client::encoding::text;
    use tower::ServiceExt;

    use super::*;

    fn instrumented(metrics: HttpMetrics) -> Router {
        Router::new()
            .route("/things/{id}", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(metrics, track))
    }

    #[tokio::test]
    async fn counts_requests_by_matched_path_and_code() {
        let mut registry = Registry::with_prefix(SUBSYSTEM);
        let metrics = HttpMetrics::register(&mut registry);
        let router = instrumented(metrics.clone());

        for _ in 0..3 {
            let response = router
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .uri("/things/42")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(metrics.requests_total("/things/{id}", "200"), 3);
    }

    #[tokio::test]
    async fn exposition_carries_the_subsystem_prefix() {
        let mut registry = Registry::with_prefix(SUBSYSTEM);
        let metrics = HttpMetrics::register(&mut registry);
        let router = instrumented(metrics);

        router
            .oneshot(
                HttpRequest::builder()
                    .uri("/things/1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let mut body = String::new();
        text::encode(&mut body, &registry).unwrap();
        assert!(body.contains("gardener_discovery_server_path_requests_total"));
        assert!(body.contains("gardener_discovery_server_path_latency_seconds"));
        assert!(body.contains("gardener_discovery_server_path_requests_in_flight"));
    }

    #[tokio::test]
    async fn unmatched_requests_are_not_recorded() {
        let mut registry = Registry::with_prefix(SUBSYSTEM);
        let metrics = HttpMetrics::register(&mut registry);
        let router = Router::new()
            .fallback(|| async { StatusCode::NOT_FOUND })
            .layer(axum::middleware::from_fn_with_state(metrics.clone(), track));

        router
            .oneshot(
                HttpRequest::builder()
                    .uri("/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(metrics.requests_total("/unknown", "404"), 0);
    }
}
