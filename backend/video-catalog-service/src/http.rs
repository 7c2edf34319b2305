//! Operational HTTP surface: liveness, readiness and Prometheus metrics.

use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures::future::BoxFuture;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::{CatalogStore, ProjectionStore};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

type PingFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// A named dependency check run by `/ready`.
#[derive(Clone)]
pub struct ReadinessProbe {
    name: String,
    ping: PingFn,
}

impl ReadinessProbe {
    pub fn new<F>(name: impl Into<String>, ping: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            ping: Arc::new(ping),
        }
    }

    pub fn catalog<C: CatalogStore>(store: Arc<C>) -> Self {
        Self::new("catalog", move || {
            let store = Arc::clone(&store);
            Box::pin(async move { store.ping().await.map_err(|e| e.to_string()) })
        })
    }

    pub fn projection<P: ProjectionStore>(store: Arc<P>) -> Self {
        Self::new("projection", move || {
            let store = Arc::clone(&store);
            Box::pin(async move { store.ping().await.map_err(|e| e.to_string()) })
        })
    }
}

pub struct HealthState {
    probes: Vec<ReadinessProbe>,
    registry: Registry,
}

impl HealthState {
    pub fn new(probes: Vec<ReadinessProbe>, registry: Registry) -> Self {
        Self { probes, registry }
    }
}

#[derive(Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ComponentStatus {
    Healthy,
    Unhealthy,
}

#[derive(Serialize)]
struct ComponentCheck {
    status: ComponentStatus,
    message: String,
    latency_ms: u64,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    status: ComponentStatus,
    checks: HashMap<String, ComponentCheck>,
    timestamp: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(liveness))
        .route("/ready", web::get().to(readiness))
        .route("/metrics", web::get().to(metrics));
}

async fn liveness() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "video-catalog-service",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness(state: web::Data<HealthState>) -> HttpResponse {
    let mut checks = HashMap::new();
    let mut ready = true;

    for probe in &state.probes {
        let start = Instant::now();
        let result = match tokio::time::timeout(PROBE_TIMEOUT, (probe.ping)()).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {PROBE_TIMEOUT:?}")),
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        let check = match result {
            Ok(()) => ComponentCheck {
                status: ComponentStatus::Healthy,
                message: format!("{} reachable", probe.name),
                latency_ms,
            },
            Err(e) => {
                ready = false;
                tracing::warn!(component = %probe.name, error = %e, "Readiness check failed");
                ComponentCheck {
                    status: ComponentStatus::Unhealthy,
                    message: format!("{} check failed: {}", probe.name, e),
                    latency_ms,
                }
            }
        };
        checks.insert(probe.name.clone(), check);
    }

    let response = ReadinessResponse {
        ready,
        status: if ready {
            ComponentStatus::Healthy
        } else {
            ComponentStatus::Unhealthy
        },
        checks,
        timestamp: Utc::now().to_rfc3339(),
    };

    if ready {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

async fn metrics(state: web::Data<HealthState>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryCatalog, MemoryProjectionStore};
    use actix_web::{test, App};

    fn state(projection: Arc<MemoryProjectionStore>, registry: Registry) -> web::Data<HealthState> {
        web::Data::new(HealthState::new(
            vec![
                ReadinessProbe::catalog(Arc::new(MemoryCatalog::new())),
                ReadinessProbe::projection(projection),
            ],
            registry,
        ))
    }

    #[actix_web::test]
    async fn test_health_is_ok() {
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(MemoryProjectionStore::new()), Registry::new()))
                .configure(configure),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_ready_reports_unhealthy_component() {
        let projection = Arc::new(MemoryProjectionStore::new());
        projection.set_unavailable(true);
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::clone(&projection), Registry::new()))
                .configure(configure),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/ready").to_request()).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["ready"], false);
        assert_eq!(body["checks"]["catalog"]["status"], "healthy");
        assert_eq!(body["checks"]["projection"]["status"], "unhealthy");
    }

    #[actix_web::test]
    async fn test_metrics_renders_registry() {
        let registry = Registry::new();
        let counter = prometheus::IntCounter::new("catalog_test_total", "test counter").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(MemoryProjectionStore::new()), registry))
                .configure(configure),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
        assert!(resp.status().is_success());
        let body = test::read_body(resp).await;
        assert!(String::from_utf8_lossy(&body).contains("catalog_test_total 1"));
    }
}
