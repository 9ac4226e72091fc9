//! Tracing setup and Prometheus metrics.

use std::convert::Infallible;
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global tracing subscriber with optional JSON file logging.
pub fn init_tracing(filter: &str, log_path: Option<&Path>) -> Result<()> {
    if let Some(path) = log_path {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::new(filter));
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {dir:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let _ = FILE_GUARD.set(guard);
        let file_layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_writer(writer)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .try_init()?;
    } else {
        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_filter(EnvFilter::new(filter));
        tracing_subscriber::registry()
            .with(stdout_layer)
            .try_init()?;
    }

    Ok(())
}

/// Prometheus counters and gauges collected by the server.
pub struct ServerMetrics {
    registry: Registry,
    orders_total: IntCounter,
    order_failures: IntCounter,
    webhook_messages: IntCounter,
    webhook_duplicates: IntCounter,
    quote_age: Gauge,
}

impl ServerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let orders_total =
            IntCounter::new("bullion_orders_total", "Orders opened by the engine").unwrap();
        let order_failures =
            IntCounter::new("bullion_order_failures_total", "Failed order attempts").unwrap();
        let webhook_messages = IntCounter::new(
            "bullion_webhook_messages_total",
            "Inbound webhook messages accepted",
        )
        .unwrap();
        let webhook_duplicates = IntCounter::new(
            "bullion_webhook_duplicates_total",
            "Webhook deliveries dropped by deduplication",
        )
        .unwrap();
        let quote_age = Gauge::new(
            "bullion_quote_age_seconds",
            "Age of the cached venue quote",
        )
        .unwrap();

        registry.register(Box::new(orders_total.clone())).unwrap();
        registry.register(Box::new(order_failures.clone())).unwrap();
        registry
            .register(Box::new(webhook_messages.clone()))
            .unwrap();
        registry
            .register(Box::new(webhook_duplicates.clone()))
            .unwrap();
        registry.register(Box::new(quote_age.clone())).unwrap();

        Self {
            registry,
            orders_total,
            order_failures,
            webhook_messages,
            webhook_duplicates,
            quote_age,
        }
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub fn inc_order(&self) {
        self.orders_total.inc();
    }

    pub fn inc_order_failure(&self) {
        self.order_failures.inc();
    }

    pub fn inc_webhook(&self) {
        self.webhook_messages.inc();
    }

    pub fn inc_webhook_duplicate(&self) {
        self.webhook_duplicates.inc();
    }

    pub fn update_quote_age(&self, seconds: f64) {
        self.quote_age.set(seconds);
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Launch a lightweight HTTP server that exposes Prometheus metrics.
pub fn spawn_metrics_server(registry: Registry, addr: SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                            error!(error = %err, "failed to encode Prometheus metrics");
                            return Ok::<_, Infallible>(
                                Response::builder()
                                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(Body::from("failed to encode metrics"))
                                    .unwrap(),
                            );
                        }
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .unwrap(),
                        )
                    }
                }))
            }
        });

        if let Err(err) = hyper::Server::bind(&addr).serve(make_svc).await {
            error!(error = %err, %addr, "metrics server terminated");
        } else {
            info!(%addr, "metrics server shutdown");
        }
    })
}
