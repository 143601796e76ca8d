//! Prometheus metrics for the tessera backend core
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;
use tracing::error;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Tessera metrics collection.
///
/// If the collectors cannot be registered every `record_*` call is a no-op and `gather`
/// returns an empty exposition.
pub struct Metrics {
    inner: Option<Collectors>,
}

struct Collectors {
    registry: Registry,

    /// Backend response events by kind (ok, error, fields_end, row, row_end)
    backend_events_total: IntCounterVec,

    // Statement metrics
    /// Invocations by handler kind (single, multi, commit, rollback)
    statements_total: IntCounterVec,
    /// Invocations that ended in a client-visible error
    statement_errors_total: IntCounterVec,
    /// Statements kept by a slow-statement recorder
    slow_statements_total: IntCounter,

    // Health metrics
    /// Heartbeat results by status
    heartbeat_total: IntCounterVec,
    /// Active-source switches by data node
    datanode_switch_total: IntCounterVec,
}

impl Collectors {
    fn build() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let backend_events_total = IntCounterVec::new(
            Opts::new(
                "tessera_backend_events_total",
                "Backend response events delivered to handlers",
            ),
            &["event"],
        )?;

        let statements_total = IntCounterVec::new(
            Opts::new("tessera_statements_total", "Statements dispatched to backends"),
            &["kind"],
        )?;

        let statement_errors_total = IntCounterVec::new(
            Opts::new(
                "tessera_statement_errors_total",
                "Statements answered with an error",
            ),
            &["kind"],
        )?;

        let slow_statements_total = IntCounter::new(
            "tessera_slow_statements_total",
            "Statements recorded as slow",
        )?;

        let heartbeat_total = IntCounterVec::new(
            Opts::new("tessera_heartbeat_total", "Heartbeat results by status"),
            &["status"], // ok, error, off, timeout
        )?;

        let datanode_switch_total = IntCounterVec::new(
            Opts::new(
                "tessera_datanode_switch_total",
                "Active data source switches",
            ),
            &["node"],
        )?;

        registry.register(Box::new(backend_events_total.clone()))?;
        registry.register(Box::new(statements_total.clone()))?;
        registry.register(Box::new(statement_errors_total.clone()))?;
        registry.register(Box::new(slow_statements_total.clone()))?;
        registry.register(Box::new(heartbeat_total.clone()))?;
        registry.register(Box::new(datanode_switch_total.clone()))?;

        Ok(Self {
            registry,
            backend_events_total,
            statements_total,
            statement_errors_total,
            slow_statements_total,
            heartbeat_total,
            datanode_switch_total,
        })
    }
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let inner = match Collectors::build() {
            Ok(c) => Some(c),
            Err(e) => {
                error!(error = %e, "Failed to register metrics, metrics disabled");
                None
            }
        };
        Self { inner }
    }

    pub fn record_backend_event(&self, event: &str) {
        if let Some(m) = &self.inner {
            m.backend_events_total.with_label_values(&[event]).inc();
        }
    }

    pub fn record_statement(&self, kind: &str) {
        if let Some(m) = &self.inner {
            m.statements_total.with_label_values(&[kind]).inc();
        }
    }

    pub fn record_statement_error(&self, kind: &str) {
        if let Some(m) = &self.inner {
            m.statement_errors_total.with_label_values(&[kind]).inc();
        }
    }

    pub fn record_slow_statement(&self) {
        if let Some(m) = &self.inner {
            m.slow_statements_total.inc();
        }
    }

    /// Record a heartbeat result
    pub fn record_heartbeat(&self, status: &str) {
        if let Some(m) = &self.inner {
            m.heartbeat_total.with_label_values(&[status]).inc();
        }
    }

    pub fn record_switch(&self, node: &str) {
        if let Some(m) = &self.inner {
            m.datanode_switch_total.with_label_values(&[node]).inc();
        }
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let Some(m) = &self.inner else {
            return String::new();
        };
        let encoder = prometheus::TextEncoder::new();
        let metric_families = m.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::info;

    fn reply(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static(content_type),
        );
        response
    }

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        Ok(match req.uri().path() {
            "/metrics" => reply(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                metrics().gather(),
            ),
            "/health" => reply(StatusCode::OK, "text/plain", "OK".to_string()),
            _ => reply(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
        })
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
