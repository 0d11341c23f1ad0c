//! Prometheus metrics HTTP endpoint
//!
//! Exposes monitor metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server. Scrapes are side-effect free: the
//! endpoint reads cumulative counters and gauges only, so the periodic
//! log reporter keeps sole ownership of the interval counters.

use crate::infra::metrics::{Metrics, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with unit label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    unit: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{unit=\"{unit}\"}} {val}");
}

/// Write a gauge metric with f64 value
fn write_gauge_f64(output: &mut String, name: &str, help: &str, unit: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{unit=\"{unit}\"}} {val:.2}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    unit: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{unit=\"{unit}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{unit=\"{unit}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{unit=\"{unit}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{unit=\"{unit}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, unit_id: &str) -> String {
    let mut output = String::with_capacity(4096);

    write_sample_metrics(&mut output, unit_id, metrics);
    write_latency_metrics(&mut output, unit_id, metrics);
    write_state_metrics(&mut output, unit_id, metrics);

    output
}

fn write_sample_metrics(output: &mut String, unit: &str, metrics: &Metrics) {
    write_metric(
        output,
        "speedwatch_samples_total",
        "Total position samples evaluated",
        MetricType::Counter,
        unit,
        metrics.samples_total(),
    );
    write_metric(
        output,
        "speedwatch_samples_clamped_total",
        "Samples snapped to standstill by the noise floor",
        MetricType::Counter,
        unit,
        metrics.samples_clamped_total(),
    );
    write_metric(
        output,
        "speedwatch_samples_dropped_total",
        "Samples dropped due to channel full",
        MetricType::Counter,
        unit,
        metrics.samples_dropped_total(),
    );
    write_metric(
        output,
        "speedwatch_invalid_sentences_total",
        "Receiver sentences rejected by checksum or parse",
        MetricType::Counter,
        unit,
        metrics.invalid_sentences_total(),
    );
}

fn write_latency_metrics(output: &mut String, unit: &str, metrics: &Metrics) {
    let (lat_buckets, lat_sum_us) = metrics.latency_histogram();
    write_histogram(
        output,
        "speedwatch_sample_latency_us",
        "Sample processing latency in microseconds",
        unit,
        &lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        lat_sum_us,
    );

    write_metric(
        output,
        "speedwatch_sample_latency_p50_us",
        "50th percentile sample latency",
        MetricType::Gauge,
        unit,
        metrics.latency_percentile(0.50),
    );
    write_metric(
        output,
        "speedwatch_sample_latency_p95_us",
        "95th percentile sample latency",
        MetricType::Gauge,
        unit,
        metrics.latency_percentile(0.95),
    );
    write_metric(
        output,
        "speedwatch_sample_latency_p99_us",
        "99th percentile sample latency",
        MetricType::Gauge,
        unit,
        metrics.latency_percentile(0.99),
    );
}

fn write_state_metrics(output: &mut String, unit: &str, metrics: &Metrics) {
    write_gauge_f64(
        output,
        "speedwatch_speed_kmh",
        "Current evaluated speed in km/h",
        unit,
        metrics.speed_kmh(),
    );
    write_gauge_f64(
        output,
        "speedwatch_speed_limit_kmh",
        "Currently selected speed limit in km/h",
        unit,
        metrics.limit_kmh(),
    );
    write_metric(
        output,
        "speedwatch_speeding",
        "Whether current speed exceeds the limit (0/1)",
        MetricType::Gauge,
        unit,
        u64::from(metrics.speeding()),
    );
    write_metric(
        output,
        "speedwatch_permission_state",
        "Location permission (0=unknown 1=service_disabled 2=denied 3=denied_forever 4=granted)",
        MetricType::Gauge,
        unit,
        metrics.permission_state(),
    );
    write_metric(
        output,
        "speedwatch_overspeed_transitions_total",
        "Times the overspeed flag flipped on",
        MetricType::Counter,
        unit,
        metrics.overspeed_transitions_total(),
    );
    write_metric(
        output,
        "speedwatch_limit_changes_total",
        "Speed limit selections applied",
        MetricType::Counter,
        unit,
        metrics.limit_changes_total(),
    );
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    unit_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &unit_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    unit_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let unit_id = Arc::new(unit_id);

    info!(port = %port, unit = %unit_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let unit_id = unit_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let unit_id = unit_id.clone();
                                async move { handle_request(req, metrics, unit_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
