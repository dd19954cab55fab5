//! Controller metrics
//!
//! Everything lives in one registry, served as plain text on `/metrics` when
//! a bind address is configured. Relationship index counters are kept as
//! atomics and appended at scrape time.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::graph::RelationIndex;

lazy_static! {
    pub static ref LBSYNC_METRICS_REGISTRY: Registry = Registry::new();

    /// Reconcile pass duration
    static ref RECONCILE_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "lbsync_reconcile_duration_seconds",
            "Duration of one model reconcile pass in seconds",
        );
        let histogram = HistogramVec::new(opts, &["layer", "result"])
            .expect("Failed to create histogram");
        LBSYNC_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    static ref REMOTE_OPS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "lbsync_remote_ops_total",
            "Write operations sent to the remote controller",
        );
        let counter = IntCounterVec::new(opts, &["method", "obj_type", "result"])
            .expect("Failed to create counter");
        LBSYNC_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    static ref REMOTE_OP_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "lbsync_remote_op_duration_seconds",
            "Remote controller write latency in seconds",
        );
        let histogram = HistogramVec::new(opts, &["method", "obj_type"])
            .expect("Failed to create histogram");
        LBSYNC_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    static ref RETRIES_TOTAL: IntCounterVec = {
        let opts = Opts::new("lbsync_retries_total", "Failed reconciles routed to a retry tier");
        let counter = IntCounterVec::new(opts, &["tier"])
            .expect("Failed to create counter");
        LBSYNC_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    static ref FULL_SYNCS_TOTAL: IntCounterVec = {
        let opts = Opts::new("lbsync_full_syncs_total", "Full sync sweeps");
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create counter");
        LBSYNC_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    static ref QUEUE_DEPTH: IntGaugeVec = {
        let opts = Opts::new("lbsync_queue_depth", "Keys waiting in each layer's queue");
        let gauge = IntGaugeVec::new(opts, &["queue"])
            .expect("Failed to create gauge");
        LBSYNC_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };
}

pub fn record_remote_op(method: &str, obj_type: &str, result: &str, duration_secs: f64) {
    REMOTE_OPS_TOTAL
        .with_label_values(&[method, obj_type, result])
        .inc();
    REMOTE_OP_DURATION
        .with_label_values(&[method, obj_type])
        .observe(duration_secs);
}

pub fn record_reconcile(layer: &str, result: &str, duration_secs: f64) {
    RECONCILE_DURATION
        .with_label_values(&[layer, result])
        .observe(duration_secs);
}

pub fn record_retry(tier: &str) {
    RETRIES_TOTAL.with_label_values(&[tier]).inc();
}

pub fn record_full_sync(result: &str) {
    FULL_SYNCS_TOTAL.with_label_values(&[result]).inc();
}

pub fn set_queue_depth(queue: &str, depth: i64) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
}

/// Encode the registry in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = LBSYNC_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

async fn handle(req: Request<Incoming>, relations: Arc<RelationIndex>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if *req.method() != Method::GET || req.uri().path() != "/metrics" {
        return Ok(respond(StatusCode::NOT_FOUND, "not found\n".to_string()));
    }
    match gather_metrics() {
        Ok(mut body) => {
            body.push_str(&relations.metrics().to_prometheus());
            Ok(respond(StatusCode::OK, body))
        }
        Err(e) => {
            error!("{}", e);
            Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

/// Serve `/metrics` on `bind_addr` until cancelled
pub async fn serve_metrics(
    bind_addr: String,
    relations: Arc<RelationIndex>,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Metrics endpoint listening on {}", bind_addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error on {}: {}", bind_addr, e);
                        continue;
                    }
                };
                let relations = relations.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, relations.clone()));
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("Metrics connection from {} failed: {}", peer, e);
                    }
                });
            }
        }
    }
    info!("Metrics endpoint on {} stopped", bind_addr);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_series_are_gathered() {
        record_remote_op("POST", "pool", "ok", 0.01);
        record_reconcile("reconcile", "converged", 0.2);
        record_retry("fast");
        record_full_sync("ok");
        set_queue_depth("metrics_probe", 3);

        let text = gather_metrics().unwrap();
        assert!(text.contains("lbsync_remote_ops_total"), "missing remote ops:\n{}", text);
        assert!(text.contains("lbsync_reconcile_duration_seconds"));
        assert!(text.contains("lbsync_retries_total{tier=\"fast\"}"));
        assert!(text.contains("lbsync_full_syncs_total{result=\"ok\"}"));
        assert!(text.contains("lbsync_queue_depth{queue=\"metrics_probe\"} 3"));
    }
}
