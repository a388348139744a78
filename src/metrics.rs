use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::timeout,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("fars_requests_total", "Total requests by status class");
    let vec = IntCounterVec::new(opts, &["status"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fars_requests_total");
    vec
});

static REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "fars_request_duration_seconds",
        "Request latency by cache outcome",
    )
    .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]);
    let vec = HistogramVec::new(opts, &["cached"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fars_request_duration_seconds");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("fars_cache_lookup_total", "Cache probes by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fars_cache_lookup_total");
    vec
});

static ENCODE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("fars_encodes_total", "Variant encode invocations")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register fars_encodes_total");
    counter
});

static SWEEP_RUNS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("fars_cache_sweep_runs_total", "Sweeper passes completed")
            .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register fars_cache_sweep_runs_total");
    counter
});

static SWEEP_REMOVED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fars_cache_sweep_removed_total",
        "Cache files removed by the sweeper",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register fars_cache_sweep_removed_total");
    counter
});

static SWEEP_BYTES_RECLAIMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fars_cache_sweep_bytes_reclaimed_total",
        "Cache bytes reclaimed by the sweeper",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register fars_cache_sweep_bytes_reclaimed_total");
    counter
});

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

pub fn record_request(status: StatusCode, cached: bool, elapsed: Duration) {
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status.as_u16())])
        .inc();
    REQUEST_DURATION_SECONDS
        .with_label_values(&[if cached { "hit" } else { "miss" }])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    CACHE_LOOKUP_TOTAL
        .with_label_values(&[if hit { "hit" } else { "miss" }])
        .inc();
}

pub fn record_encode() {
    ENCODE_TOTAL.inc();
}

pub fn record_sweep(removed: u64, bytes_reclaimed: u64) {
    SWEEP_RUNS_TOTAL.inc();
    SWEEP_REMOVED_TOTAL.inc_by(removed);
    SWEEP_BYTES_RECLAIMED_TOTAL.inc_by(bytes_reclaimed);
}

fn render() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("encode metrics")?;
    Ok(buffer)
}

/// Serves the Prometheus text exposition on a dedicated plain-HTTP listener.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "metrics accept failed");
                continue;
            }
        };
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                match timeout(Duration::from_secs(5), reader.read_line(&mut line)).await {
                    Ok(Ok(0)) => return,
                    Ok(Ok(_)) if line == "\r\n" || line == "\n" => break,
                    Ok(Ok(_)) => continue,
                    _ => return,
                }
            }
            let body = match render() {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to render metrics");
                    return;
                }
            };
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let stream = reader.get_mut();
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
        });
    }
}
