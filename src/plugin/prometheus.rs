use crate::cancel::CancelToken;
use crate::config::PluginConfig;
use crate::context::{Executable, QueryContext};
use crate::plugin::Plugin;
use crate::types::rcode_to_str;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use prometheus::{
    IntCounterVec, HistogramVec, GaugeVec,
    register_int_counter_vec, register_histogram_vec, register_gauge_vec,
};
use lazy_static::lazy_static;

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsctx_dns_requests_total",
        "Counter of DNS requests per address family and query type.",
        &["family", "type"]
    ).unwrap();

    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsctx_dns_responses_total",
        "Counter of finished queries by context status and response code.",
        &["status", "rcode"]
    ).unwrap();

    pub static ref DNS_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "dnsctx_dns_request_duration_seconds",
        "Histogram of the time (in seconds) each query spent in the pipeline.",
        &["status"],
        vec![0.00025, 0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096, 8.192]
    ).unwrap();

    pub static ref DNS_REQUEST_SIZE: HistogramVec = register_histogram_vec!(
        "dnsctx_dns_request_size_bytes",
        "Size of the query in bytes.",
        &["family"],
        vec![0.0, 100.0, 200.0, 300.0, 400.0, 511.0, 1023.0, 2047.0, 4095.0, 8291.0, 16000.0, 32000.0, 48000.0, 64000.0]
    ).unwrap();

    pub static ref DNS_RESPONSE_SIZE: HistogramVec = register_histogram_vec!(
        "dnsctx_dns_response_size_bytes",
        "Size of the returned response in bytes.",
        &["status"],
        vec![0.0, 100.0, 200.0, 300.0, 400.0, 511.0, 1023.0, 2047.0, 4095.0, 8291.0, 16000.0, 32000.0, 48000.0, 64000.0]
    ).unwrap();

    pub static ref PROXY_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "dnsctx_proxy_request_duration_seconds",
        "Histogram of the time each upstream exchange took.",
        &["rcode", "to"],
        vec![0.00025, 0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096, 8.192]
    ).unwrap();

    pub static ref BUILD_INFO: GaugeVec = register_gauge_vec!(
        "dnsctx_build_info",
        "A metric with a constant '1' value labeled by version.",
        &["version"]
    ).unwrap();
}

pub struct PrometheusPlugin {
    recorder: Arc<RecordOutcome>,
    _handle: tokio::task::JoinHandle<()>,
}

/// Records duration and outcome counters when the query's defers are drained.
struct RecordOutcome;

#[async_trait::async_trait]
impl Executable for RecordOutcome {
    async fn exec(&self, _cancel: &CancelToken, ctx: &mut QueryContext) -> Result<()> {
        let status = ctx.status().to_string();
        DNS_REQUEST_DURATION.with_label_values(&[&status]).observe(ctx.elapsed().as_secs_f64());

        let rcode = match ctx.response() {
            Some(resp) => {
                DNS_RESPONSE_SIZE.with_label_values(&[&status]).observe(resp.raw.len() as f64);
                rcode_to_str(resp.rcode())
            }
            None => "NONE",
        };
        DNS_RESPONSES_TOTAL.with_label_values(&[&status, rcode]).inc();
        Ok(())
    }
}

#[async_trait::async_trait]
impl Plugin for PrometheusPlugin {
    fn name(&self) -> &str { "prometheus" }

    fn from_config(config: &PluginConfig) -> Result<Self> {
        let listen = config.args.first().cloned().unwrap_or_else(|| ":9153".to_string());
        let addr = if listen.starts_with(':') {
            format!("0.0.0.0{}", listen)
        } else if !listen.contains(':') {
            format!("0.0.0.0:{}", listen)
        } else {
            listen
        };

        BUILD_INFO.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1.0);

        let handle = tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::info!("[prometheus] Successfully bound metrics listener on {}", addr);
                    while let Ok((stream, _)) = listener.accept().await {
                        tokio::spawn(serve_scrape(stream));
                    }
                }
                Err(_) => {
                    tracing::info!("[prometheus] Port {} is already active (shared with another zone).", addr);
                }
            }
        });

        Ok(Self { recorder: Arc::new(RecordOutcome), _handle: handle })
    }

    async fn process(&self, ctx: &mut QueryContext) -> Result<()> {
        let family = match ctx.client_addr() {
            Some(SocketAddr::V6(_)) => "2",
            _ => "1",
        };
        let qtype = match ctx.query().questions.first() {
            Some(q) => q.qtype.label(),
            None => "UNKNOWN",
        };

        DNS_REQUESTS_TOTAL.with_label_values(&[family, qtype]).inc();
        DNS_REQUEST_SIZE.with_label_values(&[family]).observe(ctx.query().raw.len() as f64);

        ctx.defer_exec(self.recorder.clone());
        Ok(())
    }

    fn priority(&self) -> u8 { 150 }
}

impl Drop for PrometheusPlugin {
    fn drop(&mut self) { self._handle.abort(); }
}

/// Text exposition of every registered collector.
pub fn render() -> Result<Vec<u8>> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

async fn serve_scrape(mut stream: tokio::net::TcpStream) {
    let mut buf = [0u8; 8192];
    let Ok(Ok(n)) = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf)).await else { return };
    if n == 0 || !buf.starts_with(b"GET ") { return; }

    let body = match render() {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("[prometheus] Failed to encode metrics: {}", e);
            return;
        }
    };
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);

    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), stream.write_all(&response)).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}
