use crate::cancel::CancelToken;
use crate::config::PluginConfig;
use crate::context::{ContextStatus, Executable, QueryContext};
use crate::plugin::prometheus::PROXY_REQUEST_DURATION;
use crate::plugin::{parse_duration, Plugin};
use crate::types::{rcode_to_str, DnsMessage};
use anyhow::{anyhow, Context, Result};
use futures::future::{select_ok, BoxFuture, FutureExt};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Policy { Sequential, Random, Parallel }

pub struct ForwardPlugin {
    pub upstreams: Vec<SocketAddr>,
    pub policy: Policy,
    pub timeout: Duration,
}

/// Per-upstream latency, recorded when the winning branch's defers are drained.
struct RecordExchange {
    upstream: SocketAddr,
    rcode: u8,
    took: Duration,
}

#[async_trait::async_trait]
impl Executable for RecordExchange {
    async fn exec(&self, cancel: &CancelToken, _ctx: &mut QueryContext) -> Result<()> {
        // shutting down, the latency of this exchange is no longer interesting
        if cancel.is_cancelled() { return Ok(()); }
        PROXY_REQUEST_DURATION
            .with_label_values(&[rcode_to_str(self.rcode), &self.upstream.to_string()])
            .observe(self.took.as_secs_f64());
        Ok(())
    }
}

#[async_trait::async_trait]
impl Plugin for ForwardPlugin {
    fn name(&self) -> &str { "forward" }

    fn from_config(config: &PluginConfig) -> Result<Self> {
        let mut upstreams = Vec::new();
        for arg in &config.args {
            if arg == "." || arg == "{}" { continue; }
            let addr = if arg.contains(':') && !arg.starts_with('[') && arg.matches(':').count() > 1 {
                // bare IPv6 address
                format!("[{}]:53", arg)
            } else if arg.contains(':') {
                arg.clone()
            } else {
                format!("{}:53", arg)
            };
            upstreams.push(addr.parse::<SocketAddr>().with_context(|| format!("forward: bad upstream '{}'", arg))?);
        }
        if upstreams.is_empty() { anyhow::bail!("forward: no upstreams configured"); }

        let mut policy = Policy::Random;
        let mut exchange_timeout = Duration::from_secs(2);
        for sub in &config.block {
            match sub.name.as_str() {
                "timeout" => {
                    if let Some(a) = sub.args.first() { exchange_timeout = parse_duration(a)?; }
                }
                "policy" => {
                    if let Some(p) = sub.args.first() {
                        policy = match p.as_str() {
                            "sequential" => Policy::Sequential,
                            "parallel" => Policy::Parallel,
                            _ => Policy::Random,
                        };
                    }
                }
                _ => {}
            }
        }

        tracing::info!("[forward] {} upstream(s), policy {:?}, timeout {:?}", upstreams.len(), policy, exchange_timeout);
        Ok(Self { upstreams, policy, timeout: exchange_timeout })
    }

    async fn process(&self, ctx: &mut QueryContext) -> Result<()> {
        match self.policy {
            Policy::Parallel => self.race(ctx).await,
            Policy::Sequential => self.in_order(ctx, self.upstreams.clone()).await,
            Policy::Random => {
                let mut order = self.upstreams.clone();
                order.shuffle(&mut rand::thread_rng());
                self.in_order(ctx, order).await
            }
        }
    }

    fn priority(&self) -> u8 { 100 }
}

impl ForwardPlugin {
    async fn in_order(&self, ctx: &mut QueryContext, order: Vec<SocketAddr>) -> Result<()> {
        for upstream in order {
            let start = Instant::now();
            match self.exchange(upstream, &ctx.query().raw).await {
                Ok(resp) => {
                    ctx.defer_exec(Arc::new(RecordExchange { upstream, rcode: resp.rcode(), took: start.elapsed() }));
                    tracing::info!("    |-- [forward] {} answered {} in {:.4}s", upstream, rcode_to_str(resp.rcode()), start.elapsed().as_secs_f64());
                    ctx.set_response(Some(resp), ContextStatus::RESPONDED);
                    return Ok(());
                }
                Err(e) => tracing::warn!("    |-- [forward] {} failed: {:#}", upstream, e),
            }
        }
        Err(anyhow!("all {} upstream(s) failed", self.upstreams.len()))
    }

    /// Query every upstream at once, each on its own fork of the context.
    /// The first successful branch wins and its response and defers are
    /// taken over by `ctx`.
    async fn race(&self, ctx: &mut QueryContext) -> Result<()> {
        if self.upstreams.is_empty() { anyhow::bail!("no upstreams to race"); }
        let origin: &QueryContext = ctx;
        let branches: Vec<BoxFuture<'_, Result<QueryContext>>> = self.upstreams.iter()
            .map(|&upstream| {
                let mut branch = origin.fork();
                branch.adopt_defers_from(origin);
                async move {
                    let start = Instant::now();
                    let resp = self.exchange(upstream, &branch.query().raw).await
                        .with_context(|| format!("upstream {}", upstream))?;
                    branch.defer_exec(Arc::new(RecordExchange { upstream, rcode: resp.rcode(), took: start.elapsed() }));
                    branch.set_response(Some(resp), ContextStatus::RESPONDED);
                    Ok(branch)
                }
                .boxed()
            })
            .collect();

        let (winner, _losers) = select_ok(branches).await?;
        tracing::info!("    |-- [forward] parallel exchange won in {:.4}s", winner.elapsed().as_secs_f64());
        ctx.adopt_defers_from(&winner);
        ctx.set_response(winner.response().cloned(), winner.status());
        Ok(())
    }

    async fn exchange(&self, upstream: SocketAddr, query: &[u8]) -> Result<DnsMessage> {
        let bind = if upstream.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(upstream).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; 4096];
        let n = timeout(self.timeout, socket.recv(&mut buf)).await
            .map_err(|_| anyhow!("timed out after {:?}", self.timeout))??;
        DnsMessage::from_wire(&buf[..n])
    }
}
