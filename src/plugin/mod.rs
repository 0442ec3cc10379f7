pub mod block;
pub mod forward;
pub mod log;
pub mod prometheus;
pub mod whoami;

use anyhow::Result;
use std::time::Duration;
use crate::cancel::CancelToken;
use crate::config::PluginConfig;
use crate::context::{ContextStatus, QueryContext};

#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn from_config(config: &PluginConfig) -> Result<Self> where Self: Sized;
    /// Work that has to happen after the response is decided is registered
    /// on the context with `defer_exec` instead of being done here.
    async fn process(&self, ctx: &mut QueryContext) -> Result<()>;
    fn priority(&self) -> u8;
}

/// Ordered chain of plugins for one zone.
pub struct Pipeline {
    plugins: Vec<Box<dyn Plugin>>,
}

impl Pipeline {
    /// Plugins run from the highest priority down, regardless of the order
    /// they were configured in.
    pub fn new(mut plugins: Vec<Box<dyn Plugin>>) -> Self {
        plugins.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { plugins }
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Drive one query through the chain, then drain its deferred actions.
    ///
    /// The chain stops as soon as a plugin leaves the waiting state. A plugin
    /// error marks the query as server failed. Deferred actions are drained
    /// exactly once either way, and a drain failure is returned.
    pub async fn handle(&self, ctx: &mut QueryContext, cancel: &CancelToken) -> Result<()> {
        for plugin in &self.plugins {
            if !ctx.status().is_waiting() { break; }
            if let Err(e) = plugin.process(ctx).await {
                tracing::warn!("[{}] failed: {:#}", plugin.name(), e);
                ctx.set_response(None, ContextStatus::SERVER_FAILED);
                break;
            }
        }

        if let Err(e) = ctx.drain_defers(cancel).await {
            tracing::warn!("deferred action failed: {:#}", e);
            return Err(e);
        }
        Ok(())
    }
}

pub fn create_plugin(config: &PluginConfig) -> Result<Box<dyn Plugin>> {
    match config.name.as_str() {
        "block" => Ok(Box::new(block::BlockPlugin::from_config(config)?)),
        "forward" => Ok(Box::new(forward::ForwardPlugin::from_config(config)?)),
        "log" => Ok(Box::new(log::LogPlugin::from_config(config)?)),
        "prometheus" => Ok(Box::new(prometheus::PrometheusPlugin::from_config(config)?)),
        "whoami" => Ok(Box::new(whoami::WhoamiPlugin::from_config(config)?)),
        _ => anyhow::bail!("Unknown plugin: {}", config.name),
    }
}

pub(crate) fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix("ms") { Ok(Duration::from_millis(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('s') { Ok(Duration::from_secs(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('m') { Ok(Duration::from_secs(stripped.parse::<u64>()? * 60)) }
    else if let Some(stripped) = s.strip_suffix('h') { Ok(Duration::from_secs(stripped.parse::<u64>()? * 3600)) }
    else { anyhow::bail!("invalid duration") }
}
