use crate::cancel::CancelToken;
use crate::config::PluginConfig;
use crate::context::{Executable, QueryContext};
use crate::plugin::Plugin;
use crate::types::rcode_to_str;
use anyhow::Result;
use std::sync::Arc;

pub struct LogPlugin {
    outcome: Arc<LogOutcome>,
}

/// Logs how the query ended once the pipeline has finished with it.
struct LogOutcome;

#[async_trait::async_trait]
impl Executable for LogOutcome {
    async fn exec(&self, _cancel: &CancelToken, ctx: &mut QueryContext) -> Result<()> {
        let rcode = ctx.response().map(|r| rcode_to_str(r.rcode())).unwrap_or("-");
        tracing::info!(
            "<= [Finished] status: {}, rcode: {}, took {:.4}s",
            ctx.status(), rcode, ctx.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl Plugin for LogPlugin {
    fn name(&self) -> &str { "log" }
    fn from_config(config: &PluginConfig) -> Result<Self> {
        tracing::info!("[log] Initialized for zones: {:?}", config.args);
        Ok(Self { outcome: Arc::new(LogOutcome) })
    }
    async fn process(&self, ctx: &mut QueryContext) -> Result<()> {
        match ctx.client_addr() {
            Some(client) => tracing::info!("=> [Incoming Query] TxID: {:#06x} from {}", ctx.query().id(), client),
            None => tracing::info!("=> [Incoming Query] TxID: {:#06x}", ctx.query().id()),
        }
        ctx.defer_exec(self.outcome.clone());
        Ok(())
    }
    fn priority(&self) -> u8 { 255 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextStatus;
    use crate::types::{DnsMessage, DnsQuestion, QClass, QType};

    #[tokio::test]
    async fn test_log_defers_outcome_and_leaves_status() {
        let plugin = LogPlugin::from_config(&PluginConfig { name: "log".into(), args: vec![], block: vec![] }).unwrap();
        let q = DnsMessage::query(9, vec![DnsQuestion { name: "a.".into(), qtype: QType::A, qclass: QClass::IN }]);
        let mut ctx = QueryContext::new(q, Some("10.0.0.1:4000".parse().unwrap()));

        plugin.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.pending_defers(), 1);
        assert_eq!(ctx.status(), ContextStatus::WAITING_RESPONSE);

        ctx.drain_defers(&CancelToken::never()).await.unwrap();
        assert_eq!(ctx.pending_defers(), 0);
    }
}
