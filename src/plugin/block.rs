use crate::config::PluginConfig;
use crate::context::{ContextStatus, QueryContext};
use crate::plugin::Plugin;
use anyhow::{Context, Result};
use regex::Regex;

/// Ends matching queries with a fixed status.
///
/// `block refuse|drop|servfail [pattern...]`; without patterns every query
/// matches, otherwise a question name has to match one of the regexes.
pub struct BlockPlugin {
    status: ContextStatus,
    patterns: Vec<Regex>,
}

#[async_trait::async_trait]
impl Plugin for BlockPlugin {
    fn name(&self) -> &str { "block" }

    fn from_config(config: &PluginConfig) -> Result<Self> {
        let status = match config.args.first().map(String::as_str) {
            Some("refuse") => ContextStatus::REJECTED,
            Some("drop") => ContextStatus::DROPPED,
            Some("servfail") => ContextStatus::SERVER_FAILED,
            other => anyhow::bail!("block: expected refuse, drop or servfail, got {:?}", other),
        };
        let patterns = config.args.iter().skip(1)
            .map(|p| Regex::new(p).with_context(|| format!("block: bad pattern '{}'", p)))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("[block] Initialized ({} with {} patterns)", status, patterns.len());
        Ok(Self { status, patterns })
    }

    async fn process(&self, ctx: &mut QueryContext) -> Result<()> {
        let hit = self.patterns.is_empty()
            || ctx.query().questions.iter().any(|q| self.patterns.iter().any(|p| p.is_match(&q.name)));
        if hit {
            tracing::info!("    |-- [block] {}", self.status);
            ctx.set_response(None, self.status);
        }
        Ok(())
    }

    fn priority(&self) -> u8 { 180 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DnsMessage, DnsQuestion, QClass, QType};

    fn plugin(args: &[&str]) -> Result<BlockPlugin> {
        BlockPlugin::from_config(&PluginConfig {
            name: "block".into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            block: vec![],
        })
    }

    fn ctx(name: &str) -> QueryContext {
        let q = DnsMessage::query(1, vec![DnsQuestion { name: name.into(), qtype: QType::A, qclass: QClass::IN }]);
        QueryContext::new(q, None)
    }

    #[tokio::test]
    async fn test_blocks_everything_without_patterns() {
        let p = plugin(&["drop"]).unwrap();
        let mut c = ctx("anything.");
        p.process(&mut c).await.unwrap();
        assert_eq!(c.status(), ContextStatus::DROPPED);
        assert!(c.response().is_none());
    }

    #[tokio::test]
    async fn test_patterns_select_names() {
        let p = plugin(&["refuse", r"(^|\.)ads\.example\.$"]).unwrap();

        let mut hit = ctx("tracker.ads.example.");
        p.process(&mut hit).await.unwrap();
        assert_eq!(hit.status(), ContextStatus::REJECTED);

        let mut miss = ctx("example.org.");
        p.process(&mut miss).await.unwrap();
        assert!(miss.status().is_waiting());
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(plugin(&[]).is_err());
        assert!(plugin(&["allow"]).is_err());
        assert!(plugin(&["servfail", "("]).is_err());
        assert_eq!(plugin(&["servfail"]).unwrap().status, ContextStatus::SERVER_FAILED);
    }
}
