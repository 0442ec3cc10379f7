use crate::config::PluginConfig;
use crate::context::{ContextStatus, QueryContext};
use crate::plugin::Plugin;
use crate::types::{DnsMessage, QType, RCODE_NOERROR};
use anyhow::Result;
use std::net::IpAddr;

/// Answers A/AAAA queries with the address the query came from.
pub struct WhoamiPlugin;

#[async_trait::async_trait]
impl Plugin for WhoamiPlugin {
    fn name(&self) -> &str { "whoami" }

    fn from_config(_config: &PluginConfig) -> Result<Self> {
        tracing::info!("[whoami] Plugin initialized");
        Ok(Self)
    }

    async fn process(&self, ctx: &mut QueryContext) -> Result<()> {
        let Some(client) = ctx.client_addr() else {
            tracing::debug!("[whoami] No client address available, skipping");
            return Ok(());
        };
        let [question] = ctx.query().questions.as_slice() else { return Ok(()) };
        if question.qtype != QType::A && question.qtype != QType::AAAA { return Ok(()); }

        // header and question echoed, the client address goes into the additional section
        let mut resp = ctx.query().reply_with_rcode(RCODE_NOERROR).raw;
        resp[2] |= 0x04;
        resp[10..12].copy_from_slice(&1u16.to_be_bytes());

        resp.extend_from_slice(&[0xC0, 0x0C]);
        match client.ip() {
            IpAddr::V4(ipv4) => {
                resp.extend_from_slice(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04]);
                resp.extend_from_slice(&ipv4.octets());
            }
            IpAddr::V6(ipv6) => {
                resp.extend_from_slice(&[0x00, 0x1C, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10]);
                resp.extend_from_slice(&ipv6.octets());
            }
        }

        ctx.set_response(Some(DnsMessage::from_wire(&resp)?), ContextStatus::RESPONDED);
        tracing::info!("    |-- [whoami] Responded to client {}", client);
        Ok(())
    }

    fn priority(&self) -> u8 { 200 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DnsQuestion, QClass};
    use std::net::SocketAddr;

    fn ctx(qtype: QType, client: Option<&str>) -> QueryContext {
        let q = DnsMessage::query(0x0A0B, vec![DnsQuestion { name: "whoami.test.".into(), qtype, qclass: QClass::IN }]);
        QueryContext::new(q, client.map(|c| c.parse::<SocketAddr>().unwrap()))
    }

    #[tokio::test]
    async fn test_answers_with_ipv4_client() {
        let mut c = ctx(QType::A, Some("192.0.2.7:5300"));
        WhoamiPlugin.process(&mut c).await.unwrap();

        assert_eq!(c.status(), ContextStatus::RESPONDED);
        let resp = c.response().unwrap();
        assert_eq!(resp.id(), 0x0A0B);
        assert!(resp.header.flags.qr && resp.header.flags.aa);
        assert_eq!(resp.header.additional_count, 1);
        assert_eq!(&resp.raw[resp.raw.len() - 4..], &[192, 0, 2, 7]);
    }

    #[tokio::test]
    async fn test_answers_with_ipv6_client() {
        let mut c = ctx(QType::AAAA, Some("[2001:db8::1]:53"));
        WhoamiPlugin.process(&mut c).await.unwrap();
        let raw = &c.response().unwrap().raw;
        let expected = "2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap().octets();
        assert_eq!(&raw[raw.len() - 16..], &expected[..]);
    }

    #[tokio::test]
    async fn test_skips_other_types_and_unknown_clients() {
        let mut mx = ctx(QType::MX, Some("192.0.2.7:5300"));
        WhoamiPlugin.process(&mut mx).await.unwrap();
        assert!(mx.status().is_waiting());

        let mut anon = ctx(QType::A, None);
        WhoamiPlugin.process(&mut anon).await.unwrap();
        assert!(anon.response().is_none());
    }
}
