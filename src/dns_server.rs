use crate::cancel::{CancelHandle, CancelToken};
use crate::config::Config;
use crate::context::{ContextStatus, QueryContext};
use crate::plugin::Pipeline;
use crate::types::{DnsMessage, HEADER_LEN, RCODE_FORMERR, RCODE_REFUSED, RCODE_SERVFAIL};
use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::Instrument;

const MAX_UDP_RESPONSE: usize = 1232;

pub struct DnsServer {
    config: Arc<Config>,
}

impl DnsServer {
    pub fn new(config: Config) -> Self {
        Self { config: Arc::new(config) }
    }

    /// Serve every configured zone until `shutdown` flips to true.
    pub async fn run(&self, default_address: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // only the IP of the default address is used; ports come from the zones
        let base_ip = default_address.rsplit_once(':').map(|(ip, _)| ip).unwrap_or("0.0.0.0");

        // zones sharing a port share the listeners; the first zone's pipeline serves them
        let mut bind_map: HashMap<String, usize> = HashMap::new();
        for (i, zone) in self.config.zones.iter().enumerate() {
            bind_map.entry(format!("{}:{}", base_ip, zone.port())).or_insert(i);
        }

        let cancel = CancelHandle::new();
        let mut tasks = Vec::new();

        for (bind_addr, zone_idx) in bind_map {
            let udp_socket = match UdpSocket::bind(&bind_addr).await {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    tracing::error!("Failed to bind UDP {}: {}", bind_addr, e);
                    continue;
                }
            };
            let tcp_listener = match TcpListener::bind(&bind_addr).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to bind TCP {}: {}", bind_addr, e);
                    continue;
                }
            };
            tracing::info!(
                "Server bound to TCP & UDP on {} for zone {}",
                bind_addr, self.config.zones[zone_idx].name
            );

            let config = self.config.clone();
            let token = cancel.token();
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let Ok((size, src)) = udp_socket.recv_from(&mut buf).await else { continue };
                    let query = buf[..size].to_vec();
                    let config = config.clone();
                    let socket = udp_socket.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        let pipeline = &config.zones[zone_idx].pipeline;
                        if let Some(mut resp) = serve_query(pipeline, &query, src, &token).await {
                            if resp.len() > MAX_UDP_RESPONSE {
                                resp.truncate(MAX_UDP_RESPONSE);
                                resp[2] |= 0x02;
                            }
                            let _ = socket.send_to(&resp, src).await;
                        }
                    });
                }
            }));

            let config = self.config.clone();
            let token = cancel.token();
            tasks.push(tokio::spawn(async move {
                loop {
                    let Ok((mut stream, src)) = tcp_listener.accept().await else { continue };
                    let config = config.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        let mut len_buf = [0u8; 2];
                        if stream.read_exact(&mut len_buf).await.is_err() { return; }
                        let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                        if stream.read_exact(&mut query).await.is_err() { return; }

                        let pipeline = &config.zones[zone_idx].pipeline;
                        if let Some(resp) = serve_query(pipeline, &query, src, &token).await {
                            let _ = stream.write_all(&(resp.len() as u16).to_be_bytes()).await;
                            let _ = stream.write_all(&resp).await;
                        }
                    });
                }
            }));
        }

        if tasks.is_empty() {
            anyhow::bail!("no listener could be bound");
        }

        let _ = shutdown.wait_for(|stop| *stop).await;
        tracing::info!("Shutting down, cancelling in-flight queries");
        cancel.cancel();
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

/// Run one wire query through `pipeline` and produce the wire reply, if any.
pub async fn serve_query(pipeline: &Pipeline, bytes: &[u8], src: SocketAddr, cancel: &CancelToken) -> Option<Vec<u8>> {
    let query = match DnsMessage::from_wire(bytes) {
        Ok(q) => q,
        Err(e) => {
            tracing::debug!("Undecodable query from {}: {:#}", src, e);
            return format_error(bytes);
        }
    };

    let mut ctx = QueryContext::new(query, Some(src));
    let span = ctx.span();
    // a failed deferred action is already logged by the pipeline and does not change the reply
    let _ = pipeline.handle(&mut ctx, cancel).instrument(span).await;
    reply_for(&ctx)
}

/// Wire reply matching the final status of `ctx`; `None` means stay silent.
pub fn reply_for(ctx: &QueryContext) -> Option<Vec<u8>> {
    let query = ctx.query();
    match ctx.status() {
        ContextStatus::RESPONDED => match ctx.response() {
            Some(resp) => {
                let mut resp = resp.clone();
                resp.set_id(query.id());
                Some(resp.raw)
            }
            None => Some(query.reply_with_rcode(RCODE_SERVFAIL).raw),
        },
        ContextStatus::REJECTED => Some(query.reply_with_rcode(RCODE_REFUSED).raw),
        ContextStatus::DROPPED => None,
        _ => Some(query.reply_with_rcode(RCODE_SERVFAIL).raw),
    }
}

fn format_error(bytes: &[u8]) -> Option<Vec<u8>> {
    if bytes.len() < HEADER_LEN { return None; }
    let mut resp = bytes[..HEADER_LEN].to_vec();
    resp[2] = (resp[2] & 0x79) | 0x80;
    resp[3] = RCODE_FORMERR;
    resp[4..].fill(0);
    Some(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::block::BlockPlugin;
    use crate::plugin::whoami::WhoamiPlugin;
    use crate::plugin::Plugin;
    use crate::config::PluginConfig;
    use crate::types::{DnsQuestion, QClass, QType, RCODE_NOERROR};

    fn client() -> SocketAddr { "198.51.100.4:40000".parse().unwrap() }

    fn query(qtype: QType) -> DnsMessage {
        DnsMessage::query(0x5151, vec![DnsQuestion { name: "srv.test.".into(), qtype, qclass: QClass::IN }])
    }

    fn block(action: &str) -> Box<dyn Plugin> {
        Box::new(BlockPlugin::from_config(&PluginConfig { name: "block".into(), args: vec![action.into()], block: vec![] }).unwrap())
    }

    async fn serve(pipeline: &Pipeline, q: &DnsMessage) -> Option<DnsMessage> {
        serve_query(pipeline, &q.raw, client(), &CancelToken::never()).await
            .map(|raw| DnsMessage::from_wire(&raw).unwrap())
    }

    #[tokio::test]
    async fn test_responded_query_returns_response() {
        let pipeline = Pipeline::new(vec![Box::new(WhoamiPlugin)]);
        let reply = serve(&pipeline, &query(QType::A)).await.unwrap();
        assert_eq!(reply.id(), 0x5151);
        assert_eq!(reply.rcode(), RCODE_NOERROR);
        assert_eq!(reply.header.additional_count, 1);
    }

    #[tokio::test]
    async fn test_status_maps_to_rcode() {
        let refused = serve(&Pipeline::new(vec![block("refuse")]), &query(QType::A)).await.unwrap();
        assert_eq!(refused.rcode(), RCODE_REFUSED);

        let failed = serve(&Pipeline::new(vec![block("servfail")]), &query(QType::A)).await.unwrap();
        assert_eq!(failed.rcode(), RCODE_SERVFAIL);

        assert!(serve(&Pipeline::new(vec![block("drop")]), &query(QType::A)).await.is_none());

        // nobody answered
        let unanswered = serve(&Pipeline::new(vec![Box::new(WhoamiPlugin)]), &query(QType::MX)).await.unwrap();
        assert_eq!(unanswered.rcode(), RCODE_SERVFAIL);
    }

    #[test]
    fn test_response_id_follows_query() {
        let mut ctx = QueryContext::new(query(QType::A), Some(client()));
        let mut resp = ctx.query().reply_with_rcode(RCODE_NOERROR);
        resp.set_id(1);
        ctx.set_response(Some(resp), ContextStatus::RESPONDED);

        let raw = reply_for(&ctx).unwrap();
        assert_eq!(DnsMessage::from_wire(&raw).unwrap().id(), 0x5151);
    }

    #[tokio::test]
    async fn test_undecodable_query_gets_formerr() {
        let pipeline = Pipeline::new(vec![]);
        let mut raw = query(QType::A).raw;
        raw.truncate(raw.len() - 3);

        let reply = serve_query(&pipeline, &raw, client(), &CancelToken::never()).await.unwrap();
        let reply = DnsMessage::from_wire(&reply).unwrap();
        assert_eq!(reply.id(), 0x5151);
        assert!(reply.header.flags.qr);
        assert_eq!(reply.rcode(), RCODE_FORMERR);
        assert!(reply.questions.is_empty());

        assert!(serve_query(&pipeline, &[1, 2, 3], client(), &CancelToken::never()).await.is_none());
    }
}
