use crate::plugin::{Plugin, SharedState};
use crate::config::PluginConfig;
use crate::types::{rcode_to_str, DnsMessage};
use anyhow::Result;
use std::sync::Arc;

/// Query log: one line when a query comes in, one when its answer leaves.
pub struct LogPlugin;

#[async_trait::async_trait]
impl Plugin for LogPlugin {
    fn name(&self) -> &str { "log" }

    fn from_config(config: &PluginConfig, _: Arc<SharedState>) -> Result<Self> {
        tracing::info!("[log] Initialized for zones: {:?}", config.server_zones);
        Ok(Self)
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<DnsMessage> {
        let (qname, qtype) = msg.question().map(|q| (q.name.as_str(), q.qtype.as_str())).unwrap_or(("-", "-"));
        let client = msg.client_addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
        tracing::info!(
            "=> [Incoming Query] {} {} from {} ({}) TxID: {:#06x}",
            qname, qtype, client, msg.protocol, msg.header.id
        );
        Ok(msg.clone())
    }

    async fn post_process(&self, msg: &mut DnsMessage) -> Result<()> {
        let Some(resp) = msg.raw_response.as_ref().filter(|r| r.len() >= 4) else { return Ok(()) };
        let elapsed = msg.start_time.map(|t| format!("{:?}", t.elapsed())).unwrap_or_else(|| "-".to_string());
        tracing::info!(
            "<= [Response] {} by {} ({} bytes, {}) TxID: {:#06x}",
            rcode_to_str(resp[3] & 0x0F),
            if msg.answered_by.is_empty() { "-" } else { &msg.answered_by },
            resp.len(), elapsed, msg.header.id
        );
        Ok(())
    }

    fn priority(&self) -> u8 { 255 }
}
