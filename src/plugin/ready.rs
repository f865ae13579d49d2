use crate::plugin::{http, Plugin, SharedState};
use crate::config::PluginConfig;
use crate::types::DnsMessage;
use anyhow::Result;
use std::sync::{Arc, Mutex, PoisonError};

pub const DEFAULT_LISTEN: &str = ":8181";

/// `ready [ADDRESS]`: 200 once every registered reporter is ready, 503 naming the rest until then.
pub struct ReadyPlugin {
    addr: String,
    shared: Arc<SharedState>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl Plugin for ReadyPlugin {
    fn name(&self) -> &str { "ready" }

    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> {
        if config.args.len() > 1 {
            anyhow::bail!("ready takes at most one address, got {:?}", config.args);
        }
        let addr = http::listen_addr(config.args.first(), DEFAULT_LISTEN);
        Ok(Self { addr, shared, handle: Mutex::new(None) })
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<DnsMessage> { Ok(msg.clone()) }

    fn priority(&self) -> u8 { 10 }

    async fn on_startup(&self) -> Result<()> {
        let shared = self.shared.clone();
        let handle = http::serve("ready", &self.addr, move |_path| readiness_response(&shared.not_ready())).await;
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = handle;
        Ok(())
    }

    fn on_shutdown(&self) -> Result<()> {
        if let Some(handle) = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        Ok(())
    }
}

pub fn readiness_response(not_ready: &[String]) -> Vec<u8> {
    if not_ready.is_empty() {
        return http::response("200 OK", "text/plain", b"OK");
    }
    let body = not_ready.join(", ");
    tracing::debug!("[ready] Still waiting on: {}", body);
    http::response("503 Service Unavailable", "text/plain", body.as_bytes())
}
