pub mod http;
pub mod kubeloadbalancer;
pub mod log;
pub mod prometheus;
pub mod ready;

use anyhow::Result;
use std::sync::{Arc, Mutex, PoisonError};
use crate::config::PluginConfig;
use crate::types::DnsMessage;

#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> where Self: Sized;
    async fn process(&self, msg: &mut DnsMessage) -> Result<DnsMessage>;
    async fn post_process(&self, _msg: &mut DnsMessage) -> Result<()> {
        Ok(())
    }
    fn priority(&self) -> u8;

    /// Runs once before the listeners are bound. An error aborts startup.
    async fn on_startup(&self) -> Result<()> {
        Ok(())
    }

    /// Runs once when the server exits.
    fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Implemented by anything the `ready` plugin should wait for.
pub trait Readiness: Send + Sync {
    fn ready(&self) -> bool;
}

/// State shared by every plugin instance built from one Corefile.
pub struct SharedState {
    readiness: Mutex<Vec<(String, Arc<dyn Readiness>)>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self { readiness: Mutex::new(Vec::new()) }
    }

    pub fn register_readiness(&self, name: &str, reporter: Arc<dyn Readiness>) {
        let mut list = self.readiness.lock().unwrap_or_else(PoisonError::into_inner);
        list.push((name.to_string(), reporter));
    }

    /// Names of the registered reporters that are not ready yet.
    pub fn not_ready(&self) -> Vec<String> {
        let list = self.readiness.lock().unwrap_or_else(PoisonError::into_inner);
        list.iter().filter(|(_, r)| !r.ready()).map(|(name, _)| name.clone()).collect()
    }
}

pub fn create_plugin(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Box<dyn Plugin>> {
    match config.name.as_str() {
        "kubeloadbalancer" => Ok(Box::new(kubeloadbalancer::KubeLoadBalancer::from_config(config, shared)?)),
        "prometheus" => Ok(Box::new(prometheus::PrometheusPlugin::from_config(config, shared)?)),
        "log" => Ok(Box::new(log::LogPlugin::from_config(config, shared)?)),
        "ready" => Ok(Box::new(ready::ReadyPlugin::from_config(config, shared)?)),
        _ => anyhow::bail!("Unknown plugin: {}", config.name),
    }
}
