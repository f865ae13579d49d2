//! `kubeloadbalancer`: answers A/AAAA queries with the load balancer ingress addresses of
//! Kubernetes Services.
//!
//! ```text
//! <service>.<zone>              every namespace with a service of that name
//! <service>.<namespace>.<zone>  exactly that service
//! ```

pub mod kube_source;
pub mod mirror;
pub mod records;
pub mod resolver;
pub mod setup;
pub mod source;

use crate::config::PluginConfig;
use crate::dnsutil::fqdn;
use crate::plugin::prometheus::KUBELB_LOOKUPS_TOTAL;
use crate::plugin::{Plugin, SharedState};
use crate::types::{rcode, DnsMessage, DnsQuestion, ResourceRecord};
use crate::wire;
use anyhow::{Context, Result};
use std::sync::Arc;

use self::kube_source::KubeSource;
use self::mirror::Mirror;
use self::resolver::LookupKey;
use self::setup::Settings;
use self::source::ServiceSource;

pub const PLUGIN_NAME: &str = "kubeloadbalancer";

/// What a query turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not in our zones, or a miss in a fallthrough zone: the next plugin decides.
    Next,
    Reply { rcode: u8, answers: Vec<ResourceRecord>, authority: Vec<ResourceRecord> },
}

pub struct KubeLoadBalancer {
    settings: Settings,
    mirror: Arc<Mirror>,
}

impl KubeLoadBalancer {
    pub fn new(settings: Settings, source: Arc<dyn ServiceSource>) -> Self {
        Self { settings, mirror: Arc::new(Mirror::new(source)) }
    }

    pub fn mirror(&self) -> &Arc<Mirror> {
        &self.mirror
    }

    pub fn serve(&self, question: &DnsQuestion) -> Outcome {
        let qname = fqdn(&question.name);
        let Some(resolution) = resolver::resolve(&qname, &self.settings.zones) else {
            return Outcome::Next;
        };
        let mode = resolution.key.mode();

        let found = match &resolution.key {
            LookupKey::ZoneOnly => {
                KUBELB_LOOKUPS_TOTAL.with_label_values(&[mode, "zone"]).inc();
                return self.reply(rcode::NOERROR, Vec::new(), vec![self.soa()]);
            }
            LookupKey::Name(name) => self.mirror.lookup_by_name(name),
            LookupKey::NamespaceName { namespace, name } => {
                self.mirror.lookup_by_namespace_name(namespace, name).map(|svc| svc.into_iter().collect())
            }
            LookupKey::TooDeep => Ok(Vec::new()),
        };

        let services = match found {
            Ok(services) => services,
            Err(e) => {
                KUBELB_LOOKUPS_TOTAL.with_label_values(&[mode, "error"]).inc();
                tracing::error!("[kubeloadbalancer] Lookup for '{}' failed: {}", qname, e);
                return self.reply(rcode::SERVFAIL, Vec::new(), Vec::new());
            }
        };

        if services.is_empty() {
            KUBELB_LOOKUPS_TOTAL.with_label_values(&[mode, "miss"]).inc();
            if self.settings.fall.through(&qname.to_ascii_lowercase()) {
                tracing::debug!("[kubeloadbalancer] '{}' not found in {}, falling through", qname, resolution.zone);
                return Outcome::Next;
            }
            return self.reply(rcode::NXDOMAIN, Vec::new(), vec![self.soa()]);
        }

        KUBELB_LOOKUPS_TOTAL.with_label_values(&[mode, "hit"]).inc();
        // a hit without usable addresses is NOERROR with an empty answer and no SOA
        let answers = records::address_records(&services, &qname, question.qtype, self.settings.ttl);
        self.reply(rcode::NOERROR, answers, Vec::new())
    }

    fn reply(&self, rcode: u8, answers: Vec<ResourceRecord>, authority: Vec<ResourceRecord>) -> Outcome {
        Outcome::Reply { rcode, answers, authority }
    }

    fn soa(&self) -> ResourceRecord {
        let zone = self.settings.zones.first().map(String::as_str).unwrap_or(".");
        records::soa(zone, self.settings.ttl)
    }
}

#[async_trait::async_trait]
impl Plugin for KubeLoadBalancer {
    fn name(&self) -> &str { PLUGIN_NAME }

    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> {
        let settings = setup::parse(config)?;
        tracing::info!(
            "[kubeloadbalancer] Initialized for zones {:?} (TTL: {}s, fallthrough: {})",
            settings.zones, settings.ttl, settings.fall.is_enabled()
        );
        let plugin = Self::new(settings, Arc::new(KubeSource::new()));
        shared.register_readiness(PLUGIN_NAME, plugin.mirror.clone());
        Ok(plugin)
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<DnsMessage> {
        if msg.halt_chain { return Ok(msg.clone()); }
        let Some(question) = msg.question().cloned() else { return Ok(msg.clone()) };

        match self.serve(&question) {
            Outcome::Next => {}
            Outcome::Reply { rcode, answers, authority } => {
                tracing::debug!(
                    "    |-- [kubeloadbalancer] {} {} -> {} ({} answers) TxID: {:#06x}",
                    question.name, question.qtype.as_str(), crate::types::rcode_to_str(rcode), answers.len(), msg.header.id
                );
                msg.header.flags.aa = true;
                msg.header.flags.rcode = rcode;
                msg.answers = answers;
                msg.authority = authority;
                msg.raw_response = Some(wire::encode_response(msg));
                msg.halt_chain = true;
                msg.answered_by = PLUGIN_NAME.to_string();
            }
        }
        Ok(msg.clone())
    }

    fn priority(&self) -> u8 { 100 }

    async fn on_startup(&self) -> Result<()> {
        self.mirror.start().await.context("kubeloadbalancer: initial service sync")?;
        Ok(())
    }

    fn on_shutdown(&self) -> Result<()> {
        self.mirror.stop()?;
        Ok(())
    }
}
