use crate::plugin::{http, Plugin, SharedState};
use crate::config::PluginConfig;
use crate::types::{rcode_to_str, DnsMessage};
use anyhow::Result;
use std::sync::{Arc, Mutex, PoisonError};
use prometheus::{
    Encoder, TextEncoder, IntCounterVec, IntGauge, HistogramVec, GaugeVec,
    register_int_counter_vec, register_int_gauge, register_histogram_vec, register_gauge_vec,
};
use lazy_static::lazy_static;

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coredns_dns_requests_total",
        "Counter of DNS requests made per zone, protocol and family.",
        &["family", "proto", "server", "type", "zone"]
    ).unwrap();

    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coredns_dns_responses_total",
        "Counter of response status codes.",
        &["plugin", "rcode", "server", "zone"]
    ).unwrap();

    pub static ref DNS_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "coredns_dns_request_duration_seconds",
        "Histogram of the time (in seconds) each request took per zone.",
        &["server", "zone"],
        vec![0.00025, 0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096, 8.192]
    ).unwrap();

    pub static ref DNS_REQUEST_SIZE: HistogramVec = register_histogram_vec!(
        "coredns_dns_request_size_bytes",
        "Size of the request in bytes per zone and protocol.",
        &["proto", "server", "zone"],
        vec![0.0, 100.0, 200.0, 300.0, 400.0, 511.0, 1023.0, 2047.0, 4095.0, 8291.0, 16000.0, 32000.0, 48000.0, 64000.0]
    ).unwrap();

    pub static ref DNS_RESPONSE_SIZE: HistogramVec = register_histogram_vec!(
        "coredns_dns_response_size_bytes",
        "Size of the returned response in bytes.",
        &["proto", "server", "zone"],
        vec![0.0, 100.0, 200.0, 300.0, 400.0, 511.0, 1023.0, 2047.0, 4095.0, 8291.0, 16000.0, 32000.0, 48000.0, 64000.0]
    ).unwrap();

    pub static ref PLUGIN_ENABLED: GaugeVec = register_gauge_vec!(
        "coredns_plugin_enabled",
        "A metric that indicates whether a plugin is enabled on per server and zone basis.",
        &["name", "server", "zone"]
    ).unwrap();

    pub static ref BUILD_INFO: GaugeVec = register_gauge_vec!(
        "coredns_build_info",
        "A metric with a constant '1' value labeled by version, revision, and rust_version from which the server was built.",
        &["rust_version", "revision", "version"]
    ).unwrap();

    pub static ref KUBELB_SERVICES: IntGauge = register_int_gauge!(
        "coredns_kubeloadbalancer_services",
        "Number of services held in the kubeloadbalancer mirror."
    ).unwrap();

    pub static ref KUBELB_WATCH_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coredns_kubeloadbalancer_watch_events_total",
        "Counter of service watch events applied to the mirror, by type.",
        &["type"]
    ).unwrap();

    pub static ref KUBELB_LOOKUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "coredns_kubeloadbalancer_lookups_total",
        "Counter of in-zone lookups by query shape and outcome.",
        &["mode", "result"]
    ).unwrap();
}

pub const DEFAULT_LISTEN: &str = ":9153";

pub struct PrometheusPlugin {
    addr: String,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl Plugin for PrometheusPlugin {
    fn name(&self) -> &str { "prometheus" }

    fn from_config(config: &PluginConfig, _shared: Arc<SharedState>) -> Result<Self> {
        let addr = http::listen_addr(config.args.first(), DEFAULT_LISTEN);
        BUILD_INFO.with_label_values(&["rustc", "kubelb-dns", env!("CARGO_PKG_VERSION")]).set(1.0);
        Ok(Self { addr, handle: Mutex::new(None) })
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<DnsMessage> {
        let server = server_label(msg);
        let zone = zone_label(msg);
        let qtype = msg.question().map(|q| q.qtype.as_str()).unwrap_or("OTHER");
        let family = match msg.client_addr {
            Some(std::net::SocketAddr::V6(_)) => "2",
            _ => "1",
        };

        DNS_REQUESTS_TOTAL.with_label_values(&[family, &msg.protocol, &server, qtype, zone]).inc();
        DNS_REQUEST_SIZE.with_label_values(&[msg.protocol.as_str(), &server, zone]).observe(msg.raw_query.len() as f64);

        msg.start_time = Some(std::time::Instant::now());
        Ok(msg.clone())
    }

    async fn post_process(&self, msg: &mut DnsMessage) -> Result<()> {
        let server = server_label(msg);
        let zone = zone_label(msg);

        if let Some(start) = msg.start_time {
            DNS_REQUEST_DURATION.with_label_values(&[server.as_str(), zone]).observe(start.elapsed().as_secs_f64());
        }

        if let Some(resp) = msg.raw_response.as_ref().filter(|r| r.len() >= 4) {
            DNS_RESPONSE_SIZE.with_label_values(&[msg.protocol.as_str(), &server, zone]).observe(resp.len() as f64);
            let rcode_str = rcode_to_str(resp[3] & 0x0F);
            let plugin_name = if msg.answered_by.is_empty() { "unknown" } else { &msg.answered_by };
            DNS_RESPONSES_TOTAL.with_label_values(&[plugin_name, rcode_str, &server, zone]).inc();
        }
        Ok(())
    }

    fn priority(&self) -> u8 { 150 }

    async fn on_startup(&self) -> Result<()> {
        let handle = http::serve("prometheus", &self.addr, |_path| render()).await;
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

/// Full HTTP response carrying the text exposition of every registered metric.
pub fn render() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => http::response("200 OK", encoder.format_type(), &buffer),
        Err(e) => {
            tracing::error!("[prometheus] Failed to encode metrics: {}", e);
            http::response("500 Internal Server Error", "text/plain", b"")
        }
    }
}

pub fn server_label(msg: &DnsMessage) -> String {
    format!("dns://:{}", msg.server_port.unwrap_or(crate::config::DEFAULT_PORT))
}

fn zone_label(msg: &DnsMessage) -> &str {
    if msg.zone.is_empty() { "." } else { &msg.zone }
}
