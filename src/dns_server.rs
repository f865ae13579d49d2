use crate::config::Config;
use crate::dnsutil::{fqdn, zone_match};
use crate::plugin::prometheus::PLUGIN_ENABLED;
use crate::types::{rcode, DnsMessage};
use crate::wire;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Largest message the two-byte TCP length prefix can carry.
const MAX_TCP_MESSAGE: usize = u16::MAX as usize;

/// Idle time after which a TCP client connection is closed.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DnsServer {
    config: Arc<Config>,
}

impl DnsServer {
    pub fn new(config: Config) -> Self {
        Self { config: Arc::new(config) }
    }

    /// Runs every plugin's startup hook, block by block. The first failure aborts.
    pub async fn start_plugins(&self) -> Result<()> {
        for block in &self.config.zones {
            let server = format!("dns://:{}", block.port);
            for plugin in &block.plugins {
                plugin
                    .on_startup()
                    .await
                    .with_context(|| format!("server block '{}': plugin '{}' failed to start", block.name, plugin.name()))?;
                for zone in &block.zones {
                    PLUGIN_ENABLED.with_label_values(&[plugin.name(), &server, zone]).set(1.0);
                }
            }
        }
        Ok(())
    }

    pub fn stop_plugins(&self) {
        for block in &self.config.zones {
            for plugin in &block.plugins {
                if let Err(e) = plugin.on_shutdown() {
                    tracing::error!("[{}] Shutdown of '{}' failed: {:#}", plugin.name(), block.name, e);
                }
            }
        }
    }

    /// Serves every configured port until `shutdown_rx` turns true or its sender is dropped.
    pub async fn run(&self, default_address: &str, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        // only the IP of the default address is used, ports come from the server blocks
        let base_ip = default_address.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(default_address);

        // several server blocks may share a port (a.com:53 and b.com:53)
        let mut by_port: BTreeMap<u16, Vec<usize>> = BTreeMap::new();
        for (i, block) in self.config.zones.iter().enumerate() {
            by_port.entry(block.port).or_default().push(i);
        }

        let mut tasks = Vec::new();
        for (port, blocks) in by_port {
            let bind_addr = format!("{}:{}", base_ip, port);
            let udp = UdpSocket::bind(&bind_addr).await.with_context(|| format!("failed to bind UDP {}", bind_addr))?;
            let tcp = TcpListener::bind(&bind_addr).await.with_context(|| format!("failed to bind TCP {}", bind_addr))?;
            tracing::info!("🚀 Server successfully bound to TCP & UDP on {} for {} server block(s)", bind_addr, blocks.len());

            let blocks = Arc::new(blocks);
            tasks.push(spawn_udp(Arc::new(udp), self.config.clone(), blocks.clone(), port));
            tasks.push(spawn_tcp(tcp, self.config.clone(), blocks, port));
        }

        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() { break; }
        }
        for task in tasks {
            task.abort();
        }
        tracing::info!("Listeners closed");
        Ok(())
    }
}

fn spawn_udp(socket: Arc<UdpSocket>, config: Arc<Config>, blocks: Arc<Vec<usize>>, port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (size, src) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("UDP receive on port {} failed: {}", port, e);
                    continue;
                }
            };
            let query = buf[..size].to_vec();
            let (config, socket, blocks) = (config.clone(), socket.clone(), blocks.clone());
            tokio::spawn(async move {
                if let Some(resp) = handle_query(&config, &blocks, query, src, "udp", port).await {
                    if let Err(e) = socket.send_to(&resp, src).await {
                        tracing::debug!("UDP send to {} failed: {}", src, e);
                    }
                }
            });
        }
    })
}

fn spawn_tcp(listener: TcpListener, config: Arc<Config>, blocks: Arc<Vec<usize>>, port: u16) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, src)) => {
                    let (config, blocks) = (config.clone(), blocks.clone());
                    tokio::spawn(async move { serve_tcp_conn(stream, src, &config, &blocks, port).await });
                }
                Err(e) => tracing::warn!("TCP accept on port {} failed: {}", port, e),
            }
        }
    })
}

/// Length-prefixed messages, answered in order until the client goes quiet or hangs up.
async fn serve_tcp_conn(mut stream: TcpStream, src: SocketAddr, config: &Config, blocks: &[usize], port: u16) {
    loop {
        let mut len_buf = [0u8; 2];
        match tokio::time::timeout(TCP_IDLE_TIMEOUT, stream.read_exact(&mut len_buf)).await {
            Ok(Ok(_)) => {}
            _ => return,
        }
        let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        if stream.read_exact(&mut query).await.is_err() { return; }

        let Some(resp) = handle_query(config, blocks, query, src, "tcp", port).await else { continue };
        let mut framed = Vec::with_capacity(resp.len() + 2);
        framed.extend_from_slice(&(resp.len() as u16).to_be_bytes());
        framed.extend_from_slice(&resp);
        if stream.write_all(&framed).await.is_err() { return; }
    }
}

/// Runs one raw query through the plugin chain of the server block that owns it.
/// `None` means nothing is sent back.
pub async fn handle_query(
    config: &Config,
    blocks: &[usize],
    raw: Vec<u8>,
    src: SocketAddr,
    proto: &str,
    port: u16,
) -> Option<Vec<u8>> {
    let mut msg = DnsMessage::from_raw(raw, Some(src), proto, port);
    if let Err(e) = wire::decode_query(&mut msg) {
        // never answer something that claims to be a response
        if msg.raw_query.get(2).is_some_and(|b| b & 0x80 != 0) { return None; }
        tracing::debug!("Malformed query from {}: {}", src, e);
        return wire::error_response(&msg.raw_query, rcode::FORMERR);
    }

    if msg.header.flags.opcode != 0 {
        tracing::debug!("Opcode {} from {} is not implemented", msg.header.flags.opcode, src);
        return wire::error_response(&msg.raw_query, rcode::NOTIMP);
    }

    let qname = fqdn(&msg.question()?.name).to_ascii_lowercase();
    let Some((idx, zone)) = select_block(config, blocks, &qname) else {
        tracing::debug!("No server block on port {} is authoritative for '{}'", port, qname);
        return wire::error_response(&msg.raw_query, rcode::REFUSED);
    };
    msg.zone = zone.to_string();
    let block = &config.zones[idx];

    for plugin in &block.plugins {
        if msg.halt_chain { break; }
        match plugin.process(&mut msg).await {
            Ok(next) => msg = next,
            Err(e) => tracing::error!("[{}] Query {:#06x} failed: {:#}", plugin.name(), msg.header.id, e),
        }
    }

    // the chain ran out without an answer
    if msg.raw_response.is_none() {
        msg.header.flags.rcode = rcode::SERVFAIL;
        msg.answers.clear();
        msg.authority.clear();
        msg.raw_response = Some(wire::encode_response(&msg));
    }

    for plugin in block.plugins.iter().rev() {
        if let Err(e) = plugin.post_process(&mut msg).await {
            tracing::warn!("[{}] Post-processing of {:#06x} failed: {:#}", plugin.name(), msg.header.id, e);
        }
    }

    let resp = msg.raw_response?;
    let limit = if proto == "udp" { wire::MAX_UDP_PAYLOAD } else { MAX_TCP_MESSAGE };
    if resp.len() > limit {
        return Some(wire::truncate(&resp));
    }
    Some(resp)
}

/// Block among `blocks` with the longest zone containing `qname`.
fn select_block<'a>(config: &'a Config, blocks: &[usize], qname: &str) -> Option<(usize, &'a str)> {
    blocks
        .iter()
        .filter_map(|&i| zone_match(&config.zones[i].zones, qname).map(|z| (i, z)))
        .max_by_key(|(_, z)| z.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneConfig;
    use crate::dnsutil::Fallthrough;
    use crate::plugin::kubeloadbalancer::setup::Settings;
    use crate::plugin::kubeloadbalancer::source::{MemorySource, ServiceRecord};
    use crate::plugin::kubeloadbalancer::KubeLoadBalancer;
    use crate::plugin::Plugin;
    use crate::wire::tests::{build_query, build_query_labels};

    fn client() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn kubelb(zone: &str, services: Vec<ServiceRecord>) -> Box<dyn Plugin> {
        let settings = Settings { zones: vec![zone.to_string()], ttl: 5, fall: Fallthrough::default() };
        Box::new(KubeLoadBalancer::new(settings, Arc::new(MemorySource::new(services))))
    }

    async fn server(blocks: Vec<(&str, Vec<Box<dyn Plugin>>)>) -> DnsServer {
        let zones = blocks
            .into_iter()
            .map(|(zone, plugins)| ZoneConfig { name: zone.to_string(), zones: vec![zone.to_string()], port: 53, plugins })
            .collect();
        let server = DnsServer::new(Config { zones });
        server.start_plugins().await.unwrap();
        server
    }

    fn rcode_of(resp: &[u8]) -> u8 { resp[3] & 0x0F }
    fn ancount(resp: &[u8]) -> u16 { u16::from_be_bytes([resp[6], resp[7]]) }
    fn nscount(resp: &[u8]) -> u16 { u16::from_be_bytes([resp[8], resp[9]]) }

    #[tokio::test]
    async fn answers_through_plugin_chain() {
        let srv = server(vec![("example.com.", vec![kubelb("example.com.", vec![ServiceRecord::new("ns1", "svc1", &["10.0.0.1"])])])]).await;
        let resp = handle_query(&srv.config, &[0], build_query(7, "svc1.ns1.example.com.", 1), client(), "udp", 53).await.unwrap();
        assert_eq!(&resp[0..2], &7u16.to_be_bytes());
        assert_eq!(rcode_of(&resp), rcode::NOERROR);
        assert_eq!(ancount(&resp), 1);
        assert_eq!(&resp[resp.len() - 4..], &[10, 0, 0, 1]);

        let resp = handle_query(&srv.config, &[0], build_query(8, "nope.example.com.", 1), client(), "udp", 53).await.unwrap();
        assert_eq!(rcode_of(&resp), rcode::NXDOMAIN);
        assert_eq!(nscount(&resp), 1);
        srv.stop_plugins();
    }

    #[tokio::test]
    async fn unanswered_query_is_servfail() {
        let srv = server(vec![
            ("example.com.", vec![kubelb("example.com.", vec![])]),
            (".", vec![kubelb("example.com.", vec![])]),
        ]).await;
        // the root block owns it, and its plugin does not
        let resp = handle_query(&srv.config, &[0, 1], build_query(9, "svc1.example.org.", 1), client(), "udp", 53).await.unwrap();
        assert_eq!(rcode_of(&resp), rcode::SERVFAIL);
        assert_eq!(ancount(&resp), 0);
    }

    #[tokio::test]
    async fn longest_block_zone_wins() {
        let srv = server(vec![
            (".", vec![kubelb(".", vec![])]),
            ("example.com.", vec![kubelb("example.com.", vec![ServiceRecord::new("ns1", "svc1", &["10.0.0.1"])])]),
        ]).await;
        let resp = handle_query(&srv.config, &[0, 1], build_query(1, "svc1.example.com.", 1), client(), "udp", 53).await.unwrap();
        assert_eq!(ancount(&resp), 1);
    }

    #[tokio::test]
    async fn foreign_zone_is_refused() {
        let srv = server(vec![("example.com.", vec![kubelb("example.com.", vec![])])]).await;
        let resp = handle_query(&srv.config, &[0], build_query(2, "svc1.example.org.", 1), client(), "udp", 53).await.unwrap();
        assert_eq!(rcode_of(&resp), rcode::REFUSED);
    }

    #[tokio::test]
    async fn malformed_queries() {
        let srv = server(vec![("example.com.", vec![kubelb("example.com.", vec![])])]).await;

        let mut no_question = build_query(3, "svc1.example.com.", 1);
        no_question[5] = 0;
        let resp = handle_query(&srv.config, &[0], no_question, client(), "udp", 53).await.unwrap();
        assert_eq!(rcode_of(&resp), rcode::FORMERR);

        assert!(handle_query(&srv.config, &[0], vec![0, 1, 2], client(), "udp", 53).await.is_none());

        let mut response = build_query(4, "svc1.example.com.", 1);
        response[2] |= 0x80;
        assert!(handle_query(&srv.config, &[0], response, client(), "udp", 53).await.is_none());
    }

    #[tokio::test]
    async fn oversized_udp_answers_are_truncated() {
        let ips: Vec<String> = (0..200).map(|i| format!("10.0.{}.{}", i / 250, i % 250)).collect();
        let ips: Vec<&str> = ips.iter().map(String::as_str).collect();
        let srv = server(vec![("example.com.", vec![kubelb("example.com.", vec![ServiceRecord::new("ns1", "big", &ips)])])]).await;

        let udp = handle_query(&srv.config, &[0], build_query(5, "big.example.com.", 1), client(), "udp", 53).await.unwrap();
        assert!(udp.len() <= wire::MAX_UDP_PAYLOAD);
        assert_eq!(udp[2] & 0x02, 0x02, "TC");
        assert_eq!(ancount(&udp), 0);

        let tcp = handle_query(&srv.config, &[0], build_query(5, "big.example.com.", 1), client(), "tcp", 53).await.unwrap();
        assert_eq!(tcp[2] & 0x02, 0);
        assert_eq!(ancount(&tcp), 200);
    }

    #[tokio::test]
    async fn tcp_answers_stay_within_length_prefix() {
        let ips: Vec<String> = (0..3000).map(|i| format!("10.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256)).collect();
        let ips: Vec<&str> = ips.iter().map(String::as_str).collect();
        let srv = server(vec![("example.com.", vec![kubelb("example.com.", vec![ServiceRecord::new("ns1", "huge", &ips)])])]).await;

        let tcp = handle_query(&srv.config, &[0], build_query(6, "huge.example.com.", 1), client(), "tcp", 53).await.unwrap();
        assert!(tcp.len() <= u16::MAX as usize);
        assert_eq!(tcp[2] & 0x02, 0x02, "TC");
        assert_eq!(ancount(&tcp), 0);
    }

    #[tokio::test]
    async fn escaped_label_is_not_split_and_question_echoes() {
        let srv = server(vec![("example.com.", vec![kubelb("example.com.", vec![ServiceRecord::new("ns1", "svc1", &["10.0.0.1"])])])]).await;
        let raw = build_query_labels(14, &[b"svc1.ns1", b"example", b"com"], 1);

        let resp = handle_query(&srv.config, &[0], raw.clone(), client(), "udp", 53).await.unwrap();
        assert_eq!(rcode_of(&resp), rcode::NXDOMAIN);
        assert_eq!(ancount(&resp), 0);
        assert_eq!(nscount(&resp), 1);
        assert_eq!(&resp[wire::HEADER_LEN..raw.len()], &raw[wire::HEADER_LEN..]);
    }

    #[tokio::test]
    async fn other_opcodes_are_not_implemented() {
        let srv = server(vec![("example.com.", vec![kubelb("example.com.", vec![])])]).await;
        let mut notify = build_query(15, "example.com.", 6);
        notify[2] |= 4 << 3;
        let resp = handle_query(&srv.config, &[0], notify, client(), "udp", 53).await.unwrap();
        assert_eq!(rcode_of(&resp), rcode::NOTIMP);
    }

    #[tokio::test]
    async fn serves_over_udp_and_tcp() {
        let srv = server(vec![("example.com.", vec![kubelb("example.com.", vec![ServiceRecord::new("ns1", "svc1", &["10.0.0.1"])])])]).await;
        let blocks = Arc::new(vec![0]);

        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let udp_addr = udp.local_addr().unwrap();
        let udp_task = spawn_udp(udp, srv.config.clone(), blocks.clone(), udp_addr.port());
        let client_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_sock.send_to(&build_query(11, "svc1.example.com.", 1), udp_addr).await.unwrap();
        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client_sock.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(ancount(&buf[..n]), 1);

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_addr = tcp.local_addr().unwrap();
        let tcp_task = spawn_tcp(tcp, srv.config.clone(), blocks, tcp_addr.port());
        let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
        // two queries on one connection
        for id in [12u16, 13] {
            let q = build_query(id, "svc1.ns1.example.com.", 1);
            stream.write_all(&(q.len() as u16).to_be_bytes()).await.unwrap();
            stream.write_all(&q).await.unwrap();
            let mut len = [0u8; 2];
            stream.read_exact(&mut len).await.unwrap();
            let mut resp = vec![0u8; u16::from_be_bytes(len) as usize];
            stream.read_exact(&mut resp).await.unwrap();
            assert_eq!(&resp[0..2], &id.to_be_bytes());
            assert_eq!(ancount(&resp), 1);
        }

        udp_task.abort();
        tcp_task.abort();
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let srv = DnsServer::new(Config { zones: Vec::new() });
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { srv.run("127.0.0.1:0", rx).await });
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap().unwrap();
    }
}
