//! Tiny HTTP/1.1 responder shared by the `prometheus` and `ready` listeners.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// `:9153` and `9153` listen on every interface; anything with a host is used as-is.
pub fn listen_addr(arg: Option<&String>, default: &str) -> String {
    let raw = arg.map(String::as_str).unwrap_or(default);
    if raw.starts_with(':') {
        format!("0.0.0.0{}", raw)
    } else if !raw.contains(':') {
        format!("0.0.0.0:{}", raw)
    } else {
        raw.to_string()
    }
}

pub fn response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status, content_type, body.len()
    );
    let mut out = header.into_bytes();
    out.extend_from_slice(body);
    out
}

/// Binds `addr` and answers every GET with `respond(path)`. `None` when the port is taken,
/// which happens when several server blocks configure the same listener.
pub async fn serve<F>(plugin: &'static str, addr: &str, respond: F) -> Option<JoinHandle<()>>
where
    F: Fn(&str) -> Vec<u8> + Send + Sync + 'static,
{
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            tracing::info!("[{}] Successfully bound listener on {}", plugin, addr);
            Some(spawn_accept_loop(listener, respond))
        }
        Err(e) => {
            tracing::info!("[{}] Port {} is already active (shared with another zone): {}", plugin, addr, e);
            None
        }
    }
}

pub fn spawn_accept_loop<F>(listener: TcpListener, respond: F) -> JoinHandle<()>
where
    F: Fn(&str) -> Vec<u8> + Send + Sync + 'static,
{
    let respond = Arc::new(respond);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let respond = respond.clone();
            tokio::spawn(async move {
                // 8KB swallows the request headers browsers send
                let mut buf = [0u8; 8192];
                let Ok(Ok(n)) = tokio::time::timeout(IO_TIMEOUT, stream.read(&mut buf)).await else { return };
                let request = String::from_utf8_lossy(&buf[..n]);
                let Some(path) = get_path(&request) else { return };

                let body = respond(path);
                let _ = tokio::time::timeout(IO_TIMEOUT, stream.write_all(&body)).await;
                let _ = stream.flush().await;
                // FIN instead of RST so clients see the whole body
                let _ = stream.shutdown().await;
            });
        }
    })
}

fn get_path(request: &str) -> Option<&str> {
    let line = request.lines().next()?;
    let mut parts = line.split_whitespace();
    if parts.next()? != "GET" {
        return None;
    }
    parts.next()
}
