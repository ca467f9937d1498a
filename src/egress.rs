//! Egress proxy (C7): an in-process HTTP/CONNECT filter enforcing a
//! domain allowlist, auditing every allow/deny decision.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::audit::AuditLog;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EgressError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// `host == allowed` or `host` ends with `"." + allowed`, for any allowed
/// suffix. An empty allowlist means trusted mode: allow everything.
pub fn is_allowed(host: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let host = strip_port(host);
    allowlist
        .iter()
        .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':').map_or(host, |(h, _)| h)
}

/// A running egress proxy instance bound to a loopback ephemeral port.
pub struct EgressProxy {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl EgressProxy {
    /// Binds `127.0.0.1:0` and starts accepting connections in the
    /// background, filtering against `allowlist` and auditing every
    /// decision through `audit_log`.
    pub async fn start(allowlist: Vec<String>, audit_log: Arc<AuditLog>) -> Result<Self, EgressError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let allowlist = Arc::new(allowlist);

        let handle = tokio::spawn(async move {
            loop {
                let (socket, _peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "egress proxy accept failed");
                        continue;
                    }
                };
                let allowlist = Arc::clone(&allowlist);
                let audit_log = Arc::clone(&audit_log);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, &allowlist, &audit_log).await {
                        debug!(error = %e, "egress connection ended with an error");
                    }
                });
            }
        });

        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Proxy URL as consumed by `{http,https}_proxy` inside the container
    /// (spec §4.8 — reachable from inside as `host.docker.internal`).
    pub fn proxy_url_for_container(&self) -> String {
        format!("http://host.docker.internal:{}", self.addr.port())
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    allowlist: &[String],
    audit_log: &AuditLog,
) -> Result<(), EgressError> {
    let mut reader = BufReader::new(&mut socket);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
            break;
        }
        headers.push(line);
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();

    let host = if method.eq_ignore_ascii_case("CONNECT") {
        target.clone()
    } else {
        header_host(&headers).unwrap_or_else(|| target_host(&target))
    };

    let allowed = is_allowed(&host, allowlist);
    audit_decision(audit_log, &strip_port(&host).to_string(), allowed);

    if !allowed {
        socket
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
            .await?;
        return Ok(());
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        connect_tunnel(socket, &target).await
    } else {
        forward_http(socket, &method, &target, &headers).await
    }
}

fn header_host(headers: &[String]) -> Option<String> {
    headers.iter().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim().eq_ignore_ascii_case("host").then(|| value.trim().to_string())
    })
}

fn target_host(target: &str) -> String {
    target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target)
        .split('/')
        .next()
        .unwrap_or(target)
        .to_string()
}

fn audit_decision(audit_log: &AuditLog, host: &str, allowed: bool) {
    let decision = if allowed { "allow" } else { "deny" };
    if let Err(e) = audit_log.log("network.egress", &[host.to_string()], decision, "egress-proxy", None) {
        warn!(error = %e, "failed to audit egress decision; filter decision unaffected");
    }
}

async fn connect_tunnel(mut client: TcpStream, target: &str) -> Result<(), EgressError> {
    let dial = tokio::time::timeout(CONNECT_DIAL_TIMEOUT, TcpStream::connect(target)).await;
    let mut upstream = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return Err(e.into());
        }
        Err(_) => {
            client
                .write_all(b"HTTP/1.1 504 Gateway Timeout\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return Ok(());
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;

    // Full-duplex copy; returns once either half hits EOF or errors, at
    // which point both sockets are dropped and closed.
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

async fn forward_http(
    mut client: TcpStream,
    method: &str,
    target: &str,
    headers: &[String],
) -> Result<(), EgressError> {
    let url = if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else if let Some(host) = header_host(headers) {
        format!("http://{host}{target}")
    } else {
        format!("http://{target}")
    };

    let http_method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let client_http = reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()?;

    let mut builder = client_http.request(http_method, &url);
    for line in headers {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("proxy-connection") {
                continue;
            }
            builder = builder.header(name, value.trim());
        }
    }

    let response = match builder.send().await {
        Ok(resp) => resp,
        Err(_) => {
            client
                .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return Ok(());
        }
    };

    let status = response.status();
    let mut out = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.canonical_reason().unwrap_or(""));
    for (name, value) in response.headers() {
        if name.as_str().eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    let body = response.bytes().await.unwrap_or_default();
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    client.write_all(out.as_bytes()).await?;
    client.write_all(&body).await?;
    Ok(())
}

impl From<reqwest::Error> for EgressError {
    fn from(e: reqwest::Error) -> Self {
        EgressError::Io(std::io::Error::other(e))
    }
}

impl From<tokio::time::error::Elapsed> for EgressError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        EgressError::Io(std::io::Error::other(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // (P6)
    #[test]
    fn exact_and_suffix_match_allowed() {
        let allowlist = vec!["example.com".to_string()];
        assert!(is_allowed("example.com", &allowlist));
        assert!(is_allowed("www.example.com", &allowlist));
        assert!(is_allowed("example.com:443", &allowlist));
        assert!(!is_allowed("evil.com", &allowlist));
        assert!(!is_allowed("notexample.com", &allowlist));
    }

    #[test]
    fn empty_allowlist_allows_all() {
        assert!(is_allowed("anything.example", &[]));
    }

    #[test]
    fn header_host_is_case_insensitive() {
        let headers = vec!["Host: example.com\r\n".to_string()];
        assert_eq!(header_host(&headers).as_deref(), Some("example.com"));
    }

    #[test]
    fn target_host_strips_scheme_and_path() {
        assert_eq!(target_host("http://example.com/a/b"), "example.com");
        assert_eq!(target_host("example.com:443"), "example.com:443");
    }
}
