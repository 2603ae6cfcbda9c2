//! HTTP/HTTPS handler
//!
//! One handler, three behaviors on a TLS-terminated stream:
//!
//! - requests addressed to the configured SNI are reverse-proxied to
//!   the mapped upstream (or the descriptor's default address),
//! - anything else is forward-proxied (absolute-form or CONNECT) after
//!   Basic proxy authentication,
//! - with forwarding disabled, foreign hosts are dropped silently.
//!
//! Only the request head is parsed; whatever follows it is relayed
//! verbatim.

use std::net::SocketAddr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::common::{ensure_port, relay, strip_port, Stream};
use crate::config::ServerConf;
use crate::error::{Error, Result};

const MAX_HEAD: usize = 64 * 1024;

const RESPONSE_200_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection established\r\nProxy-Agent: Akari\r\n\r\n";
const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_407: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
    Proxy-Authenticate: Basic realm=\"Akari\"\r\n\r\n";
const RESPONSE_503: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\r\n";

pub async fn handle(
    mut stream: Stream,
    cfg: &ServerConf,
    peer: SocketAddr,
    local: SocketAddr,
) -> Result<()> {
    let (req, leftover) = read_request(&mut stream).await?;

    let dst = match req.dst_addr() {
        Some(dst) => dst,
        None => {
            stream.write_all(RESPONSE_400).await?;
            return Err(Error::Protocol("request without destination host".into()));
        }
    };
    let host = strip_port(&dst).to_string();
    let dst = ensure_port(&dst, 80);

    if host == cfg.sni {
        return reverse_proxy(stream, cfg, req, leftover, peer, local).await;
    }
    if cfg.disable_forward_proxy {
        debug!(host = %host, "forward proxy disabled, dropping");
        return Ok(());
    }
    forward_proxy(stream, cfg, req, leftover, dst).await
}

async fn reverse_proxy(
    mut stream: Stream,
    cfg: &ServerConf,
    req: Request,
    leftover: BytesMut,
    peer: SocketAddr,
    local: SocketAddr,
) -> Result<()> {
    let upstream_addr = match cfg.reverse_proxy.get(req.path()) {
        Some(addr) => addr.clone(),
        None if !cfg.addr.is_empty() => cfg.addr.clone(),
        None => {
            stream.write_all(RESPONSE_400).await?;
            return Err(Error::Protocol(format!(
                "no reverse proxy mapping for {}",
                req.path()
            )));
        }
    };

    info!(dst = %upstream_addr, path = %req.path(), "reverse proxy");
    let mut upstream = match TcpStream::connect(&upstream_addr).await {
        Ok(conn) => conn,
        Err(e) => {
            stream.write_all(RESPONSE_503).await?;
            return Err(e.into());
        }
    };
    upstream.set_nodelay(true)?;

    let remote_ip = peer.ip().to_string();
    let local_ip = local.ip().to_string();
    let mut head = BytesMut::with_capacity(512);
    req.write_head(
        &mut head,
        &req.target,
        &["x-real-ip", "x-forwarded-for"],
        &[
            ("X-Real-IP", remote_ip.clone()),
            ("X-Forwarded-For", format!("{}, {}", remote_ip, local_ip)),
        ],
    );
    head.extend_from_slice(&leftover);
    upstream.write_all(&head).await?;

    let _ = relay(stream, upstream).await;
    Ok(())
}

async fn forward_proxy(
    mut stream: Stream,
    cfg: &ServerConf,
    req: Request,
    leftover: BytesMut,
    dst: String,
) -> Result<()> {
    if !authorized(&req, &cfg.auth) {
        stream.write_all(RESPONSE_407).await?;
        return Err(Error::Auth);
    }

    info!(dst = %strip_port(&dst), "open destination");
    let mut upstream = match TcpStream::connect(&dst).await {
        Ok(conn) => conn,
        Err(e) => {
            stream.write_all(RESPONSE_503).await?;
            return Err(e.into());
        }
    };
    upstream.set_nodelay(true)?;

    if req.method.eq_ignore_ascii_case("CONNECT") {
        // Tunnel bytes that arrived buffered behind the head already
        // belong to the upstream.
        if !leftover.is_empty() {
            upstream.write_all(&leftover).await?;
        }
        stream.write_all(RESPONSE_200_ESTABLISHED).await?;
    } else {
        let mut head = BytesMut::with_capacity(512);
        req.write_head(
            &mut head,
            req.origin_target(),
            &["proxy-authorization", "proxy-connection"],
            &[],
        );
        head.extend_from_slice(&leftover);
        upstream.write_all(&head).await?;
    }

    let _ = relay(stream, upstream).await;
    info!(dst = %strip_port(&dst), "close destination");
    Ok(())
}

fn authorized(req: &Request, auth: &str) -> bool {
    if auth.is_empty() {
        return true;
    }
    let value = match req.header("proxy-authorization") {
        Some(value) => value,
        None => return false,
    };
    let encoded = match value.strip_prefix("Basic ") {
        Some(encoded) => encoded,
        None => return false,
    };
    match BASE64.decode(encoded.trim()) {
        Ok(decoded) => decoded == auth.as_bytes(),
        Err(_) => false,
    }
}

/// Parsed request head. Header names keep their original casing for
/// forwarding; lookups are case-insensitive.
pub(crate) struct Request {
    pub(crate) method: String,
    pub(crate) target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl Request {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Destination authority: the absolute-form target when present,
    /// the Host header otherwise. CONNECT's target is the authority.
    pub(crate) fn dst_addr(&self) -> Option<String> {
        if self.method.eq_ignore_ascii_case("CONNECT") {
            if !self.target.is_empty() {
                return Some(self.target.clone());
            }
        } else if let Some(rest) = self.absolute_rest() {
            let authority = rest.split('/').next().unwrap_or(rest);
            if !authority.is_empty() {
                return Some(authority.to_string());
            }
        }
        self.header("host")
            .map(str::to_string)
            .filter(|h| !h.is_empty())
    }

    /// Path component without the query, for the reverse-proxy table.
    fn path(&self) -> &str {
        let target = self.origin_target();
        target.split('?').next().unwrap_or(target)
    }

    /// Request target reduced to origin form.
    pub(crate) fn origin_target(&self) -> &str {
        match self.absolute_rest() {
            Some(rest) => match rest.find('/') {
                Some(i) => &rest[i..],
                None => "/",
            },
            None => &self.target,
        }
    }

    fn absolute_rest(&self) -> Option<&str> {
        self.target
            .strip_prefix("http://")
            .or_else(|| self.target.strip_prefix("https://"))
    }

    /// Serialize the head with `target` as the request target, dropping
    /// `skip` headers and appending `extra` ones.
    fn write_head(&self, buf: &mut BytesMut, target: &str, skip: &[&str], extra: &[(&str, String)]) {
        buf.extend_from_slice(self.method.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(target.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(b"\r\n");

        for (key, value) in &self.headers {
            if skip.iter().any(|s| key.eq_ignore_ascii_case(s)) {
                continue;
            }
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        for (key, value) in extra {
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
    }
}

/// Read and parse the request head; bytes read past the final CRLFCRLF
/// are returned for the caller to replay.
pub(crate) async fn read_request(stream: &mut Stream) -> Result<(Request, BytesMut)> {
    let mut buf = BytesMut::with_capacity(4096);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD {
            return Err(Error::Protocol("request head too large".into()));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Protocol(
                "connection closed before request head".into(),
            ));
        }
    };
    let head = buf.split_to(head_end);
    let req = parse_head(&head)?;
    Ok((req, buf))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_head(head: &[u8]) -> Result<Request> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Protocol("non-UTF-8 request head".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| Error::Protocol("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => {
            return Err(Error::Protocol(format!(
                "malformed request line: {:?}",
                request_line
            )))
        }
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(Request {
        method,
        target,
        version,
        headers,
    })
}
