//! HTTP to HTTPS redirect helper
//!
//! Optional plaintext listener on port 80 that answers every request
//! for an `https`-mode SNI with a 301 to the TLS port, and everything
//! else with a 404. Conventional glue around the core; each request
//! gets a five second deadline.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::common::{strip_port, Stream};
use crate::config::{BackendMode, ServerConf};
use crate::error::Result;
use crate::handler::https;

const REQUEST_DEADLINE: Duration = Duration::from_secs(5);

pub(crate) async fn serve(
    confs: Arc<HashMap<String, Arc<ServerConf>>>,
    https_port: String,
    shutdown: CancellationToken,
) {
    let hosts: HashSet<String> = confs
        .values()
        .filter(|c| c.mode == BackendMode::Https)
        .map(|c| c.sni.clone())
        .collect();
    if hosts.is_empty() {
        return;
    }
    let hosts = Arc::new(hosts);

    let ln = match TcpListener::bind("0.0.0.0:80").await {
        Ok(ln) => ln,
        Err(e) => {
            error!("redirect: bind :80: {}", e);
            return;
        }
    };
    info!("start listening 0.0.0.0:80");

    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = ln.accept() => match result {
                Ok(conn) => conn,
                Err(_) => continue,
            },
        };
        let hosts = hosts.clone();
        let https_port = https_port.clone();
        tokio::spawn(async move {
            let stream: Stream = Box::new(socket);
            let _ = timeout(
                REQUEST_DEADLINE,
                redirect_one(stream, hosts, https_port, peer),
            )
            .await;
        });
    }
}

async fn redirect_one(
    mut stream: Stream,
    hosts: Arc<HashSet<String>>,
    https_port: String,
    peer: SocketAddr,
) -> Result<()> {
    let (req, _) = https::read_request(&mut stream).await?;

    let host = match req.dst_addr() {
        Some(dst) => strip_port(&dst).to_string(),
        None => String::new(),
    };
    if !hosts.contains(&host) {
        info!(remote = %peer, "redirect: not found: {}", host);
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await?;
        return Ok(());
    }

    let target = if https_port == "443" {
        format!("https://{}{}", host, req.origin_target())
    } else {
        format!("https://{}:{}{}", host, https_port, req.origin_target())
    };
    info!(remote = %peer, "redirect: {}", target);

    let response = format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        target
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "198.51.100.7:50000".parse().unwrap()
    }

    async fn run(hosts: &[&str], port: &str, request: &str) -> String {
        let hosts = Arc::new(hosts.iter().map(|h| h.to_string()).collect::<HashSet<_>>());
        let (mut client, server) = tokio::io::duplex(4096);
        let port = port.to_string();
        let handle = tokio::spawn(async move {
            redirect_one(Box::new(server), hosts, port, peer()).await
        });

        client.write_all(request.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        handle.await.unwrap().unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn known_host_gets_301_with_port() {
        let response = run(
            &["r.example"],
            "8443",
            "GET /x?q=1 HTTP/1.1\r\nHost: r.example\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 301"));
        assert!(response.contains("Location: https://r.example:8443/x?q=1\r\n"));
    }

    #[tokio::test]
    async fn default_port_is_omitted() {
        let response = run(
            &["r.example"],
            "443",
            "GET / HTTP/1.1\r\nHost: r.example:80\r\n\r\n",
        )
        .await;
        assert!(response.contains("Location: https://r.example/\r\n"));
    }

    #[tokio::test]
    async fn unknown_host_gets_404() {
        let response = run(
            &["r.example"],
            "443",
            "GET / HTTP/1.1\r\nHost: other.example\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }
}
