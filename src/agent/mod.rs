//! Tunneling agent
//!
//! For each configured endpoint, a plaintext listener accepts local
//! connections and carries each one to the remote server over TLS:
//! either a fresh connection per client, one shared mux session, or a
//! pool of mux sessions.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::common::{accept, relay, Stream};
use crate::config::{self, AgentConf, Config};
use crate::error::{Error, Result};
use crate::mux::{DialFn, MuxConfig, MuxConn, MuxPool};

/// Agent runtime: one `Listener` per endpoint file.
pub struct Agent {
    listeners: Vec<Arc<Listener>>,
}

impl Agent {
    pub async fn new(cfg: &Config) -> Result<Agent> {
        let confs = config::load_agent_conf(&cfg.conf)?;
        let client_cfg = crate::tls::client_config();

        let mut listeners = Vec::with_capacity(confs.len());
        for conf in confs {
            let ln = TcpListener::bind(&conf.local).await.map_err(|e| {
                Error::Config(format!("failed to bind {}: {}", conf.local, e))
            })?;
            let dial = tls_dial_fn(client_cfg.clone(), &conf)?;
            listeners.push(Listener::with_dial(ln, conf, dial));
        }
        Ok(Agent { listeners })
    }

    /// Start every listener's accept loop in the background.
    pub fn serve(&self) {
        for listener in &self.listeners {
            let listener = listener.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.serve().await {
                    error!("agent: accept error: {}", e);
                    std::process::exit(1);
                }
            });
        }
    }

    /// Graceful shutdown across all listeners.
    pub async fn close(&self) {
        for listener in &self.listeners {
            listener.close().await;
        }
    }
}

/// One local endpoint: tcp, mux-tcp or mux-pool transport to the
/// remote.
pub struct Listener {
    ln: TcpListener,
    cfg: AgentConf,
    dial: DialFn,
    conn: Option<MuxConn>,
    pool: Option<MuxPool>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Listener {
    /// Assemble a listener around an arbitrary dial function. Mux
    /// sessions stay unopened until the first client arrives.
    fn with_dial(ln: TcpListener, cfg: AgentConf, dial: DialFn) -> Arc<Listener> {
        let mux_cfg = MuxConfig::with_version(cfg.mux_v2);
        let (conn, pool) = if cfg.mux {
            if cfg.pool {
                (
                    None,
                    Some(MuxPool::new(
                        cfg.max_idle(),
                        cfg.max_mux(),
                        dial.clone(),
                        mux_cfg,
                    )),
                )
            } else {
                (Some(MuxConn::new(dial.clone(), mux_cfg)), None)
            }
        } else {
            (None, None)
        };

        Arc::new(Listener {
            ln,
            cfg,
            dial,
            conn,
            pool,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    async fn serve(self: Arc<Self>) -> Result<()> {
        info!("start listening {}", self.ln.local_addr()?);
        let mut delay = std::time::Duration::ZERO;
        loop {
            let (socket, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                result = self.ln.accept() => match result {
                    Ok(conn) => conn,
                    Err(e) if accept::is_transient(&e) => {
                        delay = accept::next_delay(delay);
                        error!("agent: accept error: {}; retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
            };
            delay = std::time::Duration::ZERO;
            let _ = socket.set_nodelay(true);

            let listener = self.clone();
            self.tracker.spawn(async move {
                info!(
                    mode = listener.cfg.conn_mode(),
                    sni = %listener.cfg.sni,
                    remote = %peer,
                    "open conn"
                );
                listener.handle_conn(socket).await;
                info!(remote = %peer, "close conn");
            });
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn handle_conn(&self, socket: TcpStream) {
        if let Some(pool) = &self.pool {
            match pool.get_stream().await {
                Ok(stream) => {
                    let _ = relay(socket, stream).await;
                }
                Err(e) => error!("pool.get_stream: {}", e),
            }
        } else if let Some(conn) = &self.conn {
            match conn.open_stream().await {
                Ok(stream) => {
                    let _ = relay(socket, stream).await;
                }
                Err(e) => error!("conn.open_stream: {}", e),
            }
        } else {
            match (self.dial)().await {
                Ok(stream) => {
                    let _ = relay(socket, stream).await;
                }
                Err(e) => error!("dial: {}", e),
            }
        }
    }
}

/// Dial function producing a fresh TLS connection to the endpoint's
/// remote, with its configured ServerName.
fn tls_dial_fn(client_cfg: Arc<ClientConfig>, conf: &AgentConf) -> Result<DialFn> {
    let server_name = ServerName::try_from(conf.sni.clone())
        .map_err(|_| Error::InvalidAddress(format!("invalid SNI: {}", conf.sni)))?;
    let connector = TlsConnector::from(client_cfg);
    let remote = conf.remote.clone();

    Ok(Arc::new(move || {
        let connector = connector.clone();
        let server_name = server_name.clone();
        let remote = remote.clone();
        Box::pin(async move {
            let socket = TcpStream::connect(&remote).await?;
            socket.set_nodelay(true)?;
            let stream = connector.connect(server_name, socket).await?;
            Ok(Box::new(stream) as Stream)
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Session;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Dial function that opens plain TCP connections to `addr`,
    /// standing in for the TLS dial.
    fn tcp_dialer(addr: std::net::SocketAddr) -> DialFn {
        Arc::new(move || {
            Box::pin(async move {
                let socket = TcpStream::connect(addr).await?;
                Ok(Box::new(socket) as Stream)
            })
        })
    }

    async fn echo_listener() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// Remote that speaks the mux server side and echoes every
    /// sub-stream.
    async fn mux_echo_listener() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut session = Session::server(Box::new(conn), MuxConfig::default());
                    while let Ok(mut sub) = session.accept_stream().await {
                        tokio::spawn(async move {
                            let mut buf = [0u8; 1024];
                            loop {
                                match sub.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if sub.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        });
                    }
                });
            }
        });
        addr
    }

    async fn start_listener(cfg: AgentConf, dial: DialFn) -> (Arc<Listener>, std::net::SocketAddr) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let listener = Listener::with_dial(ln, cfg, dial);
        {
            let listener = listener.clone();
            tokio::spawn(listener.serve());
        }
        (listener, addr)
    }

    #[tokio::test]
    async fn plain_endpoint_relays_through_a_fresh_dial() {
        let upstream = echo_listener().await;
        let (_listener, addr) =
            start_listener(AgentConf::default(), tcp_dialer(upstream)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello tunnel").await.unwrap();
        let mut out = [0u8; 12];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello tunnel");
    }

    #[tokio::test]
    async fn mux_endpoint_shares_one_session() {
        let upstream = mux_echo_listener().await;
        let cfg = AgentConf {
            mux: true,
            ..Default::default()
        };
        let (_listener, addr) = start_listener(cfg, tcp_dialer(upstream)).await;

        for payload in [&b"first"[..], &b"second"[..]] {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(payload).await.unwrap();
            let mut out = vec![0u8; payload.len()];
            client.read_exact(&mut out).await.unwrap();
            assert_eq!(out, payload);
        }
    }

    #[tokio::test]
    async fn pool_endpoint_relays_concurrent_clients() {
        let upstream = mux_echo_listener().await;
        let cfg = AgentConf {
            mux: true,
            pool: true,
            max_idle: 2,
            max_mux: 4,
            ..Default::default()
        };
        let (_listener, addr) = start_listener(cfg, tcp_dialer(upstream)).await;

        let mut tasks = Vec::new();
        for i in 0..4u8 {
            tasks.push(tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let payload = [i; 16];
                client.write_all(&payload).await.unwrap();
                let mut out = [0u8; 16];
                client.read_exact(&mut out).await.unwrap();
                assert_eq!(out, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }
}
