//! SNI-demultiplexing TLS server
//!
//! One TLS listener, many backends: each accepted connection finishes
//! its handshake, the negotiated ServerName selects a backend
//! descriptor, and the connection (or every sub-stream of it, when the
//! backend is multiplexed) is handed to that backend's protocol
//! handler.

mod redirect;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::common::{accept, Stream};
use crate::config::{self, Config, ServerConf};
use crate::error::Result;
use crate::handler;
use crate::mux::{MuxConfig, Session};
use crate::tls;

pub struct Server {
    acceptor: TlsAcceptor,
    ln: TcpListener,
    https_port: String,
    http_redirect: bool,
    confs: Arc<HashMap<String, Arc<ServerConf>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Server {
    pub async fn new(cfg: &Config) -> Result<Server> {
        let confs: HashMap<String, Arc<ServerConf>> = config::load_server_conf(&cfg.conf)?
            .into_iter()
            .map(|(sni, conf)| (sni, Arc::new(conf)))
            .collect();
        let tls_config = tls::server_config(&cfg.tls)?;
        let ln = TcpListener::bind(&cfg.addr).await?;

        Ok(Server {
            acceptor: TlsAcceptor::from(tls_config),
            ln,
            https_port: cfg.https_port().to_string(),
            http_redirect: cfg.http_redirect,
            confs: Arc::new(confs),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.ln.local_addr()?)
    }

    /// Accept loop. Transient accept errors back off and retry; any
    /// other accept error is fatal and propagates to the caller.
    pub async fn serve(&self) -> Result<()> {
        info!("start listening {}", self.ln.local_addr()?);
        if self.http_redirect {
            tokio::spawn(redirect::serve(
                self.confs.clone(),
                self.https_port.clone(),
                self.shutdown.clone(),
            ));
        }

        let mut delay = Duration::ZERO;
        loop {
            let (socket, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                result = self.ln.accept() => match result {
                    Ok(conn) => conn,
                    Err(e) if accept::is_transient(&e) => {
                        delay = accept::next_delay(delay);
                        error!("server: accept error: {}; retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
            };
            delay = Duration::ZERO;
            let _ = socket.set_nodelay(true);

            let acceptor = self.acceptor.clone();
            let confs = self.confs.clone();
            self.tracker
                .spawn(async move { handle_conn(acceptor, socket, peer, confs).await });
        }
    }

    /// Graceful shutdown: stop accepting, then wait for in-flight
    /// handlers to drain.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn handle_conn(
    acceptor: TlsAcceptor,
    socket: TcpStream,
    peer: SocketAddr,
    confs: Arc<HashMap<String, Arc<ServerConf>>>,
) {
    let local = match socket.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(remote = %peer, "local_addr: {}", e);
            return;
        }
    };
    let tls_stream = match acceptor.accept(socket).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(remote = %peer, "tls handshake: {}", e);
            return;
        }
    };

    let (sni, tls_info) = {
        let (_, session) = tls_stream.get_ref();
        let sni = session
            .server_name()
            .map(str::to_owned)
            .unwrap_or_else(|| "empty".to_string());
        (sni, tls::tls_format(session))
    };
    let conf = match confs.get(&sni) {
        Some(conf) => conf.clone(),
        None => {
            error!(remote = %peer, "invalid SNI: {}", sni);
            return;
        }
    };

    info!(
        remote = %peer,
        mode = %conf.conn_mode(),
        sni = %sni,
        tls = %tls_info,
        "open conn"
    );
    let stream: Stream = Box::new(tls_stream);
    if conf.mux {
        serve_mux_session(stream, conf, peer, local).await;
    } else if let Err(e) = handler::dispatch(stream, &conf, peer, local).await {
        error!(remote = %peer, sni = %sni, "handler: {}", e);
    }
    info!(remote = %peer, sni = %sni, "close conn");
}

/// Accept sub-streams until the underlying connection dies; every
/// sub-stream gets its own handler task.
async fn serve_mux_session(
    stream: Stream,
    conf: Arc<ServerConf>,
    peer: SocketAddr,
    local: SocketAddr,
) {
    let mut session = Session::server(stream, MuxConfig::with_version(conf.mux_v2));
    loop {
        match session.accept_stream().await {
            Ok(sub) => {
                let conf = conf.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler::dispatch(Box::new(sub), &conf, peer, local).await {
                        error!(remote = %peer, "mux handler: {}", e);
                    }
                });
            }
            Err(e) => {
                debug!(remote = %peer, "mux accept: {}", e);
                return;
            }
        }
    }
}
