//! Lazily dialed mux session with reconnect
//!
//! `MuxConn` hides the session lifecycle from the agent: the first
//! `open_stream` dials the remote and installs a session; a failed open
//! on an installed session dials a replacement and retries once. All
//! mutation happens under one async lock, so at most one underlying
//! connection is ever live per slot.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::common::Stream;
use crate::error::{Error, Result};

use super::session::{MuxConfig, Session};
use super::stream::MuxStream;

/// Produces a fresh connection to the remote, typically a TLS dial.
pub type DialFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Stream>> + Send>> + Send + Sync>;

pub struct MuxConn {
    cfg: MuxConfig,
    dial: DialFn,
    session: Mutex<Option<Session>>,
}

impl MuxConn {
    /// No I/O happens here; the underlying connection is dialed on
    /// first use.
    pub fn new(dial: DialFn, cfg: MuxConfig) -> Self {
        Self {
            cfg,
            dial,
            session: Mutex::new(None),
        }
    }

    /// Open a sub-stream, dialing or replacing the underlying session
    /// as needed.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        let mut guard = self.session.lock().await;

        if guard.is_none() {
            *guard = Some(self.dial_session().await?);
        }
        let session = match guard.as_ref() {
            Some(session) => session,
            None => return Err(Error::Mux("session not installed".into())),
        };

        match session.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!("mux conn: reopening session: {}", e);
                // Leave the old session installed until the redial
                // succeeds; a dial failure here means the next call
                // starts over from a fresh dial attempt.
                let fresh = self.dial_session().await?;
                let session = guard.insert(fresh);
                session.open_stream().await
            }
        }
    }

    /// Sub-stream count of the installed session, 0 when none is
    /// installed yet.
    pub async fn num_streams(&self) -> usize {
        self.session
            .lock()
            .await
            .as_ref()
            .map(Session::num_streams)
            .unwrap_or(0)
    }

    async fn dial_session(&self) -> Result<Session> {
        let conn = (self.dial)().await?;
        Ok(Session::client(conn, self.cfg.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    /// Dial function backed by in-memory pipes. Every dial hands the
    /// far end to a server task and counts.
    fn test_dialer() -> (DialFn, Arc<AtomicUsize>, mpsc::UnboundedReceiver<Session>) {
        let dials = Arc::new(AtomicUsize::new(0));
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let counter = dials.clone();
        let dial: DialFn = Arc::new(move || {
            let counter = counter.clone();
            let server_tx = server_tx.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let (near, far) = tokio::io::duplex(64 * 1024);
                let server = Session::server(Box::new(far), MuxConfig::default());
                server_tx.send(server).expect("server sink");
                Ok(Box::new(near) as Stream)
            })
        });
        (dial, dials, server_rx)
    }

    #[tokio::test]
    async fn dial_is_deferred_until_first_open() {
        let (dial, dials, _servers) = test_dialer();
        let conn = MuxConn::new(dial, MuxConfig::default());
        assert_eq!(dials.load(Ordering::SeqCst), 0);
        assert_eq!(conn.num_streams().await, 0);
        assert_eq!(dials.load(Ordering::SeqCst), 0);

        let _stream = conn.open_stream().await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(conn.num_streams().await, 1);
    }

    #[tokio::test]
    async fn second_open_reuses_the_session() {
        let (dial, dials, _servers) = test_dialer();
        let conn = MuxConn::new(dial, MuxConfig::default());

        let _s1 = conn.open_stream().await.unwrap();
        let _s2 = conn.open_stream().await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(conn.num_streams().await, 2);
    }

    #[tokio::test]
    async fn dead_session_is_replaced_transparently() {
        let (dial, dials, mut servers) = test_dialer();
        let conn = MuxConn::new(dial, MuxConfig::default());

        let mut s1 = conn.open_stream().await.unwrap();
        let server = servers.recv().await.unwrap();

        // Kill the underlying connection.
        server.close();
        drop(server);
        s1.write_all(b"x").await.ok();
        let mut buf = [0u8; 1];
        // Wait until the client session has noticed the loss.
        let _ = s1.read(&mut buf).await;
        drop(s1);

        let mut s2 = conn.open_stream().await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2);

        // The replacement session works end to end.
        let mut server = servers.recv().await.unwrap();
        s2.write_all(b"ping").await.unwrap();
        let mut inc = server.accept_stream().await.unwrap();
        let mut out = [0u8; 4];
        inc.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");
    }
}
