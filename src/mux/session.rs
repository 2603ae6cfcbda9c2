//! Mux session
//!
//! One session multiplexes many sub-streams over a single reliable byte
//! stream. A receive loop parses frames and routes payloads to their
//! streams (SYNs become accepted streams); a write loop serializes
//! frames from one shared queue onto the wire, which keeps SYN, PSH and
//! FIN in submission order; a keepalive loop emits NOPs. A peer that
//! stays silent past the keepalive timeout kills the session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::Stream;
use crate::error::{Error, Result};

use super::frame::{read_frame, Cmd, Frame, HEADER_LEN, MAX_PAYLOAD, VERSION2};
use super::stream::{MuxStream, SendWindow, INITIAL_WINDOW};

/// Session parameters. The version byte must match the peer exactly.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub version: u8,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            version: 1,
            keep_alive_interval: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(30),
        }
    }
}

impl MuxConfig {
    pub fn with_version(v2: bool) -> Self {
        Self {
            version: if v2 { 2 } else { 1 },
            ..Default::default()
        }
    }
}

/// Frames in flight toward the write loop.
const FRAME_BACKLOG: usize = 64;
/// Accepted streams not yet picked up.
const ACCEPT_BACKLOG: usize = 64;
/// Received chunks buffered per stream.
const STREAM_BACKLOG: usize = 32;

struct StreamSlot {
    /// Delivery channel for received payloads; dropped on FIN so the
    /// stream observes EOF.
    data: Option<mpsc::Sender<Bytes>>,
    window: Option<Arc<SendWindow>>,
}

/// State shared between the session handle, its streams and its loops.
pub(crate) struct Shared {
    streams: Mutex<HashMap<u32, StreamSlot>>,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn remove_stream(&self, sid: u32) {
        self.streams.lock().remove(&sid);
    }

    fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut streams = self.streams.lock();
        for slot in streams.values_mut() {
            slot.data = None;
            if let Some(window) = &slot.window {
                window.close();
            }
        }
    }
}

pub struct Session {
    cfg: MuxConfig,
    shared: Arc<Shared>,
    frame_tx: mpsc::Sender<Frame>,
    accept_rx: mpsc::Receiver<MuxStream>,
    next_sid: AtomicU32,
    token: CancellationToken,
}

impl Session {
    /// Client side: locally opened stream ids are odd.
    pub fn client(stream: Stream, cfg: MuxConfig) -> Session {
        Session::start(stream, cfg, 1)
    }

    /// Server side: locally opened stream ids are even.
    pub fn server(stream: Stream, cfg: MuxConfig) -> Session {
        Session::start(stream, cfg, 2)
    }

    fn start(stream: Stream, cfg: MuxConfig, first_sid: u32) -> Session {
        let (read_half, write_half) = tokio::io::split(stream);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_BACKLOG);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let token = CancellationToken::new();

        tokio::spawn(recv_loop(
            read_half,
            shared.clone(),
            cfg.clone(),
            frame_tx.clone(),
            accept_tx,
            token.clone(),
        ));
        tokio::spawn(send_loop(write_half, frame_rx, token.clone()));
        tokio::spawn(keep_alive(frame_tx.clone(), cfg.clone(), token.clone()));

        Session {
            cfg,
            shared,
            frame_tx,
            accept_rx,
            next_sid: AtomicU32::new(first_sid),
            token,
        }
    }

    /// Open a new sub-stream toward the peer.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Mux("session closed".into()));
        }
        let sid = self.next_sid.fetch_add(2, Ordering::SeqCst);
        let stream = register_stream(&self.shared, &self.frame_tx, sid, &self.cfg);
        self.frame_tx
            .send(Frame::new(self.cfg.version, Cmd::Syn, sid))
            .await
            .map_err(|_| Error::Mux("session closed".into()))?;
        Ok(stream)
    }

    /// Wait for the peer to open a sub-stream. Errors once the session
    /// is gone.
    pub async fn accept_stream(&mut self) -> Result<MuxStream> {
        self.accept_rx
            .recv()
            .await
            .ok_or_else(|| Error::Mux("session closed".into()))
    }

    /// Number of currently open sub-streams.
    pub fn num_streams(&self) -> usize {
        self.shared.streams.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.token.cancel();
        self.shared.teardown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn register_stream(
    shared: &Arc<Shared>,
    frame_tx: &mpsc::Sender<Frame>,
    sid: u32,
    cfg: &MuxConfig,
) -> MuxStream {
    let (tx, rx) = mpsc::channel(STREAM_BACKLOG);
    let window = (cfg.version == VERSION2).then(|| Arc::new(SendWindow::new(INITIAL_WINDOW)));
    shared.streams.lock().insert(
        sid,
        StreamSlot {
            data: Some(tx),
            window: window.clone(),
        },
    );
    MuxStream::new(sid, cfg.version, shared.clone(), frame_tx.clone(), rx, window)
}

async fn recv_loop(
    mut reader: ReadHalf<Stream>,
    shared: Arc<Shared>,
    cfg: MuxConfig,
    frame_tx: mpsc::Sender<Frame>,
    accept_tx: mpsc::Sender<MuxStream>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            result = timeout(cfg.keep_alive_timeout, read_frame(&mut reader, cfg.version)) => {
                match result {
                    Err(_) => {
                        debug!("mux: keepalive timeout");
                        break;
                    }
                    Ok(Err(e)) => {
                        debug!("mux: recv: {}", e);
                        break;
                    }
                    Ok(Ok(frame)) => frame,
                }
            }
        };

        match frame.cmd {
            Cmd::Nop => {}
            Cmd::Syn => {
                if shared.streams.lock().contains_key(&frame.sid) {
                    continue;
                }
                let stream = register_stream(&shared, &frame_tx, frame.sid, &cfg);
                if accept_tx.send(stream).await.is_err() {
                    break;
                }
            }
            Cmd::Psh => {
                let sender = shared
                    .streams
                    .lock()
                    .get(&frame.sid)
                    .and_then(|slot| slot.data.clone());
                if let Some(sender) = sender {
                    // A dropped receiver means the stream is gone
                    // locally; the payload is discarded.
                    let _ = sender.send(frame.payload).await;
                }
            }
            Cmd::Fin => {
                if let Some(slot) = shared.streams.lock().get_mut(&frame.sid) {
                    slot.data = None;
                }
            }
            Cmd::Upd => {
                if let Ok((consumed, window)) = frame.decode_update() {
                    let send_window = shared
                        .streams
                        .lock()
                        .get(&frame.sid)
                        .and_then(|slot| slot.window.clone());
                    if let Some(send_window) = send_window {
                        send_window.expand(consumed, window);
                    }
                }
            }
        }
    }

    token.cancel();
    shared.teardown();
}

async fn send_loop(
    mut writer: WriteHalf<Stream>,
    mut frame_rx: mpsc::Receiver<Frame>,
    token: CancellationToken,
) {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + MAX_PAYLOAD);
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        buf.clear();
        frame.encode(&mut buf);
        if writer.write_all(&buf).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    token.cancel();
    let _ = writer.shutdown().await;
}

async fn keep_alive(frame_tx: mpsc::Sender<Frame>, cfg: MuxConfig, token: CancellationToken) {
    let mut ticker = tokio::time::interval(cfg.keep_alive_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if frame_tx
                    .send(Frame::new(cfg.version, Cmd::Nop, 0))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}
