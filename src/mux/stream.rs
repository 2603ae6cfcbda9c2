//! Mux sub-stream
//!
//! A `MuxStream` is one logical byte stream inside a session. Reads
//! drain chunks the session's receive loop parked for this stream id;
//! writes hand PSH frames to the session's write loop. FIN travels the
//! same queue as PSH so close never overtakes data. Version 2
//! additionally keeps the peer's advertised window and blocks writers
//! when it runs dry.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::PollSender;

use super::frame::{Cmd, Frame, MAX_PAYLOAD, VERSION2};
use super::session::Shared;

/// Initial per-stream receive window (version 2).
pub(crate) const INITIAL_WINDOW: u32 = 64 * 1024;

/// Report consumption once half the window has been read.
const UPDATE_THRESHOLD: u32 = INITIAL_WINDOW / 2;

pub struct MuxStream {
    sid: u32,
    ver: u8,
    shared: Arc<Shared>,
    frame_tx: PollSender<Frame>,
    /// Same channel as `frame_tx`, for fire-and-forget frames from
    /// non-async contexts (UPD reports, drop-time FIN).
    raw_tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Bytes>,
    chunk: Option<Bytes>,
    window: Option<Arc<SendWindow>>,
    total_consumed: u32,
    unacked: u32,
    fin_sent: bool,
}

impl MuxStream {
    pub(crate) fn new(
        sid: u32,
        ver: u8,
        shared: Arc<Shared>,
        raw_tx: mpsc::Sender<Frame>,
        rx: mpsc::Receiver<Bytes>,
        window: Option<Arc<SendWindow>>,
    ) -> Self {
        Self {
            sid,
            ver,
            shared,
            frame_tx: PollSender::new(raw_tx.clone()),
            raw_tx,
            rx,
            chunk: None,
            window,
            total_consumed: 0,
            unacked: 0,
            fin_sent: false,
        }
    }

    /// Stream id within the session.
    pub fn id(&self) -> u32 {
        self.sid
    }

    fn after_read(&mut self, n: u32) {
        if self.ver != VERSION2 {
            return;
        }
        self.total_consumed = self.total_consumed.wrapping_add(n);
        self.unacked += n;
        if self.unacked >= UPDATE_THRESHOLD {
            let report = Frame::update(self.ver, self.sid, self.total_consumed, INITIAL_WINDOW);
            // A full queue just delays the report; it is retried on the
            // next read.
            if self.raw_tx.try_send(report).is_ok() {
                self.unacked = 0;
            }
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if let Some(chunk) = &mut this.chunk {
                let n = chunk.len().min(buf.remaining());
                let front = chunk.split_to(n);
                buf.put_slice(&front);
                if chunk.is_empty() {
                    this.chunk = None;
                }
                this.after_read(n as u32);
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    if !bytes.is_empty() {
                        this.chunk = Some(bytes);
                    }
                }
                // Peer sent FIN or the session died: EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.frame_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Poll::Ready(Err(broken_pipe())),
            Poll::Pending => return Poll::Pending,
        }

        let mut n = buf.len().min(MAX_PAYLOAD);
        if let Some(window) = &this.window {
            n = match window.poll_consume(cx, n) {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
        }

        let frame = Frame::with_payload(
            this.ver,
            Cmd::Psh,
            this.sid,
            Bytes::copy_from_slice(&buf[..n]),
        );
        if this.frame_tx.send_item(frame).is_err() {
            return Poll::Ready(Err(broken_pipe()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the session write loop.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Ok(()));
        }
        match this.frame_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let _ = this
                    .frame_tx
                    .send_item(Frame::new(this.ver, Cmd::Fin, this.sid));
                this.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            // Session gone, nothing left to half-close.
            Poll::Ready(Err(_)) => {
                this.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.fin_sent {
            let fin = Frame::new(self.ver, Cmd::Fin, self.sid);
            match self.raw_tx.try_send(fin) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(fin)) => {
                    // Queue full: hand the FIN to a task. It still
                    // lands behind every frame already queued.
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        let tx = self.raw_tx.clone();
                        handle.spawn(async move {
                            let _ = tx.send(fin).await;
                        });
                    }
                }
            }
        }
        self.shared.remove_stream(self.sid);
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mux session closed")
}

/// Peer-advertised send budget for one version-2 stream.
///
/// The peer reports `(consumed, window)` in UPD frames; the writer may
/// have at most `consumed + window - sent` bytes outstanding.
pub(crate) struct SendWindow {
    state: Mutex<WindowState>,
}

struct WindowState {
    sent: u64,
    acked: u64,
    prev_consumed: u32,
    window: u32,
    closed: bool,
    waker: Option<Waker>,
}

impl SendWindow {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(WindowState {
                sent: 0,
                acked: 0,
                prev_consumed: 0,
                window: initial,
                closed: false,
                waker: None,
            }),
        }
    }

    pub(crate) fn poll_consume(&self, cx: &mut Context<'_>, want: usize) -> Poll<io::Result<usize>> {
        let mut state = self.state.lock();
        if state.closed {
            return Poll::Ready(Err(broken_pipe()));
        }
        let remaining = (state.acked + state.window as u64).saturating_sub(state.sent);
        if remaining == 0 {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = want.min(remaining as usize);
        state.sent += n as u64;
        Poll::Ready(Ok(n))
    }

    pub(crate) fn expand(&self, consumed: u32, window: u32) {
        let mut state = self.state.lock();
        let delta = consumed.wrapping_sub(state.prev_consumed);
        state.prev_consumed = consumed;
        state.acked += delta as u64;
        state.window = window;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;

    #[tokio::test]
    async fn window_blocks_at_zero_and_resumes_on_update() {
        let window = Arc::new(SendWindow::new(8));

        let n = poll_fn(|cx| window.poll_consume(cx, 16)).await.unwrap();
        assert_eq!(n, 8);

        // Budget exhausted: consume must park until the peer reports
        // progress.
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { poll_fn(|cx| window.poll_consume(cx, 4)).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        window.expand(8, 8);
        assert_eq!(waiter.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn window_close_fails_writers() {
        let window = Arc::new(SendWindow::new(0));
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { poll_fn(|cx| window.poll_consume(cx, 1)).await })
        };
        tokio::task::yield_now().await;
        window.close();
        assert!(waiter.await.unwrap().is_err());
    }
}
