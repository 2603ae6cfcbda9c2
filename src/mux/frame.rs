//! smux frame codec
//!
//! Eight-byte little-endian header followed by the payload:
//!
//! ```text
//! | ver(1) | cmd(1) | length(2) | sid(4) | payload... |
//! ```
//!
//! The wire format is fixed by the existing smux deployments on the
//! other side of the tunnel; both protocol versions share the header,
//! version 2 adds the UPD command for per-stream flow control.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const VERSION1: u8 = 1;
pub const VERSION2: u8 = 2;

pub const HEADER_LEN: usize = 8;

/// Largest payload carried by one PSH frame.
pub const MAX_PAYLOAD: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    /// Open a stream
    Syn,
    /// Half-close a stream
    Fin,
    /// Stream data
    Psh,
    /// Keepalive
    Nop,
    /// Flow-control window report (version 2)
    Upd,
}

impl Cmd {
    fn from_u8(value: u8) -> Option<Cmd> {
        match value {
            0 => Some(Cmd::Syn),
            1 => Some(Cmd::Fin),
            2 => Some(Cmd::Psh),
            3 => Some(Cmd::Nop),
            4 => Some(Cmd::Upd),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Cmd::Syn => 0,
            Cmd::Fin => 1,
            Cmd::Psh => 2,
            Cmd::Nop => 3,
            Cmd::Upd => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub ver: u8,
    pub cmd: Cmd,
    pub sid: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(ver: u8, cmd: Cmd, sid: u32) -> Frame {
        Frame {
            ver,
            cmd,
            sid,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(ver: u8, cmd: Cmd, sid: u32, payload: Bytes) -> Frame {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Frame {
            ver,
            cmd,
            sid,
            payload,
        }
    }

    /// UPD frame: cumulative bytes consumed plus the current window.
    pub fn update(ver: u8, sid: u32, consumed: u32, window: u32) -> Frame {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32_le(consumed);
        payload.put_u32_le(window);
        Frame {
            ver,
            cmd: Cmd::Upd,
            sid,
            payload: payload.freeze(),
        }
    }

    pub fn decode_update(&self) -> io::Result<(u32, u32)> {
        if self.payload.len() < 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "short UPD payload",
            ));
        }
        let mut p = &self.payload[..];
        Ok((p.get_u32_le(), p.get_u32_le()))
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_u8(self.ver);
        dst.put_u8(self.cmd.as_u8());
        dst.put_u16_le(self.payload.len() as u16);
        dst.put_u32_le(self.sid);
        dst.put_slice(&self.payload);
    }
}

/// Read one frame, rejecting version or command bytes the peer should
/// never send.
pub async fn read_frame<R>(reader: &mut R, expect_ver: u8) -> io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let ver = header[0];
    if ver != expect_ver {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected mux version: {}", ver),
        ));
    }
    let cmd = Cmd::from_u8(header[1]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown mux command: {}", header[1]),
        )
    })?;
    let length = u16::from_le_bytes([header[2], header[3]]) as usize;
    let sid = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        ver,
        cmd,
        sid,
        payload: payload.into(),
    })
}
