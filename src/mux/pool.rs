//! Mux session pool
//!
//! A fixed ring of independent `MuxConn` slots. Placement walks the
//! ring once from a random start and takes the first session below the
//! stream soft cap; the cap is advisory, so a session may briefly
//! exceed it between the check and the open. Sessions stay lazy inside
//! their slots, which keeps startup independent of the remote.

use rand::Rng;

use crate::error::{Error, Result};

use super::conn::{DialFn, MuxConn};
use super::session::MuxConfig;
use super::stream::MuxStream;

pub struct MuxPool {
    max_idle: usize,
    max_mux: usize,
    conns: Vec<MuxConn>,
}

impl MuxPool {
    pub fn new(max_idle: usize, max_mux: usize, dial: DialFn, cfg: MuxConfig) -> Self {
        let conns = (0..max_idle)
            .map(|_| MuxConn::new(dial.clone(), cfg.clone()))
            .collect();
        Self {
            max_idle,
            max_mux,
            conns,
        }
    }

    /// Fetch a stream from the least eagerly used slot reachable from a
    /// random start index. Fails once every session sits at or above
    /// the soft cap.
    pub async fn get_stream(&self) -> Result<MuxStream> {
        let start = rand::thread_rng().gen_range(0..self.max_idle);
        for step in 0..self.max_idle {
            let conn = &self.conns[(start + step) % self.max_idle];
            if conn.num_streams().await < self.max_mux {
                return conn.open_stream().await;
            }
        }
        Err(Error::PoolExhausted)
    }
}
