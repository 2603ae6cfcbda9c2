//! Raw TCP relay handler
//!
//! Reads nothing from the client; dials the configured upstream and
//! relays bytes until either side goes away.

use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{relay, Stream};
use crate::config::ServerConf;
use crate::error::Result;

pub async fn handle(stream: Stream, cfg: &ServerConf) -> Result<()> {
    let upstream = TcpStream::connect(&cfg.addr).await?;
    upstream.set_nodelay(true)?;
    debug!(dst = %cfg.addr, "tcp relay");
    let _ = relay(stream, upstream).await;
    Ok(())
}
