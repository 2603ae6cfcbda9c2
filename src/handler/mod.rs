//! Protocol handlers
//!
//! One handler per backend mode, each a state machine over an opaque
//! byte stream. `auto` peeks a single byte to tell SOCKS5 from HTTP and
//! replays it through a buffered adapter, so the chosen handler never
//! knows the difference.

pub mod https;
pub mod socks5;
pub mod tcp;

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;

use crate::common::{PrependStream, Stream};
use crate::config::{BackendMode, ServerConf};
use crate::error::Result;

/// Run the backend's protocol handler on one (sub-)stream.
pub async fn dispatch(
    stream: Stream,
    cfg: &ServerConf,
    peer: SocketAddr,
    local: SocketAddr,
) -> Result<()> {
    match cfg.mode {
        BackendMode::Tcp => tcp::handle(stream, cfg).await,
        BackendMode::Socks5 => socks5::handle(stream, cfg).await,
        BackendMode::Https => https::handle(stream, cfg, peer, local).await,
        BackendMode::Auto => {
            let mut stream = stream;
            let mut first = [0u8; 1];
            stream.read_exact(&mut first).await?;
            let stream: Stream =
                Box::new(PrependStream::new(BytesMut::from(&first[..]), stream));
            if first[0] == 0x05 {
                socks5::handle(stream, cfg).await
            } else {
                https::handle(stream, cfg, peer, local).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "198.51.100.7:50000".parse().unwrap(),
            "203.0.113.1:443".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn auto_first_byte_05_dispatches_socks5() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let cfg = ServerConf {
            mode: BackendMode::Auto,
            sni: "a.example".to_string(),
            ..Default::default()
        };
        let (mut client, server) = tokio::io::duplex(4096);
        let (peer, local) = addrs();
        let handler =
            tokio::spawn(async move { dispatch(Box::new(server), &cfg, peer, local).await });

        // The first SOCKS byte doubles as the peeked mode selector; the
        // handler must still see it as part of the greeting.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&echo_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[0x05, 0x00]);

        client.write_all(b"hello").await.unwrap();
        let mut out = [0u8; 5];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello");

        drop(client);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn auto_other_first_byte_dispatches_http() {
        let cfg = ServerConf {
            mode: BackendMode::Auto,
            sni: "a.example".to_string(),
            disable_forward_proxy: true,
            ..Default::default()
        };
        let (mut client, server) = tokio::io::duplex(4096);
        let (peer, local) = addrs();
        let handler =
            tokio::spawn(async move { dispatch(Box::new(server), &cfg, peer, local).await });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: other.example\r\n\r\n")
            .await
            .unwrap();

        // Forward proxying is disabled and the host is not the site:
        // the handler closes without writing a byte.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        handler.await.unwrap().unwrap();
    }
}
