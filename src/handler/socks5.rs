//! SOCKS5 server-side handler
//!
//! RFC 1928 with RFC 1929 username/password authentication. Only
//! CONNECT is implemented; BIND and UDP ASSOCIATE are answered with
//! `command not supported` so well-behaved clients get a reply frame
//! instead of a dropped connection.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tracing::info;

use crate::common::{relay, Address, Stream};
use crate::config::ServerConf;
use crate::error::{Error, Result};

const VER: u8 = 0x05;
const RSV: u8 = 0x00;

const AUTH_NONE: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const AUTH_USER_PASS_VER: u8 = 0x01;
const AUTH_STATUS_SUCCESS: u8 = 0x00;
const AUTH_STATUS_FAILURE: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

pub async fn handle(mut stream: Stream, cfg: &ServerConf) -> Result<()> {
    handshake(&mut stream, &cfg.auth).await?;
    let dst = read_request(&mut stream).await?;

    info!(dst = %dst, "open destination");
    let upstream = connect_upstream(&mut stream, &dst).await?;
    let bound = upstream.local_addr()?;
    write_success(&mut stream, bound).await?;

    let _ = relay(stream, upstream).await;
    info!(dst = %dst, "close destination");
    Ok(())
}

/// Method negotiation plus, when credentials are configured, the
/// username/password subnegotiation.
async fn handshake(stream: &mut Stream, auth: &str) -> Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VER {
        return Err(Error::Protocol(format!(
            "unsupported SOCKS version: {:#04x}",
            head[0]
        )));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    let wanted = if auth.is_empty() {
        AUTH_NONE
    } else {
        AUTH_USER_PASS
    };
    if !methods.contains(&wanted) {
        stream.write_all(&[VER, AUTH_NO_ACCEPTABLE]).await?;
        return Err(Error::Protocol(format!(
            "no acceptable auth method in {:?}",
            methods
        )));
    }
    stream.write_all(&[VER, wanted]).await?;

    if auth.is_empty() {
        return Ok(());
    }

    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;
    if ver[0] != AUTH_USER_PASS_VER {
        return Err(Error::Protocol(format!(
            "invalid auth version: {:#04x}",
            ver[0]
        )));
    }
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut user = vec![0u8; len[0] as usize];
    stream.read_exact(&mut user).await?;
    stream.read_exact(&mut len).await?;
    let mut pass = vec![0u8; len[0] as usize];
    stream.read_exact(&mut pass).await?;

    let mut candidate = user;
    candidate.push(b':');
    candidate.extend_from_slice(&pass);
    if candidate != auth.as_bytes() {
        stream
            .write_all(&[AUTH_USER_PASS_VER, AUTH_STATUS_FAILURE])
            .await?;
        return Err(Error::Auth);
    }
    stream
        .write_all(&[AUTH_USER_PASS_VER, AUTH_STATUS_SUCCESS])
        .await?;
    Ok(())
}

async fn read_request(stream: &mut Stream) -> Result<Address> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VER {
        return Err(Error::Protocol(format!(
            "unsupported SOCKS version: {:#04x}",
            head[0]
        )));
    }
    if head[1] != CMD_CONNECT {
        write_failure(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::Protocol(format!(
            "unsupported command: {:#04x}",
            head[1]
        )));
    }

    let dst = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = read_port(stream).await?;
            Address::Socket(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(Error::Protocol("empty domain in request".into()));
            }
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let port = read_port(stream).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::Protocol("non-UTF-8 domain in request".into()))?;
            Address::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = read_port(stream).await?;
            Address::Socket(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        other => {
            write_failure(stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(Error::Protocol(format!(
                "unsupported address type: {:#04x}",
                other
            )));
        }
    };
    Ok(dst)
}

async fn read_port(stream: &mut Stream) -> Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// Dial the target, translating failures into the protocol's reply
/// codes: name resolution errors are host-unreachable, everything else
/// a general server failure.
async fn connect_upstream(stream: &mut Stream, dst: &Address) -> Result<TcpStream> {
    let result = match dst {
        Address::Socket(addr) => TcpStream::connect(addr)
            .await
            .map_err(|e| (REP_GENERAL_FAILURE, e)),
        Address::Domain(domain, port) => match lookup_host((domain.as_str(), *port)).await {
            Err(e) => Err((REP_HOST_UNREACHABLE, e)),
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    Err((
                        REP_HOST_UNREACHABLE,
                        io::Error::new(io::ErrorKind::NotFound, "name resolved to no addresses"),
                    ))
                } else {
                    connect_any(&addrs)
                        .await
                        .map_err(|e| (REP_GENERAL_FAILURE, e))
                }
            }
        },
    };

    match result {
        Ok(conn) => {
            conn.set_nodelay(true)?;
            Ok(conn)
        }
        Err((rep, e)) => {
            let _ = write_failure(stream, rep).await;
            Err(e.into())
        }
    }
}

async fn connect_any(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(conn) => return Ok(conn),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

/// Failure replies carry a zeroed IPv4 bound address.
async fn write_failure(stream: &mut Stream, rep: u8) -> Result<()> {
    stream
        .write_all(&[VER, rep, RSV, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Success reply carrying the local side of the dialed socket.
async fn write_success(stream: &mut Stream, bound: SocketAddr) -> Result<()> {
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[VER, REP_SUCCEEDED, RSV]);
    match bound {
        SocketAddr::V4(v4) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&v6.ip().octets());
        }
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_listener() -> SocketAddr {
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

    fn spawn_handler(cfg: ServerConf) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(8192);
        let handle = tokio::spawn(async move { handle(Box::new(server), &cfg).await });
        (client, handle)
    }

    #[tokio::test]
    async fn no_auth_connect_round_trip() {
        let echo = echo_listener().await;
        let (mut client, handler) = spawn_handler(ServerConf::default());

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        // Bound address is the local side of the dialed socket, never
        // the zero address.
        assert_ne!(&reply[4..10], &[0, 0, 0, 0, 0, 0]);

        client.write_all(b"ping\n").await.unwrap();
        let mut out = [0u8; 5];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping\n");

        drop(client);
        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn request_parse_is_idempotent_over_the_wire_bytes() {
        // Parsing the same serialized request twice yields the same
        // target.
        let raw = [0x05u8, 0x01, 0x00, 0x03, 0x04, b't', b'e', b's', b't', 0x1f, 0x90];
        for _ in 0..2 {
            let (mut client, server) = tokio::io::duplex(256);
            client.write_all(&raw).await.unwrap();
            let mut server: Stream = Box::new(server);
            let dst = read_request(&mut server).await.unwrap();
            assert_eq!(dst, Address::Domain("test".to_string(), 8080));
        }
    }

    #[tokio::test]
    async fn auth_success_then_connect() {
        let echo = echo_listener().await;
        let cfg = ServerConf {
            auth: "u:p".to_string(),
            ..Default::default()
        };
        let (mut client, _handler) = spawn_handler(cfg);

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02]);

        client
            .write_all(&[0x01, 0x01, b'u', 0x01, b'p'])
            .await
            .unwrap();
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut connect_reply = [0u8; 10];
        client.read_exact(&mut connect_reply).await.unwrap();
        assert_eq!(connect_reply[1], 0x00);
    }

    #[tokio::test]
    async fn auth_failure_replies_and_closes_without_dialing() {
        let cfg = ServerConf {
            auth: "u:p".to_string(),
            ..Default::default()
        };
        let (mut client, handler) = spawn_handler(cfg);

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02]);

        client
            .write_all(&[0x01, 0x01, b'u', 0x01, b'x'])
            .await
            .unwrap();
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x01]);

        // The handler bails before ever reading a request.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(handler.await.unwrap(), Err(Error::Auth)));
    }

    #[tokio::test]
    async fn bind_and_udp_associate_are_rejected_with_rep7() {
        for cmd in [0x02u8, 0x03] {
            let (mut client, handler) = spawn_handler(ServerConf::default());

            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).await.unwrap();

            client
                .write_all(&[0x05, cmd, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
                .await
                .unwrap();
            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply[..4], &[0x05, 0x07, 0x00, 0x01]);
            assert!(handler.await.unwrap().is_err());
        }
    }

    #[tokio::test]
    async fn zero_length_domain_is_a_parse_error() {
        let (mut client, handler) = spawn_handler(ServerConf::default());

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x03, 0x00, 0x00, 0x50])
            .await
            .unwrap();
        assert!(matches!(
            handler.await.unwrap(),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn unknown_address_type_gets_rep8() {
        let (mut client, handler) = spawn_handler(ServerConf::default());

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 1, 2, 3, 4, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x08);
        assert!(handler.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn refused_dial_maps_to_general_failure() {
        let doomed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = doomed.local_addr().unwrap();
        drop(doomed);

        let (mut client, handler) = spawn_handler(ServerConf::default());

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x01);
        assert!(handler.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn resolution_failure_maps_to_host_unreachable() {
        // An empty host name fails address lookup locally, before any
        // resolver is consulted, so the test never touches DNS.
        let (mut client, server) = tokio::io::duplex(256);
        let mut server: Stream = Box::new(server);
        let dst = Address::Domain(String::new(), 80);

        let result = connect_upstream(&mut server, &dst).await;
        assert!(result.is_err());

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x04, 0x00, 0x01]);
    }
}
