//! Minimal in-process proxies for integration testing
//!
//! - [`FakeProxy::socks5`] -- SOCKS5 (RFC 1928) CONNECT, with optional
//!   username/password authentication (RFC 1929).
//! - [`FakeProxy::http`] -- HTTP `CONNECT` tunnelling with optional
//!   Basic proxy authentication.
//!
//! Once a tunnel is up bytes are forwarded verbatim. Every target the
//! proxy was asked for is recorded so tests can prove the traffic went
//! through it, and in which form (IP or hostname).

#![allow(dead_code)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const SOCKS_OK: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];
const SOCKS_REFUSED: [u8; 10] = [5, 5, 0, 1, 0, 0, 0, 0, 0, 0];
const SOCKS_UNSUPPORTED: [u8; 10] = [5, 7, 0, 1, 0, 0, 0, 0, 0, 0];

#[derive(Clone, Copy)]
enum Kind {
    Socks5,
    Http,
}

type Credentials = Option<(String, String)>;

pub struct FakeProxy {
    port: u16,
    targets: Arc<Mutex<Vec<String>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeProxy {
    pub async fn socks5(credentials: Option<(&str, &str)>) -> Self {
        Self::start(Kind::Socks5, credentials).await
    }

    pub async fn http(credentials: Option<(&str, &str)>) -> Self {
        Self::start(Kind::Http, credentials).await
    }

    async fn start(kind: Kind, credentials: Option<(&str, &str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let port = listener.local_addr().unwrap().port();
        let credentials: Credentials = credentials.map(|(u, p)| (u.to_string(), p.to_string()));
        let targets = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&targets);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let credentials = credentials.clone();
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let tunnel = match kind {
                        Kind::Socks5 => socks5_handshake(stream, credentials.as_ref()).await,
                        Kind::Http => http_handshake(stream, credentials.as_ref()).await,
                    };
                    if let Some((mut client, mut upstream, target)) = tunnel {
                        seen.lock().unwrap().push(target);
                        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
                    }
                });
            }
        });

        Self {
            port,
            targets,
            _handle: handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` of every tunnel opened so far.
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

async fn socks5_handshake(
    mut client: TcpStream,
    credentials: Option<&(String, String)>,
) -> Option<(TcpStream, TcpStream, String)> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await.ok()?;
    if head[0] != 5 {
        return None;
    }
    let mut methods = vec![0u8; usize::from(head[1])];
    client.read_exact(&mut methods).await.ok()?;

    let wanted = if credentials.is_some() { 2 } else { 0 };
    if !methods.contains(&wanted) {
        let _ = client.write_all(&[5, 0xff]).await;
        return None;
    }
    client.write_all(&[5, wanted]).await.ok()?;

    if let Some((user, pass)) = credentials {
        let mut ver_len = [0u8; 2];
        client.read_exact(&mut ver_len).await.ok()?;
        let mut got_user = vec![0u8; usize::from(ver_len[1])];
        client.read_exact(&mut got_user).await.ok()?;
        let mut pass_len = [0u8; 1];
        client.read_exact(&mut pass_len).await.ok()?;
        let mut got_pass = vec![0u8; usize::from(pass_len[0])];
        client.read_exact(&mut got_pass).await.ok()?;

        let accepted = got_user == user.as_bytes() && got_pass == pass.as_bytes();
        client.write_all(&[1, u8::from(!accepted)]).await.ok()?;
        if !accepted {
            return None;
        }
    }

    // VER CMD RSV ATYP
    let mut request = [0u8; 4];
    client.read_exact(&mut request).await.ok()?;
    let host = match request[3] {
        1 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await.ok()?;
            Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await.ok()?;
            let mut name = vec![0u8; usize::from(len[0])];
            client.read_exact(&mut name).await.ok()?;
            String::from_utf8(name).ok()?
        }
        4 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await.ok()?;
            Ipv6Addr::from(ip).to_string()
        }
        _ => return None,
    };
    let mut port = [0u8; 2];
    client.read_exact(&mut port).await.ok()?;
    let port = u16::from_be_bytes(port);

    if request[1] != 1 {
        let _ = client.write_all(&SOCKS_UNSUPPORTED).await;
        return None;
    }

    let Ok(upstream) = TcpStream::connect((host.as_str(), port)).await else {
        let _ = client.write_all(&SOCKS_REFUSED).await;
        return None;
    };
    client.write_all(&SOCKS_OK).await.ok()?;
    Some((client, upstream, format!("{host}:{port}")))
}

async fn http_handshake(
    stream: TcpStream,
    credentials: Option<&(String, String)>,
) -> Option<(TcpStream, TcpStream, String)> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await.ok()?;
    let target = request_line
        .strip_prefix("CONNECT ")?
        .split_whitespace()
        .next()?
        .to_string();

    let expected = credentials.map(|(u, p)| STANDARD.encode(format!("{u}:{p}")));
    let mut authorized = expected.is_none();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 || line == "\r\n" {
            break;
        }
        if let Some(token) = line.strip_prefix("Proxy-Authorization: Basic ") {
            authorized |= expected.as_deref() == Some(token.trim());
        }
    }

    // The client waits for our status line before sending anything else.
    let mut client = reader.into_inner();
    if !authorized {
        let _ = client
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await;
        return None;
    }

    let Ok(upstream) = TcpStream::connect(target.as_str()).await else {
        let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
        return None;
    };
    client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .ok()?;
    Some((client, upstream, target))
}
