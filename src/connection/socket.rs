//! TCP sockets and the optional TLS upgrade.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::options::IpFamily;

/// The connection's transport: plain TCP, or TCP upgraded to TLS after the
/// server's INFO.
pub(crate) enum Stream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Resolves `host:port` and connects, honoring the address-family
/// preference. Addresses are tried in order until one accepts; the caller
/// bounds the whole thing with the connect timeout.
pub(crate) async fn open_tcp(host: &str, port: u16, family: IpFamily) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    let ordered = order_addrs(addrs, family);
    if ordered.is_empty() {
        return Err(Error::NoServer);
    }

    let mut last_err: Option<io::Error> = None;
    for addr in ordered {
        debug!(%addr, "connect: dialing");
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.map_or(Error::NoServer, Error::Io))
}

fn order_addrs(addrs: Vec<SocketAddr>, family: IpFamily) -> Vec<SocketAddr> {
    if family == IpFamily::Any {
        return addrs;
    }
    let (v4, v6): (Vec<_>, Vec<_>) = addrs.into_iter().partition(SocketAddr::is_ipv4);
    match family {
        IpFamily::Any => unreachable!(),
        IpFamily::V4 => v4,
        IpFamily::V6 => v6,
        IpFamily::V4ThenV6 => {
            let mut all = v4;
            all.extend(v6);
            all
        }
        IpFamily::V6ThenV4 => {
            let mut all = v6;
            all.extend(v4);
            all
        }
    }
}

/// Wraps an established TCP stream in TLS using the caller-provided client
/// configuration. `hostname` is what the server certificate is verified
/// against.
pub(crate) async fn upgrade_tls(
    tcp: TcpStream,
    config: std::sync::Arc<rustls::ClientConfig>,
    hostname: &str,
) -> Result<Stream> {
    let server_name = rustls_pki_types::ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::Ssl(format!("invalid TLS hostname {hostname:?}")))?;
    let connector = TlsConnector::from(config);
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Ssl(e.to_string()))?;
    Ok(Stream::Tls(Box::new(tls)))
}
