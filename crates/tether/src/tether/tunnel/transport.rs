use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// Byte stream a control link runs on: `AsyncRead + AsyncWrite` under one object-safe name.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// How the control link is carried between the two roles.
///
/// External and local-service connections are always plain TCP; only the control link goes
/// through a `Transport`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "udp" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|udp)"),
    }
}

pub mod tcp;
pub mod udp;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        "udp" => Ok(Arc::new(udp::UdpTransport::new())),
        _ => unreachable!(),
    }
}
