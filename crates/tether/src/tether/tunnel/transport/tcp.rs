use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::tether::tunnel::transport::{BoxedStream, Transport, TransportListener};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let ln = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let c = TcpStream::connect(addr).await?;
        let _ = c.set_nodelay(true);
        Ok(Box::new(c))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok((Box::new(c), peer))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}
