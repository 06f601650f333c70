use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_kcp::{KcpConfig, KcpListener, KcpStream};

use crate::tether::tunnel::transport::{BoxedStream, Transport, TransportListener};

/// UDP transport implemented as KCP (reliable, ordered stream over UDP).
///
/// The envelope codec needs an ordered byte stream, which raw datagrams do not give us.
pub struct UdpTransport {
    kcp: KcpConfig,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            kcp: KcpConfig::default(),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = resolve_socket_addr(addr).await?;
        let ln = KcpListener::bind(self.kcp.clone(), bind_addr).await?;
        let local = ln.local_addr().ok();
        Ok(Box::new(UdpTransportListener {
            ln: Mutex::new(ln),
            local,
        }))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let remote = resolve_socket_addr(addr).await?;
        let c = KcpStream::connect(&self.kcp, remote).await?;
        Ok(Box::new(c))
    }
}

pub struct UdpTransportListener {
    ln: Mutex<KcpListener>,
    local: Option<SocketAddr>,
}

#[async_trait]
impl TransportListener for UdpTransportListener {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)> {
        let mut ln = self.ln.lock().await;
        let (c, peer) = ln.accept().await?;
        Ok((Box::new(c), peer))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("tunnel: could not resolve {addr:?}"))
}
