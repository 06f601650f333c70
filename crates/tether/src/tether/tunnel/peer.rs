use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc, watch},
};

use crate::tether::{
    telemetry,
    tunnel::{
        protocol::{Envelope, MAX_PAYLOAD_BYTES},
        routes::RouteTable,
    },
};

/// One live TCP connection owned by a routing table entry.
///
/// External connections on the server and local-service connections on the client both use
/// this handle. The read direction lives in a separate task started by [`pump`]; this handle
/// keeps the write half and a close signal the reader observes.
pub struct PeerConn {
    id: u64,
    identity: String,
    remote: Option<SocketAddr>,
    opened_at_unix_ms: u64,
    writer: Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
    _active: telemetry::ActivePeerGuard,
}

impl std::fmt::Debug for PeerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConn")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl PeerConn {
    pub fn new(
        identity: impl Into<String>,
        stream: TcpStream,
        role: &'static str,
    ) -> (Arc<Self>, OwnedReadHalf) {
        static SEQ: AtomicU64 = AtomicU64::new(1);

        let remote = stream.peer_addr().ok();
        let (rd, wr) = stream.into_split();
        let (closed, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id: SEQ.fetch_add(1, Ordering::Relaxed),
            identity: identity.into(),
            remote,
            opened_at_unix_ms: telemetry::now_unix_ms(),
            writer: Mutex::new(wr),
            closed,
            _active: telemetry::ActivePeerGuard::new(role),
        });
        (conn, rd)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn opened_at_unix_ms(&self) -> u64 {
        self.opened_at_unix_ms
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn write(&self, payload: &[u8]) -> std::io::Result<()> {
        if self.is_closed() {
            return Err(std::io::ErrorKind::NotConnected.into());
        }
        let mut w = self.writer.lock().await;
        w.write_all(payload).await
    }

    /// Mark the connection closed. The reader task exits and drops the read half; the socket is
    /// released once the last handle goes away.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Read loop for one peer connection: every read becomes an envelope tagged with the peer's
/// identity on `outbound`.
///
/// On EOF or a read error the connection is retired from `routes` and a close notice is queued.
/// When the connection is closed from elsewhere (close notice, replacement, shutdown) the loop
/// exits quietly.
pub async fn pump(
    conn: Arc<PeerConn>,
    mut rd: OwnedReadHalf,
    routes: Arc<RouteTable>,
    outbound: mpsc::Sender<Envelope>,
    buffer_size: usize,
) {
    let mut closed = conn.subscribe_closed();
    let mut buf = vec![0u8; buffer_size.clamp(1, MAX_PAYLOAD_BYTES as usize)];

    let reason = loop {
        if *closed.borrow() {
            break None;
        }

        let n = tokio::select! {
            _ = closed.changed() => continue,
            res = rd.read(&mut buf) => res,
        };

        match n {
            Ok(0) => break Some("eof"),
            Ok(n) => {
                let env = Envelope::data(conn.identity(), Bytes::copy_from_slice(&buf[..n]));
                let sent = tokio::select! {
                    _ = closed.changed() => continue,
                    res = outbound.send(env) => res,
                };
                if sent.is_err() {
                    // Control link is gone; nobody will consume more data for this peer.
                    routes.remove(conn.identity(), conn.id());
                    break None;
                }
                metrics::counter!("tether_envelopes_total", "direction" => "out").increment(1);
            }
            Err(err) => {
                tracing::debug!(identity = %conn.identity(), err = %err, "tunnel: peer read failed");
                break Some("read error");
            }
        }
    };

    let Some(reason) = reason else {
        return;
    };

    if routes.remove(conn.identity(), conn.id()) {
        tracing::debug!(identity = %conn.identity(), reason, "tunnel: peer closed");
        let _ = outbound.send(Envelope::close(conn.identity())).await;
    }
}

/// Retire a connection after a failed write and tell the far side, without blocking the caller
/// on the outbound queue.
pub fn retire_after_write_error(
    conn: &PeerConn,
    routes: &RouteTable,
    outbound: &mpsc::Sender<Envelope>,
) {
    if !routes.remove(conn.identity(), conn.id()) {
        return;
    }
    let notice = Envelope::close(conn.identity());
    let tx = outbound.clone();
    tokio::spawn(async move {
        let _ = tx.send(notice).await;
    });
}
