use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwapOption;
use tokio::{
    net::TcpListener,
    sync::{Mutex, mpsc, watch},
};

use crate::tether::{
    net, telemetry,
    tunnel::{
        link::{ControlLink, SharedOutbound},
        peer::{self, PeerConn},
        protocol::{self, Envelope},
        routes::SharedRoutes,
        transport::{BoxedStream, TransportListener, transport_by_name},
    },
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub control_addr: String,
    pub external_addr: String,
    pub transport: String,
    pub auth_token: String,
    pub handshake_timeout: Duration,
    pub queue_capacity: usize,
    pub buffer_size: usize,
    pub routes: SharedRoutes,
}

/// Public side of the tunnel: accepts the control link from a client and external peers whose
/// traffic is carried over it.
pub struct Server {
    opts: ServerOptions,
    control: Box<dyn TransportListener>,
    external: TcpListener,
    transport: &'static str,
}

impl Server {
    /// Bind both listeners. Failing to bind either one is fatal.
    pub async fn bind(opts: ServerOptions) -> anyhow::Result<Self> {
        if opts.auth_token.is_empty() {
            anyhow::bail!("tunnel: auth token is required");
        }

        let tr = transport_by_name(&opts.transport)?;
        let control_addr = net::normalize_bind_addr(&opts.control_addr);
        let control = tr
            .listen(control_addr.as_ref())
            .await
            .with_context(|| format!("bind control listener {}", opts.control_addr))?;

        let external_addr = net::normalize_bind_addr(&opts.external_addr);
        let external = TcpListener::bind(external_addr.as_ref())
            .await
            .with_context(|| format!("bind external listener {}", opts.external_addr))?;

        Ok(Self {
            opts,
            control,
            external,
            transport: tr.name(),
        })
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control.local_addr()
    }

    pub fn external_addr(&self) -> Option<SocketAddr> {
        self.external.local_addr().ok()
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let queue = self.opts.queue_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Envelope>(queue);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(queue);
        let slot = Arc::new(LinkSlot::new(
            self.opts.routes.clone(),
            Arc::new(Mutex::new(outbound_rx)),
        ));

        tracing::info!(
            control = %self.control_addr().map(|a| a.to_string()).unwrap_or_default(),
            external = %self.external_addr().map(|a| a.to_string()).unwrap_or_default(),
            transport = %self.transport,
            "tunnel: server listening"
        );

        let dispatcher = tokio::spawn(dispatch_loop(
            inbound_rx,
            self.opts.routes.clone(),
            outbound_tx.clone(),
        ));

        let id_seq = AtomicU64::new(1);

        let res = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                conn = self.control.accept() => {
                    let (stream, remote) = match conn {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "tunnel: control accept failed");
                            continue;
                        }
                    };
                    tokio::spawn(authenticate(
                        stream,
                        remote,
                        self.opts.auth_token.clone(),
                        self.opts.handshake_timeout,
                        slot.clone(),
                        inbound_tx.clone(),
                    ));
                }
                conn = self.external.accept() => {
                    let (stream, remote) = match conn {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "tunnel: external accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let identity = format!("{remote}#{}", id_seq.fetch_add(1, Ordering::Relaxed));
                    let (conn, rd) = PeerConn::new(identity, stream, "server");
                    self.opts.routes.insert(conn.clone());
                    tracing::debug!(identity = %conn.identity(), "tunnel: external peer connected");
                    tokio::spawn(peer::pump(
                        conn,
                        rd,
                        self.opts.routes.clone(),
                        outbound_tx.clone(),
                        self.opts.buffer_size,
                    ));
                }
            }
        };

        if let Some(link) = slot.current.swap(None) {
            link.close();
        }
        let n = self.opts.routes.clear();
        dispatcher.abort();
        tracing::info!(closed_peers = n, "tunnel: server stopped");
        res
    }
}

/// The server's single current control link.
///
/// Installing and releasing links is serialized. Retiring a link closes it, clears the routing
/// table and discards envelopes still queued for it: the peers it carried belong to a client
/// that is no longer reachable.
struct LinkSlot {
    current: ArcSwapOption<ControlLink>,
    install: Mutex<()>,
    routes: SharedRoutes,
    outbound: SharedOutbound,
}

impl LinkSlot {
    fn new(routes: SharedRoutes, outbound: SharedOutbound) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            install: Mutex::new(()),
            routes,
            outbound,
        }
    }

    /// Make `stream` the current link and answer the handshake. The reply goes out only after
    /// the previous link is retired, and must complete within `reply_timeout`.
    async fn install(
        &self,
        mut stream: BoxedStream,
        remote: SocketAddr,
        inbound: mpsc::Sender<Envelope>,
        reply_timeout: Duration,
    ) -> Result<Arc<ControlLink>, protocol::ProtocolError> {
        let _guard = self.install.lock().await;

        if let Some(old) = self.current.swap(None) {
            let n = self.retire(&old).await;
            tracing::warn!(
                old = %old.remote(),
                new = %remote,
                closed_peers = n,
                "tunnel: control link replaced"
            );
        }

        tokio::time::timeout(
            reply_timeout,
            protocol::write_auth_frame(&mut stream, protocol::AUTH_OK),
        )
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

        let link = ControlLink::spawn(stream, remote.to_string(), inbound, self.outbound.clone());
        self.current.store(Some(link.clone()));
        Ok(link)
    }

    async fn release(&self, link: &Arc<ControlLink>) {
        let _guard = self.install.lock().await;

        let is_current = self
            .current
            .load()
            .as_ref()
            .is_some_and(|cur| Arc::ptr_eq(cur, link));
        if !is_current {
            return;
        }
        self.current.store(None);
        let n = self.retire(link).await;
        if n > 0 {
            tracing::info!(closed_peers = n, "tunnel: dropped peers of lost control link");
        }
    }

    async fn retire(&self, link: &ControlLink) -> usize {
        link.close();
        let n = self.routes.clear();

        // The old write loop lets go of the queue once it has observed the close.
        let mut rx = self.outbound.lock().await;
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            telemetry::record_dropped("stale");
            tracing::debug!(discarded, "tunnel: discarded envelopes queued for retired link");
        }
        n
    }
}

/// Run the responder handshake on a fresh control connection and, if it passes, make it the
/// current link.
async fn authenticate(
    mut stream: BoxedStream,
    remote: SocketAddr,
    auth_token: String,
    handshake_timeout: Duration,
    slot: Arc<LinkSlot>,
    inbound: mpsc::Sender<Envelope>,
) {
    let res = tokio::time::timeout(
        handshake_timeout,
        protocol::verify_auth(&mut stream, &auth_token),
    )
    .await;

    let failure = match res {
        Ok(Ok(())) => None,
        Ok(Err(protocol::ProtocolError::BadToken)) => Some("auth token mismatch".to_string()),
        Ok(Err(err)) => Some(err.to_string()),
        Err(_) => Some(format!(
            "timed out after {}",
            humantime::format_duration(handshake_timeout)
        )),
    };
    if let Some(reason) = failure {
        metrics::counter!("tether_auth_failures_total").increment(1);
        tracing::warn!(remote = %remote, reason = %reason, "tunnel: handshake rejected");
        return;
    }

    let link = match slot.install(stream, remote, inbound, handshake_timeout).await {
        Ok(link) => link,
        Err(err) => {
            tracing::warn!(remote = %remote, err = %err, "tunnel: handshake reply failed");
            return;
        }
    };
    tracing::info!(remote = %remote, "tunnel: client connected");

    link.wait_closed().await;
    tracing::info!(remote = %remote, "tunnel: client disconnected");
    slot.release(&link).await;
}

/// Demultiplex envelopes coming back from the client onto their external connections.
async fn dispatch_loop(
    mut inbound: mpsc::Receiver<Envelope>,
    routes: SharedRoutes,
    outbound: mpsc::Sender<Envelope>,
) {
    while let Some(env) = inbound.recv().await {
        let Some(conn) = routes.get(&env.identity) else {
            tracing::trace!(identity = %env.identity, "tunnel: unroutable envelope dropped");
            telemetry::record_dropped("unroutable");
            continue;
        };

        if env.is_close() {
            if routes.remove(&env.identity, conn.id()) {
                tracing::debug!(identity = %env.identity, "tunnel: closed by client");
            }
            continue;
        }

        if let Err(err) = conn.write(&env.payload).await {
            tracing::debug!(identity = %env.identity, err = %err, "tunnel: external write failed");
            peer::retire_after_write_error(&conn, &routes, &outbound);
        }
    }
}
