use std::{sync::Arc, time::Duration};

use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc, watch},
};

use crate::tether::{
    telemetry,
    tunnel::{
        link::ControlLink,
        peer::{self, PeerConn},
        protocol::{self, Envelope},
        routes::SharedRoutes,
        transport::transport_by_name,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("dial {addr}: {reason}")]
    Dial { addr: String, reason: String },
    #[error("dial {addr}: timed out after {timeout}")]
    DialTimeout { addr: String, timeout: String },
    #[error("handshake with {addr}: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: protocol::ProtocolError,
    },
    #[error("control link to {0} closed")]
    LinkClosed(String),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub local_addr: String,
    pub transport: String,
    pub auth_token: String,
    pub dial_timeout: Duration,
    pub queue_capacity: usize,
    pub buffer_size: usize,
    pub routes: SharedRoutes,
}

/// Private side of the tunnel: holds the control link to the server and the connections to the
/// local service.
pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server address is required");
        }
        if opts.local_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client local service address is required");
        }
        if opts.auth_token.is_empty() {
            anyhow::bail!("tunnel: auth token is required");
        }
        if opts.dial_timeout <= Duration::from_millis(0) {
            opts.dial_timeout = Duration::from_secs(5);
        }
        // Fail on a bad transport name now rather than at dial time.
        transport_by_name(&opts.transport)?;
        Ok(Self { opts })
    }

    /// Dial the server once, authenticate, and relay until shutdown or until the control link
    /// is lost. There is no re-dial: losing the link ends the run with an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let stream = self.connect().await?;
        let server = self.opts.server_addr.clone();

        let queue = self.opts.queue_capacity.max(1);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Envelope>(queue);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(queue);
        let link = ControlLink::spawn(
            stream,
            server.clone(),
            inbound_tx,
            Arc::new(Mutex::new(outbound_rx)),
        );

        tracing::info!(
            server = %server,
            local = %self.opts.local_addr,
            transport = %self.opts.transport,
            "tunnel: connected"
        );

        let res = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                _ = link.wait_closed() => {
                    break Err(ClientError::LinkClosed(server.clone()));
                }
                env = inbound_rx.recv() => {
                    let Some(env) = env else {
                        break Err(ClientError::LinkClosed(server.clone()));
                    };
                    self.remultiplex(env, &outbound_tx).await;
                }
            }
        };

        link.close();
        let n = self.opts.routes.clear();
        tracing::info!(closed_peers = n, "tunnel: client stopped");
        res
    }

    async fn connect(&self) -> Result<crate::tether::tunnel::transport::BoxedStream, ClientError> {
        let addr = self.opts.server_addr.trim().to_string();
        let tr = transport_by_name(&self.opts.transport).map_err(|err| ClientError::Dial {
            addr: addr.clone(),
            reason: err.to_string(),
        })?;

        let mut stream = match tokio::time::timeout(self.opts.dial_timeout, tr.dial(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(err)) => {
                return Err(ClientError::Dial {
                    addr,
                    reason: format!("{err:#}"),
                });
            }
            Err(_) => {
                return Err(ClientError::DialTimeout {
                    addr,
                    timeout: humantime::format_duration(self.opts.dial_timeout).to_string(),
                });
            }
        };

        protocol::initiate_auth(&mut stream, &self.opts.auth_token)
            .await
            .map_err(|source| ClientError::Handshake { addr, source })?;
        Ok(stream)
    }

    /// Route one envelope from the server to the local-service connection for its identity,
    /// dialing a new one when there is none or the existing one is broken.
    async fn remultiplex(&self, env: Envelope, outbound: &mpsc::Sender<Envelope>) {
        let routes = &self.opts.routes;

        if env.is_close() {
            if let Some(conn) = routes.get(&env.identity) {
                if routes.remove(&env.identity, conn.id()) {
                    tracing::debug!(identity = %env.identity, "tunnel: closed by server");
                }
            }
            return;
        }

        if let Some(conn) = routes.get(&env.identity) {
            match conn.write(&env.payload).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::debug!(identity = %env.identity, err = %err, "tunnel: local write failed; redialing");
                    routes.remove(&env.identity, conn.id());
                }
            }
        }

        let local = self.opts.local_addr.trim();
        let stream = match tokio::time::timeout(self.opts.dial_timeout, TcpStream::connect(local)).await {
            Ok(Ok(s)) => s,
            Ok(Err(err)) => {
                tracing::debug!(identity = %env.identity, local = %local, err = %err, "tunnel: local dial failed; dropping envelope");
                telemetry::record_dropped("dial");
                return;
            }
            Err(_) => {
                tracing::debug!(identity = %env.identity, local = %local, "tunnel: local dial timed out; dropping envelope");
                telemetry::record_dropped("dial");
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let (conn, rd) = PeerConn::new(env.identity.clone(), stream, "client");
        if let Err(err) = conn.write(&env.payload).await {
            tracing::debug!(identity = %env.identity, err = %err, "tunnel: local write failed on fresh connection; dropping envelope");
            telemetry::record_dropped("write");
            return;
        }

        routes.insert(conn.clone());
        tracing::debug!(identity = %env.identity, "tunnel: local connection opened");
        tokio::spawn(peer::pump(
            conn,
            rd,
            routes.clone(),
            outbound.clone(),
            self.opts.buffer_size,
        ));
    }
}
