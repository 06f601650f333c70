//! Direct one-to-one relay: every accepted connection gets its own upstream connection and bytes
//! are copied both ways. No authentication, no multiplexing, no shared state.

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::tether::{net, telemetry};

pub struct Pipe {
    ln: TcpListener,
    target: String,
    dial_timeout: Duration,
}

impl Pipe {
    pub async fn bind(listen_addr: &str, target: &str, dial_timeout: Duration) -> anyhow::Result<Self> {
        let target = target.trim();
        if target.is_empty() {
            anyhow::bail!("pipe: target address is required");
        }
        let bind_addr = net::normalize_bind_addr(listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind tcp {listen_addr}"))?;
        Ok(Self {
            ln,
            target: target.to_string(),
            dial_timeout,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            listen_addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            target = %self.target,
            "pipe: listening"
        );

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = self.ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "pipe: accept failed");
                            continue;
                        }
                    };
                    let target = self.target.clone();
                    let dial_timeout = self.dial_timeout;
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        relay(conn, peer, &target, dial_timeout, shutdown).await;
                    });
                }
            }
        }

        Ok(())
    }
}

async fn relay(
    mut conn: TcpStream,
    peer: SocketAddr,
    target: &str,
    dial_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let _active = telemetry::ActivePeerGuard::new("pipe");
    tracing::debug!(client = %peer, "pipe: accepted");

    let mut up = match tokio::time::timeout(dial_timeout, TcpStream::connect(target)).await {
        Ok(Ok(up)) => up,
        Ok(Err(err)) => {
            tracing::warn!(client = %peer, target = %target, err = %err, "pipe: dial failed");
            let _ = conn.shutdown().await;
            return;
        }
        Err(_) => {
            tracing::warn!(client = %peer, target = %target, "pipe: dial timed out");
            let _ = conn.shutdown().await;
            return;
        }
    };

    tokio::select! {
        res = tokio::io::copy_bidirectional(&mut conn, &mut up) => match res {
            Ok((ingress, egress)) => {
                tracing::debug!(client = %peer, ingress, egress, "pipe: closed");
            }
            Err(err) => {
                tracing::debug!(client = %peer, err = %err, "pipe: ended with error");
            }
        },
        _ = shutdown.wait_for(|s| *s) => {}
    }
}
