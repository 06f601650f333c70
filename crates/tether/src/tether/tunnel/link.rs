use std::sync::Arc;

use tokio::{
    io::{AsyncWriteExt, BufReader, BufWriter},
    sync::{Mutex, mpsc, watch},
};

use crate::tether::tunnel::{
    protocol::{self, Envelope},
    transport::BoxedStream,
};

/// Outbound queue receiver shared between successive control links of one role.
pub type SharedOutbound = Arc<Mutex<mpsc::Receiver<Envelope>>>;

/// Handle to a running control link.
///
/// The link owns two tasks: a read loop decoding envelopes into the inbound queue and a write
/// loop encoding envelopes taken from the outbound queue. Whichever stops first closes the link
/// and the other follows.
#[derive(Debug)]
pub struct ControlLink {
    remote: String,
    closed: watch::Sender<bool>,
}

impl ControlLink {
    /// Start streaming on an authenticated control connection.
    pub fn spawn(
        stream: BoxedStream,
        remote: String,
        inbound: mpsc::Sender<Envelope>,
        outbound: SharedOutbound,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        let link = Arc::new(Self { remote, closed });

        let (rd, wr) = tokio::io::split(stream);

        {
            let link = link.clone();
            tokio::spawn(async move {
                let res = read_loop(BufReader::new(rd), inbound, link.closed.subscribe()).await;
                if let Err(err) = res {
                    tracing::warn!(remote = %link.remote, err = %err, "tunnel: control link read failed");
                }
                link.close();
            });
        }

        {
            let link = link.clone();
            tokio::spawn(async move {
                let res = write_loop(BufWriter::new(wr), outbound, link.closed.subscribe()).await;
                if let Err(err) = res {
                    tracing::warn!(remote = %link.remote, err = %err, "tunnel: control link write failed");
                }
                link.close();
            });
        }

        link
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

async fn read_loop<R>(
    mut rd: R,
    inbound: mpsc::Sender<Envelope>,
    mut closed: watch::Receiver<bool>,
) -> Result<(), protocol::ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        if *closed.borrow() {
            return Ok(());
        }

        let env = tokio::select! {
            _ = closed.changed() => continue,
            res = protocol::read_envelope(&mut rd) => res?,
        };
        metrics::counter!("tether_envelopes_total", "direction" => "in").increment(1);

        tokio::select! {
            _ = closed.changed() => continue,
            res = inbound.send(env) => {
                if res.is_err() {
                    // Dispatcher is gone (shutdown).
                    return Ok(());
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut wr: BufWriter<W>,
    outbound: SharedOutbound,
    mut closed: watch::Receiver<bool>,
) -> Result<(), protocol::ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    // A previous link holds this lock until its own write loop has stopped.
    let mut rx = tokio::select! {
        biased;
        _ = closed.wait_for(|c| *c) => return Ok(()),
        rx = outbound.lock() => rx,
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            next = rx.recv() => next,
        };
        let Some(env) = next else {
            break;
        };

        let write = async {
            protocol::write_envelope(&mut wr, &env).await?;
            // Batch whatever is already queued before flushing.
            while let Ok(env) = rx.try_recv() {
                protocol::write_envelope(&mut wr, &env).await?;
            }
            wr.flush().await?;
            Ok::<(), protocol::ProtocolError>(())
        };

        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            res = write => res?,
        }
    }

    drop(rx);
    let _ = wr.shutdown().await;
    Ok(())
}
