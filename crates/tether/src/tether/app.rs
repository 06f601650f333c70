use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::tether::{
    admin,
    config::{self, CliArgs, Config, Mode},
    logging, net, telemetry,
    tunnel::{
        client::{Client, ClientOptions},
        pipe::Pipe,
        routes::{RouteTable, SharedRoutes},
        server::{Server, ServerOptions},
    },
};

pub async fn run(args: CliArgs) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(args.config.clone())?;
    let file = match &resolved {
        Some(r) => Some(
            config::load_file(&r.path)
                .with_context(|| format!("load config: {}", r.path.display()))?,
        ),
        None => None,
    };
    let cfg = Config::build(args, file)?;

    let _logrt = logging::init(&cfg.logging)?;

    tracing::info!(
        mode = %cfg.mode,
        config = %resolved.as_ref().map(|r| r.path.display().to_string()).unwrap_or_default(),
        config_source = %resolved.as_ref().map(|r| r.source.to_string()).unwrap_or_default(),
        transport = %cfg.transport,
        first = %cfg.endpoints[0],
        second = %cfg.endpoints[1],
        admin_addr = %cfg.admin_addr,
        "tether: starting"
    );

    let routes: SharedRoutes = Arc::new(RouteTable::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    if !cfg.admin_addr.is_empty() {
        let addr: SocketAddr = net::normalize_bind_addr(&cfg.admin_addr)
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            mode: cfg.mode,
            prom: Arc::new(telemetry::init_prometheus()?),
            routes: routes.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    spawn_role(&cfg, routes, shutdown_rx, &mut tasks).await?;

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or a role task ending on its own.
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
        },
    };
    let _ = shutdown_tx.send(true);

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: tasks did not stop in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    if let Err(err) = &outcome {
        tracing::error!(err = %format!("{err:#}"), "tether: stopped with error");
    }
    outcome
}

async fn spawn_role(
    cfg: &Config,
    routes: SharedRoutes,
    shutdown: watch::Receiver<bool>,
    tasks: &mut JoinSet<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let [first, second] = &cfg.endpoints;

    match cfg.mode {
        Mode::Server => {
            let server = Server::bind(ServerOptions {
                control_addr: first.clone(),
                external_addr: second.clone(),
                transport: cfg.transport.clone(),
                auth_token: cfg.auth_token.clone(),
                handshake_timeout: cfg.handshake_timeout,
                queue_capacity: cfg.queue_capacity,
                buffer_size: cfg.buffer_size,
                routes,
            })
            .await?;
            tasks.spawn(server.serve(shutdown));
        }
        Mode::Client => {
            let client = Client::new(ClientOptions {
                server_addr: first.clone(),
                local_addr: second.clone(),
                transport: cfg.transport.clone(),
                auth_token: cfg.auth_token.clone(),
                dial_timeout: cfg.dial_timeout,
                queue_capacity: cfg.queue_capacity,
                buffer_size: cfg.buffer_size,
                routes,
            })?;
            tasks.spawn(run_client(client, shutdown));
        }
        Mode::Pipe => {
            let pipe = Pipe::bind(first, second, cfg.dial_timeout).await?;
            tasks.spawn(pipe.serve(shutdown));
        }
    }
    Ok(())
}

/// Client role task. Losing the control link, or never getting one, ends the tunnel session but
/// not the process: the failure is logged and the task idles until shutdown. There is no re-dial.
async fn run_client(client: Client, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    if let Err(err) = client.run(shutdown.clone()).await {
        tracing::warn!(err = %err, "tunnel: client gave up; idle until shutdown");
        let _ = shutdown.wait_for(|s| *s).await;
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
