mod tether;

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::tether::config::{CliArgs, Mode};

const AFTER_HELP: &str = "\
Modes:
  tether -a TOKEN [-u] CONTROL_PORT EXTERNAL_PORT      server: accept the client and external peers
  tether -a TOKEN [-u] -c SERVER_ADDR LOCAL_ADDR        client: carry peers to a local service
  tether --pipe LISTEN_PORT TARGET_ADDR                 plain one-to-one TCP relay

Example (expose a web server behind NAT on public.example:8080):
  public$  tether -a s3cret 9999 8080
  private$ tether -a s3cret -c public.example:9999 127.0.0.1:80";

#[derive(Debug, Parser)]
#[command(
    name = "tether",
    version,
    about = "Tether - reverse tunnel for reaching services behind NAT",
    after_help = AFTER_HELP
)]
struct Cli {
    /// Shared secret both ends must present on the control link.
    #[arg(short = 'a', long = "auth", env = "TETHER_AUTH", hide_env_values = true)]
    auth: Option<String>,

    /// Run as the client: dial SERVER_ADDR and relay to LOCAL_ADDR.
    #[arg(short = 'c', long = "client", conflicts_with = "pipe")]
    client: bool,

    /// Relay each connection on LISTEN_PORT directly to TARGET_ADDR.
    #[arg(long, conflicts_with = "client")]
    pipe: bool,

    /// Carry the control link over UDP (KCP) instead of TCP.
    #[arg(short = 'u', long)]
    udp: bool,

    /// Path to a config file (.toml/.yaml/.yml). If omitted, uses TETHER_CONFIG; then auto-detects tether.toml > tether.yaml > tether.yml from CWD; then the user config dir.
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: text or json.
    #[arg(long)]
    log_format: Option<String>,

    /// Log output: stderr, stdout, discard, or a file path.
    #[arg(long)]
    log_output: Option<String>,

    /// Serve /health, /metrics and /routes on this address.
    #[arg(long)]
    admin_addr: Option<String>,

    /// Timeout for outbound dials (e.g. 5s, 500ms).
    #[arg(long, value_parser = humantime::parse_duration)]
    dial_timeout: Option<Duration>,

    /// Two endpoints; their meaning depends on the mode.
    #[arg(num_args = 2, required = true, value_names = ["FIRST", "SECOND"])]
    endpoints: Vec<String>,
}

impl From<Cli> for CliArgs {
    fn from(cli: Cli) -> Self {
        let mode = if cli.client {
            Mode::Client
        } else if cli.pipe {
            Mode::Pipe
        } else {
            Mode::Server
        };
        CliArgs {
            config: cli.config,
            mode,
            auth: cli.auth,
            udp: cli.udp,
            endpoints: cli.endpoints,
            log_level: cli.log_level,
            log_format: cli.log_format,
            log_output: cli.log_output,
            admin_addr: cli.admin_addr,
            dial_timeout: cli.dial_timeout,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tether::run(cli.into()).await
}
