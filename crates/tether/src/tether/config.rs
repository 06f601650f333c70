use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::tether::tunnel::{protocol::MAX_PAYLOAD_BYTES, transport::parse_transport};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
    Pipe,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Server => write!(f, "server"),
            Mode::Client => write!(f, "client"),
            Mode::Pipe => write!(f, "pipe"),
        }
    }
}

/// Everything the command line can set. `None` leaves the file value (or default) in place.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub mode: Mode,
    pub auth: Option<String>,
    pub udp: bool,
    pub endpoints: Vec<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub log_output: Option<String>,
    pub admin_addr: Option<String>,
    pub dial_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Cwd,
    UserDir,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::UserDir => write!(f, "user"),
        }
    }
}

/// Find the config file to load, if any.
///
/// Precedence: `--config` / `TETHER_CONFIG`, then `tether.toml` > `tether.yaml` > `tether.yml`
/// in the working directory, then the same names in the per-user config dir. A config file is
/// optional; the command line alone is enough to run.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<Option<ResolvedConfigPath>> {
    if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        }));
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        }));
    }

    if let Some(proj) = ProjectDirs::from("", "", "tether") {
        if let Some(p) = discover_config_path(proj.config_dir()) {
            return Ok(Some(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::UserDir,
            }));
        }
    }

    Ok(None)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    let candidates = ["tether.toml", "tether.yaml", "tether.yml"];
    for c in candidates {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Some(p);
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub auth_token: String,
    pub transport: String,
    /// Server: control listen, external listen. Client: control dial, local service.
    /// Pipe: listen, target.
    pub endpoints: [String; 2],
    pub queue_capacity: usize,
    pub buffer_size: usize,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub admin_addr: String,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    auth_token: Option<String>,
    transport: Option<String>,
    queue_capacity: Option<usize>,
    buffer_size: Option<usize>,
    dial_timeout: Option<String>,
    handshake_timeout: Option<String>,
    admin_addr: Option<String>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))
        }
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .toml or .yaml/.yml)", ext),
    }
}

impl Config {
    /// Merge command-line arguments over the optional file and validate the result.
    pub fn build(args: CliArgs, file: Option<FileConfig>) -> anyhow::Result<Config> {
        let file = file.unwrap_or_default();

        let endpoints: [String; 2] = args
            .endpoints
            .iter()
            .map(|s| s.trim().to_string())
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|v: Vec<String>| {
                anyhow::anyhow!("config: expected exactly 2 endpoint arguments, got {}", v.len())
            })?;
        if endpoints.iter().any(|e| e.is_empty()) {
            anyhow::bail!("config: endpoint arguments must not be empty");
        }

        // Compared byte-for-byte on the wire, so whitespace is significant.
        let auth_token = args.auth.or(file.auth_token).unwrap_or_default();
        if auth_token.is_empty() && args.mode != Mode::Pipe {
            anyhow::bail!("config: auth token is empty (set -a/--auth, TETHER_AUTH or auth_token)");
        }

        let transport = if args.udp {
            "udp".to_string()
        } else {
            file.transport.unwrap_or_default()
        };
        let transport = parse_transport(&transport)?;

        let dial_timeout = match args.dial_timeout {
            Some(d) => d,
            None => parse_duration_field("dial_timeout", file.dial_timeout.as_deref())?
                .unwrap_or(DEFAULT_DIAL_TIMEOUT),
        };
        let handshake_timeout =
            parse_duration_field("handshake_timeout", file.handshake_timeout.as_deref())?
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);
        if dial_timeout.is_zero() || handshake_timeout.is_zero() {
            anyhow::bail!("config: timeouts must be greater than zero");
        }

        let mut logging = LoggingConfig::default();
        if let Some(l) = &file.logging {
            if let Some(level) = non_empty(l.level.as_deref()) {
                logging.level = level;
            }
            if let Some(fmt) = non_empty(l.format.as_deref()) {
                logging.format = fmt;
            }
            if let Some(out) = non_empty(l.output.as_deref()) {
                logging.output = out;
            }
            logging.add_source = l.add_source;
        }
        if let Some(level) = non_empty(args.log_level.as_deref()) {
            logging.level = level;
        }
        if let Some(fmt) = non_empty(args.log_format.as_deref()) {
            logging.format = fmt;
        }
        if let Some(out) = non_empty(args.log_output.as_deref()) {
            logging.output = out;
        }
        let buffer_size = file
            .buffer_size
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_size > MAX_PAYLOAD_BYTES as usize {
            anyhow::bail!(
                "config: buffer_size {buffer_size} exceeds the envelope payload limit ({MAX_PAYLOAD_BYTES} bytes)"
            );
        }

        let fmt = logging.format.to_ascii_lowercase();
        if fmt != "text" && fmt != "json" {
            anyhow::bail!("config: unknown log format {:?} (expected text|json)", logging.format);
        }

        Ok(Config {
            mode: args.mode,
            auth_token,
            transport,
            endpoints,
            queue_capacity: file
                .queue_capacity
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            buffer_size,
            dial_timeout,
            handshake_timeout,
            admin_addr: args
                .admin_addr
                .or(file.admin_addr)
                .unwrap_or_default()
                .trim()
                .to_string(),
            logging,
        })
    }
}

fn parse_duration_field(name: &str, v: Option<&str>) -> anyhow::Result<Option<Duration>> {
    match v.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => humantime::parse_duration(s)
            .map(Some)
            .with_context(|| format!("config: invalid {name} {s:?}")),
        None => Ok(None),
    }
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}
