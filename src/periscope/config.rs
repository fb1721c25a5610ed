use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONTROL_PORT: u16 = 6352;
pub const DEFAULT_USER_PORT: u16 = 9352;
pub const DEFAULT_SERVICE_PORT: u16 = 80;
pub const DEFAULT_PASSWORD: &str = "default_password";
pub const DEFAULT_CHANNEL_DEPTH: usize = 100;
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_LOG_LEVEL: u8 = 2;

/// Transport between the users and the protected service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Resolved Edge configuration. Field names follow the documented flags:
/// `client_*` is the control listener the proxy dials, `server_ip:user_port`
/// is the user-facing listener.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub user_port: u16,
    pub server_pwd: String,
    pub protocol: Protocol,
    pub udp_idle_timeout: Duration,
    pub channel_depth: usize,
}

impl EdgeConfig {
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.client_ip, self.client_port)
    }

    pub fn user_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_ip, self.user_port)
    }
}

/// Resolved Proxy configuration: where the Edge listens and where the
/// protected service lives.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub service_ip: IpAddr,
    pub service_port: u16,
    pub server_pwd: String,
    pub protocol: Protocol,
    pub udp_idle_timeout: Duration,
    pub channel_depth: usize,
}

impl ProxyConfig {
    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_ip, self.server_port)
    }

    pub fn service_addr(&self) -> SocketAddr {
        SocketAddr::new(self.service_ip, self.service_port)
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// 1 lifecycle, 2 per-connection (default), 3 per-frame.
    pub level: u8,
    /// text | json
    pub format: String,
    /// stderr | stdout | discard | file path
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL,
            format: "text".into(),
            output: "stderr".into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    edge: FileEdge,
    proxy: FileProxy,
    logging: FileLogging,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileEdge {
    client_ip: Option<IpAddr>,
    client_port: Option<u16>,
    server_ip: Option<IpAddr>,
    user_port: Option<u16>,
    server_pwd: Option<String>,
    protocol: Option<Protocol>,
    udp_idle_timeout: Option<String>,
    channel_depth: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileProxy {
    server_ip: Option<IpAddr>,
    server_port: Option<u16>,
    service_ip: Option<IpAddr>,
    service_port: Option<u16>,
    server_pwd: Option<String>,
    protocol: Option<Protocol>,
    udp_idle_timeout: Option<String>,
    channel_depth: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileLogging {
    level: Option<u8>,
    format: Option<String>,
    output: Option<String>,
}

fn load_file(path: Option<&Path>) -> anyhow::Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("config: read {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("config: parse toml {}", path.display()))
}

fn resolve_idle_timeout(flag: Option<&str>, file: Option<&str>) -> anyhow::Result<Duration> {
    let Some(s) = flag.or(file) else {
        return Ok(DEFAULT_UDP_IDLE_TIMEOUT);
    };
    let d = humantime::parse_duration(s.trim())
        .with_context(|| format!("config: parse udp_idle_timeout {s:?}"))?;
    anyhow::ensure!(
        d > Duration::ZERO,
        "config: udp_idle_timeout must be positive"
    );
    Ok(d)
}

fn resolve_channel_depth(file: Option<usize>) -> anyhow::Result<usize> {
    let depth = file.unwrap_or(DEFAULT_CHANNEL_DEPTH);
    anyhow::ensure!(depth > 0, "config: channel_depth must be positive");
    Ok(depth)
}

fn resolve_logging(flag_level: Option<u8>, file: FileLogging) -> anyhow::Result<LoggingConfig> {
    let defaults = LoggingConfig::default();
    let level = flag_level.or(file.level).unwrap_or(defaults.level);
    anyhow::ensure!(
        (1..=3).contains(&level),
        "config: log level must be between 1 and 3"
    );
    let format = file.format.unwrap_or(defaults.format);
    anyhow::ensure!(
        format == "text" || format == "json",
        "config: log format must be text or json"
    );
    Ok(LoggingConfig {
        level,
        format,
        output: file.output.unwrap_or(defaults.output),
    })
}

/// Edge CLI flags; every flag overrides the config file, which overrides the
/// built-in defaults.
#[derive(Debug, clap::Args)]
pub struct EdgeArgs {
    /// Path to a periscope TOML config file.
    #[arg(long, env = "PERISCOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// IP the control listener binds; the proxy dials this.
    #[arg(long, env = "PERISCOPE_CLIENT_IP")]
    pub client_ip: Option<IpAddr>,

    /// Port of the control listener [default: 6352]
    #[arg(long, env = "PERISCOPE_CLIENT_PORT")]
    pub client_port: Option<u16>,

    /// IP the user listener binds.
    #[arg(long, env = "PERISCOPE_SERVER_IP")]
    pub server_ip: Option<IpAddr>,

    /// Port users connect to [default: 9352]
    #[arg(long, env = "PERISCOPE_USER_PORT")]
    pub user_port: Option<u16>,

    /// Shared secret the proxy must present.
    #[arg(long, env = "PERISCOPE_SERVER_PWD")]
    pub server_pwd: Option<String>,

    /// Transport for user traffic [default: tcp]
    #[arg(long, env = "PERISCOPE_PROTOCOL")]
    pub protocol: Option<Protocol>,

    /// Idle deadline for UDP sessions, e.g. "3m" [default: 3m]
    #[arg(long, env = "PERISCOPE_UDP_IDLE_TIMEOUT")]
    pub udp_idle_timeout: Option<String>,

    /// Log verbosity: 1 lifecycle, 2 per-connection, 3 per-frame [default: 2]
    #[arg(long, env = "PERISCOPE_LOG_LEVEL", value_parser = clap::value_parser!(u8).range(1..=3))]
    pub log_level: Option<u8>,
}

impl EdgeArgs {
    pub fn resolve(self) -> anyhow::Result<(EdgeConfig, LoggingConfig)> {
        let file = load_file(self.config.as_deref())?;
        let fe = file.edge;
        let cfg = EdgeConfig {
            client_ip: self
                .client_ip
                .or(fe.client_ip)
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            client_port: self
                .client_port
                .or(fe.client_port)
                .unwrap_or(DEFAULT_CONTROL_PORT),
            server_ip: self
                .server_ip
                .or(fe.server_ip)
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            user_port: self.user_port.or(fe.user_port).unwrap_or(DEFAULT_USER_PORT),
            server_pwd: self
                .server_pwd
                .or(fe.server_pwd)
                .unwrap_or_else(|| DEFAULT_PASSWORD.into()),
            protocol: self.protocol.or(fe.protocol).unwrap_or(Protocol::Tcp),
            udp_idle_timeout: resolve_idle_timeout(
                self.udp_idle_timeout.as_deref(),
                fe.udp_idle_timeout.as_deref(),
            )?,
            channel_depth: resolve_channel_depth(fe.channel_depth)?,
        };
        let logging = resolve_logging(self.log_level, file.logging)?;
        Ok((cfg, logging))
    }
}

/// Proxy CLI flags; same precedence as [`EdgeArgs`].
#[derive(Debug, clap::Args)]
pub struct ProxyArgs {
    /// Path to a periscope TOML config file.
    #[arg(long, env = "PERISCOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// IP of the edge's control listener [default: 127.0.0.1]
    #[arg(long, env = "PERISCOPE_SERVER_IP")]
    pub server_ip: Option<IpAddr>,

    /// Port of the edge's control listener [default: 6352]
    #[arg(long, env = "PERISCOPE_SERVER_PORT")]
    pub server_port: Option<u16>,

    /// IP of the protected service [default: 127.0.0.1]
    #[arg(long, env = "PERISCOPE_SERVICE_IP")]
    pub service_ip: Option<IpAddr>,

    /// Port of the protected service [default: 80]
    #[arg(long, env = "PERISCOPE_SERVICE_PORT")]
    pub service_port: Option<u16>,

    /// Shared secret presented to the edge.
    #[arg(long, env = "PERISCOPE_SERVER_PWD")]
    pub server_pwd: Option<String>,

    /// Transport used to reach the service [default: tcp]
    #[arg(long, env = "PERISCOPE_PROTOCOL")]
    pub protocol: Option<Protocol>,

    /// Idle deadline for UDP service sockets, e.g. "3m" [default: 3m]
    #[arg(long, env = "PERISCOPE_UDP_IDLE_TIMEOUT")]
    pub udp_idle_timeout: Option<String>,

    /// Log verbosity: 1 lifecycle, 2 per-connection, 3 per-frame [default: 2]
    #[arg(long, env = "PERISCOPE_LOG_LEVEL", value_parser = clap::value_parser!(u8).range(1..=3))]
    pub log_level: Option<u8>,
}

impl ProxyArgs {
    pub fn resolve(self) -> anyhow::Result<(ProxyConfig, LoggingConfig)> {
        let file = load_file(self.config.as_deref())?;
        let fp = file.proxy;
        let cfg = ProxyConfig {
            server_ip: self
                .server_ip
                .or(fp.server_ip)
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            server_port: self
                .server_port
                .or(fp.server_port)
                .unwrap_or(DEFAULT_CONTROL_PORT),
            service_ip: self
                .service_ip
                .or(fp.service_ip)
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            service_port: self
                .service_port
                .or(fp.service_port)
                .unwrap_or(DEFAULT_SERVICE_PORT),
            server_pwd: self
                .server_pwd
                .or(fp.server_pwd)
                .unwrap_or_else(|| DEFAULT_PASSWORD.into()),
            protocol: self.protocol.or(fp.protocol).unwrap_or(Protocol::Tcp),
            udp_idle_timeout: resolve_idle_timeout(
                self.udp_idle_timeout.as_deref(),
                fp.udp_idle_timeout.as_deref(),
            )?,
            channel_depth: resolve_channel_depth(fp.channel_depth)?,
        };
        let logging = resolve_logging(self.log_level, file.logging)?;
        Ok((cfg, logging))
    }
}
