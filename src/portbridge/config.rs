use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

const CONFIG_CANDIDATES: [&str; 3] = ["portbridge.toml", "portbridge.yaml", "portbridge.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps PORTBRIDGE_CONFIG into the flag already; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os("PORTBRIDGE_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_dir() {
        return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CONFIG_CANDIDATES[0])));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/portbridge/portbridge.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "portbridge", "portbridge")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("portbridge.toml"))
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    parse_config(&data, &ext).with_context(|| format!("parse {}", path.display()))
}

pub fn parse_config(data: &str, ext: &str) -> anyhow::Result<Config> {
    let fc: FileConfig = match ext {
        "toml" => toml::from_str(data).context("parse toml")?,
        "yaml" | "yml" => serde_yaml::from_str(data).context("parse yaml")?,
        _ => anyhow::bail!("config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"),
    };
    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub client: Option<ClientConfig>,
    pub server: Option<ServerConfig>,
    pub rendezvous: Option<RendezvousConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub transport: String,
    /// Relay endpoint. For the `tcp` transport this is the rendezvous hub address.
    pub namespace: String,
    pub key_name: String,
    pub key: String,
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub rules: Vec<ClientRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRule {
    pub relay_channel: String,
    pub bind_addr: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ClientRule {
    pub fn listen_addr(&self) -> String {
        if self.bind_addr.contains(':') && !self.bind_addr.starts_with('[') {
            format!("[{}]:{}", self.bind_addr, self.local_port)
        } else {
            format!("{}:{}", self.bind_addr, self.local_port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub rules: Vec<ServerRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRule {
    pub relay_channel: String,
    pub target_hostname: String,
    pub allowed_target_ports: BTreeSet<u16>,
    pub instance_count: usize,
}

#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub listen_addr: String,
    pub keys: Vec<RendezvousKey>,
}

#[derive(Debug, Clone)]
pub struct RendezvousKey {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    relay: Option<FileRelay>,
    client: Option<FileClient>,
    server: Option<FileServer>,
    rendezvous: Option<FileRendezvous>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileRelay {
    transport: Option<String>,
    #[serde(alias = "endpoint")]
    namespace: Option<String>,
    key_name: Option<String>,
    key: Option<String>,
    dial_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileClient {
    #[serde(default)]
    rules: Vec<FileClientRule>,
}

#[derive(Debug, Deserialize)]
struct FileClientRule {
    #[serde(alias = "connection_name")]
    relay_channel: String,
    bind_addr: Option<String>,
    local_port: i64,
    remote_port: i64,
}

#[derive(Debug, Deserialize)]
struct FileServer {
    #[serde(default)]
    rules: Vec<FileServerRule>,
}

#[derive(Debug, Deserialize)]
struct FileServerRule {
    #[serde(alias = "connection_name")]
    relay_channel: String,
    target_hostname: String,
    #[serde(alias = "target_ports")]
    allowed_target_ports: PortList,
    instance_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileRendezvous {
    listen_addr: String,
    #[serde(default)]
    keys: Vec<FileRendezvousKey>,
}

#[derive(Debug, Deserialize)]
struct FileRendezvousKey {
    name: String,
    key: String,
}

/// `[2222, 8080]`, `2222`, or the comma separated `"2222,8080"` form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortList {
    Many(Vec<i64>),
    One(i64),
    Text(String),
}

impl PortList {
    fn parse(&self) -> anyhow::Result<BTreeSet<u16>> {
        let raw: Vec<i64> = match self {
            PortList::Many(v) => v.clone(),
            PortList::One(p) => vec![*p],
            PortList::Text(s) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| p.parse::<i64>().with_context(|| format!("invalid port {p:?}")))
                .collect::<anyhow::Result<_>>()?,
        };
        raw.into_iter().map(|p| port(p, "allowed_target_ports")).collect()
    }
}

fn port(p: i64, field: &str) -> anyhow::Result<u16> {
    match u16::try_from(p) {
        Ok(v) if v != 0 => Ok(v),
        _ => anyhow::bail!("{field} {p} out of range (1-65535)"),
    }
}

fn trimmed(s: Option<&String>) -> String {
    s.map(|s| s.trim().to_string()).unwrap_or_default()
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: LogFormat::Json,
                output: LogOutput::Stderr,
                add_source: false,
            },
            relay: RelayConfig {
                transport: "tcp".into(),
                namespace: String::new(),
                key_name: String::new(),
                key: String::new(),
                dial_timeout: Duration::from_millis(5000),
            },
            client: None,
            server: None,
            rendezvous: None,
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            let level = trimmed(l.level.as_ref()).to_ascii_lowercase();
            if !level.is_empty() {
                cfg.logging.level = level;
            }
            cfg.logging.format = match trimmed(l.format.as_ref()).to_ascii_lowercase().as_str() {
                "" | "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => anyhow::bail!("config: logging.format {other:?} (expected json|text)"),
            };
            cfg.logging.output = match trimmed(l.output.as_ref()).as_str() {
                "" | "stderr" => LogOutput::Stderr,
                "stdout" => LogOutput::Stdout,
                "discard" => LogOutput::Discard,
                path => LogOutput::File(PathBuf::from(path)),
            };
            cfg.logging.add_source = l.add_source;
        }

        // --- Relay ---
        if let Some(r) = &fc.relay {
            let transport = trimmed(r.transport.as_ref()).to_ascii_lowercase();
            if !transport.is_empty() {
                cfg.relay.transport = transport;
            }
            cfg.relay.namespace = trimmed(r.namespace.as_ref());
            cfg.relay.key_name = trimmed(r.key_name.as_ref());
            cfg.relay.key = r.key.clone().unwrap_or_default();
            if let Some(ms) = r.dial_timeout_ms {
                cfg.relay.dial_timeout = Duration::from_millis(ms.max(0) as u64);
            }
        }

        // --- Client rules ---
        if let Some(c) = &fc.client {
            let mut rules = Vec::with_capacity(c.rules.len());
            for (i, r) in c.rules.iter().enumerate() {
                let relay_channel = r.relay_channel.trim().to_string();
                if relay_channel.is_empty() {
                    anyhow::bail!("config: client.rules[{i}] missing relay_channel");
                }
                let mut bind_addr = trimmed(r.bind_addr.as_ref());
                if bind_addr.is_empty() {
                    bind_addr = "0.0.0.0".into();
                }
                rules.push(ClientRule {
                    relay_channel,
                    bind_addr,
                    local_port: port(r.local_port, "local_port")
                        .with_context(|| format!("config: client.rules[{i}]"))?,
                    remote_port: port(r.remote_port, "remote_port")
                        .with_context(|| format!("config: client.rules[{i}]"))?,
                });
            }
            if !rules.is_empty() {
                cfg.client = Some(ClientConfig { rules });
            }
        }

        // --- Server rules ---
        if let Some(s) = &fc.server {
            let mut rules = Vec::with_capacity(s.rules.len());
            for (i, r) in s.rules.iter().enumerate() {
                let relay_channel = r.relay_channel.trim().to_string();
                if relay_channel.is_empty() {
                    anyhow::bail!("config: server.rules[{i}] missing relay_channel");
                }
                let target_hostname = r.target_hostname.trim().to_string();
                if target_hostname.is_empty() {
                    anyhow::bail!("config: server.rules[{i}] missing target_hostname");
                }
                let allowed_target_ports = r
                    .allowed_target_ports
                    .parse()
                    .with_context(|| format!("config: server.rules[{i}]"))?;
                if allowed_target_ports.is_empty() {
                    anyhow::bail!("config: server.rules[{i}] allowed_target_ports is empty");
                }
                rules.push(ServerRule {
                    relay_channel,
                    target_hostname,
                    allowed_target_ports,
                    instance_count: r.instance_count.unwrap_or(1).max(1) as usize,
                });
            }
            if !rules.is_empty() {
                cfg.server = Some(ServerConfig { rules });
            }
        }

        if (cfg.client.is_some() || cfg.server.is_some()) && cfg.relay.namespace.is_empty() {
            anyhow::bail!("config: relay.namespace is required when client or server rules are set");
        }

        // --- Rendezvous ---
        if let Some(rv) = &fc.rendezvous {
            let listen_addr = rv.listen_addr.trim().to_string();
            if listen_addr.is_empty() {
                anyhow::bail!("config: rendezvous.listen_addr is required");
            }
            cfg.rendezvous = Some(RendezvousConfig {
                listen_addr,
                keys: rv
                    .keys
                    .iter()
                    .map(|k| RendezvousKey {
                        name: k.name.trim().to_string(),
                        key: k.key.clone(),
                    })
                    .collect(),
            });
        }

        Ok(cfg)
    }
}
