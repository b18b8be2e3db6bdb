use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use serde::Deserialize;

use crate::service::{DEFAULT_MAX_MESSAGE_SIZE, ServiceConfig};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7863";
pub const DEFAULT_LOG_FILTER: &str = "runnerd=info,runner_server=info,librunner=info";

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "remote command runner")]
pub struct Args {
    /// `host:port`, or `unix:///path/to/socket`.
    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub ring_buffer_size: Option<usize>,
    #[arg(long)]
    pub max_message_size: Option<usize>,
    /// File holding the bearer token; `RUNNER_API_TOKEN` takes precedence.
    #[arg(long)]
    pub token_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<String>,
    ring_buffer_size: Option<usize>,
    max_message_size: Option<usize>,
    chunk_size: Option<usize>,
    drain_grace_ms: Option<u64>,
    log_filter: Option<String>,
    token_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                bail!("unix listen address needs a path");
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        let addr: SocketAddr = raw
            .parse()
            .with_context(|| format!("invalid listen address {raw}"))?;
        Ok(ListenAddr::Tcp(addr))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{addr}"),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: ListenAddr,
    pub max_message_size: usize,
    pub service: ServiceConfig,
    pub log_filter: String,
    pub token_file: Option<PathBuf>,
}

pub fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = match &args.config {
        Some(path) => read_file_config(path)?,
        None => FileConfig::default(),
    };

    let listen: ListenAddr = args
        .listen
        .clone()
        .or(file_cfg.listen)
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
        .parse()?;

    let defaults = ServiceConfig::default();
    let ring_buffer_size = nonzero(
        "ring_buffer_size",
        args.ring_buffer_size
            .or(file_cfg.ring_buffer_size)
            .unwrap_or(defaults.ring_buffer_size),
    )?;
    let max_message_size = nonzero(
        "max_message_size",
        args.max_message_size
            .or(file_cfg.max_message_size)
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
    )?;
    let chunk_size = nonzero(
        "chunk_size",
        file_cfg.chunk_size.unwrap_or(defaults.chunk_size),
    )?;
    let drain_grace = file_cfg
        .drain_grace_ms
        .map(Duration::from_millis)
        .unwrap_or(defaults.drain_grace);

    Ok(RuntimeConfig {
        listen,
        max_message_size,
        service: ServiceConfig {
            ring_buffer_size,
            chunk_size,
            drain_grace,
        },
        log_filter: file_cfg
            .log_filter
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        token_file: args.token_file.clone().or(file_cfg.token_file),
    })
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str::<FileConfig>(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

fn nonzero(name: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(anyhow!("{name} must be greater than zero"));
    }
    Ok(value)
}
