use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_BASE_PORT: u16 = 14786;

/// Port offsets from the base port.
pub const EVAL_LOG_OFFSET: u16 = 0;
pub const STATE_SYNC_OFFSET: u16 = 2;
pub const RESET_OFFSET: u16 = 4;
pub const DEPLOY_OFFSET: u16 = 6;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Fleet file not found: {0}")]
    FleetFileNotFound(PathBuf),

    #[error("Failed to read fleet file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid fleet file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid worker address {0:?}, expected host:port")]
    InvalidWorkerAddr(String),

    #[error("Base port {0} leaves no room for the service port range")]
    BasePortTooHigh(u16),
}

/// What a listener does when a peer outside the trust list connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UntrustedPeerPolicy {
    /// Stop the listener for the rest of the process lifetime.
    #[default]
    StopListener,
    /// Drop only the offending connection and keep serving.
    RejectConnection,
}

/// Peer addresses allowed to talk to the listeners. Matched exactly on `ip:port`.
#[derive(Debug, Clone, Default)]
pub struct TrustList {
    addrs: HashSet<String>,
}

impl TrustList {
    pub fn new<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Ordered list of pollable and deployable workers, as `host:port`.
#[derive(Debug, Clone, Default)]
pub struct WorkerDirectory {
    workers: Vec<String>,
}

impl WorkerDirectory {
    pub fn new(workers: Vec<String>) -> Result<Self, ConfigError> {
        for w in &workers {
            match w.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
                _ => return Err(ConfigError::InvalidWorkerAddr(w.clone())),
            }
        }
        Ok(Self { workers })
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Find the full address for a machine recorded in a run's metadata.
    ///
    /// An exact entry wins; otherwise the first entry whose host matches.
    pub fn resolve(&self, machine: &str) -> Option<&str> {
        self.iter()
            .find(|w| *w == machine)
            .or_else(|| self.iter().find(|w| host_of(w) == machine))
    }
}

/// Host part of a `host:port` address.
pub fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

/// On-disk fleet description: who may connect and which workers exist.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetFile {
    #[serde(rename = "TRUSTED_ADDR", alias = "trusted_addr", default)]
    pub trusted_addr: Vec<String>,

    #[serde(rename = "available_worker_clients", alias = "workers", default)]
    pub workers: Vec<String>,
}

impl FleetFile {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FleetFileNotFound(path.to_path_buf()));
        }
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub base_port: u16,
    pub poll_interval: Duration,
    pub runs_dir: PathBuf,
    pub workers_meta_dir: PathBuf,
    pub trusted: TrustList,
    pub workers: WorkerDirectory,
    pub untrusted_policy: UntrustedPeerPolicy,
    /// Bind secondary outbound sockets to their fixed local ports.
    pub pin_outbound_ports: bool,
    pub io_timeout: Duration,
    pub connect_timeout: Duration,
    pub reset_attempts: u32,
    pub reset_retry_delay: Duration,
    pub bind_retry_delay: Duration,
    pub max_transfer_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            base_port: DEFAULT_BASE_PORT,
            poll_interval: Duration::from_secs(60),
            runs_dir: PathBuf::from("runs"),
            workers_meta_dir: PathBuf::from("workers_meta"),
            trusted: TrustList::default(),
            workers: WorkerDirectory::default(),
            untrusted_policy: UntrustedPeerPolicy::default(),
            pin_outbound_ports: true,
            io_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            reset_attempts: 5,
            reset_retry_delay: Duration::from_millis(500),
            bind_retry_delay: Duration::from_secs(2),
            max_transfer_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_ip: IpAddr, base_port: u16) -> Self {
        Self {
            bind_ip,
            base_port,
            ..Default::default()
        }
    }

    pub fn with_fleet(mut self, fleet: FleetFile) -> Result<Self, ConfigError> {
        self.trusted = TrustList::new(fleet.trusted_addr);
        self.workers = WorkerDirectory::new(fleet.workers)?;
        Ok(self)
    }

    pub fn with_dirs(mut self, runs_dir: impl Into<PathBuf>, workers_meta_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = runs_dir.into();
        self.workers_meta_dir = workers_meta_dir.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Highest port in use is the deployer's secondary at P+7.
        if self.base_port.checked_add(DEPLOY_OFFSET + 1).is_none() {
            return Err(ConfigError::BasePortTooHigh(self.base_port));
        }
        Ok(())
    }

    fn addr(&self, offset: u16) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.base_port + offset)
    }

    pub fn eval_log_addr(&self) -> SocketAddr {
        self.addr(EVAL_LOG_OFFSET)
    }

    pub fn state_sync_local_addr(&self) -> SocketAddr {
        self.addr(STATE_SYNC_OFFSET)
    }

    pub fn reset_addr(&self) -> SocketAddr {
        self.addr(RESET_OFFSET)
    }

    pub fn reset_local_addr(&self) -> SocketAddr {
        self.addr(RESET_OFFSET + 1)
    }

    pub fn deploy_addr(&self) -> SocketAddr {
        self.addr(DEPLOY_OFFSET)
    }

    pub fn deploy_local_addr(&self) -> SocketAddr {
        self.addr(DEPLOY_OFFSET + 1)
    }
}
