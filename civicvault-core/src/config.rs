//! Configuration management for CivicVault
//!
//! Handles CLI argument parsing, config file loading, and defaults.
//! Precedence is defaults, then the TOML file given by `--config`, then
//! individual CLI flags.

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::chunker::DEFAULT_CHUNK_SIZE;
use crate::protocol::FRAME_OVERHEAD;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("{0}")]
    Cli(#[from] clap::Error),
}

#[derive(Parser, Debug)]
#[command(name = "civicvault")]
#[command(about = "Chunked storage manager and partitioned storage nodes", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML config file; flags given on the command line take precedence
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    cluster: ClusterArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the manager: discovery listener and membership registry
    Manager,
    /// Run a storage node
    Node(NodeCommand),
    /// Split a file into chunks and place them on the online nodes
    Store(StoreCommand),
    /// Reassemble a stored file from its content hash
    Fetch(FetchCommand),
    /// List the nodes that announce themselves within the wait window
    Nodes(WaitArgs),
}

/// Cluster-wide overrides shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Directory holding the backing disk, node indexes and the file catalog
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Shared backing file (defaults to <data-dir>/civic_cloud_disk.vfat)
    #[arg(long, global = true)]
    pub disk_path: Option<PathBuf>,

    /// Total size of the shared backing file in bytes
    #[arg(long, global = true)]
    pub total_disk_size: Option<u64>,

    /// Number of partitions the backing file is sliced into
    #[arg(long, global = true)]
    pub node_count: Option<u32>,

    /// Chunk size in bytes
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// UDP endpoint the manager listens on for join beacons
    #[arg(long, global = true)]
    pub discovery_addr: Option<SocketAddr>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct NodeCommand {
    /// Node ordinal, starting at 1
    #[arg(long)]
    pub id: u32,

    /// Control endpoint to bind (port 0 picks a free port)
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

#[derive(Args, Debug, Clone)]
pub struct WaitArgs {
    /// Seconds to wait for nodes to announce themselves
    /// (defaults to one announce interval plus a second)
    #[arg(long)]
    pub wait: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct StoreCommand {
    /// File to store
    pub path: PathBuf,

    /// Filename to record (defaults to the file's own name)
    #[arg(long)]
    pub name: Option<String>,

    #[command(flatten)]
    pub wait: WaitArgs,
}

#[derive(Args, Debug, Clone)]
pub struct FetchCommand {
    /// Content hash returned by `store`
    pub hash: String,

    /// Output path (defaults to the recorded filename)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Write whatever chunks could be recovered instead of failing
    #[arg(long)]
    pub best_effort: bool,

    #[command(flatten)]
    pub wait: WaitArgs,
}

/// What the binary was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Manager,
    Node {
        id: u32,
    },
    Store {
        path: PathBuf,
        name: Option<String>,
        wait: Duration,
    },
    Fetch {
        hash: String,
        output: Option<PathBuf>,
        best_effort: bool,
        wait: Duration,
    },
    Nodes {
        wait: Duration,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Manager => "manager",
            Action::Node { .. } => "node",
            Action::Store { .. } => "store",
            Action::Fetch { .. } => "fetch",
            Action::Nodes { .. } => "nodes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub disk_path: Option<PathBuf>,
    pub total_disk_size: u64,
    pub node_count: u32,
    pub chunk_size: usize,
    pub discovery_addr: SocketAddr,
    pub node_bind_addr: SocketAddr,
    pub io_timeout_ms: u64,
    /// Seconds between join beacons; 0 announces once at start-up
    pub announce_interval_secs: u64,
    pub max_frame_len: usize,
    /// Concurrent node calls per distribute/retrieve; 1 keeps them serial
    pub max_inflight: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            disk_path: None,
            total_disk_size: 3 * 1024 * 1024 * 1024,
            node_count: 3,
            chunk_size: DEFAULT_CHUNK_SIZE,
            discovery_addr: SocketAddr::from(([127, 0, 0, 1], 9001)),
            node_bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            io_timeout_ms: 10_000,
            announce_interval_secs: 5,
            max_frame_len: 256 * 1024 * 1024,
            max_inflight: 1,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Parse the process arguments into a validated config and an action
    pub fn from_cli() -> Result<(Self, Action), ConfigError> {
        let cli = Cli::parse();
        Self::from_parsed(cli)
    }

    /// Same as [`Config::from_cli`] but over an explicit argument list
    pub fn from_args<I, T>(args: I) -> Result<(Self, Action), ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args)?;
        Self::from_parsed(cli)
    }

    fn from_parsed(cli: Cli) -> Result<(Self, Action), ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply(&cli.cluster);

        let action = match cli.command {
            Commands::Manager => Action::Manager,
            Commands::Node(cmd) => {
                if let Some(bind) = cmd.bind {
                    config.node_bind_addr = bind;
                }
                Action::Node { id: cmd.id }
            }
            Commands::Store(cmd) => Action::Store {
                path: cmd.path,
                name: cmd.name,
                wait: config.discovery_wait(cmd.wait.wait),
            },
            Commands::Fetch(cmd) => Action::Fetch {
                hash: cmd.hash,
                output: cmd.output,
                best_effort: cmd.best_effort,
                wait: config.discovery_wait(cmd.wait.wait),
            },
            Commands::Nodes(wait) => Action::Nodes {
                wait: config.discovery_wait(wait.wait),
            },
        };

        config.validate()?;
        Ok((config, action))
    }

    /// Load config from a TOML file; missing keys keep their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Overlay CLI flags that were actually given
    pub fn apply(&mut self, args: &ClusterArgs) {
        if let Some(dir) = &args.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(path) = &args.disk_path {
            self.disk_path = Some(path.clone());
        }
        if let Some(size) = args.total_disk_size {
            self.total_disk_size = size;
        }
        if let Some(count) = args.node_count {
            self.node_count = count;
        }
        if let Some(size) = args.chunk_size {
            self.chunk_size = size;
        }
        if let Some(addr) = args.discovery_addr {
            self.discovery_addr = addr;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_count == 0 {
            return Err(ConfigError::Invalid(
                "node_count must be greater than 0".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.total_disk_size < u64::from(self.node_count) {
            return Err(ConfigError::Invalid(format!(
                "total_disk_size {} cannot be split into {} partitions",
                self.total_disk_size, self.node_count
            )));
        }
        if self.max_frame_len < self.chunk_size.saturating_add(FRAME_OVERHEAD) {
            return Err(ConfigError::Invalid(format!(
                "max_frame_len {} cannot carry a {} byte chunk",
                self.max_frame_len, self.chunk_size
            )));
        }
        if self.max_inflight == 0 {
            return Err(ConfigError::Invalid(
                "max_inflight must be greater than 0".to_string(),
            ));
        }
        if self.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "io_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn partition_size(&self) -> u64 {
        self.total_disk_size / u64::from(self.node_count.max(1))
    }

    pub fn disk_path(&self) -> PathBuf {
        self.disk_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("civic_cloud_disk.vfat"))
    }

    pub fn index_path(&self, node_id: u32) -> PathBuf {
        self.data_dir.join(format!("node_{}_index.json", node_id))
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// How long a one-shot command listens for beacons
    ///
    /// An explicit `--wait` wins; otherwise the window spans a full announce
    /// interval so every running node beacons at least once inside it.
    pub fn discovery_wait(&self, explicit: Option<u64>) -> Duration {
        let secs = explicit.unwrap_or(self.announce_interval_secs.max(1) + 1);
        Duration::from_secs(secs)
    }

    pub fn announce_interval(&self) -> Option<Duration> {
        match self.announce_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
