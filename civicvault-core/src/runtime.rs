//! Process entry points for every CLI action
//!
//! `node` and `manager` are long-running and stop on Ctrl+C. `store`,
//! `fetch` and `nodes` run a short-lived manager: they bind the discovery
//! endpoint, collect join beacons for the `--wait` window, perform the
//! request and exit.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, FileCatalog};
use crate::config::{Action, Config};
use crate::listener::DiscoveryListener;
use crate::manager::{CloudError, CloudManager, RetrievalMode};
use crate::node::{NodeError, StorageNode};
use crate::registry::NodeId;
use crate::storage::ensure_backing_file;
use crate::supervisor::ManualSupervisor;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, RuntimeError>;

pub async fn run(config: Config, action: Action) -> Result<()> {
    match action {
        Action::Manager => run_manager(config).await,
        Action::Node { id } => run_node(config, id).await,
        Action::Store { path, name, wait } => {
            let hash = store_file(config, &path, name, wait).await?;
            println!("{}", hash);
            Ok(())
        }
        Action::Fetch {
            hash,
            output,
            best_effort,
            wait,
        } => {
            let written = fetch_file(config, &hash, output, best_effort, wait).await?;
            println!("{}", written.display());
            Ok(())
        }
        Action::Nodes { wait } => list_nodes(config, wait).await,
    }
}

/// Run storage node `id` until Ctrl+C
pub async fn run_node(config: Config, id: NodeId) -> Result<()> {
    let node = StorageNode::bind(&config, id).await?;
    info!(
        "Node {} listening on {}, announcing to {}",
        id,
        node.local_addr()?,
        config.discovery_addr
    );

    node.run_until(async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    })
    .await?;
    Ok(())
}

/// Run the manager until Ctrl+C, registering nodes as they announce
pub async fn run_manager(config: Config) -> Result<()> {
    let manager = Arc::new(open_manager(config).await?);
    let listener = spawn_listener(&manager).await?;

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    loop {
        tokio::select! {
            _ = status.tick() => {
                let stats = manager.admin_stats().await;
                let online = stats.nodes.iter().filter(|n| n.online).count();
                info!(
                    "{} nodes online, {} files, {} of {} bytes used",
                    online, stats.file_count, stats.used_storage, stats.total_storage
                );
                debug!("\n{}", manager.prometheus().await);
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    listener.abort();
    info!("Manager stopped");
    Ok(())
}

async fn open_manager(config: Config) -> Result<CloudManager> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let disk = config.disk_path();
    let total = config.total_disk_size;
    tokio::task::spawn_blocking(move || ensure_backing_file(disk, total))
        .await
        .map_err(std::io::Error::other)??;

    let catalog = FileCatalog::open(config.catalog_path()).await?;
    Ok(CloudManager::new(
        config,
        catalog,
        Arc::new(ManualSupervisor::new()),
    )?)
}

async fn spawn_listener(manager: &CloudManager) -> Result<JoinHandle<()>> {
    let listener =
        DiscoveryListener::bind(manager.config().discovery_addr, manager.membership().clone())
            .await?;
    Ok(listener.spawn())
}

/// Manager with a live listener, after waiting up to `wait` for every node
async fn short_lived_manager(
    config: Config,
    wait: Duration,
) -> Result<(CloudManager, JoinHandle<()>)> {
    let manager = open_manager(config).await?;
    let listener = spawn_listener(&manager).await?;
    wait_for_nodes(&manager, wait).await;
    Ok((manager, listener))
}

async fn wait_for_nodes(manager: &CloudManager, wait: Duration) {
    let expected = manager.config().node_count as usize;
    let deadline = tokio::time::Instant::now() + wait;
    while manager.registry().len().await < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!(
        "{} of {} nodes registered",
        manager.registry().len().await,
        expected
    );
}

/// Store the file at `path` and return its content hash
pub async fn store_file(
    config: Config,
    path: &Path,
    name: Option<String>,
    wait: Duration,
) -> Result<String> {
    let payload = Bytes::from(tokio::fs::read(path).await?);
    let filename = name.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    });

    let (manager, listener) = short_lived_manager(config, wait).await?;
    let result = manager.distribute(payload, &filename).await;
    listener.abort();
    Ok(result?)
}

/// Fetch `hash` and write it to `output`, or to its recorded filename
///
/// Returns the path written.
pub async fn fetch_file(
    config: Config,
    hash: &str,
    output: Option<PathBuf>,
    best_effort: bool,
    wait: Duration,
) -> Result<PathBuf> {
    let mode = if best_effort {
        RetrievalMode::BestEffort
    } else {
        RetrievalMode::Strict
    };

    let (manager, listener) = short_lived_manager(config, wait).await?;
    let result = manager.retrieve_with(hash, mode).await;
    listener.abort();
    let retrieved = result?;

    if !retrieved.is_complete() {
        warn!(
            "{} chunks missing from {}; output is incomplete",
            retrieved.missing.len(),
            retrieved.filename
        );
    }

    let target = output.unwrap_or_else(|| {
        Path::new(&retrieved.filename)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(hash))
    });
    tokio::fs::write(&target, &retrieved.data).await?;
    Ok(target)
}

async fn list_nodes(config: Config, wait: Duration) -> Result<()> {
    let (manager, listener) = short_lived_manager(config, wait).await?;
    listener.abort();

    let stats = manager.admin_stats().await;
    for node in stats.nodes {
        let address = node
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "node {}\t{}\toffset {}\tsize {}\t{} chunks\t{} bytes",
            node.id,
            address,
            node.partition.offset,
            node.partition.size,
            node.chunk_count,
            node.used_bytes
        );
    }
    println!(
        "{} files, {} of {} bytes used",
        stats.file_count, stats.used_storage, stats.total_storage
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            total_disk_size: 3 * 4096,
            node_count: 3,
            chunk_size: 1024,
            discovery_addr: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_unknown_hash() {
        let dir = tempfile::tempdir().unwrap();
        let result = fetch_file(config(dir.path()), "missing", None, false, Duration::ZERO).await;

        assert!(matches!(
            result,
            Err(RuntimeError::Cloud(CloudError::NotFound(_)))
        ));
        assert!(dir.path().join("civic_cloud_disk.vfat").exists());
    }

    #[tokio::test]
    async fn test_store_without_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        tokio::fs::write(&input, b"hello").await.unwrap();

        let result = store_file(config(dir.path()), &input, None, Duration::ZERO).await;

        assert!(matches!(
            result,
            Err(RuntimeError::Cloud(CloudError::NoNodesOnline))
        ));
    }

    #[tokio::test]
    async fn test_store_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let result = store_file(
            config(dir.path()),
            &dir.path().join("nope"),
            None,
            Duration::ZERO,
        )
        .await;

        assert!(matches!(result, Err(RuntimeError::Io(_))));
    }
}
