//! Peersync CLI - inspect folders and drive reconciliation runs.
//!
//! `reconcile` brings every device of a cluster file up on an in-process
//! network, each serving its own local directory, and runs the background
//! syncer on one of them.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use peersync_common::{DeviceId, FolderPath, PeerAddress, PeerRef};
use peersync_history::{scan_folder, HistoryStore};
use peersync_net::{serve, Coordinator, MemoryNetwork};
use peersync_storage::{create_default_registry, LocalProvider, StorageProvider};
use peersync_sync::{conflict_path, BackgroundSyncer, DeviceContext, SyncConfig, SyncHandler};

const HISTORY_FILE: &str = "history.bin";

#[derive(Parser)]
#[command(name = "peersync")]
#[command(about = "Peersync - peer-to-peer folder reconciliation")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the version history a scan of a folder would record.
    Snapshot {
        /// Folder root.
        #[arg(short, long)]
        dir: PathBuf,

        /// Device to attribute the versions to.
        #[arg(long, default_value = "local")]
        device: String,
    },

    /// Print the conflict file name for a path.
    ConflictName {
        /// Path inside the folder.
        path: String,

        /// Device whose own copy is moved aside under the conflict name.
        #[arg(long)]
        device: String,
    },

    /// Print the default sync configuration.
    DefaultConfig,

    /// Run one reconciliation over the devices of a cluster file.
    Reconcile {
        /// Cluster description (JSON).
        #[arg(short, long)]
        config: PathBuf,

        /// Device that runs the syncer (default: highest id).
        #[arg(long)]
        device: Option<String>,
    },
}

/// One device of a cluster file.
#[derive(Debug, Deserialize)]
struct DeviceEntry {
    id: String,
    /// Provider configuration, resolved through the provider registry.
    /// A bare `root` is shorthand for a local provider.
    #[serde(default)]
    storage: Option<serde_json::Value>,
    #[serde(default)]
    root: Option<PathBuf>,
}

/// Devices of one user that share a folder.
#[derive(Debug, Deserialize)]
struct ClusterConfig {
    user: String,
    devices: Vec<DeviceEntry>,
    #[serde(default)]
    sync: SyncConfig,
}

impl ClusterConfig {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: ClusterConfig =
            serde_json::from_str(&text).context("Invalid cluster configuration")?;
        if config.devices.is_empty() {
            bail!("Cluster configuration lists no devices");
        }
        Ok(config)
    }

    /// The requested device, or the one a blocking run would elect.
    fn runner(&self, requested: Option<&str>) -> Result<DeviceId> {
        match requested {
            Some(id) => {
                if !self.devices.iter().any(|d| d.id == id) {
                    bail!("Device '{}' is not part of the cluster", id);
                }
                Ok(DeviceId::new(id)?)
            }
            None => {
                let mut ids = self
                    .devices
                    .iter()
                    .map(|d| DeviceId::new(d.id.as_str()))
                    .collect::<peersync_common::Result<Vec<_>>>()?;
                ids.sort();
                ids.pop().context("Cluster configuration lists no devices")
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Snapshot { dir, device } => cmd_snapshot(&dir, &device).await,
        Commands::ConflictName { path, device } => cmd_conflict_name(&path, &device),
        Commands::DefaultConfig => cmd_default_config(),
        Commands::Reconcile { config, device } => cmd_reconcile(&config, device.as_deref()).await,
    }
}

async fn cmd_snapshot(dir: &Path, device: &str) -> Result<()> {
    let provider = LocalProvider::new(dir).context("Failed to open folder")?;
    let device = DeviceId::new(device).context("Invalid device id")?;

    let previous = load_history(&provider, &device, "").await?.snapshot();
    let scanned = scan_folder(&provider, &previous, &device)
        .await
        .context("Failed to scan folder")?;

    let entries: serde_json::Map<String, serde_json::Value> = scanned
        .iter()
        .map(|(path, history)| {
            (
                path.to_string(),
                serde_json::to_value(history).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn cmd_conflict_name(path: &str, device: &str) -> Result<()> {
    let path = FolderPath::parse(path).context("Invalid path")?;
    let device = DeviceId::new(device).context("Invalid device id")?;
    let target = conflict_path(&path, &device).context("Path has no file name")?;
    println!("{}", target);
    Ok(())
}

fn cmd_default_config() -> Result<()> {
    println!("{}", SyncConfig::default().to_json()?);
    Ok(())
}

async fn cmd_reconcile(config_path: &Path, device: Option<&str>) -> Result<()> {
    let cluster = ClusterConfig::load(config_path)?;
    let runner = cluster.runner(device)?;
    let registry = create_default_registry();
    let network = MemoryNetwork::new();

    let mut contexts = Vec::new();
    for entry in &cluster.devices {
        let id = DeviceId::new(entry.id.as_str())
            .with_context(|| format!("Invalid device id '{}'", entry.id))?;
        let local = PeerRef::new(
            cluster.user.as_str(),
            id.clone(),
            PeerAddress::new(format!("mem://{}", id)),
        );

        let (provider, state_dir): (Arc<dyn StorageProvider>, Option<PathBuf>) =
            match (&entry.storage, &entry.root) {
                (Some(storage), _) => (
                    registry
                        .resolve_config(storage)
                        .with_context(|| format!("Failed to resolve storage of {}", id))?,
                    None,
                ),
                (None, Some(root)) => {
                    let provider = LocalProvider::new(root)
                        .with_context(|| format!("Failed to open {}", root.display()))?;
                    let state_dir = provider.state_dir();
                    (Arc::new(provider), Some(state_dir))
                }
                (None, None) => bail!("Device '{}' needs a root or a storage section", id),
            };

        let history_file = state_dir.map(|dir| dir.join(HISTORY_FILE));
        let store = match &history_file {
            Some(file) => HistoryStore::load_or_new(file, id.clone(), cluster.user.as_str())
                .await
                .with_context(|| format!("Failed to load history of {}", id))?,
            None => HistoryStore::new(id.clone(), cluster.user.as_str()),
        };

        let (transport, inbox) = network.join(local.clone()).await;
        let coordinator = Coordinator::new(local, Arc::new(transport));
        let mut ctx = DeviceContext::new(
            provider,
            store,
            coordinator.clone(),
            Arc::new(network.clone()),
            cluster.sync.clone(),
        );
        if let Some(file) = history_file {
            ctx = ctx.with_store_file(file);
        }
        let ctx = Arc::new(ctx);
        tokio::spawn(serve(inbox, coordinator, Arc::new(SyncHandler::new(ctx.clone()))));
        contexts.push(ctx);
    }

    let ctx = contexts
        .iter()
        .find(|ctx| ctx.local.device == runner)
        .context("Runner device did not start")?
        .clone();

    info!("Running {:?} reconciliation on {}", cluster.sync.variant, runner);
    let report = BackgroundSyncer::new(ctx).run().await;

    // Followers persist what the leader's result changed on their side.
    for other in &contexts {
        other
            .save_store()
            .await
            .with_context(|| format!("Failed to save history of {}", other.local.device))?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.is_aborted() {
        bail!(
            "Run aborted: {}",
            report.abort_reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

/// The persisted history of a local folder, or an empty one.
async fn load_history(
    provider: &LocalProvider,
    device: &DeviceId,
    owner: &str,
) -> Result<HistoryStore> {
    let file = provider.state_dir().join(HISTORY_FILE);
    let store = HistoryStore::load_or_new(&file, device.clone(), owner)
        .await
        .with_context(|| format!("Failed to load {}", file.display()))?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_storage::STATE_DIR_NAME;

    #[test]
    fn test_runner_defaults_to_highest_id() {
        let cluster: ClusterConfig = serde_json::from_str(
            r#"{"user": "alice", "devices": [
                {"id": "laptop", "root": "/tmp/a"},
                {"id": "phone", "root": "/tmp/b"},
                {"id": "desktop", "root": "/tmp/c"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(cluster.runner(None).unwrap().as_str(), "phone");
        assert_eq!(cluster.runner(Some("laptop")).unwrap().as_str(), "laptop");
        assert!(cluster.runner(Some("tablet")).is_err());
    }

    #[test]
    fn test_conflict_name_argument_names_the_moving_device() {
        let cli = Cli::try_parse_from(["peersync", "conflict-name", "/r.txt", "--device", "a"])
            .unwrap();
        let Commands::ConflictName { path, device } = cli.command else {
            panic!("expected conflict-name");
        };
        let path = FolderPath::parse(&path).unwrap();
        let target = conflict_path(&path, &DeviceId::new(device).unwrap()).unwrap();
        assert_eq!(target.to_string(), "/r_conflict_a.txt");
        assert!(cmd_conflict_name("/r.txt", "bad.id").is_err());
    }

    #[tokio::test]
    async fn test_reconcile_two_local_folders() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("notes.txt"), b"from a").unwrap();

        let config_dir = tempfile::tempdir().unwrap();
        let config_file = config_dir.path().join("cluster.json");
        let cluster = serde_json::json!({
            "user": "alice",
            "devices": [
                {"id": "a", "root": a.path()},
                {"id": "b", "root": b.path()},
            ],
            "sync": {"variant": "non_blocking", "exchange_timeout": 500},
        });
        std::fs::write(&config_file, cluster.to_string()).unwrap();

        cmd_reconcile(&config_file, Some("b")).await.unwrap();

        assert_eq!(std::fs::read(b.path().join("notes.txt")).unwrap(), b"from a");
        assert!(b.path().join(STATE_DIR_NAME).join(HISTORY_FILE).exists());
    }
}
