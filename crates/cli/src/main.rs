//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Demonstration CLI for the Parsec client-side sync engine (§1, §6 "CLI
//! (out of core)"). Wires the facade (§4.9) behind `mount`/`sync`/`stat`
//! subcommands against an in-memory backend — there is no FUSE/Dokan
//! driver and no wire transport here, only argument parsing and the
//! plumbing that a real mount adapter would drive.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use parsec_sync_core::{
    BackendClient, BlockStore, DeviceKeypair, EventBus, FsFacade, InMemoryBackendClient, ManifestStore,
    OpenedFilesTable, Syncer,
};
use parsec_sync_types::{Access, DeviceId, FolderManifest, LocalManifest};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

/// Exit codes per the CLI's documented contract (out of core scope, §6):
/// `0` clean, `1` config error, `2` mount driver crash, `3` backend
/// unreachable at start.
mod exit_code {
    pub const CLEAN: u8 = 0;
    pub const CONFIG: u8 = 1;
    pub const DRIVER_CRASH: u8 = 2;
    pub const BACKEND_UNREACHABLE: u8 = 3;
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Parsec client-side file synchronization engine (demo CLI)", long_about = None)]
struct Cli {
    /// Path to a TOML config file overriding the built-in defaults.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Device identity, conventionally `<user>@<device>`.
    #[arg(long, global = true, default_value = "demo@cli")]
    device: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap a mountpoint: create a workspace, write a demo file,
    /// flush, sync, and print the resulting manifest state.
    Mount(MountArgs),
    /// Run a sync pass against the in-memory backend and report what was
    /// published.
    Sync(SyncArgs),
    /// Print the stat view of a freshly created entry.
    Stat(StatArgs),
}

#[derive(Args, Debug)]
struct MountArgs {
    /// Workspace name, used only to label the demo output.
    workspace: String,
    /// Mountpoint path (not actually mounted — no FUSE/Dokan driver here).
    path: PathBuf,
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Workspace name, used only to label the demo output.
    workspace: String,
    /// Recurse into child entries, per §4.7.
    #[arg(long, default_value_t = true)]
    recursive: bool,
}

#[derive(Args, Debug)]
struct StatArgs {
    /// Workspace name, used only to label the demo output.
    workspace: String,
}

/// CLI-level configuration (§A "Ambient stack"): mountpoint, backend
/// address, block size, sync retry limit, backend call deadline. Built
/// from `clap` flags layered over an optional TOML file, the same
/// `clap::Parser` + serde pattern the rest of this workspace uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ParsecConfig {
    #[serde(default = "default_backend_address")]
    backend_address: String,
    #[serde(default = "default_block_size")]
    block_size: u64,
    #[serde(default = "default_retry_limit")]
    sync_retry_limit: u32,
    #[serde(default = "default_deadline_secs")]
    backend_deadline_secs: u64,
}

fn default_backend_address() -> String {
    "memory://local".to_string()
}
fn default_block_size() -> u64 {
    parsec_sync_core::DEFAULT_BLOCK_SIZE
}
fn default_retry_limit() -> u32 {
    parsec_sync_core::MAX_CONSECUTIVE_UNAVAILABLE
}
fn default_deadline_secs() -> u64 {
    30
}

impl Default for ParsecConfig {
    fn default() -> Self {
        Self {
            backend_address: default_backend_address(),
            block_size: default_block_size(),
            sync_retry_limit: default_retry_limit(),
            backend_deadline_secs: default_deadline_secs(),
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ParsecConfig> {
    let Some(path) = path else {
        return Ok(ParsecConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config file: {}", path.display()))
}

fn parse_device_id(spec: &str) -> DeviceId {
    match spec.split_once('@') {
        Some((user, device)) => DeviceId::new(user, device),
        None => DeviceId::new(spec, "cli"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config error: {err:#}");
            return ExitCode::from(exit_code::CONFIG);
        }
    };

    let device_id = parse_device_id(&cli.device);

    let result = match cli.command {
        Commands::Mount(args) => run_mount(config, device_id, args).await,
        Commands::Sync(args) => run_sync(config, device_id, args).await,
        Commands::Stat(args) => run_stat(config, device_id, args).await,
    };

    match result {
        Ok(()) => ExitCode::from(exit_code::CLEAN),
        Err(err) => {
            eprintln!("error: {err:#}");
            if err.downcast_ref::<parsec_sync_core::SyncError>().is_some() {
                ExitCode::from(exit_code::BACKEND_UNREACHABLE)
            } else {
                ExitCode::from(exit_code::DRIVER_CRASH)
            }
        }
    }
}

/// The shared engine wiring every subcommand bootstraps: an in-memory
/// backend standing in for the vault protocol transport (§6), and the
/// component stack the facade routes through (§4.9).
struct Engine {
    facade: FsFacade,
    syncer: Syncer,
    root: Access,
}

async fn bootstrap(config: &ParsecConfig, device_id: DeviceId, workspace: &str) -> Result<Engine> {
    info!(
        backend = %config.backend_address,
        block_size = config.block_size,
        sync_retry_limit = config.sync_retry_limit,
        backend_deadline_secs = config.backend_deadline_secs,
        "bootstrapping engine"
    );

    let manifest_store = Arc::new(ManifestStore::new());
    let opened_files = Arc::new(Mutex::new(OpenedFilesTable::new()));
    let block_store = Arc::new(BlockStore::new());
    let backend: Arc<dyn BackendClient> = Arc::new(InMemoryBackendClient::new());
    let events = EventBus::new();
    let keypair = Arc::new(DeviceKeypair::generate());

    let syncer = Syncer::new(
        device_id.clone(),
        keypair,
        backend.clone(),
        manifest_store.clone(),
        opened_files.clone(),
        block_store.clone(),
        events,
    );

    let root = Access::new_placeholder();
    manifest_store
        .set(&root, LocalManifest::Workspace(FolderManifest::new_placeholder(device_id)))
        .await;
    manifest_store.register_path(root.clone(), format!("/{workspace}"), vec![]).await;

    let facade = FsFacade::new(manifest_store, opened_files, block_store, backend);
    Ok(Engine { facade, syncer, root })
}

async fn run_mount(config: ParsecConfig, device_id: DeviceId, args: MountArgs) -> Result<()> {
    info!(workspace = %args.workspace, path = %args.path.display(), "mounting workspace (demo)");
    let engine = bootstrap(&config, device_id.clone(), &args.workspace).await?;

    let file = engine.facade.create_file(&engine.root, "demo.txt", device_id).await?;
    let fd = engine.facade.open(&file).await?;
    engine.facade.write(fd, b"hello from parsec".to_vec(), Some(0)).await?;
    engine.facade.flush(fd).await?;

    engine.syncer.sync(&engine.root, true, vec![]).await?;

    let stat = engine.facade.stat(&file).await?;
    println!(
        "{}",
        serde_json::json!({
            "workspace": args.workspace,
            "mountpoint": args.path,
            "entry": stat.id.to_string(),
            "size": stat.size,
            "base_version": stat.base_version,
            "need_sync": stat.need_sync,
        })
    );
    Ok(())
}

async fn run_sync(config: ParsecConfig, device_id: DeviceId, args: SyncArgs) -> Result<()> {
    let engine = bootstrap(&config, device_id.clone(), &args.workspace).await?;
    let file = engine.facade.create_file(&engine.root, "sync-demo.txt", device_id).await?;
    let fd = engine.facade.open(&file).await?;
    engine.facade.write(fd, b"synced payload".to_vec(), Some(0)).await?;
    engine.facade.flush(fd).await?;

    engine.syncer.sync(&engine.root, args.recursive, vec![]).await?;
    engine.syncer.full_sync().await?;

    let stat = engine.facade.stat(&engine.root).await?;
    println!(
        "workspace {} synced: base_version={} need_sync={}",
        args.workspace, stat.base_version, stat.need_sync
    );
    Ok(())
}

async fn run_stat(config: ParsecConfig, device_id: DeviceId, args: StatArgs) -> Result<()> {
    let engine = bootstrap(&config, device_id.clone(), &args.workspace).await?;
    let file = engine.facade.create_file(&engine.root, "stat-demo.txt", device_id).await?;
    let stat = engine.facade.stat(&file).await?;
    println!(
        "{}",
        serde_json::json!({
            "entry": stat.id.to_string(),
            "is_dir": stat.is_dir,
            "size": stat.size,
            "base_version": stat.base_version,
            "need_sync": stat.need_sync,
            "is_placeholder": stat.is_placeholder,
        })
    );
    Ok(())
}
