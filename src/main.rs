use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use voxweave::config::Config;
use voxweave::engine::TaskEngine;
use voxweave::gateway::{self, AppState};
use voxweave::monitor::{self, sweeper};
use voxweave::provider::{ProviderClient, SpeechSynthesizer};
use voxweave::storage::{FsObjectStore, HttpObjectStore, ObjectStore, TaskIndex};

/// Dialogue-to-audio synthesis service.
#[derive(Parser, Debug)]
#[command(name = "voxweave", version, about)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, env = "VOXWEAVE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the gateway bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the gateway bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxweave=info,warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.gateway.host = host;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    let backends = monitor::select_backend(&config).await;
    let index = Arc::new(TaskIndex::open(&config.storage.db_path)?);
    let store: Arc<dyn ObjectStore> = if config.storage.base_url.is_empty() {
        tracing::info!(dir = %config.storage.local_dir, "using filesystem object store");
        Arc::new(FsObjectStore::new(config.storage.local_dir.clone()))
    } else {
        Arc::new(HttpObjectStore::new(&config.storage)?)
    };
    let synthesizer: Arc<dyn SpeechSynthesizer> = {
        let engine_voices = voxweave::dialogue::VoiceMap::from_config(&config.speakers);
        Arc::new(ProviderClient::new(
            config.provider.clone(),
            Arc::new(engine_voices),
        ))
    };

    let engine = Arc::new(TaskEngine::new(
        &config,
        Arc::clone(&backends.monitor),
        Arc::clone(&backends.limiter),
        synthesizer,
        store,
        Arc::clone(&index),
    ));

    let _sweeper = sweeper::spawn_sweeper(
        Arc::clone(&backends.monitor),
        Arc::clone(&backends.limiter),
        &config.engine,
    );

    let state = AppState {
        engine,
        monitor: backends.monitor,
        limiter: backends.limiter,
        index,
        backend_name: backends.name,
        max_text_chars: config.engine.max_text_chars,
        sse_idle: Duration::from_secs(config.gateway.sse_idle_timeout_secs),
        sse_keepalive: Duration::from_secs(config.gateway.sse_keepalive_secs),
    };

    gateway::run_gateway(&config, state).await
}
