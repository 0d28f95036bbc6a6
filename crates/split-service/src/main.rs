use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use split_chain::{ChainStream, TonCenterClient};
use split_config::ConfigLoader;
use split_core::{
	AutoTimeoutScheduler, IntentWatcher, SchedulerConfig, SnapshotBus, WatcherConfig,
};
use split_settlement::Matcher;
use split_storage::{BillStore, PgStorage};
use split_types::AccountStream;

mod api;
mod service;

#[derive(Parser)]
#[command(name = "split-service")]
#[command(about = "Shared-bill settlement service", long_about = None)]
struct Cli {
	#[arg(short, long, value_name = "FILE", default_value = "configs/split.toml")]
	config: PathBuf,

	#[arg(long, env = "SPLIT_LOG_LEVEL")]
	log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	let config = ConfigLoader::from_file(&cli.config).context("Failed to load configuration")?;
	let log_level = cli.log_level.as_deref().unwrap_or(&config.log_level);
	setup_tracing(log_level)?;
	info!(path = ?cli.config, "configuration loaded");

	// Storage first: nothing works without it.
	let store = Arc::new(
		PgStorage::connect(&config.database_url())
			.await
			.context("Failed to connect to PostgreSQL")?,
	);
	let store: Arc<dyn BillStore> = store;

	// One shutdown signal fans out to the stream, the watchers and the
	// timers.
	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let stream = ChainStream::new(config.stream_url.clone(), config.ton_api_token.clone());
	let stream_task = stream.start(shutdown_rx.clone());
	let stream: Arc<dyn AccountStream> = stream;

	let query = Arc::new(
		TonCenterClient::new(config.toncenter_url.clone(), config.ton_center_api_key.clone())
			.context("Failed to build chain query client")?,
	);
	let matcher = Arc::new(Matcher::new(query));
	let bus = Arc::new(SnapshotBus::new());

	let scheduler = AutoTimeoutScheduler::new(
		store.clone(),
		bus.clone(),
		SchedulerConfig::default(),
		shutdown_rx.clone(),
	);
	scheduler
		.bootstrap()
		.await
		.context("Failed to re-arm bill timers")?;

	let watcher = IntentWatcher::new(
		store.clone(),
		stream,
		matcher,
		bus.clone(),
		WatcherConfig::default(),
		shutdown_rx,
	);

	let service = service::SplitService::new(store, bus, watcher, scheduler, config.clone());
	let app = api::router(service);

	let listener = tokio::net::TcpListener::bind(&config.bind_address)
		.await
		.with_context(|| format!("Failed to bind {}", config.bind_address))?;
	info!(addr = %config.bind_address, "http server listening");

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await
		.context("HTTP server failed")?;

	info!("shutdown signal received, stopping");
	let _ = shutdown_tx.send(true);
	let _ = stream_task.await;
	info!("split service stopped");
	Ok(())
}

fn setup_tracing(log_level: &str) -> Result<()> {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

	tracing_subscriber::registry()
		.with(env_filter)
		.with(tracing_subscriber::fmt::layer())
		.init();

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c()
			.await
			.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install signal handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
