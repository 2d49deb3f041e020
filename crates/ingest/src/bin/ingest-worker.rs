//! ingest-worker: runs ingestion cycles over a storage prefix set.
//!
//! Each cycle migrates the legacy checkpoint file into the shared KV store
//! (when one is configured), dispatches every object under the given
//! prefixes and writes the resulting events to stdout as JSON lines.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cloudtap_checkpoint::{
    new_owner_token, CheckpointMigrator, CheckpointStore, FileMarkerStore, HttpKvBackend,
    MarkerStore, MigrationKind, RemoteCheckpointStore, RetryPolicy,
};
use cloudtap_core::Config;
use cloudtap_ingest::{
    CheckpointSetup, CollectorSettings, DispatchSettings, DispatchTask, IngestionCollector,
    StorageDispatcher,
};
use cloudtap_storage::{source_from_config, ObjectSource};

// ── CLI ─────────────────────────────────────────────────────────────

/// Cloud object ingestion worker.
#[derive(Parser, Debug)]
#[command(name = "ingest-worker", version, about)]
struct Cli {
    /// Task name; the first part of every checkpoint key.
    #[arg(long, env = "INGEST_TASK", default_value = "ingest")]
    task: String,

    /// Prefix to ingest. Repeatable.
    #[arg(long = "prefix", default_value = "")]
    prefixes: Vec<String>,

    /// Input name the legacy checkpoint file and migration marker belong to.
    /// Defaults to the task name.
    #[arg(long)]
    input: Option<String>,

    /// Legacy checkpoint file. Defaults to `<checkpoint_dir>/<input>.ckpt`.
    #[arg(long)]
    legacy_file: Option<PathBuf>,

    /// How legacy entries map onto the shared store.
    #[arg(long, default_value = "verbatim")]
    kind: MigrationKind,

    /// Seconds between cycles.
    #[arg(long, env = "INGEST_INTERVAL", default_value_t = 60)]
    interval: u64,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
}

// ── cycle ───────────────────────────────────────────────────────────

struct Worker {
    cli: Cli,
    config: Config,
    source: Arc<dyn ObjectSource>,
    markers: Arc<dyn MarkerStore>,
    /// Migration owner token, reused by every cycle of this process.
    token: String,
}

impl Worker {
    fn input(&self) -> &str {
        self.cli.input.as_deref().unwrap_or(&self.cli.task)
    }

    fn legacy_path(&self) -> PathBuf {
        self.cli.legacy_file.clone().unwrap_or_else(|| {
            self.config
                .storage
                .checkpoint_dir
                .join(format!("{}.ckpt", self.input()))
        })
    }

    async fn setup(&self, shutdown: &CancellationToken) -> CheckpointSetup {
        let setup = CheckpointSetup::legacy(self.legacy_path());
        if !self.config.checkpoint.is_configured() {
            return setup;
        }

        let remote = match self.connect().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "shared checkpoint store unavailable, using legacy checkpoints");
                return setup;
            }
        };
        let migrator = CheckpointMigrator::new(
            self.input(),
            self.legacy_path(),
            remote.clone(),
            self.markers.clone(),
        )
        .with_kind(self.cli.kind)
        .with_token(self.token.clone())
        .with_lease(self.config.checkpoint.migration_lease())
        .with_cancel(shutdown.child_token());

        setup.with_remote(remote, Arc::new(migrator))
    }

    async fn connect(&self) -> anyhow::Result<Arc<dyn CheckpointStore>> {
        let backend = HttpKvBackend::from_config(&self.config.checkpoint)?;
        let store = RemoteCheckpointStore::connect(
            Arc::new(backend),
            self.config.checkpoint.collection.clone(),
            RetryPolicy::from_config(&self.config.checkpoint),
        )
        .await?;
        Ok(Arc::new(store))
    }

    async fn run_cycle(&self, shutdown: &CancellationToken) -> anyhow::Result<()> {
        let setup = self.setup(shutdown).await;
        let dispatcher = StorageDispatcher::new(self.cli.task.clone(), self.source.clone())
            .with_tasks(self.cli.prefixes.iter().map(DispatchTask::new))
            .with_settings(DispatchSettings::from(&self.config.ingest));

        let mut collector = IngestionCollector::start_with_parent(
            &setup,
            dispatcher,
            CollectorSettings::from(&self.config.ingest),
            shutdown,
        )
        .await
        .context("failed to start ingestion cycle")?;

        let stdout = std::io::stdout();
        while let Some(events) = collector.next_batch().await? {
            let mut out = stdout.lock();
            for event in &events {
                serde_json::to_writer(&mut out, event)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }

        let stats = collector.stats();
        info!(
            store = collector.store_name(),
            events = stats.events,
            batches = stats.batches,
            checkpoints_saved = stats.checkpoints_saved,
            unflushed = stats.unflushed,
            "cycle complete"
        );
        Ok(())
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cloudtap_core::config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let source: Arc<dyn ObjectSource> =
        Arc::new(source_from_config(&config).context("failed to open object source")?);
    let markers: Arc<dyn MarkerStore> =
        Arc::new(FileMarkerStore::new(config.storage.checkpoint_dir.clone())?);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C, stopping");
                shutdown.cancel();
            }
        });
    }

    let worker = Worker {
        token: new_owner_token(),
        cli,
        config,
        source,
        markers,
    };
    info!(
        task = %worker.cli.task,
        input = worker.input(),
        token = %worker.token,
        "ingest-worker starting"
    );

    loop {
        if let Err(e) = worker.run_cycle(&shutdown).await {
            error!(error = %e, "ingestion cycle failed");
            if worker.cli.once {
                return Err(e);
            }
        }
        if worker.cli.once || shutdown.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(worker.cli.interval)) => {}
        }
    }

    info!("ingest-worker exited cleanly");
    Ok(())
}
