//! Subsystem assembly and lifecycle.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use event_store::{EventStore, RetentionSweeper, StoreConfigBuilder};
use spectre_event::normalize_api_timestamp;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    analysis::{RootCauseAnalyzer, RootCauseConfig},
    cli::{Command, ExportOpts, ImportOpts, Opts, ServerOpts, ValidateConfigOpts},
    config::{ConfigWatcher, GraphConfig, SpectreConfig, WatchConfig},
    extractors::ExtractorRegistry,
    graph::{CachedStore, GraphStore, MemoryStore, Neo4jStore},
    kubernetes::{KubeWatcher, Reconciler, ReconcilerConfig},
    pipeline::{
        CausalityConfig, EventProcessor, PipelineConfig, ProcessorConfig, SyncPipeline,
    },
    timeline::{TimelineConfig, TimelineService},
};

/// Entry point used by `main`; returns the process exit code.
pub async fn run(opts: Opts) -> i32 {
    init_logging(&opts.log_level, opts.log_json);

    let result = match opts.command {
        Command::Server(server) => run_server(server).await,
        Command::Export(export) => run_export(export).await,
        Command::Import(import) => run_import(import).await,
        Command::ValidateConfig(validate) => run_validate_config(validate),
    };

    match result {
        Ok(()) => exitcode::OK,
        Err(error) => {
            error!("{error:#}");
            exitcode::SOFTWARE
        }
    }
}

fn init_logging(filter: &str, json: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt().with_env_filter(env_filter).json().init();
    } else {
        fmt().with_env_filter(env_filter).init();
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<SpectreConfig> {
    match path {
        Some(path) => SpectreConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(SpectreConfig::default()),
    }
}

async fn build_graph(config: &GraphConfig) -> anyhow::Result<Arc<dyn GraphStore>> {
    let inner: Arc<dyn GraphStore> = match config.neo4j() {
        None => {
            info!("using in-process memory graph backend");
            Arc::new(MemoryStore::new())
        }
        Some(neo4j) => {
            let store = Neo4jStore::connect(&neo4j)
                .await
                .context("dialing the graph store")?;
            store.ping().await.context("graph store ping")?;
            Arc::new(store)
        }
    };
    Ok(Arc::new(CachedStore::new(inner)))
}

async fn open_store(config: &SpectreConfig) -> anyhow::Result<EventStore> {
    let store_config = StoreConfigBuilder::from_path(&config.data_dir)
        .block_size_limit(config.block_size)
        .retention_window(config.retention_window())
        .build()
        .context("storage configuration")?;
    EventStore::open(store_config)
        .await
        .context("opening the event store")
}

async fn run_server(opts: ServerOpts) -> anyhow::Result<()> {
    let config = load_config(opts.config.as_deref())?;
    info!(data_dir = %config.data_dir.display(), "starting spectre server");

    // Fatal-at-startup resources come first: data directory, graph, cluster
    // credentials.
    let store = open_store(&config).await?;
    let graph = build_graph(&config.graph).await?;
    let kube_client = kube::Client::try_default()
        .await
        .context("obtaining Kubernetes credentials")?;

    let registry = Arc::new(ExtractorRegistry::with_defaults());
    let processor = Arc::new(EventProcessor::new(
        graph.clone(),
        registry,
        ProcessorConfig {
            observation_window: config.reconcile_interval(),
            causality: CausalityConfig {
                window: config.causality_window(),
                min_confidence: config.causality_min_confidence,
            },
        },
    ));
    let pipeline = SyncPipeline::spawn(
        PipelineConfig {
            workers: config.worker_count(),
            ..PipelineConfig::default()
        },
        processor,
    );

    // Watcher → (bounded queue) → store → pipeline.
    let (event_tx, mut event_rx) = mpsc::channel(config.queue_capacity);

    let config_watcher = ConfigWatcher::start(&config.watch_config_path)
        .context("loading the watch configuration")?;
    let watcher = KubeWatcher::new(kube_client.clone(), event_tx.clone());
    let watcher_task = tokio::spawn(watcher.run(config_watcher.subscribe()));

    let reconciler = Reconciler::new(
        kube_client,
        graph.clone(),
        event_tx.clone(),
        ReconcilerConfig {
            interval: config.reconcile_interval(),
        },
    );
    let reconciler_task = tokio::spawn(reconciler.run(config_watcher.subscribe()));

    let sweeper = RetentionSweeper::new(store.config().clone());
    let sweeper_task = tokio::spawn(sweeper.run());

    // Stale edges (not re-observed for two windows) are pruned on the same
    // cadence as reconciliation.
    let pruner_task = {
        let graph = graph.clone();
        let interval = config.reconcile_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
                    - 2 * interval.as_nanos() as i64;
                match graph.prune_stale_edges(cutoff).await {
                    Ok(pruned) if pruned > 0 => info!(pruned, "pruned stale edges"),
                    Ok(_) => {}
                    Err(error) => warn!(%error, "stale edge pruning failed"),
                }
            }
        })
    };

    let analyzer = RootCauseAnalyzer::new(
        graph.clone(),
        store.clone(),
        RootCauseConfig::default(),
    );
    // The RPC/MCP transport is an external collaborator; it attaches to
    // this service and lives for the duration of the server.
    let _timeline_service = TimelineService::new(
        store.clone(),
        graph.clone(),
        analyzer,
        TimelineConfig::default(),
    );
    info!("timeline service ready");

    // Events are persisted first and then projected; a storage failure is
    // logged and the event still reaches the graph.
    let router_store = store.clone();
    let router_task = {
        let pipeline_ref = &pipeline;
        async move {
            while let Some(event) = event_rx.recv().await {
                if let Err(error) = router_store.write_event(&event).await {
                    warn!(%error, "failed to persist event, projecting anyway");
                }
                pipeline_ref.submit(event).await;
            }
        }
    };

    // Run until a shutdown signal; the router ends when the watcher side
    // drops its queue senders.
    tokio::select! {
        _ = router_task => {
            warn!("event queue closed unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    watcher_task.abort();
    reconciler_task.abort();
    sweeper_task.abort();
    pruner_task.abort();
    drop(event_tx);

    pipeline.shutdown().await;
    store.close().await.context("finalising the open hour file")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            warn!(%error, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

async fn run_export(opts: ExportOpts) -> anyhow::Result<()> {
    let store_config = StoreConfigBuilder::from_path(&opts.data_dir)
        .build()
        .context("storage configuration")?;
    let store = EventStore::open(store_config).await?;

    let start_ns = normalize_api_timestamp(opts.from);
    let end_ns = normalize_api_timestamp(opts.to);
    let events = store.export(start_ns, end_ns).await?;

    let mut out: Box<dyn Write> = if opts.output == "-" {
        Box::new(std::io::stdout().lock())
    } else {
        Box::new(std::fs::File::create(&opts.output).context("creating output file")?)
    };
    for event in &events {
        serde_json::to_writer(&mut out, event)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    info!(count = events.len(), "export complete");
    Ok(())
}

async fn run_import(opts: ImportOpts) -> anyhow::Result<()> {
    let store_config = StoreConfigBuilder::from_path(&opts.data_dir)
        .build()
        .context("storage configuration")?;
    let store = EventStore::open(store_config).await?;

    let file = std::fs::File::open(&opts.input)
        .with_context(|| format!("opening {}", opts.input.display()))?;
    let mut events = Vec::new();
    for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line)
            .with_context(|| format!("parsing line {}", line_no + 1))?;
        events.push(event);
    }

    let written = store.import(&events).await?;
    info!(
        read = events.len(),
        written, "import complete"
    );
    Ok(())
}

fn run_validate_config(opts: ValidateConfigOpts) -> anyhow::Result<()> {
    let config = load_config(opts.config.as_deref())?;
    println!("server configuration: ok");

    let watch_path = opts
        .watch_config
        .unwrap_or_else(|| config.watch_config_path.clone());
    let watch = WatchConfig::from_file(&watch_path)
        .with_context(|| format!("loading watch config from {}", watch_path.display()))?;
    println!(
        "watch configuration: ok ({} entries)",
        watch.watch.len()
    );
    for entry in &watch.watch {
        println!("  - {}", entry.gvr_key());
    }
    Ok(())
}
