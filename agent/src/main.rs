//! Host-resident network and systems monitoring agent.
//!
//! Wires the thirteen components together: loads `agent.properties` and the
//! per-family task JSON from `<base_dir>/local_data/conf/`, builds an
//! `AgentContext`, registers the configured output sinks, and runs every
//! enabled scheduler/ingress component until a shutdown signal arrives.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::error::Error as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod channel;
mod config;
mod config_watcher;
mod context;
mod domain_ingress;
mod event_loop;
mod ingress_http;
mod module_collectors;
mod module_scheduler;
mod net_endpoint;
mod probe_scheduler;
mod registry;
mod resource_monitor;
mod scrape_scheduler;
mod script_scheduler;
mod sliding_window;
mod tlv;

#[cfg(test)]
mod tests;

use config::{properties::AgentProperties, FileConfigSource};
use context::AgentContext;
use domain_ingress::{DomainIngress, ReceiveItem};
use ingress_http::IngressHttp;
use module_collectors::HostCollector;
use module_scheduler::ModuleScheduler;
use probe_scheduler::ProbeScheduler;
use scrape_scheduler::ScrapeScheduler;
use script_scheduler::ScriptScheduler;

/// Base directory plus the few override flags that make the agent testable
/// without editing `agent.properties` on disk.
#[derive(Parser, Debug)]
#[command(name = "agent")]
#[command(about = "Host-resident network and systems monitoring agent", long_about = None)]
struct CliArgs {
    /// Directory containing local_data/conf and local_data/logs
    #[arg(long = "base-dir", value_name = "DIR", default_value = ".")]
    base_dir: PathBuf,

    /// Override ConfigWatcher's poll interval, in milliseconds
    #[arg(long = "poll-interval-ms", value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Override the tracing EnvFilter directive (otherwise RUST_LOG, then
    /// "agent=info,shared=info")
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();

    let log_dir = config::log_dir(&cli.base_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "argusagent.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = cli
        .log_level
        .as_deref()
        .map(tracing_subscriber::EnvFilter::new)
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("agent=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    info!("starting agent");
    info!(base_dir = %cli.base_dir.display(), "base directory");

    if let Err(e) = run(cli).await {
        error!("FATAL ERROR: {}", e);
        let mut source = e.source();
        while let Some(err) = source {
            error!("  caused by: {}", err);
            source = err.source();
        }
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: CliArgs) -> Result<()> {
    let conf_dir = config::base_conf_dir(&cli.base_dir);
    let source = Arc::new(FileConfigSource::new(conf_dir));

    let properties = source
        .load_properties()
        .await
        .context("loading agent.properties")?;

    prune_old_logs(
        &config::log_dir(&cli.base_dir),
        properties.get_or::<u64>("agent.logger.file.size", 50 * 1024 * 1024),
        properties.get_or::<usize>("agent.logger.file.count", 10),
    )
    .await;

    let ctx = Arc::new(AgentContext::new(
        shared::defaults::RESOURCE_MONITOR_TOP_N,
        properties.get_or("agent.sink.queue.capacity", shared::defaults::SINK_QUEUE_CAPACITY),
        Duration::from_secs(shared::defaults::SINK_ERROR_SUPPRESS_SECS),
    ));
    ctx.channel.start();

    register_sinks(&ctx, &properties).await;
    load_initial_tasks(&source, &ctx).await?;

    let base_factor = Duration::from_millis(
        properties.get_or("agent.schedule.factor", shared::defaults::MODULE_SCHEDULE_FACTOR_MS),
    );
    let worker_pool_size = properties.get_or("agent.worker.pool.size", shared::defaults::DEFAULT_WORKER_POOL_SIZE);

    let mut handles = Vec::new();

    let watcher_poll = cli
        .poll_interval_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_secs(shared::defaults::CONFIG_WATCH_INTERVAL_SECS));
    let watcher = config_watcher::ConfigWatcher::new(source.clone(), ctx.registry.clone(), watcher_poll);
    let shutdown = ctx.shutdown_rx();
    handles.push(tokio::spawn(async move { watcher.run(shutdown).await }));

    if properties.get_bool("agent.enable.baseMetric.collect", true) {
        let scheduler = Arc::new(ModuleScheduler::new(
            ctx.registry.modules.subscribe(),
            ctx.channel.clone(),
            ctx.resource_monitor.clone(),
            Arc::new(HostCollector::new()),
            worker_pool_size,
            base_factor,
        ));
        let shutdown = ctx.shutdown_rx();
        handles.push(tokio::spawn(async move { scheduler.run(shutdown).await }));
    }

    if properties.get_bool("agent.enable.script.collect", true) {
        let scheduler = Arc::new(ScriptScheduler::new(
            ctx.registry.scripts.subscribe(),
            ctx.channel.clone(),
            properties.get_or("agent.max.proc.num", shared::defaults::SCRIPT_MAX_PROCS),
            properties.get_or("agent.max.output.len", shared::defaults::SCRIPT_MAX_OUTPUT_LEN),
        ));
        let shutdown = ctx.shutdown_rx();
        handles.push(tokio::spawn(async move { scheduler.run(base_factor, shutdown).await }));
    }

    if properties.get_bool("agent.enable.exporter.collect", true) {
        let scheduler = Arc::new(ScrapeScheduler::new(
            ctx.registry.scrapes.subscribe(),
            ctx.channel.clone(),
            worker_pool_size,
            base_factor,
        ));
        let shutdown = ctx.shutdown_rx();
        handles.push(tokio::spawn(async move { scheduler.run(shutdown).await }));
    }

    {
        // ProbeScheduler has no enable flag of its own in §6 — detection is
        // always on, same as the original's detect scheduler.
        let scheduler = Arc::new(ProbeScheduler::new(
            ctx.registry.probes.subscribe(),
            ctx.channel.clone(),
            properties.get_or("agent.probe.thread.num", shared::defaults::PROBE_THREAD_NUM),
            Duration::from_millis(shared::defaults::PROBE_SCHEDULE_UNIT_MS),
        ));
        let shutdown = ctx.shutdown_rx();
        handles.push(tokio::spawn(async move { scheduler.run(shutdown).await }));
    }

    if properties.get_bool("agent.enable.http.listen", true) {
        let host = properties
            .get("agent.http.metric.listen.ip")
            .unwrap_or(shared::defaults::HTTP_INGRESS_DEFAULT_IP)
            .to_string();
        let port = properties.get_or("agent.http.metric.listen.port", shared::defaults::HTTP_INGRESS_DEFAULT_PORT);
        let max_connections = properties.get_or(
            "agent.http.metric.max.connect.number",
            shared::defaults::HTTP_INGRESS_MAX_CONNECTIONS,
        );
        let outputs = source
            .read_artefact("httpReceiveTask.json")
            .await
            .ok()
            .and_then(|content| FileConfigSource::parse_http_receive_outputs(&content).ok())
            .unwrap_or_default();

        let ingress = Arc::new(IngressHttp::new(ctx.channel.clone(), max_connections, outputs));
        let shutdown = ctx.shutdown_rx();
        handles.push(tokio::spawn(async move {
            if let Err(e) = ingress.run(&host, port, shutdown).await {
                error!(error = %e, "HTTP ingress listener exited");
            }
        }));
    }

    if properties.get_bool("agent.enable.domainsocket.listen", true) {
        let receive_items = load_receive_items(&source).await;
        let ingress = Arc::new(DomainIngress::new(ctx.channel.clone(), receive_items));
        let shutdown = ctx.shutdown_rx();
        let base_dir = cli.base_dir.clone();
        handles.push(tokio::spawn(async move {
            #[cfg(unix)]
            let result = ingress
                .run(&config::domain_socket_path(&base_dir), shutdown)
                .await;
            #[cfg(not(unix))]
            let result = {
                let port: u16 = 15778;
                ingress.run(([127, 0, 0, 1], port).into(), shutdown).await
            };
            if let Err(e) = result {
                error!(error = %e, "domain ingress listener exited");
            }
        }));
    }

    shutdown_signal().await;
    info!("shutdown signal received, stopping components");
    ctx.request_shutdown();

    let shutdown_timeout = Duration::from_secs(shared::defaults::GRACEFUL_SHUTDOWN_SECS);
    let drain = futures_util::future::join_all(handles);
    if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
        warn!("graceful shutdown timed out, exiting anyway");
    }
    ctx.channel.end().await;

    info!("agent shutdown complete");
    Ok(())
}

async fn register_sinks(ctx: &AgentContext, properties: &AgentProperties) {
    let timeout = Duration::from_secs(10);
    let sinks: &[(&str, &str, &str)] = &[
        ("agent.enable.local.channel", "local", "log-aggregator"),
        ("agent.enable.localfile.channel", "localfile", "local-file"),
        ("agent.enable.sls.channel", "sls", "remote-http"),
        ("agent.enable.shennong.channel", "shennong", "remote-http"),
        ("agent.enable.loki.channel", "loki", "remote-http"),
        ("agent.enable.alimonitor.channel", "alimonitor", "remote-http"),
    ];

    for (flag, name, kind) in sinks {
        if !properties.get_bool(flag, false) {
            continue;
        }
        let target_key = format!("agent.{name}.target");
        let Some(target) = properties.get(&target_key) else {
            warn!(sink = %name, key = %target_key, "sink enabled but target not configured, skipping");
            continue;
        };
        match channel::sinks::build_sink(kind, target, timeout) {
            Ok(writer) => {
                if let Err(e) = ctx
                    .channel
                    .register(*name, writer, channel::OverflowPolicy::EvictOldest)
                    .await
                {
                    warn!(sink = %name, error = %e, "failed to register sink");
                }
            }
            Err(e) => warn!(sink = %name, error = %e, "failed to build sink"),
        }
    }
}

async fn load_initial_tasks(source: &FileConfigSource, ctx: &AgentContext) -> Result<()> {
    for file_name in config::family_artefacts(config::Family::Module) {
        if let Ok(content) = source.read_artefact(file_name).await {
            match FileConfigSource::parse_module_tasks(&content) {
                Ok(tasks) => {
                    let mut current = (*ctx.registry.modules.current()).clone();
                    current.tasks.extend(tasks);
                    ctx.registry.modules.swap(current);
                }
                Err(e) => warn!(file = %file_name, error = %e, "skipping malformed module task file"),
            }
        }
    }
    for file_name in config::family_artefacts(config::Family::Script) {
        if let Ok(content) = source.read_artefact(file_name).await {
            if let Ok(tasks) = FileConfigSource::parse_script_tasks(&content) {
                ctx.registry
                    .scripts
                    .swap(shared::config::TasksSnapshot::new(tasks, String::new()));
            }
        }
    }
    for file_name in config::family_artefacts(config::Family::Scrape) {
        if let Ok(content) = source.read_artefact(file_name).await {
            if let Ok(tasks) = FileConfigSource::parse_scrape_tasks(&content) {
                ctx.registry
                    .scrapes
                    .swap(shared::config::TasksSnapshot::new(tasks, String::new()));
            }
        }
    }
    for file_name in config::family_artefacts(config::Family::Probe) {
        if let Ok(content) = source.read_artefact(file_name).await {
            match FileConfigSource::parse_probe_tasks(&content) {
                Ok(tasks) => {
                    let mut current = (*ctx.registry.probes.current()).clone();
                    current.tasks.extend(tasks);
                    ctx.registry.probes.swap(current);
                }
                Err(e) => warn!(file = %file_name, error = %e, "skipping malformed probe task file"),
            }
        }
    }
    Ok(())
}

async fn load_receive_items(source: &FileConfigSource) -> std::collections::HashMap<u16, ReceiveItem> {
    let mut items = std::collections::HashMap::new();
    if let Ok(content) = source.read_artefact("receiveTask.json").await {
        match FileConfigSource::parse_receive_tasks(&content) {
            Ok(records) => {
                for record in records {
                    items.insert(
                        record.packet_type,
                        ReceiveItem {
                            name: record.name,
                            outputs: record.outputs,
                        },
                    );
                }
            }
            Err(e) => warn!(error = %e, "skipping malformed receiveTask.json"),
        }
    }
    items
}

/// Deletes rotated log files beyond `max_count`, oldest first, and any file
/// over `max_size_bytes`. `tracing-appender`'s daily rolling writer has no
/// size/count cap of its own, so this runs once at startup to bound disk use
/// the way the source's size-rotated logger does continuously.
async fn prune_old_logs(log_dir: &std::path::Path, max_size_bytes: u64, max_count: usize) {
    let Ok(mut entries) = tokio::fs::read_dir(log_dir).await else {
        return;
    };
    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(metadata) = entry.metadata().await {
            if metadata.is_file() {
                files.push((entry.path(), metadata.modified().ok(), metadata.len()));
            }
        }
    }
    files.sort_by_key(|(_, modified, _)| *modified);

    while files.len() > max_count {
        let (path, _, _) = files.remove(0);
        let _ = tokio::fs::remove_file(&path).await;
    }
    for (path, _, size) in &files {
        if *size > max_size_bytes {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}
