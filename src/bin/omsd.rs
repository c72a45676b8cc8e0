//! `omsd` — one peer instance of the filesystem-coordinated job scheduler
//! (SPEC_FULL.md §3 "process entrypoint").
//!
//! Wires together the five scan loops named in spec §5 (main scanner,
//! queue-pick, orphan reconciler, server lifecycle, disk-use monitor) plus
//! the HTTP submission surface, against one shared job-control root.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use oms::config::{AppConfig, Cli};
use oms::http::{build_router, AppState, AppStateInner};
use oms_core::catalog::{ResourceTotals, RunCatalog};
use oms_core::compute::{ComputeConfig, ComputeRegistry, ServerState};
use oms_core::diskuse::{self, DiskConfig, DiskUseWriter};
use oms_core::error::{SchedError, SchedResult};
use oms_core::heartbeat::{scan_active_instances, HeartbeatWriter, BUMP_EVERY_N_CYCLES};
use oms_core::job::{ResourceDemand, RunJob};
use oms_core::paths::{
    ActiveName, HistoryName, InstancePauseName, QueueName, ACTIVE_DIR, GLOBAL_PAUSE_NAME,
    HISTORY_DIR, QUEUE_DIR, STATE_DIR,
};
use oms_core::planner::{self, QueueCandidate};
use oms_core::stamp::Stamp;
use oms_core::supervisor::{self, LaunchContext};

async fn load_queue_candidates(job_control_root: &std::path::Path) -> SchedResult<Vec<QueueCandidate>> {
    let dir = job_control_root.join(QUEUE_DIR);
    let mut out = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(SchedError::io(dir.display().to_string(), e)),
    };
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| SchedError::io(dir.display().to_string(), e))?
    {
        let file_name = entry.file_name();
        let Some(name_str) = file_name.to_str() else { continue };
        let Ok(queue_name) = QueueName::decode(name_str) else { continue };
        let path = dir.join(name_str);
        let Ok(content) = tokio::fs::read(&path).await else { continue };
        match serde_json::from_slice::<RunJob>(&content) {
            Ok(job) => out.push(QueueCandidate { queue_name, job }),
            Err(e) => {
                warn!(file = %name_str, error = %e, "malformed queue job body; moving to history as error");
                let history_name = HistoryName {
                    sub_stamp: queue_name.sub_stamp.clone(),
                    instance: queue_name.instance.clone(),
                    model: queue_name.model.clone(),
                    digest: queue_name.digest.clone(),
                    run_stamp: queue_name.sub_stamp.clone(),
                    status: "error".to_string(),
                };
                let history_path = job_control_root.join(HISTORY_DIR).join(history_name.encode());
                let _ = tokio::fs::rename(&path, &history_path).await;
            }
        }
    }
    Ok(out)
}

async fn load_active_names(job_control_root: &std::path::Path) -> SchedResult<Vec<ActiveName>> {
    let dir = job_control_root.join(ACTIVE_DIR);
    let mut out = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(SchedError::io(dir.display().to_string(), e)),
    };
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| SchedError::io(dir.display().to_string(), e))?
    {
        let file_name = entry.file_name();
        if let Some(name_str) = file_name.to_str() {
            if let Ok(name) = ActiveName::decode(name_str) {
                out.push(name);
            }
        }
    }
    Ok(out)
}

async fn load_history_stamps(job_control_root: &std::path::Path) -> SchedResult<HashSet<Stamp>> {
    let dir = job_control_root.join(HISTORY_DIR);
    let mut out = HashSet::new();
    let mut read_dir = match tokio::fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(SchedError::io(dir.display().to_string(), e)),
    };
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| SchedError::io(dir.display().to_string(), e))?
    {
        let file_name = entry.file_name();
        if let Some(name_str) = file_name.to_str() {
            if let Ok(name) = HistoryName::decode(name_str) {
                out.insert(name.sub_stamp);
            }
        }
    }
    Ok(out)
}

async fn load_pause_state(job_control_root: &std::path::Path) -> SchedResult<(bool, HashSet<String>)> {
    let dir = job_control_root.join(STATE_DIR);
    let global_paused = tokio::fs::metadata(dir.join(GLOBAL_PAUSE_NAME)).await.is_ok();
    let mut paused = HashSet::new();
    let mut read_dir = match tokio::fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((global_paused, paused)),
        Err(e) => return Err(SchedError::io(dir.display().to_string(), e)),
    };
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| SchedError::io(dir.display().to_string(), e))?
    {
        let file_name = entry.file_name();
        if let Some(name_str) = file_name.to_str() {
            if let Ok(p) = InstancePauseName::decode(name_str) {
                paused.insert(p.instance);
            }
        }
    }
    Ok((global_paused, paused))
}

/// Sub-loop A (spec §4.5): the fast runnable-pick cycle. One planner pass
/// per tick; an admitted dispatch for this instance is handed to the
/// supervisor as a background task so multiple admitted jobs can run
/// concurrently. `in_flight` guards against re-selecting the same queue
/// entry before its own task has renamed it out of `queue/`.
#[allow(clippy::too_many_arguments)]
async fn runnable_pick_loop(
    job_control_root: PathBuf,
    self_instance: String,
    user_files_dir: PathBuf,
    compute: Arc<ComputeRegistry>,
    catalog: Arc<RunCatalog>,
    local_limit: ResourceDemand,
    in_flight: Arc<tokio::sync::Mutex<HashSet<Stamp>>>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;

        let active_instances = match scan_active_instances(&job_control_root).await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "scan_active_instances failed");
                continue;
            }
        };
        let items = match compute.observe(&job_control_root, &self_instance, &active_instances).await {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "compute.observe failed");
                continue;
            }
        };
        let candidates = match load_queue_candidates(&job_control_root).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "load_queue_candidates failed");
                continue;
            }
        };
        let active = match load_active_names(&job_control_root).await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "load_active_names failed");
                continue;
            }
        };
        let history_stamps = match load_history_stamps(&job_control_root).await {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "load_history_stamps failed");
                continue;
            }
        };
        let (global_paused, paused_instances) = match load_pause_state(&job_control_root).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "load_pause_state failed");
                continue;
            }
        };

        let output = planner::plan(
            &self_instance,
            &candidates,
            &active,
            &history_stamps,
            &items,
            local_limit,
            global_paused,
            &paused_instances,
            compute.config().mpi_max_threads,
        );

        let queue_total = output.entries.iter().fold(ResourceDemand::default(), |acc, e| acc + e.demand);
        let queue_own = output
            .entries
            .iter()
            .filter(|e| e.instance == self_instance)
            .fold(ResourceDemand::default(), |acc, e| acc + e.demand);
        let active_total = active
            .iter()
            .fold(ResourceDemand::default(), |acc, a| acc + ResourceDemand { cpu: a.cpu, mem: a.mem });
        let active_own = active
            .iter()
            .filter(|a| a.instance == self_instance)
            .fold(ResourceDemand::default(), |acc, a| acc + ResourceDemand { cpu: a.cpu, mem: a.mem });
        catalog
            .set_totals(ResourceTotals {
                queue_total,
                queue_own,
                active_total,
                active_own,
            })
            .await;

        let Some(dispatch) = output.dispatch else { continue };
        let sub_stamp = dispatch.queue_name.sub_stamp.clone();
        {
            let mut guard = in_flight.lock().await;
            if guard.contains(&sub_stamp) {
                continue;
            }
            guard.insert(sub_stamp.clone());
        }

        let job_control_root = job_control_root.clone();
        let self_instance = self_instance.clone();
        let user_files_dir = user_files_dir.clone();
        let compute = compute.clone();
        let catalog = catalog.clone();
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            let ctx = LaunchContext {
                job_control_root: &job_control_root,
                self_instance: &self_instance,
                user_files_dir: &user_files_dir,
                compute: &compute,
                catalog: &catalog,
            };
            if let Err(e) = supervisor::dispatch_and_run(&ctx, dispatch).await {
                warn!(error = %e, "dispatch_and_run failed");
            }
            in_flight.lock().await.remove(&sub_stamp);
        });
    }
}

/// Sub-loop B (spec §4.5): orphan reconciliation, ~5s.
async fn orphan_loop(job_control_root: PathBuf, self_instance: String, catalog: Arc<RunCatalog>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        if let Err(e) = supervisor::reconcile_orphans(&job_control_root, &self_instance, &catalog).await {
            warn!(error = %e, "reconcile_orphans failed");
        }
    }
}

/// Sub-loop C (spec §4.5): server lifecycle, at least twice the main scan
/// interval. A server is "needed" when at least one queued job is MPI —
/// a deliberate simplification over hypothetically re-packing against
/// not-yet-ready servers, recorded in DESIGN.md.
async fn server_lifecycle_loop(job_control_root: PathBuf, self_instance: String, compute: Arc<ComputeRegistry>, scan_interval_ms: u64) {
    let period = Duration::from_secs(3).max(Duration::from_millis(scan_interval_ms) * 2);
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let active_instances = match scan_active_instances(&job_control_root).await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "scan_active_instances failed");
                continue;
            }
        };
        let items = match compute.observe(&job_control_root, &self_instance, &active_instances).await {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "compute.observe failed");
                continue;
            }
        };
        let candidates = match load_queue_candidates(&job_control_root).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "load_queue_candidates failed");
                continue;
            }
        };
        let mpi_pending = candidates.iter().any(|c| c.job.is_mpi);
        let needed: HashSet<String> = if mpi_pending {
            items
                .iter()
                .filter(|(_, item)| item.state == ServerState::Empty)
                .map(|(name, _)| name.clone())
                .collect()
        } else {
            HashSet::new()
        };
        if let Err(e) = supervisor::server_lifecycle_cycle(&job_control_root, &compute, &items, &needed).await {
            warn!(error = %e, "server_lifecycle_cycle failed");
        }
    }
}

/// Disk-use monitor (spec §4.6).
async fn disk_loop(
    job_control_root: PathBuf,
    self_instance: String,
    config: DiskConfig,
    writer: DiskUseWriter,
    roots: Vec<PathBuf>,
    catalog: Arc<RunCatalog>,
) {
    let mut ticker = tokio::time::interval(config.scan_interval);
    loop {
        ticker.tick().await;
        match diskuse::run_cycle(&job_control_root, &self_instance, &config, &writer, &roots).await {
            Ok(snapshot) => catalog.set_disk_use(snapshot).await,
            Err(e) => warn!(error = %e, "disk-use run_cycle failed"),
        }
    }
}

/// Heartbeat bump ticker (spec §4.2); `HeartbeatWriter::start` is called
/// once in `main` before this loop is spawned.
async fn heartbeat_loop(writer: Arc<HeartbeatWriter>, scan_interval_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(scan_interval_ms));
    let mut cycle: u32 = 0;
    loop {
        ticker.tick().await;
        cycle = cycle.wrapping_add(1);
        if cycle % BUMP_EVERY_N_CYCLES == 0 {
            if let Err(e) = writer.bump().await {
                warn!(error = %e, "heartbeat bump failed");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config: AppConfig = cli.into();

    println!("omsd starting: instance={} listen={}", config.instance_name, config.http_addr);

    for dir in [QUEUE_DIR, ACTIVE_DIR, HISTORY_DIR, STATE_DIR] {
        tokio::fs::create_dir_all(config.job_control_dir.join(dir)).await?;
    }

    let compute_config = ComputeConfig::load_from_file(&config.compute_ini)?;
    let local_limit = compute_config.local;
    let compute = Arc::new(ComputeRegistry::new(compute_config));

    let disk_config = DiskConfig::load_from_file(&config.disk_ini)?;
    let disk_writer = DiskUseWriter::new(&config.job_control_dir, &config.instance_name);

    let catalog = Arc::new(RunCatalog::new());

    let heartbeat_writer = Arc::new(HeartbeatWriter::new(&config.job_control_dir, &config.instance_name));
    heartbeat_writer.start().await?;

    let in_flight = Arc::new(tokio::sync::Mutex::new(HashSet::new()));

    tokio::spawn(heartbeat_loop(heartbeat_writer.clone(), config.scan_interval_ms));
    tokio::spawn(runnable_pick_loop(
        config.job_control_dir.clone(),
        config.instance_name.clone(),
        config.user_files_dir.clone(),
        compute.clone(),
        catalog.clone(),
        local_limit,
        in_flight,
    ));
    tokio::spawn(orphan_loop(config.job_control_dir.clone(), config.instance_name.clone(), catalog.clone()));
    tokio::spawn(server_lifecycle_loop(
        config.job_control_dir.clone(),
        config.instance_name.clone(),
        compute.clone(),
        config.scan_interval_ms,
    ));
    tokio::spawn(disk_loop(
        config.job_control_dir.clone(),
        config.instance_name.clone(),
        disk_config,
        disk_writer,
        vec![config.user_files_dir.clone()],
        catalog.clone(),
    ));

    let state = AppState {
        inner: Arc::new(AppStateInner {
            job_control_root: config.job_control_dir.clone(),
            self_instance: config.instance_name.clone(),
            catalog: catalog.clone(),
        }),
    };
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, instance = %config.instance_name, "listening");

    tokio::select! {
        res = axum::serve(listener, router) => { res?; }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    heartbeat_writer.shutdown().await;
    Ok(())
}
