//! Process supervisor (spec §4.5): the three sub-loops that turn a planner
//! dispatch decision into a running child process, reconcile orphaned
//! active files left by a crash, and drive compute-server lifecycle.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::catalog::{RunCatalog, RunState};
use crate::compute::{compute_used_path, ComputeItem, ComputeRegistry, ServerState};
use crate::error::{SchedError, SchedResult};
use crate::job::{ResourceDemand, RunJob};
use crate::launch::{build_direct_launch, build_templated_launch, render_hostfile};
use crate::paths::{
    ActiveName, CompErrorName, CompReadyName, CompStartName, CompStopName, HistoryName, QueueName,
    ACTIVE_DIR, HISTORY_DIR, QUEUE_DIR, STATE_DIR,
};
use crate::planner::Dispatch;
use crate::stamp::Stamp;

/// Default template for the MPI launch strategy when a job doesn't name its
/// own (`RunJob::template_name`); renders one argv token per line (spec §4.5
/// step 2 "the first non-blank line ... is the executable, the rest are the
/// arguments").
pub const DEFAULT_MPI_TEMPLATE: &str =
    "mpirun\n-np\n{{mpi_np}}\n--hostfile\n{{host_file}}\n{{dir}}/{{exe_stem}}\n{{#each args}}{{this}}\n{{/each}}";

pub struct LaunchContext<'a> {
    pub job_control_root: &'a Path,
    pub self_instance: &'a str,
    pub user_files_dir: &'a Path,
    pub compute: &'a ComputeRegistry,
    pub catalog: &'a RunCatalog,
}

async fn write_empty(path: &Path) -> SchedResult<()> {
    tokio::fs::write(path, b"").await.map_err(|e| SchedError::io(path.display().to_string(), e))
}

async fn write_history(
    job_control_root: &Path,
    instance: &str,
    model: &str,
    digest: &str,
    sub_stamp: &Stamp,
    run_stamp: &Stamp,
    status: &str,
    body: &[u8],
) -> SchedResult<()> {
    let name = HistoryName {
        sub_stamp: sub_stamp.clone(),
        instance: instance.to_string(),
        model: model.to_string(),
        digest: digest.to_string(),
        run_stamp: run_stamp.clone(),
        status: status.to_string(),
    };
    let path = job_control_root.join(HISTORY_DIR).join(name.encode());
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| SchedError::io(path.display().to_string(), e))
}

async fn move_queue_to_history_error(
    job_control_root: &Path,
    queue_name: &QueueName,
    job: &RunJob,
    run_stamp: &Stamp,
) -> SchedResult<()> {
    let body = serde_json::to_vec_pretty(job).map_err(|e| SchedError::MalformedJob(e.to_string()))?;
    write_history(
        job_control_root,
        &queue_name.instance,
        &queue_name.model,
        &queue_name.digest,
        &queue_name.sub_stamp,
        run_stamp,
        "error",
        &body,
    )
    .await?;
    let queue_path = job_control_root.join(QUEUE_DIR).join(queue_name.encode());
    let _ = tokio::fs::remove_file(&queue_path).await;
    Ok(())
}

async fn move_active_to_history(job_control_root: &Path, active_name: &ActiveName, job: &RunJob, status: &str) -> SchedResult<()> {
    let run_stamp = job.effective_run_stamp();
    let body = serde_json::to_vec_pretty(job).map_err(|e| SchedError::MalformedJob(e.to_string()))?;
    write_history(
        job_control_root,
        &active_name.instance,
        &active_name.model,
        &active_name.digest,
        &active_name.sub_stamp,
        &run_stamp,
        status,
        &body,
    )
    .await?;
    let active_path = job_control_root.join(ACTIVE_DIR).join(active_name.encode());
    let _ = tokio::fs::remove_file(&active_path).await;
    Ok(())
}

async fn drain_stream<R: tokio::io::AsyncRead + Unpin>(stream: R, log: Arc<AsyncMutex<tokio::fs::File>>) {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut file = log.lock().await;
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "error draining child output stream");
                break;
            }
        }
    }
}

/// Sub-loop A (spec §4.5): construct the launch for the planner's dispatch
/// decision, start the child process, stream its output, wait for exit or
/// cancellation, and move the job file queue → active → history.
pub async fn dispatch_and_run(ctx: &LaunchContext<'_>, dispatch: Dispatch) -> SchedResult<()> {
    let LaunchContext {
        job_control_root,
        self_instance,
        user_files_dir,
        compute,
        catalog,
    } = ctx;

    let mut job = dispatch.job.clone();
    let run_stamp = Stamp::now();
    job.run_stamp = Some(run_stamp.clone());

    let plan = if job.is_mpi {
        let allocation = dispatch.allocation.clone().ok_or_else(|| {
            let demand = job.demand();
            SchedError::DoesNotFit {
                cpu: demand.cpu,
                mem: demand.mem,
            }
        })?;
        let hostfile_cfg = compute.hostfile();
        let rendered = render_hostfile(
            hostfile_cfg.and_then(|h| h.root_line.as_deref()),
            hostfile_cfg.and_then(|h| h.host_line.as_deref()),
            &allocation.allocations,
        );
        let host_dir = hostfile_cfg
            .and_then(|h| h.host_file_dir.clone())
            .unwrap_or_else(|| job.working_dir.clone());
        let hostfile_path = PathBuf::from(host_dir).join(format!("{run_stamp}.hostfile"));
        tokio::fs::write(&hostfile_path, rendered)
            .await
            .map_err(|e| SchedError::io(hostfile_path.display().to_string(), e))?;

        let mpi_np: u32 = allocation.allocations.iter().map(|a| a.processes).sum();
        let template = job.template_name.as_deref().unwrap_or(DEFAULT_MPI_TEMPLATE);
        build_templated_launch(template, &job, &run_stamp, user_files_dir, mpi_np, &hostfile_path, "", "")?
    } else {
        build_direct_launch(&job, &run_stamp, user_files_dir)?
    };

    if let Some((path, content)) = &plan.ini_file {
        tokio::fs::write(path, content)
            .await
            .map_err(|e| SchedError::io(path.display().to_string(), e))?;
    }

    if let Some(allocation) = &dispatch.allocation {
        for alloc in &allocation.allocations {
            let demand = ResourceDemand {
                cpu: alloc.cpu,
                mem: alloc.mem,
            };
            let path = compute_used_path(job_control_root, &alloc.server, &job.sub_stamp, self_instance, demand);
            write_empty(&path).await?;
        }
    }

    let log_path = Path::new(&job.working_dir).join(format!("{run_stamp}.log"));

    let mut command = Command::new(&plan.command_path);
    command.args(&plan.args).envs(&job.env).stdout(Stdio::piped()).stderr(Stdio::piped());
    if Path::new(&job.working_dir).is_dir() {
        command.current_dir(&job.working_dir);
    }

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, sub_stamp = %job.sub_stamp, "failed to start child process");
            move_queue_to_history_error(job_control_root, &dispatch.queue_name, &job, &run_stamp).await?;
            return Ok(());
        }
    };

    let pid = child.id().unwrap_or(0);
    job.pid = Some(pid);
    job.command_path = Some(plan.command_path.clone());
    job.log_file_name = Some(log_path.display().to_string());

    let active_name = ActiveName::from_queue(dispatch.queue_name.clone(), pid);
    let active_path = job_control_root.join(ACTIVE_DIR).join(active_name.encode());
    let queue_path = job_control_root.join(QUEUE_DIR).join(dispatch.queue_name.encode());
    let body = serde_json::to_vec_pretty(&job).map_err(|e| SchedError::MalformedJob(e.to_string()))?;
    tokio::fs::write(&active_path, &body)
        .await
        .map_err(|e| SchedError::io(active_path.display().to_string(), e))?;
    let _ = tokio::fs::remove_file(&queue_path).await;

    info!(sub_stamp = %job.sub_stamp, run_stamp = %run_stamp, pid, "job moved queue -> active");

    let (kill_tx, kill_rx) = oneshot::channel();
    catalog
        .record_started(RunState {
            model_name: job.model_name.clone(),
            model_digest: job.model_digest.clone(),
            sub_stamp: job.sub_stamp.clone(),
            run_stamp: run_stamp.clone(),
            run_name: job.run_name.clone(),
            task_name: job.model_name.clone(),
            is_final: false,
            updated_at: Utc::now(),
            log_path: Some(log_path.clone()),
            pid: Some(pid),
            command_path: job.command_path.clone(),
            kill: Some(kill_tx),
        })
        .await;

    let log_file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .map_err(|e| SchedError::io(log_path.display().to_string(), e))?;
    let log_file = Arc::new(AsyncMutex::new(log_file));

    let mut drains = Vec::new();
    if let Some(out) = child.stdout.take() {
        drains.push(tokio::spawn(drain_stream(out, log_file.clone())));
    }
    if let Some(err) = child.stderr.take() {
        drains.push(tokio::spawn(drain_stream(err, log_file.clone())));
    }

    let mut kill_rx = kill_rx;
    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| SchedError::io(plan.command_path.clone(), e))?,
        _ = &mut kill_rx => {
            let _ = child.start_kill();
            child.wait().await.map_err(|e| SchedError::io(plan.command_path.clone(), e))?
        }
    };

    for handle in drains {
        let _ = handle.await;
    }

    let status_str = if status.success() { "success" } else { "error" };
    move_active_to_history(job_control_root, &active_name, &job, status_str).await?;

    if let Some(allocation) = &dispatch.allocation {
        for alloc in &allocation.allocations {
            let demand = ResourceDemand {
                cpu: alloc.cpu,
                mem: alloc.mem,
            };
            let path = compute_used_path(job_control_root, &alloc.server, &job.sub_stamp, self_instance, demand);
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    catalog.mark_final(&job.model_name, &run_stamp).await;
    info!(sub_stamp = %job.sub_stamp, run_stamp = %run_stamp, status = status_str, "job moved active -> history");
    Ok(())
}

async fn pid_dir_exists(pid: u32) -> bool {
    tokio::fs::metadata(format!("/proc/{pid}")).await.is_ok()
}

async fn pid_matches_command(pid: u32, command_path: &str) -> bool {
    match tokio::fs::read_link(format!("/proc/{pid}/exe")).await {
        Ok(target) => target.file_name() == Path::new(command_path).file_name(),
        Err(_) => false,
    }
}

/// Sub-loop B (spec §4.5): reconcile active files belonging to this
/// instance that have no live in-memory [`RunState`] — typically left by a
/// crash of a previous process for this same instance name.
pub async fn reconcile_orphans(job_control_root: impl AsRef<Path>, self_instance: &str, catalog: &RunCatalog) -> SchedResult<()> {
    let active_dir = job_control_root.as_ref().join(ACTIVE_DIR);
    let mut read_dir = match tokio::fs::read_dir(&active_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SchedError::io(active_dir.display().to_string(), e)),
    };

    let live = catalog.snapshot_all().await;

    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| SchedError::io(active_dir.display().to_string(), e))?
    {
        let file_name = entry.file_name();
        let Some(name_str) = file_name.to_str() else {
            continue;
        };
        let Ok(active) = ActiveName::decode(name_str) else {
            continue;
        };
        if active.instance != self_instance {
            continue;
        }
        if live.iter().any(|r| r.pid == Some(active.pid) && r.sub_stamp == active.sub_stamp) {
            continue;
        }

        let path = active_dir.join(name_str);
        let content = tokio::fs::read(&path).await.map_err(|e| SchedError::io(path.display().to_string(), e))?;
        let job: Result<RunJob, _> = serde_json::from_slice(&content);

        if pid_dir_exists(active.pid).await {
            if let Ok(job) = &job {
                if let Some(command_path) = &job.command_path {
                    if pid_matches_command(active.pid, command_path).await {
                        // Another instance restart racing on the same pid; leave it alone.
                        continue;
                    }
                }
            }
        }

        match job {
            Ok(job) => {
                warn!(sub_stamp = %active.sub_stamp, pid = active.pid, "orphan active file reconciled as error");
                move_active_to_history(job_control_root.as_ref(), &active, &job, "error").await?;
            }
            Err(_) => {
                let run_stamp = active.run_stamp.clone().unwrap_or_else(|| active.sub_stamp.clone());
                let name = HistoryName {
                    sub_stamp: active.sub_stamp.clone(),
                    instance: active.instance.clone(),
                    model: active.model.clone(),
                    digest: active.digest.clone(),
                    run_stamp,
                    status: "no-run-time-stamp".to_string(),
                };
                let history_path = job_control_root.as_ref().join(HISTORY_DIR).join(name.encode());
                tokio::fs::rename(&path, &history_path)
                    .await
                    .map_err(|e| SchedError::io(history_path.display().to_string(), e))?;
            }
        }
    }
    Ok(())
}

fn is_idle_past(last_used: &Option<Stamp>, idle_timeout: Duration) -> bool {
    let Some(last) = last_used else { return true };
    let Ok(millis) = last.unix_millis() else { return false };
    Utc::now().timestamp_millis() - millis >= idle_timeout.as_millis() as i64
}

async fn start_server(state_dir: &Path, name: &str, item: &ComputeItem, timeout: Option<Duration>) -> SchedResult<()> {
    let start_path = state_dir.join(
        CompStartName {
            server: name.to_string(),
            timestamp: Stamp::now(),
        }
        .encode(),
    );
    write_empty(&start_path).await?;

    let success = if item.start_exe.is_empty() {
        true
    } else {
        let mut cmd = Command::new(&item.start_exe);
        cmd.args(&item.start_args);
        let run = cmd.status();
        match timeout {
            Some(d) => matches!(tokio::time::timeout(d, run).await, Ok(Ok(status)) if status.success()),
            None => matches!(run.await, Ok(status) if status.success()),
        }
    };

    if success {
        let ready_path = state_dir.join(CompReadyName { server: name.to_string() }.encode());
        write_empty(&ready_path).await?;
        let _ = tokio::fs::remove_file(&start_path).await;
        info!(server = %name, "compute server reached ready");
    } else {
        let err_path = state_dir.join(
            CompErrorName {
                server: name.to_string(),
                timestamp: Stamp::now(),
            }
            .encode(),
        );
        write_empty(&err_path).await?;
        warn!(server = %name, "compute server failed to start");
    }
    Ok(())
}

async fn stop_server(state_dir: &Path, name: &str, item: &ComputeItem, timeout: Option<Duration>) -> SchedResult<()> {
    let stop_path = state_dir.join(
        CompStopName {
            server: name.to_string(),
            timestamp: Stamp::now(),
        }
        .encode(),
    );
    write_empty(&stop_path).await?;

    let success = if item.stop_exe.is_empty() {
        true
    } else {
        let mut cmd = Command::new(&item.stop_exe);
        cmd.args(&item.stop_args);
        let run = cmd.status();
        match timeout {
            Some(d) => matches!(tokio::time::timeout(d, run).await, Ok(Ok(status)) if status.success()),
            None => matches!(run.await, Ok(status) if status.success()),
        }
    };

    if success {
        let ready_path = state_dir.join(CompReadyName { server: name.to_string() }.encode());
        let _ = tokio::fs::remove_file(&ready_path).await;
        let _ = tokio::fs::remove_file(&stop_path).await;
        info!(server = %name, "compute server stopped");
    } else {
        let err_path = state_dir.join(
            CompErrorName {
                server: name.to_string(),
                timestamp: Stamp::now(),
            }
            .encode(),
        );
        write_empty(&err_path).await?;
        warn!(server = %name, "compute server failed to stop");
    }
    Ok(())
}

/// Sub-loop C (spec §4.5): start servers the next admissible job needs,
/// stop `ready` servers idle past `IdleTimeout`.
pub async fn server_lifecycle_cycle(
    job_control_root: impl AsRef<Path>,
    compute: &ComputeRegistry,
    items: &HashMap<String, ComputeItem>,
    needed: &HashSet<String>,
) -> SchedResult<()> {
    let state_dir = job_control_root.as_ref().join(STATE_DIR);
    for (name, item) in items {
        match item.state {
            ServerState::Empty if needed.contains(name) => {
                start_server(&state_dir, name, item, compute.config().start_timeout).await?;
            }
            ServerState::Ready => {
                if let Some(idle_timeout) = compute.config().idle_timeout {
                    if is_idle_past(&item.last_used, idle_timeout) {
                        stop_server(&state_dir, name, item, compute.config().stop_timeout).await?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::ComputeConfig;
    use crate::paths::QUEUE_DIR;
    use std::collections::HashMap as StdHashMap;

    fn base_job(working_dir: &str, model_name: &str) -> RunJob {
        RunJob {
            sub_stamp: Stamp::parse("2022_08_17_10_00_00_000").unwrap(),
            run_stamp: None,
            instance: "_4040".to_string(),
            model_name: model_name.to_string(),
            model_digest: "D".to_string(),
            run_name: "run".to_string(),
            working_dir: working_dir.to_string(),
            options: StdHashMap::new(),
            env: StdHashMap::new(),
            table_retention: Vec::new(),
            run_notes: StdHashMap::new(),
            microdata: Vec::new(),
            template_name: None,
            is_mpi: false,
            process_count: 1,
            threads_per_process: 1,
            mem_per_process: 0,
            mem_per_thread: 0,
            not_on_mpi_root: false,
            no_job_control_hostfile: false,
            position: RunJob::DEFAULT_POSITION,
            pid: None,
            command_path: None,
            log_file_name: None,
        }
    }

    async fn setup_dirs(root: &Path) {
        for dir in [QUEUE_DIR, ACTIVE_DIR, HISTORY_DIR, STATE_DIR] {
            tokio::fs::create_dir_all(root.join(dir)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn local_run_success_moves_queue_to_history() {
        let tmp = tempfile::tempdir().unwrap();
        setup_dirs(tmp.path()).await;
        let job = base_job("/bin", "true");
        let queue_name = QueueName {
            sub_stamp: job.sub_stamp.clone(),
            instance: job.instance.clone(),
            model: job.model_name.clone(),
            digest: job.model_digest.clone(),
            run_stamp: None,
            cpu: 1,
            mem: 0,
            position: job.position,
        };
        tokio::fs::write(tmp.path().join(QUEUE_DIR).join(queue_name.encode()), serde_json::to_vec(&job).unwrap())
            .await
            .unwrap();

        let compute = ComputeRegistry::new(ComputeConfig {
            local: ResourceDemand { cpu: 4, mem: 0 },
            idle_timeout: None,
            start_timeout: None,
            stop_timeout: None,
            mpi_max_threads: 0,
            max_errors: 3,
            servers: vec![],
            hostfile: None,
        });
        let catalog = RunCatalog::new();
        let ctx = LaunchContext {
            job_control_root: tmp.path(),
            self_instance: "_4040",
            user_files_dir: tmp.path(),
            compute: &compute,
            catalog: &catalog,
        };
        let dispatch = Dispatch {
            queue_name,
            job,
            allocation: None,
        };

        dispatch_and_run(&ctx, dispatch).await.unwrap();

        let mut history = tokio::fs::read_dir(tmp.path().join(HISTORY_DIR)).await.unwrap();
        let entry = history.next_entry().await.unwrap().expect("history file expected");
        assert!(entry.file_name().to_str().unwrap().ends_with("-#-success.json"));

        let mut queue = tokio::fs::read_dir(tmp.path().join(QUEUE_DIR)).await.unwrap();
        assert!(queue.next_entry().await.unwrap().is_none());

        let snapshot = catalog.snapshot_model("true").await;
        assert!(snapshot[0].is_final);
    }

    #[tokio::test]
    async fn orphan_with_dead_pid_moves_to_history_as_error() {
        let tmp = tempfile::tempdir().unwrap();
        setup_dirs(tmp.path()).await;
        let job = base_job("/bin", "true");
        let active_name = ActiveName {
            sub_stamp: job.sub_stamp.clone(),
            instance: job.instance.clone(),
            model: job.model_name.clone(),
            digest: job.model_digest.clone(),
            run_stamp: Some(job.sub_stamp.clone()),
            cpu: 1,
            mem: 0,
            position: job.position,
            pid: 999_999,
        };
        tokio::fs::write(
            tmp.path().join(ACTIVE_DIR).join(active_name.encode()),
            serde_json::to_vec(&job).unwrap(),
        )
        .await
        .unwrap();

        let catalog = RunCatalog::new();
        reconcile_orphans(tmp.path(), "_4040", &catalog).await.unwrap();

        let mut history = tokio::fs::read_dir(tmp.path().join(HISTORY_DIR)).await.unwrap();
        let entry = history.next_entry().await.unwrap().expect("history file expected");
        assert!(entry.file_name().to_str().unwrap().ends_with("-#-error.json"));
    }

    #[tokio::test]
    async fn server_with_empty_start_exe_becomes_ready() {
        let tmp = tempfile::tempdir().unwrap();
        setup_dirs(tmp.path()).await;

        let config = ComputeConfig {
            local: ResourceDemand::default(),
            idle_timeout: None,
            start_timeout: None,
            stop_timeout: None,
            mpi_max_threads: 0,
            max_errors: 3,
            servers: vec![crate::compute::ServerConfig {
                name: "s1".to_string(),
                cpu: 8,
                memory: 0,
                start_exe: String::new(),
                start_args: vec![],
                stop_exe: String::new(),
                stop_args: vec![],
            }],
            hostfile: None,
        };
        let compute = ComputeRegistry::new(config);
        let mut items = HashMap::new();
        items.insert(
            "s1".to_string(),
            ComputeItem {
                name: "s1".to_string(),
                total: ResourceDemand { cpu: 8, mem: 0 },
                used: ResourceDemand::default(),
                own_used: ResourceDemand::default(),
                state: ServerState::Empty,
                last_start: None,
                last_stop: None,
                last_error: None,
                error_count: 0,
                last_used: None,
                start_exe: String::new(),
                start_args: vec![],
                stop_exe: String::new(),
                stop_args: vec![],
            },
        );
        let mut needed = HashSet::new();
        needed.insert("s1".to_string());

        server_lifecycle_cycle(tmp.path(), &compute, &items, &needed).await.unwrap();

        let ready_path = tmp.path().join(STATE_DIR).join(CompReadyName { server: "s1".to_string() }.encode());
        assert!(tokio::fs::metadata(ready_path).await.is_ok());
    }
}
