//! End-to-end scenario tests wiring several `oms-core` modules together,
//! one per literal scenario in spec §8.2. Unlike the per-module unit tests,
//! these drive the real filesystem rendezvous protocol: files are written
//! under a `tempfile::tempdir()`, then the same functions the daemon calls
//! each scan cycle (`planner::plan`, `supervisor::dispatch_and_run`,
//! `supervisor::reconcile_orphans`, `diskuse::run_cycle`) are invoked
//! directly against that directory.

use std::collections::{HashMap, HashSet};

use oms_core::catalog::RunCatalog;
use oms_core::compute::{ComputeConfig, ComputeItem, ComputeRegistry, ServerState};
use oms_core::diskuse::{DiskConfig, DiskUseWriter};
use oms_core::job::{ResourceDemand, RunJob};
use oms_core::paths::{
    ActiveName, InstancePauseName, QueueName, ACTIVE_DIR, HISTORY_DIR, QUEUE_DIR, STATE_DIR,
};
use oms_core::planner::{plan, QueueCandidate};
use oms_core::stamp::Stamp;
use oms_core::supervisor::{dispatch_and_run, reconcile_orphans, LaunchContext};

fn make_job(instance: &str, sub_stamp: &str, model: &str) -> RunJob {
    RunJob {
        sub_stamp: Stamp::parse(sub_stamp).unwrap(),
        run_stamp: None,
        instance: instance.to_string(),
        model_name: model.to_string(),
        model_digest: "D".to_string(),
        run_name: "run".to_string(),
        working_dir: "/bin".to_string(),
        options: HashMap::new(),
        env: HashMap::new(),
        table_retention: Vec::new(),
        run_notes: HashMap::new(),
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

async fn setup_dirs(root: &std::path::Path) {
    for dir in [QUEUE_DIR, ACTIVE_DIR, HISTORY_DIR, STATE_DIR] {
        tokio::fs::create_dir_all(root.join(dir)).await.unwrap();
    }
}

fn queue_name_for(job: &RunJob) -> QueueName {
    let demand = job.demand();
    QueueName {
        sub_stamp: job.sub_stamp.clone(),
        instance: job.instance.clone(),
        model: job.model_name.clone(),
        digest: job.model_digest.clone(),
        run_stamp: None,
        cpu: demand.cpu,
        mem: demand.mem,
        position: job.position,
    }
}

// Scenario 1: single local run, success (spec §8.2.1).
#[tokio::test]
async fn single_local_run_success() {
    let tmp = tempfile::tempdir().unwrap();
    setup_dirs(tmp.path()).await;

    let job = make_job("_4040", "2022_08_17_10_00_00_000", "M");
    let queue_name = queue_name_for(&job);
    tokio::fs::write(
        tmp.path().join(QUEUE_DIR).join(queue_name.encode()),
        serde_json::to_vec(&job).unwrap(),
    )
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

    let candidates = vec![QueueCandidate { queue_name: queue_name.clone(), job: job.clone() }];
    let out = plan(
        "_4040",
        &candidates,
        &[],
        &HashSet::new(),
        &HashMap::new(),
        ResourceDemand { cpu: 4, mem: 0 },
        false,
        &HashSet::new(),
        0,
    );
    let dispatch = out.dispatch.expect("local job should be admitted");
    assert_eq!(dispatch.queue_name.instance, "_4040");

    let ctx = LaunchContext {
        job_control_root: tmp.path(),
        self_instance: "_4040",
        user_files_dir: tmp.path(),
        compute: &compute,
        catalog: &catalog,
    };
    dispatch_and_run(&ctx, dispatch).await.unwrap();

    let mut history = tokio::fs::read_dir(tmp.path().join(HISTORY_DIR)).await.unwrap();
    let entry = history.next_entry().await.unwrap().expect("history file expected");
    let name = entry.file_name();
    let name = name.to_str().unwrap();
    assert!(name.starts_with("2022_08_17_10_00_00_000-#-_4040-#-M-#-D-#-"));
    assert!(name.ends_with("-#-success.json"));

    let snapshot = catalog.snapshot_model("M").await;
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].is_final);
}

// Scenario 2: MPI packing across two servers (spec §8.2.2).
#[tokio::test]
async fn mpi_packing_across_two_servers_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    setup_dirs(tmp.path()).await;

    let mut j = make_job("_4040", "2022_08_17_10_00_00_000", "M");
    j.is_mpi = true;
    j.process_count = 4;
    j.threads_per_process = 3;
    let queue_name = queue_name_for(&j);

    let mut compute_items = HashMap::new();
    for name in ["s1", "s2"] {
        compute_items.insert(
            name.to_string(),
            ComputeItem {
                name: name.to_string(),
                total: ResourceDemand { cpu: 8, mem: 0 },
                used: ResourceDemand::default(),
                own_used: ResourceDemand::default(),
                state: ServerState::Ready,
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
    }

    let candidates = vec![QueueCandidate { queue_name, job: j }];
    let out = plan(
        "_4040",
        &candidates,
        &[],
        &HashSet::new(),
        &compute_items,
        ResourceDemand::default(),
        false,
        &HashSet::new(),
        0,
    );
    let dispatch = out.dispatch.expect("MPI job should pack across both servers");
    let allocation = dispatch.allocation.expect("MPI dispatch carries a packing result");
    assert_eq!(allocation.thread_count, 3);
    let mut by_server: HashMap<&str, u32> = HashMap::new();
    for a in &allocation.allocations {
        by_server.insert(a.server.as_str(), a.processes);
        assert_eq!(a.cpu, 6);
    }
    assert_eq!(by_server.get("s1"), Some(&2));
    assert_eq!(by_server.get("s2"), Some(&2));
}

// spec §4.4 step 4: configured MpiMaxThreads caps the packed thread count
// even when the job requests more threads per process.
#[tokio::test]
async fn plan_threads_mpi_max_threads_into_packing() {
    let mut j = make_job("_4040", "2022_08_17_10_00_00_000", "M");
    j.is_mpi = true;
    j.process_count = 2;
    j.threads_per_process = 6;
    let queue_name = queue_name_for(&j);

    let mut compute_items = HashMap::new();
    compute_items.insert(
        "s1".to_string(),
        ComputeItem {
            name: "s1".to_string(),
            total: ResourceDemand { cpu: 8, mem: 0 },
            used: ResourceDemand::default(),
            own_used: ResourceDemand::default(),
            state: ServerState::Ready,
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

    let candidates = vec![QueueCandidate { queue_name, job: j }];
    let out = plan(
        "_4040",
        &candidates,
        &[],
        &HashSet::new(),
        &compute_items,
        ResourceDemand::default(),
        false,
        &HashSet::new(),
        3,
    );
    let dispatch = out.dispatch.expect("MPI job should be admitted");
    let allocation = dispatch.allocation.expect("MPI dispatch carries a packing result");
    assert_eq!(allocation.thread_count, 3);
}

// Scenario 3: orphan recovery (spec §8.2.3).
#[tokio::test]
async fn orphan_recovery_moves_to_history_as_error() {
    let tmp = tempfile::tempdir().unwrap();
    setup_dirs(tmp.path()).await;

    let j = make_job("_4040", "2022_08_17_10_00_00_000", "M");
    let active_name = ActiveName {
        sub_stamp: j.sub_stamp.clone(),
        instance: j.instance.clone(),
        model: j.model_name.clone(),
        digest: j.model_digest.clone(),
        run_stamp: Some(j.sub_stamp.clone()),
        cpu: 1,
        mem: 0,
        position: j.position,
        pid: 999_999,
    };
    tokio::fs::write(
        tmp.path().join(ACTIVE_DIR).join(active_name.encode()),
        serde_json::to_vec(&j).unwrap(),
    )
    .await
    .unwrap();

    let catalog = RunCatalog::new();
    reconcile_orphans(tmp.path(), "_4040", &catalog).await.unwrap();

    let mut active = tokio::fs::read_dir(tmp.path().join(ACTIVE_DIR)).await.unwrap();
    assert!(active.next_entry().await.unwrap().is_none());

    let mut history = tokio::fs::read_dir(tmp.path().join(HISTORY_DIR)).await.unwrap();
    let entry = history.next_entry().await.unwrap().expect("history file expected");
    assert!(entry.file_name().to_str().unwrap().ends_with("-#-error.json"));
}

// Scenario 4: two-instance fairness, older submission stamp wins (spec §8.2.4).
#[tokio::test]
async fn two_instance_fairness_older_stamp_wins_end_to_end() {
    let newer = make_job("_4040", "2022_01_01_00_00_00_002", "M");
    let older = make_job("_8080", "2022_01_01_00_00_00_001", "M");
    let candidates = vec![
        QueueCandidate { queue_name: queue_name_for(&newer), job: newer },
        QueueCandidate { queue_name: queue_name_for(&older), job: older },
    ];

    // Only enough capacity for one job's worth of local resources.
    let out = plan(
        "_8080",
        &candidates,
        &[],
        &HashSet::new(),
        &HashMap::new(),
        ResourceDemand { cpu: 1, mem: 0 },
        false,
        &HashSet::new(),
        0,
    );
    let dispatch = out.dispatch.expect("one local slot should admit the older job");
    assert_eq!(dispatch.queue_name.instance, "_8080");
}

// Scenario 5: per-instance pause blocks admission but not peers (spec §8.2.5).
#[tokio::test]
async fn pause_blocks_admission_but_not_peers_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    setup_dirs(tmp.path()).await;

    let pause_name = InstancePauseName { instance: "_4040".to_string() };
    tokio::fs::write(tmp.path().join(STATE_DIR).join(pause_name.encode()), b"")
        .await
        .unwrap();

    let paused_job = make_job("_4040", "2022_01_01_00_00_00_001", "M");
    let free_job = make_job("_8080", "2022_01_01_00_00_00_002", "M");
    let candidates = vec![
        QueueCandidate { queue_name: queue_name_for(&paused_job), job: paused_job },
        QueueCandidate { queue_name: queue_name_for(&free_job), job: free_job },
    ];

    let mut paused_instances = HashSet::new();
    paused_instances.insert("_4040".to_string());

    let out = plan(
        "_8080",
        &candidates,
        &[],
        &HashSet::new(),
        &HashMap::new(),
        ResourceDemand { cpu: 4, mem: 0 },
        false,
        &paused_instances,
        0,
    );

    let e4040 = out.entries.iter().find(|e| e.instance == "_4040").unwrap();
    assert!(e4040.is_paused);
    assert!(!e4040.is_first);
    let dispatch = out.dispatch.expect("_8080's head should still be admitted");
    assert_eq!(dispatch.queue_name.instance, "_8080");
}

// Scenario 6: disk over-limit gates new submissions (spec §8.2.6).
#[tokio::test]
async fn disk_over_limit_flags_catalog() {
    let tmp = tempfile::tempdir().unwrap();
    setup_dirs(tmp.path()).await;
    let models_dir = tmp.path().join("models");
    tokio::fs::create_dir_all(&models_dir).await.unwrap();
    tokio::fs::write(models_dir.join("big.bin"), vec![0u8; 2_000]).await.unwrap();

    let mut cfg = DiskConfig {
        scan_interval: std::time::Duration::from_secs(383),
        global_limit_bytes: 0,
        common_user_limit_bytes: 0,
        groups: Vec::new(),
        instance_limits: HashMap::new(),
        db_cleanup: None,
    };
    cfg.instance_limits.insert("_4040".to_string(), 1_000);

    let writer = DiskUseWriter::new(tmp.path(), "_4040");
    let snapshot = oms_core::diskuse::run_cycle(tmp.path(), "_4040", &cfg, &writer, &[models_dir])
        .await
        .unwrap();
    assert!(snapshot.is_over);

    let catalog = RunCatalog::new();
    catalog.set_disk_use(snapshot).await;
    let disk = catalog.disk_use().await.expect("disk-use snapshot installed");
    assert!(disk.is_over, "submissions must be refused while over limit");
}
