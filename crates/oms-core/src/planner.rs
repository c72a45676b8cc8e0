//! Queue & resource planner (spec §4.4) — the hardest part of the core:
//! multi-queue fair merge, admission testing, and heterogeneous resource
//! packing across compute servers.
//!
//! This module is written as pure functions over already-loaded data
//! (`QueueCandidate`, `ComputeItem`) so it can be fully unit- and
//! property-tested without touching the filesystem; the async scan that
//! loads queue/active files and compute state lives in `supervisor.rs`.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use crate::compute::{ComputeItem, ServerState};
use crate::job::{ResourceDemand, RunJob};
use crate::paths::{ActiveName, QueueName};
use crate::stamp::Stamp;

/// A queue file paired with its parsed job content.
#[derive(Debug, Clone)]
pub struct QueueCandidate {
    pub queue_name: QueueName,
    pub job: RunJob,
}

/// Per-entry flags computed by admission testing (spec §3 "QueueEntry").
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub instance: String,
    pub sub_stamp: Stamp,
    pub position: u32,
    pub demand: ResourceDemand,
    pub is_over: bool,
    pub is_paused: bool,
    pub is_first: bool,
    pub global_queue_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerAllocation {
    pub server: String,
    pub processes: u32,
    pub cpu: u32,
    pub mem: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackResult {
    pub thread_count: u32,
    pub allocations: Vec<ServerAllocation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PackOutcome {
    Fits(PackResult),
    DoesNotFit,
}

/// The job this instance should dispatch this cycle, if the globally first
/// admissible job belongs to it.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub queue_name: QueueName,
    pub job: RunJob,
    /// `None` for local (non-MPI) jobs, which run on the local host cap.
    pub allocation: Option<PackResult>,
}

#[derive(Debug, Clone, Default)]
pub struct PlannerOutput {
    pub entries: Vec<QueueEntry>,
    pub dispatch: Option<Dispatch>,
}

/// Group queue candidates by owning instance, sorted by (position, sub_stamp)
/// within each group (spec §4.4 step 1).
pub fn group_by_instance(candidates: &[QueueCandidate]) -> Vec<(String, Vec<&QueueCandidate>)> {
    let mut groups: HashMap<String, Vec<&QueueCandidate>> = HashMap::new();
    for c in candidates {
        groups.entry(c.queue_name.instance.clone()).or_default().push(c);
    }
    let mut out: Vec<(String, Vec<&QueueCandidate>)> = groups.into_iter().collect();
    for (_, list) in out.iter_mut() {
        list.sort_by(|a, b| {
            a.job
                .position
                .cmp(&b.job.position)
                .then_with(|| a.queue_name.sub_stamp.cmp(&b.queue_name.sub_stamp))
        });
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// K-way merge across per-instance queues by submission stamp, tie-broken
/// by instance name. Never advances an instance past its own local order
/// (spec §4.4 step 2).
pub fn merge_global_order<'a>(groups: &[(String, Vec<&'a QueueCandidate>)]) -> Vec<&'a QueueCandidate> {
    let mut cursors = vec![0usize; groups.len()];
    let mut out = Vec::new();
    loop {
        let mut best: Option<usize> = None;
        for (i, (instance, list)) in groups.iter().enumerate() {
            let c = cursors[i];
            if c >= list.len() {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(b) => {
                    let cand = list[c];
                    let best_list = &groups[b].1;
                    let best_cand = best_list[cursors[b]];
                    let better = cand.queue_name.sub_stamp < best_cand.queue_name.sub_stamp
                        || (cand.queue_name.sub_stamp == best_cand.queue_name.sub_stamp
                            && instance < &groups[b].0);
                    if better {
                        best = Some(i);
                    }
                }
            }
        }
        match best {
            None => break,
            Some(i) => {
                out.push(groups[i].1[cursors[i]]);
                cursors[i] += 1;
            }
        }
    }
    out
}

/// Remove stamps from `queue` that now appear in `history` or `active`
/// (spec §4.4 step 6, spec §3 "overlap resolves history > active > queue").
pub fn reconcile(
    queue: Vec<QueueCandidate>,
    active: &[ActiveName],
    history_stamps: &HashSet<Stamp>,
) -> Vec<QueueCandidate> {
    let active_stamps: HashSet<&Stamp> = active.iter().map(|a| &a.sub_stamp).collect();
    queue
        .into_iter()
        .filter(|c| {
            !history_stamps.contains(&c.queue_name.sub_stamp)
                && !active_stamps.contains(&c.queue_name.sub_stamp)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PackServer {
    pub name: String,
    pub state: ServerState,
    pub available: ResourceDemand,
    pub error_count: u32,
    pub last_used: Option<Stamp>,
}

impl PackServer {
    pub fn from_item(item: &ComputeItem) -> Self {
        PackServer {
            name: item.name.clone(),
            state: item.state,
            available: item.available(),
            error_count: item.error_count,
            last_used: item.last_used.clone(),
        }
    }
}

fn sort_key(s: &PackServer) -> (bool, Reverse<u32>, u32, bool, String, String) {
    let not_ready = s.state != ServerState::Ready;
    let last_used_str = s.last_used.as_ref().map(|t| t.as_str().to_string()).unwrap_or_default();
    (
        not_ready,
        Reverse(s.available.cpu),
        s.error_count,
        s.last_used.is_some(),
        last_used_str,
        s.name.clone(),
    )
}

/// Resource packing (spec §4.4 step 4): find a set of servers that can
/// together host `process_count` processes with a common thread count,
/// reducing the candidate thread count until a fit is found or none exists.
/// On success, commits the allocation by decrementing `servers`' available
/// capacity in place, so a subsequent call in the same admission pass sees
/// the reduced capacity.
pub fn find_compute_res(
    servers: &mut [PackServer],
    process_count: u32,
    requested_threads: u32,
    mem_per_process: u64,
    mem_per_thread: u64,
    mpi_max_threads: u32,
) -> PackOutcome {
    if process_count == 0 {
        return PackOutcome::Fits(PackResult {
            thread_count: 0,
            allocations: Vec::new(),
        });
    }

    let job_cpu = process_count.saturating_mul(requested_threads.max(1));
    let mut thread_cap = requested_threads.max(1);
    if mpi_max_threads > 0 {
        thread_cap = thread_cap.min(mpi_max_threads);
    }
    thread_cap = thread_cap.min(job_cpu.max(1));

    let mut order: Vec<usize> = (0..servers.len()).collect();
    order.sort_by_key(|&i| sort_key(&servers[i]));

    let mut thread_count = thread_cap;
    while thread_count >= 1 {
        let mem_per_proc_total = mem_per_process.saturating_add((thread_count as u64).saturating_mul(mem_per_thread));
        let mut remaining = process_count;
        let mut allocations: Vec<(usize, ServerAllocation)> = Vec::new();

        for &idx in &order {
            if remaining == 0 {
                break;
            }
            if servers[idx].state == ServerState::Error {
                continue;
            }
            let avail = servers[idx].available;
            let by_cpu = avail.cpu / thread_count;
            let by_mem = if mem_per_proc_total > 0 {
                avail.mem / mem_per_proc_total
            } else {
                u64::MAX
            };
            let procs = (by_cpu as u64).min(by_mem).min(remaining as u64) as u32;
            if procs > 0 {
                allocations.push((
                    idx,
                    ServerAllocation {
                        server: servers[idx].name.clone(),
                        processes: procs,
                        cpu: procs * thread_count,
                        mem: procs as u64 * mem_per_proc_total,
                    },
                ));
                remaining -= procs;
            }
        }

        if remaining == 0 {
            for (idx, alloc) in &allocations {
                servers[*idx].available.cpu -= alloc.cpu;
                servers[*idx].available.mem -= alloc.mem;
            }
            return PackOutcome::Fits(PackResult {
                thread_count,
                allocations: allocations.into_iter().map(|(_, a)| a).collect(),
            });
        }
        thread_count -= 1;
    }
    PackOutcome::DoesNotFit
}

/// Full admission pass over the merged order (spec §4.4 steps 3 & 5).
#[allow(clippy::too_many_arguments)]
pub fn plan(
    self_instance: &str,
    candidates: &[QueueCandidate],
    active: &[ActiveName],
    history_stamps: &HashSet<Stamp>,
    compute: &HashMap<String, ComputeItem>,
    local_limit: ResourceDemand,
    global_paused: bool,
    paused_instances: &HashSet<String>,
    mpi_max_threads: u32,
) -> PlannerOutput {
    let reconciled = reconcile(candidates.to_vec(), active, history_stamps);
    let groups = group_by_instance(&reconciled);
    let merged = merge_global_order(&groups);

    let mut pack_servers: Vec<PackServer> = compute.values().map(PackServer::from_item).collect();
    let mut local_remaining = local_limit;

    let mut entries = Vec::with_capacity(merged.len());
    let mut dispatch: Option<Dispatch> = None;
    let mut global_index = 0u32;

    for cand in merged {
        let demand = cand.job.demand();
        let is_paused = global_paused || paused_instances.contains(&cand.queue_name.instance);

        if is_paused {
            entries.push(QueueEntry {
                instance: cand.queue_name.instance.clone(),
                sub_stamp: cand.queue_name.sub_stamp.clone(),
                position: cand.job.position,
                demand,
                is_over: false,
                is_paused: true,
                is_first: false,
                global_queue_index: None,
            });
            continue;
        }

        let (is_over, allocation) = if cand.job.is_mpi {
            let available_mpi: ResourceDemand = pack_servers.iter().fold(ResourceDemand::default(), |acc, s| {
                acc + s.available
            });
            let over = demand.cpu > available_mpi.cpu
                || (available_mpi.mem > 0 && demand.mem > available_mpi.mem);
            if over {
                (true, None)
            } else {
                match find_compute_res(
                    &mut pack_servers,
                    cand.job.process_count,
                    cand.job.threads_per_process,
                    cand.job.mem_per_process,
                    cand.job.mem_per_thread,
                    mpi_max_threads,
                ) {
                    PackOutcome::Fits(result) => (false, Some(result)),
                    PackOutcome::DoesNotFit => (true, None),
                }
            }
        } else {
            let over = demand.cpu > local_remaining.cpu
                || (local_remaining.mem > 0 && demand.mem > local_remaining.mem);
            if !over {
                local_remaining.cpu -= demand.cpu;
                local_remaining.mem = local_remaining.mem.saturating_sub(demand.mem);
            }
            (over, None)
        };

        let is_first = !is_over && dispatch.is_none();
        let global_queue_index = if is_over {
            None
        } else {
            global_index += 1;
            Some(global_index)
        };

        if is_first && cand.queue_name.instance == self_instance {
            dispatch = Some(Dispatch {
                queue_name: cand.queue_name.clone(),
                job: cand.job.clone(),
                allocation,
            });
        }

        entries.push(QueueEntry {
            instance: cand.queue_name.instance.clone(),
            sub_stamp: cand.queue_name.sub_stamp.clone(),
            position: cand.job.position,
            demand,
            is_over,
            is_paused: false,
            is_first,
            global_queue_index,
        });
    }

    PlannerOutput { entries, dispatch }
}
