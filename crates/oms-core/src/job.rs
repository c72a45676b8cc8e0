//! RunJob — a submitted job record (spec §3).
//!
//! Content is immutable once written to `queue/`, except that the
//! supervisor rewrites pid/command-path/log-file/run-stamp into it at the
//! queue→active transition (spec §3 "Lifecycle").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::stamp::Stamp;

/// Resources a job demands, and the two derived totals from spec §3:
/// `Cpu = processCount * threadCount`, `Mem = processCount * (processMem + threadCount * threadMem)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceDemand {
    pub cpu: u32,
    pub mem: u64,
}

impl ResourceDemand {
    pub fn fits_within(&self, available: ResourceDemand) -> bool {
        self.cpu <= available.cpu && (available.mem == 0 || self.mem <= available.mem)
    }
}

impl std::ops::Add for ResourceDemand {
    type Output = ResourceDemand;
    fn add(self, rhs: ResourceDemand) -> ResourceDemand {
        ResourceDemand {
            cpu: self.cpu + rhs.cpu,
            mem: self.mem + rhs.mem,
        }
    }
}

impl std::ops::AddAssign for ResourceDemand {
    fn add_assign(&mut self, rhs: ResourceDemand) {
        *self = *self + rhs;
    }
}

/// A submitted simulation run (spec §3 "RunJob").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJob {
    pub sub_stamp: Stamp,
    /// Assigned at launch; defaults to `sub_stamp` until the process starts.
    pub run_stamp: Option<Stamp>,

    pub instance: String,
    pub model_name: String,
    pub model_digest: String,
    pub run_name: String,
    pub working_dir: String,

    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub table_retention: Vec<String>,
    #[serde(default)]
    pub run_notes: HashMap<String, String>,
    #[serde(default)]
    pub microdata: Vec<String>,
    pub template_name: Option<String>,

    #[serde(default)]
    pub is_mpi: bool,
    pub process_count: u32,
    pub threads_per_process: u32,
    pub mem_per_process: u64,
    pub mem_per_thread: u64,
    #[serde(default)]
    pub not_on_mpi_root: bool,
    #[serde(default)]
    pub no_job_control_hostfile: bool,

    /// User-assigned position within the owning instance's local queue
    /// order. Default sentinel per spec §9 "Open questions" is `20220817`;
    /// ties (including the sentinel shared by many jobs) break on
    /// `sub_stamp`, so reordering is well-defined regardless of the value.
    #[serde(default = "RunJob::default_position")]
    pub position: u32,

    /// Set by the supervisor at queue→active.
    pub pid: Option<u32>,
    pub command_path: Option<String>,
    pub log_file_name: Option<String>,
}

impl RunJob {
    pub const DEFAULT_POSITION: u32 = 20220817;

    pub fn default_position() -> u32 {
        Self::DEFAULT_POSITION
    }

    pub fn effective_run_stamp(&self) -> Stamp {
        self.run_stamp.clone().unwrap_or_else(|| self.sub_stamp.clone())
    }

    /// Derived resource demand, spec §3: `Cpu = processCount * threadCount`,
    /// `Mem = processCount * (processMem + threadCount * threadMem)`.
    pub fn demand(&self) -> ResourceDemand {
        let cpu = self.process_count.saturating_mul(self.threads_per_process);
        let per_process = self
            .mem_per_process
            .saturating_add((self.threads_per_process as u64).saturating_mul(self.mem_per_thread));
        let mem = (self.process_count as u64).saturating_mul(per_process);
        ResourceDemand { cpu, mem }
    }
}
