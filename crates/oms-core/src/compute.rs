//! Compute-server registry (spec §4.3): derive a state machine for each
//! configured compute server from observed rendezvous files. Pure
//! observation — the registry never writes a state file itself; that is
//! the supervisor's job (spec §4.3 "Side effects performed by the
//! supervisor").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{SchedError, SchedResult};
use crate::job::ResourceDemand;
use crate::paths::{
    CompErrorName, CompReadyName, CompStartName, CompStopName, CompUsedName, STATE_DIR,
};
use crate::stamp::Stamp;

#[derive(Debug, Error)]
pub enum ComputeConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ini::Error,
    },
    #[error("missing required field [{section}].{key}")]
    MissingField { section: String, key: String },
    #[error("invalid integer for [{section}].{key}: {value}")]
    InvalidInt {
        section: String,
        key: String,
        value: String,
    },
}

/// A compute server's configuration overrides (spec §6 `[<ServerName>]`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub cpu: u32,
    pub memory: u64,
    pub start_exe: String,
    pub start_args: Vec<String>,
    pub stop_exe: String,
    pub stop_args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HostfileConfig {
    pub host_name: Option<String>,
    pub cpu_cores: Option<u32>,
    pub root_line: Option<String>,
    pub host_line: Option<String>,
    pub host_file_dir: Option<String>,
}

/// Default used when `MaxErrors = 0` ("0 means unlimited/default", spec §6;
/// resolved here as "default" per DESIGN.md).
pub const DEFAULT_MAX_ERRORS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ComputeConfig {
    pub local: ResourceDemand,
    pub idle_timeout: Option<Duration>,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
    pub mpi_max_threads: u32,
    pub max_errors: u32,
    pub servers: Vec<ServerConfig>,
    pub hostfile: Option<HostfileConfig>,
}

impl ComputeConfig {
    pub fn effective_max_errors(&self) -> u32 {
        if self.max_errors == 0 {
            DEFAULT_MAX_ERRORS
        } else {
            self.max_errors
        }
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ComputeConfigError> {
        let path = path.as_ref();
        let ini = ini::Ini::load_from_file(path).map_err(|source| ComputeConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        let common = ini.section(Some("Common"));
        let get = |key: &str| -> Option<String> { common.and_then(|s| s.get(key)).map(|v| v.to_string()) };

        let local_cpu = parse_int_or_zero("Common", "LocalCpu", get("LocalCpu"))?;
        let local_mem = parse_u64_or_zero("Common", "LocalMemory", get("LocalMemory"))?;
        let idle_timeout = parse_seconds_opt("Common", "IdleTimeout", get("IdleTimeout"))?;
        let start_timeout = parse_seconds_opt("Common", "StartTimeout", get("StartTimeout"))?;
        let stop_timeout = parse_seconds_opt("Common", "StopTimeout", get("StopTimeout"))?;
        let mpi_max_threads = parse_int_or_zero("Common", "MpiMaxThreads", get("MpiMaxThreads"))?;
        let max_errors = parse_int_or_zero("Common", "MaxErrors", get("MaxErrors"))?;

        let default_start_exe = get("StartExe").unwrap_or_default();
        let default_stop_exe = get("StopExe").unwrap_or_default();
        let default_start_args = split_args(get("StartArgs"));
        let default_stop_args = split_args(get("StopArgs"));

        let server_names: Vec<String> = get("Servers")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut servers = Vec::new();
        for name in server_names {
            let section = ini.section(Some(name.as_str()));
            let sget = |key: &str| -> Option<String> { section.and_then(|s| s.get(key)).map(|v| v.to_string()) };
            let cpu = parse_int_or_zero(&name, "Cpu", sget("Cpu"))?;
            let memory = parse_u64_or_zero(&name, "Memory", sget("Memory"))?;
            servers.push(ServerConfig {
                start_exe: sget("StartExe").unwrap_or_else(|| default_start_exe.clone()),
                start_args: sget("StartArgs").map(split_args).unwrap_or_else(|| default_start_args.clone()),
                stop_exe: sget("StopExe").unwrap_or_else(|| default_stop_exe.clone()),
                stop_args: sget("StopArgs").map(split_args).unwrap_or_else(|| default_stop_args.clone()),
                name,
                cpu,
                memory,
            });
        }

        let hostfile_section = ini.section(Some("hostfile"));
        let hostfile = hostfile_section.map(|s| HostfileConfig {
            host_name: s.get("HostName").map(|v| v.to_string()),
            cpu_cores: s.get("CpuCores").and_then(|v| v.parse().ok()),
            root_line: s.get("RootLine").map(|v| v.to_string()),
            host_line: s.get("HostLine").map(|v| v.to_string()),
            host_file_dir: s.get("HostFileDir").map(|v| v.to_string()),
        });

        Ok(ComputeConfig {
            local: ResourceDemand {
                cpu: local_cpu,
                mem: local_mem,
            },
            idle_timeout,
            start_timeout,
            stop_timeout,
            mpi_max_threads,
            max_errors,
            servers,
            hostfile,
        })
    }
}

fn split_args(raw: Option<String>) -> Vec<String> {
    match raw {
        None => Vec::new(),
        Some(s) if s.trim().is_empty() => Vec::new(),
        Some(s) => s.split_whitespace().map(|p| p.to_string()).collect(),
    }
}

fn parse_int_or_zero(section: &str, key: &str, raw: Option<String>) -> Result<u32, ComputeConfigError> {
    match raw {
        None => Ok(0),
        Some(v) => v.trim().parse().map_err(|_| ComputeConfigError::InvalidInt {
            section: section.to_string(),
            key: key.to_string(),
            value: v,
        }),
    }
}

fn parse_u64_or_zero(section: &str, key: &str, raw: Option<String>) -> Result<u64, ComputeConfigError> {
    match raw {
        None => Ok(0),
        Some(v) => v.trim().parse().map_err(|_| ComputeConfigError::InvalidInt {
            section: section.to_string(),
            key: key.to_string(),
            value: v,
        }),
    }
}

fn parse_seconds_opt(
    section: &str,
    key: &str,
    raw: Option<String>,
) -> Result<Option<Duration>, ComputeConfigError> {
    let secs = parse_int_or_zero(section, key, raw)?;
    Ok(if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs as u64))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Empty,
    Start,
    Ready,
    Stop,
    Error,
}

#[derive(Debug, Clone)]
pub struct ComputeItem {
    pub name: String,
    pub total: ResourceDemand,
    pub used: ResourceDemand,
    pub own_used: ResourceDemand,
    pub state: ServerState,
    pub last_start: Option<Stamp>,
    pub last_stop: Option<Stamp>,
    pub last_error: Option<Stamp>,
    pub error_count: u32,
    pub last_used: Option<Stamp>,
    pub start_exe: String,
    pub start_args: Vec<String>,
    pub stop_exe: String,
    pub stop_args: Vec<String>,
}

impl ComputeItem {
    /// A server in `Error` contributes zero to available capacity (spec §3 invariant).
    pub fn available(&self) -> ResourceDemand {
        match self.state {
            ServerState::Error => ResourceDemand::default(),
            _ => ResourceDemand {
                cpu: self.total.cpu.saturating_sub(self.used.cpu),
                mem: self.total.mem.saturating_sub(self.used.mem),
            },
        }
    }
}

pub struct ComputeRegistry {
    config: ComputeConfig,
    error_counts: Mutex<HashMap<String, u32>>,
    /// Last cycle at which a server was observed with nonzero usage; `None`
    /// means idle since the registry was created. Drives both the planner's
    /// "longest-unused" packing tie-break and the supervisor's idle-timeout
    /// shutdown decision (spec §4.3 "Idle timeout").
    last_used: Mutex<HashMap<String, Stamp>>,
}

impl ComputeRegistry {
    pub fn new(config: ComputeConfig) -> Self {
        ComputeRegistry {
            config,
            error_counts: Mutex::new(HashMap::new()),
            last_used: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    /// Observe state files and return the derived per-server map (spec §4.3).
    pub async fn observe(
        &self,
        job_control_root: impl AsRef<Path>,
        self_instance: &str,
        active_instances: &crate::heartbeat::ActiveInstances,
    ) -> SchedResult<HashMap<String, ComputeItem>> {
        let state_dir = job_control_root.as_ref().join(STATE_DIR);
        let now = Utc::now();

        let mut ready: HashMap<String, ()> = HashMap::new();
        let mut start: HashMap<String, Stamp> = HashMap::new();
        let mut stop: HashMap<String, Stamp> = HashMap::new();
        let mut error: HashMap<String, Stamp> = HashMap::new();
        let mut used: Vec<(CompUsedName, ResourceDemand)> = Vec::new();

        let mut read_dir = match tokio::fs::read_dir(&state_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&state_dir)
                    .await
                    .map_err(|e| SchedError::io(state_dir.display().to_string(), e))?;
                tokio::fs::read_dir(&state_dir)
                    .await
                    .map_err(|e| SchedError::io(state_dir.display().to_string(), e))?
            }
            Err(e) => return Err(SchedError::io(state_dir.display().to_string(), e)),
        };

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| SchedError::io(state_dir.display().to_string(), e))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Ok(r) = CompReadyName::decode(name) {
                ready.insert(r.server, ());
            } else if let Ok(s) = CompStartName::decode(name) {
                start.insert(s.server, s.timestamp);
            } else if let Ok(s) = CompStopName::decode(name) {
                stop.insert(s.server, s.timestamp);
            } else if let Ok(e) = CompErrorName::decode(name) {
                error.insert(e.server, e.timestamp);
            } else if let Ok(u) = CompUsedName::decode(name) {
                let demand = ResourceDemand {
                    cpu: u.cpu,
                    mem: u.mem,
                };
                used.push((u, demand));
            }
        }

        let mut counts = self.error_counts.lock().await;
        let mut out = HashMap::new();

        for server in &self.config.servers {
            let mut error_count = *counts.get(&server.name).unwrap_or(&0);
            let mut state;
            let mut last_start = None;
            let mut last_stop = None;
            let mut last_error = None;

            if ready.contains_key(&server.name) {
                state = ServerState::Ready;
                error_count = 0;
            } else {
                state = ServerState::Empty;

                if let Some(ts) = start.get(&server.name) {
                    last_start = Some(ts.clone());
                    if within_timeout(ts, now, self.config.start_timeout) {
                        state = ServerState::Start;
                    } else {
                        error_count += 1;
                    }
                }
                if let Some(ts) = stop.get(&server.name) {
                    last_stop = Some(ts.clone());
                    if within_timeout(ts, now, self.config.stop_timeout) {
                        state = ServerState::Stop;
                    } else {
                        error_count += 1;
                    }
                }
                if let Some(ts) = error.get(&server.name) {
                    last_error = Some(ts.clone());
                    error_count += 1;
                }
            }

            if error_count > self.config.effective_max_errors() {
                state = ServerState::Error;
                debug!(server = %server.name, error_count, "compute server in error state");
            }

            counts.insert(server.name.clone(), error_count);

            out.insert(
                server.name.clone(),
                ComputeItem {
                    name: server.name.clone(),
                    total: ResourceDemand {
                        cpu: server.cpu,
                        mem: server.memory,
                    },
                    used: ResourceDemand::default(),
                    own_used: ResourceDemand::default(),
                    state,
                    last_start,
                    last_stop,
                    last_error,
                    error_count,
                    last_used: None,
                    start_exe: server.start_exe.clone(),
                    start_args: server.start_args.clone(),
                    stop_exe: server.stop_exe.clone(),
                    stop_args: server.stop_args.clone(),
                },
            );
        }

        for (name, demand) in used {
            if !active_instances.is_active(&name.instance) {
                continue;
            }
            if let Some(item) = out.get_mut(&name.server) {
                item.used += demand;
                if name.instance == self_instance {
                    item.own_used += demand;
                }
            }
        }

        let mut last_used = self.last_used.lock().await;
        let now_stamp = Stamp::now();
        for item in out.values_mut() {
            if item.used.cpu > 0 || item.used.mem > 0 {
                last_used.insert(item.name.clone(), now_stamp.clone());
            }
            item.last_used = last_used.get(&item.name).cloned();
        }
        drop(last_used);

        Ok(out)
    }

    pub fn hostfile(&self) -> Option<&HostfileConfig> {
        self.config.hostfile.as_ref()
    }
}

fn within_timeout(ts: &Stamp, now: DateTime<Utc>, timeout: Option<Duration>) -> bool {
    let Some(timeout) = timeout else {
        return true;
    };
    let Ok(millis) = ts.unix_millis() else {
        return false;
    };
    let deadline = millis + timeout.as_millis() as i64;
    deadline >= now.timestamp_millis()
}

pub fn compute_used_path(
    job_control_root: impl AsRef<Path>,
    server: &str,
    sub_stamp: &Stamp,
    instance: &str,
    demand: ResourceDemand,
) -> PathBuf {
    let name = CompUsedName {
        server: server.to_string(),
        sub_stamp: sub_stamp.clone(),
        instance: instance.to_string(),
        cpu: demand.cpu,
        mem: demand.mem,
    };
    job_control_root.as_ref().join(STATE_DIR).join(name.encode())
}
