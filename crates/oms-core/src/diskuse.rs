//! Disk-use monitor (spec §4.6): measure this instance's storage footprint,
//! aggregate peers' self-reported totals, and gate new admissions when a
//! configured quota is exceeded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::catalog::DiskUseSnapshot;
use crate::error::{SchedError, SchedResult};
use crate::paths::{DiskStatus, DiskUseName, STATE_DIR};
use crate::stamp::Stamp;

pub const GIGABYTE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DiskConfigError {
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
    #[error("invalid integer for [{section}].{key}: {value}")]
    InvalidInt { section: String, key: String, value: String },
}

/// A named group of instances sharing one quota (spec §4.6 "Group-based limits").
#[derive(Debug, Clone)]
pub struct GroupLimit {
    pub name: String,
    pub users: Vec<String>,
    pub user_limit_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DiskConfig {
    pub scan_interval: Duration,
    pub global_limit_bytes: u64,
    pub common_user_limit_bytes: u64,
    pub groups: Vec<GroupLimit>,
    /// Explicit per-instance override, read from an optional `[<Instance>]`
    /// section — takes priority over group and common limits.
    pub instance_limits: HashMap<String, u64>,
    pub db_cleanup: Option<String>,
}

impl DiskConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, DiskConfigError> {
        let path = path.as_ref();
        let ini = ini::Ini::load_from_file(path).map_err(|source| DiskConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        let common = ini.section(Some("Common"));
        let get = |key: &str| -> Option<String> { common.and_then(|s| s.get(key)).map(|v| v.to_string()) };

        let scan_interval_secs = parse_u64_or("Common", "ScanInterval", get("ScanInterval"), 383)?;
        let scan_interval = Duration::from_secs(scan_interval_secs.max(11));
        let global_gb = parse_u64_or("Common", "AllUsersLimit", get("AllUsersLimit"), 0)?;
        let user_gb = parse_u64_or("Common", "UserLimit", get("UserLimit"), 0)?;
        let db_cleanup = get("DbCleanup");

        let group_names: Vec<String> = get("Groups")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut groups = Vec::new();
        for name in group_names {
            let users_key = format!("{name}.Users");
            let limit_key = format!("{name}.UserLimit");
            let users = get(&users_key)
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            let limit_gb = parse_u64_or("Common", &limit_key, get(&limit_key), 0)?;
            groups.push(GroupLimit {
                name,
                users,
                user_limit_bytes: limit_gb.saturating_mul(GIGABYTE),
            });
        }

        let mut instance_limits = HashMap::new();
        for section_name in ini.sections().flatten() {
            if section_name == "Common" {
                continue;
            }
            if let Some(section) = ini.section(Some(section_name)) {
                if let Some(raw) = section.get("UserLimit") {
                    let gb = raw.trim().parse::<u64>().map_err(|_| DiskConfigError::InvalidInt {
                        section: section_name.to_string(),
                        key: "UserLimit".to_string(),
                        value: raw.to_string(),
                    })?;
                    instance_limits.insert(section_name.to_string(), gb.saturating_mul(GIGABYTE));
                }
            }
        }

        Ok(DiskConfig {
            scan_interval,
            global_limit_bytes: global_gb.saturating_mul(GIGABYTE),
            common_user_limit_bytes: user_gb.saturating_mul(GIGABYTE),
            groups,
            instance_limits,
            db_cleanup,
        })
    }

    /// Resolution order: per-instance override, then first matching group,
    /// then the common limit (spec §4.6).
    pub fn limit_for_instance(&self, instance: &str) -> u64 {
        if let Some(&limit) = self.instance_limits.get(instance) {
            return limit;
        }
        for group in &self.groups {
            if group.users.iter().any(|u| u == instance) {
                return group.user_limit_bytes;
            }
        }
        self.common_user_limit_bytes
    }

    /// Peer disk-use files older than this are ignored (spec §5 "Timeouts").
    pub fn peer_file_max_age(&self) -> Duration {
        Duration::from_secs((3 * self.scan_interval.as_secs()).max(60))
    }
}

fn parse_u64_or(section: &str, key: &str, raw: Option<String>, default: u64) -> Result<u64, DiskConfigError> {
    match raw {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| DiskConfigError::InvalidInt {
            section: section.to_string(),
            key: key.to_string(),
            value: v,
        }),
    }
}

/// Recursively sum file sizes under `root`; a missing directory counts as
/// zero rather than an error (new instances may not have created it yet).
pub async fn dir_size_bytes(root: impl AsRef<Path>) -> SchedResult<u64> {
    let mut total = 0u64;
    let mut stack = vec![root.as_ref().to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(SchedError::io(dir.display().to_string(), e)),
        };
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| SchedError::io(dir.display().to_string(), e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| SchedError::io(entry.path().display().to_string(), e))?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| SchedError::io(entry.path().display().to_string(), e))?;
                total = total.saturating_add(meta.len());
            }
        }
    }
    Ok(total)
}

/// Sum [`dir_size_bytes`] across every configured root (models binary tree,
/// database files, download and upload directories).
pub async fn measure_this_instance(roots: &[PathBuf]) -> SchedResult<u64> {
    let mut total = 0u64;
    for root in roots {
        total = total.saturating_add(dir_size_bytes(root).await?);
    }
    Ok(total)
}

/// Read `state/disk-#-...` files, keeping the newest per instance and
/// dropping any older than `max_age` (spec §4.6, §5 "Timeouts").
pub async fn scan_peer_disk_use(
    job_control_root: impl AsRef<Path>,
    max_age: Duration,
) -> SchedResult<HashMap<String, u64>> {
    let state_dir = job_control_root.as_ref().join(STATE_DIR);
    let mut latest: HashMap<String, (i64, u64)> = HashMap::new();
    let now_millis = Utc::now().timestamp_millis();
    let max_age_millis = max_age.as_millis() as i64;

    let mut read_dir = match tokio::fs::read_dir(&state_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(SchedError::io(state_dir.display().to_string(), e)),
    };

    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| SchedError::io(state_dir.display().to_string(), e))?
    {
        let file_name = entry.file_name();
        let Some(name_str) = file_name.to_str() else {
            continue;
        };
        let Ok(disk) = DiskUseName::decode(name_str) else {
            continue;
        };
        if now_millis - disk.unix_millis > max_age_millis {
            continue;
        }
        latest
            .entry(disk.instance.clone())
            .and_modify(|(ts, bytes)| {
                if disk.unix_millis > *ts {
                    *ts = disk.unix_millis;
                    *bytes = disk.bytes;
                }
            })
            .or_insert((disk.unix_millis, disk.bytes));
    }

    Ok(latest.into_iter().map(|(k, (_, bytes))| (k, bytes)).collect())
}

/// Writes and refreshes this instance's `disk-#-...` rendezvous file,
/// mirroring [`crate::heartbeat::HeartbeatWriter`]'s rename-to-bump shape.
pub struct DiskUseWriter {
    state_dir: PathBuf,
    instance: String,
    current: Mutex<Option<DiskUseName>>,
}

impl DiskUseWriter {
    pub fn new(job_control_root: impl AsRef<Path>, instance: impl Into<String>) -> Self {
        DiskUseWriter {
            state_dir: job_control_root.as_ref().join(STATE_DIR),
            instance: instance.into(),
            current: Mutex::new(None),
        }
    }

    pub async fn publish(&self, bytes: u64, is_over: bool) -> SchedResult<()> {
        let ts = Stamp::now();
        let unix_millis = ts.unix_millis().unwrap_or_else(|_| Utc::now().timestamp_millis());
        let name = DiskUseName {
            instance: self.instance.clone(),
            bytes,
            status: if is_over { DiskStatus::Over } else { DiskStatus::Ok },
            timestamp: ts,
            unix_millis,
        };
        let new_path = self.state_dir.join(name.encode());
        tokio::fs::write(&new_path, b"")
            .await
            .map_err(|e| SchedError::io(new_path.display().to_string(), e))?;

        let mut guard = self.current.lock().await;
        if let Some(old) = guard.take() {
            if old != name {
                let old_path = self.state_dir.join(old.encode());
                let _ = tokio::fs::remove_file(&old_path).await;
            }
        }
        *guard = Some(name);
        Ok(())
    }
}

/// One full disk-use cycle: measure, aggregate, decide over-limit, publish
/// (spec §4.6). Returns the snapshot to install into the run catalog.
pub async fn run_cycle(
    job_control_root: impl AsRef<Path>,
    self_instance: &str,
    config: &DiskConfig,
    writer: &DiskUseWriter,
    measured_roots: &[PathBuf],
) -> SchedResult<DiskUseSnapshot> {
    let this_instance_bytes = measure_this_instance(measured_roots).await?;
    let max_age = config.peer_file_max_age();
    let mut per_instance = scan_peer_disk_use(&job_control_root, max_age).await?;
    per_instance.insert(self_instance.to_string(), this_instance_bytes);
    let global_bytes: u64 = per_instance.values().sum();

    let per_instance_limit_bytes = config.limit_for_instance(self_instance);
    let is_over = (per_instance_limit_bytes > 0 && this_instance_bytes >= per_instance_limit_bytes)
        || (config.global_limit_bytes > 0 && global_bytes >= config.global_limit_bytes);

    writer.publish(this_instance_bytes, is_over).await?;

    Ok(DiskUseSnapshot {
        this_instance_bytes,
        global_bytes,
        per_instance_limit_bytes,
        global_limit_bytes: config.global_limit_bytes,
        is_over,
        status: if is_over { DiskStatus::Over } else { DiskStatus::Ok },
        updated_at: Utc::now(),
    })
}
