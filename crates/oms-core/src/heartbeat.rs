//! Instance heartbeat (spec §4.2): prove this instance is alive, identify
//! peers, elect a leader.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SchedResult;
use crate::paths::{HeartbeatName, STATE_DIR};
use crate::stamp::Stamp;

/// Heartbeats older than this are considered dead (spec §4.2, §5).
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// Bump the heartbeat file every 7th main-scan cycle, landing near 8s at
/// the daemon's default scan interval (see SPEC_FULL.md §1.3).
pub const BUMP_EVERY_N_CYCLES: u32 = 7;

pub struct HeartbeatWriter {
    state_dir: PathBuf,
    instance: String,
    current: Mutex<Option<HeartbeatName>>,
}

impl HeartbeatWriter {
    pub fn new(job_control_root: impl AsRef<Path>, instance: impl Into<String>) -> Self {
        HeartbeatWriter {
            state_dir: job_control_root.as_ref().join(STATE_DIR),
            instance: instance.into(),
            current: Mutex::new(None),
        }
    }

    /// Write the initial heartbeat file on startup.
    pub async fn start(&self) -> SchedResult<()> {
        let name = self.fresh_name();
        let path = self.state_dir.join(name.encode());
        tokio::fs::write(&path, b"")
            .await
            .map_err(|e| crate::error::SchedError::io(path.display().to_string(), e))?;
        *self.current.lock().await = Some(name);
        Ok(())
    }

    /// Rename the heartbeat file to bump its embedded timestamp. Called
    /// every [`BUMP_EVERY_N_CYCLES`] main-scan cycles.
    pub async fn bump(&self) -> SchedResult<()> {
        let mut guard = self.current.lock().await;
        let new_name = self.fresh_name();
        let new_path = self.state_dir.join(new_name.encode());
        if let Some(old) = guard.take() {
            let old_path = self.state_dir.join(old.encode());
            match tokio::fs::rename(&old_path, &new_path).await {
                Ok(()) => {}
                Err(e) => {
                    // Another process may have raced us (restart); fall back
                    // to a fresh write rather than losing liveness.
                    warn!(error = %e, "heartbeat rename failed, writing fresh file");
                    tokio::fs::write(&new_path, b"")
                        .await
                        .map_err(|e| crate::error::SchedError::io(new_path.display().to_string(), e))?;
                }
            }
        } else {
            tokio::fs::write(&new_path, b"")
                .await
                .map_err(|e| crate::error::SchedError::io(new_path.display().to_string(), e))?;
        }
        *guard = Some(new_name);
        Ok(())
    }

    /// Best-effort delete on shutdown; may race with a peer observing it.
    pub async fn shutdown(&self) {
        let mut guard = self.current.lock().await;
        if let Some(name) = guard.take() {
            let path = self.state_dir.join(name.encode());
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    fn fresh_name(&self) -> HeartbeatName {
        let ts = Stamp::now();
        let unix_millis = ts.unix_millis().unwrap_or_else(|_| Utc::now().timestamp_millis());
        HeartbeatName {
            instance: self.instance.clone(),
            timestamp: ts,
            unix_millis,
        }
    }
}

/// The set of instances observed as live this cycle, plus the elected leader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveInstances {
    pub names: Vec<String>,
}

impl ActiveInstances {
    pub fn is_active(&self, instance: &str) -> bool {
        self.names.iter().any(|n| n == instance)
    }

    /// Leader = lexicographically least active instance name (spec §4.2).
    pub fn leader(&self) -> Option<&str> {
        self.names.iter().min().map(|s| s.as_str())
    }

    pub fn is_leader(&self, instance: &str) -> bool {
        self.leader() == Some(instance)
    }
}

/// Scan `state/oms-#-*` heartbeat files and classify peers as active or
/// stale. Stale files are not deleted here — they are simply ignored
/// (spec §4.2).
pub async fn scan_active_instances(job_control_root: impl AsRef<Path>) -> SchedResult<ActiveInstances> {
    let state_dir = job_control_root.as_ref().join(STATE_DIR);
    let mut names = Vec::new();
    let now_millis = Utc::now().timestamp_millis();
    let stale_millis = STALE_AFTER.as_millis() as i64;

    let mut read_dir = match tokio::fs::read_dir(&state_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ActiveInstances::default()),
        Err(e) => return Err(crate::error::SchedError::io(state_dir.display().to_string(), e)),
    };

    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| crate::error::SchedError::io(state_dir.display().to_string(), e))?
    {
        let file_name = entry.file_name();
        let Some(name_str) = file_name.to_str() else {
            continue;
        };
        match HeartbeatName::decode(name_str) {
            Ok(hb) => {
                if now_millis - hb.unix_millis <= stale_millis {
                    if !names.contains(&hb.instance) {
                        names.push(hb.instance);
                    }
                } else {
                    debug!(instance = %hb.instance, "stale heartbeat ignored");
                }
            }
            Err(_) => continue,
        }
    }
    names.sort();
    Ok(ActiveInstances { names })
}
