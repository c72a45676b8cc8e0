//! CLI / configuration surface (SPEC_FULL.md §1.3).

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// `omsd` — one peer instance of the filesystem-coordinated job scheduler.
#[derive(Debug, Parser)]
#[command(name = "omsd", version, about)]
pub struct Cli {
    /// Shared rendezvous directory all peer instances read and write.
    #[arg(long, env = "OMS_JOB_DIR")]
    pub job_control_dir: PathBuf,

    /// This instance's short name. Defaults to `_<port>` per the glossary
    /// ("typically derived from its listen port").
    #[arg(long, env = "OMS_NAME")]
    pub instance_name: Option<String>,

    /// Address the HTTP submission surface listens on.
    #[arg(long, env = "OMS_LISTEN", default_value = "127.0.0.1:4040")]
    pub http_addr: SocketAddr,

    /// Directory holding model binaries/data that `OM_USER_FILES` resolves to.
    #[arg(long, env = "OMS_USER_FILES_DIR")]
    pub user_files_dir: PathBuf,

    /// Compute-server `.ini` configuration (spec §6).
    #[arg(long, env = "OMS_COMPUTE_INI")]
    pub compute_ini: PathBuf,

    /// Disk-use `.ini` configuration (spec §6).
    #[arg(long, env = "OMS_DISK_INI")]
    pub disk_ini: PathBuf,

    /// Main scan-loop period. Default landing the heartbeat's "every
    /// seventh cycle" bump (spec §4.2) near 8s, per DESIGN.md.
    #[arg(long, env = "OMS_SCAN_INTERVAL_MS", default_value_t = 1100)]
    pub scan_interval_ms: u64,
}

/// Resolved configuration derived from [`Cli`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub job_control_dir: PathBuf,
    pub instance_name: String,
    pub http_addr: SocketAddr,
    pub user_files_dir: PathBuf,
    pub compute_ini: PathBuf,
    pub disk_ini: PathBuf,
    pub scan_interval_ms: u64,
}

impl From<Cli> for AppConfig {
    fn from(cli: Cli) -> Self {
        let instance_name = cli
            .instance_name
            .unwrap_or_else(|| format!("_{}", cli.http_addr.port()));
        AppConfig {
            job_control_dir: cli.job_control_dir,
            instance_name,
            http_addr: cli.http_addr,
            user_files_dir: cli.user_files_dir,
            compute_ini: cli.compute_ini,
            disk_ini: cli.disk_ini,
            scan_interval_ms: cli.scan_interval_ms,
        }
    }
}
