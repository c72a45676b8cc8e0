//! Launch construction (spec §4.5 steps 2–4, §6 forced/forbidden args).
//!
//! Two strategies per the redesign flag in spec §9 ("External process
//! launcher... model as a strategy interface with implementations `direct`
//! and `via-external-command`"): [`build_direct_launch`] runs the model
//! executable directly; [`build_templated_launch`] renders an MPI launch
//! command line through a `handlebars` template, as the teacher's root
//! `Cargo.toml` already pulls in `handlebars` for template rendering.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{SchedError, SchedResult};
use crate::job::RunJob;
use crate::planner::ServerAllocation;
use crate::stamp::Stamp;

/// User-supplied option keys this core always forces itself, so a caller
/// attempting to set them is rejected (spec §6).
pub const FORBIDDEN_OPTIONS: &[&str] = &[
    "-OpenM.Threads",
    "-OpenM.LogToConsole",
    "-OpenM.LogToFile",
    "-OpenM.LogFilePath",
    "-OpenM.NotOnRoot",
    "-OpenM.Database",
    "-db",
    "-OpenM.Sqlite",
    "-OpenM.SqliteFromBin",
    "-Microdata.All",
    "-Microdata.ToDb",
    "-Microdata.UseInternal",
];

/// Option keys whose value is a filesystem path and must stay local to the
/// configured root, with `OM_USER_FILES` substitution applied (spec §6).
pub const PATH_OPTIONS: &[&str] = &["-OpenM.iniFile", "-ini", "-OpenM.ParamDir", "-p", "-Microdata.CsvDir"];

fn is_forbidden(key: &str) -> bool {
    FORBIDDEN_OPTIONS.contains(&key) || key.starts_with("-ImportDb.")
}

/// Substitute the `OM_USER_FILES` token — bare, `${OM_USER_FILES}`, or
/// `%OM_USER_FILES%` — with the configured user-files directory.
pub fn substitute_user_files(value: &str, user_files_dir: &Path) -> String {
    let replacement = user_files_dir.display().to_string();
    value
        .replace("${OM_USER_FILES}", &replacement)
        .replace("%OM_USER_FILES%", &replacement)
        .replace("OM_USER_FILES", &replacement)
}

/// Reject any path option that would escape the configured root via `..`.
pub fn validate_local_path(value: &str) -> SchedResult<String> {
    if Path::new(value).components().any(|c| c == Component::ParentDir) {
        return Err(SchedError::MalformedJob(format!("path option escapes root: {value}")));
    }
    Ok(value.to_string())
}

/// The assembled launch: an executable path, its arguments, and an optional
/// supplemental `.ini` file (table retention / microdata / run notes) that
/// must be written alongside the job before the process starts.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub command_path: String,
    pub args: Vec<String>,
    pub ini_file: Option<(PathBuf, String)>,
}

fn forced_args(job: &RunJob, run_stamp: &Stamp) -> Vec<String> {
    let mut args = vec![
        format!("-OpenM.RunStamp={run_stamp}"),
        "-OpenM.LogToConsole=true".to_string(),
        "-OpenM.LogToFile=false".to_string(),
    ];
    if job.threads_per_process > 1 {
        args.push(format!("-OpenM.Threads={}", job.threads_per_process));
    }
    if job.not_on_mpi_root {
        args.push("-OpenM.NotOnRoot".to_string());
    }
    args
}

fn user_args(job: &RunJob, user_files_dir: &Path) -> SchedResult<Vec<String>> {
    let mut args = Vec::with_capacity(job.options.len());
    // HashMap iteration order is unspecified; sort by key so the constructed
    // command line is stable across cycles (useful for logs and for tests).
    let mut keys: Vec<&String> = job.options.keys().collect();
    keys.sort();
    for key in keys {
        if is_forbidden(key) {
            return Err(SchedError::MalformedJob(format!("forbidden option {key}")));
        }
        let raw = &job.options[key];
        let value = if PATH_OPTIONS.contains(&key.as_str()) {
            validate_local_path(&substitute_user_files(raw, user_files_dir))?
        } else {
            raw.clone()
        };
        args.push(format!("{key}={value}"));
    }
    Ok(args)
}

/// Build the `.ini` file carrying table-retention, microdata selection, and
/// run notes, when the job requests any of the three (spec §4.5 step 2).
fn build_supplemental_ini(job: &RunJob, run_stamp: &Stamp) -> SchedResult<Option<(PathBuf, String)>> {
    if job.table_retention.is_empty() && job.microdata.is_empty() && job.run_notes.is_empty() {
        return Ok(None);
    }
    let mut ini = ini::Ini::new();
    if !job.table_retention.is_empty() {
        ini.with_section(Some("TableRetention")).set("Tables", job.table_retention.join(","));
    }
    if !job.microdata.is_empty() {
        ini.with_section(Some("Microdata")).set("Entities", job.microdata.join(","));
    }
    if !job.run_notes.is_empty() {
        let section = ini.with_section(Some("RunNotes"));
        let mut langs: Vec<&String> = job.run_notes.keys().collect();
        langs.sort();
        for lang in langs {
            section.set(lang.as_str(), job.run_notes[lang].as_str());
        }
    }
    let mut buf = Vec::new();
    ini.write_to(&mut buf).map_err(|e| SchedError::TemplateRender {
        job: run_stamp.to_string(),
        message: e.to_string(),
    })?;
    let content = String::from_utf8_lossy(&buf).into_owned();
    let path = Path::new(&job.working_dir).join(format!("{run_stamp}.ini"));
    Ok(Some((path, content)))
}

/// Direct strategy: run `<workingDir>/<modelName>` with its arguments
/// assembled directly (spec §4.5 step 2 "Direct").
pub fn build_direct_launch(job: &RunJob, run_stamp: &Stamp, user_files_dir: &Path) -> SchedResult<LaunchPlan> {
    let exe = Path::new(&job.working_dir).join(&job.model_name);
    let mut args = forced_args(job, run_stamp);
    args.extend(user_args(job, user_files_dir)?);
    Ok(LaunchPlan {
        command_path: exe.display().to_string(),
        args,
        ini_file: build_supplemental_ini(job, run_stamp)?,
    })
}

#[derive(Debug, Clone, Serialize)]
struct TemplateContext {
    model_name: String,
    exe_stem: String,
    dir: String,
    bin_dir: String,
    db_path: String,
    mpi_np: u32,
    host_file: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

/// Templated (MPI) strategy: render `template_source` and split its output
/// into an executable (first non-blank line) and arguments (the rest),
/// per spec §4.5 step 2 "Templated (MPI)".
pub fn build_templated_launch(
    template_source: &str,
    job: &RunJob,
    run_stamp: &Stamp,
    user_files_dir: &Path,
    mpi_np: u32,
    host_file: &Path,
    bin_dir: &str,
    db_path: &str,
) -> SchedResult<LaunchPlan> {
    let mut args = forced_args(job, run_stamp);
    args.extend(user_args(job, user_files_dir)?);

    let ctx = TemplateContext {
        model_name: job.model_name.clone(),
        exe_stem: job.model_name.clone(),
        dir: job.working_dir.clone(),
        bin_dir: bin_dir.to_string(),
        db_path: db_path.to_string(),
        mpi_np,
        host_file: host_file.display().to_string(),
        args,
        env: job.env.clone(),
    };

    let hb = Handlebars::new();
    let rendered = hb.render_template(template_source, &ctx).map_err(|e| SchedError::TemplateRender {
        job: run_stamp.to_string(),
        message: e.to_string(),
    })?;

    let mut lines = rendered.lines().map(str::trim).filter(|l| !l.is_empty());
    let exe = lines
        .next()
        .ok_or_else(|| SchedError::TemplateRender {
            job: run_stamp.to_string(),
            message: "empty rendering".to_string(),
        })?
        .to_string();
    let rest: Vec<String> = lines.map(str::to_string).collect();

    Ok(LaunchPlan {
        command_path: exe,
        args: rest,
        ini_file: build_supplemental_ini(job, run_stamp)?,
    })
}

/// Render an MPI hostfile listing the chosen servers with their allocated
/// core counts (spec §4.5 step 2 "generate a hostfile").
pub fn render_hostfile(root_line: Option<&str>, host_line: Option<&str>, allocations: &[ServerAllocation]) -> String {
    let mut out = String::new();
    if let Some(root) = root_line {
        out.push_str(root);
        out.push('\n');
    }
    let template = host_line.unwrap_or("{host} slots={cores}");
    for alloc in allocations {
        out.push_str(&template.replace("{host}", &alloc.server).replace("{cores}", &alloc.cpu.to_string()));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn base_job() -> RunJob {
        RunJob {
            sub_stamp: Stamp::parse("2022_08_17_10_00_00_000").unwrap(),
            run_stamp: None,
            instance: "_4040".to_string(),
            model_name: "modelOne".to_string(),
            model_digest: "D".to_string(),
            run_name: "run".to_string(),
            working_dir: "/models/modelOne".to_string(),
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

    #[test]
    fn direct_launch_forces_required_args() {
        let job = base_job();
        let run_stamp = Stamp::parse("2022_08_17_10_00_05_000").unwrap();
        let plan = build_direct_launch(&job, &run_stamp, Path::new("/files")).unwrap();
        assert_eq!(plan.command_path, "/models/modelOne/modelOne");
        assert!(plan.args.contains(&"-OpenM.RunStamp=2022_08_17_10_00_05_000".to_string()));
        assert!(plan.args.contains(&"-OpenM.LogToConsole=true".to_string()));
        assert!(plan.args.contains(&"-OpenM.LogToFile=false".to_string()));
    }

    #[test]
    fn threads_option_added_only_when_greater_than_one() {
        let mut job = base_job();
        let run_stamp = Stamp::now();
        job.threads_per_process = 1;
        let plan = build_direct_launch(&job, &run_stamp, Path::new("/files")).unwrap();
        assert!(!plan.args.iter().any(|a| a.starts_with("-OpenM.Threads")));

        job.threads_per_process = 4;
        let plan = build_direct_launch(&job, &run_stamp, Path::new("/files")).unwrap();
        assert!(plan.args.contains(&"-OpenM.Threads=4".to_string()));
    }

    #[test]
    fn forbidden_option_is_rejected() {
        let mut job = base_job();
        job.options.insert("-OpenM.Threads".to_string(), "8".to_string());
        let run_stamp = Stamp::now();
        let err = build_direct_launch(&job, &run_stamp, Path::new("/files")).unwrap_err();
        assert!(matches!(err, SchedError::MalformedJob(_)));
    }

    #[test]
    fn import_db_wildcard_is_rejected() {
        let mut job = base_job();
        job.options.insert("-ImportDb.Source".to_string(), "x".to_string());
        let run_stamp = Stamp::now();
        assert!(build_direct_launch(&job, &run_stamp, Path::new("/files")).is_err());
    }

    #[test]
    fn user_files_token_is_substituted() {
        let mut job = base_job();
        job.options.insert("-ini".to_string(), "${OM_USER_FILES}/run.ini".to_string());
        let run_stamp = Stamp::now();
        let plan = build_direct_launch(&job, &run_stamp, Path::new("/srv/files")).unwrap();
        assert!(plan.args.iter().any(|a| a == "-ini=/srv/files/run.ini"));
    }

    #[test]
    fn path_option_escaping_root_is_rejected() {
        let mut job = base_job();
        job.options.insert("-p".to_string(), "../../etc/passwd".to_string());
        let run_stamp = Stamp::now();
        assert!(build_direct_launch(&job, &run_stamp, Path::new("/srv/files")).is_err());
    }

    #[test]
    fn supplemental_ini_written_when_run_notes_present() {
        let mut job = base_job();
        job.run_notes.insert("EN".to_string(), "note text".to_string());
        let run_stamp = Stamp::parse("2022_08_17_10_00_05_000").unwrap();
        let plan = build_direct_launch(&job, &run_stamp, Path::new("/files")).unwrap();
        let (path, content) = plan.ini_file.expect("ini file expected");
        assert_eq!(path, Path::new("/models/modelOne/2022_08_17_10_00_05_000.ini"));
        assert!(content.contains("EN"));
        assert!(content.contains("note text"));
    }

    #[test]
    fn templated_launch_splits_first_line_as_executable() {
        let job = base_job();
        let run_stamp = Stamp::now();
        let template = "mpirun\n-np {{mpi_np}} --hostfile {{host_file}} {{dir}}/{{exe_stem}}\n";
        let plan = build_templated_launch(
            template,
            &job,
            &run_stamp,
            Path::new("/files"),
            4,
            Path::new("/tmp/hostfile"),
            "/bin",
            "/db/modelOne.sqlite",
        )
        .unwrap();
        assert_eq!(plan.command_path, "mpirun");
        assert_eq!(plan.args, vec!["-np 4 --hostfile /tmp/hostfile /models/modelOne/modelOne"]);
    }

    #[test]
    fn templated_launch_rejects_empty_rendering() {
        let job = base_job();
        let run_stamp = Stamp::now();
        let err = build_templated_launch(
            "   \n  \n",
            &job,
            &run_stamp,
            Path::new("/files"),
            1,
            Path::new("/tmp/hostfile"),
            "/bin",
            "/db",
        )
        .unwrap_err();
        assert!(matches!(err, SchedError::TemplateRender { .. }));
    }

    #[test]
    fn hostfile_renders_one_line_per_allocation() {
        let allocations = vec![
            ServerAllocation {
                server: "s1".to_string(),
                processes: 2,
                cpu: 6,
                mem: 0,
            },
            ServerAllocation {
                server: "s2".to_string(),
                processes: 2,
                cpu: 6,
                mem: 0,
            },
        ];
        let rendered = render_hostfile(None, None, &allocations);
        assert_eq!(rendered, "s1 slots=6\ns2 slots=6\n");
    }
}
