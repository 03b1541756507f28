//! Subcommand implementations.
//!
//! Every command runs in-process against the registry file. Commands that
//! mutate the registry hold the process-wide lock file for their duration.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use cvd_protocol::{Response, Status};
use tracing::{info, warn};

use crate::config::Config;
use crate::host_tool::HostToolTargetManager;
use crate::instance_lock::InstanceLockFileManager;
use crate::launch::reset::reset_group;
use crate::launch::{LaunchOrchestrator, LaunchStdio, ProcReaper, StartRequest};
use crate::selector::{DefaultCreationAnalyzer, FindParam, InstanceDatabase};

/// Load a config from an optional path, falling back to defaults.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

/// Take the process-wide advisory lock. The lock is held until the
/// returned file is dropped.
pub fn acquire_process_lock(config: &Config) -> Result<File> {
    let lock_path = &config.registry.lock_file;
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
    let result = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        bail!(
            "Another cvd command is already modifying the instance registry.\n\
             Wait for it to finish, or check: cvd fleet"
        );
    }
    Ok(lock_file)
}

async fn open_database(config: &Config) -> Result<Arc<InstanceDatabase>> {
    let db = InstanceDatabase::open(&config.registry.state_file)
        .await
        .with_context(|| format!("opening registry {}", config.registry.state_file.display()))?;
    Ok(Arc::new(db))
}

fn lock_manager(config: &Config) -> Arc<InstanceLockFileManager> {
    Arc::new(InstanceLockFileManager::new(
        config.instances.lock_dir.clone(),
        config.instances.max_instance_id,
    ))
}

fn print_response(response: &Response) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

/// Options of `cvd start`.
pub struct StartOptions {
    pub args: Vec<String>,
    pub group_name: Option<String>,
    pub instance_names: Option<String>,
}

/// Run `cvd start`. The JSON response goes to stdout. Returns `Err` when
/// the group did not start.
pub async fn run_start(config: &Config, options: StartOptions) -> Result<()> {
    let _lock = acquire_process_lock(config)?;
    let db = open_database(config).await?;
    let system_home = config.system_home()?;

    let analyzer = DefaultCreationAnalyzer::new(
        lock_manager(config),
        config.launch.default_group_name.clone(),
        config.instances.home_root.clone(),
        system_home.clone(),
    );
    let orchestrator = LaunchOrchestrator::new(
        db,
        Arc::new(analyzer),
        Arc::new(HostToolTargetManager::new()),
        Arc::new(ProcReaper::default()),
        config.instances.legacy_dir.clone(),
        system_home,
    );

    let mut selector_args = Vec::new();
    if let Some(name) = options.group_name {
        selector_args.push(format!("--group_name={}", name));
    }
    if let Some(names) = options.instance_names {
        selector_args.push(format!("--instance_name={}", names));
    }
    let envs: BTreeMap<String, String> = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();
    let request = StartRequest {
        args: options.args,
        envs,
        selector_args,
        working_dir: std::env::current_dir().context("reading working directory")?,
        stdio: LaunchStdio::Inherit,
    };

    let response = match orchestrator.start(request).await {
        Ok(outcome) => {
            info!(state = %outcome.state, status = %outcome.response.status, "start finished");
            outcome.response
        }
        Err(e) => Response::with_status(Status::FailedPrecondition, format!("{:#}", e)),
    };
    print_response(&response)?;
    if !response.status.is_ok() {
        bail!("cvd start failed: {}", response.status);
    }
    Ok(())
}

/// Run `cvd fleet`: list every group and its devices.
pub async fn run_fleet(config: &Config, json: bool) -> Result<()> {
    let db = open_database(config).await?;
    if json {
        println!("{}", db.to_snapshot().await?);
        return Ok(());
    }

    let groups = db.instance_groups().await;
    println!("Registry: {}", db.path().display());
    println!("Groups: {}", groups.len());
    for group in &groups {
        let started = match group.start_time() {
            Some(t) => format_age((Utc::now() - t).to_std().unwrap_or_default()),
            None => "start time unknown".to_string(),
        };
        println!(
            "\n  {}  (home: {}, {})",
            group.group_name(),
            group.home_dir().display(),
            started
        );
        for instance in group.instances() {
            println!(
                "    {:<24}  id={:<4}  {}",
                instance.device_name(),
                instance.id(),
                instance.internal_device_name()
            );
        }
    }
    Ok(())
}

/// Split `field=value` query arguments.
fn parse_queries(fields: &[String]) -> Result<Vec<(String, String)>> {
    fields
        .iter()
        .map(|f| match f.split_once('=') {
            Some((k, v)) => Ok((k.to_string(), v.to_string())),
            None => bail!("query must be field=value, got: {}", f),
        })
        .collect()
}

/// Run `cvd find`: print the devices matching every given field.
pub async fn run_find(config: &Config, fields: &[String]) -> Result<()> {
    let param = FindParam::from_queries(parse_queries(fields)?)?;
    let db = open_database(config).await?;
    let instances = db.find_instances(&param).await;
    if instances.is_empty() {
        bail!("no instance matches the query");
    }
    for instance in instances {
        println!("{}\t{}", instance.device_name(), instance.id());
    }
    Ok(())
}

/// Run `cvd clear`: forget every group, free its instance ids and kill
/// whatever its devices left running.
pub async fn run_clear(config: &Config) -> Result<()> {
    let _lock = acquire_process_lock(config)?;
    let db = open_database(config).await?;
    let locks = lock_manager(config);
    let reaper = ProcReaper::default();

    let removed = db.clear().await?;
    for group in &removed {
        let ids: Vec<u32> = group.instances().iter().map(|i| i.id()).collect();
        let reset = reset_group(&reaper, &ids);
        if !reset.status.is_ok() {
            warn!(group = %group.group_name(), "{}", reset.message.trim());
        }
        for id in ids {
            if let Err(e) = locks.release(id) {
                warn!(id, error = %e, "failed to release instance lock");
            }
        }
    }
    println!("Removed {} group{}", removed.len(), if removed.len() == 1 { "" } else { "s" });
    Ok(())
}

/// Run `cvd import`: append the groups of a JSON snapshot.
pub async fn run_import(config: &Config, file: &Path) -> Result<()> {
    let _lock = acquire_process_lock(config)?;
    let serialized = std::fs::read_to_string(file)
        .with_context(|| format!("reading snapshot {}", file.display()))?;
    let db = open_database(config).await?;
    let count = db.load_from_snapshot(&serialized).await?;
    println!("Imported {} group{}", count, if count == 1 { "" } else { "s" });
    Ok(())
}

/// Run `cvd translator`: record whether legacy commands may be translated.
pub async fn run_translator(config: &Config, opt_out: bool) -> Result<()> {
    let _lock = acquire_process_lock(config)?;
    let db = open_database(config).await?;
    db.set_acloud_translator_optout(opt_out).await?;
    println!(
        "acloud translation {}",
        if opt_out { "disabled" } else { "enabled" }
    );
    Ok(())
}

/// Run `cvd try-acloud`. Fails when the user opted out of translation.
pub async fn run_try_acloud(config: &Config) -> Result<()> {
    let db = open_database(config).await?;
    if db.acloud_translator_optout().await {
        bail!("acloud translation is disabled. Enable it with: cvd translator --opt-in");
    }
    println!("acloud translation is enabled");
    Ok(())
}

/// How long ago a group started, in its largest whole unit.
fn format_age(age: std::time::Duration) -> String {
    const UNITS: [(u64, &str); 4] = [(86400, "day"), (3600, "hour"), (60, "minute"), (1, "second")];
    let secs = age.as_secs();
    let (size, unit) = UNITS
        .iter()
        .copied()
        .find(|(size, _)| secs >= *size)
        .unwrap_or((1, "second"));
    let n = secs / size;
    format!("started {} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}
