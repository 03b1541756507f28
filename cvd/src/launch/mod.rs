//! Launching a new instance group.
//!
//! [`LaunchOrchestrator::start`] walks one group through
//! `Requested -> GroupAllocated -> Registered -> ProcessStarted` and ends in
//! `Finalized` or `RolledBack`. Once a group is registered it either ends up
//! finalized with its locks marked in use, or removed from the registry.

pub mod args;
pub mod command;
pub mod compat;
pub mod reset;
pub mod signals;
pub mod waiter;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use cvd_protocol::{Response, Status};
use tracing::{debug, error, info, instrument, warn};

use crate::host_tool::HostToolProber;
use crate::instance_lock::InUseState;
use crate::selector::{CreationParams, GroupCreationAnalyzer, GroupCreationInfo, InstanceDatabase};
use crate::util::absolute_path;

use self::args::{
    consume_daemon_flag, is_help_request, ArgEnvNormalizer, ANDROID_HOST_OUT_ENV, HOME_ENV,
};
pub use self::command::{LaunchCommand, LaunchStdio};
pub use self::reset::{ProcReaper, ProcessReaper};
use self::signals::SignalBridge;
use self::waiter::{SubprocessWaiter, WaitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Requested,
    GroupAllocated,
    Registered,
    ProcessStarted,
    Finalized,
    RolledBack,
}

impl fmt::Display for LaunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LaunchState::Requested => "requested",
            LaunchState::GroupAllocated => "group_allocated",
            LaunchState::Registered => "registered",
            LaunchState::ProcessStarted => "process_started",
            LaunchState::Finalized => "finalized",
            LaunchState::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// A caller's request to start a new group.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Arguments for the start binary.
    pub args: Vec<String>,
    /// The caller's environment. Only this is passed on.
    pub envs: BTreeMap<String, String>,
    pub selector_args: Vec<String>,
    /// The caller's working directory. Relative `HOME` values resolve here.
    pub working_dir: PathBuf,
    pub stdio: LaunchStdio,
}

#[derive(Debug)]
pub struct LaunchOutcome {
    pub state: LaunchState,
    pub response: Response,
}

pub struct LaunchOrchestrator {
    db: Arc<InstanceDatabase>,
    analyzer: Arc<dyn GroupCreationAnalyzer>,
    prober: Arc<dyn HostToolProber>,
    reaper: Arc<dyn ProcessReaper>,
    legacy_dir: PathBuf,
    system_home: PathBuf,
}

fn advance(state: &mut LaunchState, next: LaunchState, group: &str) {
    debug!(group, from = %state, to = %next, "launch state changed");
    *state = next;
}

/// Drop an empty `HOME`, reject `~` and make a relative one absolute.
fn normalize_home(envs: &mut BTreeMap<String, String>, working_dir: &Path) -> Result<()> {
    let Some(home) = envs.get(HOME_ENV).cloned() else {
        return Ok(());
    };
    if home.is_empty() {
        envs.remove(HOME_ENV);
        return Ok(());
    }
    ensure!(!home.starts_with('~'), "the HOME directory should not start with ~");
    let resolved = absolute_path(working_dir, Path::new(&home));
    envs.insert(HOME_ENV.to_string(), resolved.display().to_string());
    Ok(())
}

impl LaunchOrchestrator {
    pub fn new(
        db: Arc<InstanceDatabase>,
        analyzer: Arc<dyn GroupCreationAnalyzer>,
        prober: Arc<dyn HostToolProber>,
        reaper: Arc<dyn ProcessReaper>,
        legacy_dir: impl Into<PathBuf>,
        system_home: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            analyzer,
            prober,
            reaper,
            legacy_dir: legacy_dir.into(),
            system_home: system_home.into(),
        }
    }

    /// Start a new group.
    ///
    /// Errors are returned only for requests rejected before registration.
    /// Anything that goes wrong afterwards is reported in the outcome's
    /// response, with the group already rolled back.
    #[instrument(skip(self, request), fields(args = ?request.args))]
    pub async fn start(&self, request: StartRequest) -> Result<LaunchOutcome> {
        let mut state = LaunchState::Requested;
        let StartRequest {
            mut args,
            mut envs,
            selector_args,
            working_dir,
            stdio,
        } = request;

        normalize_home(&mut envs, &working_dir)?;
        let Some(host_out) = envs.get(ANDROID_HOST_OUT_ENV).map(PathBuf::from) else {
            bail!("{} is not set", ANDROID_HOST_OUT_ENV);
        };
        let bin = self
            .prober
            .exec_base_name(&host_out)
            .context("finding the start binary")?;

        let is_help = is_help_request(&args);
        consume_daemon_flag(&mut args)?;
        args.push("--daemon=true".to_string());

        if is_help {
            let command = LaunchCommand {
                binary: host_out.join("bin").join(&bin),
                args,
                envs,
                working_dir: Some(working_dir),
                stdio,
            };
            return self.run_help(command).await;
        }

        let existing_group_names = self
            .db
            .instance_groups()
            .await
            .into_iter()
            .map(|g| g.group_name().to_string())
            .collect();
        let params = CreationParams {
            args,
            envs,
            selector_args,
            existing_group_names,
        };
        let mut info = self.analyzer.analyze(&params)?;
        ArgEnvNormalizer::new(self.prober.as_ref()).normalize(&mut info)?;
        advance(&mut state, LaunchState::GroupAllocated, &info.group_name);

        self.db
            .add_instance_group(info.to_record())
            .await
            .with_context(|| {
                format!(
                    "{} is already taken so can't create new instance",
                    info.home.display()
                )
            })?;
        advance(&mut state, LaunchState::Registered, &info.group_name);

        let command = LaunchCommand {
            binary: info.host_artifacts_path.join("bin").join(&bin),
            args: info.args.clone(),
            envs: info.envs.clone(),
            working_dir: Some(working_dir),
            stdio,
        };
        info!(group = %info.group_name, command = %command.command_line(), "launching device group");

        let waiter = SubprocessWaiter::new();
        let bridge = match SignalBridge::enable(waiter.clone()) {
            Ok(bridge) => bridge,
            Err(e) => return Ok(self.roll_back(&info, &mut state, false, failure(&e)).await),
        };

        let mut child = match command.to_tokio_command().spawn() {
            Ok(child) => child,
            Err(e) => {
                bridge.disable();
                let e = anyhow::Error::new(e)
                    .context(format!("failed to start {}", command.binary.display()));
                return Ok(self.roll_back(&info, &mut state, false, failure(&e)).await);
            }
        };
        advance(&mut state, LaunchState::ProcessStarted, &info.group_name);

        if let Err(e) = compat::acloud_compat_actions(&info, &self.legacy_dir).await {
            error!(group = %info.group_name, error = %format!("{:#}", e), "legacy compatibility actions failed, continuing");
        }

        let waited = waiter.wait(&mut child).await;
        bridge.disable();

        let response = match waited {
            Ok(WaitOutcome::Exited(status)) if status.success() => {
                return Ok(self.finalize(&info, &mut state).await);
            }
            Ok(WaitOutcome::Exited(status)) => {
                warn!(group = %info.group_name, ?status, "device launch failed, cleaning up");
                Response::from_exit_code(status.code())
            }
            Ok(WaitOutcome::Interrupted) => {
                warn!(group = %info.group_name, "device launch interrupted, cleaning up");
                Response::with_status(Status::Cancelled, "launch was interrupted")
            }
            Err(e) => failure(&e),
        };
        Ok(self.roll_back(&info, &mut state, true, response).await)
    }

    async fn run_help(&self, command: LaunchCommand) -> Result<LaunchOutcome> {
        info!(command = %command.command_line(), "showing start binary help");
        let status = command
            .to_tokio_command()
            .status()
            .await
            .with_context(|| format!("running {}", command.binary.display()))?;
        Ok(LaunchOutcome {
            state: LaunchState::Requested,
            response: Response::from_exit_code(status.code()),
        })
    }

    async fn finalize(&self, info: &GroupCreationInfo, state: &mut LaunchState) -> LaunchOutcome {
        if info.is_default_group {
            if let Err(e) = compat::create_default_group_symlinks(info, &self.system_home).await {
                error!(group = %info.group_name, error = %format!("{:#}", e), "failed to create symlinks for default group");
            }
        }
        // The group outlives this process, so the locks must not read as
        // free once the handles are dropped.
        info.mark_lockfiles(InUseState::InUse);
        advance(state, LaunchState::Finalized, &info.group_name);
        info!(group = %info.group_name, home = %info.home.display(), "device group started");
        LaunchOutcome {
            state: *state,
            response: Response::ok().with_group(info.group_info()),
        }
    }

    /// Kill leftovers when `reap` is set, then drop the group from the
    /// registry. A cleanup diagnostic replaces `response`.
    async fn roll_back(
        &self,
        info: &GroupCreationInfo,
        state: &mut LaunchState,
        reap: bool,
        mut response: Response,
    ) -> LaunchOutcome {
        if reap {
            let reaper = Arc::clone(&self.reaper);
            let ids = info.instance_ids();
            let reset = tokio::task::spawn_blocking(move || reset::reset_group(reaper.as_ref(), &ids))
                .await
                .unwrap_or_else(|e| {
                    error!(error = %e, "process cleanup task failed");
                    Response::with_status(Status::Internal, reset::COLLECTOR_FAILURE)
                });
            if !reset.status.is_ok() {
                response = reset;
            }
        }

        match self.db.remove_instance_group(&info.group_name).await {
            Ok(true) => {}
            Ok(false) => warn!(group = %info.group_name, "group was already gone from the registry"),
            Err(e) => error!(group = %info.group_name, error = %e, "failed to remove group from the registry"),
        }
        advance(state, LaunchState::RolledBack, &info.group_name);
        LaunchOutcome {
            state: *state,
            response,
        }
    }
}

fn failure(e: &anyhow::Error) -> Response {
    Response::with_status(Status::Internal, format!("{:#}", e))
}
