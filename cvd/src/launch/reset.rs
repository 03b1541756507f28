//! Forceful cleanup of device processes after a failed launch.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use cvd_protocol::{Response, Status};
use tracing::{debug, info, warn};

use super::args::{CUTTLEFISH_INSTANCE_ENV, STARTED_BY_CVD_ENV};

pub const COLLECTOR_FAILURE: &str = r#"
  Consider running:
     cvd reset -y

  cvd start failed. While we should collect run_cvd processes to manually
  clean them up, collecting run_cvd failed.
"#;

pub const STOP_FAILURE: &str = r#"
  Consider running:
     cvd reset -y

  cvd start failed, and stopping run_cvd processes failed.
"#;

/// Finds and kills processes left behind by a group's launch.
pub trait ProcessReaper: Send + Sync {
    /// Pids of processes that belong to any of `instance_ids`.
    fn collect(&self, instance_ids: &[u32]) -> Result<Vec<i32>>;

    fn stop(&self, pids: &[i32]) -> Result<()>;
}

/// Reaper that scans `/proc` for processes started by cvd, recognized by
/// `_STARTED_BY_CVD_SERVER_=true` and `CUTTLEFISH_INSTANCE=<id>` in their
/// environment.
pub struct ProcReaper {
    proc_root: PathBuf,
}

impl Default for ProcReaper {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcReaper {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Instance id of a cvd-launched process. Processes without the cvd
    /// marker yield `None` even if they carry an instance id.
    fn instance_of(environ: &[u8]) -> Option<u32> {
        let instance_prefix = format!("{}=", CUTTLEFISH_INSTANCE_ENV);
        let marker = format!("{}=true", STARTED_BY_CVD_ENV);
        let mut started_by_cvd = false;
        let mut instance = None;
        for entry in environ
            .split(|b| *b == 0)
            .filter_map(|entry| std::str::from_utf8(entry).ok())
        {
            if entry == marker {
                started_by_cvd = true;
            } else if let Some(id) = entry.strip_prefix(instance_prefix.as_str()) {
                instance = id.parse().ok();
            }
        }
        instance.filter(|_| started_by_cvd)
    }

    fn read_environ(dir: &Path) -> Option<Vec<u8>> {
        std::fs::read(dir.join("environ")).ok()
    }
}

impl ProcessReaper for ProcReaper {
    fn collect(&self, instance_ids: &[u32]) -> Result<Vec<i32>> {
        let own_pid = std::process::id() as i32;
        let entries = std::fs::read_dir(&self.proc_root)
            .with_context(|| format!("reading {}", self.proc_root.display()))?;

        let mut pids = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "error reading process table entry");
                    continue;
                }
            };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            // Processes of other users or already gone are skipped.
            let Some(environ) = Self::read_environ(&entry.path()) else {
                continue;
            };
            if let Some(id) = Self::instance_of(&environ) {
                if instance_ids.contains(&id) {
                    debug!(pid, instance = id, "found device process");
                    pids.push(pid);
                }
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    fn stop(&self, pids: &[i32]) -> Result<()> {
        let mut failed = Vec::new();
        for &pid in pids {
            warn!(pid, "force-killing device process");
            if unsafe { libc::kill(pid, libc::SIGKILL) } != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!(pid, error = %err, "failed to kill device process");
                    failed.push(pid);
                }
            }
        }
        if !failed.is_empty() {
            bail!("failed to kill processes: {:?}", failed);
        }
        Ok(())
    }
}

/// Best-effort kill of whatever a failed launch left running. The response
/// is OK when cleanup succeeded, otherwise it carries one of the two
/// diagnostics.
pub fn reset_group(reaper: &dyn ProcessReaper, instance_ids: &[u32]) -> Response {
    let pids = match reaper.collect(instance_ids) {
        Ok(pids) => pids,
        Err(e) => {
            warn!(error = %e, "collecting device processes failed");
            return Response::with_status(Status::Internal, COLLECTOR_FAILURE);
        }
    };
    if pids.is_empty() {
        return Response::ok();
    }
    if let Err(e) = reaper.stop(&pids) {
        warn!(error = %e, "stopping device processes failed");
        return Response::with_status(Status::Internal, STOP_FAILURE);
    }
    info!(count = pids.len(), "stopped leftover device processes");
    Response::ok()
}
