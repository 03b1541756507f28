//! Capability probing of the host tools shipped in an artifacts directory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Preferred start binary, newest first.
const START_BINARIES: &[&str] = &["cvd_internal_start", "launch_cvd"];

/// Answers which start binary an artifacts directory ships and which
/// flags it accepts.
pub trait HostToolProber: Send + Sync {
    /// Base name of the start binary under `<artifacts>/bin`.
    fn exec_base_name(&self, artifacts_path: &Path) -> Result<String>;

    /// Whether the start binary accepts `--<flag>`.
    fn supports_flag(&self, artifacts_path: &Path, flag: &str) -> bool;
}

/// Probes by running `<bin> --helpxml` once per binary and caching the
/// flag names it reports.
#[derive(Default)]
pub struct HostToolTargetManager {
    flags: Mutex<HashMap<PathBuf, Arc<HashSet<String>>>>,
}

impl HostToolTargetManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn flags_of(&self, bin_path: &Path) -> Result<Arc<HashSet<String>>> {
        if let Some(cached) = self
            .flags
            .lock()
            .ok()
            .and_then(|cache| cache.get(bin_path).cloned())
        {
            return Ok(cached);
        }

        // gflags binaries exit non-zero after printing --helpxml, so only
        // the output is inspected.
        let output = std::process::Command::new(bin_path)
            .arg("--helpxml")
            .stdin(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .output()
            .with_context(|| format!("running {} --helpxml", bin_path.display()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let flags = Arc::new(parse_helpxml_flag_names(&stdout));
        debug!(bin = %bin_path.display(), count = flags.len(), "read host tool flags");

        if let Ok(mut cache) = self.flags.lock() {
            cache.insert(bin_path.to_path_buf(), flags.clone());
        }
        Ok(flags)
    }
}

impl HostToolProber for HostToolTargetManager {
    fn exec_base_name(&self, artifacts_path: &Path) -> Result<String> {
        let bin_dir = artifacts_path.join("bin");
        for name in START_BINARIES {
            if bin_dir.join(name).is_file() {
                return Ok((*name).to_string());
            }
        }
        bail!(
            "no start binary ({}) found in {}",
            START_BINARIES.join(", "),
            bin_dir.display()
        )
    }

    fn supports_flag(&self, artifacts_path: &Path, flag: &str) -> bool {
        let bin = match self.exec_base_name(artifacts_path) {
            Ok(bin) => bin,
            Err(e) => {
                warn!(error = %e, flag, "cannot probe flag support");
                return false;
            }
        };
        match self.flags_of(&artifacts_path.join("bin").join(bin)) {
            Ok(flags) => flags.contains(flag),
            Err(e) => {
                warn!(error = %e, flag, "cannot probe flag support");
                false
            }
        }
    }
}

/// Collect the text of every `<name>...</name>` element.
fn parse_helpxml_flag_names(xml: &str) -> HashSet<String> {
    const OPEN: &str = "<name>";
    const CLOSE: &str = "</name>";

    let mut names = HashSet::new();
    let mut rest = xml;
    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else {
            break;
        };
        let name = after[..end].trim();
        if !name.is_empty() {
            names.insert(name.to_string());
        }
        rest = &after[end + CLOSE.len()..];
    }
    names
}
