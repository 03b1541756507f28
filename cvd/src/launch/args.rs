//! Argument and environment rewriting for the start binary.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, ensure, Result};
use tracing::debug;

use crate::host_tool::HostToolProber;
use crate::selector::GroupCreationInfo;

pub const INSTANCE_NUMS_FLAG: &str = "instance_nums";
pub const NUM_INSTANCES_FLAG: &str = "num_instances";
pub const BASE_INSTANCE_NUM_FLAG: &str = "base_instance_num";
pub const GROUP_ID_FLAG: &str = "group_id";

pub const HOME_ENV: &str = "HOME";
pub const CUTTLEFISH_INSTANCE_ENV: &str = "CUTTLEFISH_INSTANCE";
pub const ANDROID_HOST_OUT_ENV: &str = "ANDROID_HOST_OUT";
pub const ANDROID_SOONG_HOST_OUT_ENV: &str = "ANDROID_SOONG_HOST_OUT";
pub const ANDROID_PRODUCT_OUT_ENV: &str = "ANDROID_PRODUCT_OUT";
/// Tells the launched tools they run under this control plane.
pub const STARTED_BY_CVD_ENV: &str = "_STARTED_BY_CVD_SERVER_";

const HELP_FLAGS: &[&str] = &[
    "-help", "--help", "-helpxml", "--helpxml", "-helpfull", "--helpfull", "-helpshort",
    "--helpshort",
];

/// Split a gflags-style token into `(name, inline value)`.
fn parse_flag_token(token: &str) -> Option<(&str, Option<&str>)> {
    let body = token
        .strip_prefix("--")
        .or_else(|| token.strip_prefix('-'))?;
    if body.is_empty() {
        return None;
    }
    Some(match body.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (body, None),
    })
}

/// Value of the last `--name=value` / `--name value` occurrence (one or
/// two leading dashes), leaving `args` untouched.
pub fn flag_value(args: &[String], name: &str) -> Option<String> {
    let mut found = None;
    let mut i = 0;
    while i < args.len() {
        if let Some((flag, inline)) = parse_flag_token(&args[i]) {
            if flag == name {
                match inline {
                    Some(v) => found = Some(v.to_string()),
                    None => {
                        found = Some(args.get(i + 1).cloned().unwrap_or_default());
                        i += 1;
                    }
                }
            }
        }
        i += 1;
    }
    found
}

/// Remove every occurrence of flag `name` from `args`, returning the last
/// value seen.
pub fn consume_flag(args: &mut Vec<String>, name: &str) -> Option<String> {
    let mut kept = Vec::with_capacity(args.len());
    let mut found = None;
    let mut iter = std::mem::take(args).into_iter();
    while let Some(arg) = iter.next() {
        match parse_flag_token(&arg) {
            Some((flag, Some(value))) if flag == name => found = Some(value.to_string()),
            Some((flag, None)) if flag == name => found = Some(iter.next().unwrap_or_default()),
            _ => kept.push(arg),
        }
    }
    *args = kept;
    found
}

/// Whether the arguments only ask the start binary for help output.
pub fn is_help_request(args: &[String]) -> bool {
    args.iter().any(|a| HELP_FLAGS.contains(&a.as_str()))
}

/// Strip any caller-supplied daemon flag. Only daemon mode is supported,
/// so `--nodaemon` and false-like values are rejected.
pub fn consume_daemon_flag(args: &mut Vec<String>) -> Result<()> {
    const POSSIBLE_CMDS: &str = "\"cvd start\" or \"launch_cvd\"";
    const TRUE_VALUES: &[&str] = &["y", "yes", "true"];
    const FALSE_VALUES: &[&str] = &["n", "no", "false"];

    let mut kept = Vec::with_capacity(args.len());
    for arg in std::mem::take(args) {
        match parse_flag_token(&arg) {
            Some(("nodaemon", None)) => {
                bail!("--nodaemon is not supported by {}", POSSIBLE_CMDS)
            }
            Some(("daemon", None)) => {}
            Some(("daemon", Some(value))) => {
                ensure!(!value.contains(','), "{} had a comma that is not allowed", value);
                let lower = value.to_ascii_lowercase();
                if FALSE_VALUES.contains(&lower.as_str()) {
                    bail!("\"{}\" was given and is not supported by {}", arg, POSSIBLE_CMDS);
                }
                if !TRUE_VALUES.contains(&lower.as_str()) {
                    bail!(
                        "invalid --daemon option: {}. {} supports only \"--daemon=true\"",
                        arg,
                        POSSIBLE_CMDS
                    );
                }
            }
            _ => kept.push(arg),
        }
    }
    *args = kept;
    Ok(())
}

/// Rewrites a group's launch arguments and environment so the start
/// binary sees exactly the allocated instance ids.
pub struct ArgEnvNormalizer<'a> {
    prober: &'a dyn HostToolProber,
}

impl<'a> ArgEnvNormalizer<'a> {
    pub fn new(prober: &'a dyn HostToolProber) -> Self {
        Self { prober }
    }

    /// Replace the instance id flags and inject the group environment.
    pub fn normalize(&self, info: &mut GroupCreationInfo) -> Result<()> {
        let ids = info.instance_ids();
        let artifacts = info.host_artifacts_path.clone();

        let (args, mut envs) = self.update_instance_args_and_envs(
            std::mem::take(&mut info.args),
            std::mem::take(&mut info.envs),
            &ids,
            &artifacts,
        )?;
        info.args = args;

        if self.prober.supports_flag(&artifacts, GROUP_ID_FLAG) {
            info.args.push(format!("--{}={}", GROUP_ID_FLAG, info.group_name));
        }

        let host_out = artifacts.display().to_string();
        envs.insert(HOME_ENV.to_string(), info.home.display().to_string());
        envs.insert(ANDROID_HOST_OUT_ENV.to_string(), host_out.clone());
        envs.insert(ANDROID_SOONG_HOST_OUT_ENV.to_string(), host_out);
        envs.insert(
            ANDROID_PRODUCT_OUT_ENV.to_string(),
            info.product_out_path.display().to_string(),
        );
        envs.insert(STARTED_BY_CVD_ENV.to_string(), "true".to_string());
        info.envs = envs;
        Ok(())
    }

    /// Encode `ids` as `--num_instances`/`--base_instance_num` when they are
    /// sorted and contiguous and the binary understands those flags, and as
    /// `--instance_nums=a,b,c` otherwise. Caller-supplied occurrences of all
    /// three flags are dropped first.
    pub fn update_instance_args_and_envs(
        &self,
        mut args: Vec<String>,
        mut envs: BTreeMap<String, String>,
        ids: &[u32],
        artifacts_path: &Path,
    ) -> Result<(Vec<String>, BTreeMap<String, String>)> {
        let (Some(&min), Some(&max)) = (ids.iter().min(), ids.iter().max()) else {
            bail!("instance group has no instances");
        };

        for flag in [INSTANCE_NUMS_FLAG, NUM_INSTANCES_FLAG, BASE_INSTANCE_NUM_FLAG] {
            if let Some(old) = consume_flag(&mut args, flag) {
                debug!(flag, value = %old, "discarding caller instance flag");
            }
        }

        let is_sorted = ids.windows(2).all(|w| w[0] < w[1]);
        let is_consecutive = (max - min) as usize == ids.len() - 1;
        let legacy = is_sorted
            && is_consecutive
            && (ids.len() == 1 || self.prober.supports_flag(artifacts_path, NUM_INSTANCES_FLAG));

        if legacy {
            if ids.len() > 1 {
                args.push(format!("--{}={}", NUM_INSTANCES_FLAG, ids.len()));
            }
            if self.prober.supports_flag(artifacts_path, BASE_INSTANCE_NUM_FLAG) {
                args.push(format!("--{}={}", BASE_INSTANCE_NUM_FLAG, min));
            }
        } else {
            let list: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            args.push(format!("--{}={}", INSTANCE_NUMS_FLAG, list.join(",")));
        }

        envs.insert(CUTTLEFISH_INSTANCE_ENV.to_string(), min.to_string());
        Ok((args, envs))
    }
}
