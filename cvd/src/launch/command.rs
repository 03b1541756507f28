use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use crate::launch::args::{
    ANDROID_HOST_OUT_ENV, ANDROID_PRODUCT_OUT_ENV, ANDROID_SOONG_HOST_OUT_ENV,
    CUTTLEFISH_INSTANCE_ENV, HOME_ENV,
};
use crate::util::shell_quote;

/// Environment variables worth showing when logging a launch.
const INTERESTING_ENVS: &[&str] = &[
    HOME_ENV,
    ANDROID_HOST_OUT_ENV,
    ANDROID_SOONG_HOST_OUT_ENV,
    ANDROID_PRODUCT_OUT_ENV,
    CUTTLEFISH_INSTANCE_ENV,
];

/// Where the launched process's standard streams go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStdio {
    /// stdin is inherited; stdout and stderr both go to our stderr so our
    /// stdout carries only the JSON response.
    Inherit,
    Null,
}

/// A fully-resolved launcher command ready to be spawned.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// The complete environment of the child.
    pub envs: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub stdio: LaunchStdio,
}

impl LaunchCommand {
    pub fn to_tokio_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(&self.args);
        cmd.env_clear();
        cmd.envs(&self.envs);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        match self.stdio {
            LaunchStdio::Inherit => {
                cmd.stdin(Stdio::inherit());
                cmd.stdout(Stdio::from(std::io::stderr()));
                cmd.stderr(Stdio::inherit());
            }
            LaunchStdio::Null => {
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }
        // The launcher daemonizes its devices; dropping the handle must not
        // kill it.
        cmd.kill_on_drop(false);
        cmd
    }

    /// Return the full command line as a string (for logging), prefixed
    /// with the interesting environment variables.
    pub fn command_line(&self) -> String {
        let mut parts: Vec<String> = INTERESTING_ENVS
            .iter()
            .filter_map(|name| {
                self.envs
                    .get(*name)
                    .map(|value| format!("{}={}", name, shell_quote(value)))
            })
            .collect();
        parts.push(shell_quote(&self.binary.display().to_string()));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> LaunchCommand {
        LaunchCommand {
            binary: PathBuf::from("/host/bin/launch_cvd"),
            args: vec!["--instance_nums=1,3".into(), "--daemon=true".into()],
            envs: BTreeMap::from([
                (HOME_ENV.to_string(), "/homes/my group".to_string()),
                (CUTTLEFISH_INSTANCE_ENV.to_string(), "1".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ]),
            working_dir: None,
            stdio: LaunchStdio::Null,
        }
    }

    #[test]
    fn command_line_shows_interesting_envs() {
        let line = command().command_line();
        assert_eq!(
            line,
            "HOME='/homes/my group' CUTTLEFISH_INSTANCE=1 /host/bin/launch_cvd '--instance_nums=1,3' --daemon=true"
        );
        assert!(!line.contains("UNRELATED"));
    }

    #[tokio::test]
    async fn child_sees_only_given_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let cmd = LaunchCommand {
            binary: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), format!("echo \"$FOO:$CARGO_PKG_NAME\" > {}", out.display())],
            envs: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
            working_dir: Some(dir.path().to_path_buf()),
            stdio: LaunchStdio::Null,
        };
        let status = cmd.to_tokio_command().status().await.unwrap();
        assert!(status.success());
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "bar:");
    }
}
