use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::selector::{is_valid_group_name, INTERNAL_GROUP_NAME};

/// Top-level configuration for the cvd control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub instances: InstancesConfig,
    pub launch: LaunchConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.instances.max_instance_id >= 1,
            "instances.max_instance_id must be >= 1"
        );
        anyhow::ensure!(
            is_valid_group_name(&self.launch.default_group_name),
            "launch.default_group_name is not a valid group name: {}",
            self.launch.default_group_name
        );
        anyhow::ensure!(
            !self.registry.state_file.as_os_str().is_empty(),
            "registry.state_file must not be empty"
        );
        anyhow::ensure!(
            self.instances.home_root.is_absolute(),
            "instances.home_root must be an absolute path"
        );
        Ok(())
    }

    /// The user's own home, where default groups get their symlinks.
    pub fn system_home(&self) -> Result<PathBuf> {
        if let Some(home) = &self.instances.system_home {
            return Ok(home.clone());
        }
        std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .context("HOME is not set and instances.system_home is not configured")
    }
}

/// Per-user runtime directory under the system temp dir.
fn runtime_dir() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!("cvd-{}", uid))
}

/// Directory shared with the legacy launcher for lock files and homes.
fn acloud_dir() -> PathBuf {
    std::env::temp_dir().join("acloud_cvd_temp")
}

/// Instance registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// JSON file holding the persisted instance groups.
    pub state_file: PathBuf,
    /// Advisory lock serializing mutating commands across processes.
    pub lock_file: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let dir = runtime_dir();
        Self {
            state_file: dir.join("instance_database.json"),
            lock_file: dir.join("cvd.lock"),
        }
    }
}

/// Instance id allocation and per-instance filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstancesConfig {
    /// Directory holding `local-instance-<id>.lock` files.
    pub lock_dir: PathBuf,
    /// Directory holding the legacy `local-instance-<id>` homes.
    pub legacy_dir: PathBuf,
    /// Root under which generated group homes are created.
    pub home_root: PathBuf,
    /// Highest id handed out by automatic allocation.
    pub max_instance_id: u32,
    /// Overrides `$HOME` as the target of default-group symlinks.
    pub system_home: Option<PathBuf>,
}

impl Default for InstancesConfig {
    fn default() -> Self {
        Self {
            lock_dir: acloud_dir(),
            legacy_dir: acloud_dir(),
            home_root: runtime_dir().join("homes"),
            max_instance_id: 128,
            system_home: None,
        }
    }
}

/// Group launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Name given to groups started without `--group-name`.
    pub default_group_name: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            default_group_name: INTERNAL_GROUP_NAME.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.instances.max_instance_id, 128);
        assert_eq!(config.launch.default_group_name, "cvd");
        assert!(config.instances.lock_dir.ends_with("acloud_cvd_temp"));
        assert_eq!(config.instances.lock_dir, config.instances.legacy_dir);
        assert!(config.registry.state_file.ends_with("instance_database.json"));
        assert!(config.instances.system_home.is_none());
    }

    #[test]
    fn config_default_validates() {
        let config = Config::default();
        config.validate().unwrap();
    }

    #[test]
    fn config_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[registry]
state_file = "/var/tmp/cvd/db.json"

[instances]
max_instance_id = 8
home_root = "/srv/cvd/homes"
system_home = "/home/tester"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.registry.state_file, PathBuf::from("/var/tmp/cvd/db.json"));
        assert_eq!(config.instances.max_instance_id, 8);
        assert_eq!(config.instances.home_root, PathBuf::from("/srv/cvd/homes"));
        // Unset fields use defaults
        assert!(config.registry.lock_file.ends_with("cvd.lock"));
        assert_eq!(config.launch.default_group_name, "cvd");
        assert_eq!(config.system_home().unwrap(), PathBuf::from("/home/tester"));
    }

    #[test]
    fn config_validation_rejects_zero_max_id() {
        let mut config = Config::default();
        config.instances.max_instance_id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_bad_group_name() {
        let mut config = Config::default();
        config.launch.default_group_name = "9lives".into();
        assert!(config.validate().is_err());

        config.launch.default_group_name = "my-group".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_relative_home_root() {
        let mut config = Config::default();
        config.instances.home_root = PathBuf::from("homes");
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_load_rejects_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[instances]\nmax_instance_id = \"many\"\n").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.registry.state_file, config.registry.state_file);
        assert_eq!(parsed.instances.max_instance_id, config.instances.max_instance_id);
    }
}
