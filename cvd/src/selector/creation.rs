//! Deciding the shape of a new instance group.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use chrono::Utc;
use cvd_protocol::{InstanceGroupInfo, InstanceInfo};
use tracing::{debug, error};

use super::record::{GroupRecord, InstanceRecord};
use super::{is_valid_group_name, is_valid_instance_name};
use crate::instance_lock::{InUseState, InstanceLockFile, InstanceLockFileManager};
use crate::launch::args::{
    flag_value, ANDROID_HOST_OUT_ENV, ANDROID_PRODUCT_OUT_ENV, BASE_INSTANCE_NUM_FLAG,
    CUTTLEFISH_INSTANCE_ENV, HOME_ENV, INSTANCE_NUMS_FLAG, NUM_INSTANCES_FLAG,
};

const GROUP_NAME_SELECTOR: &str = "group_name";
const INSTANCE_NAME_SELECTOR: &str = "instance_name";

#[derive(Debug)]
pub struct PerInstanceInfo {
    pub instance_id: u32,
    pub per_instance_name: String,
    /// Held for the whole launch; runtime only.
    pub lock: Option<InstanceLockFile>,
}

impl PerInstanceInfo {
    pub fn new(instance_id: u32, per_instance_name: impl Into<String>) -> Self {
        Self {
            instance_id,
            per_instance_name: per_instance_name.into(),
            lock: None,
        }
    }

    fn with_lock(lock: InstanceLockFile, per_instance_name: String) -> Self {
        Self {
            instance_id: lock.instance_id(),
            per_instance_name,
            lock: Some(lock),
        }
    }
}

/// Everything needed to register and launch a new group.
#[derive(Debug)]
pub struct GroupCreationInfo {
    pub home: PathBuf,
    pub host_artifacts_path: PathBuf,
    pub product_out_path: PathBuf,
    pub group_name: String,
    pub instances: Vec<PerInstanceInfo>,
    pub args: Vec<String>,
    pub envs: BTreeMap<String, String>,
    /// Neither HOME nor selector arguments were given. Only such groups
    /// get the backward compatible symlinks in the user's home.
    pub is_default_group: bool,
}

impl GroupCreationInfo {
    pub fn instance_ids(&self) -> Vec<u32> {
        self.instances.iter().map(|i| i.instance_id).collect()
    }

    /// The persisted form, stamped with the current time.
    pub fn to_record(&self) -> GroupRecord {
        GroupRecord {
            name: self.group_name.clone(),
            home_directory: self.home.clone(),
            host_artifacts_path: self.host_artifacts_path.clone(),
            product_out_path: self.product_out_path.clone(),
            instances: self
                .instances
                .iter()
                .map(|i| InstanceRecord {
                    id: i.instance_id,
                    name: i.per_instance_name.clone(),
                })
                .collect(),
            envs: self.envs.clone(),
            args: self.args.clone(),
            is_default_group: self.is_default_group,
            start_time: Some(Utc::now()),
        }
    }

    pub fn group_info(&self) -> InstanceGroupInfo {
        InstanceGroupInfo {
            group_name: self.group_name.clone(),
            home_directories: vec![self.home.display().to_string()],
            instances: self
                .instances
                .iter()
                .map(|i| InstanceInfo {
                    name: i.per_instance_name.clone(),
                    instance_id: i.instance_id,
                })
                .collect(),
        }
    }

    /// Record `state` in every held lock file. Failures are logged.
    pub fn mark_lockfiles(&self, state: InUseState) {
        for instance in &self.instances {
            let Some(lock) = &instance.lock else {
                continue;
            };
            if let Err(e) = lock.set_status(state) {
                error!(id = instance.instance_id, error = %e, "failed to update instance lock file");
            }
        }
    }
}

/// Input to a [`GroupCreationAnalyzer`].
#[derive(Debug, Clone, Default)]
pub struct CreationParams {
    pub args: Vec<String>,
    pub envs: BTreeMap<String, String>,
    pub selector_args: Vec<String>,
    pub existing_group_names: Vec<String>,
}

/// Picks instance ids, names and home for a new group.
pub trait GroupCreationAnalyzer: Send + Sync {
    fn analyze(&self, params: &CreationParams) -> Result<GroupCreationInfo>;
}

pub struct DefaultCreationAnalyzer {
    locks: Arc<InstanceLockFileManager>,
    default_group_name: String,
    home_root: PathBuf,
    system_home: PathBuf,
}

impl DefaultCreationAnalyzer {
    pub fn new(
        locks: Arc<InstanceLockFileManager>,
        default_group_name: impl Into<String>,
        home_root: impl Into<PathBuf>,
        system_home: impl Into<PathBuf>,
    ) -> Self {
        Self {
            locks,
            default_group_name: default_group_name.into(),
            home_root: home_root.into(),
            system_home: system_home.into(),
        }
    }

    /// Requested ids from the launch arguments or environment, `None` when
    /// ids should be allocated automatically.
    fn requested_ids(&self, params: &CreationParams) -> Result<(Option<Vec<u32>>, usize)> {
        if let Some(list) = flag_value(&params.args, INSTANCE_NUMS_FLAG) {
            let ids = list
                .split(',')
                .map(|s| {
                    s.trim()
                        .parse::<u32>()
                        .with_context(|| format!("invalid --{} entry: {:?}", INSTANCE_NUMS_FLAG, s))
                })
                .collect::<Result<Vec<_>>>()?;
            let count = ids.len();
            return Ok((Some(ids), count));
        }

        let count = match flag_value(&params.args, NUM_INSTANCES_FLAG) {
            Some(n) => n
                .parse::<usize>()
                .with_context(|| format!("invalid --{}: {:?}", NUM_INSTANCES_FLAG, n))?,
            None => 1,
        };
        ensure!(count >= 1, "--{} must be at least 1", NUM_INSTANCES_FLAG);
        let max_id = self.locks.max_instance_id();
        let span = u32::try_from(count)
            .ok()
            .filter(|n| *n <= max_id)
            .with_context(|| {
                format!("--{}={} exceeds the {} available instance ids", NUM_INSTANCES_FLAG, count, max_id)
            })?;

        let base = match flag_value(&params.args, BASE_INSTANCE_NUM_FLAG) {
            Some(b) => Some(b),
            None => params.envs.get(CUTTLEFISH_INSTANCE_ENV).cloned(),
        };
        match base {
            Some(b) => {
                let base = b
                    .parse::<u32>()
                    .with_context(|| format!("invalid base instance number: {:?}", b))?;
                let last = base.checked_add(span - 1).with_context(|| {
                    format!("{} instances starting at id {} run past the largest id", count, base)
                })?;
                Ok((Some((base..=last).collect()), count))
            }
            None => Ok((None, count)),
        }
    }

    fn acquire_locks(&self, ids: Option<Vec<u32>>, count: usize) -> Result<Vec<InstanceLockFile>> {
        match ids {
            Some(ids) => ids
                .into_iter()
                .map(|id| self.locks.acquire(id))
                .collect::<Result<Vec<_>>>(),
            None => self.locks.try_acquire_unused(count),
        }
    }
}

impl GroupCreationAnalyzer for DefaultCreationAnalyzer {
    fn analyze(&self, params: &CreationParams) -> Result<GroupCreationInfo> {
        let host_artifacts_path = match params.envs.get(ANDROID_HOST_OUT_ENV) {
            Some(p) => PathBuf::from(p),
            None => bail!("{} is not set", ANDROID_HOST_OUT_ENV),
        };
        let product_out_path = params
            .envs
            .get(ANDROID_PRODUCT_OUT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| host_artifacts_path.clone());

        let selected_group = flag_value(&params.selector_args, GROUP_NAME_SELECTOR);
        let selected_names = flag_value(&params.selector_args, INSTANCE_NAME_SELECTOR)
            .map(|v| v.split(',').map(str::to_string).collect::<Vec<_>>());

        if let Some(name) = &selected_group {
            ensure!(is_valid_group_name(name), "group name \"{}\" is ill-formed", name);
        }
        if let Some(names) = &selected_names {
            for name in names {
                ensure!(is_valid_instance_name(name), "instance name \"{}\" is invalid", name);
            }
        }

        let (ids, count) = self.requested_ids(params)?;
        if let Some(names) = &selected_names {
            ensure!(
                names.len() == count,
                "{} instance names given for {} instances",
                names.len(),
                count
            );
        }
        let locks = self.acquire_locks(ids, count)?;
        let min_id = locks.iter().map(|l| l.instance_id()).min().unwrap_or_default();

        let instances: Vec<PerInstanceInfo> = match selected_names {
            Some(names) => locks
                .into_iter()
                .zip(names)
                .map(|(lock, name)| PerInstanceInfo::with_lock(lock, name))
                .collect(),
            None => locks
                .into_iter()
                .map(|lock| {
                    let name = lock.instance_id().to_string();
                    PerInstanceInfo::with_lock(lock, name)
                })
                .collect(),
        };

        let group_name = match selected_group {
            Some(name) => name,
            None if params.existing_group_names.contains(&self.default_group_name) => {
                format!("{}_{}", self.default_group_name, min_id)
            }
            None => self.default_group_name.clone(),
        };

        let home_override = params
            .envs
            .get(HOME_ENV)
            .map(PathBuf::from)
            .filter(|home| *home != self.system_home);
        let is_default_group = home_override.is_none() && params.selector_args.is_empty();
        let home = home_override.unwrap_or_else(|| self.home_root.join(&group_name));

        debug!(
            group = %group_name,
            home = %home.display(),
            ids = ?instances.iter().map(|i| i.instance_id).collect::<Vec<_>>(),
            is_default_group,
            "analyzed group creation"
        );

        Ok(GroupCreationInfo {
            home,
            host_artifacts_path,
            product_out_path,
            group_name,
            instances,
            args: params.args.clone(),
            envs: params.envs.clone(),
            is_default_group,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
        analyzer: DefaultCreationAnalyzer,
        locks: Arc<InstanceLockFileManager>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(InstanceLockFileManager::new(dir.path().join("locks"), 16));
        let analyzer = DefaultCreationAnalyzer::new(
            locks.clone(),
            "cvd",
            dir.path().join("homes"),
            dir.path().join("user"),
        );
        Fixture { dir, analyzer, locks }
    }

    fn params(args: &[&str], selector: &[&str]) -> CreationParams {
        CreationParams {
            args: args.iter().map(|s| s.to_string()).collect(),
            envs: BTreeMap::from([(ANDROID_HOST_OUT_ENV.to_string(), "/host".to_string())]),
            selector_args: selector.iter().map(|s| s.to_string()).collect(),
            existing_group_names: vec![],
        }
    }

    #[test]
    fn default_request_allocates_one_id() {
        let fx = fixture();
        let info = fx.analyzer.analyze(&params(&[], &[])).unwrap();
        assert_eq!(info.instance_ids(), vec![1]);
        assert_eq!(info.group_name, "cvd");
        assert_eq!(info.home, fx.dir.path().join("homes/cvd"));
        assert_eq!(info.product_out_path, PathBuf::from("/host"));
        assert!(info.is_default_group);
        assert!(info.instances[0].lock.is_some());
        assert_eq!(info.instances[0].per_instance_name, "1");
    }

    #[test]
    fn explicit_instance_nums_are_locked() {
        let fx = fixture();
        let info = fx
            .analyzer
            .analyze(&params(&["--instance_nums=3,5"], &[]))
            .unwrap();
        assert_eq!(info.instance_ids(), vec![3, 5]);

        assert!(fx.locks.try_acquire(3).unwrap().is_none());
        drop(info);
        assert!(fx.locks.try_acquire(3).unwrap().is_some());
    }

    #[test]
    fn num_instances_with_base() {
        let fx = fixture();
        let info = fx
            .analyzer
            .analyze(&params(&["--num_instances=3", "--base_instance_num=4"], &[]))
            .unwrap();
        assert_eq!(info.instance_ids(), vec![4, 5, 6]);
    }

    #[test]
    fn id_range_overflow_is_rejected() {
        let fx = fixture();
        let err = fx
            .analyzer
            .analyze(&params(&["--num_instances=2", "--base_instance_num=4294967295"], &[]))
            .unwrap_err();
        assert!(err.to_string().contains("largest id"));

        let mut p = params(&["--num_instances=2"], &[]);
        p.envs.insert(CUTTLEFISH_INSTANCE_ENV.into(), u32::MAX.to_string());
        assert!(fx.analyzer.analyze(&p).is_err());

        // Only the last id of the range fits.
        let info = fx
            .analyzer
            .analyze(&params(&["--num_instances=1", "--base_instance_num=4294967295"], &[]))
            .unwrap();
        assert_eq!(info.instance_ids(), vec![u32::MAX]);
    }

    #[test]
    fn num_instances_is_bounded_by_available_ids() {
        let fx = fixture();
        assert!(fx
            .analyzer
            .analyze(&params(&["--num_instances=17"], &[]))
            .is_err());
        assert!(fx
            .analyzer
            .analyze(&params(&["--num_instances=18446744073709551615", "--base_instance_num=1"], &[]))
            .is_err());
        assert!(fx
            .analyzer
            .analyze(&params(&["--num_instances=5000000000", "--base_instance_num=1"], &[]))
            .is_err());
    }

    #[test]
    fn cuttlefish_instance_env_sets_base() {
        let fx = fixture();
        let mut p = params(&[], &[]);
        p.envs.insert(CUTTLEFISH_INSTANCE_ENV.into(), "9".into());
        let info = fx.analyzer.analyze(&p).unwrap();
        assert_eq!(info.instance_ids(), vec![9]);
    }

    #[test]
    fn selectors_set_names_and_clear_default_flag() {
        let fx = fixture();
        let info = fx
            .analyzer
            .analyze(&params(
                &["--num_instances=2"],
                &["--group_name=phones", "--instance_name=a,b"],
            ))
            .unwrap();
        assert_eq!(info.group_name, "phones");
        assert!(!info.is_default_group);
        let names: Vec<&str> = info.instances.iter().map(|i| i.per_instance_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn instance_name_count_must_match() {
        let fx = fixture();
        assert!(fx
            .analyzer
            .analyze(&params(&["--num_instances=2"], &["--instance_name=a"]))
            .is_err());
    }

    #[test]
    fn taken_default_name_gets_id_suffix() {
        let fx = fixture();
        let mut p = params(&["--instance_nums=7"], &[]);
        p.existing_group_names = vec!["cvd".into()];
        let info = fx.analyzer.analyze(&p).unwrap();
        assert_eq!(info.group_name, "cvd_7");
    }

    #[test]
    fn home_override_disables_default_group() {
        let fx = fixture();
        let mut p = params(&[], &[]);
        p.envs.insert(HOME_ENV.into(), "/custom/home".into());
        let info = fx.analyzer.analyze(&p).unwrap();
        assert_eq!(info.home, PathBuf::from("/custom/home"));
        assert!(!info.is_default_group);

        let mut p = params(&["--instance_nums=2"], &[]);
        p.envs.insert(HOME_ENV.into(), fx.dir.path().join("user").display().to_string());
        let info = fx.analyzer.analyze(&p).unwrap();
        assert!(info.is_default_group);
    }

    #[test]
    fn missing_host_out_is_an_error() {
        let fx = fixture();
        let mut p = params(&[], &[]);
        p.envs.clear();
        assert!(fx.analyzer.analyze(&p).is_err());
    }

    #[test]
    fn group_info_lists_instances() {
        let fx = fixture();
        let info = fx.analyzer.analyze(&params(&["--instance_nums=2"], &[])).unwrap();
        let gi = info.group_info();
        assert_eq!(gi.group_name, "cvd");
        assert_eq!(gi.instances[0].instance_id, 2);
        assert_eq!(gi.home_directories.len(), 1);

        let rec = info.to_record();
        assert_eq!(rec.instances[0].id, 2);
        assert!(rec.start_time.is_some());
    }
}
