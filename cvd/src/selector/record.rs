use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{device_name, is_valid_group_name, is_valid_instance_name, RegistryError};
use super::INTERNAL_GROUP_NAME;

/// Persisted instance entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: u32,
    #[serde(default)]
    pub name: String,
}

/// Persisted instance group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub home_directory: PathBuf,
    pub host_artifacts_path: PathBuf,
    #[serde(default)]
    pub product_out_path: PathBuf,
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub is_default_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

impl GroupRecord {
    /// Name and id checks that do not need the filesystem.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if !is_valid_group_name(&self.name) {
            return Err(RegistryError::InvalidGroupName(self.name.clone()));
        }
        let mut seen = HashSet::new();
        for instance in &self.instances {
            if !is_valid_instance_name(&instance.name) {
                return Err(RegistryError::InvalidInstanceName(instance.name.clone()));
            }
            if !seen.insert(instance.id) {
                return Err(RegistryError::DuplicateInstanceId {
                    group: self.name.clone(),
                    id: instance.id,
                });
            }
        }
        Ok(())
    }
}

/// Everything the registry persists.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentData {
    pub instance_groups: Vec<GroupRecord>,
    pub acloud_translator_optout: bool,
}

/// One device in a group. Derived from a [`GroupRecord`], never stored on
/// its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    id: u32,
    internal_name: String,
    per_instance_name: String,
    group_name: String,
    internal_group_name: String,
}

impl Instance {
    fn new(record: &InstanceRecord, group_name: &str) -> Self {
        let internal_name = record.id.to_string();
        let per_instance_name = if record.name.is_empty() {
            internal_name.clone()
        } else {
            record.name.clone()
        };
        Self {
            id: record.id,
            internal_name,
            per_instance_name,
            group_name: group_name.to_string(),
            internal_group_name: INTERNAL_GROUP_NAME.to_string(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn internal_name(&self) -> &str {
        &self.internal_name
    }

    pub fn per_instance_name(&self) -> &str {
        &self.per_instance_name
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn internal_group_name(&self) -> &str {
        &self.internal_group_name
    }

    /// `<group>-<per-instance name>`, e.g. `cvd-phone`.
    pub fn device_name(&self) -> String {
        device_name(&self.group_name, &self.per_instance_name)
    }

    /// `<internal group>-<id>`, e.g. `cvd-3`.
    pub fn internal_device_name(&self) -> String {
        device_name(&self.internal_group_name, &self.internal_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceGroup {
    record: GroupRecord,
    instances: Vec<Instance>,
}

impl InstanceGroup {
    /// Validate `record` and build the entity.
    pub fn from_record(record: GroupRecord) -> Result<Self, RegistryError> {
        record.validate()?;
        Ok(Self::from_trusted(record))
    }

    /// Build from a record that already passed validation on insert.
    pub(crate) fn from_trusted(record: GroupRecord) -> Self {
        let instances = record
            .instances
            .iter()
            .map(|i| Instance::new(i, &record.name))
            .collect();
        Self { record, instances }
    }

    pub fn group_name(&self) -> &str {
        &self.record.name
    }

    pub fn internal_group_name(&self) -> &str {
        INTERNAL_GROUP_NAME
    }

    pub fn home_dir(&self) -> &Path {
        &self.record.home_directory
    }

    pub fn host_artifacts_path(&self) -> &Path {
        &self.record.host_artifacts_path
    }

    pub fn product_out_path(&self) -> &Path {
        &self.record.product_out_path
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.record.start_time
    }

    pub fn is_default_group(&self) -> bool {
        self.record.is_default_group
    }

    pub fn envs(&self) -> &BTreeMap<String, String> {
        &self.record.envs
    }

    pub fn args(&self) -> &[String] {
        &self.record.args
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn record(&self) -> &GroupRecord {
        &self.record
    }

    pub fn into_record(self) -> GroupRecord {
        self.record
    }

    pub fn find_by_id(&self, id: u32) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// Find by per-instance name. For device `cvd-foo`, `cvd` is the group
    /// name and `foo` the per-instance name.
    pub fn find_by_instance_name(&self, name: &str) -> Vec<&Instance> {
        self.instances
            .iter()
            .filter(|i| i.per_instance_name == name)
            .collect()
    }
}
