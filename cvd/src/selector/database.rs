use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use super::record::{GroupRecord, Instance, InstanceGroup, PersistentData};
use super::{
    ensure_directory_exists, is_valid_group_name, is_valid_instance_name,
    potentially_host_artifacts_path, RegistryError, GROUP_NAME_FIELD, HOME_FIELD,
    INSTANCE_ID_FIELD, INSTANCE_NAME_FIELD,
};
use crate::store::GuardedStore;

/// Top-level array field of an imported snapshot.
const SNAPSHOT_GROUPS: &str = "Groups";

/// Conjunction of optional match criteria. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindParam {
    pub home: Option<PathBuf>,
    pub id: Option<u32>,
    pub group_name: Option<String>,
    pub instance_name: Option<String>,
}

impl FindParam {
    /// Translate `(field, value)` pairs into a `FindParam`.
    ///
    /// Field names may use `_` or `-` as separator (`instance_id` or
    /// `instance-id`). Unknown field names and non-numeric ids are errors.
    /// A repeated field keeps its last value.
    pub fn from_queries<I, K, V>(queries: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut param = FindParam::default();
        for (field, value) in queries {
            let value = value.as_ref();
            let field = field.as_ref().replace('-', "_");
            match field.as_str() {
                HOME_FIELD => param.home = Some(PathBuf::from(value)),
                INSTANCE_ID_FIELD => {
                    let id = value
                        .parse::<u32>()
                        .map_err(|_| RegistryError::InvalidId(value.to_string()))?;
                    param.id = Some(id);
                }
                GROUP_NAME_FIELD => param.group_name = Some(value.to_string()),
                INSTANCE_NAME_FIELD => param.instance_name = Some(value.to_string()),
                _ => return Err(RegistryError::UnknownField(field)),
            }
        }
        Ok(param)
    }

    fn matches_group(&self, group: &GroupRecord) -> bool {
        if let Some(home) = &self.home {
            if *home != group.home_directory {
                return false;
            }
        }
        if let Some(name) = &self.group_name {
            if *name != group.name {
                return false;
            }
        }
        true
    }

    fn matches_instance(&self, instance: &Instance) -> bool {
        if let Some(id) = self.id {
            if id != instance.id() {
                return false;
            }
        }
        if let Some(name) = &self.instance_name {
            if name != instance.per_instance_name() {
                return false;
            }
        }
        true
    }
}

fn find_groups(data: &PersistentData, param: &FindParam) -> Vec<InstanceGroup> {
    data.instance_groups
        .iter()
        .filter(|g| param.matches_group(g))
        .map(|g| InstanceGroup::from_trusted(g.clone()))
        .filter(|g| {
            !has_instance_criteria(param) || g.instances().iter().any(|i| param.matches_instance(i))
        })
        .collect()
}

fn find_instances(data: &PersistentData, param: &FindParam) -> Vec<Instance> {
    data.instance_groups
        .iter()
        .filter(|g| param.matches_group(g))
        .flat_map(|g| InstanceGroup::from_trusted(g.clone()).instances().to_vec())
        .filter(|i| param.matches_instance(i))
        .collect()
}

fn has_instance_criteria(param: &FindParam) -> bool {
    param.id.is_some() || param.instance_name.is_some()
}

/// The instance registry, persisted through a [`GuardedStore`].
pub struct InstanceDatabase {
    store: GuardedStore<PersistentData>,
}

impl InstanceDatabase {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let store = GuardedStore::open(path).await?;
        Ok(Self { store })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub async fn is_empty(&self) -> bool {
        self.store
            .with_shared(|data| data.instance_groups.is_empty())
            .await
    }

    /// Drop every group, returning what was there for caller-side cleanup.
    pub async fn clear(&self) -> Result<Vec<InstanceGroup>, RegistryError> {
        let removed = self
            .store
            .with_exclusive(|data| {
                let groups = std::mem::take(&mut data.instance_groups);
                Ok::<_, RegistryError>(groups)
            })
            .await?;
        info!(count = removed.len(), "cleared instance database");
        Ok(removed.into_iter().map(InstanceGroup::from_trusted).collect())
    }

    /// Validate and insert a new group.
    ///
    /// Shape checks (names, HOME, artifacts path) run before the lock. The
    /// name/home conflict check against existing groups, the id conflict
    /// check against existing instances and the insert all happen in one
    /// exclusive section.
    #[instrument(skip(self, record), fields(group = %record.name))]
    pub async fn add_instance_group(
        &self,
        record: GroupRecord,
    ) -> Result<InstanceGroup, RegistryError> {
        if !is_valid_group_name(&record.name) {
            return Err(RegistryError::InvalidGroupName(record.name.clone()));
        }
        ensure_directory_exists(&record.home_directory)
            .await
            .map_err(|source| RegistryError::HomeDirectory {
                path: record.home_directory.clone(),
                source,
            })?;
        if !potentially_host_artifacts_path(&record.host_artifacts_path).await {
            return Err(RegistryError::NotHostArtifacts(
                record.host_artifacts_path.clone(),
            ));
        }
        for instance in &record.instances {
            if !is_valid_instance_name(&instance.name) {
                return Err(RegistryError::InvalidInstanceName(instance.name.clone()));
            }
        }
        let group = InstanceGroup::from_record(record)?;

        self.store
            .with_exclusive(|data| {
                if let Some(existing) = data.instance_groups.iter().find(|g| {
                    g.name == group.group_name() || g.home_directory == group.home_dir()
                }) {
                    return Err(RegistryError::GroupConflict {
                        name: existing.name.clone(),
                        home: existing.home_directory.clone(),
                    });
                }
                for instance in group.instances() {
                    let clash = find_instances(
                        data,
                        &FindParam {
                            id: Some(instance.id()),
                            ..Default::default()
                        },
                    );
                    if let Some(existing) = clash.first() {
                        return Err(RegistryError::InstanceConflict {
                            name: existing.per_instance_name().to_string(),
                            id: existing.id(),
                        });
                    }
                }
                data.instance_groups.push(group.record().clone());
                Ok(())
            })
            .await?;

        debug!(home = %group.home_dir().display(), "instance group added");
        Ok(group)
    }

    /// Remove the first group called `group_name`. Returns whether one was
    /// removed.
    pub async fn remove_instance_group(&self, group_name: &str) -> Result<bool, RegistryError> {
        let removed = self
            .store
            .with_exclusive(|data| {
                match data.instance_groups.iter().position(|g| g.name == group_name) {
                    Some(pos) => {
                        data.instance_groups.remove(pos);
                        Ok::<_, RegistryError>(true)
                    }
                    None => Ok(false),
                }
            })
            .await?;
        if removed {
            info!(group = %group_name, "instance group removed");
        }
        Ok(removed)
    }

    pub async fn find_groups(&self, param: &FindParam) -> Vec<InstanceGroup> {
        self.store.with_shared(|data| find_groups(data, param)).await
    }

    pub async fn find_instances(&self, param: &FindParam) -> Vec<Instance> {
        self.store.with_shared(|data| find_instances(data, param)).await
    }

    pub async fn instance_groups(&self) -> Vec<InstanceGroup> {
        self.store
            .with_shared(|data| {
                data.instance_groups
                    .iter()
                    .cloned()
                    .map(InstanceGroup::from_trusted)
                    .collect()
            })
            .await
    }

    /// Bulk-append groups from a JSON snapshot of the form
    /// `{"Groups": [<group record>, ...]}`.
    ///
    /// Every group is validated before anything is written. Existing groups
    /// are not checked for conflicts.
    pub async fn load_from_snapshot(&self, serialized: &str) -> Result<usize, RegistryError> {
        let value: serde_json::Value = serde_json::from_str(serialized)?;
        let groups = value
            .get(SNAPSHOT_GROUPS)
            .ok_or_else(|| {
                RegistryError::Snapshot(format!("missing \"{}\" field", SNAPSHOT_GROUPS))
            })?
            .as_array()
            .ok_or_else(|| {
                RegistryError::Snapshot(format!("\"{}\" is not an array", SNAPSHOT_GROUPS))
            })?;

        let mut new_groups = Vec::with_capacity(groups.len());
        for group in groups {
            let record: GroupRecord = serde_json::from_value(group.clone())?;
            new_groups.push(InstanceGroup::from_record(record)?);
        }

        let count = new_groups.len();
        self.store
            .with_exclusive(|data| {
                data.instance_groups
                    .extend(new_groups.into_iter().map(InstanceGroup::into_record));
                Ok::<_, RegistryError>(())
            })
            .await?;
        info!(count, "loaded instance groups from snapshot");
        Ok(count)
    }

    /// Serialize the current groups in the form accepted by
    /// [`load_from_snapshot`](Self::load_from_snapshot).
    pub async fn to_snapshot(&self) -> Result<String, RegistryError> {
        let groups = self
            .store
            .with_shared(|data| data.instance_groups.clone())
            .await;
        let mut value = serde_json::Map::new();
        value.insert(SNAPSHOT_GROUPS.to_string(), serde_json::to_value(groups)?);
        Ok(serde_json::to_string_pretty(&serde_json::Value::Object(value))?)
    }

    pub async fn set_acloud_translator_optout(&self, optout: bool) -> Result<(), RegistryError> {
        self.store
            .with_exclusive(|data| {
                data.acloud_translator_optout = optout;
                Ok::<_, RegistryError>(())
            })
            .await
    }

    pub async fn acloud_translator_optout(&self) -> bool {
        self.store
            .with_shared(|data| data.acloud_translator_optout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::selector::InstanceRecord;

    struct Fixture {
        dir: tempfile::TempDir,
        db: InstanceDatabase,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("host_out/bin")).unwrap();
            let db = InstanceDatabase::open(dir.path().join("db.json")).await.unwrap();
            Self { dir, db }
        }

        fn record(&self, name: &str, home: &str, ids: &[u32]) -> GroupRecord {
            GroupRecord {
                name: name.into(),
                home_directory: self.dir.path().join(home),
                host_artifacts_path: self.dir.path().join("host_out"),
                product_out_path: self.dir.path().join("product_out"),
                instances: ids
                    .iter()
                    .map(|id| InstanceRecord { id: *id, name: format!("dev{}", id) })
                    .collect(),
                envs: BTreeMap::new(),
                args: vec![],
                is_default_group: false,
                start_time: None,
            }
        }
    }

    #[tokio::test]
    async fn add_then_find_by_group_name() {
        let fx = Fixture::new().await;
        let rec = fx.record("alpha", "home_a", &[1, 2]);
        let added = fx.db.add_instance_group(rec.clone()).await.unwrap();

        let found = fx
            .db
            .find_groups(&FindParam {
                group_name: Some("alpha".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], added);
        assert_eq!(found[0].record(), &rec);
        assert!(fx.db.path().exists());
    }

    #[tokio::test]
    async fn same_home_different_name_conflicts() {
        let fx = Fixture::new().await;
        fx.db
            .add_instance_group(fx.record("alpha", "shared", &[1]))
            .await
            .unwrap();
        let before = fx.db.instance_groups().await;

        let err = fx
            .db
            .add_instance_group(fx.record("beta", "shared", &[2]))
            .await
            .unwrap_err();
        match err {
            RegistryError::GroupConflict { name, .. } => assert_eq!(name, "alpha"),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(fx.db.instance_groups().await, before);
    }

    #[tokio::test]
    async fn same_name_conflicts() {
        let fx = Fixture::new().await;
        fx.db
            .add_instance_group(fx.record("alpha", "home_a", &[1]))
            .await
            .unwrap();
        let err = fx
            .db
            .add_instance_group(fx.record("alpha", "home_b", &[2]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::GroupConflict { .. }));
    }

    #[tokio::test]
    async fn instance_id_is_unique_across_groups() {
        let fx = Fixture::new().await;
        fx.db
            .add_instance_group(fx.record("alpha", "home_a", &[1, 2]))
            .await
            .unwrap();
        let err = fx
            .db
            .add_instance_group(fx.record("beta", "home_b", &[3, 2]))
            .await
            .unwrap_err();
        match err {
            RegistryError::InstanceConflict { name, id } => {
                assert_eq!(id, 2);
                assert_eq!(name, "dev2");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(fx.db.instance_groups().await.len(), 1);
    }

    #[tokio::test]
    async fn validation_fails_before_touching_store() {
        let fx = Fixture::new().await;

        let mut bad_name = fx.record("alpha", "home_a", &[1]);
        bad_name.name = "bad name".into();
        assert!(matches!(
            fx.db.add_instance_group(bad_name).await,
            Err(RegistryError::InvalidGroupName(_))
        ));

        let mut bad_artifacts = fx.record("alpha", "home_a", &[1]);
        bad_artifacts.host_artifacts_path = fx.dir.path().join("nowhere");
        assert!(matches!(
            fx.db.add_instance_group(bad_artifacts).await,
            Err(RegistryError::NotHostArtifacts(_))
        ));

        let mut bad_instance = fx.record("alpha", "home_a", &[1]);
        bad_instance.instances[0].name = "-x".into();
        assert!(matches!(
            fx.db.add_instance_group(bad_instance).await,
            Err(RegistryError::InvalidInstanceName(_))
        ));

        std::fs::write(fx.dir.path().join("file_home"), "x").unwrap();
        let bad_home = fx.record("alpha", "file_home", &[1]);
        assert!(matches!(
            fx.db.add_instance_group(bad_home).await,
            Err(RegistryError::HomeDirectory { .. })
        ));

        assert!(fx.db.is_empty().await);
        assert!(!fx.db.path().exists());
    }

    #[tokio::test]
    async fn clear_returns_previous_groups() {
        let fx = Fixture::new().await;
        fx.db
            .add_instance_group(fx.record("alpha", "home_a", &[1]))
            .await
            .unwrap();
        fx.db
            .add_instance_group(fx.record("beta", "home_b", &[2]))
            .await
            .unwrap();
        let before = fx.db.instance_groups().await;

        let cleared = fx.db.clear().await.unwrap();
        assert_eq!(cleared, before);
        assert!(fx.db.is_empty().await);

        let reopened = InstanceDatabase::open(fx.db.path()).await.unwrap();
        assert!(reopened.is_empty().await);
    }

    #[tokio::test]
    async fn remove_reports_whether_found() {
        let fx = Fixture::new().await;
        fx.db
            .add_instance_group(fx.record("alpha", "home_a", &[1]))
            .await
            .unwrap();
        assert!(!fx.db.remove_instance_group("beta").await.unwrap());
        assert!(fx.db.remove_instance_group("alpha").await.unwrap());
        assert!(fx.db.is_empty().await);
    }

    #[tokio::test]
    async fn find_instances_filters_groups_then_instances() {
        let fx = Fixture::new().await;
        fx.db
            .add_instance_group(fx.record("alpha", "home_a", &[1, 2]))
            .await
            .unwrap();
        fx.db
            .add_instance_group(fx.record("beta", "home_b", &[3]))
            .await
            .unwrap();

        let all = fx.db.find_instances(&FindParam::default()).await;
        assert_eq!(all.len(), 3);

        let by_home = fx
            .db
            .find_instances(&FindParam {
                home: Some(fx.dir.path().join("home_a")),
                ..Default::default()
            })
            .await;
        assert_eq!(by_home.iter().map(|i| i.id()).collect::<Vec<_>>(), vec![1, 2]);

        let by_name = fx
            .db
            .find_instances(&FindParam {
                instance_name: Some("dev3".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].device_name(), "beta-dev3");

        let mismatch = fx
            .db
            .find_instances(&FindParam {
                group_name: Some("alpha".into()),
                id: Some(3),
                ..Default::default()
            })
            .await;
        assert!(mismatch.is_empty());

        let group_by_id = fx
            .db
            .find_groups(&FindParam {
                id: Some(2),
                ..Default::default()
            })
            .await;
        assert_eq!(group_by_id.len(), 1);
        assert_eq!(group_by_id[0].group_name(), "alpha");
    }

    #[test]
    fn query_translation() {
        let param = FindParam::from_queries([
            ("home", "/h"),
            ("instance_id", "7"),
            ("group_name", "g"),
            ("instance_name", "i"),
        ])
        .unwrap();
        assert_eq!(param.home, Some(PathBuf::from("/h")));
        assert_eq!(param.id, Some(7));
        assert_eq!(param.group_name.as_deref(), Some("g"));
        assert_eq!(param.instance_name.as_deref(), Some("i"));

        assert!(matches!(
            FindParam::from_queries([("colour", "red")]),
            Err(RegistryError::UnknownField(_))
        ));
        assert!(matches!(
            FindParam::from_queries([("instance_id", "seven")]),
            Err(RegistryError::InvalidId(_))
        ));
    }

    #[test]
    fn query_fields_accept_dashes() {
        let dashed = FindParam::from_queries([
            ("instance-id", "7"),
            ("group-name", "g"),
            ("instance-name", "i"),
        ])
        .unwrap();
        let underscored = FindParam::from_queries([
            ("instance_id", "7"),
            ("group_name", "g"),
            ("instance_name", "i"),
        ])
        .unwrap();
        assert_eq!(dashed, underscored);
    }

    #[tokio::test]
    async fn load_from_snapshot_appends_without_conflict_check() {
        let fx = Fixture::new().await;
        fx.db
            .add_instance_group(fx.record("alpha", "home_a", &[1]))
            .await
            .unwrap();
        let snapshot = fx.db.to_snapshot().await.unwrap();

        let loaded = fx.db.load_from_snapshot(&snapshot).await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(fx.db.instance_groups().await.len(), 2);
    }

    #[tokio::test]
    async fn load_from_snapshot_rejects_bad_shapes() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.db.load_from_snapshot(r#"{"groups": []}"#).await,
            Err(RegistryError::Snapshot(_))
        ));
        assert!(matches!(
            fx.db.load_from_snapshot(r#"{"Groups": {}}"#).await,
            Err(RegistryError::Snapshot(_))
        ));
        assert!(matches!(
            fx.db.load_from_snapshot("not json").await,
            Err(RegistryError::Json(_))
        ));

        let invalid = r#"{"Groups": [
            {"name": "ok", "home_directory": "/a", "host_artifacts_path": "/b", "instances": [{"id": 1}]},
            {"name": "1bad", "home_directory": "/c", "host_artifacts_path": "/d", "instances": []}
        ]}"#;
        assert!(matches!(
            fx.db.load_from_snapshot(invalid).await,
            Err(RegistryError::InvalidGroupName(_))
        ));
        assert!(fx.db.is_empty().await);
    }

    #[tokio::test]
    async fn optout_flag_is_persisted() {
        let fx = Fixture::new().await;
        assert!(!fx.db.acloud_translator_optout().await);
        fx.db.set_acloud_translator_optout(true).await.unwrap();
        assert!(fx.db.acloud_translator_optout().await);

        let reopened = InstanceDatabase::open(fx.db.path()).await.unwrap();
        assert!(reopened.acloud_translator_optout().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_conflicting_adds_admit_exactly_one() {
        let fx = Arc::new(Fixture::new().await);

        let mut handles = Vec::new();
        for (i, name) in ["alpha", "beta", "gamma", "delta"].iter().enumerate() {
            let fx = fx.clone();
            let rec = fx.record(name, "contested", &[10 + i as u32]);
            handles.push(tokio::spawn(async move { fx.db.add_instance_group(rec).await }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(RegistryError::GroupConflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 3);
        assert_eq!(fx.db.instance_groups().await.len(), 1);
    }
}
