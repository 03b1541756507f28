//! Instance registry: persisted instance groups, the entities derived from
//! them, queries, and the naming rule shared by display and lookup.

pub mod creation;
pub mod database;
pub mod record;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::store::StoreError;

pub use creation::{
    CreationParams, DefaultCreationAnalyzer, GroupCreationAnalyzer, GroupCreationInfo,
    PerInstanceInfo,
};
pub use database::{FindParam, InstanceDatabase};
pub use record::{GroupRecord, Instance, InstanceGroup, InstanceRecord, PersistentData};

/// Query field names accepted by [`FindParam::from_queries`].
pub const HOME_FIELD: &str = "home";
pub const INSTANCE_ID_FIELD: &str = "instance_id";
pub const GROUP_NAME_FIELD: &str = "group_name";
pub const INSTANCE_NAME_FIELD: &str = "instance_name";

/// Group name used for internal device names (`cvd-<id>`).
pub const INTERNAL_GROUP_NAME: &str = "cvd";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("group name \"{0}\" is ill-formed")]
    InvalidGroupName(String),

    #[error("instance name \"{0}\" is invalid")]
    InvalidInstanceName(String),

    #[error("group \"{group}\" lists instance id {id} more than once")]
    DuplicateInstanceId { group: String, id: u32 },

    #[error("HOME dir \"{}\" neither exists nor can be created: {source}", path.display())]
    HomeDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("ANDROID_HOST_OUT \"{}\" is not a tool directory", .0.display())]
    NotHostArtifacts(PathBuf),

    #[error("new group conflicts with existing group: {name} at {}", home.display())]
    GroupConflict { name: String, home: PathBuf },

    #[error("new instance conflicts with existing instance: {name} with id {id}")]
    InstanceConflict { name: String, id: u32 },

    #[error("unrecognized field name: {0}")]
    UnknownField(String),

    #[error("id is not a number: {0}")]
    InvalidId(String),

    #[error("invalid snapshot: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The one rule turning a (group, instance) pair into a device name.
///
/// Used for both `<group>-<per-instance name>` and the internal
/// `<internal group>-<id>` form.
pub fn device_name(group: &str, instance: &str) -> String {
    format!("{}-{}", group, instance)
}

/// Group names start with a letter or `_`, followed by letters, digits or `_`.
pub fn is_valid_group_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Instance names are one or more `-`-separated pieces of letters, digits
/// and `_`. The empty name is accepted and means "use the id".
pub fn is_valid_instance_name(name: &str) -> bool {
    if name.is_empty() {
        return true;
    }
    name.split('-').all(|piece| {
        !piece.is_empty() && piece.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// Create `path` (and parents) unless it already is a directory.
pub async fn ensure_directory_exists(path: &Path) -> std::io::Result<()> {
    if tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Ok(());
    }
    tokio::fs::create_dir_all(path).await
}

/// A host artifacts directory is a directory with a `bin/` subdirectory.
pub async fn potentially_host_artifacts_path(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    tokio::fs::metadata(path.join("bin"))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}
