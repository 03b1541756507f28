//! Symlinks that keep older tools working against new group homes.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, error};

use crate::selector::{device_name, ensure_directory_exists, GroupCreationInfo, INTERNAL_GROUP_NAME};

/// Set to `true` by the legacy launcher when it owns the legacy homes.
pub const LAUNCHED_BY_ACLOUD_ENV: &str = "LAUNCHED_BY_ACLOUD";

pub fn legacy_home(legacy_dir: &Path, instance_id: u32) -> PathBuf {
    legacy_dir.join(format!("local-instance-{}", instance_id))
}

/// Point `link` at `target`, replacing whatever is at `link` unless it
/// already is that exact symlink.
pub async fn ensure_symlink(target: &Path, link: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(link).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            if tokio::fs::read_link(link).await.ok().as_deref() == Some(target) {
                return Ok(());
            }
            tokio::fs::remove_file(link)
                .await
                .with_context(|| format!("removing stale symlink {}", link.display()))?;
        }
        Ok(meta) if meta.is_dir() => {
            tokio::fs::remove_dir_all(link)
                .await
                .with_context(|| format!("removing directory {}", link.display()))?;
        }
        Ok(_) => {
            tokio::fs::remove_file(link)
                .await
                .with_context(|| format!("removing file {}", link.display()))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("inspecting {}", link.display()));
        }
    }
    if let Some(parent) = link.parent() {
        ensure_directory_exists(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::symlink(target, link)
        .await
        .with_context(|| format!("linking {} -> {}", link.display(), target.display()))?;
    debug!(link = %link.display(), target = %target.display(), "created symlink");
    Ok(())
}

/// Remove whatever a previous launch left at a legacy home.
async fn remove_stale_legacy_home(path: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        // Created by the legacy launcher itself.
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

async fn is_real_dir(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Refresh the legacy homes of a just-started group:
/// `<home>/host_bins -> <host artifacts>` and
/// `<legacy_dir>/local-instance-<id> -> <home>` for every instance.
pub async fn acloud_compat_actions(info: &GroupCreationInfo, legacy_dir: &Path) -> Result<()> {
    let launched_by_acloud = info
        .envs
        .get(LAUNCHED_BY_ACLOUD_ENV)
        .is_some_and(|v| v == "true");
    let legacy_homes: Vec<PathBuf> = info
        .instances
        .iter()
        .map(|i| legacy_home(legacy_dir, i.instance_id))
        .collect();

    if !launched_by_acloud {
        // The group's own home may itself be a legacy home.
        for path in legacy_homes.iter().filter(|p| **p != info.home) {
            match remove_stale_legacy_home(path).await {
                Ok(()) => debug!(path = %path.display(), "removed stale legacy home"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => error!(path = %path.display(), error = %e, "removing legacy home failed"),
            }
        }
    }

    ensure_directory_exists(&info.home)
        .await
        .with_context(|| format!("creating {}", info.home.display()))?;
    ensure_symlink(&info.host_artifacts_path, &info.home.join("host_bins")).await?;

    for path in &legacy_homes {
        if *path == info.home {
            error!(
                home = %info.home.display(),
                "HOME is a legacy workspace and will be deleted by the next start using it"
            );
            continue;
        }
        if launched_by_acloud && is_real_dir(path).await {
            debug!(path = %path.display(), "legacy home owned by the legacy launcher");
            continue;
        }
        ensure_symlink(&info.home, path).await?;
    }
    Ok(())
}

/// Links in the user's own home for a default group: per-instance
/// `cuttlefish_runtime.<id>`, the shared `cuttlefish` and config links, and
/// `cuttlefish_runtime` pointing at the lowest instance.
pub async fn create_default_group_symlinks(info: &GroupCreationInfo, system_home: &Path) -> Result<()> {
    ensure_directory_exists(&info.home)
        .await
        .with_context(|| format!("creating {}", info.home.display()))?;

    let ids = info.instance_ids();
    let Some(smallest) = ids.iter().copied().min() else {
        bail!("group {} has no instances", info.group_name);
    };

    for id in &ids {
        let instance_dir = info
            .home
            .join("cuttlefish/instances")
            .join(device_name(INTERNAL_GROUP_NAME, &id.to_string()));
        ensure_symlink(&instance_dir, &system_home.join(format!("cuttlefish_runtime.{}", id))).await?;
    }
    ensure_symlink(&info.home.join("cuttlefish"), &system_home.join("cuttlefish")).await?;
    ensure_symlink(
        &info.home.join("cuttlefish/assembly/cuttlefish_config.json"),
        &system_home.join(".cuttlefish_config.json"),
    )
    .await?;

    ensure_symlink(
        &system_home.join(format!("cuttlefish_runtime.{}", smallest)),
        &system_home.join("cuttlefish_runtime"),
    )
    .await
}
