//! Filesystem side of the seed workers. This code runs inside a worker
//! container where the workspace is mounted read-only at the context path
//! and each target volume is mounted under the volume root.

use crate::config::{ComposeConfig, VolumeConfig};
use crate::error::{Error, Result};
use std::path::Path;
use tracing::info;

/// Copy the declared seed directory of every volume into its mount point.
pub fn seed_volumes(
    volumes: &[VolumeConfig],
    context_path: &Path,
    volume_root: &Path,
) -> Result<()> {
    for volume in volumes {
        let Some(path) = &volume.path else { continue };
        let source = context_path.join(path);
        let target = volume_root.join(&volume.name);
        info!(
            "seed volume {} from {} into {}",
            volume.name,
            source.display(),
            target.display()
        );
        copy_dir_contents(&source, &target)?;
    }
    Ok(())
}

/// Seed the volumes of one group from the group's alternative dataset.
pub fn seed_volume_group(
    config: &ComposeConfig,
    group_name: &str,
    context_path: &Path,
    volume_root: &Path,
) -> Result<()> {
    let group = config
        .volume_group(group_name)
        .ok_or_else(|| Error::UnknownVolumeGroup(group_name.to_string()))?;
    seed_volumes(&group.volumes, context_path, volume_root)
}

/// Copy the entries of `source` into `target` recursively. `target` must
/// exist already (it is a mount point inside the worker).
fn copy_dir_contents(source: &Path, target: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(Error::Validation(format!(
            "seed path {} is not a directory",
            source.display()
        )));
    }
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let entry_target = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&entry_target)?;
            copy_dir_contents(&entry.path(), &entry_target)?;
        } else {
            std::fs::copy(entry.path(), &entry_target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeGroupConfig;

    fn write_file(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn copies_nested_seed_directories_into_the_mount() {
        let workspace = tempfile::tempdir().unwrap();
        let volume_root = tempfile::tempdir().unwrap();
        write_file(&workspace.path().join("seed/a.txt"), "alpha");
        write_file(&workspace.path().join("seed/sub/b.txt"), "beta");
        std::fs::create_dir_all(volume_root.path().join("data")).unwrap();

        let volumes = vec![VolumeConfig {
            name: "data".into(),
            path: Some("./seed".into()),
        }];
        seed_volumes(&volumes, workspace.path(), volume_root.path()).unwrap();

        let copied = std::fs::read_to_string(volume_root.path().join("data/sub/b.txt")).unwrap();
        assert_eq!(copied, "beta");
    }

    #[test]
    fn volumes_without_a_path_are_skipped() {
        let workspace = tempfile::tempdir().unwrap();
        let volume_root = tempfile::tempdir().unwrap();
        let volumes = vec![VolumeConfig {
            name: "scratch".into(),
            path: None,
        }];
        seed_volumes(&volumes, workspace.path(), volume_root.path()).unwrap();
        assert!(!volume_root.path().join("scratch").exists());
    }

    #[test]
    fn group_seed_resolves_the_named_group() {
        let workspace = tempfile::tempdir().unwrap();
        let volume_root = tempfile::tempdir().unwrap();
        write_file(&workspace.path().join("b/data.txt"), "from-b");
        std::fs::create_dir_all(volume_root.path().join("d")).unwrap();

        let config = ComposeConfig {
            version: "1".into(),
            volumes: vec![VolumeConfig {
                name: "d".into(),
                path: None,
            }],
            volume_groups: vec![
                VolumeGroupConfig {
                    name: "g1".into(),
                    volumes: vec![VolumeConfig {
                        name: "d".into(),
                        path: Some("./a".into()),
                    }],
                },
                VolumeGroupConfig {
                    name: "g2".into(),
                    volumes: vec![VolumeConfig {
                        name: "d".into(),
                        path: Some("./b".into()),
                    }],
                },
            ],
            ..Default::default()
        };
        seed_volume_group(&config, "g2", workspace.path(), volume_root.path()).unwrap();
        let copied = std::fs::read_to_string(volume_root.path().join("d/data.txt")).unwrap();
        assert_eq!(copied, "from-b");

        let err = seed_volume_group(&config, "missing", workspace.path(), volume_root.path())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownVolumeGroup(_)));
    }
}
