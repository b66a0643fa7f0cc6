//! Named-volume lifecycle. Data seeding happens in worker containers, not
//! here; this component only talks to the engine.

use crate::config::{VolumeConfig, VolumeGroupConfig};
use crate::docker::DockerProvider;
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;

pub struct VolumeManager {
    volumes: Vec<VolumeConfig>,
    provider: Arc<DockerProvider>,
    session_id: String,
}

impl VolumeManager {
    pub fn new(
        volumes: Vec<VolumeConfig>,
        provider: Arc<DockerProvider>,
        session_id: String,
    ) -> Self {
        VolumeManager {
            volumes,
            provider,
            session_id,
        }
    }

    /// Create every declared volume. Creation is idempotent at the engine
    /// level: an existing volume of the same name is returned unchanged.
    pub async fn create_volumes(&self) -> Result<()> {
        for volume in &self.volumes {
            debug!("create volume {}", volume.name);
            self.provider
                .create_volume(&volume.name, &self.session_id, None)
                .await?;
        }
        Ok(())
    }

    /// Create the group's volumes, stamping the group name as a label.
    pub async fn create_volumes_with_group(&self, group: &VolumeGroupConfig) -> Result<()> {
        for volume in &group.volumes {
            debug!("create volume {} for group {}", volume.name, group.name);
            self.provider
                .create_volume(&volume.name, &self.session_id, Some(&group.name))
                .await?;
        }
        Ok(())
    }

    /// Replace each volume of the group with a fresh one. Callers must have
    /// stopped every pod that mounts them first.
    pub async fn recreate_volumes_with_group(&self, group: &VolumeGroupConfig) -> Result<()> {
        for volume in &group.volumes {
            self.provider
                .remove_volume(&volume.name, &self.session_id, true)
                .await?;
        }
        self.create_volumes_with_group(group).await
    }
}
