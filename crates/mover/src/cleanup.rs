//! Removal of per-cycle objects after a completed transfer or owner
//! deletion. Deletes by cleanup label so anything this mover stamped,
//! including objects from earlier code versions, is swept together.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tracing::{debug, info};

use portage_core::{
    names, CleanupOutcome, PrincipalProvisioner, Role, VolumeProvisioner, CLEANUP_LABEL,
};
use portage_store::{ObjectStore, VolumeSnapshot};

use crate::{Mover, MoverError};

impl<'a, S, V, P> Mover<'a, S, V, P>
where
    S: ObjectStore,
    V: VolumeProvisioner,
    P: PrincipalProvisioner,
{
    pub(crate) async fn run_cleanup(&mut self) -> Result<CleanupOutcome, MoverError> {
        let owner = &self.session.owner;
        let ns = &owner.namespace;

        // A destination that received into a user-supplied volume leaves a
        // marker while the transfer is live; drop it so the volume is fully
        // handed back.
        if self.session.role == Role::Destination {
            let volume = match &self.session.main_volume {
                Some(name) => name.clone(),
                None => names::work_volume_name(owner, self.session.role),
            };
            self.volumes
                .remove_snapshot_marker(&volume)
                .await
                .map_err(MoverError::Provision)?;
            debug!(volume = %volume, "snapshot marker cleared");
        }

        let selector = format!("{CLEANUP_LABEL}={}", owner.uid);
        self.store
            .delete_labeled::<PersistentVolumeClaim>(ns, &selector)
            .await?;
        self.store
            .delete_labeled::<VolumeSnapshot>(ns, &selector)
            .await?;
        self.store.delete_labeled::<Job>(ns, &selector).await?;

        info!(owner = %owner.name, namespace = %ns, "cleanup complete");
        Ok(CleanupOutcome::Complete)
    }
}
