//! Portage transfer reconciler.
//!
//! Each invocation re-derives the next action from currently observable
//! cluster state: working volume, endpoint, key material, principal,
//! transfer job, image preservation. Any step that is not ready ends the
//! pass with `InProgress`; nothing blocks or retries internally, which
//! is what makes repeated and interrupted invocations safe.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::debug;

use portage_core::{
    names, CleanupOutcome, DataVolume, EventSink, MoverSession, MoverStatus, OwnerRef,
    PrincipalProvisioner, ProvisionError, Role, SyncOutcome, VolumeProvisioner,
};
use portage_store::{ObjectStore, StoreError};

mod cleanup;
mod endpoint;
mod job;
mod keys;
pub mod upsert;

/// Hard errors that stop a pass. Everything here is either transient
/// (store/provisioner trouble, retried on the caller's cadence) or a
/// validation failure surfaced to the user.
#[derive(Debug, thiserror::Error)]
pub enum MoverError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("volume provisioning: {0}")]
    Provision(#[source] ProvisionError),

    #[error("principal provisioning: {0}")]
    Principal(#[source] anyhow::Error),

    #[error("supplied key secret {name}: {reason}")]
    InvalidKeySecret { name: String, reason: String },

    #[error("source session requires a main volume")]
    MissingMainVolume,
}

/// One transfer endpoint's reconciler. Holds no session state beyond the
/// status projection being built for this pass.
pub struct Mover<'a, S, V, P> {
    store: &'a S,
    volumes: &'a V,
    principals: &'a P,
    events: &'a dyn EventSink,
    session: &'a MoverSession,
    status: MoverStatus,
}

impl<'a, S, V, P> Mover<'a, S, V, P>
where
    S: ObjectStore,
    V: VolumeProvisioner,
    P: PrincipalProvisioner,
{
    pub fn new(
        store: &'a S,
        volumes: &'a V,
        principals: &'a P,
        events: &'a dyn EventSink,
        session: &'a MoverSession,
    ) -> Self {
        let status = session.prior_status.clone();
        Self {
            store,
            volumes,
            principals,
            events,
            session,
            status,
        }
    }

    /// Status projection as of the last completed pass.
    pub fn status(&self) -> &MoverStatus {
        &self.status
    }

    pub fn into_status(self) -> MoverStatus {
        self.status
    }

    /// Run one reconciliation pass toward a completed transfer.
    pub async fn synchronize(&mut self) -> Result<SyncOutcome, MoverError> {
        let t0 = Instant::now();
        counter!("sync_cycles", 1u64);
        let res = self.synchronize_inner().await;
        histogram!("sync_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(SyncOutcome::Complete { .. }) => counter!("sync_complete", 1u64),
            Err(_) => counter!("sync_errors", 1u64),
            Ok(SyncOutcome::InProgress) => {}
        }
        res
    }

    async fn synchronize_inner(&mut self) -> Result<SyncOutcome, MoverError> {
        let volume = match self.session.role {
            Role::Source => self.ensure_source_volume().await?,
            Role::Destination => self.ensure_destination_volume().await?,
        };
        let Some(volume) = volume else {
            return Ok(SyncOutcome::InProgress);
        };

        if !self.ensure_endpoint().await? {
            return Ok(SyncOutcome::InProgress);
        }

        let key_secret = self.ensure_key().await?;

        let principal = self
            .principals
            .reconcile()
            .await
            .map_err(MoverError::Principal)?;
        let Some(principal) = principal else {
            return Ok(SyncOutcome::InProgress);
        };

        let job = self.ensure_job(&volume, &key_secret, &principal).await?;
        if job.is_none() {
            return Ok(SyncOutcome::InProgress);
        }

        if self.session.role.is_source() {
            return Ok(SyncOutcome::Complete { image: None });
        }

        // Destination: the cycle is complete only once an image of the
        // received data has been preserved.
        match self.volumes.preserve_image(&volume).await {
            Ok(Some(image)) => Ok(SyncOutcome::Complete { image: Some(image) }),
            Ok(None) => Ok(SyncOutcome::InProgress),
            Err(e) => Err(MoverError::Provision(e)),
        }
    }

    /// Remove every transient per-cycle object; independent entry point
    /// invoked after completion or owner deletion.
    pub async fn cleanup(&mut self) -> Result<CleanupOutcome, MoverError> {
        counter!("cleanup_cycles", 1u64);
        self.run_cleanup().await
    }

    async fn ensure_source_volume(&mut self) -> Result<Option<DataVolume>, MoverError> {
        let main = self
            .session
            .main_volume
            .as_deref()
            .ok_or(MoverError::MissingMainVolume)?;
        let work = names::work_volume_name(&self.session.owner, self.session.role);
        match self.volumes.ensure_from_source(main, &work).await {
            Ok(v) => Ok(v),
            // Soft condition: the caller keeps reconciling at its normal
            // cadence while the status shows we are stuck on the trigger.
            Err(ProvisionError::CopyTriggerTimeout(msg)) => {
                debug!(volume = %main, "copy trigger timed out");
                self.status.record_failure(msg);
                Ok(None)
            }
            Err(e) => Err(MoverError::Provision(e)),
        }
    }

    async fn ensure_destination_volume(&mut self) -> Result<Option<DataVolume>, MoverError> {
        let res = match &self.session.main_volume {
            Some(name) => self.volumes.use_existing(name).await,
            None => {
                let work = names::work_volume_name(&self.session.owner, self.session.role);
                self.volumes
                    .ensure_new(&work, self.session.cleanup_temp_volume)
                    .await
            }
        };
        res.map_err(MoverError::Provision)
    }
}

/// Labels addressing the mover pod; shared by the Service selector and
/// the job's pod template so the endpoint actually reaches the mover.
pub(crate) fn selector_labels(owner: &OwnerRef, role: Role) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            names::selector_value(owner, role),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "transfer-mover".to_string(),
        ),
        ("app.kubernetes.io/part-of".to_string(), "portage".to_string()),
    ])
}
