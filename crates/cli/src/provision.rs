//! PVC-backed collaborators for the reconciler: working volumes cut
//! from claims via the external snapshotter (or used directly), and a
//! service-account principal.

use std::collections::BTreeMap;

use anyhow::anyhow;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, ServiceAccount, TypedLocalObjectReference, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use portage_core::{
    mark_for_cleanup, names, set_owned_by, CopyStrategy, DataVolume, ImageRef, OwnerRef, Principal,
    ProvisionError, VolumeAffinity,
};
use portage_store::snapshot::{VolumeSnapshotSource, VolumeSnapshotSpec};
use portage_store::{ObjectStore, StoreError, VolumeSnapshot};

/// Caller opts in to trigger-gated copies with this annotation on the
/// source claim.
const USE_COPY_TRIGGER: &str = "portage.dev/use-copy-trigger";
/// Trigger value the caller bumps to request the next copy.
const COPY_TRIGGER: &str = "portage.dev/copy-trigger";
/// Last trigger value a copy was taken for.
const LATEST_COPY_TRIGGER: &str = "portage.dev/latest-copy-trigger";
const TRIGGER_WAITING_SINCE: &str = "portage.dev/copy-trigger-waiting-since";
const COPY_TRIGGER_TIMEOUT_SECS: i64 = 600;

/// Name of the preserved snapshot, stamped on the claim it was cut from.
const SNAPSHOT_MARKER: &str = "portage.dev/snapshot-name";

/// Stamped by the scheduler/provisioner on WaitForFirstConsumer claims.
const SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";

pub struct VolumeOptions {
    pub capacity: String,
    pub storage_class: Option<String>,
    pub snapshot_class: Option<String>,
    pub copy_strategy: CopyStrategy,
}

/// Volume provisioner over PersistentVolumeClaims and VolumeSnapshots.
pub struct PvcVolumes<'a, S> {
    store: &'a S,
    namespace: String,
    owner: OwnerRef,
    options: VolumeOptions,
}

impl<'a, S: ObjectStore> PvcVolumes<'a, S> {
    pub fn new(store: &'a S, owner: OwnerRef, options: VolumeOptions) -> Self {
        Self {
            store,
            namespace: owner.namespace.clone(),
            owner,
            options,
        }
    }

    /// Trigger gate: `Ok(true)` when a copy may proceed now. Claims
    /// without the opt-in annotation always proceed.
    async fn copy_trigger_ready(
        &self,
        src: &PersistentVolumeClaim,
    ) -> Result<bool, ProvisionError> {
        let ann = src.metadata.annotations.clone().unwrap_or_default();
        if !ann.contains_key(USE_COPY_TRIGGER) {
            return Ok(true);
        }
        let name = src.metadata.name.clone().unwrap_or_default();
        let current = ann.get(COPY_TRIGGER).cloned().unwrap_or_default();
        if ann.get(LATEST_COPY_TRIGGER) != Some(&current) {
            debug!(volume = %name, trigger = %current, "copy trigger fired");
            let mut pvc = src.clone();
            let a = pvc.metadata.annotations.get_or_insert_with(Default::default);
            a.insert(LATEST_COPY_TRIGGER.to_string(), current);
            a.remove(TRIGGER_WAITING_SINCE);
            self.store.update(&pvc).await.map_err(store_err)?;
            return Ok(true);
        }

        match ann.get(TRIGGER_WAITING_SINCE) {
            None => {
                let mut pvc = src.clone();
                pvc.metadata
                    .annotations
                    .get_or_insert_with(Default::default)
                    .insert(
                        TRIGGER_WAITING_SINCE.to_string(),
                        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                    );
                self.store.update(&pvc).await.map_err(store_err)?;
                Ok(false)
            }
            Some(ts) => {
                let since = DateTime::parse_from_rfc3339(ts)
                    .map_err(|e| ProvisionError::Other(anyhow!("bad waiting-since on {name}: {e}")))?
                    .with_timezone(&Utc);
                if Utc::now() - since > Duration::seconds(COPY_TRIGGER_TIMEOUT_SECS) {
                    Err(ProvisionError::CopyTriggerTimeout(format!(
                        "copy trigger on {name} unchanged for over {COPY_TRIGGER_TIMEOUT_SECS}s"
                    )))
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// `transient` snapshots are working copies swept by cleanup; the
    /// preserved image snapshot outlives the transfer and stays
    /// unmarked.
    async fn ensure_snapshot_of(
        &self,
        snap_name: &str,
        claim: &str,
        transient: bool,
    ) -> Result<VolumeSnapshot, ProvisionError> {
        if let Some(snap) = self
            .store
            .get::<VolumeSnapshot>(&self.namespace, snap_name)
            .await
            .map_err(store_err)?
        {
            return Ok(snap);
        }
        let mut snap = VolumeSnapshot::new(
            snap_name,
            VolumeSnapshotSpec {
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some(claim.to_string()),
                },
                volume_snapshot_class_name: self.options.snapshot_class.clone(),
            },
        );
        snap.metadata.namespace = Some(self.namespace.clone());
        set_owned_by(&mut snap.metadata, &self.owner);
        if transient {
            mark_for_cleanup(&mut snap.metadata, &self.owner);
        }
        info!(snapshot = %snap_name, claim = %claim, "creating volume snapshot");
        match self.store.create(&snap).await {
            Ok(created) => Ok(created),
            Err(StoreError::AlreadyExists { .. }) => Ok(snap),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn ensure_claim(
        &self,
        name: &str,
        template: &PersistentVolumeClaim,
        data_source: Option<TypedLocalObjectReference>,
        cleanup_when_done: bool,
    ) -> Result<PersistentVolumeClaim, ProvisionError> {
        if let Some(pvc) = self
            .store
            .get::<PersistentVolumeClaim>(&self.namespace, name)
            .await
            .map_err(store_err)?
        {
            return Ok(pvc);
        }
        let tspec = template.spec.clone().unwrap_or_default();
        let mut pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        let spec = pvc.spec.get_or_insert_with(Default::default);
        spec.access_modes = tspec
            .access_modes
            .clone()
            .or_else(|| Some(vec!["ReadWriteOnce".to_string()]));
        spec.volume_mode = tspec.volume_mode.clone();
        spec.storage_class_name = self
            .options
            .storage_class
            .clone()
            .or_else(|| tspec.storage_class_name.clone());
        let capacity = tspec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|req| req.get("storage").cloned())
            .unwrap_or_else(|| Quantity(self.options.capacity.clone()));
        spec.resources = Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([("storage".to_string(), capacity)])),
            ..Default::default()
        });
        spec.data_source = data_source;
        set_owned_by(&mut pvc.metadata, &self.owner);
        if cleanup_when_done {
            mark_for_cleanup(&mut pvc.metadata, &self.owner);
        }
        info!(claim = %name, "creating working volume");
        match self.store.create(&pvc).await {
            Ok(created) => Ok(created),
            Err(StoreError::AlreadyExists { .. }) => Ok(pvc),
            Err(e) => Err(store_err(e)),
        }
    }
}

#[async_trait::async_trait]
impl<S: ObjectStore> portage_core::VolumeProvisioner for PvcVolumes<'_, S> {
    async fn ensure_from_source(
        &self,
        source: &str,
        name: &str,
    ) -> Result<Option<DataVolume>, ProvisionError> {
        let src = self
            .store
            .get::<PersistentVolumeClaim>(&self.namespace, source)
            .await
            .map_err(store_err)?
            .ok_or_else(|| ProvisionError::Other(anyhow!("source volume {source} not found")))?;

        if !self.copy_trigger_ready(&src).await? {
            return Ok(None);
        }

        match self.options.copy_strategy {
            // The live claim is handed to the mover read-only.
            CopyStrategy::Direct => Ok(Some(DataVolume {
                name: source.to_string(),
                block_mode: is_block(&src),
                read_only: true,
            })),
            CopyStrategy::Snapshot => {
                let snap = self.ensure_snapshot_of(name, source, true).await?;
                if !snapshot_ready(&snap) {
                    debug!(snapshot = %name, "waiting for snapshot to be ready");
                    return Ok(None);
                }
                self.ensure_claim(
                    name,
                    &src,
                    Some(TypedLocalObjectReference {
                        api_group: Some("snapshot.storage.k8s.io".to_string()),
                        kind: "VolumeSnapshot".to_string(),
                        name: name.to_string(),
                    }),
                    true,
                )
                .await?;
                Ok(Some(DataVolume {
                    name: name.to_string(),
                    block_mode: is_block(&src),
                    read_only: false,
                }))
            }
        }
    }

    async fn ensure_new(
        &self,
        name: &str,
        cleanup_when_done: bool,
    ) -> Result<Option<DataVolume>, ProvisionError> {
        let template = PersistentVolumeClaim::default();
        let pvc = self
            .ensure_claim(name, &template, None, cleanup_when_done)
            .await?;
        Ok(Some(DataVolume {
            name: name.to_string(),
            block_mode: is_block(&pvc),
            read_only: false,
        }))
    }

    async fn use_existing(&self, name: &str) -> Result<Option<DataVolume>, ProvisionError> {
        let pvc = self
            .store
            .get::<PersistentVolumeClaim>(&self.namespace, name)
            .await
            .map_err(store_err)?
            .ok_or_else(|| ProvisionError::Other(anyhow!("destination volume {name} not found")))?;
        Ok(Some(DataVolume {
            name: name.to_string(),
            block_mode: is_block(&pvc),
            read_only: false,
        }))
    }

    async fn remove_snapshot_marker(&self, name: &str) -> Result<(), ProvisionError> {
        let Some(mut pvc) = self
            .store
            .get::<PersistentVolumeClaim>(&self.namespace, name)
            .await
            .map_err(store_err)?
        else {
            return Ok(());
        };
        let removed = pvc
            .metadata
            .annotations
            .as_mut()
            .map(|a| a.remove(SNAPSHOT_MARKER).is_some())
            .unwrap_or(false);
        if removed {
            self.store.update(&pvc).await.map_err(store_err)?;
        }
        Ok(())
    }

    async fn preserve_image(
        &self,
        volume: &DataVolume,
    ) -> Result<Option<ImageRef>, ProvisionError> {
        match self.options.copy_strategy {
            // The received data already lives in its final claim.
            CopyStrategy::Direct => Ok(Some(ImageRef {
                kind: "PersistentVolumeClaim".to_string(),
                name: volume.name.clone(),
            })),
            CopyStrategy::Snapshot => {
                let pvc = self
                    .store
                    .get::<PersistentVolumeClaim>(&self.namespace, &volume.name)
                    .await
                    .map_err(store_err)?
                    .ok_or_else(|| {
                        ProvisionError::Other(anyhow!("volume {} not found", volume.name))
                    })?;

                // The marker on the claim names this iteration's snapshot.
                // Reuse it while present; once cleanup clears it a fresh
                // snapshot is cut instead of rereporting the old one.
                let marker = pvc
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(SNAPSHOT_MARKER))
                    .cloned();
                let snap_name = match marker {
                    Some(name) => name,
                    None => {
                        let name = names::clamp(&format!(
                            "{}{}-snap-{:x}",
                            names::PORTAGE_PREFIX,
                            self.owner.name,
                            Utc::now().timestamp_micros()
                        ));
                        let mut pvc = pvc.clone();
                        pvc.metadata
                            .annotations
                            .get_or_insert_with(Default::default)
                            .insert(SNAPSHOT_MARKER.to_string(), name.clone());
                        self.store.update(&pvc).await.map_err(store_err)?;
                        name
                    }
                };

                let snap = self.ensure_snapshot_of(&snap_name, &volume.name, false).await?;
                if !snapshot_ready(&snap) {
                    return Ok(None);
                }
                Ok(Some(ImageRef {
                    kind: "VolumeSnapshot".to_string(),
                    name: snap_name,
                }))
            }
        }
    }

    async fn affinity_for(&self, volume: &DataVolume) -> Result<VolumeAffinity, ProvisionError> {
        let pvc = self
            .store
            .get::<PersistentVolumeClaim>(&self.namespace, &volume.name)
            .await
            .map_err(store_err)?;
        let node = pvc
            .and_then(|p| p.metadata.annotations)
            .and_then(|a| a.get(SELECTED_NODE).cloned());
        let mut affinity = VolumeAffinity::default();
        if let Some(node) = node {
            affinity
                .node_selector
                .insert("kubernetes.io/hostname".to_string(), node);
        }
        Ok(affinity)
    }
}

/// Principal provisioner that converges a ServiceAccount of the
/// configured name.
pub struct SaPrincipals<'a, S> {
    store: &'a S,
    owner: OwnerRef,
    name: String,
}

impl<'a, S: ObjectStore> SaPrincipals<'a, S> {
    pub fn new(store: &'a S, owner: OwnerRef, name: String) -> Self {
        Self { store, owner, name }
    }
}

#[async_trait::async_trait]
impl<S: ObjectStore> portage_core::PrincipalProvisioner for SaPrincipals<'_, S> {
    async fn reconcile(&self) -> Result<Option<Principal>, anyhow::Error> {
        let ns = &self.owner.namespace;
        if self
            .store
            .get::<ServiceAccount>(ns, &self.name)
            .await?
            .is_none()
        {
            let mut sa = ServiceAccount {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    namespace: Some(ns.clone()),
                    ..Default::default()
                },
                ..Default::default()
            };
            set_owned_by(&mut sa.metadata, &self.owner);
            match self.store.create(&sa).await {
                Ok(_) => info!(account = %self.name, "created mover service account"),
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(Principal {
            name: self.name.clone(),
        }))
    }
}

fn store_err(e: StoreError) -> ProvisionError {
    ProvisionError::Other(e.into())
}

fn is_block(pvc: &PersistentVolumeClaim) -> bool {
    pvc.spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .map(|m| m == "Block")
        .unwrap_or(false)
}

fn snapshot_ready(snap: &VolumeSnapshot) -> bool {
    snap.status
        .as_ref()
        .and_then(|s| s.ready_to_use)
        .unwrap_or(false)
}
