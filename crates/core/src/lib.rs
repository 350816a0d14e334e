//! Portage core types: transfer sessions, statuses, and the collaborator
//! seams (volume provisioning, principal provisioning, event emission)
//! consumed by the reconciler.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PodSecurityContext, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};

pub mod events;
pub mod names;

pub use events::{EmittedEvent, EventSeverity, EventSink, LogEventSink, RecordingSink};

/// Which side of the transfer this session drives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    Source,
    Destination,
}

impl Role {
    pub fn is_source(&self) -> bool {
        matches!(self, Role::Source)
    }

    /// Short tag used in object names and selector labels.
    pub fn short(&self) -> &'static str {
        match self {
            Role::Source => "src",
            Role::Destination => "dst",
        }
    }
}

/// Identity of the owning resource the reconciler acts on behalf of.
/// Created objects are owner-referenced to it for garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl OwnerRef {
    pub fn controller_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// How the working volume is obtained from the main volume.
/// `Direct` uses the volume in place and requires the mover pod to be
/// co-located with the node the volume is attached to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CopyStrategy {
    #[default]
    Snapshot,
    Direct,
}

/// Service exposure requested for the listening side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ExposeType {
    #[default]
    ClusterIp,
    LoadBalancer,
    ExternalName,
}

impl ExposeType {
    pub fn as_service_type(&self) -> &'static str {
        match self {
            ExposeType::ClusterIp => "ClusterIP",
            ExposeType::LoadBalancer => "LoadBalancer",
            ExposeType::ExternalName => "ExternalName",
        }
    }
}

/// Caller-supplied overrides layered onto the mover job last, after the
/// structural fields. Overriding the security floor is the caller's
/// explicit choice.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MoverConfig {
    pub resources: Option<ResourceRequirements>,
    pub pod_labels: BTreeMap<String, String>,
    pub pod_security_context: Option<PodSecurityContext>,
    pub debug: bool,
}

/// Immutable per-invocation description of one transfer endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoverSession {
    pub role: Role,
    pub owner: OwnerRef,
    /// Container image running the transfer client/server.
    pub image: String,
    /// Caller-supplied pre-shared-key secret name; generated when unset.
    pub key_secret: Option<String>,
    /// Explicit destination address; when set no Service is published.
    pub address: Option<String>,
    pub port: Option<i32>,
    pub service_type: Option<ExposeType>,
    pub service_annotations: BTreeMap<String, String>,
    pub paused: bool,
    pub privileged: bool,
    /// Caller-visible volume: the transfer source, or a pre-provisioned
    /// destination volume. Required on the source side.
    pub main_volume: Option<String>,
    /// Destination only: delete the working volume once the image has
    /// been preserved.
    pub cleanup_temp_volume: bool,
    pub copy_strategy: CopyStrategy,
    pub config: MoverConfig,
    /// Status carried over from the previous cycle; used to detect
    /// address changes so steady-state cycles stay silent.
    pub prior_status: MoverStatus,
}

/// Terminal result of the most recently observed transfer job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferOutcome {
    Succeeded,
    Failed,
}

/// Role-scoped projection written by the reconciler and read back by
/// callers after each cycle.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MoverStatus {
    /// Address peers should connect to (destination only).
    pub address: Option<String>,
    /// Name of the secret holding the pre-shared key.
    pub key_secret: Option<String>,
    pub outcome: Option<TransferOutcome>,
    /// Filtered log tail from the last finished transfer job.
    pub logs: Option<String>,
}

impl MoverStatus {
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.outcome = Some(TransferOutcome::Failed);
        self.logs = Some(message.into());
    }

    pub fn record_success(&mut self, message: impl Into<String>) {
        self.outcome = Some(TransferOutcome::Succeeded);
        self.logs = Some(message.into());
    }
}

/// Working volume handle for one cycle. Opaque to the reconciler beyond
/// its name and access attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataVolume {
    pub name: String,
    pub block_mode: bool,
    pub read_only: bool,
}

/// Reference to a preserved point-in-time image of the destination data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    pub kind: String,
    pub name: String,
}

/// Scheduling hints derived from a volume for node co-location.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeAffinity {
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
}

/// Principal (service account) the mover job runs as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

/// Result of one `synchronize` pass. `InProgress` is the normal outcome
/// of most invocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncOutcome {
    InProgress,
    Complete { image: Option<ImageRef> },
}

/// Result of one `cleanup` pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CleanupOutcome {
    InProgress,
    Complete,
}

/// Errors surfaced by the volume-provisioning collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The copy trigger has not been updated within its deadline. Soft:
    /// recorded into status, never bubbled as a pipeline error.
    #[error("copy trigger timed out: {0}")]
    CopyTriggerTimeout(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait::async_trait]
pub trait VolumeProvisioner: Send + Sync {
    /// Make the working volume for the source side from the main volume
    /// (clone/snapshot per copy strategy). `Ok(None)` means not ready.
    async fn ensure_from_source(
        &self,
        source: &str,
        name: &str,
    ) -> Result<Option<DataVolume>, ProvisionError>;

    /// Allocate (or find) a working volume on the destination side.
    async fn ensure_new(
        &self,
        name: &str,
        cleanup_when_done: bool,
    ) -> Result<Option<DataVolume>, ProvisionError>;

    /// Use a caller-provided volume as-is.
    async fn use_existing(&self, name: &str) -> Result<Option<DataVolume>, ProvisionError>;

    /// Clear the stale-snapshot marker from the named volume so the next
    /// snapshot-based cycle takes a fresh snapshot.
    async fn remove_snapshot_marker(&self, name: &str) -> Result<(), ProvisionError>;

    /// Preserve/export a point-in-time image of the working volume.
    /// `Ok(None)` means the image is not ready yet.
    async fn preserve_image(
        &self,
        volume: &DataVolume,
    ) -> Result<Option<ImageRef>, ProvisionError>;

    /// Node co-location hints for the volume (Direct copy strategy).
    async fn affinity_for(&self, volume: &DataVolume) -> Result<VolumeAffinity, ProvisionError>;
}

#[async_trait::async_trait]
pub trait PrincipalProvisioner: Send + Sync {
    /// Ensure the service account (and any roles/bindings) the mover job
    /// runs as. `Ok(None)` means not ready yet.
    async fn reconcile(&self) -> Result<Option<Principal>, anyhow::Error>;
}

/// Label applied to every transient per-cycle object; the value is the
/// owner uid, so cleanup is a single label-scoped delete per kind.
pub const CLEANUP_LABEL: &str = "portage.dev/cleanup";

/// Marker label identifying objects managed by this reconciler.
pub const CREATED_BY_LABEL: &str = "app.kubernetes.io/created-by";
pub const CREATED_BY_VALUE: &str = "portage";

/// Attach ownership + management labels and the controller reference.
pub fn set_owned_by(meta: &mut ObjectMeta, owner: &OwnerRef) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    if !refs.iter().any(|r| r.uid == owner.uid) {
        refs.push(owner.controller_reference());
    }
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(CREATED_BY_LABEL.to_string(), CREATED_BY_VALUE.to_string());
}

/// Tag an object as transient so the cleanup pass deletes it.
pub fn mark_for_cleanup(meta: &mut ObjectMeta, owner: &OwnerRef) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(CLEANUP_LABEL.to_string(), owner.uid.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerRef {
        OwnerRef {
            api_version: "portage.dev/v1alpha1".into(),
            kind: "ReplicationDestination".into(),
            name: "mydest".into(),
            namespace: "apps".into(),
            uid: "f2c1".into(),
        }
    }

    #[test]
    fn controller_reference_points_at_owner() {
        let r = owner().controller_reference();
        assert_eq!(r.kind, "ReplicationDestination");
        assert_eq!(r.controller, Some(true));
        assert_eq!(r.uid, "f2c1");
    }

    #[test]
    fn cleanup_mark_carries_owner_uid() {
        let mut meta = ObjectMeta::default();
        mark_for_cleanup(&mut meta, &owner());
        set_owned_by(&mut meta, &owner());
        let labels = meta.labels.unwrap();
        assert_eq!(labels.get(CLEANUP_LABEL).map(String::as_str), Some("f2c1"));
        assert_eq!(
            labels.get(CREATED_BY_LABEL).map(String::as_str),
            Some(CREATED_BY_VALUE)
        );
        assert_eq!(meta.owner_references.unwrap().len(), 1);
    }

    #[test]
    fn set_owned_by_is_idempotent() {
        let mut meta = ObjectMeta::default();
        set_owned_by(&mut meta, &owner());
        set_owned_by(&mut meta, &owner());
        assert_eq!(meta.owner_references.unwrap().len(), 1);
    }

    #[test]
    fn status_failure_snapshot_overwrites_prior_success() {
        let mut st = MoverStatus::default();
        st.record_success("done");
        st.record_failure("broke");
        assert_eq!(st.outcome, Some(TransferOutcome::Failed));
        assert_eq!(st.logs.as_deref(), Some("broke"));
    }
}
