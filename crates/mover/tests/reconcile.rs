//! End-to-end reconciliation scenarios against the in-memory cluster
//! double, driving repeated `synchronize` passes the way a controller
//! loop would.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use portage_core::events::{
    RecordingSink, EV_ENDPOINT_ADDRESS, EV_ENDPOINT_NO_ADDRESS, EV_TRANSFER_FAILED,
    EV_TRANSFER_STARTED,
};
use portage_core::{
    CopyStrategy, DataVolume, ImageRef, MoverSession, MoverStatus, OwnerRef, Principal,
    ProvisionError, Role, SyncOutcome, TransferOutcome, VolumeAffinity, CLEANUP_LABEL,
};
use portage_mover::{Mover, MoverError};
use portage_store::{DeletePropagation, MemoryStore, ObjectStore, StoreError, StoreObject};

const NS: &str = "ns";
const OWNER_UID: &str = "owner-uid-1";

struct FakeVolumes {
    volume: DataVolume,
    image: Option<ImageRef>,
    trigger_timeout: bool,
    removed_markers: Mutex<Vec<String>>,
}

impl Default for FakeVolumes {
    fn default() -> Self {
        Self {
            volume: DataVolume {
                name: "work".into(),
                block_mode: false,
                read_only: false,
            },
            image: Some(ImageRef {
                kind: "VolumeSnapshot".into(),
                name: "snap-1".into(),
            }),
            trigger_timeout: false,
            removed_markers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl portage_core::VolumeProvisioner for FakeVolumes {
    async fn ensure_from_source(
        &self,
        source: &str,
        _name: &str,
    ) -> Result<Option<DataVolume>, ProvisionError> {
        if self.trigger_timeout {
            return Err(ProvisionError::CopyTriggerTimeout(format!(
                "manual trigger for {source} not updated within deadline"
            )));
        }
        Ok(Some(self.volume.clone()))
    }

    async fn ensure_new(
        &self,
        _name: &str,
        _cleanup_when_done: bool,
    ) -> Result<Option<DataVolume>, ProvisionError> {
        Ok(Some(self.volume.clone()))
    }

    async fn use_existing(&self, name: &str) -> Result<Option<DataVolume>, ProvisionError> {
        Ok(Some(DataVolume {
            name: name.into(),
            ..self.volume.clone()
        }))
    }

    async fn remove_snapshot_marker(&self, name: &str) -> Result<(), ProvisionError> {
        self.removed_markers.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn preserve_image(
        &self,
        _volume: &DataVolume,
    ) -> Result<Option<ImageRef>, ProvisionError> {
        Ok(self.image.clone())
    }

    async fn affinity_for(&self, _volume: &DataVolume) -> Result<VolumeAffinity, ProvisionError> {
        Ok(VolumeAffinity::default())
    }
}

struct FakePrincipals;

#[async_trait::async_trait]
impl portage_core::PrincipalProvisioner for FakePrincipals {
    async fn reconcile(&self) -> Result<Option<Principal>, anyhow::Error> {
        Ok(Some(Principal {
            name: "mover-sa".into(),
        }))
    }
}

fn owner() -> OwnerRef {
    OwnerRef {
        api_version: "portage.dev/v1alpha1".into(),
        kind: "ReplicationDestination".into(),
        name: "app".into(),
        namespace: NS.into(),
        uid: OWNER_UID.into(),
    }
}

fn session(role: Role) -> MoverSession {
    MoverSession {
        role,
        owner: owner(),
        image: "quay.io/portage/mover:latest".into(),
        key_secret: None,
        address: None,
        port: None,
        service_type: None,
        service_annotations: BTreeMap::new(),
        paused: false,
        privileged: false,
        main_volume: None,
        cleanup_temp_volume: false,
        copy_strategy: CopyStrategy::Snapshot,
        config: Default::default(),
        prior_status: MoverStatus::default(),
    }
}

struct Fixture {
    store: MemoryStore,
    volumes: FakeVolumes,
    principals: FakePrincipals,
    events: RecordingSink,
    session: MoverSession,
}

impl Fixture {
    fn new(session: MoverSession) -> Self {
        Self {
            store: MemoryStore::new(),
            volumes: FakeVolumes::default(),
            principals: FakePrincipals,
            events: RecordingSink::new(),
            session,
        }
    }

    /// One controller pass; carries the status into the next cycle the
    /// way a live controller persists it between reconciles.
    async fn cycle(&mut self) -> Result<SyncOutcome, MoverError> {
        let mut mover = Mover::new(
            &self.store,
            &self.volumes,
            &self.principals,
            &self.events,
            &self.session,
        );
        let out = mover.synchronize().await;
        let status = mover.into_status();
        self.session.prior_status = status;
        out
    }

    async fn cleanup(&mut self) -> Result<portage_core::CleanupOutcome, MoverError> {
        let mut mover = Mover::new(
            &self.store,
            &self.volumes,
            &self.principals,
            &self.events,
            &self.session,
        );
        let out = mover.cleanup().await;
        let status = mover.into_status();
        self.session.prior_status = status;
        out
    }

    fn status(&self) -> &MoverStatus {
        &self.session.prior_status
    }

    async fn assign_cluster_ip(&self, name: &str, ip: &str) {
        let mut svc: Service = self.store.get(NS, name).await.unwrap().unwrap();
        svc.spec.as_mut().unwrap().cluster_ip = Some(ip.into());
        self.store.update(&svc).await.unwrap();
    }

    async fn finish_job(&self, name: &str) {
        let mut job: Job = self.store.get(NS, name).await.unwrap().unwrap();
        job.status.get_or_insert_with(Default::default).succeeded = Some(1);
        self.store.update(&job).await.unwrap();
    }

    async fn fail_job(&self, name: &str, failures: i32) {
        let mut job: Job = self.store.get(NS, name).await.unwrap().unwrap();
        job.status.get_or_insert_with(Default::default).failed = Some(failures);
        self.store.update(&job).await.unwrap();
    }
}

#[tokio::test]
async fn destination_completes_after_address_job_and_image() {
    let mut fx = Fixture::new(session(Role::Destination));
    let svc_name = "portage-xfer-dst-app";
    let job_name = "portage-xfer-dst-app";

    // Cycle 1: the service exists but has no address yet; nothing past
    // the endpoint step may run.
    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    assert!(fx.store.get::<Service>(NS, svc_name).await.unwrap().is_some());
    assert!(fx.store.get::<Job>(NS, job_name).await.unwrap().is_none());
    assert!(fx
        .store
        .get::<Secret>(NS, "portage-xfer-app")
        .await
        .unwrap()
        .is_none());

    // Cycle 2: address assigned, so key and job come up; job still
    // running.
    fx.assign_cluster_ip(svc_name, "10.0.0.5").await;
    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    assert_eq!(fx.status().address.as_deref(), Some("10.0.0.5"));
    assert_eq!(fx.status().key_secret.as_deref(), Some("portage-xfer-app"));
    let secret: Secret = fx.store.get(NS, "portage-xfer-app").await.unwrap().unwrap();
    let psk = secret.string_data.unwrap().remove("psk.txt").unwrap();
    let hex_part = psk.strip_prefix("portage:").unwrap();
    assert_eq!(hex_part.len(), 128);
    assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));

    // Cycle 3: job finished and the image is preservable.
    fx.store
        .set_job_logs(job_name, "sent 1,024 bytes\nnoise line\ntotal size is 10,240");
    fx.finish_job(job_name).await;
    let out = fx.cycle().await.unwrap();
    assert_eq!(
        out,
        SyncOutcome::Complete {
            image: Some(ImageRef {
                kind: "VolumeSnapshot".into(),
                name: "snap-1".into(),
            })
        }
    );
    assert_eq!(fx.status().outcome, Some(TransferOutcome::Succeeded));
    let logs = fx.status().logs.clone().unwrap();
    assert!(logs.contains("total size is 10,240"));
    assert!(!logs.contains("noise line"));

    assert_eq!(fx.events.with_reason(EV_TRANSFER_STARTED).len(), 1);
    assert_eq!(fx.events.with_reason(EV_ENDPOINT_ADDRESS).len(), 1);
}

#[tokio::test]
async fn repeated_cycles_create_nothing_new() {
    let mut s = session(Role::Source);
    s.main_volume = Some("app-data".into());
    s.address = Some("203.0.113.9".into());
    let mut fx = Fixture::new(s);

    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    let after_first = fx.store.creations();
    assert!(after_first.contains(&"Secret/ns/portage-xfer-app".to_string()));
    assert!(after_first.contains(&"Job/ns/portage-xfer-src-app".to_string()));
    let key_before: Secret = fx.store.get(NS, "portage-xfer-app").await.unwrap().unwrap();

    for _ in 0..3 {
        assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    }
    assert_eq!(fx.store.creations(), after_first);
    let key_after: Secret = fx.store.get(NS, "portage-xfer-app").await.unwrap().unwrap();
    assert_eq!(key_before.string_data, key_after.string_data);
}

#[tokio::test]
async fn source_completes_once_job_succeeds() {
    let mut s = session(Role::Source);
    s.main_volume = Some("app-data".into());
    s.address = Some("203.0.113.9".into());
    let mut fx = Fixture::new(s);

    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    fx.finish_job("portage-xfer-src-app").await;
    assert_eq!(
        fx.cycle().await.unwrap(),
        SyncOutcome::Complete { image: None }
    );
    assert_eq!(fx.status().outcome, Some(TransferOutcome::Succeeded));
}

#[tokio::test]
async fn exhausted_job_is_recycled_with_failure_logs() {
    let mut s = session(Role::Source);
    s.main_volume = Some("app-data".into());
    s.address = Some("203.0.113.9".into());
    let mut fx = Fixture::new(s);
    let job_name = "portage-xfer-src-app";

    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    fx.store
        .set_job_logs(job_name, "attempting connection\nrsync error: connection refused");
    fx.fail_job(job_name, 2).await;

    // Backoff limit hit: logs snapshotted, job deleted.
    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    assert!(fx.store.get::<Job>(NS, job_name).await.unwrap().is_none());
    assert_eq!(fx.status().outcome, Some(TransferOutcome::Failed));
    assert!(fx.status().logs.clone().unwrap().contains("connection refused"));
    assert_eq!(fx.events.with_reason(EV_TRANSFER_FAILED).len(), 1);

    // Next cycle starts a fresh job.
    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    assert!(fx.store.get::<Job>(NS, job_name).await.unwrap().is_some());
    let job_creates = fx
        .store
        .creations()
        .into_iter()
        .filter(|c| c == "Job/ns/portage-xfer-src-app")
        .count();
    assert_eq!(job_creates, 2);
}

#[tokio::test]
async fn stale_service_warns_exactly_once() {
    let mut fx = Fixture::new(session(Role::Destination));
    let svc_name = "portage-xfer-dst-app";

    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    assert!(fx.events.with_reason(EV_ENDPOINT_NO_ADDRESS).is_empty());

    fx.store
        .backdate_creation::<Service>(NS, svc_name, chrono::Duration::minutes(30));
    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    assert_eq!(fx.events.with_reason(EV_ENDPOINT_NO_ADDRESS).len(), 1);

    // An address ends the stale period and clears the marker, so a
    // later stale period warns again.
    fx.assign_cluster_ip(svc_name, "10.0.0.5").await;
    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    let svc: Service = fx.store.get(NS, svc_name).await.unwrap().unwrap();
    let warned = svc
        .metadata
        .annotations
        .map(|a| a.contains_key("portage.dev/no-address-warned-at"))
        .unwrap_or(false);
    assert!(!warned);
}

#[tokio::test]
async fn address_changes_are_notified_once_each() {
    let mut fx = Fixture::new(session(Role::Destination));
    let svc_name = "portage-xfer-dst-app";

    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    fx.assign_cluster_ip(svc_name, "10.0.0.5").await;
    fx.cycle().await.unwrap();
    fx.cycle().await.unwrap(); // steady state, no new event
    fx.assign_cluster_ip(svc_name, "10.0.0.6").await;
    fx.cycle().await.unwrap();

    let addressed = fx.events.with_reason(EV_ENDPOINT_ADDRESS);
    assert_eq!(addressed.len(), 2);
    assert!(addressed[0].message.contains("10.0.0.5"));
    assert!(addressed[1].message.contains("10.0.0.6"));
    assert_eq!(fx.status().address.as_deref(), Some("10.0.0.6"));
}

#[tokio::test]
async fn supplied_key_secret_is_validated_not_replaced() {
    let mut s = session(Role::Source);
    s.main_volume = Some("app-data".into());
    s.address = Some("203.0.113.9".into());
    s.key_secret = Some("user-key".into());
    let mut fx = Fixture::new(s);

    // Missing secret is a hard error.
    let err = fx.cycle().await.unwrap_err();
    assert!(matches!(err, MoverError::InvalidKeySecret { ref name, .. } if name == "user-key"));

    // A secret without the required field is rejected too.
    let mut user_key = Secret {
        metadata: ObjectMeta {
            name: Some("user-key".into()),
            namespace: Some(NS.into()),
            ..Default::default()
        },
        ..Default::default()
    };
    fx.store.create(&user_key).await.unwrap();
    let err = fx.cycle().await.unwrap_err();
    assert!(matches!(err, MoverError::InvalidKeySecret { .. }));

    user_key.string_data = Some(BTreeMap::from([(
        "psk.txt".to_string(),
        "portage:abc123".to_string(),
    )]));
    fx.store.update(&user_key).await.unwrap();
    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    assert_eq!(fx.status().key_secret.as_deref(), Some("user-key"));
    // No generated secret alongside the supplied one.
    assert!(fx
        .store
        .get::<Secret>(NS, "portage-xfer-app")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn copy_trigger_timeout_is_soft() {
    let mut s = session(Role::Source);
    s.main_volume = Some("app-data".into());
    s.address = Some("203.0.113.9".into());
    let mut fx = Fixture::new(s);
    fx.volumes.trigger_timeout = true;

    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    assert_eq!(fx.status().outcome, Some(TransferOutcome::Failed));
    assert!(fx.status().logs.clone().unwrap().contains("manual trigger"));
    // Nothing downstream of the volume step ran.
    assert!(fx.store.creations().is_empty());
}

#[tokio::test]
async fn cleanup_sweeps_labeled_objects_and_marker() {
    let mut s = session(Role::Destination);
    s.main_volume = Some("dest-data".into());
    let mut fx = Fixture::new(s);
    let svc_name = "portage-xfer-dst-app";
    let job_name = "portage-xfer-dst-app";

    // Bring the endpoint, key, and job up through real cycles so the
    // objects carry exactly the labels the reconciler stamps.
    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    fx.assign_cluster_ip(svc_name, "10.0.0.5").await;
    assert_eq!(fx.cycle().await.unwrap(), SyncOutcome::InProgress);
    assert!(fx.store.get::<Job>(NS, job_name).await.unwrap().is_some());

    // Transient clone left by the volume step.
    let work = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("portage-app-dst".into()),
            namespace: Some(NS.into()),
            labels: Some(BTreeMap::from([(
                CLEANUP_LABEL.to_string(),
                OWNER_UID.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    };
    fx.store.create(&work).await.unwrap();
    // Unrelated object survives.
    let mut keep = work.clone();
    keep.metadata.name = Some("keep-me".into());
    keep.metadata.labels = None;
    fx.store.create(&keep).await.unwrap();

    assert_eq!(
        fx.cleanup().await.unwrap(),
        portage_core::CleanupOutcome::Complete
    );
    assert!(fx
        .store
        .get::<PersistentVolumeClaim>(NS, "portage-app-dst")
        .await
        .unwrap()
        .is_none());
    assert!(fx.store.get::<Job>(NS, job_name).await.unwrap().is_none());
    assert!(fx
        .store
        .get::<PersistentVolumeClaim>(NS, "keep-me")
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        fx.volumes.removed_markers.lock().unwrap().as_slice(),
        ["dest-data".to_string()]
    );
}

/// Store wrapper that rejects Job updates once armed; every other call
/// passes through to the in-memory double.
struct UpdateFailures {
    inner: MemoryStore,
    armed: AtomicBool,
}

impl UpdateFailures {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for UpdateFailures {
    async fn get<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        self.inner.get(namespace, name).await
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        self.inner.create(obj).await
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K, StoreError> {
        if self.armed.load(Ordering::SeqCst) && K::kind(&()) == "Job" {
            return Err(StoreError::Api("injected update failure".into()));
        }
        self.inner.update(obj).await
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: &str,
        name: &str,
        propagation: DeletePropagation,
    ) -> Result<(), StoreError> {
        self.inner.delete::<K>(namespace, name, propagation).await
    }

    async fn delete_labeled<K: StoreObject>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<(), StoreError> {
        self.inner.delete_labeled::<K>(namespace, selector).await
    }

    async fn job_logs(
        &self,
        namespace: &str,
        job_name: &str,
        tail_lines: i64,
    ) -> Result<String, StoreError> {
        self.inner.job_logs(namespace, job_name, tail_lines).await
    }
}

#[tokio::test]
async fn dead_job_is_recycled_even_when_the_update_fails() {
    let mut s = session(Role::Source);
    s.main_volume = Some("app-data".into());
    s.address = Some("203.0.113.9".into());
    let store = UpdateFailures::new();
    let volumes = FakeVolumes::default();
    let principals = FakePrincipals;
    let events = RecordingSink::new();
    let job_name = "portage-xfer-src-app";

    let mut mover = Mover::new(&store, &volumes, &principals, &events, &s);
    assert_eq!(mover.synchronize().await.unwrap(), SyncOutcome::InProgress);

    let mut job: Job = store.inner.get(NS, job_name).await.unwrap().unwrap();
    job.status.get_or_insert_with(Default::default).failed = Some(2);
    store.inner.update(&job).await.unwrap();

    // Pausing changes the desired parallelism, which forces an update;
    // the injected failure must not leave the exhausted job behind.
    s.paused = true;
    store.armed.store(true, Ordering::SeqCst);
    let mut mover = Mover::new(&store, &volumes, &principals, &events, &s);
    let err = mover.synchronize().await.unwrap_err();
    assert!(matches!(err, MoverError::Store(_)));
    assert!(store.inner.get::<Job>(NS, job_name).await.unwrap().is_none());
    assert_eq!(events.with_reason(EV_TRANSFER_FAILED).len(), 1);
}
