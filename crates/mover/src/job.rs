//! Transfer job lifecycle: desired-state construction, ensure-or-
//! recreate convergence, and the bounded-retry state machine that
//! recycles a job once its backoff limit is hit.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaimVolumeSource,
    SecretVolumeSource, SecurityContext, Volume, VolumeDevice, VolumeMount,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use portage_core::events::{EV_TRANSFER_FAILED, EV_TRANSFER_STARTED};
use portage_core::{
    mark_for_cleanup, names, set_owned_by, CopyStrategy, DataVolume, EventSeverity, MoverSession,
    Principal, PrincipalProvisioner, TransferOutcome, VolumeAffinity, VolumeProvisioner,
    CREATED_BY_LABEL, CREATED_BY_VALUE,
};
use portage_store::{DeletePropagation, ObjectStore};

use crate::upsert::{ensure_or_recreate, UpsertOutcome};
use crate::{selector_labels, Mover, MoverError};

pub(crate) const TRANSFER_PORT: i32 = 8000;

const MOUNT_PATH: &str = "/data";
const DEVICE_PATH: &str = "/dev/block";
const DATA_VOLUME: &str = "data";
const KEYS_VOLUME: &str = "keys";
const TEMP_VOLUME: &str = "tempdir";
const SERVER_SCRIPT: &str = "/mover-transfer/server.sh";
const CLIENT_SCRIPT: &str = "/mover-transfer/client.sh";

/// Container-restart failures tolerated before the job is recycled.
const BACKOFF_LIMIT: i32 = 2;
const LOG_TAIL_LINES: i64 = 20;

static FAILURE_LINES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(error|failed|denied|refused|timed out|unreachable)").expect("static regex")
});
static SUCCESS_LINES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(sent |received |total size|bytes transferred|transfer completed)")
        .expect("static regex")
});

impl<'a, S, V, P> Mover<'a, S, V, P>
where
    S: ObjectStore,
    V: VolumeProvisioner,
    P: PrincipalProvisioner,
{
    /// Converge the transfer job; `Ok(Some(job))` only once it has
    /// succeeded. Backoff-limit exhaustion and immutable-field conflicts
    /// are absorbed by deleting the job so the next cycle recreates it.
    pub(crate) async fn ensure_job(
        &mut self,
        volume: &DataVolume,
        key_secret: &str,
        principal: &Principal,
    ) -> Result<Option<Job>, MoverError> {
        let ns = self.session.owner.namespace.clone();
        let name = names::job_name(&self.session.owner, self.session.role);

        let affinity = match self.session.copy_strategy {
            CopyStrategy::Direct => Some(
                self.volumes
                    .affinity_for(volume)
                    .await
                    .map_err(MoverError::Provision)?,
            ),
            CopyStrategy::Snapshot => None,
        };

        let session = self.session;
        let upsert = ensure_or_recreate::<Job, _, _>(self.store, &ns, &name, |job| {
            build_job(job, session, volume, key_secret, principal, affinity.as_ref());
        })
        .await;
        let (op, job) = match upsert {
            Ok(pair) => pair,
            Err(e) => {
                // A dead job must still be recycled even when converging
                // it failed; the update error alone would wedge it.
                if let Some(live) = self.store.get::<Job>(&ns, &name).await? {
                    if job_failed(&live) >= BACKOFF_LIMIT {
                        self.recycle_job(&ns, &name).await?;
                    }
                }
                return Err(e.into());
            }
        };
        let Some(job) = job else {
            // Recreated after an immutable conflict; next cycle rebuilds.
            return Ok(None);
        };

        let job_status = job.status.clone().unwrap_or_default();
        if job_status.failed.unwrap_or(0) >= BACKOFF_LIMIT {
            self.recycle_job(&ns, &name).await?;
            return Ok(None);
        }

        debug!(job = %name, ?op, "job reconciled");
        if op == UpsertOutcome::Created {
            let direction = if self.session.role.is_source() {
                "transmit"
            } else {
                "receive"
            };
            self.events.emit(
                &self.session.owner,
                Some(&format!("Job/{name}")),
                EventSeverity::Normal,
                EV_TRANSFER_STARTED,
                &format!("starting Job/{name} to {direction} data"),
            );
        }

        if job_status.succeeded.unwrap_or(0) == 0 {
            // Still queued or running.
            return Ok(None);
        }

        info!(job = %name, "transfer job completed");
        self.snapshot_job_logs(&name, TransferOutcome::Succeeded).await;
        Ok(Some(job))
    }

    /// Delete an exhausted job so the next cycle rebuilds it, keeping a
    /// filtered log tail in the status for the caller.
    async fn recycle_job(&mut self, ns: &str, name: &str) -> Result<(), MoverError> {
        self.snapshot_job_logs(name, TransferOutcome::Failed).await;
        info!(job = %name, "deleting job; backoff limit reached");
        self.events.emit(
            &self.session.owner,
            Some(&format!("Job/{name}")),
            EventSeverity::Warning,
            EV_TRANSFER_FAILED,
            "transfer job backoff limit reached",
        );
        self.store
            .delete::<Job>(ns, name, DeletePropagation::Background)
            .await?;
        Ok(())
    }

    /// Capture a filtered log tail from the job's pod into the status.
    /// Best effort: a fetch failure downgrades to a generic message.
    async fn snapshot_job_logs(&mut self, job_name: &str, outcome: TransferOutcome) {
        let ns = &self.session.owner.namespace;
        let text = match self.store.job_logs(ns, job_name, LOG_TAIL_LINES).await {
            Ok(t) => t,
            Err(e) => {
                warn!(job = %job_name, error = %e, "could not fetch job logs");
                String::new()
            }
        };
        match outcome {
            TransferOutcome::Failed => {
                let tail = filter_lines(&text, &FAILURE_LINES);
                self.status.record_failure(if tail.is_empty() {
                    "transfer job failed".to_string()
                } else {
                    tail
                });
            }
            TransferOutcome::Succeeded => {
                let tail = filter_lines(&text, &SUCCESS_LINES);
                self.status.record_success(if tail.is_empty() {
                    "transfer completed".to_string()
                } else {
                    tail
                });
            }
        }
    }
}

fn job_failed(job: &Job) -> i32 {
    job.status.as_ref().and_then(|s| s.failed).unwrap_or(0)
}

fn envvar(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub(crate) fn filter_lines(text: &str, re: &Regex) -> String {
    text.lines()
        .filter(|l| re.is_match(l))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Desired mover-job state; a pure function of the session, working
/// volume, key secret, and affinity hints. Mutates only fields this
/// reconciler owns so server-populated fields survive the upsert.
fn build_job(
    job: &mut Job,
    session: &MoverSession,
    volume: &DataVolume,
    key_secret: &str,
    principal: &Principal,
    affinity: Option<&VolumeAffinity>,
) {
    let owner = &session.owner;
    set_owned_by(&mut job.metadata, owner);
    mark_for_cleanup(&mut job.metadata, owner);
    let job_name = job.metadata.name.clone().unwrap_or_default();

    let spec = job.spec.get_or_insert_with(Default::default);
    spec.backoff_limit = Some(BACKOFF_LIMIT);
    spec.parallelism = Some(if session.paused { 0 } else { 1 });

    let tmeta = spec.template.metadata.get_or_insert_with(Default::default);
    tmeta.name = Some(job_name);
    let labels = tmeta.labels.get_or_insert_with(Default::default);
    for (k, v) in selector_labels(owner, session.role) {
        labels.insert(k, v);
    }
    labels.insert(CREATED_BY_LABEL.to_string(), CREATED_BY_VALUE.to_string());
    for (k, v) in &session.config.pod_labels {
        labels.insert(k.clone(), v.clone());
    }

    let mut env = Vec::new();
    let mut script = SERVER_SCRIPT;
    let mut read_only_claim = false;
    if session.role.is_source() {
        if let Some(addr) = &session.address {
            env.push(envvar("DESTINATION_ADDRESS", addr.clone()));
        }
        if let Some(port) = session.port {
            env.push(envvar("DESTINATION_PORT", port.to_string()));
        }
        script = CLIENT_SCRIPT;
        read_only_claim = volume.read_only;
    }

    let mut mounts = Vec::new();
    if !volume.block_mode {
        mounts.push(VolumeMount {
            name: DATA_VOLUME.into(),
            mount_path: MOUNT_PATH.into(),
            ..Default::default()
        });
    }
    mounts.push(VolumeMount {
        name: KEYS_VOLUME.into(),
        mount_path: "/keys".into(),
        read_only: Some(true),
        ..Default::default()
    });
    mounts.push(VolumeMount {
        name: TEMP_VOLUME.into(),
        mount_path: "/tmp".into(),
        ..Default::default()
    });
    let devices = volume.block_mode.then(|| {
        vec![VolumeDevice {
            name: DATA_VOLUME.into(),
            device_path: DEVICE_PATH.into(),
        }]
    });

    let pspec = spec.template.spec.get_or_insert_with(Default::default);
    pspec.containers = vec![Container {
        name: "transfer".into(),
        image: Some(session.image.clone()),
        command: Some(vec!["/bin/bash".into(), "-c".into(), script.into()]),
        env: Some(env),
        // Restrictive floor; the privileged opt-in below relaxes it.
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".into()]),
                add: None,
            }),
            privileged: Some(false),
            read_only_root_filesystem: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(mounts),
        volume_devices: devices,
        ..Default::default()
    }];
    pspec.restart_policy = Some("Never".into());
    pspec.service_account_name = Some(principal.name.clone());
    pspec.volumes = Some(vec![
        Volume {
            name: DATA_VOLUME.into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: volume.name.clone(),
                read_only: Some(read_only_claim),
            }),
            ..Default::default()
        },
        Volume {
            name: KEYS_VOLUME.into(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(key_secret.to_string()),
                default_mode: Some(0o600),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: TEMP_VOLUME.into(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".into()),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]);
    if let Some(aff) = affinity {
        pspec.node_selector = Some(aff.node_selector.clone());
        pspec.tolerations = Some(aff.tolerations.clone());
    }

    // Caller overrides win over the structural defaults above.
    if let Some(resources) = &session.config.resources {
        pspec.containers[0].resources = Some(resources.clone());
    }
    if let Some(pod_sc) = &session.config.pod_security_context {
        pspec.security_context = Some(pod_sc.clone());
    }

    let container = &mut pspec.containers[0];
    let container_env = container.env.get_or_insert_with(Vec::new);
    if session.privileged {
        container_env.push(envvar("PRIVILEGED_MOVER", "1"));
        if let Some(sc) = container.security_context.as_mut() {
            sc.run_as_user = Some(0);
            if let Some(caps) = sc.capabilities.as_mut() {
                caps.add = Some(vec![
                    "DAC_OVERRIDE".into(), // read/write all files
                    "CHOWN".into(),
                    "FOWNER".into(), // permission bits and times
                    "SETGID".into(),
                ]);
            }
        }
    } else {
        container_env.push(envvar("PRIVILEGED_MOVER", "0"));
    }
    if session.config.debug {
        container
            .env
            .get_or_insert_with(Vec::new)
            .push(envvar("PORTAGE_DEBUG", "1"));
    }
}
