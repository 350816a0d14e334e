//! Endpoint publication: the selector-addressed Service exposing the
//! listening side, plus address publication into the status.
//!
//! Only the destination role with no explicit address needs a Service;
//! every other configuration is trivially ready.

use chrono::Utc;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, warn};

use portage_core::events::{EV_ENDPOINT_ADDRESS, EV_ENDPOINT_NO_ADDRESS};
use portage_core::{
    names, set_owned_by, EventSeverity, MoverSession, PrincipalProvisioner, VolumeProvisioner,
};
use portage_store::ObjectStore;

use crate::job::TRANSFER_PORT;
use crate::upsert::ensure_or_recreate;
use crate::{selector_labels, Mover, MoverError};

/// How long a Service may sit without an assigned address before the
/// caller is warned that the chosen service type may be wrong.
const ADDRESS_TIMEOUT_SECS: i64 = 600;

/// Annotation stamped when the no-address warning has been emitted for
/// the current stale period, so later cycles stay quiet.
const WARNED_ANNOTATION: &str = "portage.dev/no-address-warned-at";

impl<'a, S, V, P> Mover<'a, S, V, P>
where
    S: ObjectStore,
    V: VolumeProvisioner,
    P: PrincipalProvisioner,
{
    /// Returns true once the endpoint is ready (or not needed at all).
    pub(crate) async fn ensure_endpoint(&mut self) -> Result<bool, MoverError> {
        if self.session.role.is_source() || self.session.address.is_some() {
            // Connection will be outbound; no Service needed.
            return Ok(true);
        }

        let ns = self.session.owner.namespace.clone();
        let name = names::service_name(&self.session.owner, self.session.role);
        let session = self.session;
        let (_, svc) = ensure_or_recreate::<Service, _, _>(self.store, &ns, &name, |svc| {
            apply_service_spec(svc, session);
        })
        .await?;
        let Some(svc) = svc else {
            return Ok(false);
        };

        self.publish_address(svc).await
    }

    async fn publish_address(&mut self, svc: Service) -> Result<bool, MoverError> {
        let Some(address) = service_address(&svc) else {
            // No address yet; try again next cycle.
            self.update_status_address(None);
            if service_age_secs(&svc) >= ADDRESS_TIMEOUT_SECS {
                self.warn_no_address(svc).await;
            }
            return Ok(false);
        };

        self.clear_no_address_marker(svc).await;
        self.update_status_address(Some(address));
        Ok(true)
    }

    /// Record the published address, notifying only on first publish or
    /// change so steady-state cycles are silent.
    fn update_status_address(&mut self, address: Option<String>) {
        let changed = match (&self.status.address, &address) {
            (Some(prev), Some(next)) => prev != next,
            (None, Some(_)) => true,
            _ => false,
        };
        self.status.address = address.clone();
        if changed {
            if let Some(addr) = address {
                debug!(address = %addr, "service address published");
                self.events.emit(
                    &self.session.owner,
                    None,
                    EventSeverity::Normal,
                    EV_ENDPOINT_ADDRESS,
                    &format!("listening on address {addr} for incoming connections"),
                );
            }
        }
    }

    async fn warn_no_address(&mut self, mut svc: Service) {
        let already_warned = svc
            .metadata
            .annotations
            .as_ref()
            .map(|a| a.contains_key(WARNED_ANNOTATION))
            .unwrap_or(false);
        if already_warned {
            return;
        }
        let name = svc.metadata.name.clone().unwrap_or_default();
        self.events.emit(
            &self.session.owner,
            Some(&format!("Service/{name}")),
            EventSeverity::Warning,
            EV_ENDPOINT_NO_ADDRESS,
            &format!(
                "waiting for an address to be assigned to Service/{name}; \
                 ensure the proper service type was specified"
            ),
        );
        svc.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                WARNED_ANNOTATION.to_string(),
                Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            );
        // Best effort: failing to stamp the marker only risks an extra
        // warning next cycle.
        if let Err(e) = self.store.update(&svc).await {
            warn!(service = %name, error = %e, "could not stamp no-address marker");
        }
    }

    async fn clear_no_address_marker(&mut self, mut svc: Service) {
        let had_marker = svc
            .metadata
            .annotations
            .as_mut()
            .map(|a| a.remove(WARNED_ANNOTATION).is_some())
            .unwrap_or(false);
        if !had_marker {
            return;
        }
        if let Err(e) = self.store.update(&svc).await {
            warn!(error = %e, "could not clear no-address marker");
        }
    }
}

fn apply_service_spec(svc: &mut Service, session: &MoverSession) {
    set_owned_by(&mut svc.metadata, &session.owner);
    let annotations = svc.metadata.annotations.get_or_insert_with(Default::default);
    for (k, v) in &session.service_annotations {
        annotations.insert(k.clone(), v.clone());
    }

    let spec = svc.spec.get_or_insert_with(Default::default);
    spec.type_ = Some(
        session
            .service_type
            .unwrap_or_default()
            .as_service_type()
            .to_string(),
    );
    spec.selector = Some(selector_labels(&session.owner, session.role));
    spec.ports = Some(vec![ServicePort {
        name: Some("transfer".into()),
        port: session.port.unwrap_or(TRANSFER_PORT),
        target_port: Some(IntOrString::Int(TRANSFER_PORT)),
        protocol: Some("TCP".into()),
        ..Default::default()
    }]);
}

/// Extract a usable address from the service, by service type.
fn service_address(svc: &Service) -> Option<String> {
    let spec = svc.spec.as_ref()?;
    match spec.type_.as_deref() {
        Some("LoadBalancer") => svc
            .status
            .as_ref()?
            .load_balancer
            .as_ref()?
            .ingress
            .as_ref()?
            .first()
            .and_then(|i| i.hostname.clone().or_else(|| i.ip.clone())),
        Some("ExternalName") => spec.external_name.clone().filter(|n| !n.is_empty()),
        _ => spec
            .cluster_ip
            .clone()
            .filter(|ip| !ip.is_empty() && ip != "None"),
    }
}

fn service_age_secs(svc: &Service) -> i64 {
    svc.metadata
        .creation_timestamp
        .as_ref()
        .map(|t| (Utc::now() - t.0).num_seconds())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc_of_type(ty: &str) -> Service {
        let mut svc = Service::default();
        svc.spec.get_or_insert_with(Default::default).type_ = Some(ty.into());
        svc
    }

    #[test]
    fn cluster_ip_address_skips_headless() {
        let mut svc = svc_of_type("ClusterIP");
        svc.spec.as_mut().unwrap().cluster_ip = Some("None".into());
        assert_eq!(service_address(&svc), None);
        svc.spec.as_mut().unwrap().cluster_ip = Some("10.1.2.3".into());
        assert_eq!(service_address(&svc).as_deref(), Some("10.1.2.3"));
    }

    #[test]
    fn load_balancer_prefers_hostname_over_ip() {
        let mut svc = svc_of_type("LoadBalancer");
        svc.status = serde_json::from_value(serde_json::json!({
            "loadBalancer": {"ingress": [{"hostname": "lb.example.com", "ip": "1.2.3.4"}]}
        }))
        .ok();
        assert_eq!(service_address(&svc).as_deref(), Some("lb.example.com"));
    }

    #[test]
    fn external_name_is_used_verbatim() {
        let mut svc = svc_of_type("ExternalName");
        svc.spec.as_mut().unwrap().external_name = Some("xfer.example.org".into());
        assert_eq!(service_address(&svc).as_deref(), Some("xfer.example.org"));
    }
}
