//! Pre-shared-key secret lifecycle. Caller-supplied secrets are
//! validated and never touched; otherwise a key is generated once and
//! kept for the lifetime of the owning resource.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use portage_core::{names, set_owned_by, PrincipalProvisioner, VolumeProvisioner};
use portage_store::{ObjectStore, StoreError};

use crate::{Mover, MoverError};

/// Required field inside the key secret.
pub const PSK_FIELD: &str = "psk.txt";
/// Version marker prefixed to generated key material.
const KEY_PREFIX: &str = "portage:";
const KEY_BYTES: usize = 64;

impl<'a, S, V, P> Mover<'a, S, V, P>
where
    S: ObjectStore,
    V: VolumeProvisioner,
    P: PrincipalProvisioner,
{
    /// Resolve the key secret for this session, creating one when
    /// neither the caller nor a previous cycle supplied it. Every
    /// successful return names a usable secret.
    pub(crate) async fn ensure_key(&mut self) -> Result<String, MoverError> {
        let ns = &self.session.owner.namespace;

        if let Some(name) = &self.session.key_secret {
            let secret: Option<Secret> = self.store.get(ns, name).await?;
            let Some(secret) = secret else {
                return Err(MoverError::InvalidKeySecret {
                    name: name.clone(),
                    reason: "not found".into(),
                });
            };
            if !has_field(&secret, PSK_FIELD) {
                return Err(MoverError::InvalidKeySecret {
                    name: name.clone(),
                    reason: format!("missing required field {PSK_FIELD}"),
                });
            }
            self.status.key_secret = Some(name.clone());
            return Ok(name.clone());
        }

        let name = names::key_secret_name(&self.session.owner);
        match self.store.get::<Secret>(ns, &name).await? {
            Some(_) => {
                debug!(secret = %name, "key secret already present");
            }
            None => {
                let mut key = vec![0u8; KEY_BYTES];
                OsRng.fill_bytes(&mut key);

                let mut secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(ns.clone()),
                        ..Default::default()
                    },
                    string_data: Some(BTreeMap::from([(
                        PSK_FIELD.to_string(),
                        format!("{KEY_PREFIX}{}", hex::encode(&key)),
                    )])),
                    ..Default::default()
                };
                set_owned_by(&mut secret.metadata, &self.session.owner);

                match self.store.create(&secret).await {
                    Ok(_) => info!(secret = %name, "generated key secret"),
                    // Raced with another actor; the existing secret wins.
                    Err(StoreError::AlreadyExists { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.status.key_secret = Some(name.clone());
        Ok(name)
    }
}

fn has_field(secret: &Secret, field: &str) -> bool {
    secret
        .data
        .as_ref()
        .map(|d| d.contains_key(field))
        .unwrap_or(false)
        || secret
            .string_data
            .as_ref()
            .map(|d| d.contains_key(field))
            .unwrap_or(false)
}
