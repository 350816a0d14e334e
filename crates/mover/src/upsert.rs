//! Ensure-or-recreate: fetch-or-create, mutate only mutable fields, and
//! convert an immutable-field rejection into delete-now/recreate-next-
//! cycle instead of a fatal error.

use kube::Resource;
use tracing::warn;

use portage_store::{DeletePropagation, ObjectStore, StoreError, StoreObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
    /// The live object was deleted after an immutable-field conflict;
    /// the next pass recreates it from scratch.
    Recreated,
}

/// Converge one object toward the state produced by `mutate`.
///
/// `mutate` receives either a fresh object (create path) or the live
/// object (update path) and must set the desired fields in place,
/// leaving server-owned fields alone. No update is issued when the
/// mutation is a no-op, so steady-state cycles stay write-free.
pub async fn ensure_or_recreate<K, S, F>(
    store: &S,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<(UpsertOutcome, Option<K>), StoreError>
where
    K: StoreObject + Default,
    S: ObjectStore + ?Sized,
    F: FnOnce(&mut K),
{
    match store.get::<K>(namespace, name).await? {
        None => {
            let mut fresh = K::default();
            fresh.meta_mut().name = Some(name.to_string());
            fresh.meta_mut().namespace = Some(namespace.to_string());
            mutate(&mut fresh);
            let created = store.create(&fresh).await?;
            Ok((UpsertOutcome::Created, Some(created)))
        }
        Some(existing) => {
            let mut desired = existing.clone();
            mutate(&mut desired);
            if serde_json::to_value(&existing)? == serde_json::to_value(&desired)? {
                return Ok((UpsertOutcome::Unchanged, Some(existing)));
            }
            match store.update(&desired).await {
                Ok(updated) => Ok((UpsertOutcome::Updated, Some(updated))),
                Err(e) if e.is_immutable() => {
                    warn!(
                        kind = %K::kind(&()),
                        object = %format!("{namespace}/{name}"),
                        "immutable field conflict; deleting so the next cycle recreates"
                    );
                    store
                        .delete::<K>(namespace, name, DeletePropagation::Background)
                        .await?;
                    Ok((UpsertOutcome::Recreated, None))
                }
                Err(e) => Err(e),
            }
        }
    }
}
