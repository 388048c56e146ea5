use std::future::Future;

use crate::cloud_provider::ProviderData;
use crate::errors::MachineError;
use crate::machine::Machine;

/// Appends the given finalizers, keeping their order. Must run before any
/// side-effecting cloud call that will need cleanup later.
pub async fn add_finalizers(
    data: &ProviderData,
    machine: &Machine,
    finalizers: &[&str],
) -> Result<Machine, MachineError> {
    if finalizers.iter().all(|f| machine.has_finalizer(f)) {
        return Ok(machine.clone());
    }

    let wanted: Vec<String> = finalizers.iter().map(|f| f.to_string()).collect();
    data.updater
        .update(machine, &move |m: &mut Machine| {
            let existing = m.metadata.finalizers.get_or_insert_with(Vec::new);
            for finalizer in &wanted {
                if !existing.contains(finalizer) {
                    existing.push(finalizer.clone());
                }
            }
        })
        .await
}

pub async fn remove_finalizer(
    data: &ProviderData,
    machine: &Machine,
    finalizer: &str,
) -> Result<Machine, MachineError> {
    if !machine.has_finalizer(finalizer) {
        return Ok(machine.clone());
    }

    let unwanted = finalizer.to_string();
    data.updater
        .update(machine, &move |m: &mut Machine| {
            if let Some(finalizers) = m.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != &unwanted);
            }
        })
        .await
}

/// One rung of the cleanup ladder. While the finalizer is present, `delete`
/// runs; the finalizer is removed only once `delete` reports the resource
/// gone (or never existed). Returns the updated machine when the rung is
/// drained, `None` when the caller should come back later. Re-invoking after
/// partial success is a no-op, which is what makes the ladder re-entrant.
pub async fn cleanup_step<F, Fut>(
    data: &ProviderData,
    machine: &Machine,
    finalizer: &str,
    delete: F,
) -> Result<Option<Machine>, MachineError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<bool, MachineError>>,
{
    if !machine.has_finalizer(finalizer) {
        return Ok(Some(machine.clone()));
    }

    if !delete().await? {
        return Ok(None);
    }

    Ok(Some(remove_finalizer(data, machine, finalizer).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_provider::{InMemoryMachineUpdater, Kind};
    use crate::config::{ConfigVarResolver, InMemorySecretStore};
    use crate::machine::test_helpers;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn provider_data() -> ProviderData {
        ProviderData::new(
            Arc::new(InMemoryMachineUpdater::default()),
            ConfigVarResolver::new(Arc::new(InMemorySecretStore::new())),
        )
    }

    #[tokio::test]
    async fn test_add_finalizers_keeps_order_and_deduplicates() {
        // setup:
        let data = provider_data();
        let machine = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({}));

        // execute:
        let machine = add_finalizers(&data, &machine, &["vm", "disks", "nic"]).await.unwrap();
        let machine = add_finalizers(&data, &machine, &["disks", "public-ip"]).await.unwrap();

        // verify:
        assert_eq!(
            machine.metadata.finalizers.as_ref().unwrap(),
            &vec![
                "vm".to_string(),
                "disks".to_string(),
                "nic".to_string(),
                "public-ip".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_step_skips_without_finalizer() {
        // setup:
        let data = provider_data();
        let machine = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({}));
        let delete_calls = Arc::new(AtomicU32::new(0));
        let delete_calls_in_step = delete_calls.clone();

        // execute:
        let result = cleanup_step(&data, &machine, "vm", move || {
            let delete_calls = delete_calls_in_step.clone();
            async move {
                delete_calls.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        })
        .await
        .unwrap();

        // verify: no finalizer, no deletion attempted
        assert!(result.is_some());
        assert_eq!(delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_step_removes_finalizer_once_gone() {
        // setup:
        let data = provider_data();
        let mut machine = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({}));
        machine.metadata.finalizers = Some(vec!["vm".to_string(), "disks".to_string()]);

        // execute: resource still draining
        let in_progress = cleanup_step(&data, &machine, "vm", || async { Ok(false) }).await.unwrap();

        // verify:
        assert!(in_progress.is_none());

        // execute: resource gone
        let drained = cleanup_step(&data, &machine, "vm", || async { Ok(true) })
            .await
            .unwrap()
            .unwrap();

        // verify: only the drained rung lost its finalizer
        assert!(!drained.has_finalizer("vm"));
        assert!(drained.has_finalizer("disks"));
    }
}
