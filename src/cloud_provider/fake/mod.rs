use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::cloud_provider::{Instance, InstanceStatus, Kind, Provider, ProviderData};
use crate::config::ConfigVarResolver;
use crate::errors::MachineError;
use crate::machine::{Machine, MachineSpec};

/// In-memory driver backing the test suite: instances live in a
/// process-wide map keyed by machine UID, like a cloud keyed by tag.
static INSTANCES: Lazy<Mutex<HashMap<String, Instance>>> = Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
    pass_validation: bool,
}

pub struct FakeProvider {}

impl FakeProvider {
    pub fn new(_resolver: ConfigVarResolver) -> Self {
        FakeProvider {}
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        match &spec.provider_spec.cloud_provider_spec {
            serde_json::Value::Null => Ok(RawConfig::default()),
            value => serde_json::from_value(value.clone())
                .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse fake spec: {e}"))),
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn kind(&self) -> Kind {
        Kind::Fake
    }

    fn add_defaults(&self, spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = Self::raw_config(spec)?;
        if config.pass_validation {
            return Ok(());
        }
        Err(MachineError::new_invalid_configuration(
            "fake provider is configured to fail validation".to_string(),
        ))
    }

    async fn get_cloud_config(&self, _spec: &MachineSpec) -> Result<(String, String), MachineError> {
        Ok((String::new(), String::new()))
    }

    async fn create(
        &self,
        machine: &Machine,
        _data: &ProviderData,
        _userdata: &str,
    ) -> Result<Instance, MachineError> {
        let instance = Instance {
            id: format!("fake-{}", machine.uid()),
            name: machine.machine_name(),
            provider_id: Some(format!("fake:///{}", machine.uid())),
            addresses: HashMap::new(),
            status: InstanceStatus::Running,
        };

        INSTANCES.lock().unwrap().insert(machine.uid(), instance.clone());
        info!("fake instance `{}` created", instance.id);
        Ok(instance)
    }

    async fn get(&self, machine: &Machine, _data: &ProviderData) -> Result<Instance, MachineError> {
        INSTANCES
            .lock()
            .unwrap()
            .get(&machine.uid())
            .cloned()
            .ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, _data: &ProviderData) -> Result<bool, MachineError> {
        INSTANCES.lock().unwrap().remove(&machine.uid());
        Ok(true)
    }

    async fn migrate_uid(&self, machine: &Machine, _data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        let mut instances = INSTANCES.lock().unwrap();
        if let Some(instance) = instances.remove(&machine.uid()) {
            instances.insert(new_uid.to_string(), instance);
        }
        Ok(())
    }

    fn machine_metrics_labels(&self, _machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        Ok(BTreeMap::new())
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        let instances = INSTANCES.lock().unwrap();
        for machine in machines {
            let count = if instances.contains_key(&machine.uid()) { 1.0 } else { 0.0 };
            crate::metrics::INSTANCES_FOR_MACHINE.set(&machine.machine_name(), count);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_provider::InMemoryMachineUpdater;
    use crate::config::InMemorySecretStore;
    use crate::machine::test_helpers;
    use std::sync::Arc;

    fn provider() -> FakeProvider {
        FakeProvider::new(ConfigVarResolver::new(Arc::new(InMemorySecretStore::new())))
    }

    fn data() -> ProviderData {
        ProviderData::new(
            Arc::new(InMemoryMachineUpdater::default()),
            ConfigVarResolver::new(Arc::new(InMemorySecretStore::new())),
        )
    }

    #[tokio::test]
    async fn test_create_get_cleanup_lifecycle() {
        // setup:
        let provider = provider();
        let data = data();
        let machine = test_helpers::machine("node-1", "uid-lifecycle", Kind::Fake, serde_json::json!({}));

        // execute: create then discover
        let created = provider.create(&machine, &data, "#cloud-config").await.unwrap();
        let found = provider.get(&machine, &data).await.unwrap();

        // verify:
        assert_eq!(created.id, found.id);
        assert_eq!(found.status, InstanceStatus::Running);

        // execute: cleanup drains and discovery misses afterwards
        assert!(provider.cleanup(&machine, &data).await.unwrap());
        assert!(provider.get(&machine, &data).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_migrate_uid_moves_ownership() {
        // setup:
        let provider = provider();
        let data = data();
        let machine = test_helpers::machine("node-1", "uid-old", Kind::Fake, serde_json::json!({}));
        provider.create(&machine, &data, "#cloud-config").await.unwrap();

        // execute:
        provider.migrate_uid(&machine, &data, "uid-new").await.unwrap();

        // verify: the old UID no longer resolves, the new one does
        assert!(provider.get(&machine, &data).await.unwrap_err().is_not_found());
        let migrated = test_helpers::machine("node-1", "uid-new", Kind::Fake, serde_json::json!({}));
        assert!(provider.get(&migrated, &data).await.is_ok());
    }

    #[tokio::test]
    async fn test_validation_follows_the_knob() {
        // setup:
        let provider = provider();
        let passing = test_helpers::machine("node-1", "u", Kind::Fake, serde_json::json!({"passValidation": true}));
        let failing = test_helpers::machine("node-2", "u", Kind::Fake, serde_json::json!({}));

        // execute & verify:
        assert!(provider.validate(&passing.spec).await.is_ok());
        assert!(provider.validate(&failing.spec).await.unwrap_err().is_terminal());
    }
}
