use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cloud_provider::finalizer::{add_finalizers, cleanup_step};
use crate::cloud_provider::{AddressType, Instance, InstanceStatus, Kind, Provider, ProviderData};
use crate::config::{ConfigVarResolver, ConfigVarString};
use crate::constants;
use crate::errors::{CommandError, MachineError};
use crate::machine::{Machine, MachineSpec};
use crate::polling::{INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, PollError, poll_immediate};

const FINALIZER_INSTANCE: &str = "machine-engine/kubevirt-instance";

/// Kubernetes label keys cannot carry uppercase, so the ownership tag lives
/// under a dedicated label key on the VirtualMachine objects.
const UID_LABEL_KEY: &str = "machine-engine.io/machine-uid";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    /// Kubeconfig for the hosting cluster, raw YAML or base64 of it.
    pub kubeconfig: ConfigVarString,
    pub namespace: ConfigVarString,
    pub cpus: ConfigVarString,
    pub memory: ConfigVarString,
    /// Container-disk image the VM boots from.
    pub source_url: ConfigVarString,
}

struct Config {
    kubeconfig: String,
    namespace: String,
    cpus: String,
    memory: String,
    source_url: String,
}

fn virtual_machine_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachine"))
}

fn virtual_machine_instance_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachineInstance"))
}

fn map_printable_status(status: &str) -> InstanceStatus {
    match status {
        "Running" => InstanceStatus::Running,
        "Provisioning" | "Starting" | "WaitingForVolumeBinding" => InstanceStatus::Creating,
        "Terminating" => InstanceStatus::Deleting,
        _ => InstanceStatus::Unknown,
    }
}

pub struct KubevirtProvider {
    resolver: ConfigVarResolver,
}

impl KubevirtProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        KubevirtProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse kubevirt provider spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        let kubeconfig_raw = self
            .resolver
            .get_string_or_env(&raw.kubeconfig, constants::KUBEVIRT_KUBECONFIG)
            .await?;
        let kubeconfig = if kubeconfig_raw.trim_start().starts_with("apiVersion") {
            kubeconfig_raw
        } else {
            let decoded = general_purpose::STANDARD.decode(kubeconfig_raw.trim()).map_err(|e| {
                MachineError::new_invalid_configuration(format!("kubeconfig is neither YAML nor base64: {e}"))
            })?;
            String::from_utf8(decoded).map_err(|_| {
                MachineError::new_invalid_configuration("kubeconfig does not decode to UTF-8".to_string())
            })?
        };

        let namespace = {
            let explicit = self.resolver.get_string(&raw.namespace).await?;
            if explicit.is_empty() { "default".to_string() } else { explicit }
        };

        Ok(Config {
            kubeconfig,
            namespace,
            cpus: self.resolver.get_string(&raw.cpus).await?,
            memory: self.resolver.get_string(&raw.memory).await?,
            source_url: self.resolver.get_string(&raw.source_url).await?,
        })
    }

    async fn client(&self, config: &Config) -> Result<kube::Client, MachineError> {
        let kubeconfig: kube::config::Kubeconfig = serde_yaml::from_str(&config.kubeconfig)
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse kubeconfig: {e}")))?;
        let client_config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &kube::config::KubeConfigOptions::default())
                .await
                .map_err(|e| MachineError::new_invalid_configuration(format!("cannot build kube config: {e}")))?;
        kube::Client::try_from(client_config)
            .map_err(|e| MachineError::new_retryable("cannot build kubevirt client".to_string(), Some(e.to_string())))
    }

    fn vms_api(&self, client: kube::Client, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(client, namespace, &virtual_machine_resource())
    }

    async fn vms_by_uid(
        &self,
        api: &Api<DynamicObject>,
        uid: &str,
    ) -> Result<Vec<DynamicObject>, MachineError> {
        let params = ListParams::default().labels(&format!("{UID_LABEL_KEY}={uid}"));
        let listing = api.list(&params).await.map_err(CommandError::from)?;
        Ok(listing.items)
    }

    fn instance_from_vm(&self, namespace: &str, vm: &DynamicObject) -> Instance {
        let name = vm.metadata.name.clone().unwrap_or_default();
        let status = vm
            .data
            .pointer("/status/printableStatus")
            .and_then(|s| s.as_str())
            .map(map_printable_status)
            .unwrap_or(InstanceStatus::Unknown);

        Instance {
            provider_id: Some(format!("kubevirt://{namespace}/{name}")),
            id: name.clone(),
            name,
            addresses: HashMap::new(),
            status,
        }
    }
}

#[async_trait]
impl Provider for KubevirtProvider {
    fn kind(&self) -> Kind {
        Kind::Kubevirt
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.cpus.value.is_empty() && raw.cpus.secret_key_ref.is_none() {
            raw.cpus = ConfigVarString::from_literal("2");
        }
        if raw.memory.value.is_empty() && raw.memory.secret_key_ref.is_none() {
            raw.memory = ConfigVarString::from_literal("2Gi");
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw).map_err(|e| {
            MachineError::new_invalid_configuration(format!("cannot serialize kubevirt provider spec: {e}"))
        })?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        if config.kubeconfig.is_empty() {
            return Err(MachineError::new_invalid_configuration(
                "kubeconfig must be configured".to_string(),
            ));
        }
        if config.source_url.is_empty() {
            return Err(MachineError::new_invalid_configuration(
                "sourceURL must be configured".to_string(),
            ));
        }

        // listing proves both connectivity and that kubevirt is installed
        let client = self.client(&config).await?;
        self.vms_by_uid(&self.vms_api(client, &config.namespace), "validation-probe")
            .await?;

        Ok(())
    }

    async fn get_cloud_config(&self, _spec: &MachineSpec) -> Result<(String, String), MachineError> {
        Ok((String::new(), String::new()))
    }

    async fn create(
        &self,
        machine: &Machine,
        data: &ProviderData,
        userdata: &str,
    ) -> Result<Instance, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = self.client(&config).await?;
        let api = self.vms_api(client, &config.namespace);

        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE]).await?;

        let cpus = config.cpus.parse::<u32>().map_err(|_| {
            MachineError::new_invalid_configuration(format!("cpus `{}` is not a number", config.cpus))
        })?;

        let vm = json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachine",
            "metadata": {
                "name": machine.machine_name(),
                "namespace": config.namespace,
                "labels": { UID_LABEL_KEY: machine.uid() },
            },
            "spec": {
                "running": true,
                "template": {
                    "metadata": {
                        "labels": { UID_LABEL_KEY: machine.uid() },
                    },
                    "spec": {
                        "domain": {
                            "cpu": { "cores": cpus },
                            "resources": { "requests": { "memory": config.memory } },
                            "devices": {
                                "disks": [
                                    { "name": "containerdisk", "disk": { "bus": "virtio" } },
                                    { "name": "cloudinitdisk", "disk": { "bus": "virtio" } },
                                ],
                                "interfaces": [{
                                    "name": "default",
                                    "bridge": {},
                                    "macAddress": crate::network::random_local_mac(),
                                }],
                            },
                        },
                        "networks": [{ "name": "default", "pod": {} }],
                        "volumes": [
                            { "name": "containerdisk", "containerDisk": { "image": config.source_url } },
                            {
                                "name": "cloudinitdisk",
                                "cloudInitNoCloud": {
                                    "userDataBase64": general_purpose::STANDARD.encode(userdata),
                                },
                            },
                        ],
                    },
                },
            },
        });

        let vm: DynamicObject = serde_json::from_value(vm).map_err(CommandError::from)?;
        match api.create(&PostParams::default(), &vm).await {
            Ok(_) => {}
            // a previous interrupted reconcile may have created it already
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("virtual machine `{}` already exists", machine.machine_name());
            }
            Err(e) => return Err(CommandError::from(e).into()),
        }
        info!("kubevirt virtual machine issued for machine `{}`", machine.machine_name());

        match poll_immediate(INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, || async {
            match self.get(&machine, data).await {
                Ok(instance) => Ok(instance.status == InstanceStatus::Running),
                Err(err) if err.is_not_found() => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await
        {
            Ok(()) => self.get(&machine, data).await,
            Err(PollError::Timeout(waited)) => Err(MachineError::new_instance_not_ready(&machine.machine_name(), waited)),
            Err(PollError::Failed(err)) => Err(err),
        }
    }

    async fn get(&self, machine: &Machine, _data: &ProviderData) -> Result<Instance, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = self.client(&config).await?;
        let api = self.vms_api(client.clone(), &config.namespace);

        let vms = self.vms_by_uid(&api, &machine.uid()).await?;
        let Some(vm) = vms.first() else {
            return Err(MachineError::InstanceNotFound(machine.machine_name()));
        };

        let mut instance = self.instance_from_vm(&config.namespace, vm);

        // addresses live on the VirtualMachineInstance once it is up
        let vmi_api: Api<DynamicObject> =
            Api::namespaced_with(client, &config.namespace, &virtual_machine_instance_resource());
        if let Ok(vmi) = vmi_api.get(&instance.name).await {
            for interface in vmi
                .data
                .pointer("/status/interfaces")
                .and_then(|i| i.as_array())
                .unwrap_or(&vec![])
            {
                if let Some(ip) = interface.pointer("/ipAddress").and_then(|ip| ip.as_str()) {
                    instance.addresses.insert(ip.to_string(), AddressType::InternalIp);
                }
            }
        }

        Ok(instance)
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = self.client(&config).await?;
        let api = self.vms_api(client, &config.namespace);

        let step = cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let vms = self.vms_by_uid(&api, &machine.uid()).await?;
            if vms.is_empty() {
                return Ok(true);
            }

            for vm in &vms {
                if let Some(name) = &vm.metadata.name {
                    match api.delete(name, &DeleteParams::default()).await {
                        Ok(_) => {}
                        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                        Err(e) => return Err(CommandError::from(e).into()),
                    }
                }
            }
            Ok(false)
        })
        .await?;

        Ok(step.is_some())
    }

    async fn migrate_uid(&self, machine: &Machine, _data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = self.client(&config).await?;
        let api = self.vms_api(client, &config.namespace);

        for vm in self.vms_by_uid(&api, &machine.uid()).await? {
            let Some(name) = &vm.metadata.name else { continue };
            let patch = json!({
                "metadata": { "labels": { UID_LABEL_KEY: new_uid } },
            });
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(CommandError::from)?;
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("cpus".to_string(), raw.cpus.value.clone()),
            ("memory".to_string(), raw.memory.value.clone()),
            ("image".to_string(), raw.source_url.value.clone()),
        ]))
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        for machine in machines {
            let config = self.config(&machine.spec).await?;
            let client = self.client(&config).await?;
            let api = self.vms_api(client, &config.namespace);

            let count = self.vms_by_uid(&api, &machine.uid()).await?.len();
            crate::metrics::INSTANCES_FOR_MACHINE.set(&machine.machine_name(), count as f64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printable_status_mapping() {
        // execute & verify:
        assert_eq!(map_printable_status("Running"), InstanceStatus::Running);
        assert_eq!(map_printable_status("Provisioning"), InstanceStatus::Creating);
        assert_eq!(map_printable_status("Terminating"), InstanceStatus::Deleting);
        assert_eq!(map_printable_status("Stopped"), InstanceStatus::Unknown);
    }

    #[test]
    fn test_virtual_machine_gvk() {
        // execute:
        let resource = virtual_machine_resource();

        // verify:
        assert_eq!(resource.group, "kubevirt.io");
        assert_eq!(resource.version, "v1");
        assert_eq!(resource.kind, "VirtualMachine");
    }
}
