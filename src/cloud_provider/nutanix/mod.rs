use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cloud_provider::finalizer::{add_finalizers, cleanup_step};
use crate::cloud_provider::{AddressType, Instance, InstanceStatus, Kind, Provider, ProviderData};
use crate::config::{ConfigVarResolver, ConfigVarString};
use crate::constants;
use crate::errors::{CommandError, MachineError};
use crate::machine::{Machine, MachineSpec};
use crate::polling::{INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, PollError, poll_immediate};

const FINALIZER_INSTANCE: &str = "machine-engine/nutanix-instance";

/// Prism Central category carrying the ownership value; created once per
/// cluster, one value per machine UID.
const UID_CATEGORY: &str = "MachineUID";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub endpoint: ConfigVarString,
    pub port: ConfigVarString,
    pub username: ConfigVarString,
    pub password: ConfigVarString,
    pub cluster_name: ConfigVarString,
    pub image_name: ConfigVarString,
    pub subnet_name: ConfigVarString,
    pub cpus: Option<i64>,
    pub memory_mb: Option<i64>,
    pub disk_size_gb: Option<i64>,
    pub allow_insecure: Option<bool>,
    pub ca_certificate: ConfigVarString,
}

struct Config {
    endpoint: String,
    port: String,
    username: String,
    password: String,
    cluster_name: String,
    image_name: String,
    subnet_name: String,
    cpus: i64,
    memory_mb: i64,
    disk_size_gb: i64,
    ca_certificate: Option<String>,
}

struct PrismClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl PrismClient {
    fn new(config: &Config) -> Result<Self, MachineError> {
        let endpoint = config.endpoint.trim_end_matches('/');
        let base_url = if config.port.is_empty() {
            format!("https://{endpoint}/api/nutanix/v3")
        } else {
            format!("https://{endpoint}:{}/api/nutanix/v3", config.port)
        };

        Ok(PrismClient {
            http: crate::utilities::http_client_with_ca(config.ca_certificate.as_deref())?,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn request(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value), MachineError> {
        let mut request = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(CommandError::from)?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        match status {
            _ if status.is_success() => Ok((status, payload)),
            StatusCode::NOT_FOUND => Ok((status, payload)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(MachineError::new_auth_failure(format!("Nutanix {operation}: {status}")))
            }
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => Err(
                MachineError::new_invalid_configuration(format!("Nutanix {operation}: {payload}")),
            ),
            _ => Err(MachineError::new_retryable(
                format!("Nutanix {operation} failed with {status}"),
                Some(payload.to_string()),
            )),
        }
    }

    async fn ensure_uid_category(&self, uid: &str) -> Result<(), MachineError> {
        self.request(
            "CreateCategoryKey",
            reqwest::Method::PUT,
            &format!("/categories/{UID_CATEGORY}"),
            Some(json!({ "name": UID_CATEGORY, "description": "machine ownership" })),
        )
        .await?;
        self.request(
            "CreateCategoryValue",
            reqwest::Method::PUT,
            &format!("/categories/{UID_CATEGORY}/{uid}"),
            Some(json!({ "value": uid })),
        )
        .await?;
        Ok(())
    }

    async fn find_reference(&self, operation: &str, kind: &str, name: &str) -> Result<Option<String>, MachineError> {
        let (_, listing) = self
            .request(
                operation,
                reqwest::Method::POST,
                &format!("/{kind}s/list"),
                Some(json!({ "filter": format!("name=={name}") })),
            )
            .await?;

        Ok(listing
            .pointer("/entities")
            .and_then(|e| e.as_array())
            .and_then(|entities| {
                entities
                    .iter()
                    .find(|entity| entity.pointer("/spec/name").and_then(|n| n.as_str()) == Some(name))
            })
            .and_then(|entity| entity.pointer("/metadata/uuid").and_then(|u| u.as_str()))
            .map(|uuid| uuid.to_string()))
    }
}

fn vm_uid_category(vm: &Value) -> Option<String> {
    vm.pointer(&format!("/metadata/categories/{UID_CATEGORY}"))
        .and_then(|c| c.as_str())
        .map(|c| c.to_string())
}

fn map_vm_state(vm: &Value) -> InstanceStatus {
    let state = vm.pointer("/status/state").and_then(|s| s.as_str()).unwrap_or_default();
    let power_state = vm
        .pointer("/status/resources/power_state")
        .and_then(|p| p.as_str())
        .unwrap_or_default();

    match (state, power_state) {
        ("COMPLETE", "ON") => InstanceStatus::Running,
        ("PENDING", _) => InstanceStatus::Creating,
        ("DELETE_PENDING" | "DELETE_IN_PROGRESS", _) => InstanceStatus::Deleting,
        _ => InstanceStatus::Unknown,
    }
}

fn instance_from_vm(vm: &Value) -> Instance {
    let id = vm
        .pointer("/metadata/uuid")
        .and_then(|u| u.as_str())
        .unwrap_or_default()
        .to_string();
    let name = vm
        .pointer("/spec/name")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();

    let mut addresses = HashMap::new();
    for nic in vm
        .pointer("/status/resources/nic_list")
        .and_then(|n| n.as_array())
        .unwrap_or(&vec![])
    {
        for endpoint in nic.pointer("/ip_endpoint_list").and_then(|e| e.as_array()).unwrap_or(&vec![]) {
            if let Some(ip) = endpoint.pointer("/ip").and_then(|ip| ip.as_str()) {
                addresses.insert(ip.to_string(), AddressType::InternalIp);
            }
        }
    }

    Instance {
        provider_id: Some(format!("nutanix://{id}")),
        id,
        name,
        addresses,
        status: map_vm_state(vm),
    }
}

pub struct NutanixProvider {
    resolver: ConfigVarResolver,
}

impl NutanixProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        NutanixProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse nutanix provider spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        let ca_certificate = {
            let pem = self.resolver.get_string(&raw.ca_certificate).await?;
            if pem.is_empty() { None } else { Some(pem) }
        };

        Ok(Config {
            endpoint: self.resolver.get_string_or_env(&raw.endpoint, constants::NUTANIX_ENDPOINT).await?,
            port: self.resolver.get_string_or_env(&raw.port, constants::NUTANIX_PORT).await?,
            username: self
                .resolver
                .get_string_or_env(&raw.username, constants::NUTANIX_USERNAME)
                .await?,
            password: self
                .resolver
                .get_string_or_env(&raw.password, constants::NUTANIX_PASSWORD)
                .await?,
            cluster_name: self.resolver.get_string(&raw.cluster_name).await?,
            image_name: self.resolver.get_string(&raw.image_name).await?,
            subnet_name: self.resolver.get_string(&raw.subnet_name).await?,
            cpus: raw.cpus.unwrap_or(2),
            memory_mb: raw.memory_mb.unwrap_or(2048),
            disk_size_gb: raw.disk_size_gb.unwrap_or(20),
            ca_certificate,
        })
    }

    async fn vms_by_uid(&self, client: &PrismClient, uid: &str) -> Result<Vec<Value>, MachineError> {
        let (_, listing) = client
            .request(
                "ListVms",
                reqwest::Method::POST,
                "/vms/list",
                Some(json!({ "kind": "vm", "length": 500 })),
            )
            .await?;

        Ok(listing
            .pointer("/entities")
            .and_then(|e| e.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|vm| vm_uid_category(vm).as_deref() == Some(uid))
            .collect())
    }
}

#[async_trait]
impl Provider for NutanixProvider {
    fn kind(&self) -> Kind {
        Kind::Nutanix
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.cpus.is_none() {
            raw.cpus = Some(2);
        }
        if raw.memory_mb.is_none() {
            raw.memory_mb = Some(2048);
        }
        if raw.disk_size_gb.is_none() {
            raw.disk_size_gb = Some(20);
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw)
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot serialize nutanix provider spec: {e}")))?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        for (field, value) in [
            ("endpoint", &config.endpoint),
            ("username", &config.username),
            ("password", &config.password),
            ("clusterName", &config.cluster_name),
            ("imageName", &config.image_name),
            ("subnetName", &config.subnet_name),
        ] {
            if value.is_empty() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "{field} must be configured"
                )));
            }
        }

        let client = PrismClient::new(&config)?;

        if client.find_reference("ListClusters", "cluster", &config.cluster_name).await?.is_none() {
            return Err(MachineError::new_invalid_configuration(format!(
                "cluster `{}` not found",
                config.cluster_name
            )));
        }
        if client.find_reference("ListImages", "image", &config.image_name).await?.is_none() {
            return Err(MachineError::new_invalid_configuration(format!(
                "image `{}` not found",
                config.image_name
            )));
        }
        if client.find_reference("ListSubnets", "subnet", &config.subnet_name).await?.is_none() {
            return Err(MachineError::new_invalid_configuration(format!(
                "subnet `{}` not found",
                config.subnet_name
            )));
        }

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
        let client = PrismClient::new(&config)?;

        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE]).await?;

        client.ensure_uid_category(&machine.uid()).await?;

        let cluster_uuid = client
            .find_reference("ListClusters", "cluster", &config.cluster_name)
            .await?
            .ok_or_else(|| {
                MachineError::new_invalid_configuration(format!("cluster `{}` not found", config.cluster_name))
            })?;
        let image_uuid = client
            .find_reference("ListImages", "image", &config.image_name)
            .await?
            .ok_or_else(|| {
                MachineError::new_invalid_configuration(format!("image `{}` not found", config.image_name))
            })?;
        let subnet_uuid = client
            .find_reference("ListSubnets", "subnet", &config.subnet_name)
            .await?
            .ok_or_else(|| {
                MachineError::new_invalid_configuration(format!("subnet `{}` not found", config.subnet_name))
            })?;

        let body = json!({
            "metadata": {
                "kind": "vm",
                "categories": { UID_CATEGORY: machine.uid() },
            },
            "spec": {
                "name": machine.machine_name(),
                "cluster_reference": { "kind": "cluster", "uuid": cluster_uuid },
                "resources": {
                    "num_sockets": 1,
                    "num_vcpus_per_socket": config.cpus,
                    "memory_size_mib": config.memory_mb,
                    "power_state": "ON",
                    "disk_list": [{
                        "device_properties": { "device_type": "DISK" },
                        "disk_size_mib": config.disk_size_gb * 1024,
                        "data_source_reference": { "kind": "image", "uuid": image_uuid },
                    }],
                    "nic_list": [{ "subnet_reference": { "kind": "subnet", "uuid": subnet_uuid } }],
                    "guest_customization": {
                        "cloud_init": { "user_data": general_purpose::STANDARD.encode(userdata) },
                    },
                },
            },
        });

        client.request("CreateVm", reqwest::Method::POST, "/vms", Some(body)).await?;
        info!("nutanix vm issued for machine `{}`", machine.machine_name());

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
        let client = PrismClient::new(&config)?;

        let candidates = self
            .vms_by_uid(&client, &machine.uid())
            .await?
            .iter()
            .map(instance_from_vm)
            .collect();

        crate::cloud_provider::tagging::prefer_non_terminated(candidates)
            .ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = PrismClient::new(&config)?;

        let step = cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let vms = self.vms_by_uid(&client, &machine.uid()).await?;
            if vms.is_empty() {
                return Ok(true);
            }

            for vm in &vms {
                if let Some(uuid) = vm.pointer("/metadata/uuid").and_then(|u| u.as_str()) {
                    client
                        .request("DeleteVm", reqwest::Method::DELETE, &format!("/vms/{uuid}"), None)
                        .await?;
                }
            }
            Ok(false)
        })
        .await?;

        Ok(step.is_some())
    }

    async fn migrate_uid(&self, machine: &Machine, _data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = PrismClient::new(&config)?;

        client.ensure_uid_category(new_uid).await?;

        for vm in self.vms_by_uid(&client, &machine.uid()).await? {
            let Some(uuid) = vm.pointer("/metadata/uuid").and_then(|u| u.as_str()) else {
                continue;
            };

            // v3 updates are full-spec PUTs with the current spec_version
            let mut updated = vm.clone();
            updated["metadata"]["categories"][UID_CATEGORY] = json!(new_uid);
            updated.as_object_mut().map(|vm| vm.remove("status"));

            client
                .request("UpdateVm", reqwest::Method::PUT, &format!("/vms/{uuid}"), Some(updated))
                .await?;
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("cluster".to_string(), raw.cluster_name.value.clone()),
            ("cpus".to_string(), raw.cpus.unwrap_or(2).to_string()),
            ("image".to_string(), raw.image_name.value.clone()),
        ]))
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        let mut by_credentials: HashMap<(String, String, String), Vec<&Machine>> = HashMap::new();
        for machine in machines {
            let config = self.config(&machine.spec).await?;
            by_credentials
                .entry((config.endpoint, config.username, config.password))
                .or_default()
                .push(machine);
        }

        for machines in by_credentials.values() {
            let Some(first) = machines.first() else { continue };
            let config = self.config(&first.spec).await?;
            let client = PrismClient::new(&config)?;

            let (_, listing) = client
                .request(
                    "ListVms",
                    reqwest::Method::POST,
                    "/vms/list",
                    Some(json!({ "kind": "vm", "length": 500 })),
                )
                .await?;

            let mut count_by_uid: HashMap<String, f64> = HashMap::new();
            for vm in listing.pointer("/entities").and_then(|e| e.as_array()).unwrap_or(&vec![]) {
                if let Some(uid) = vm_uid_category(vm) {
                    *count_by_uid.entry(uid).or_default() += 1.0;
                }
            }

            for machine in machines.iter() {
                let count = count_by_uid.get(&machine.uid()).copied().unwrap_or(0.0);
                crate::metrics::INSTANCES_FOR_MACHINE.set(&machine.machine_name(), count);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_state_mapping() {
        // setup:
        let running = json!({"status": {"state": "COMPLETE", "resources": {"power_state": "ON"}}});
        let pending = json!({"status": {"state": "PENDING", "resources": {}}});
        let deleting = json!({"status": {"state": "DELETE_PENDING", "resources": {}}});
        let off = json!({"status": {"state": "COMPLETE", "resources": {"power_state": "OFF"}}});

        // execute & verify:
        assert_eq!(map_vm_state(&running), InstanceStatus::Running);
        assert_eq!(map_vm_state(&pending), InstanceStatus::Creating);
        assert_eq!(map_vm_state(&deleting), InstanceStatus::Deleting);
        assert_eq!(map_vm_state(&off), InstanceStatus::Unknown);
    }

    #[test]
    fn test_vm_uid_category_extraction() {
        // setup:
        let vm = json!({"metadata": {"categories": {"MachineUID": "abc-123"}}});

        // execute & verify:
        assert_eq!(vm_uid_category(&vm).as_deref(), Some("abc-123"));
        assert_eq!(vm_uid_category(&json!({"metadata": {}})), None);
    }
}
