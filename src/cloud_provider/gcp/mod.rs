use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use google_cloud_auth::credentials::CredentialsFile;
use google_cloud_auth::project::Config as AuthConfig;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::TokenSourceProvider;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cloud_provider::finalizer::{add_finalizers, cleanup_step};
use crate::cloud_provider::{AddressType, Instance, InstanceStatus, Kind, Provider, ProviderData};
use crate::config::{ConfigVarBool, ConfigVarResolver, ConfigVarString};
use crate::constants;
use crate::errors::{CommandError, MachineError};
use crate::machine::{Machine, MachineSpec};
use crate::polling::{INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, PollError, poll_immediate};

const COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";
const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/compute";

const FINALIZER_INSTANCE: &str = "machine-engine/gcp-instance";

/// GCE labels only allow lowercase alphanumerics and dashes, so the usual
/// `Machine-UID` tag key becomes a label key here.
const UID_LABEL_KEY: &str = "machine-uid";
const NAME_LABEL_KEY: &str = "machine-name";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    /// Full service-account JSON, optionally base64-wrapped.
    pub service_account: ConfigVarString,
    pub zone: ConfigVarString,
    pub machine_type: ConfigVarString,
    pub disk_size: Option<i64>,
    pub disk_type: ConfigVarString,
    pub network: ConfigVarString,
    pub subnetwork: ConfigVarString,
    pub preemptible: ConfigVarBool,
    pub assign_public_ip_address: Option<bool>,
    pub custom_image: ConfigVarString,
    pub labels: BTreeMap<String, String>,
}

struct Config {
    service_account: String,
    zone: String,
    machine_type: String,
    disk_size: i64,
    disk_type: String,
    network: String,
    subnetwork: String,
    preemptible: bool,
    assign_public_ip_address: bool,
    custom_image: String,
    labels: BTreeMap<String, String>,
}

struct GceClient {
    http: reqwest::Client,
    bearer: String,
    project: String,
}

impl GceClient {
    async fn new(config: &Config) -> Result<Self, MachineError> {
        let raw_account = if config.service_account.trim_start().starts_with('{') {
            config.service_account.clone()
        } else {
            let decoded = general_purpose::STANDARD.decode(config.service_account.trim()).map_err(|e| {
                MachineError::new_invalid_configuration(format!("serviceAccount is neither JSON nor base64: {e}"))
            })?;
            String::from_utf8(decoded).map_err(|_| {
                MachineError::new_invalid_configuration("serviceAccount does not decode to UTF-8".to_string())
            })?
        };

        let credentials = CredentialsFile::new_from_str(&raw_account)
            .await
            .map_err(|e| MachineError::new_auth_failure(format!("cannot parse service account: {e}")))?;
        let project = credentials.project_id.clone().ok_or_else(|| {
            MachineError::new_invalid_configuration("service account carries no project_id".to_string())
        })?;

        let scopes = [COMPUTE_SCOPE];
        let provider = DefaultTokenSourceProvider::new_with_credentials(
            AuthConfig::default().with_scopes(&scopes),
            Box::new(credentials),
        )
        .await
        .map_err(|e| MachineError::new_auth_failure(format!("cannot build GCP token source: {e}")))?;

        let token = provider
            .token_source()
            .token()
            .await
            .map_err(|e| MachineError::new_auth_failure(format!("cannot acquire GCP token: {e}")))?;
        let bearer = token.strip_prefix("Bearer ").unwrap_or(&token).to_string();

        Ok(GceClient {
            http: crate::utilities::http_client_with_ca(None)?,
            bearer,
            project,
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
            .request(method, format!("{COMPUTE_ENDPOINT}{path}"))
            .bearer_auth(&self.bearer);
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
                Err(MachineError::new_auth_failure(format!("GCP {operation}: {status}")))
            }
            StatusCode::BAD_REQUEST => Err(MachineError::new_invalid_configuration(format!(
                "GCP {operation}: {payload}"
            ))),
            _ if payload.pointer("/error/errors/0/reason").and_then(|r| r.as_str()) == Some("quotaExceeded") => {
                Err(MachineError::new_insufficient_resources(format!("GCP {operation}: quota exceeded")))
            }
            _ => Err(MachineError::new_retryable(
                format!("GCP {operation} failed with {status}"),
                Some(payload.to_string()),
            )),
        }
    }
}

fn map_gce_status(status: &str) -> InstanceStatus {
    match status {
        "PROVISIONING" | "STAGING" => InstanceStatus::Creating,
        "RUNNING" => InstanceStatus::Running,
        "STOPPING" | "SUSPENDING" => InstanceStatus::Deleting,
        _ => InstanceStatus::Unknown,
    }
}

fn instance_from_gce(project: &str, zone: &str, vm: &Value) -> Instance {
    let name = vm.pointer("/name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
    let id = vm.pointer("/id").and_then(|i| i.as_str()).unwrap_or(&name).to_string();
    let status = vm
        .pointer("/status")
        .and_then(|s| s.as_str())
        .map(map_gce_status)
        .unwrap_or(InstanceStatus::Unknown);

    let mut addresses = HashMap::new();
    for interface in vm.pointer("/networkInterfaces").and_then(|n| n.as_array()).unwrap_or(&vec![]) {
        if let Some(ip) = interface.pointer("/networkIP").and_then(|ip| ip.as_str()) {
            addresses.insert(ip.to_string(), AddressType::InternalIp);
        }
        for access in interface.pointer("/accessConfigs").and_then(|a| a.as_array()).unwrap_or(&vec![]) {
            if let Some(ip) = access.pointer("/natIP").and_then(|ip| ip.as_str()) {
                addresses.insert(ip.to_string(), AddressType::ExternalIp);
            }
        }
    }

    Instance {
        provider_id: Some(format!("gce://{project}/{zone}/{name}")),
        id,
        name,
        addresses,
        status,
    }
}

pub struct GcpProvider {
    resolver: ConfigVarResolver,
}

impl GcpProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        GcpProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse gcp provider spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        Ok(Config {
            service_account: self
                .resolver
                .get_string_or_env(&raw.service_account, constants::GOOGLE_SERVICE_ACCOUNT)
                .await?,
            zone: self.resolver.get_string(&raw.zone).await?,
            machine_type: self.resolver.get_string(&raw.machine_type).await?,
            disk_size: raw.disk_size.unwrap_or(25),
            disk_type: self.resolver.get_string(&raw.disk_type).await?,
            network: self.resolver.get_string(&raw.network).await?,
            subnetwork: self.resolver.get_string(&raw.subnetwork).await?,
            preemptible: self.resolver.get_bool(&raw.preemptible).await?.0,
            assign_public_ip_address: raw.assign_public_ip_address.unwrap_or(true),
            custom_image: self.resolver.get_string(&raw.custom_image).await?,
            labels: raw.labels,
        })
    }

    fn source_image(config: &Config, spec: &MachineSpec) -> Result<String, MachineError> {
        if !config.custom_image.is_empty() {
            return Ok(config.custom_image.clone());
        }
        let family = match spec.provider_spec.operating_system {
            crate::machine::OperatingSystem::Ubuntu => "projects/ubuntu-os-cloud/global/images/family/ubuntu-2204-lts",
            crate::machine::OperatingSystem::Flatcar => {
                "projects/kinvolk-public/global/images/family/flatcar-stable"
            }
            os => return Err(MachineError::new_unsupported_operating_system(os, "gcp")),
        };
        Ok(family.to_string())
    }

    async fn instances_by_uid(&self, client: &GceClient, zone: &str, uid: &str) -> Result<Vec<Value>, MachineError> {
        let filter = urlencoding::encode(&format!("labels.{UID_LABEL_KEY}=\"{uid}\""));
        let path = format!("/projects/{}/zones/{zone}/instances?filter={filter}", client.project);
        let (_, listing) = client.request("ListInstances", reqwest::Method::GET, &path, None).await?;

        Ok(listing.pointer("/items").and_then(|i| i.as_array()).cloned().unwrap_or_default())
    }

    fn labels_of(&self, config: &Config, machine: &Machine) -> BTreeMap<String, String> {
        let mut labels = config.labels.clone();
        labels.insert(UID_LABEL_KEY.to_string(), machine.uid());
        labels.insert(NAME_LABEL_KEY.to_string(), machine.machine_name());
        labels
    }
}

#[async_trait]
impl Provider for GcpProvider {
    fn kind(&self) -> Kind {
        Kind::Gcp
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.disk_size.is_none() {
            raw.disk_size = Some(25);
        }
        if raw.disk_type.value.is_empty() && raw.disk_type.secret_key_ref.is_none() {
            raw.disk_type = ConfigVarString::from_literal("pd-standard");
        }
        if raw.assign_public_ip_address.is_none() {
            raw.assign_public_ip_address = Some(true);
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw)
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot serialize gcp provider spec: {e}")))?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        for (field, value) in [
            ("serviceAccount", &config.service_account),
            ("zone", &config.zone),
            ("machineType", &config.machine_type),
        ] {
            if value.is_empty() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "{field} must be configured"
                )));
            }
        }

        Self::source_image(&config, spec)?;

        let client = GceClient::new(&config).await?;

        let machine_type_path = format!(
            "/projects/{}/zones/{}/machineTypes/{}",
            client.project, config.zone, config.machine_type
        );
        let (status, _) = client
            .request("GetMachineType", reqwest::Method::GET, &machine_type_path, None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(MachineError::new_invalid_configuration(format!(
                "machine type `{}` not found in zone `{}`",
                config.machine_type, config.zone
            )));
        }

        if !config.subnetwork.is_empty() {
            let region = config.zone.rsplit_once('-').map(|(region, _)| region).unwrap_or(&config.zone);
            let subnetwork_path = format!(
                "/projects/{}/regions/{region}/subnetworks/{}",
                client.project, config.subnetwork
            );
            let (status, _) = client
                .request("GetSubnetwork", reqwest::Method::GET, &subnetwork_path, None)
                .await?;
            if status == StatusCode::NOT_FOUND {
                return Err(MachineError::new_invalid_configuration(format!(
                    "subnetwork `{}` not found",
                    config.subnetwork
                )));
            }
        }

        Ok(())
    }

    async fn get_cloud_config(&self, spec: &MachineSpec) -> Result<(String, String), MachineError> {
        let config = self.config(spec).await?;
        let cloud_config = format!(
            r#"[global]
zone = {}
network-name = {}
subnetwork-name = {}
"#,
            config.zone, config.network, config.subnetwork
        );
        Ok((cloud_config, "gce".to_string()))
    }

    async fn create(
        &self,
        machine: &Machine,
        data: &ProviderData,
        userdata: &str,
    ) -> Result<Instance, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = GceClient::new(&config).await?;

        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE]).await?;

        let mut network_interface = json!({});
        if !config.network.is_empty() {
            network_interface["network"] = json!(format!("projects/{}/global/networks/{}", client.project, config.network));
        }
        if !config.subnetwork.is_empty() {
            let region = config.zone.rsplit_once('-').map(|(region, _)| region).unwrap_or(&config.zone);
            network_interface["subnetwork"] = json!(format!(
                "projects/{}/regions/{region}/subnetworks/{}",
                client.project, config.subnetwork
            ));
        }
        if config.assign_public_ip_address {
            network_interface["accessConfigs"] = json!([{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }]);
        }

        let body = json!({
            "name": machine.machine_name(),
            "machineType": format!("zones/{}/machineTypes/{}", config.zone, config.machine_type),
            "labels": self.labels_of(&config, &machine),
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": Self::source_image(&config, &machine.spec)?,
                    "diskSizeGb": config.disk_size,
                    "diskType": format!("zones/{}/diskTypes/{}", config.zone, config.disk_type),
                },
            }],
            "networkInterfaces": [network_interface],
            "scheduling": { "preemptible": config.preemptible },
            "metadata": { "items": [{ "key": "user-data", "value": userdata }] },
        });

        let path = format!("/projects/{}/zones/{}/instances", client.project, config.zone);
        client.request("InsertInstance", reqwest::Method::POST, &path, Some(body)).await?;
        info!("gce instance issued for machine `{}`", machine.machine_name());

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
        let client = GceClient::new(&config).await?;

        let instances = self.instances_by_uid(&client, &config.zone, &machine.uid()).await?;
        instances
            .first()
            .map(|vm| instance_from_gce(&client.project, &config.zone, vm))
            .ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = GceClient::new(&config).await?;

        let step = cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let instances = self.instances_by_uid(&client, &config.zone, &machine.uid()).await?;
            if instances.is_empty() {
                return Ok(true);
            }

            for vm in &instances {
                if let Some(name) = vm.pointer("/name").and_then(|n| n.as_str()) {
                    let path = format!("/projects/{}/zones/{}/instances/{name}", client.project, config.zone);
                    client.request("DeleteInstance", reqwest::Method::DELETE, &path, None).await?;
                }
            }
            Ok(false)
        })
        .await?;

        Ok(step.is_some())
    }

    async fn migrate_uid(&self, machine: &Machine, _data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = GceClient::new(&config).await?;

        for vm in self.instances_by_uid(&client, &config.zone, &machine.uid()).await? {
            let Some(name) = vm.pointer("/name").and_then(|n| n.as_str()) else {
                continue;
            };
            let fingerprint = vm.pointer("/labelFingerprint").and_then(|f| f.as_str()).unwrap_or_default();
            let mut labels: BTreeMap<String, String> = vm
                .pointer("/labels")
                .and_then(|l| serde_json::from_value(l.clone()).ok())
                .unwrap_or_default();
            labels.insert(UID_LABEL_KEY.to_string(), new_uid.to_string());

            let path = format!(
                "/projects/{}/zones/{}/instances/{name}/setLabels",
                client.project, config.zone
            );
            client
                .request(
                    "SetLabels",
                    reqwest::Method::POST,
                    &path,
                    Some(json!({ "labels": labels, "labelFingerprint": fingerprint })),
                )
                .await?;
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("size".to_string(), raw.machine_type.value.clone()),
            ("zone".to_string(), raw.zone.value.clone()),
            ("image".to_string(), raw.custom_image.value.clone()),
        ]))
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        let mut by_credentials: HashMap<(String, String), Vec<&Machine>> = HashMap::new();
        for machine in machines {
            let config = self.config(&machine.spec).await?;
            by_credentials
                .entry((config.service_account, config.zone))
                .or_default()
                .push(machine);
        }

        for machines in by_credentials.values() {
            let Some(first) = machines.first() else { continue };
            let config = self.config(&first.spec).await?;
            let client = GceClient::new(&config).await?;

            let path = format!("/projects/{}/zones/{}/instances", client.project, config.zone);
            let (_, listing) = client.request("ListInstances", reqwest::Method::GET, &path, None).await?;

            let mut count_by_uid: HashMap<String, f64> = HashMap::new();
            for vm in listing.pointer("/items").and_then(|i| i.as_array()).unwrap_or(&vec![]) {
                if let Some(uid) = vm.pointer(&format!("/labels/{UID_LABEL_KEY}")).and_then(|u| u.as_str()) {
                    *count_by_uid.entry(uid.to_string()).or_default() += 1.0;
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
    use crate::config::InMemorySecretStore;
    use crate::machine::test_helpers;
    use std::sync::Arc;

    fn provider() -> GcpProvider {
        GcpProvider::new(ConfigVarResolver::new(Arc::new(InMemorySecretStore::new())))
    }

    #[test]
    fn test_add_defaults() {
        // setup:
        let machine = test_helpers::machine("node-1", "abc", Kind::Gcp, json!({"zone": "europe-west3-a"}));

        // execute:
        let defaulted = provider().add_defaults(machine.spec).unwrap();
        let raw: RawConfig = serde_json::from_value(defaulted.provider_spec.cloud_provider_spec).unwrap();

        // verify:
        assert_eq!(raw.disk_size, Some(25));
        assert_eq!(raw.disk_type.value, "pd-standard");
        assert_eq!(raw.assign_public_ip_address, Some(true));
    }

    #[test]
    fn test_gce_status_mapping() {
        // execute & verify:
        assert_eq!(map_gce_status("PROVISIONING"), InstanceStatus::Creating);
        assert_eq!(map_gce_status("RUNNING"), InstanceStatus::Running);
        assert_eq!(map_gce_status("STOPPING"), InstanceStatus::Deleting);
        assert_eq!(map_gce_status("TERMINATED"), InstanceStatus::Unknown);
    }

    #[test]
    fn test_instance_from_gce_provider_id() {
        // setup:
        let vm = json!({
            "name": "node-1",
            "id": "1234",
            "status": "RUNNING",
            "networkInterfaces": [{
                "networkIP": "10.156.0.2",
                "accessConfigs": [{ "natIP": "35.1.2.3" }],
            }],
        });

        // execute:
        let instance = instance_from_gce("my-project", "europe-west3-a", &vm);

        // verify:
        assert_eq!(instance.provider_id.as_deref(), Some("gce://my-project/europe-west3-a/node-1"));
        assert_eq!(instance.addresses.get("10.156.0.2"), Some(&AddressType::InternalIp));
        assert_eq!(instance.addresses.get("35.1.2.3"), Some(&AddressType::ExternalIp));
    }

    #[test]
    fn test_unsupported_os_for_default_image() {
        // setup:
        let config = Config {
            service_account: String::new(),
            zone: "europe-west3-a".to_string(),
            machine_type: "e2-medium".to_string(),
            disk_size: 25,
            disk_type: "pd-standard".to_string(),
            network: String::new(),
            subnetwork: String::new(),
            preemptible: false,
            assign_public_ip_address: true,
            custom_image: String::new(),
            labels: BTreeMap::new(),
        };
        let mut machine = test_helpers::machine("node-1", "abc", Kind::Gcp, json!({}));
        machine.spec.provider_spec.operating_system = crate::machine::OperatingSystem::CentOs;

        // execute:
        let err = GcpProvider::source_image(&config, &machine.spec).unwrap_err();

        // verify:
        assert!(err.is_terminal());
    }
}
