use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
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
use crate::utilities::get_header_with_bearer;

const API_ENDPOINT: &str = "https://api.hetzner.cloud/v1";

const FINALIZER_INSTANCE: &str = "machine-engine/hetzner-instance";

/// Hetzner labels are the tag store; label keys follow the same rules as
/// kubernetes labels, so the UID key is lowercased here.
const UID_LABEL_KEY: &str = "machine-uid";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub token: ConfigVarString,
    pub server_type: ConfigVarString,
    pub datacenter: ConfigVarString,
    pub location: ConfigVarString,
    pub image: ConfigVarString,
    pub networks: Vec<ConfigVarString>,
    pub labels: BTreeMap<String, String>,
}

struct Config {
    token: String,
    server_type: String,
    datacenter: String,
    location: String,
    image: String,
    networks: Vec<String>,
    labels: BTreeMap<String, String>,
}

struct HcloudClient {
    http: reqwest::Client,
    token: String,
}

impl HcloudClient {
    fn new(token: &str) -> Result<Self, MachineError> {
        Ok(HcloudClient {
            http: crate::utilities::http_client_with_ca(None)?,
            token: token.to_string(),
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
            .request(method, format!("{API_ENDPOINT}{path}"))
            .headers(get_header_with_bearer(&self.token));
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
                Err(MachineError::new_auth_failure(format!("Hetzner {operation}: {status}")))
            }
            StatusCode::UNPROCESSABLE_ENTITY => Err(MachineError::new_invalid_configuration(format!(
                "Hetzner {operation}: {payload}"
            ))),
            _ if payload.pointer("/error/code").and_then(|c| c.as_str()) == Some("resource_limit_exceeded") => {
                Err(MachineError::new_insufficient_resources(format!(
                    "Hetzner {operation}: resource limit exceeded"
                )))
            }
            _ => Err(MachineError::new_retryable(
                format!("Hetzner {operation} failed with {status}"),
                Some(payload.to_string()),
            )),
        }
    }
}

fn map_server_status(status: &str) -> InstanceStatus {
    match status {
        "running" => InstanceStatus::Running,
        "initializing" | "starting" => InstanceStatus::Creating,
        "deleting" => InstanceStatus::Deleting,
        _ => InstanceStatus::Unknown,
    }
}

fn instance_from_server(server: &Value) -> Instance {
    let id = server
        .pointer("/id")
        .and_then(|i| i.as_i64())
        .map(|i| i.to_string())
        .unwrap_or_default();
    let name = server.pointer("/name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
    let status = server
        .pointer("/status")
        .and_then(|s| s.as_str())
        .map(map_server_status)
        .unwrap_or(InstanceStatus::Unknown);

    let mut addresses = HashMap::new();
    if let Some(ip) = server.pointer("/public_net/ipv4/ip").and_then(|ip| ip.as_str()) {
        addresses.insert(ip.to_string(), AddressType::ExternalIp);
    }
    for private_net in server.pointer("/private_net").and_then(|p| p.as_array()).unwrap_or(&vec![]) {
        if let Some(ip) = private_net.pointer("/ip").and_then(|ip| ip.as_str()) {
            addresses.insert(ip.to_string(), AddressType::InternalIp);
        }
    }

    Instance {
        provider_id: Some(format!("hcloud://{id}")),
        id,
        name,
        addresses,
        status,
    }
}

pub struct HetznerProvider {
    resolver: ConfigVarResolver,
}

impl HetznerProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        HetznerProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse hetzner provider spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        let mut networks = Vec::with_capacity(raw.networks.len());
        for network in &raw.networks {
            networks.push(self.resolver.get_string(network).await?);
        }

        Ok(Config {
            token: self.resolver.get_string_or_env(&raw.token, constants::HZ_TOKEN).await?,
            server_type: self.resolver.get_string(&raw.server_type).await?,
            datacenter: self.resolver.get_string(&raw.datacenter).await?,
            location: self.resolver.get_string(&raw.location).await?,
            image: self.resolver.get_string(&raw.image).await?,
            networks,
            labels: raw.labels,
        })
    }

    async fn servers_by_uid(&self, client: &HcloudClient, uid: &str) -> Result<Vec<Value>, MachineError> {
        let selector = urlencoding::encode(&format!("{UID_LABEL_KEY}={uid}"));
        let (_, listing) = client
            .request(
                "ListServers",
                reqwest::Method::GET,
                &format!("/servers?label_selector={selector}"),
                None,
            )
            .await?;

        Ok(listing.pointer("/servers").and_then(|s| s.as_array()).cloned().unwrap_or_default())
    }

    fn labels_of(&self, config: &Config, machine: &Machine) -> BTreeMap<String, String> {
        let mut labels = config.labels.clone();
        labels.insert(UID_LABEL_KEY.to_string(), machine.uid());
        labels
    }
}

#[async_trait]
impl Provider for HetznerProvider {
    fn kind(&self) -> Kind {
        Kind::Hetzner
    }

    fn add_defaults(&self, spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        if config.token.is_empty() {
            return Err(MachineError::new_invalid_configuration("token must be configured".to_string()));
        }
        if config.server_type.is_empty() {
            return Err(MachineError::new_invalid_configuration(
                "serverType must be configured".to_string(),
            ));
        }
        if config.image.is_empty() {
            return Err(MachineError::new_invalid_configuration("image must be configured".to_string()));
        }

        let client = HcloudClient::new(&config.token)?;

        let (_, server_types) = client
            .request("ListServerTypes", reqwest::Method::GET, "/server_types", None)
            .await?;
        let type_exists = server_types
            .pointer("/server_types")
            .and_then(|t| t.as_array())
            .map(|types| {
                types
                    .iter()
                    .any(|t| t.pointer("/name").and_then(|n| n.as_str()) == Some(config.server_type.as_str()))
            })
            .unwrap_or(false);
        if !type_exists {
            return Err(MachineError::new_invalid_configuration(format!(
                "server type `{}` not found",
                config.server_type
            )));
        }

        if !config.location.is_empty() {
            let (status, _) = client
                .request(
                    "GetLocation",
                    reqwest::Method::GET,
                    &format!("/locations?name={}", config.location),
                    None,
                )
                .await?;
            if status == StatusCode::NOT_FOUND {
                return Err(MachineError::new_invalid_configuration(format!(
                    "location `{}` not found",
                    config.location
                )));
            }
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
        let client = HcloudClient::new(&config.token)?;

        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE]).await?;

        let mut body = json!({
            "name": machine.machine_name(),
            "server_type": config.server_type,
            "image": config.image,
            "user_data": userdata,
            "labels": self.labels_of(&config, &machine),
        });
        if !config.datacenter.is_empty() {
            body["datacenter"] = json!(config.datacenter);
        } else if !config.location.is_empty() {
            body["location"] = json!(config.location);
        }
        if !config.networks.is_empty() {
            body["networks"] = json!(config.networks);
        }

        client
            .request("CreateServer", reqwest::Method::POST, "/servers", Some(body))
            .await?;
        info!("hetzner server issued for machine `{}`", machine.machine_name());

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
        let client = HcloudClient::new(&config.token)?;

        let servers = self.servers_by_uid(&client, &machine.uid()).await?;
        servers
            .first()
            .map(instance_from_server)
            .ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = HcloudClient::new(&config.token)?;

        let step = cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let servers = self.servers_by_uid(&client, &machine.uid()).await?;
            if servers.is_empty() {
                return Ok(true);
            }

            for server in &servers {
                if let Some(id) = server.pointer("/id").and_then(|i| i.as_i64()) {
                    client
                        .request("DeleteServer", reqwest::Method::DELETE, &format!("/servers/{id}"), None)
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
        let client = HcloudClient::new(&config.token)?;

        for server in self.servers_by_uid(&client, &machine.uid()).await? {
            let Some(id) = server.pointer("/id").and_then(|i| i.as_i64()) else {
                continue;
            };
            let mut labels: BTreeMap<String, String> = server
                .pointer("/labels")
                .and_then(|l| serde_json::from_value(l.clone()).ok())
                .unwrap_or_default();
            labels.insert(UID_LABEL_KEY.to_string(), new_uid.to_string());

            client
                .request(
                    "UpdateServer",
                    reqwest::Method::PUT,
                    &format!("/servers/{id}"),
                    Some(json!({ "labels": labels })),
                )
                .await?;
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("size".to_string(), raw.server_type.value.clone()),
            ("location".to_string(), raw.location.value.clone()),
            ("image".to_string(), raw.image.value.clone()),
        ]))
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        let mut by_token: HashMap<String, Vec<&Machine>> = HashMap::new();
        for machine in machines {
            let config = self.config(&machine.spec).await?;
            by_token.entry(config.token).or_default().push(machine);
        }

        for (token, machines) in &by_token {
            let client = HcloudClient::new(token)?;
            let (_, listing) = client.request("ListServers", reqwest::Method::GET, "/servers", None).await?;

            let mut count_by_uid: HashMap<String, f64> = HashMap::new();
            for server in listing.pointer("/servers").and_then(|s| s.as_array()).unwrap_or(&vec![]) {
                if let Some(uid) = server.pointer(&format!("/labels/{UID_LABEL_KEY}")).and_then(|u| u.as_str()) {
                    *count_by_uid.entry(uid.to_string()).or_default() += 1.0;
                }
            }

            for machine in machines {
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
    fn test_server_status_mapping() {
        // execute & verify:
        assert_eq!(map_server_status("running"), InstanceStatus::Running);
        assert_eq!(map_server_status("initializing"), InstanceStatus::Creating);
        assert_eq!(map_server_status("deleting"), InstanceStatus::Deleting);
        assert_eq!(map_server_status("off"), InstanceStatus::Unknown);
    }

    #[test]
    fn test_instance_from_server() {
        // setup:
        let server = json!({
            "id": 42,
            "name": "node-1",
            "status": "running",
            "public_net": { "ipv4": { "ip": "188.1.2.3" } },
            "private_net": [{ "ip": "10.0.0.2" }],
        });

        // execute:
        let instance = instance_from_server(&server);

        // verify:
        assert_eq!(instance.id, "42");
        assert_eq!(instance.provider_id.as_deref(), Some("hcloud://42"));
        assert_eq!(instance.addresses.get("188.1.2.3"), Some(&AddressType::ExternalIp));
        assert_eq!(instance.addresses.get("10.0.0.2"), Some(&AddressType::InternalIp));
    }
}
