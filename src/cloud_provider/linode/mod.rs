use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use rand::Rng;
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

const API_ENDPOINT: &str = "https://api.linode.com/v4";

const FINALIZER_INSTANCE: &str = "machine-engine/linode-instance";

fn uid_tag(uid: &str) -> String {
    format!("machine-uid:{uid}")
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub token: ConfigVarString,
    pub region: ConfigVarString,
    #[serde(rename = "type")]
    pub type_: ConfigVarString,
    pub image: ConfigVarString,
    pub private_networking: Option<bool>,
    pub tags: Vec<String>,
}

struct Config {
    token: String,
    region: String,
    type_: String,
    image: String,
    private_networking: bool,
    tags: Vec<String>,
}

struct LinodeClient {
    http: reqwest::Client,
    token: String,
}

impl LinodeClient {
    fn new(token: &str) -> Result<Self, MachineError> {
        Ok(LinodeClient {
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
                Err(MachineError::new_auth_failure(format!("Linode {operation}: {status}")))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Err(
                MachineError::new_invalid_configuration(format!("Linode {operation}: {payload}")),
            ),
            StatusCode::TOO_MANY_REQUESTS => Err(MachineError::new_retryable(
                format!("Linode {operation}: rate limited"),
                None,
            )),
            _ => Err(MachineError::new_retryable(
                format!("Linode {operation} failed with {status}"),
                Some(payload.to_string()),
            )),
        }
    }
}

fn map_linode_status(status: &str) -> InstanceStatus {
    match status {
        "running" => InstanceStatus::Running,
        "provisioning" | "booting" | "migrating" | "rebuilding" => InstanceStatus::Creating,
        "shutting_down" | "deleting" => InstanceStatus::Deleting,
        _ => InstanceStatus::Unknown,
    }
}

fn instance_from_linode(linode: &Value) -> Instance {
    let id = linode
        .pointer("/id")
        .and_then(|i| i.as_i64())
        .map(|i| i.to_string())
        .unwrap_or_default();
    let name = linode.pointer("/label").and_then(|l| l.as_str()).unwrap_or_default().to_string();
    let status = linode
        .pointer("/status")
        .and_then(|s| s.as_str())
        .map(map_linode_status)
        .unwrap_or(InstanceStatus::Unknown);

    let mut addresses = HashMap::new();
    for ip in linode.pointer("/ipv4").and_then(|i| i.as_array()).unwrap_or(&vec![]) {
        if let Some(ip) = ip.as_str() {
            // RFC1918 space is the private interconnect, the rest is public
            let kind = if ip.starts_with("192.168.") || ip.starts_with("10.") {
                AddressType::InternalIp
            } else {
                AddressType::ExternalIp
            };
            addresses.insert(ip.to_string(), kind);
        }
    }
    if let Some(ip) = linode.pointer("/ipv6").and_then(|i| i.as_str()) {
        addresses.insert(ip.split('/').next().unwrap_or(ip).to_string(), AddressType::ExternalIp);
    }

    Instance {
        provider_id: Some(format!("linode://{id}")),
        id,
        name,
        addresses,
        status,
    }
}

/// Deploying from an image requires a root password; it is random, never
/// stored, and access happens through the rendered SSH material instead.
fn random_root_password() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub struct LinodeProvider {
    resolver: ConfigVarResolver,
}

impl LinodeProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        LinodeProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse linode provider spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        Ok(Config {
            token: self.resolver.get_string_or_env(&raw.token, constants::LINODE_TOKEN).await?,
            region: self.resolver.get_string(&raw.region).await?,
            type_: self.resolver.get_string(&raw.type_).await?,
            image: self.resolver.get_string(&raw.image).await?,
            private_networking: raw.private_networking.unwrap_or(true),
            tags: raw.tags,
        })
    }

    async fn linodes_by_uid(&self, client: &LinodeClient, uid: &str) -> Result<Vec<Value>, MachineError> {
        let (_, listing) = client
            .request("ListInstances", reqwest::Method::GET, "/linode/instances", None)
            .await?;

        let tag = uid_tag(uid);
        Ok(listing
            .pointer("/data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|linode| {
                linode
                    .pointer("/tags")
                    .and_then(|t| t.as_array())
                    .map(|tags| tags.iter().any(|t| t.as_str() == Some(tag.as_str())))
                    .unwrap_or(false)
            })
            .collect())
    }
}

#[async_trait]
impl Provider for LinodeProvider {
    fn kind(&self) -> Kind {
        Kind::Linode
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.private_networking.is_none() {
            raw.private_networking = Some(true);
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw)
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot serialize linode provider spec: {e}")))?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        for (field, value) in [
            ("token", &config.token),
            ("region", &config.region),
            ("type", &config.type_),
            ("image", &config.image),
        ] {
            if value.is_empty() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "{field} must be configured"
                )));
            }
        }

        let client = LinodeClient::new(&config.token)?;

        let (status, _) = client
            .request(
                "GetRegion",
                reqwest::Method::GET,
                &format!("/regions/{}", config.region),
                None,
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(MachineError::new_invalid_configuration(format!(
                "region `{}` not found",
                config.region
            )));
        }

        let (status, _) = client
            .request(
                "GetType",
                reqwest::Method::GET,
                &format!("/linode/types/{}", config.type_),
                None,
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(MachineError::new_invalid_configuration(format!(
                "type `{}` not found",
                config.type_
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
        let client = LinodeClient::new(&config.token)?;

        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE]).await?;

        let mut tags = config.tags.clone();
        tags.push(uid_tag(&machine.uid()));

        let body = json!({
            "label": machine.machine_name(),
            "region": config.region,
            "type": config.type_,
            "image": config.image,
            "root_pass": random_root_password(),
            "private_ip": config.private_networking,
            "authorized_keys": machine.spec.provider_spec.ssh_public_keys,
            "metadata": { "user_data": general_purpose::STANDARD.encode(userdata) },
            "tags": tags,
        });

        client
            .request("CreateInstance", reqwest::Method::POST, "/linode/instances", Some(body))
            .await?;
        info!("linode instance issued for machine `{}`", machine.machine_name());

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
        let client = LinodeClient::new(&config.token)?;

        let candidates = self
            .linodes_by_uid(&client, &machine.uid())
            .await?
            .iter()
            .map(instance_from_linode)
            .collect();

        crate::cloud_provider::tagging::prefer_non_terminated(candidates)
            .ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = LinodeClient::new(&config.token)?;

        let step = cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let linodes = self.linodes_by_uid(&client, &machine.uid()).await?;
            if linodes.is_empty() {
                return Ok(true);
            }

            for linode in &linodes {
                if let Some(id) = linode.pointer("/id").and_then(|i| i.as_i64()) {
                    client
                        .request(
                            "DeleteInstance",
                            reqwest::Method::DELETE,
                            &format!("/linode/instances/{id}"),
                            None,
                        )
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
        let client = LinodeClient::new(&config.token)?;

        let old_tag = uid_tag(&machine.uid());
        for linode in self.linodes_by_uid(&client, &machine.uid()).await? {
            let Some(id) = linode.pointer("/id").and_then(|i| i.as_i64()) else {
                continue;
            };
            let mut tags: Vec<String> = linode
                .pointer("/tags")
                .and_then(|t| serde_json::from_value(t.clone()).ok())
                .unwrap_or_default();
            tags.retain(|tag| tag != &old_tag);
            tags.push(uid_tag(new_uid));

            client
                .request(
                    "UpdateInstance",
                    reqwest::Method::PUT,
                    &format!("/linode/instances/{id}"),
                    Some(json!({ "tags": tags })),
                )
                .await?;
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("size".to_string(), raw.type_.value.clone()),
            ("region".to_string(), raw.region.value.clone()),
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
            let client = LinodeClient::new(token)?;
            for machine in machines {
                let live = self
                    .linodes_by_uid(&client, &machine.uid())
                    .await?
                    .iter()
                    .map(instance_from_linode)
                    .filter(|instance| !instance.is_terminated())
                    .count();
                crate::metrics::INSTANCES_FOR_MACHINE.set(&machine.machine_name(), live as f64);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linode_status_mapping() {
        // execute & verify:
        assert_eq!(map_linode_status("running"), InstanceStatus::Running);
        assert_eq!(map_linode_status("provisioning"), InstanceStatus::Creating);
        assert_eq!(map_linode_status("shutting_down"), InstanceStatus::Deleting);
        assert_eq!(map_linode_status("offline"), InstanceStatus::Unknown);
    }

    #[test]
    fn test_instance_from_linode() {
        // setup:
        let linode = json!({
            "id": 123,
            "label": "node-1",
            "status": "running",
            "ipv4": ["192.168.143.5", "172.105.1.2"],
            "ipv6": "2a01:7e01::f03c/128",
        });

        // execute:
        let instance = instance_from_linode(&linode);

        // verify:
        assert_eq!(instance.provider_id.as_deref(), Some("linode://123"));
        assert_eq!(instance.addresses.get("192.168.143.5"), Some(&AddressType::InternalIp));
        assert_eq!(instance.addresses.get("172.105.1.2"), Some(&AddressType::ExternalIp));
        assert_eq!(instance.addresses.get("2a01:7e01::f03c"), Some(&AddressType::ExternalIp));
    }

    #[test]
    fn test_random_root_password_is_long_enough() {
        // execute:
        let password = random_root_password();

        // verify: 32 url-safe base64 encoded bytes
        assert!(password.len() >= 40);
        assert_ne!(password, random_root_password());
    }
}
