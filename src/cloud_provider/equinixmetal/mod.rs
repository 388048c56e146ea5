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

const API_ENDPOINT: &str = "https://api.equinix.com/metal/v1";

const FINALIZER_INSTANCE: &str = "machine-engine/equinixmetal-instance";

fn uid_tag(uid: &str) -> String {
    format!("machine-uid:{uid}")
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub token: ConfigVarString,
    pub project_id: ConfigVarString,
    pub metro: ConfigVarString,
    pub facilities: Vec<ConfigVarString>,
    pub plan: ConfigVarString,
    pub billing_cycle: ConfigVarString,
    pub operating_system: ConfigVarString,
    pub tags: Vec<String>,
}

struct Config {
    token: String,
    project_id: String,
    metro: String,
    facilities: Vec<String>,
    plan: String,
    billing_cycle: String,
    operating_system: String,
    tags: Vec<String>,
}

struct MetalClient {
    http: reqwest::Client,
    token: String,
}

impl MetalClient {
    fn new(token: &str) -> Result<Self, MachineError> {
        Ok(MetalClient {
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
            .header("X-Auth-Token", &self.token)
            .header("Content-Type", "application/json");
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
                Err(MachineError::new_auth_failure(format!("Equinix Metal {operation}: {status}")))
            }
            StatusCode::UNPROCESSABLE_ENTITY => Err(MachineError::new_invalid_configuration(format!(
                "Equinix Metal {operation}: {payload}"
            ))),
            _ => Err(MachineError::new_retryable(
                format!("Equinix Metal {operation} failed with {status}"),
                Some(payload.to_string()),
            )),
        }
    }
}

fn map_device_state(state: &str) -> InstanceStatus {
    match state {
        "active" => InstanceStatus::Running,
        "queued" | "provisioning" | "powering_on" => InstanceStatus::Creating,
        "deprovisioning" | "powering_off" => InstanceStatus::Deleting,
        "deleted" => InstanceStatus::Deleted,
        _ => InstanceStatus::Unknown,
    }
}

fn instance_from_device(device: &Value) -> Instance {
    let id = device.pointer("/id").and_then(|i| i.as_str()).unwrap_or_default().to_string();
    let name = device
        .pointer("/hostname")
        .and_then(|h| h.as_str())
        .unwrap_or_default()
        .to_string();
    let status = device
        .pointer("/state")
        .and_then(|s| s.as_str())
        .map(map_device_state)
        .unwrap_or(InstanceStatus::Unknown);

    let mut addresses = HashMap::new();
    for address in device.pointer("/ip_addresses").and_then(|a| a.as_array()).unwrap_or(&vec![]) {
        let Some(ip) = address.pointer("/address").and_then(|a| a.as_str()) else {
            continue;
        };
        let public = address.pointer("/public").and_then(|p| p.as_bool()).unwrap_or(false);
        let kind = if public { AddressType::ExternalIp } else { AddressType::InternalIp };
        addresses.insert(ip.to_string(), kind);
    }

    Instance {
        provider_id: Some(format!("equinixmetal://{id}")),
        id,
        name,
        addresses,
        status,
    }
}

pub struct EquinixMetalProvider {
    resolver: ConfigVarResolver,
    kind: Kind,
}

impl EquinixMetalProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        EquinixMetalProvider {
            resolver,
            kind: Kind::Equinixmetal,
        }
    }

    /// Constructor for Machine records still carrying the retired `packet`
    /// tag; only the env-var fallbacks differ.
    pub fn new_legacy_packet(resolver: ConfigVarResolver) -> Self {
        EquinixMetalProvider {
            resolver,
            kind: Kind::Packet,
        }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone()).map_err(|e| {
            MachineError::new_invalid_configuration(format!("cannot parse equinix metal provider spec: {e}"))
        })
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        let (token_env, project_env) = if self.kind == Kind::Packet {
            (constants::PACKET_API_KEY, constants::PACKET_PROJECT_ID)
        } else {
            (constants::METAL_AUTH_TOKEN, constants::METAL_PROJECT_ID)
        };

        let mut facilities = Vec::with_capacity(raw.facilities.len());
        for facility in &raw.facilities {
            facilities.push(self.resolver.get_string(facility).await?);
        }

        Ok(Config {
            token: self.resolver.get_string_or_env(&raw.token, token_env).await?,
            project_id: self.resolver.get_string_or_env(&raw.project_id, project_env).await?,
            metro: self.resolver.get_string(&raw.metro).await?,
            facilities,
            plan: self.resolver.get_string(&raw.plan).await?,
            billing_cycle: self.resolver.get_string(&raw.billing_cycle).await?,
            operating_system: self.resolver.get_string(&raw.operating_system).await?,
            tags: raw.tags,
        })
    }

    async fn devices_by_uid(&self, client: &MetalClient, project_id: &str, uid: &str) -> Result<Vec<Value>, MachineError> {
        let (_, listing) = client
            .request(
                "ListDevices",
                reqwest::Method::GET,
                &format!("/projects/{project_id}/devices?per_page=1000"),
                None,
            )
            .await?;

        let tag = uid_tag(uid);
        Ok(listing
            .pointer("/devices")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|device| {
                device
                    .pointer("/tags")
                    .and_then(|t| t.as_array())
                    .map(|tags| tags.iter().any(|t| t.as_str() == Some(tag.as_str())))
                    .unwrap_or(false)
            })
            .collect())
    }
}

#[async_trait]
impl Provider for EquinixMetalProvider {
    fn kind(&self) -> Kind {
        self.kind
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.billing_cycle.value.is_empty() && raw.billing_cycle.secret_key_ref.is_none() {
            raw.billing_cycle = ConfigVarString::from_literal("hourly");
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw).map_err(|e| {
            MachineError::new_invalid_configuration(format!("cannot serialize equinix metal provider spec: {e}"))
        })?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        for (field, value) in [
            ("token", &config.token),
            ("projectID", &config.project_id),
            ("plan", &config.plan),
            ("operatingSystem", &config.operating_system),
        ] {
            if value.is_empty() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "{field} must be configured"
                )));
            }
        }
        if config.metro.is_empty() && config.facilities.is_empty() {
            return Err(MachineError::new_invalid_configuration(
                "either metro or facilities must be configured".to_string(),
            ));
        }

        let client = MetalClient::new(&config.token)?;

        let (status, _) = client
            .request(
                "GetProject",
                reqwest::Method::GET,
                &format!("/projects/{}", config.project_id),
                None,
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(MachineError::new_invalid_configuration(format!(
                "project `{}` not found",
                config.project_id
            )));
        }

        let (_, plans) = client
            .request(
                "ListPlans",
                reqwest::Method::GET,
                &format!("/projects/{}/plans", config.project_id),
                None,
            )
            .await?;
        let plan_exists = plans
            .pointer("/plans")
            .and_then(|p| p.as_array())
            .map(|plans| {
                plans
                    .iter()
                    .any(|plan| plan.pointer("/slug").and_then(|s| s.as_str()) == Some(config.plan.as_str()))
            })
            .unwrap_or(false);
        if !plan_exists {
            return Err(MachineError::new_invalid_configuration(format!(
                "plan `{}` not found",
                config.plan
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
        let client = MetalClient::new(&config.token)?;

        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE]).await?;

        let mut tags = config.tags.clone();
        tags.push(uid_tag(&machine.uid()));

        let mut body = json!({
            "hostname": machine.machine_name(),
            "plan": config.plan,
            "operating_system": config.operating_system,
            "billing_cycle": config.billing_cycle,
            "userdata": userdata,
            "tags": tags,
        });
        if !config.metro.is_empty() {
            body["metro"] = json!(config.metro);
        } else {
            body["facility"] = json!(config.facilities);
        }

        client
            .request(
                "CreateDevice",
                reqwest::Method::POST,
                &format!("/projects/{}/devices", config.project_id),
                Some(body),
            )
            .await?;
        info!("equinix metal device issued for machine `{}`", machine.machine_name());

        match poll_immediate(INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, || async {
            match self.get(&machine, data).await {
                Ok(_) => Ok(true),
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
        let client = MetalClient::new(&config.token)?;

        let candidates = self
            .devices_by_uid(&client, &config.project_id, &machine.uid())
            .await?
            .iter()
            .map(instance_from_device)
            .collect();

        crate::cloud_provider::tagging::prefer_non_terminated(candidates)
            .ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = MetalClient::new(&config.token)?;

        let step = cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let devices = self.devices_by_uid(&client, &config.project_id, &machine.uid()).await?;
            let live: Vec<_> = devices
                .iter()
                .map(instance_from_device)
                .filter(|instance| !instance.is_terminated())
                .collect();
            if live.is_empty() {
                return Ok(true);
            }

            for instance in &live {
                if instance.status != InstanceStatus::Deleting {
                    client
                        .request(
                            "DeleteDevice",
                            reqwest::Method::DELETE,
                            &format!("/devices/{}", instance.id),
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
        let client = MetalClient::new(&config.token)?;

        let old_tag = uid_tag(&machine.uid());
        for device in self.devices_by_uid(&client, &config.project_id, &machine.uid()).await? {
            let Some(id) = device.pointer("/id").and_then(|i| i.as_str()) else {
                continue;
            };
            let mut tags: Vec<String> = device
                .pointer("/tags")
                .and_then(|t| serde_json::from_value(t.clone()).ok())
                .unwrap_or_default();
            tags.retain(|tag| tag != &old_tag);
            tags.push(uid_tag(new_uid));

            client
                .request(
                    "UpdateDevice",
                    reqwest::Method::PUT,
                    &format!("/devices/{id}"),
                    Some(json!({ "tags": tags })),
                )
                .await?;
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("size".to_string(), raw.plan.value.clone()),
            ("metro".to_string(), raw.metro.value.clone()),
            ("image".to_string(), raw.operating_system.value.clone()),
        ]))
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        let mut by_credentials: HashMap<(String, String), Vec<&Machine>> = HashMap::new();
        for machine in machines {
            let config = self.config(&machine.spec).await?;
            by_credentials
                .entry((config.token, config.project_id))
                .or_default()
                .push(machine);
        }

        for ((token, project_id), machines) in &by_credentials {
            let client = MetalClient::new(token)?;
            let (_, listing) = client
                .request(
                    "ListDevices",
                    reqwest::Method::GET,
                    &format!("/projects/{project_id}/devices?per_page=1000"),
                    None,
                )
                .await?;

            let mut count_by_uid: HashMap<String, f64> = HashMap::new();
            for device in listing.pointer("/devices").and_then(|d| d.as_array()).unwrap_or(&vec![]) {
                if instance_from_device(device).is_terminated() {
                    continue;
                }
                for tag in device.pointer("/tags").and_then(|t| t.as_array()).unwrap_or(&vec![]) {
                    if let Some(uid) = tag.as_str().and_then(|t| t.strip_prefix("machine-uid:")) {
                        *count_by_uid.entry(uid.to_string()).or_default() += 1.0;
                    }
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
    fn test_device_state_mapping() {
        // execute & verify:
        assert_eq!(map_device_state("active"), InstanceStatus::Running);
        assert_eq!(map_device_state("queued"), InstanceStatus::Creating);
        assert_eq!(map_device_state("deprovisioning"), InstanceStatus::Deleting);
        assert_eq!(map_device_state("deleted"), InstanceStatus::Deleted);
        assert_eq!(map_device_state("inactive"), InstanceStatus::Unknown);
    }

    #[test]
    fn test_legacy_packet_constructor_keeps_its_tag() {
        // setup:
        use crate::config::InMemorySecretStore;
        use std::sync::Arc;
        let resolver = ConfigVarResolver::new(Arc::new(InMemorySecretStore::new()));

        // execute & verify:
        assert_eq!(EquinixMetalProvider::new(resolver.clone()).kind(), Kind::Equinixmetal);
        assert_eq!(
            EquinixMetalProvider::new_legacy_packet(resolver).kind(),
            Kind::Packet
        );
    }

    #[test]
    fn test_instance_from_device() {
        // setup:
        let device = json!({
            "id": "dev-1",
            "hostname": "node-1",
            "state": "active",
            "ip_addresses": [
                { "address": "147.1.2.3", "public": true },
                { "address": "10.80.0.2", "public": false },
            ],
        });

        // execute:
        let instance = instance_from_device(&device);

        // verify:
        assert_eq!(instance.provider_id.as_deref(), Some("equinixmetal://dev-1"));
        assert_eq!(instance.addresses.get("147.1.2.3"), Some(&AddressType::ExternalIp));
        assert_eq!(instance.addresses.get("10.80.0.2"), Some(&AddressType::InternalIp));
    }
}
