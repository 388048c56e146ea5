use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
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
use crate::utilities::get_header_with_bearer;

const API_ENDPOINT: &str = "https://api.digitalocean.com/v2";

const FINALIZER_INSTANCE: &str = "machine-engine/digitalocean-instance";

/// Droplets are discovered through a per-UID tag; DigitalOcean tags are flat
/// strings, so the ownership pair collapses into one `machine-uid:<uid>` tag.
fn uid_tag(uid: &str) -> String {
    format!("machine-uid:{uid}")
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub token: ConfigVarString,
    pub region: ConfigVarString,
    pub size: ConfigVarString,
    pub image: ConfigVarString,
    pub backups: ConfigVarBool,
    pub ipv6: ConfigVarBool,
    pub monitoring: ConfigVarBool,
    pub tags: Vec<String>,
}

struct Config {
    token: String,
    region: String,
    size: String,
    image: String,
    backups: bool,
    ipv6: bool,
    monitoring: bool,
    tags: Vec<String>,
}

struct DoClient {
    http: reqwest::Client,
    token: String,
}

impl DoClient {
    fn new(token: &str) -> Result<Self, MachineError> {
        Ok(DoClient {
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
                Err(MachineError::new_auth_failure(format!("DigitalOcean {operation}: {status}")))
            }
            StatusCode::UNPROCESSABLE_ENTITY => Err(MachineError::new_invalid_configuration(format!(
                "DigitalOcean {operation}: {payload}"
            ))),
            StatusCode::TOO_MANY_REQUESTS => Err(MachineError::new_retryable(
                format!("DigitalOcean {operation}: rate limited"),
                None,
            )),
            _ => Err(MachineError::new_retryable(
                format!("DigitalOcean {operation} failed with {status}"),
                Some(payload.to_string()),
            )),
        }
    }
}

fn map_droplet_status(status: &str) -> InstanceStatus {
    match status {
        "active" => InstanceStatus::Running,
        "new" => InstanceStatus::Creating,
        "archive" => InstanceStatus::Deleted,
        _ => InstanceStatus::Unknown,
    }
}

fn instance_from_droplet(droplet: &Value) -> Instance {
    let id = droplet
        .pointer("/id")
        .and_then(|i| i.as_i64())
        .map(|i| i.to_string())
        .unwrap_or_default();
    let name = droplet.pointer("/name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
    let status = droplet
        .pointer("/status")
        .and_then(|s| s.as_str())
        .map(map_droplet_status)
        .unwrap_or(InstanceStatus::Unknown);

    let mut addresses = HashMap::new();
    for family in ["v4", "v6"] {
        for network in droplet
            .pointer(&format!("/networks/{family}"))
            .and_then(|n| n.as_array())
            .unwrap_or(&vec![])
        {
            let Some(ip) = network.pointer("/ip_address").and_then(|ip| ip.as_str()) else {
                continue;
            };
            let kind = match network.pointer("/type").and_then(|t| t.as_str()) {
                Some("public") => AddressType::ExternalIp,
                _ => AddressType::InternalIp,
            };
            addresses.insert(ip.to_string(), kind);
        }
    }

    Instance {
        provider_id: Some(format!("digitalocean://{id}")),
        id,
        name,
        addresses,
        status,
    }
}

pub struct DigitaloceanProvider {
    resolver: ConfigVarResolver,
}

impl DigitaloceanProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        DigitaloceanProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone()).map_err(|e| {
            MachineError::new_invalid_configuration(format!("cannot parse digitalocean provider spec: {e}"))
        })
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        Ok(Config {
            token: self.resolver.get_string_or_env(&raw.token, constants::DO_TOKEN).await?,
            region: self.resolver.get_string(&raw.region).await?,
            size: self.resolver.get_string(&raw.size).await?,
            image: self.resolver.get_string(&raw.image).await?,
            backups: self.resolver.get_bool(&raw.backups).await?.0,
            ipv6: self.resolver.get_bool(&raw.ipv6).await?.0,
            monitoring: self.resolver.get_bool(&raw.monitoring).await?.0,
            tags: raw.tags,
        })
    }

    async fn droplets_by_uid(&self, client: &DoClient, uid: &str) -> Result<Vec<Value>, MachineError> {
        let tag = urlencoding::encode(&uid_tag(uid)).to_string();
        let (_, listing) = client
            .request(
                "ListDroplets",
                reqwest::Method::GET,
                &format!("/droplets?tag_name={tag}&per_page=200"),
                None,
            )
            .await?;

        Ok(listing.pointer("/droplets").and_then(|d| d.as_array()).cloned().unwrap_or_default())
    }

    async fn ensure_tag(&self, client: &DoClient, tag: &str) -> Result<(), MachineError> {
        let result = client
            .request("CreateTag", reqwest::Method::POST, "/tags", Some(json!({ "name": tag })))
            .await;

        match result {
            Ok(_) => Ok(()),
            // creating an existing tag answers 422, which still leaves it in place
            Err(err) if err.is_terminal() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Provider for DigitaloceanProvider {
    fn kind(&self) -> Kind {
        Kind::Digitalocean
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.backups.value.is_none() && raw.backups.secret_key_ref.is_none() {
            raw.backups = ConfigVarBool::from_literal(false);
        }
        if raw.monitoring.value.is_none() && raw.monitoring.secret_key_ref.is_none() {
            raw.monitoring = ConfigVarBool::from_literal(true);
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw).map_err(|e| {
            MachineError::new_invalid_configuration(format!("cannot serialize digitalocean provider spec: {e}"))
        })?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        for (field, value) in [
            ("token", &config.token),
            ("region", &config.region),
            ("size", &config.size),
            ("image", &config.image),
        ] {
            if value.is_empty() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "{field} must be configured"
                )));
            }
        }

        let client = DoClient::new(&config.token)?;

        let (_, regions) = client
            .request("ListRegions", reqwest::Method::GET, "/regions?per_page=200", None)
            .await?;
        let region = regions
            .pointer("/regions")
            .and_then(|r| r.as_array())
            .and_then(|regions| {
                regions
                    .iter()
                    .find(|r| r.pointer("/slug").and_then(|s| s.as_str()) == Some(config.region.as_str()))
            })
            .cloned();

        let Some(region) = region else {
            return Err(MachineError::new_invalid_configuration(format!(
                "region `{}` not found",
                config.region
            )));
        };

        let size_available = region
            .pointer("/sizes")
            .and_then(|s| s.as_array())
            .map(|sizes| sizes.iter().any(|s| s.as_str() == Some(config.size.as_str())))
            .unwrap_or(false);
        if !size_available {
            return Err(MachineError::new_invalid_configuration(format!(
                "size `{}` is not available in region `{}`",
                config.size, config.region
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
        let client = DoClient::new(&config.token)?;

        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE]).await?;

        let owner_tag = uid_tag(&machine.uid());
        self.ensure_tag(&client, &owner_tag).await?;

        let mut tags = config.tags.clone();
        tags.push(owner_tag);

        let body = json!({
            "name": machine.machine_name(),
            "region": config.region,
            "size": config.size,
            "image": config.image,
            "backups": config.backups,
            "ipv6": config.ipv6,
            "monitoring": config.monitoring,
            "user_data": userdata,
            "tags": tags,
        });

        client
            .request("CreateDroplet", reqwest::Method::POST, "/droplets", Some(body))
            .await?;
        info!("digitalocean droplet issued for machine `{}`", machine.machine_name());

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
        let client = DoClient::new(&config.token)?;

        let droplets = self.droplets_by_uid(&client, &machine.uid()).await?;
        let candidates = droplets.iter().map(instance_from_droplet).collect();

        crate::cloud_provider::tagging::prefer_non_terminated(candidates)
            .ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = DoClient::new(&config.token)?;

        let step = cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let droplets = self.droplets_by_uid(&client, &machine.uid()).await?;
            if droplets.is_empty() {
                return Ok(true);
            }

            // deleting by tag drains every droplet carrying the UID at once
            let tag = urlencoding::encode(&uid_tag(&machine.uid())).to_string();
            client
                .request(
                    "DeleteDropletsByTag",
                    reqwest::Method::DELETE,
                    &format!("/droplets?tag_name={tag}"),
                    None,
                )
                .await?;
            Ok(false)
        })
        .await?;

        Ok(step.is_some())
    }

    async fn migrate_uid(&self, machine: &Machine, _data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = DoClient::new(&config.token)?;

        let droplets = self.droplets_by_uid(&client, &machine.uid()).await?;
        if droplets.is_empty() {
            return Ok(());
        }

        let new_tag = uid_tag(new_uid);
        self.ensure_tag(&client, &new_tag).await?;

        let resources: Vec<Value> = droplets
            .iter()
            .filter_map(|droplet| droplet.pointer("/id").and_then(|i| i.as_i64()))
            .map(|id| json!({ "resource_id": id.to_string(), "resource_type": "droplet" }))
            .collect();

        client
            .request(
                "TagResources",
                reqwest::Method::POST,
                &format!("/tags/{new_tag}/resources"),
                Some(json!({ "resources": resources.clone() })),
            )
            .await?;

        let old_tag = uid_tag(&machine.uid());
        client
            .request(
                "UntagResources",
                reqwest::Method::DELETE,
                &format!("/tags/{old_tag}/resources"),
                Some(json!({ "resources": resources })),
            )
            .await?;

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("size".to_string(), raw.size.value.clone()),
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
            let client = DoClient::new(token)?;

            for machine in machines {
                let droplets = self.droplets_by_uid(&client, &machine.uid()).await?;
                let live = droplets
                    .iter()
                    .map(instance_from_droplet)
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
    fn test_uid_tag_shape() {
        // execute & verify:
        assert_eq!(uid_tag("abc-123"), "machine-uid:abc-123");
    }

    #[test]
    fn test_droplet_status_mapping() {
        // execute & verify:
        assert_eq!(map_droplet_status("active"), InstanceStatus::Running);
        assert_eq!(map_droplet_status("new"), InstanceStatus::Creating);
        assert_eq!(map_droplet_status("archive"), InstanceStatus::Deleted);
        assert_eq!(map_droplet_status("off"), InstanceStatus::Unknown);
    }

    #[test]
    fn test_instance_from_droplet_addresses() {
        // setup:
        let droplet = json!({
            "id": 7,
            "name": "node-1",
            "status": "active",
            "networks": {
                "v4": [
                    { "ip_address": "10.0.0.4", "type": "private" },
                    { "ip_address": "164.1.2.3", "type": "public" },
                ],
                "v6": [{ "ip_address": "2a03::1", "type": "public" }],
            },
        });

        // execute:
        let instance = instance_from_droplet(&droplet);

        // verify:
        assert_eq!(instance.addresses.get("10.0.0.4"), Some(&AddressType::InternalIp));
        assert_eq!(instance.addresses.get("164.1.2.3"), Some(&AddressType::ExternalIp));
        assert_eq!(instance.addresses.get("2a03::1"), Some(&AddressType::ExternalIp));
    }
}
