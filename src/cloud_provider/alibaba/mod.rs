use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cloud_provider::finalizer::{add_finalizers, cleanup_step};
use crate::cloud_provider::tagging::{MACHINE_UID_TAG_KEY, machine_tags, prefer_non_terminated};
use crate::cloud_provider::{AddressType, Instance, InstanceStatus, Kind, Provider, ProviderData};
use crate::config::{ConfigVarResolver, ConfigVarString};
use crate::constants;
use crate::errors::{CommandError, MachineError};
use crate::machine::{Machine, MachineSpec};
use crate::polling::{INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, PollError, poll_immediate};

const API_HOST: &str = "ecs.aliyuncs.com";
const API_VERSION: &str = "2014-05-26";

const FINALIZER_INSTANCE: &str = "machine-engine/alibaba-instance";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub access_key_id: ConfigVarString,
    pub access_key_secret: ConfigVarString,
    pub region_id: ConfigVarString,
    pub zone_id: ConfigVarString,
    pub instance_type: ConfigVarString,
    pub image_id: ConfigVarString,
    pub v_switch_id: ConfigVarString,
    pub security_group_id: ConfigVarString,
    pub disk_type: ConfigVarString,
    pub disk_size: Option<i32>,
    pub internet_max_bandwidth_out: Option<i32>,
    pub tags: BTreeMap<String, String>,
}

struct Config {
    access_key_id: String,
    access_key_secret: String,
    region_id: String,
    zone_id: String,
    instance_type: String,
    image_id: String,
    v_switch_id: String,
    security_group_id: String,
    disk_type: String,
    disk_size: i32,
    internet_max_bandwidth_out: i32,
    tags: BTreeMap<String, String>,
}

type HmacSha256 = Hmac<Sha256>;

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// RPC client for the ECS API, signing every call with the ACS3-HMAC-SHA256
/// scheme (canonical request, hashed payload, HMAC over the string to sign).
struct EcsClient {
    http: reqwest::Client,
    access_key_id: String,
    access_key_secret: String,
}

impl EcsClient {
    fn new(access_key_id: &str, access_key_secret: &str) -> Result<Self, MachineError> {
        Ok(EcsClient {
            http: crate::utilities::http_client_with_ca(None)?,
            access_key_id: access_key_id.to_string(),
            access_key_secret: access_key_secret.to_string(),
        })
    }

    async fn call(&self, action: &str, parameters: &BTreeMap<String, String>) -> Result<Value, MachineError> {
        let canonical_query = parameters
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(value).replace('+', "%20")
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let nonce: [u8; 16] = rand::rng().random();
        let nonce = hex(&nonce);
        let hashed_payload = hex(&Sha256::digest(b""));

        let canonical_headers = format!(
            "host:{API_HOST}\nx-acs-action:{action}\nx-acs-content-sha256:{hashed_payload}\nx-acs-date:{timestamp}\nx-acs-signature-nonce:{nonce}\nx-acs-version:{API_VERSION}\n"
        );
        let signed_headers = "host;x-acs-action;x-acs-content-sha256;x-acs-date;x-acs-signature-nonce;x-acs-version";

        let canonical_request =
            format!("GET\n/\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{hashed_payload}");
        let string_to_sign = format!("ACS3-HMAC-SHA256\n{}", hex(&Sha256::digest(canonical_request.as_bytes())));

        let mut mac = HmacSha256::new_from_slice(self.access_key_secret.as_bytes())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot build request signer: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let signature = hex(&mac.finalize().into_bytes());

        let authorization = format!(
            "ACS3-HMAC-SHA256 Credential={},SignedHeaders={signed_headers},Signature={signature}",
            self.access_key_id
        );

        let response = self
            .http
            .get(format!("https://{API_HOST}/?{canonical_query}"))
            .header("Authorization", authorization)
            .header("x-acs-action", action)
            .header("x-acs-content-sha256", &hashed_payload)
            .header("x-acs-date", &timestamp)
            .header("x-acs-signature-nonce", &nonce)
            .header("x-acs-version", API_VERSION)
            .send()
            .await
            .map_err(CommandError::from)?;

        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(payload);
        }

        let code = payload.pointer("/Code").and_then(|c| c.as_str()).unwrap_or_default();
        match (status, code) {
            (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _)
            | (_, "InvalidAccessKeyId.NotFound" | "SignatureDoesNotMatch") => {
                Err(MachineError::new_auth_failure(format!("Alibaba {action}: {code}")))
            }
            (_, "QuotaExceed.ElasticQuota" | "OperationDenied.NoStock" | "InstanceType.NotSupported") => Err(
                MachineError::new_insufficient_resources(format!("Alibaba {action}: {code}")),
            ),
            (_, code) if code.starts_with("Invalid") => Err(MachineError::new_invalid_configuration(format!(
                "Alibaba {action}: {code}"
            ))),
            (_, "Throttling") => Err(MachineError::new_retryable(format!("Alibaba {action}: throttled"), None)),
            _ => Err(MachineError::new_retryable(
                format!("Alibaba {action} failed with {status}"),
                Some(payload.to_string()),
            )),
        }
    }
}

fn tag_parameters(tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut parameters = BTreeMap::new();
    for (index, (key, value)) in tags.iter().enumerate() {
        parameters.insert(format!("Tag.{}.Key", index + 1), key.clone());
        parameters.insert(format!("Tag.{}.Value", index + 1), value.clone());
    }
    parameters
}

fn map_ecs_status(status: &str) -> InstanceStatus {
    match status {
        "Running" => InstanceStatus::Running,
        "Pending" | "Starting" => InstanceStatus::Creating,
        "Stopping" => InstanceStatus::Deleting,
        _ => InstanceStatus::Unknown,
    }
}

fn instance_from_ecs(region_id: &str, ecs_instance: &Value) -> Instance {
    let id = ecs_instance
        .pointer("/InstanceId")
        .and_then(|i| i.as_str())
        .unwrap_or_default()
        .to_string();
    let name = ecs_instance
        .pointer("/InstanceName")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    let status = ecs_instance
        .pointer("/Status")
        .and_then(|s| s.as_str())
        .map(map_ecs_status)
        .unwrap_or(InstanceStatus::Unknown);

    let mut addresses = HashMap::new();
    for ip in ecs_instance
        .pointer("/VpcAttributes/PrivateIpAddress/IpAddress")
        .and_then(|a| a.as_array())
        .unwrap_or(&vec![])
    {
        if let Some(ip) = ip.as_str() {
            addresses.insert(ip.to_string(), AddressType::InternalIp);
        }
    }
    for ip in ecs_instance
        .pointer("/PublicIpAddress/IpAddress")
        .and_then(|a| a.as_array())
        .unwrap_or(&vec![])
    {
        if let Some(ip) = ip.as_str() {
            addresses.insert(ip.to_string(), AddressType::ExternalIp);
        }
    }

    Instance {
        provider_id: Some(format!("alicloud://{region_id}/{id}")),
        id,
        name,
        addresses,
        status,
    }
}

pub struct AlibabaProvider {
    resolver: ConfigVarResolver,
}

impl AlibabaProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        AlibabaProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse alibaba provider spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        Ok(Config {
            access_key_id: self
                .resolver
                .get_string_or_env(&raw.access_key_id, constants::ALIBABA_ACCESS_KEY_ID)
                .await?,
            access_key_secret: self
                .resolver
                .get_string_or_env(&raw.access_key_secret, constants::ALIBABA_ACCESS_KEY_SECRET)
                .await?,
            region_id: self.resolver.get_string(&raw.region_id).await?,
            zone_id: self.resolver.get_string(&raw.zone_id).await?,
            instance_type: self.resolver.get_string(&raw.instance_type).await?,
            image_id: self.resolver.get_string(&raw.image_id).await?,
            v_switch_id: self.resolver.get_string(&raw.v_switch_id).await?,
            security_group_id: self.resolver.get_string(&raw.security_group_id).await?,
            disk_type: self.resolver.get_string(&raw.disk_type).await?,
            disk_size: raw.disk_size.unwrap_or(40),
            internet_max_bandwidth_out: raw.internet_max_bandwidth_out.unwrap_or(10),
            tags: raw.tags,
        })
    }

    async fn instances_by_uid(
        &self,
        client: &EcsClient,
        config: &Config,
        uid: &str,
    ) -> Result<Vec<Value>, MachineError> {
        let mut parameters = BTreeMap::from([
            ("RegionId".to_string(), config.region_id.clone()),
            ("PageSize".to_string(), "100".to_string()),
            ("Tag.1.Key".to_string(), MACHINE_UID_TAG_KEY.to_string()),
            ("Tag.1.Value".to_string(), uid.to_string()),
        ]);
        parameters.insert("Action".to_string(), "DescribeInstances".to_string());

        let listing = client.call("DescribeInstances", &parameters).await?;
        Ok(listing
            .pointer("/Instances/Instance")
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl Provider for AlibabaProvider {
    fn kind(&self) -> Kind {
        Kind::Alibaba
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.disk_type.value.is_empty() && raw.disk_type.secret_key_ref.is_none() {
            raw.disk_type = ConfigVarString::from_literal("cloud_efficiency");
        }
        if raw.disk_size.is_none() {
            raw.disk_size = Some(40);
        }
        if raw.internet_max_bandwidth_out.is_none() {
            raw.internet_max_bandwidth_out = Some(10);
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw)
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot serialize alibaba provider spec: {e}")))?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        for (field, value) in [
            ("accessKeyID", &config.access_key_id),
            ("accessKeySecret", &config.access_key_secret),
            ("regionID", &config.region_id),
            ("instanceType", &config.instance_type),
            ("imageID", &config.image_id),
            ("vSwitchID", &config.v_switch_id),
        ] {
            if value.is_empty() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "{field} must be configured"
                )));
            }
        }

        let client = EcsClient::new(&config.access_key_id, &config.access_key_secret)?;

        let regions = client
            .call("DescribeRegions", &BTreeMap::from([("Action".to_string(), "DescribeRegions".to_string())]))
            .await?;
        let region_exists = regions
            .pointer("/Regions/Region")
            .and_then(|r| r.as_array())
            .map(|regions| {
                regions
                    .iter()
                    .any(|r| r.pointer("/RegionId").and_then(|id| id.as_str()) == Some(config.region_id.as_str()))
            })
            .unwrap_or(false);
        if !region_exists {
            return Err(MachineError::new_invalid_configuration(format!(
                "region `{}` not found",
                config.region_id
            )));
        }

        let images = client
            .call(
                "DescribeImages",
                &BTreeMap::from([
                    ("Action".to_string(), "DescribeImages".to_string()),
                    ("RegionId".to_string(), config.region_id.clone()),
                    ("ImageId".to_string(), config.image_id.clone()),
                ]),
            )
            .await?;
        let image_exists = images
            .pointer("/Images/Image")
            .and_then(|i| i.as_array())
            .map(|images| !images.is_empty())
            .unwrap_or(false);
        if !image_exists {
            return Err(MachineError::new_invalid_configuration(format!(
                "image `{}` not found in region `{}`",
                config.image_id, config.region_id
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
        let client = EcsClient::new(&config.access_key_id, &config.access_key_secret)?;

        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE]).await?;

        let mut parameters = BTreeMap::from([
            ("Action".to_string(), "RunInstances".to_string()),
            ("RegionId".to_string(), config.region_id.clone()),
            ("InstanceType".to_string(), config.instance_type.clone()),
            ("ImageId".to_string(), config.image_id.clone()),
            ("VSwitchId".to_string(), config.v_switch_id.clone()),
            ("InstanceName".to_string(), machine.machine_name()),
            ("SystemDisk.Category".to_string(), config.disk_type.clone()),
            ("SystemDisk.Size".to_string(), config.disk_size.to_string()),
            (
                "InternetMaxBandwidthOut".to_string(),
                config.internet_max_bandwidth_out.to_string(),
            ),
            ("UserData".to_string(), general_purpose::STANDARD.encode(userdata)),
            ("Amount".to_string(), "1".to_string()),
        ]);
        if !config.zone_id.is_empty() {
            parameters.insert("ZoneId".to_string(), config.zone_id.clone());
        }
        if !config.security_group_id.is_empty() {
            parameters.insert("SecurityGroupId".to_string(), config.security_group_id.clone());
        }
        parameters.extend(tag_parameters(&machine_tags(&machine, &config.tags)));

        client.call("RunInstances", &parameters).await?;
        info!("alibaba instance issued for machine `{}`", machine.machine_name());

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
        let client = EcsClient::new(&config.access_key_id, &config.access_key_secret)?;

        let candidates = self
            .instances_by_uid(&client, &config, &machine.uid())
            .await?
            .iter()
            .map(|ecs_instance| instance_from_ecs(&config.region_id, ecs_instance))
            .collect();

        prefer_non_terminated(candidates).ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = EcsClient::new(&config.access_key_id, &config.access_key_secret)?;

        let step = cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let instances = self.instances_by_uid(&client, &config, &machine.uid()).await?;
            if instances.is_empty() {
                return Ok(true);
            }

            for ecs_instance in &instances {
                let Some(id) = ecs_instance.pointer("/InstanceId").and_then(|i| i.as_str()) else {
                    continue;
                };
                client
                    .call(
                        "DeleteInstance",
                        &BTreeMap::from([
                            ("Action".to_string(), "DeleteInstance".to_string()),
                            ("InstanceId".to_string(), id.to_string()),
                            ("Force".to_string(), "true".to_string()),
                        ]),
                    )
                    .await?;
            }
            Ok(false)
        })
        .await?;

        Ok(step.is_some())
    }

    async fn migrate_uid(&self, machine: &Machine, _data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = EcsClient::new(&config.access_key_id, &config.access_key_secret)?;

        for ecs_instance in self.instances_by_uid(&client, &config, &machine.uid()).await? {
            let Some(id) = ecs_instance.pointer("/InstanceId").and_then(|i| i.as_str()) else {
                continue;
            };

            // TagResources overwrites the value under the same key
            client
                .call(
                    "TagResources",
                    &BTreeMap::from([
                        ("Action".to_string(), "TagResources".to_string()),
                        ("RegionId".to_string(), config.region_id.clone()),
                        ("ResourceType".to_string(), "instance".to_string()),
                        ("ResourceId.1".to_string(), id.to_string()),
                        ("Tag.1.Key".to_string(), MACHINE_UID_TAG_KEY.to_string()),
                        ("Tag.1.Value".to_string(), new_uid.to_string()),
                    ]),
                )
                .await?;
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("size".to_string(), raw.instance_type.value.clone()),
            ("region".to_string(), raw.region_id.value.clone()),
            ("zone".to_string(), raw.zone_id.value.clone()),
            ("image".to_string(), raw.image_id.value.clone()),
        ]))
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        let mut by_credentials: HashMap<(String, String, String), Vec<&Machine>> = HashMap::new();
        for machine in machines {
            let config = self.config(&machine.spec).await?;
            by_credentials
                .entry((config.access_key_id, config.access_key_secret, config.region_id))
                .or_default()
                .push(machine);
        }

        for machines in by_credentials.values() {
            let Some(first) = machines.first() else { continue };
            let config = self.config(&first.spec).await?;
            let client = EcsClient::new(&config.access_key_id, &config.access_key_secret)?;

            for machine in machines.iter() {
                let live = self
                    .instances_by_uid(&client, &config, &machine.uid())
                    .await?
                    .iter()
                    .map(|ecs_instance| instance_from_ecs(&config.region_id, ecs_instance))
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
    use serde_json::json;

    #[test]
    fn test_hex_encoding() {
        // execute & verify:
        assert_eq!(hex(&[0x00, 0xff, 0x10]), "00ff10");
    }

    #[test]
    fn test_tag_parameters_are_indexed_from_one() {
        // setup:
        let tags = BTreeMap::from([
            ("Machine-UID".to_string(), "abc".to_string()),
            ("Name".to_string(), "node-1".to_string()),
        ]);

        // execute:
        let parameters = tag_parameters(&tags);

        // verify:
        assert_eq!(parameters.get("Tag.1.Key"), Some(&"Machine-UID".to_string()));
        assert_eq!(parameters.get("Tag.1.Value"), Some(&"abc".to_string()));
        assert_eq!(parameters.get("Tag.2.Key"), Some(&"Name".to_string()));
    }

    #[test]
    fn test_ecs_status_mapping() {
        // execute & verify:
        assert_eq!(map_ecs_status("Running"), InstanceStatus::Running);
        assert_eq!(map_ecs_status("Pending"), InstanceStatus::Creating);
        assert_eq!(map_ecs_status("Stopping"), InstanceStatus::Deleting);
        assert_eq!(map_ecs_status("Stopped"), InstanceStatus::Unknown);
    }

    #[test]
    fn test_instance_from_ecs() {
        // setup:
        let ecs_instance = json!({
            "InstanceId": "i-abc",
            "InstanceName": "node-1",
            "Status": "Running",
            "VpcAttributes": { "PrivateIpAddress": { "IpAddress": ["172.16.0.5"] } },
            "PublicIpAddress": { "IpAddress": ["47.1.2.3"] },
        });

        // execute:
        let instance = instance_from_ecs("eu-central-1", &ecs_instance);

        // verify:
        assert_eq!(instance.provider_id.as_deref(), Some("alicloud://eu-central-1/i-abc"));
        assert_eq!(instance.addresses.get("172.16.0.5"), Some(&AddressType::InternalIp));
        assert_eq!(instance.addresses.get("47.1.2.3"), Some(&AddressType::ExternalIp));
    }
}
