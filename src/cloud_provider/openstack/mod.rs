use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose;
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cloud_provider::finalizer::{add_finalizers, cleanup_step};
use crate::cloud_provider::tagging::{MACHINE_UID_TAG_KEY, machine_tags, prefer_non_terminated, uid_tag_matches};
use crate::cloud_provider::{AddressType, Instance, InstanceStatus, Kind, Provider, ProviderData};
use crate::config::{ConfigVarBool, ConfigVarResolver, ConfigVarString};
use crate::constants;
use crate::errors::{CommandError, MachineError};
use crate::machine::{Machine, MachineSpec};
use crate::polling::{INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, PollError, poll_immediate};

const FINALIZER_INSTANCE: &str = "machine-engine/openstack-instance";
const FINALIZER_KEYPAIR: &str = "machine-engine/openstack-keypair";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub identity_endpoint: ConfigVarString,
    pub username: ConfigVarString,
    pub password: ConfigVarString,
    pub domain_name: ConfigVarString,
    pub project_name: ConfigVarString,
    pub region: ConfigVarString,
    pub flavor: ConfigVarString,
    pub image: ConfigVarString,
    pub network: ConfigVarString,
    pub security_groups: Vec<ConfigVarString>,
    pub floating_ip_pool: ConfigVarString,
    pub availability_zone: ConfigVarString,
    pub config_drive: ConfigVarBool,
    pub ca_certificate: ConfigVarString,
    pub tags: BTreeMap<String, String>,
}

struct Config {
    identity_endpoint: String,
    username: String,
    password: String,
    domain_name: String,
    project_name: String,
    region: String,
    flavor: String,
    image: String,
    network: String,
    security_groups: Vec<String>,
    floating_ip_pool: String,
    availability_zone: String,
    config_drive: bool,
    ca_certificate: Option<String>,
    tags: BTreeMap<String, String>,
}

/// Keystone-scoped session: one token plus the compute/network endpoints
/// selected from the catalog for the configured region.
struct Session {
    http: reqwest::Client,
    token: String,
    compute_endpoint: String,
    network_endpoint: String,
}

impl Session {
    async fn open(config: &Config) -> Result<Self, MachineError> {
        let http = crate::utilities::http_client_with_ca(config.ca_certificate.as_deref())?;

        let auth_body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": config.username,
                            "domain": { "name": config.domain_name },
                            "password": config.password,
                        },
                    },
                },
                "scope": {
                    "project": {
                        "name": config.project_name,
                        "domain": { "name": config.domain_name },
                    },
                },
            },
        });

        let auth_url = format!("{}/auth/tokens", config.identity_endpoint.trim_end_matches('/'));
        let response = http.post(&auth_url).json(&auth_body).send().await.map_err(CommandError::from)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(MachineError::new_auth_failure(
                "OpenStack rejected the configured credentials".to_string(),
            ));
        }
        if !response.status().is_success() {
            return Err(MachineError::new_retryable(
                format!("Keystone token request failed with {}", response.status()),
                None,
            ));
        }

        let token = response
            .headers()
            .get("x-subject-token")
            .and_then(|t| t.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let catalog: Value = response.json().await.map_err(CommandError::from)?;

        let endpoint_for = |service_type: &str| -> Option<String> {
            catalog
                .pointer("/token/catalog")?
                .as_array()?
                .iter()
                .find(|service| service.pointer("/type").and_then(|t| t.as_str()) == Some(service_type))?
                .pointer("/endpoints")?
                .as_array()?
                .iter()
                .find(|endpoint| {
                    endpoint.pointer("/interface").and_then(|i| i.as_str()) == Some("public")
                        && (config.region.is_empty()
                            || endpoint.pointer("/region").and_then(|r| r.as_str()) == Some(config.region.as_str()))
                })?
                .pointer("/url")
                .and_then(|u| u.as_str())
                .map(|u| u.trim_end_matches('/').to_string())
        };

        let compute_endpoint = endpoint_for("compute").ok_or_else(|| {
            MachineError::new_invalid_configuration(format!(
                "no public compute endpoint in region `{}`",
                config.region
            ))
        })?;
        let network_endpoint = endpoint_for("network").ok_or_else(|| {
            MachineError::new_invalid_configuration(format!(
                "no public network endpoint in region `{}`",
                config.region
            ))
        })?;

        Ok(Session {
            http,
            token,
            compute_endpoint,
            network_endpoint,
        })
    }

    async fn request(
        &self,
        operation: &str,
        method: reqwest::Method,
        url: String,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value), MachineError> {
        let mut request = self.http.request(method, url).header("X-Auth-Token", &self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(CommandError::from)?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        match status {
            _ if status.is_success() => Ok((status, payload)),
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok((status, payload)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(MachineError::new_auth_failure(format!("OpenStack {operation}: {status}")))
            }
            StatusCode::BAD_REQUEST => Err(MachineError::new_invalid_configuration(format!(
                "OpenStack {operation}: {payload}"
            ))),
            _ => Err(MachineError::new_retryable(
                format!("OpenStack {operation} failed with {status}"),
                Some(payload.to_string()),
            )),
        }
    }

    async fn compute(&self, operation: &str, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<(StatusCode, Value), MachineError> {
        self.request(operation, method, format!("{}{path}", self.compute_endpoint), body).await
    }

    async fn network(&self, operation: &str, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<(StatusCode, Value), MachineError> {
        self.request(operation, method, format!("{}{path}", self.network_endpoint), body).await
    }
}

/// Ephemeral per-machine keypair: 32 random bytes formatted as an OpenSSH
/// ed25519 public key line. Registered with the cloud so the instance boots
/// with a keypair attached; the private half never exists.
fn ephemeral_public_key() -> String {
    let seed: [u8; 32] = rand::rng().random();

    let mut blob: Vec<u8> = vec![];
    blob.extend_from_slice(&11u32.to_be_bytes());
    blob.extend_from_slice(b"ssh-ed25519");
    blob.extend_from_slice(&32u32.to_be_bytes());
    blob.extend_from_slice(&seed);

    format!("ssh-ed25519 {}", general_purpose::STANDARD.encode(blob))
}

fn keypair_name(machine: &Machine) -> String {
    format!("machine-{}", machine.machine_name())
}

fn map_server_status(status: &str) -> InstanceStatus {
    match status {
        "ACTIVE" => InstanceStatus::Running,
        "BUILD" | "BUILDING" | "REBUILD" => InstanceStatus::Creating,
        "DELETED" | "SOFT_DELETED" => InstanceStatus::Deleted,
        _ => InstanceStatus::Unknown,
    }
}

fn instance_from_server(server: &Value) -> Instance {
    let id = server.pointer("/id").and_then(|i| i.as_str()).unwrap_or_default().to_string();
    let name = server.pointer("/name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
    let status = server
        .pointer("/status")
        .and_then(|s| s.as_str())
        .map(map_server_status)
        .unwrap_or(InstanceStatus::Unknown);

    let mut addresses = HashMap::new();
    if let Some(networks) = server.pointer("/addresses").and_then(|a| a.as_object()) {
        for entries in networks.values() {
            for entry in entries.as_array().unwrap_or(&vec![]) {
                let Some(address) = entry.pointer("/addr").and_then(|a| a.as_str()) else {
                    continue;
                };
                let kind = match entry.pointer("/OS-EXT-IPS:type").and_then(|t| t.as_str()) {
                    Some("floating") => AddressType::ExternalIp,
                    _ => AddressType::InternalIp,
                };
                addresses.insert(address.to_string(), kind);
            }
        }
    }

    Instance {
        provider_id: Some(format!("openstack:///{id}")),
        id,
        name,
        addresses,
        status,
    }
}

fn server_tags(server: &Value) -> BTreeMap<String, String> {
    server
        .pointer("/metadata")
        .and_then(|m| serde_json::from_value(m.clone()).ok())
        .unwrap_or_default()
}

pub struct OpenstackProvider {
    resolver: ConfigVarResolver,
}

impl OpenstackProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        OpenstackProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse openstack provider spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        let mut security_groups = Vec::with_capacity(raw.security_groups.len());
        for group in &raw.security_groups {
            security_groups.push(self.resolver.get_string(group).await?);
        }

        let ca_certificate = {
            let pem = self.resolver.get_string(&raw.ca_certificate).await?;
            if pem.is_empty() { None } else { Some(pem) }
        };

        Ok(Config {
            identity_endpoint: self
                .resolver
                .get_string_or_env(&raw.identity_endpoint, constants::OS_AUTH_URL)
                .await?,
            username: self.resolver.get_string_or_env(&raw.username, constants::OS_USER_NAME).await?,
            password: self.resolver.get_string_or_env(&raw.password, constants::OS_PASSWORD).await?,
            domain_name: self
                .resolver
                .get_string_or_env(&raw.domain_name, constants::OS_DOMAIN_NAME)
                .await?,
            project_name: self
                .resolver
                .get_string_or_env(&raw.project_name, constants::OS_PROJECT_NAME)
                .await?,
            region: self.resolver.get_string_or_env(&raw.region, constants::OS_REGION_NAME).await?,
            flavor: self.resolver.get_string(&raw.flavor).await?,
            image: self.resolver.get_string(&raw.image).await?,
            network: self.resolver.get_string(&raw.network).await?,
            security_groups,
            floating_ip_pool: self.resolver.get_string(&raw.floating_ip_pool).await?,
            availability_zone: self.resolver.get_string(&raw.availability_zone).await?,
            config_drive: self.resolver.get_bool(&raw.config_drive).await?.0,
            ca_certificate,
            tags: raw.tags,
        })
    }

    async fn servers_by_uid(&self, session: &Session, uid: &str) -> Result<Vec<Value>, MachineError> {
        let (_, listing) = session
            .compute("ListServers", reqwest::Method::GET, "/servers/detail", None)
            .await?;

        Ok(listing
            .pointer("/servers")
            .and_then(|s| s.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|server| uid_tag_matches(&server_tags(server), uid))
            .collect())
    }

    async fn ensure_keypair(&self, session: &Session, machine: &Machine) -> Result<(), MachineError> {
        let (status, _) = session
            .compute(
                "CreateKeypair",
                reqwest::Method::POST,
                "/os-keypairs",
                Some(json!({
                    "keypair": {
                        "name": keypair_name(machine),
                        "public_key": ephemeral_public_key(),
                    },
                })),
            )
            .await?;

        // conflict means a previous reconcile already registered it
        if status == StatusCode::CONFLICT {
            debug!("keypair `{}` already registered", keypair_name(machine));
        }
        Ok(())
    }

    async fn associate_floating_ip(
        &self,
        session: &Session,
        config: &Config,
        server_id: &str,
    ) -> Result<(), MachineError> {
        let (_, networks) = session
            .network(
                "ListNetworks",
                reqwest::Method::GET,
                &format!("/v2.0/networks?name={}", config.floating_ip_pool),
                None,
            )
            .await?;
        let pool_id = networks
            .pointer("/networks/0/id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                MachineError::new_invalid_configuration(format!(
                    "floating IP pool `{}` not found",
                    config.floating_ip_pool
                ))
            })?;

        let (_, ports) = session
            .network(
                "ListPorts",
                reqwest::Method::GET,
                &format!("/v2.0/ports?device_id={server_id}"),
                None,
            )
            .await?;
        let port_id = ports
            .pointer("/ports/0/id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| MachineError::new_retryable("server port not visible yet".to_string(), None))?;

        session
            .network(
                "CreateFloatingIP",
                reqwest::Method::POST,
                "/v2.0/floatingips",
                Some(json!({
                    "floatingip": {
                        "floating_network_id": pool_id,
                        "port_id": port_id,
                    },
                })),
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Provider for OpenstackProvider {
    fn kind(&self) -> Kind {
        Kind::Openstack
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.domain_name.value.is_empty() && raw.domain_name.secret_key_ref.is_none() && raw.domain_name.env_var_name.is_none() {
            raw.domain_name = ConfigVarString::from_literal("Default");
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw).map_err(|e| {
            MachineError::new_invalid_configuration(format!("cannot serialize openstack provider spec: {e}"))
        })?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        for (field, value) in [
            ("identityEndpoint", &config.identity_endpoint),
            ("username", &config.username),
            ("password", &config.password),
            ("projectName", &config.project_name),
            ("flavor", &config.flavor),
            ("image", &config.image),
            ("network", &config.network),
        ] {
            if value.is_empty() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "{field} must be configured"
                )));
            }
        }

        let session = Session::open(&config).await?;

        let (_, flavors) = session
            .compute("ListFlavors", reqwest::Method::GET, "/flavors/detail", None)
            .await?;
        let flavor_exists = flavors
            .pointer("/flavors")
            .and_then(|f| f.as_array())
            .map(|flavors| {
                flavors
                    .iter()
                    .any(|flavor| flavor.pointer("/name").and_then(|n| n.as_str()) == Some(config.flavor.as_str()))
            })
            .unwrap_or(false);
        if !flavor_exists {
            return Err(MachineError::new_invalid_configuration(format!(
                "flavor `{}` not found",
                config.flavor
            )));
        }

        let (_, networks) = session
            .network(
                "ListNetworks",
                reqwest::Method::GET,
                &format!("/v2.0/networks?name={}", config.network),
                None,
            )
            .await?;
        if networks.pointer("/networks/0").is_none() {
            return Err(MachineError::new_invalid_configuration(format!(
                "network `{}` not found",
                config.network
            )));
        }

        for group in &config.security_groups {
            let (_, groups) = session
                .network(
                    "ListSecurityGroups",
                    reqwest::Method::GET,
                    &format!("/v2.0/security-groups?name={group}"),
                    None,
                )
                .await?;
            if groups.pointer("/security_groups/0").is_none() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "security group `{group}` not found"
                )));
            }
        }

        if !config.availability_zone.is_empty() {
            let (_, zones) = session
                .compute("ListAvailabilityZones", reqwest::Method::GET, "/os-availability-zone", None)
                .await?;
            let zone_exists = zones
                .pointer("/availabilityZoneInfo")
                .and_then(|z| z.as_array())
                .map(|zones| {
                    zones.iter().any(|zone| {
                        zone.pointer("/zoneName").and_then(|n| n.as_str()) == Some(config.availability_zone.as_str())
                    })
                })
                .unwrap_or(false);
            if !zone_exists {
                return Err(MachineError::new_invalid_configuration(format!(
                    "availability zone `{}` not found",
                    config.availability_zone
                )));
            }
        }

        Ok(())
    }

    async fn get_cloud_config(&self, spec: &MachineSpec) -> Result<(String, String), MachineError> {
        let config = self.config(spec).await?;
        let cloud_config = format!(
            r#"[Global]
auth-url = "{}"
username = "{}"
password = "{}"
domain-name = "{}"
tenant-name = "{}"
region = "{}"
"#,
            config.identity_endpoint,
            config.username,
            config.password,
            config.domain_name,
            config.project_name,
            config.region
        );
        Ok((cloud_config, "openstack".to_string()))
    }

    async fn create(
        &self,
        machine: &Machine,
        data: &ProviderData,
        userdata: &str,
    ) -> Result<Instance, MachineError> {
        let config = self.config(&machine.spec).await?;
        let session = Session::open(&config).await?;

        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE, FINALIZER_KEYPAIR]).await?;

        self.ensure_keypair(&session, &machine).await?;

        let (_, networks) = session
            .network(
                "ListNetworks",
                reqwest::Method::GET,
                &format!("/v2.0/networks?name={}", config.network),
                None,
            )
            .await?;
        let network_id = networks
            .pointer("/networks/0/id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                MachineError::new_invalid_configuration(format!("network `{}` not found", config.network))
            })?
            .to_string();

        let security_groups: Vec<Value> = config
            .security_groups
            .iter()
            .map(|name| json!({ "name": name }))
            .collect();

        let mut server = json!({
            "name": machine.machine_name(),
            "imageRef": config.image,
            "flavorRef": config.flavor,
            "key_name": keypair_name(&machine),
            "user_data": general_purpose::STANDARD.encode(userdata),
            "config_drive": config.config_drive,
            "metadata": machine_tags(&machine, &config.tags),
            "networks": [{ "uuid": network_id }],
            "security_groups": security_groups,
        });
        if !config.availability_zone.is_empty() {
            server["availability_zone"] = json!(config.availability_zone);
        }

        session
            .compute(
                "CreateServer",
                reqwest::Method::POST,
                "/servers",
                Some(json!({ "server": server })),
            )
            .await?;
        info!("openstack server issued for machine `{}`", machine.machine_name());

        match poll_immediate(INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, || async {
            match self.get(&machine, data).await {
                Ok(instance) => Ok(instance.status == InstanceStatus::Running),
                Err(err) if err.is_not_found() => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await
        {
            Ok(()) => {}
            Err(PollError::Timeout(waited)) => {
                return Err(MachineError::new_instance_not_ready(&machine.machine_name(), waited));
            }
            Err(PollError::Failed(err)) => return Err(err),
        }

        let instance = self.get(&machine, data).await?;
        if !config.floating_ip_pool.is_empty() {
            self.associate_floating_ip(&session, &config, &instance.id).await?;
        }

        self.get(&machine, data).await
    }

    async fn get(&self, machine: &Machine, _data: &ProviderData) -> Result<Instance, MachineError> {
        let config = self.config(&machine.spec).await?;
        let session = Session::open(&config).await?;

        let candidates = self
            .servers_by_uid(&session, &machine.uid())
            .await?
            .iter()
            .map(instance_from_server)
            .collect();

        prefer_non_terminated(candidates).ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let session = Session::open(&config).await?;

        // every server carrying the UID is drained, orphans from interrupted
        // creates included
        let machine = match cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let servers = self.servers_by_uid(&session, &machine.uid()).await?;
            let live: Vec<_> = servers
                .iter()
                .map(instance_from_server)
                .filter(|instance| !instance.is_terminated())
                .collect();

            if live.is_empty() {
                return Ok(true);
            }

            for instance in &live {
                if instance.status != InstanceStatus::Deleting {
                    session
                        .compute(
                            "DeleteServer",
                            reqwest::Method::DELETE,
                            &format!("/servers/{}", instance.id),
                            None,
                        )
                        .await?;
                }
            }
            Ok(false)
        })
        .await?
        {
            Some(machine) => machine,
            None => return Ok(false),
        };

        match cleanup_step(data, &machine, FINALIZER_KEYPAIR, || async {
            session
                .compute(
                    "DeleteKeypair",
                    reqwest::Method::DELETE,
                    &format!("/os-keypairs/{}", keypair_name(&machine)),
                    None,
                )
                .await?;
            Ok(true)
        })
        .await?
        {
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn migrate_uid(&self, machine: &Machine, _data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        let config = self.config(&machine.spec).await?;
        let session = Session::open(&config).await?;

        for server in self.servers_by_uid(&session, &machine.uid()).await? {
            let Some(id) = server.pointer("/id").and_then(|i| i.as_str()) else {
                continue;
            };
            session
                .compute(
                    "UpdateServerMetadata",
                    reqwest::Method::POST,
                    &format!("/servers/{id}/metadata"),
                    Some(json!({ "metadata": { MACHINE_UID_TAG_KEY: new_uid } })),
                )
                .await?;
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("size".to_string(), raw.flavor.value.clone()),
            ("region".to_string(), raw.region.value.clone()),
            ("zone".to_string(), raw.availability_zone.value.clone()),
            ("image".to_string(), raw.image.value.clone()),
        ]))
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        let mut by_credentials: HashMap<(String, String, String, String, String), Vec<&Machine>> = HashMap::new();
        for machine in machines {
            let config = self.config(&machine.spec).await?;
            by_credentials
                .entry((
                    config.identity_endpoint,
                    config.username,
                    config.password,
                    config.project_name,
                    config.region,
                ))
                .or_default()
                .push(machine);
        }

        for machines in by_credentials.values() {
            let Some(first) = machines.first() else { continue };
            let config = self.config(&first.spec).await?;
            let session = Session::open(&config).await?;

            let (_, listing) = session
                .compute("ListServers", reqwest::Method::GET, "/servers/detail", None)
                .await?;

            let mut count_by_uid: HashMap<String, f64> = HashMap::new();
            for server in listing.pointer("/servers").and_then(|s| s.as_array()).unwrap_or(&vec![]) {
                if instance_from_server(server).is_terminated() {
                    continue;
                }
                if let Some(uid) = server_tags(server).get(MACHINE_UID_TAG_KEY) {
                    *count_by_uid.entry(uid.clone()).or_default() += 1.0;
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

    fn provider() -> OpenstackProvider {
        OpenstackProvider::new(ConfigVarResolver::new(Arc::new(InMemorySecretStore::new())))
    }

    #[test]
    fn test_ephemeral_public_key_shape() {
        // execute:
        let key = ephemeral_public_key();

        // verify: valid OpenSSH wire format for an ed25519 key
        let encoded = key.strip_prefix("ssh-ed25519 ").unwrap();
        let blob = general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(&blob[0..4], &11u32.to_be_bytes());
        assert_eq!(&blob[4..15], b"ssh-ed25519");
        assert_eq!(&blob[15..19], &32u32.to_be_bytes());
        assert_eq!(blob.len(), 19 + 32);
    }

    #[test]
    fn test_server_status_mapping() {
        // execute & verify:
        assert_eq!(map_server_status("ACTIVE"), InstanceStatus::Running);
        assert_eq!(map_server_status("BUILD"), InstanceStatus::Creating);
        assert_eq!(map_server_status("SOFT_DELETED"), InstanceStatus::Deleted);
        assert_eq!(map_server_status("ERROR"), InstanceStatus::Unknown);
    }

    #[test]
    fn test_instance_from_server_addresses() {
        // setup:
        let server = json!({
            "id": "srv-1",
            "name": "node-1",
            "status": "ACTIVE",
            "addresses": {
                "private": [
                    { "addr": "10.0.0.5", "OS-EXT-IPS:type": "fixed" },
                    { "addr": "185.1.2.3", "OS-EXT-IPS:type": "floating" },
                ],
            },
        });

        // execute:
        let instance = instance_from_server(&server);

        // verify:
        assert_eq!(instance.addresses.get("10.0.0.5"), Some(&AddressType::InternalIp));
        assert_eq!(instance.addresses.get("185.1.2.3"), Some(&AddressType::ExternalIp));
        assert_eq!(instance.status, InstanceStatus::Running);
    }

    #[test]
    fn test_add_defaults_sets_domain() {
        // setup:
        let machine = test_helpers::machine("node-1", "abc", Kind::Openstack, json!({"flavor": "m1.small"}));

        // execute:
        let defaulted = provider().add_defaults(machine.spec).unwrap();
        let raw: RawConfig = serde_json::from_value(defaulted.provider_spec.cloud_provider_spec).unwrap();

        // verify:
        assert_eq!(raw.domain_name.value, "Default");
    }
}
