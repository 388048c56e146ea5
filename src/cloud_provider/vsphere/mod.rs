use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cloud_provider::finalizer::{add_finalizers, cleanup_step};
use crate::cloud_provider::{Instance, InstanceStatus, Kind, Provider, ProviderData};
use crate::config::{ConfigVarBool, ConfigVarResolver, ConfigVarString};
use crate::constants;
use crate::errors::{CommandError, MachineError};
use crate::machine::{Machine, MachineSpec};
use crate::polling::{INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, PollError, poll_immediate};

const FINALIZER_INSTANCE: &str = "machine-engine/vsphere-instance";

/// vCenter has no free-form tags on the VM object itself; ownership goes
/// through the cis tagging service, one tag value per machine UID inside a
/// dedicated category.
const TAG_CATEGORY: &str = "machine-engine";

fn uid_tag_name(uid: &str) -> String {
    format!("machine-uid-{uid}")
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub address: ConfigVarString,
    pub username: ConfigVarString,
    pub password: ConfigVarString,
    pub datacenter: ConfigVarString,
    pub cluster: ConfigVarString,
    pub datastore: ConfigVarString,
    pub folder: ConfigVarString,
    pub template_vm_name: ConfigVarString,
    pub cpus: Option<i32>,
    pub memory_mb: Option<i64>,
    pub allow_insecure: ConfigVarBool,
    pub ca_certificate: ConfigVarString,
}

struct Config {
    address: String,
    username: String,
    password: String,
    datacenter: String,
    cluster: String,
    datastore: String,
    folder: String,
    template_vm_name: String,
    cpus: i32,
    memory_mb: i64,
    ca_certificate: Option<String>,
}

struct VsphereSession {
    http: reqwest::Client,
    address: String,
    session_id: String,
}

impl VsphereSession {
    async fn open(config: &Config) -> Result<Self, MachineError> {
        let http = crate::utilities::http_client_with_ca(config.ca_certificate.as_deref())?;

        let response = http
            .post(format!("{}/api/session", config.address.trim_end_matches('/')))
            .basic_auth(&config.username, Some(&config.password))
            .send()
            .await
            .map_err(CommandError::from)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(MachineError::new_auth_failure(
                "vCenter rejected the configured credentials".to_string(),
            ));
        }
        if !response.status().is_success() {
            return Err(MachineError::new_retryable(
                format!("vCenter session request failed with {}", response.status()),
                None,
            ));
        }

        let session_id: String = response.json().await.map_err(CommandError::from)?;

        Ok(VsphereSession {
            http,
            address: config.address.trim_end_matches('/').to_string(),
            session_id,
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
            .request(method, format!("{}{path}", self.address))
            .header("vmware-api-session-id", &self.session_id);
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
                Err(MachineError::new_auth_failure(format!("vSphere {operation}: {status}")))
            }
            StatusCode::BAD_REQUEST => Err(MachineError::new_invalid_configuration(format!(
                "vSphere {operation}: {payload}"
            ))),
            _ => Err(MachineError::new_retryable(
                format!("vSphere {operation} failed with {status}"),
                Some(payload.to_string()),
            )),
        }
    }

    /// Returns the tag id for the machine UID inside our category, creating
    /// category and tag on first use.
    async fn ensure_uid_tag(&self, uid: &str) -> Result<String, MachineError> {
        if let Some(tag_id) = self.find_uid_tag(uid).await? {
            return Ok(tag_id);
        }

        let category_id = match self.find_category().await? {
            Some(id) => id,
            None => {
                let (_, created) = self
                    .request(
                        "CreateTagCategory",
                        reqwest::Method::POST,
                        "/api/cis/tagging/category",
                        Some(json!({
                            "name": TAG_CATEGORY,
                            "description": "machine ownership tags",
                            "cardinality": "MULTIPLE",
                            "associable_types": [],
                        })),
                    )
                    .await?;
                created.as_str().unwrap_or_default().to_string()
            }
        };

        let (_, created) = self
            .request(
                "CreateTag",
                reqwest::Method::POST,
                "/api/cis/tagging/tag",
                Some(json!({
                    "name": uid_tag_name(uid),
                    "description": "",
                    "category_id": category_id,
                })),
            )
            .await?;

        Ok(created.as_str().unwrap_or_default().to_string())
    }

    async fn find_category(&self) -> Result<Option<String>, MachineError> {
        let (_, ids) = self
            .request("ListTagCategories", reqwest::Method::GET, "/api/cis/tagging/category", None)
            .await?;

        for id in ids.as_array().unwrap_or(&vec![]) {
            let Some(id) = id.as_str() else { continue };
            let (_, category) = self
                .request(
                    "GetTagCategory",
                    reqwest::Method::GET,
                    &format!("/api/cis/tagging/category/{id}"),
                    None,
                )
                .await?;
            if category.pointer("/name").and_then(|n| n.as_str()) == Some(TAG_CATEGORY) {
                return Ok(Some(id.to_string()));
            }
        }
        Ok(None)
    }

    async fn find_uid_tag(&self, uid: &str) -> Result<Option<String>, MachineError> {
        let (_, ids) = self
            .request("ListTags", reqwest::Method::GET, "/api/cis/tagging/tag", None)
            .await?;

        let wanted = uid_tag_name(uid);
        for id in ids.as_array().unwrap_or(&vec![]) {
            let Some(id) = id.as_str() else { continue };
            let (_, tag) = self
                .request("GetTag", reqwest::Method::GET, &format!("/api/cis/tagging/tag/{id}"), None)
                .await?;
            if tag.pointer("/name").and_then(|n| n.as_str()) == Some(wanted.as_str()) {
                return Ok(Some(id.to_string()));
            }
        }
        Ok(None)
    }

    async fn attach_tag(&self, tag_id: &str, vm_id: &str) -> Result<(), MachineError> {
        self.request(
            "AttachTag",
            reqwest::Method::POST,
            &format!("/api/cis/tagging/tag-association/{tag_id}?action=attach"),
            Some(json!({ "type": "VirtualMachine", "id": vm_id })),
        )
        .await?;
        Ok(())
    }

    async fn vms_with_tag(&self, tag_id: &str) -> Result<Vec<String>, MachineError> {
        let (_, attached) = self
            .request(
                "ListAttachedObjects",
                reqwest::Method::POST,
                &format!("/api/cis/tagging/tag-association/{tag_id}?action=list-attached-objects"),
                None,
            )
            .await?;

        Ok(attached
            .as_array()
            .unwrap_or(&vec![])
            .iter()
            .filter(|object| object.pointer("/type").and_then(|t| t.as_str()) == Some("VirtualMachine"))
            .filter_map(|object| object.pointer("/id").and_then(|i| i.as_str()))
            .map(|id| id.to_string())
            .collect())
    }

    async fn vm_details(&self, vm_id: &str) -> Result<Option<Value>, MachineError> {
        let (status, vm) = self
            .request("GetVm", reqwest::Method::GET, &format!("/api/vcenter/vm/{vm_id}"), None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(vm))
    }
}

fn map_power_state(state: &str) -> InstanceStatus {
    match state {
        "POWERED_ON" => InstanceStatus::Running,
        "POWERED_OFF" | "SUSPENDED" => InstanceStatus::Unknown,
        _ => InstanceStatus::Unknown,
    }
}

pub struct VsphereProvider {
    resolver: ConfigVarResolver,
}

impl VsphereProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        VsphereProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse vsphere provider spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        let ca_certificate = {
            let pem = self.resolver.get_string(&raw.ca_certificate).await?;
            if pem.is_empty() { None } else { Some(pem) }
        };

        Ok(Config {
            address: self.resolver.get_string_or_env(&raw.address, constants::VSPHERE_ADDRESS).await?,
            username: self
                .resolver
                .get_string_or_env(&raw.username, constants::VSPHERE_USERNAME)
                .await?,
            password: self
                .resolver
                .get_string_or_env(&raw.password, constants::VSPHERE_PASSWORD)
                .await?,
            datacenter: self.resolver.get_string(&raw.datacenter).await?,
            cluster: self.resolver.get_string(&raw.cluster).await?,
            datastore: self.resolver.get_string(&raw.datastore).await?,
            folder: self.resolver.get_string(&raw.folder).await?,
            template_vm_name: self.resolver.get_string(&raw.template_vm_name).await?,
            cpus: raw.cpus.unwrap_or(2),
            memory_mb: raw.memory_mb.unwrap_or(2048),
            ca_certificate,
        })
    }

    async fn find_vm_by_name(&self, session: &VsphereSession, name: &str) -> Result<Option<String>, MachineError> {
        let (_, listing) = session
            .request(
                "ListVms",
                reqwest::Method::GET,
                &format!("/api/vcenter/vm?names={name}"),
                None,
            )
            .await?;

        Ok(listing
            .as_array()
            .unwrap_or(&vec![])
            .first()
            .and_then(|vm| vm.pointer("/vm").and_then(|id| id.as_str()))
            .map(|id| id.to_string()))
    }

    async fn instance_by_uid(
        &self,
        session: &VsphereSession,
        machine: &Machine,
    ) -> Result<Option<Instance>, MachineError> {
        let Some(tag_id) = session.find_uid_tag(&machine.uid()).await? else {
            return Ok(None);
        };

        for vm_id in session.vms_with_tag(&tag_id).await? {
            let Some(vm) = session.vm_details(&vm_id).await? else {
                continue;
            };
            let name = vm.pointer("/name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
            let status = vm
                .pointer("/power_state")
                .and_then(|s| s.as_str())
                .map(map_power_state)
                .unwrap_or(InstanceStatus::Unknown);

            return Ok(Some(Instance {
                provider_id: Some(format!("vsphere://{vm_id}")),
                id: vm_id,
                name,
                addresses: HashMap::new(),
                status,
            }));
        }

        Ok(None)
    }
}

#[async_trait]
impl Provider for VsphereProvider {
    fn kind(&self) -> Kind {
        Kind::Vsphere
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.cpus.is_none() {
            raw.cpus = Some(2);
        }
        if raw.memory_mb.is_none() {
            raw.memory_mb = Some(2048);
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw)
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot serialize vsphere provider spec: {e}")))?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        for (field, value) in [
            ("address", &config.address),
            ("username", &config.username),
            ("password", &config.password),
            ("templateVMName", &config.template_vm_name),
            ("datastore", &config.datastore),
        ] {
            if value.is_empty() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "{field} must be configured"
                )));
            }
        }

        let session = VsphereSession::open(&config).await?;

        if self.find_vm_by_name(&session, &config.template_vm_name).await?.is_none() {
            return Err(MachineError::new_invalid_configuration(format!(
                "template VM `{}` not found",
                config.template_vm_name
            )));
        }

        let (_, datastores) = session
            .request(
                "ListDatastores",
                reqwest::Method::GET,
                &format!("/api/vcenter/datastore?names={}", config.datastore),
                None,
            )
            .await?;
        if datastores.as_array().map(|d| d.is_empty()).unwrap_or(true) {
            return Err(MachineError::new_invalid_configuration(format!(
                "datastore `{}` not found",
                config.datastore
            )));
        }

        Ok(())
    }

    async fn get_cloud_config(&self, spec: &MachineSpec) -> Result<(String, String), MachineError> {
        let config = self.config(spec).await?;
        let server = config
            .address
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string();
        let cloud_config = format!(
            r#"[Global]
user = "{}"
password = "{}"
port = "443"
insecure-flag = "0"

[VirtualCenter "{server}"]
datacenters = "{}"

[Workspace]
server = "{server}"
datacenter = "{}"
default-datastore = "{}"
folder = "{}"
"#,
            config.username, config.password, config.datacenter, config.datacenter, config.datastore, config.folder
        );
        Ok((cloud_config, "vsphere".to_string()))
    }

    async fn create(
        &self,
        machine: &Machine,
        data: &ProviderData,
        userdata: &str,
    ) -> Result<Instance, MachineError> {
        let config = self.config(&machine.spec).await?;
        let session = VsphereSession::open(&config).await?;

        let machine = add_finalizers(data, machine, &[FINALIZER_INSTANCE]).await?;

        let template_id = self
            .find_vm_by_name(&session, &config.template_vm_name)
            .await?
            .ok_or_else(|| {
                MachineError::new_invalid_configuration(format!(
                    "template VM `{}` not found",
                    config.template_vm_name
                ))
            })?;

        let (_, cloned) = session
            .request(
                "CloneVm",
                reqwest::Method::POST,
                "/api/vcenter/vm?action=clone",
                Some(json!({
                    "source": template_id,
                    "name": machine.machine_name(),
                    "power_on": true,
                })),
            )
            .await?;
        let vm_id = cloned.as_str().unwrap_or_default().to_string();

        // guestinfo carries the provisioning payload into the guest
        session
            .request(
                "UpdateVm",
                reqwest::Method::PATCH,
                &format!("/api/vcenter/vm/{vm_id}"),
                Some(json!({
                    "cpu": { "count": config.cpus },
                    "memory": { "size_MiB": config.memory_mb },
                    "extra_config": [
                        { "key": "guestinfo.userdata", "value": crate::utilities::gzip_base64(userdata)? },
                        { "key": "guestinfo.userdata.encoding", "value": "gzip+base64" },
                    ],
                })),
            )
            .await?;

        let tag_id = session.ensure_uid_tag(&machine.uid()).await?;
        session.attach_tag(&tag_id, &vm_id).await?;
        info!("vsphere vm `{vm_id}` issued for machine `{}`", machine.machine_name());

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
        let session = VsphereSession::open(&config).await?;

        self.instance_by_uid(&session, machine)
            .await?
            .ok_or_else(|| MachineError::InstanceNotFound(machine.machine_name()))
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let session = VsphereSession::open(&config).await?;

        let step = cleanup_step(data, machine, FINALIZER_INSTANCE, || async {
            let Some(tag_id) = session.find_uid_tag(&machine.uid()).await? else {
                return Ok(true);
            };

            let vm_ids = session.vms_with_tag(&tag_id).await?;
            if vm_ids.is_empty() {
                // drop the tag itself once nothing carries it
                session
                    .request(
                        "DeleteTag",
                        reqwest::Method::DELETE,
                        &format!("/api/cis/tagging/tag/{tag_id}"),
                        None,
                    )
                    .await?;
                return Ok(true);
            }

            for vm_id in &vm_ids {
                // powered-on VMs must stop before deletion
                session
                    .request(
                        "StopVm",
                        reqwest::Method::POST,
                        &format!("/api/vcenter/vm/{vm_id}/power?action=stop"),
                        None,
                    )
                    .await?;
                session
                    .request("DeleteVm", reqwest::Method::DELETE, &format!("/api/vcenter/vm/{vm_id}"), None)
                    .await?;
            }
            Ok(false)
        })
        .await?;

        Ok(step.is_some())
    }

    async fn migrate_uid(&self, machine: &Machine, _data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        let config = self.config(&machine.spec).await?;
        let session = VsphereSession::open(&config).await?;

        let Some(old_tag_id) = session.find_uid_tag(&machine.uid()).await? else {
            return Ok(());
        };
        let vm_ids = session.vms_with_tag(&old_tag_id).await?;

        let new_tag_id = session.ensure_uid_tag(new_uid).await?;
        for vm_id in &vm_ids {
            session.attach_tag(&new_tag_id, vm_id).await?;
            session
                .request(
                    "DetachTag",
                    reqwest::Method::POST,
                    &format!("/api/cis/tagging/tag-association/{old_tag_id}?action=detach"),
                    Some(json!({ "type": "VirtualMachine", "id": vm_id })),
                )
                .await?;
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("cpus".to_string(), raw.cpus.unwrap_or(2).to_string()),
            ("memory_mb".to_string(), raw.memory_mb.unwrap_or(2048).to_string()),
            ("template".to_string(), raw.template_vm_name.value.clone()),
        ]))
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        let mut by_credentials: HashMap<(String, String, String), Vec<&Machine>> = HashMap::new();
        for machine in machines {
            let config = self.config(&machine.spec).await?;
            by_credentials
                .entry((config.address, config.username, config.password))
                .or_default()
                .push(machine);
        }

        for machines in by_credentials.values() {
            let Some(first) = machines.first() else { continue };
            let config = self.config(&first.spec).await?;
            let session = VsphereSession::open(&config).await?;

            for machine in machines.iter() {
                let count = match session.find_uid_tag(&machine.uid()).await? {
                    Some(tag_id) => session.vms_with_tag(&tag_id).await?.len(),
                    None => 0,
                };
                crate::metrics::INSTANCES_FOR_MACHINE.set(&machine.machine_name(), count as f64);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_tag_name() {
        // execute & verify:
        assert_eq!(uid_tag_name("abc-123"), "machine-uid-abc-123");
    }

    #[test]
    fn test_power_state_mapping() {
        // execute & verify: powered-off is never treated as deleted
        assert_eq!(map_power_state("POWERED_ON"), InstanceStatus::Running);
        assert_eq!(map_power_state("POWERED_OFF"), InstanceStatus::Unknown);
        assert_eq!(map_power_state("SUSPENDED"), InstanceStatus::Unknown);
    }
}
