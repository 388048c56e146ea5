use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use azure_core::auth::TokenCredential;
use base64::Engine;
use base64::engine::general_purpose;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::cloud_provider::finalizer::{add_finalizers, cleanup_step};
use crate::cloud_provider::tagging::{MACHINE_UID_TAG_KEY, machine_tags, uid_tag_matches};
use crate::cloud_provider::{AddressType, Instance, InstanceStatus, Kind, Provider, ProviderData};
use crate::config::{ConfigVarBool, ConfigVarResolver, ConfigVarString};
use crate::constants;
use crate::errors::{CommandError, MachineError};
use crate::machine::{Machine, MachineSpec};
use crate::network::IpFamily;
use crate::polling::{INSTANCE_POLL_INTERVAL, INSTANCE_POLL_TIMEOUT, PollError, poll_immediate};

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const COMPUTE_API_VERSION: &str = "2023-03-01";
const NETWORK_API_VERSION: &str = "2023-05-01";
const SKUS_API_VERSION: &str = "2021-07-01";

const FINALIZER_VM: &str = "machine-engine/azure-vm";
const FINALIZER_DISKS: &str = "machine-engine/azure-disks";
const FINALIZER_NIC: &str = "machine-engine/azure-nic";
const FINALIZER_PUBLIC_IP: &str = "machine-engine/azure-public-ip";
const FINALIZER_PUBLIC_IP_V6: &str = "machine-engine/azure-public-ip-v6";

const ADMIN_USER_NAME: &str = "azureuser";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConfig {
    pub tenant_id: ConfigVarString,
    pub client_id: ConfigVarString,
    pub client_secret: ConfigVarString,
    pub subscription_id: ConfigVarString,
    pub location: ConfigVarString,
    pub resource_group: ConfigVarString,
    pub vnet_resource_group: ConfigVarString,
    pub vm_size: ConfigVarString,
    pub vnet_name: ConfigVarString,
    pub subnet_name: ConfigVarString,
    pub security_group_name: ConfigVarString,
    pub availability_set: ConfigVarString,
    pub assign_availability_set: Option<bool>,
    pub zones: Vec<String>,
    pub image_id: ConfigVarString,
    pub os_disk_size: Option<i32>,
    pub os_disk_sku: ConfigVarString,
    pub data_disk_size: Option<i32>,
    pub data_disk_sku: ConfigVarString,
    pub assign_public_ip: ConfigVarBool,
    pub enable_accelerated_networking: Option<bool>,
    pub ip_family: Option<String>,
    pub tags: BTreeMap<String, String>,
}

struct Config {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    subscription_id: String,
    location: String,
    resource_group: String,
    vnet_resource_group: String,
    vm_size: String,
    vnet_name: String,
    subnet_name: String,
    security_group_name: String,
    availability_set: String,
    assign_availability_set: bool,
    zones: Vec<String>,
    image_id: String,
    os_disk_size: i32,
    os_disk_sku: String,
    data_disk_size: Option<i32>,
    data_disk_sku: String,
    assign_public_ip: bool,
    enable_accelerated_networking: bool,
    ip_family: IpFamily,
    tags: BTreeMap<String, String>,
}

/// Thin bearer-token client for the ARM REST surface; SDK-level wrappers for
/// compute do not cover everything the driver touches.
struct ArmClient {
    http: reqwest::Client,
    bearer: String,
    subscription_id: String,
}

impl ArmClient {
    async fn new(config: &Config) -> Result<Self, MachineError> {
        let credential = azure_identity::ClientSecretCredential::new(
            azure_core::new_http_client(),
            Url::parse(AUTHORITY_HOST).map_err(CommandError::from)?,
            config.tenant_id.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
        );

        let scope = format!("{MANAGEMENT_ENDPOINT}/.default");
        let token = credential
            .get_token(&[scope.as_str()])
            .await
            .map_err(|e| MachineError::new_auth_failure(format!("cannot acquire ARM token: {e}")))?;

        Ok(ArmClient {
            http: crate::utilities::http_client_with_ca(None)?,
            bearer: token.token.secret().to_string(),
            subscription_id: config.subscription_id.clone(),
        })
    }

    fn url(&self, path: &str, api_version: &str) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        format!("{MANAGEMENT_ENDPOINT}{path}{separator}api-version={api_version}")
    }

    async fn request(
        &self,
        operation: &str,
        method: reqwest::Method,
        path: &str,
        api_version: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value), MachineError> {
        let mut request = self
            .http
            .request(method, self.url(path, api_version))
            .bearer_auth(&self.bearer);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(CommandError::from)?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok((status, payload));
        }

        Err(classify_response(operation, status, &payload))
    }

    async fn get(&self, operation: &str, path: &str, api_version: &str) -> Result<Option<Value>, MachineError> {
        let (status, payload) = self
            .request(operation, reqwest::Method::GET, path, api_version, None)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    async fn put(&self, operation: &str, path: &str, api_version: &str, body: Value) -> Result<Value, MachineError> {
        let (status, payload) = self
            .request(operation, reqwest::Method::PUT, path, api_version, Some(body))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(MachineError::new_invalid_configuration(format!(
                "{operation}: resource path does not exist"
            )));
        }
        Ok(payload)
    }

    async fn patch_tags(&self, operation: &str, path: &str, api_version: &str, tags: &BTreeMap<String, String>) -> Result<(), MachineError> {
        self.request(
            operation,
            reqwest::Method::PATCH,
            path,
            api_version,
            Some(json!({ "tags": tags })),
        )
        .await?;
        Ok(())
    }

    /// Issues a DELETE and reports whether the resource is already gone.
    async fn delete(&self, operation: &str, path: &str, api_version: &str) -> Result<bool, MachineError> {
        let (status, _) = self
            .request(operation, reqwest::Method::DELETE, path, api_version, None)
            .await?;
        Ok(status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT)
    }
}

fn classify_response(operation: &str, status: StatusCode, payload: &Value) -> MachineError {
    let code = payload
        .pointer("/error/code")
        .and_then(|c| c.as_str())
        .unwrap_or_default();

    match (status, code) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            MachineError::new_auth_failure(format!("Azure {operation}: {status} {code}"))
        }
        (_, "QuotaExceeded" | "OperationNotAllowed" | "SkuNotAvailable" | "ZonalAllocationFailed") => {
            MachineError::new_insufficient_resources(format!("Azure {operation}: {code}"))
        }
        (StatusCode::BAD_REQUEST, _) | (_, "InvalidParameter" | "InvalidResourceReference") => {
            MachineError::new_invalid_configuration(format!("Azure {operation}: {status} {code}"))
        }
        _ => MachineError::new_retryable(
            format!("Azure {operation} failed with {status}"),
            Some(payload.to_string()),
        ),
    }
}

fn vm_name(machine: &Machine) -> String {
    machine.machine_name()
}

fn nic_name(machine: &Machine) -> String {
    format!("{}-net", machine.machine_name())
}

fn public_ip_name(machine: &Machine) -> String {
    format!("{}-pip", machine.machine_name())
}

fn public_ip_v6_name(machine: &Machine) -> String {
    format!("{}-pip-v6", machine.machine_name())
}

fn os_disk_name(machine: &Machine) -> String {
    format!("{}-osdisk", machine.machine_name())
}

fn data_disk_name(machine: &Machine) -> String {
    format!("{}-datadisk", machine.machine_name())
}

pub struct AzureProvider {
    resolver: ConfigVarResolver,
}

impl AzureProvider {
    pub fn new(resolver: ConfigVarResolver) -> Self {
        AzureProvider { resolver }
    }

    fn raw_config(spec: &MachineSpec) -> Result<RawConfig, MachineError> {
        serde_json::from_value(spec.provider_spec.cloud_provider_spec.clone())
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse azure provider spec: {e}")))
    }

    async fn config(&self, spec: &MachineSpec) -> Result<Config, MachineError> {
        let raw = Self::raw_config(spec)?;

        let resource_group = self.resolver.get_string(&raw.resource_group).await?;
        let vnet_resource_group = {
            let explicit = self.resolver.get_string(&raw.vnet_resource_group).await?;
            if explicit.is_empty() { resource_group.clone() } else { explicit }
        };

        let ip_family = match &raw.ip_family {
            None => IpFamily::IPv4,
            Some(raw_family) => IpFamily::from_str(raw_family).map_err(|_| {
                MachineError::new_invalid_configuration(format!("cannot parse ip family `{raw_family}`"))
            })?,
        };

        let (assign_public_ip, _) = self.resolver.get_bool(&raw.assign_public_ip).await?;

        Ok(Config {
            tenant_id: self.resolver.get_string_or_env(&raw.tenant_id, constants::AZURE_TENANT_ID).await?,
            client_id: self.resolver.get_string_or_env(&raw.client_id, constants::AZURE_CLIENT_ID).await?,
            client_secret: self
                .resolver
                .get_string_or_env(&raw.client_secret, constants::AZURE_CLIENT_SECRET)
                .await?,
            subscription_id: self
                .resolver
                .get_string_or_env(&raw.subscription_id, constants::AZURE_SUBSCRIPTION_ID)
                .await?,
            location: self.resolver.get_string(&raw.location).await?,
            resource_group,
            vnet_resource_group,
            vm_size: self.resolver.get_string(&raw.vm_size).await?,
            vnet_name: self.resolver.get_string(&raw.vnet_name).await?,
            subnet_name: self.resolver.get_string(&raw.subnet_name).await?,
            security_group_name: self.resolver.get_string(&raw.security_group_name).await?,
            availability_set: self.resolver.get_string(&raw.availability_set).await?,
            assign_availability_set: raw.assign_availability_set.unwrap_or(false),
            zones: raw.zones,
            image_id: self.resolver.get_string(&raw.image_id).await?,
            os_disk_size: raw.os_disk_size.unwrap_or(64),
            os_disk_sku: self.resolver.get_string(&raw.os_disk_sku).await?,
            data_disk_size: raw.data_disk_size,
            data_disk_sku: self.resolver.get_string(&raw.data_disk_sku).await?,
            assign_public_ip,
            enable_accelerated_networking: raw.enable_accelerated_networking.unwrap_or(false),
            ip_family,
            tags: raw.tags,
        })
    }

    fn resource_path(config: &Config, provider: &str, kind: &str, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{provider}/{kind}/{name}",
            config.subscription_id, config.resource_group
        )
    }

    fn subnet_id(config: &Config) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
            config.subscription_id, config.vnet_resource_group, config.vnet_name, config.subnet_name
        )
    }

    async fn ensure_public_ips(
        &self,
        client: &ArmClient,
        config: &Config,
        machine: &Machine,
        tags: &BTreeMap<String, String>,
    ) -> Result<(Option<String>, Option<String>), MachineError> {
        if !config.assign_public_ip {
            return Ok((None, None));
        }

        let v4_path = Self::resource_path(config, "Microsoft.Network", "publicIPAddresses", &public_ip_name(machine));
        let v4 = client
            .put(
                "CreatePublicIP",
                &v4_path,
                NETWORK_API_VERSION,
                json!({
                    "location": config.location,
                    "sku": { "name": "Standard" },
                    "properties": {
                        "publicIPAllocationMethod": "Static",
                        "publicIPAddressVersion": "IPv4",
                    },
                    "tags": tags,
                }),
            )
            .await?;
        let v4_id = v4.pointer("/id").and_then(|id| id.as_str()).map(|s| s.to_string());

        let v6_id = if config.ip_family == IpFamily::DualStack {
            let v6_path =
                Self::resource_path(config, "Microsoft.Network", "publicIPAddresses", &public_ip_v6_name(machine));
            let v6 = client
                .put(
                    "CreatePublicIPv6",
                    &v6_path,
                    NETWORK_API_VERSION,
                    json!({
                        "location": config.location,
                        "sku": { "name": "Standard" },
                        "properties": {
                            "publicIPAllocationMethod": "Static",
                            "publicIPAddressVersion": "IPv6",
                        },
                        "tags": tags,
                    }),
                )
                .await?;
            v6.pointer("/id").and_then(|id| id.as_str()).map(|s| s.to_string())
        } else {
            None
        };

        Ok((v4_id, v6_id))
    }

    async fn ensure_nic(
        &self,
        client: &ArmClient,
        config: &Config,
        machine: &Machine,
        tags: &BTreeMap<String, String>,
        public_ip_v4: Option<String>,
        public_ip_v6: Option<String>,
    ) -> Result<String, MachineError> {
        let mut ip_configurations = vec![];

        let mut v4_properties = json!({
            "subnet": { "id": Self::subnet_id(config) },
            "privateIPAllocationMethod": "Dynamic",
            "privateIPAddressVersion": "IPv4",
            "primary": true,
        });
        if let Some(id) = public_ip_v4 {
            v4_properties["publicIPAddress"] = json!({ "id": id });
        }
        ip_configurations.push(json!({ "name": "ip-config-1", "properties": v4_properties }));

        if config.ip_family == IpFamily::DualStack {
            let mut v6_properties = json!({
                "subnet": { "id": Self::subnet_id(config) },
                "privateIPAllocationMethod": "Dynamic",
                "privateIPAddressVersion": "IPv6",
            });
            if let Some(id) = public_ip_v6 {
                v6_properties["publicIPAddress"] = json!({ "id": id });
            }
            ip_configurations.push(json!({ "name": "ip-config-v6", "properties": v6_properties }));
        }

        let mut properties = json!({
            "ipConfigurations": ip_configurations,
            "enableAcceleratedNetworking": config.enable_accelerated_networking,
        });
        if !config.security_group_name.is_empty() {
            properties["networkSecurityGroup"] = json!({
                "id": Self::resource_path(config, "Microsoft.Network", "networkSecurityGroups", &config.security_group_name),
            });
        }

        let path = Self::resource_path(config, "Microsoft.Network", "networkInterfaces", &nic_name(machine));
        let nic = client
            .put(
                "CreateNetworkInterface",
                &path,
                NETWORK_API_VERSION,
                json!({ "location": config.location, "properties": properties, "tags": tags }),
            )
            .await?;

        nic.pointer("/id")
            .and_then(|id| id.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| MachineError::new_retryable("network interface has no id yet".to_string(), None))
    }

    async fn vm_by_uid(&self, client: &ArmClient, config: &Config, uid: &str) -> Result<Option<Value>, MachineError> {
        let path = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines",
            config.subscription_id, config.resource_group
        );
        let Some(listing) = client.get("ListVirtualMachines", &path, COMPUTE_API_VERSION).await? else {
            return Ok(None);
        };

        for vm in listing.pointer("/value").and_then(|v| v.as_array()).unwrap_or(&vec![]) {
            let tags: BTreeMap<String, String> = vm
                .pointer("/tags")
                .and_then(|t| serde_json::from_value(t.clone()).ok())
                .unwrap_or_default();
            if uid_tag_matches(&tags, uid) {
                return Ok(Some(vm.clone()));
            }
        }
        Ok(None)
    }

    async fn instance_from_vm(
        &self,
        client: &ArmClient,
        config: &Config,
        machine: &Machine,
        vm: &Value,
    ) -> Result<Instance, MachineError> {
        let name = vm.pointer("/name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
        let id = vm.pointer("/id").and_then(|i| i.as_str()).unwrap_or_default().to_string();

        let provisioning_state = vm
            .pointer("/properties/provisioningState")
            .and_then(|s| s.as_str())
            .unwrap_or_default();

        let status = match provisioning_state {
            "Creating" | "Updating" => InstanceStatus::Creating,
            "Deleting" => InstanceStatus::Deleting,
            "Succeeded" => {
                let instance_view_path = format!(
                    "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{name}/instanceView",
                    config.subscription_id, config.resource_group
                );
                let view = client
                    .get("GetInstanceView", &instance_view_path, COMPUTE_API_VERSION)
                    .await?;
                power_state_of(view.as_ref())
            }
            _ => InstanceStatus::Unknown,
        };

        let mut addresses = HashMap::new();
        let nic_path = Self::resource_path(config, "Microsoft.Network", "networkInterfaces", &nic_name(machine));
        if let Some(nic) = client.get("GetNetworkInterface", &nic_path, NETWORK_API_VERSION).await? {
            for ip_configuration in nic
                .pointer("/properties/ipConfigurations")
                .and_then(|c| c.as_array())
                .unwrap_or(&vec![])
            {
                if let Some(ip) = ip_configuration
                    .pointer("/properties/privateIPAddress")
                    .and_then(|ip| ip.as_str())
                {
                    addresses.insert(ip.to_string(), AddressType::InternalIp);
                }
            }
        }
        for pip_name in [public_ip_name(machine), public_ip_v6_name(machine)] {
            let pip_path = Self::resource_path(config, "Microsoft.Network", "publicIPAddresses", &pip_name);
            if let Some(pip) = client.get("GetPublicIP", &pip_path, NETWORK_API_VERSION).await? {
                if let Some(ip) = pip.pointer("/properties/ipAddress").and_then(|ip| ip.as_str()) {
                    addresses.insert(ip.to_string(), AddressType::ExternalIp);
                }
            }
        }

        Ok(Instance {
            provider_id: Some(format!("azure://{id}")),
            id,
            name,
            addresses,
            status,
        })
    }
}

fn power_state_of(view: Option<&Value>) -> InstanceStatus {
    let Some(view) = view else {
        return InstanceStatus::Unknown;
    };

    for status in view.pointer("/statuses").and_then(|s| s.as_array()).unwrap_or(&vec![]) {
        match status.pointer("/code").and_then(|c| c.as_str()).unwrap_or_default() {
            "PowerState/running" => return InstanceStatus::Running,
            "PowerState/starting" => return InstanceStatus::Creating,
            "PowerState/stopping" | "PowerState/deallocating" => return InstanceStatus::Deleting,
            _ => {}
        }
    }
    InstanceStatus::Unknown
}

#[async_trait]
impl Provider for AzureProvider {
    fn kind(&self) -> Kind {
        Kind::Azure
    }

    fn add_defaults(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        let mut raw = Self::raw_config(&spec)?;

        if raw.os_disk_size.is_none() {
            raw.os_disk_size = Some(64);
        }
        if raw.os_disk_sku.value.is_empty() && raw.os_disk_sku.secret_key_ref.is_none() {
            raw.os_disk_sku = ConfigVarString::from_literal("Standard_LRS");
        }

        spec.provider_spec.cloud_provider_spec = serde_json::to_value(&raw)
            .map_err(|e| MachineError::new_invalid_configuration(format!("cannot serialize azure provider spec: {e}")))?;
        Ok(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        let config = self.config(spec).await?;

        for (field, value) in [
            ("subscriptionID", &config.subscription_id),
            ("tenantID", &config.tenant_id),
            ("clientID", &config.client_id),
            ("clientSecret", &config.client_secret),
            ("location", &config.location),
            ("resourceGroup", &config.resource_group),
            ("vmSize", &config.vm_size),
        ] {
            if value.is_empty() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "{field} must be configured"
                )));
            }
        }

        if !config.zones.is_empty() && !config.availability_set.is_empty() {
            return Err(MachineError::new_invalid_configuration(
                "zones and availabilitySet are mutually exclusive".to_string(),
            ));
        }

        // UltraSSD disks cannot live inside an availability set
        let uses_availability_set = config.assign_availability_set || !config.availability_set.is_empty();
        if uses_availability_set && (config.os_disk_sku == "UltraSSD_LRS" || config.data_disk_sku == "UltraSSD_LRS") {
            return Err(MachineError::new_invalid_configuration(
                "UltraSSD_LRS disks are incompatible with availability sets".to_string(),
            ));
        }

        let client = ArmClient::new(&config).await?;

        if !config.vnet_name.is_empty() {
            let subnet = client
                .get("GetSubnet", &Self::subnet_id(&config), NETWORK_API_VERSION)
                .await?;
            if subnet.is_none() {
                return Err(MachineError::new_invalid_configuration(format!(
                    "subnet `{}` not found in vnet `{}`",
                    config.subnet_name, config.vnet_name
                )));
            }
        }

        let skus_path = format!(
            "/subscriptions/{}/providers/Microsoft.Compute/skus?$filter=location eq '{}'",
            config.subscription_id, config.location
        );
        if let Some(skus) = client.get("ListSkus", &skus_path, SKUS_API_VERSION).await? {
            let sku = skus
                .pointer("/value")
                .and_then(|v| v.as_array())
                .and_then(|skus| {
                    skus.iter()
                        .find(|sku| sku.pointer("/name").and_then(|n| n.as_str()) == Some(config.vm_size.as_str()))
                })
                .cloned();

            let Some(sku) = sku else {
                return Err(MachineError::new_invalid_configuration(format!(
                    "VM size `{}` is not available in `{}`",
                    config.vm_size, config.location
                )));
            };

            if config.enable_accelerated_networking {
                let supported = sku
                    .pointer("/capabilities")
                    .and_then(|c| c.as_array())
                    .map(|capabilities| {
                        capabilities.iter().any(|capability| {
                            capability.pointer("/name").and_then(|n| n.as_str())
                                == Some("AcceleratedNetworkingEnabled")
                                && capability.pointer("/value").and_then(|v| v.as_str()) == Some("True")
                        })
                    })
                    .unwrap_or(false);
                if !supported {
                    return Err(MachineError::new_invalid_configuration(format!(
                        "VM size `{}` does not support accelerated networking",
                        config.vm_size
                    )));
                }
            }
        }

        Ok(())
    }

    async fn get_cloud_config(&self, spec: &MachineSpec) -> Result<(String, String), MachineError> {
        let config = self.config(spec).await?;
        let cloud_config = serde_json::to_string_pretty(&json!({
            "cloud": "AZUREPUBLICCLOUD",
            "tenantId": config.tenant_id,
            "subscriptionId": config.subscription_id,
            "aadClientId": config.client_id,
            "aadClientSecret": config.client_secret,
            "resourceGroup": config.resource_group,
            "location": config.location,
            "vnetName": config.vnet_name,
            "vnetResourceGroup": config.vnet_resource_group,
            "subnetName": config.subnet_name,
            "securityGroupName": config.security_group_name,
            "useInstanceMetadata": true,
        }))
        .map_err(CommandError::from)?;
        Ok((cloud_config, "azure".to_string()))
    }

    async fn create(
        &self,
        machine: &Machine,
        data: &ProviderData,
        userdata: &str,
    ) -> Result<Instance, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = ArmClient::new(&config).await?;
        let tags = machine_tags(machine, &config.tags);

        // dependent resources are created public IP -> NIC -> VM; the ladder
        // is appended before the first side effect. The IPv6 public IP rides
        // on the v4 finalizer.
        let machine = add_finalizers(
            data,
            machine,
            &[FINALIZER_VM, FINALIZER_DISKS, FINALIZER_NIC, FINALIZER_PUBLIC_IP],
        )
        .await?;

        let (public_ip_v4, public_ip_v6) = self.ensure_public_ips(&client, &config, &machine, &tags).await?;
        let nic_id = self
            .ensure_nic(&client, &config, &machine, &tags, public_ip_v4, public_ip_v6)
            .await?;

        let mut storage_profile = json!({
            "osDisk": {
                "name": os_disk_name(&machine),
                "createOption": "FromImage",
                "diskSizeGB": config.os_disk_size,
                "managedDisk": { "storageAccountType": config.os_disk_sku },
            },
        });
        if !config.image_id.is_empty() {
            storage_profile["imageReference"] = json!({ "id": config.image_id });
        }
        if let Some(size) = config.data_disk_size {
            let data_disk_sku = if config.data_disk_sku.is_empty() {
                "Standard_LRS"
            } else {
                config.data_disk_sku.as_str()
            };
            storage_profile["dataDisks"] = json!([{
                "name": data_disk_name(&machine),
                "lun": 0,
                "createOption": "Empty",
                "diskSizeGB": size,
                "managedDisk": { "storageAccountType": data_disk_sku },
            }]);
        }

        let ssh_keys: Vec<Value> = machine
            .spec
            .provider_spec
            .ssh_public_keys
            .iter()
            .map(|key| json!({ "path": format!("/home/{ADMIN_USER_NAME}/.ssh/authorized_keys"), "keyData": key }))
            .collect();

        let mut properties = json!({
            "hardwareProfile": { "vmSize": config.vm_size },
            "storageProfile": storage_profile,
            "osProfile": {
                "computerName": vm_name(&machine),
                "adminUsername": ADMIN_USER_NAME,
                "customData": general_purpose::STANDARD.encode(userdata),
                "linuxConfiguration": {
                    "disablePasswordAuthentication": true,
                    "ssh": { "publicKeys": ssh_keys },
                },
            },
            "networkProfile": { "networkInterfaces": [{ "id": nic_id }] },
        });
        if !config.availability_set.is_empty() {
            properties["availabilitySet"] = json!({
                "id": Self::resource_path(&config, "Microsoft.Compute", "availabilitySets", &config.availability_set),
            });
        }

        let mut body = json!({
            "location": config.location,
            "properties": properties,
            "tags": tags,
        });
        if !config.zones.is_empty() {
            body["zones"] = json!(config.zones);
        }

        let vm_path = Self::resource_path(&config, "Microsoft.Compute", "virtualMachines", &vm_name(&machine));
        client.put("CreateVirtualMachine", &vm_path, COMPUTE_API_VERSION, body).await?;
        info!("azure vm `{}` issued", vm_name(&machine));

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
        let client = ArmClient::new(&config).await?;

        match self.vm_by_uid(&client, &config, &machine.uid()).await? {
            Some(vm) => self.instance_from_vm(&client, &config, machine, &vm).await,
            None => Err(MachineError::InstanceNotFound(machine.machine_name())),
        }
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = ArmClient::new(&config).await?;

        // strict order: VM, disks, NIC, public IPs; a later rung never runs
        // before the earlier one dropped its finalizer
        let machine = match cleanup_step(data, machine, FINALIZER_VM, || async {
            let vm_path = Self::resource_path(&config, "Microsoft.Compute", "virtualMachines", &vm_name(machine));
            if client.get("GetVirtualMachine", &vm_path, COMPUTE_API_VERSION).await?.is_none() {
                return Ok(true);
            }
            client.delete("DeleteVirtualMachine", &vm_path, COMPUTE_API_VERSION).await
        })
        .await?
        {
            Some(machine) => machine,
            None => return Ok(false),
        };

        let machine = match cleanup_step(data, &machine, FINALIZER_DISKS, || async {
            let mut all_gone = true;
            for disk in [os_disk_name(&machine), data_disk_name(&machine)] {
                let disk_path = Self::resource_path(&config, "Microsoft.Compute", "disks", &disk);
                if client.get("GetDisk", &disk_path, COMPUTE_API_VERSION).await?.is_some() {
                    all_gone &= client.delete("DeleteDisk", &disk_path, COMPUTE_API_VERSION).await?;
                }
            }
            Ok(all_gone)
        })
        .await?
        {
            Some(machine) => machine,
            None => return Ok(false),
        };

        let machine = match cleanup_step(data, &machine, FINALIZER_NIC, || async {
            let nic_path = Self::resource_path(&config, "Microsoft.Network", "networkInterfaces", &nic_name(&machine));
            if client.get("GetNetworkInterface", &nic_path, NETWORK_API_VERSION).await?.is_none() {
                return Ok(true);
            }
            client.delete("DeleteNetworkInterface", &nic_path, NETWORK_API_VERSION).await
        })
        .await?
        {
            Some(machine) => machine,
            None => return Ok(false),
        };

        let machine = match cleanup_step(data, &machine, FINALIZER_PUBLIC_IP, || async {
            // the v6 address is owned by this rung too when its own finalizer
            // was never added
            let mut all_gone = true;
            for pip in [public_ip_name(&machine), public_ip_v6_name(&machine)] {
                let pip_path = Self::resource_path(&config, "Microsoft.Network", "publicIPAddresses", &pip);
                if client.get("GetPublicIP", &pip_path, NETWORK_API_VERSION).await?.is_some() {
                    all_gone &= client.delete("DeletePublicIP", &pip_path, NETWORK_API_VERSION).await?;
                }
            }
            Ok(all_gone)
        })
        .await?
        {
            Some(machine) => machine,
            None => return Ok(false),
        };

        match cleanup_step(data, &machine, FINALIZER_PUBLIC_IP_V6, || async {
            let pip_path =
                Self::resource_path(&config, "Microsoft.Network", "publicIPAddresses", &public_ip_v6_name(&machine));
            if client.get("GetPublicIPv6", &pip_path, NETWORK_API_VERSION).await?.is_none() {
                return Ok(true);
            }
            client.delete("DeletePublicIPv6", &pip_path, NETWORK_API_VERSION).await
        })
        .await?
        {
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn migrate_uid(&self, machine: &Machine, _data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        let config = self.config(&machine.spec).await?;
        let client = ArmClient::new(&config).await?;

        let targets = [
            (
                Self::resource_path(&config, "Microsoft.Compute", "virtualMachines", &vm_name(machine)),
                COMPUTE_API_VERSION,
            ),
            (
                Self::resource_path(&config, "Microsoft.Compute", "disks", &os_disk_name(machine)),
                COMPUTE_API_VERSION,
            ),
            (
                Self::resource_path(&config, "Microsoft.Compute", "disks", &data_disk_name(machine)),
                COMPUTE_API_VERSION,
            ),
            (
                Self::resource_path(&config, "Microsoft.Network", "networkInterfaces", &nic_name(machine)),
                NETWORK_API_VERSION,
            ),
            (
                Self::resource_path(&config, "Microsoft.Network", "publicIPAddresses", &public_ip_name(machine)),
                NETWORK_API_VERSION,
            ),
            (
                Self::resource_path(&config, "Microsoft.Network", "publicIPAddresses", &public_ip_v6_name(machine)),
                NETWORK_API_VERSION,
            ),
        ];

        for (path, api_version) in targets {
            let Some(resource) = client.get("GetResource", &path, api_version).await? else {
                continue;
            };
            let mut tags: BTreeMap<String, String> = resource
                .pointer("/tags")
                .and_then(|t| serde_json::from_value(t.clone()).ok())
                .unwrap_or_default();
            if !uid_tag_matches(&tags, &machine.uid()) {
                continue;
            }
            tags.insert(MACHINE_UID_TAG_KEY.to_string(), new_uid.to_string());
            client.patch_tags("MigrateTags", &path, api_version, &tags).await?;
        }

        Ok(())
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        let raw = Self::raw_config(&machine.spec)?;
        Ok(BTreeMap::from([
            ("size".to_string(), raw.vm_size.value.clone()),
            ("location".to_string(), raw.location.value.clone()),
            ("image".to_string(), raw.image_id.value.clone()),
        ]))
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        let mut by_credentials: HashMap<(String, String, String, String), Vec<&Machine>> = HashMap::new();
        for machine in machines {
            let config = self.config(&machine.spec).await?;
            by_credentials
                .entry((
                    config.tenant_id,
                    config.client_id,
                    config.client_secret,
                    config.subscription_id,
                ))
                .or_default()
                .push(machine);
        }

        for machines in by_credentials.values() {
            let Some(first) = machines.first() else { continue };
            let config = self.config(&first.spec).await?;
            let client = ArmClient::new(&config).await?;

            let path = format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines",
                config.subscription_id, config.resource_group
            );
            let listing = client
                .get("ListVirtualMachines", &path, COMPUTE_API_VERSION)
                .await?
                .unwrap_or(Value::Null);

            let mut count_by_uid: HashMap<String, f64> = HashMap::new();
            for vm in listing.pointer("/value").and_then(|v| v.as_array()).unwrap_or(&vec![]) {
                if let Some(uid) = vm.pointer(&format!("/tags/{MACHINE_UID_TAG_KEY}")).and_then(|u| u.as_str()) {
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

    fn provider() -> AzureProvider {
        AzureProvider::new(ConfigVarResolver::new(Arc::new(InMemorySecretStore::new())))
    }

    fn config_with(os_disk_sku: &str, availability_set: &str, zones: Vec<String>) -> serde_json::Value {
        json!({
            "tenantId": "t",
            "clientId": "c",
            "clientSecret": "s",
            "subscriptionId": "sub",
            "location": "westeurope",
            "resourceGroup": "rg",
            "vmSize": "Standard_D2s_v3",
            "osDiskSku": os_disk_sku,
            "availabilitySet": availability_set,
            "zones": zones,
        })
    }

    #[tokio::test]
    async fn test_ultra_ssd_rejected_with_availability_set() {
        // setup:
        let machine = test_helpers::machine(
            "node-1",
            "abc",
            Kind::Azure,
            config_with("UltraSSD_LRS", "my-avset", vec![]),
        );

        // execute:
        let err = provider().validate(&machine.spec).await.unwrap_err();

        // verify: rejected before any cloud call
        assert!(err.is_terminal());
        assert!(err.to_string().contains("UltraSSD_LRS"));
    }

    #[tokio::test]
    async fn test_zones_and_availability_set_are_exclusive() {
        // setup:
        let machine = test_helpers::machine(
            "node-1",
            "abc",
            Kind::Azure,
            config_with("Standard_LRS", "my-avset", vec!["1".to_string()]),
        );

        // execute & verify:
        assert!(provider().validate(&machine.spec).await.unwrap_err().is_terminal());
    }

    #[test]
    fn test_add_defaults_sets_disk_defaults() {
        // setup:
        let machine = test_helpers::machine("node-1", "abc", Kind::Azure, json!({"location": "westeurope"}));

        // execute:
        let defaulted = provider().add_defaults(machine.spec).unwrap();
        let raw: RawConfig = serde_json::from_value(defaulted.provider_spec.cloud_provider_spec).unwrap();

        // verify:
        assert_eq!(raw.os_disk_size, Some(64));
        assert_eq!(raw.os_disk_sku.value, "Standard_LRS");
    }

    #[test]
    fn test_resource_naming_ladder() {
        // setup:
        let machine = test_helpers::machine("node-1", "abc", Kind::Azure, json!({}));

        // execute & verify:
        assert_eq!(vm_name(&machine), "node-1");
        assert_eq!(nic_name(&machine), "node-1-net");
        assert_eq!(public_ip_name(&machine), "node-1-pip");
        assert_eq!(public_ip_v6_name(&machine), "node-1-pip-v6");
        assert_eq!(os_disk_name(&machine), "node-1-osdisk");
    }

    #[test]
    fn test_power_state_mapping() {
        // setup:
        let running = json!({"statuses": [{"code": "ProvisioningState/succeeded"}, {"code": "PowerState/running"}]});
        let stopping = json!({"statuses": [{"code": "PowerState/deallocating"}]});

        // execute & verify:
        assert_eq!(power_state_of(Some(&running)), InstanceStatus::Running);
        assert_eq!(power_state_of(Some(&stopping)), InstanceStatus::Deleting);
        assert_eq!(power_state_of(None), InstanceStatus::Unknown);
    }
}
