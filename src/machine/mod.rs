use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cloud_provider::Kind;
use crate::config::ConfigVarString;

/// Machine: the durable record this engine reconciles into a cloud VM. The
/// outer controller watches it; the engine reads spec/uid/name/finalizers and
/// writes finalizers only.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "machine-engine.io",
    version = "v1alpha1",
    kind = "Machine",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    pub versions: MachineVersions,
    pub provider_spec: ProviderSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersions {
    pub kubelet: String,
}

/// ProviderSpec: typed once the cloud-provider tag is known; the
/// `cloud_provider_spec` blob keeps each driver's own schema opaque to the
/// rest of the engine. All leaf fields inside follow the ConfigVar pattern.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    pub cloud_provider: Kind,
    #[serde(default)]
    pub cloud_provider_spec: serde_json::Value,
    pub operating_system: OperatingSystem,
    #[serde(default)]
    pub operating_system_spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_public_keys: Vec<String>,
    /// Public key of a CA trusted for SSH access; lands in `TrustedUserCAKeys`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_runtime: Option<ContainerRuntimeOpts>,
}

/// Static network assignment for clouds without DHCP-based provisioning.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub cidr: String,
    pub gateway: String,
    #[serde(default)]
    pub dns: DnsConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: String,
}

impl Display for Taint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}:{}", self.key, self.value, self.effect)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRuntimeOpts {
    #[serde(default)]
    pub name: ContainerRuntimeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub registry_mirrors: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insecure_registries: Vec<String>,
    /// Credentials for pulling from private registries, resolved per registry host.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub registry_credentials: BTreeMap<String, RegistryCredentials>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredentials {
    #[serde(default)]
    pub username: ConfigVarString,
    #[serde(default)]
    pub password: ConfigVarString,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntimeKind {
    #[default]
    Containerd,
    Docker,
}

impl Display for ContainerRuntimeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ContainerRuntimeKind::Containerd => "containerd",
            ContainerRuntimeKind::Docker => "docker",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, JsonSchema, strum_macros::EnumIter)]
pub enum OperatingSystem {
    #[serde(rename = "ubuntu")]
    Ubuntu,
    #[serde(rename = "centos")]
    CentOs,
    #[serde(rename = "rhel")]
    Rhel,
    #[serde(rename = "rockylinux")]
    RockyLinux,
    #[serde(rename = "amzn2")]
    AmazonLinux2,
    #[serde(rename = "flatcar")]
    Flatcar,
    #[serde(rename = "windows")]
    Windows,
}

impl Display for OperatingSystem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OperatingSystem::Ubuntu => "ubuntu",
            OperatingSystem::CentOs => "centos",
            OperatingSystem::Rhel => "rhel",
            OperatingSystem::RockyLinux => "rockylinux",
            OperatingSystem::AmazonLinux2 => "amzn2",
            OperatingSystem::Flatcar => "flatcar",
            OperatingSystem::Windows => "windows",
        })
    }
}

impl FromStr for OperatingSystem {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ubuntu" => Ok(OperatingSystem::Ubuntu),
            "centos" => Ok(OperatingSystem::CentOs),
            "rhel" | "redhat" => Ok(OperatingSystem::Rhel),
            "rockylinux" | "rocky" => Ok(OperatingSystem::RockyLinux),
            "amzn2" | "amazon-linux-2" => Ok(OperatingSystem::AmazonLinux2),
            "flatcar" => Ok(OperatingSystem::Flatcar),
            "windows" => Ok(OperatingSystem::Windows),
            _ => Err(()),
        }
    }
}

impl Machine {
    /// The stable identifier every owned cloud resource is tagged with.
    pub fn uid(&self) -> String {
        self.metadata.uid.clone().unwrap_or_default()
    }

    pub fn machine_name(&self) -> String {
        self.name_any()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|finalizers| finalizers.iter().any(|f| f == finalizer))
            .unwrap_or(false)
    }

    pub fn kubelet_version(&self) -> &str {
        &self.spec.versions.kubelet
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use kube::core::ObjectMeta;

    pub fn machine(name: &str, uid: &str, kind: Kind, cloud_provider_spec: serde_json::Value) -> Machine {
        let mut machine = Machine::new(
            name,
            MachineSpec {
                versions: MachineVersions {
                    kubelet: "1.29.4".to_string(),
                },
                provider_spec: ProviderSpec {
                    cloud_provider: kind,
                    cloud_provider_spec,
                    operating_system: OperatingSystem::Ubuntu,
                    operating_system_spec: serde_json::Value::Null,
                    ssh_public_keys: vec![],
                    ca_public_key: None,
                    network: None,
                    container_runtime: None,
                },
                taints: vec![],
                labels: BTreeMap::new(),
            },
        );
        machine.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("kube-system".to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        };
        machine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operating_system_parsing() {
        // setup:
        let test_cases = vec![
            ("ubuntu", OperatingSystem::Ubuntu),
            ("Rocky", OperatingSystem::RockyLinux),
            ("amzn2", OperatingSystem::AmazonLinux2),
            ("redhat", OperatingSystem::Rhel),
        ];

        for (input, expected) in test_cases {
            // execute & verify:
            assert_eq!(OperatingSystem::from_str(input).unwrap(), expected);
        }

        assert!(OperatingSystem::from_str("template-os").is_err());
    }

    #[test]
    fn test_operating_system_serde_names() {
        // execute & verify:
        assert_eq!(
            serde_json::to_string(&OperatingSystem::AmazonLinux2).unwrap(),
            "\"amzn2\""
        );
        assert_eq!(
            serde_json::from_str::<OperatingSystem>("\"rockylinux\"").unwrap(),
            OperatingSystem::RockyLinux
        );
    }

    #[test]
    fn test_machine_uid_and_finalizers() {
        // setup:
        let mut machine = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({}));
        machine.metadata.finalizers = Some(vec!["machine-engine/instance".to_string()]);

        // execute & verify:
        assert_eq!(machine.uid(), "abc");
        assert_eq!(machine.machine_name(), "node-1");
        assert!(machine.has_finalizer("machine-engine/instance"));
        assert!(!machine.has_finalizer("machine-engine/disks"));
    }
}
