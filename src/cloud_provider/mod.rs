use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::ConfigVarResolver;
use crate::errors::{CommandError, MachineError};
use crate::machine::{Machine, MachineSpec};

pub mod alibaba;
pub mod aws;
pub mod azure;
pub mod cache;
pub mod digitalocean;
pub mod equinixmetal;
pub mod fake;
pub mod finalizer;
pub mod gcp;
pub mod hetzner;
pub mod kubevirt;
pub mod linode;
pub mod nutanix;
pub mod openstack;
pub mod registry;
pub mod tagging;
pub mod vsphere;

/// Cloud-provider tag as written in the Machine record.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Alibaba,
    Aws,
    Azure,
    Digitalocean,
    Equinixmetal,
    Fake,
    Gcp,
    Hetzner,
    Kubevirt,
    Linode,
    Nutanix,
    Openstack,
    /// Legacy tag for Equinix Metal, kept for existing Machine records.
    Packet,
    Vsphere,
}

impl FromStr for Kind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "alibaba" => Ok(Kind::Alibaba),
            "aws" | "amazon" => Ok(Kind::Aws),
            "az" | "azure" => Ok(Kind::Azure),
            "do" | "digitalocean" => Ok(Kind::Digitalocean),
            "equinixmetal" | "equinix-metal" => Ok(Kind::Equinixmetal),
            "fake" => Ok(Kind::Fake),
            "gcp" | "google" => Ok(Kind::Gcp),
            "hetzner" => Ok(Kind::Hetzner),
            "kubevirt" => Ok(Kind::Kubevirt),
            "linode" => Ok(Kind::Linode),
            "nutanix" => Ok(Kind::Nutanix),
            "openstack" => Ok(Kind::Openstack),
            "packet" => Ok(Kind::Packet),
            "vsphere" => Ok(Kind::Vsphere),
            _ => Err(()),
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Kind::Alibaba => "alibaba",
            Kind::Aws => "aws",
            Kind::Azure => "azure",
            Kind::Digitalocean => "digitalocean",
            Kind::Equinixmetal => "equinixmetal",
            Kind::Fake => "fake",
            Kind::Gcp => "gcp",
            Kind::Hetzner => "hetzner",
            Kind::Kubevirt => "kubevirt",
            Kind::Linode => "linode",
            Kind::Nutanix => "nutanix",
            Kind::Openstack => "openstack",
            Kind::Packet => "packet",
            Kind::Vsphere => "vsphere",
        })
    }
}

/// Address kinds reported on an instance, matching what the kubelet will
/// publish on the Node object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressType {
    InternalIp,
    ExternalIp,
    InternalDns,
    ExternalDns,
    HostName,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceStatus {
    Creating,
    Running,
    Deleting,
    Deleted,
    /// Safe fallback for provider codes we do not map; never triggers a
    /// destructive action.
    Unknown,
}

/// Instance: uniform view of one provisioned VM across every cloud.
#[derive(Clone, Debug)]
pub struct Instance {
    pub id: String,
    pub name: String,
    /// Provider URI the kubelet reports in `Node.spec.providerID`,
    /// e.g. `aws:///eu-west-1a/i-0123`.
    pub provider_id: Option<String>,
    pub addresses: HashMap<String, AddressType>,
    pub status: InstanceStatus,
}

impl Instance {
    pub fn is_terminated(&self) -> bool {
        matches!(self.status, InstanceStatus::Deleted)
    }
}

/// MachineUpdater: persistence seam for Machine mutations (finalizer edits,
/// provider-spec defaulting). The kube implementation retries optimistic
/// conflicts; tests plug an in-memory one.
#[async_trait]
pub trait MachineUpdater: Send + Sync {
    async fn update(
        &self,
        machine: &Machine,
        mutator: &(dyn Fn(&mut Machine) + Send + Sync),
    ) -> Result<Machine, MachineError>;
}

pub struct KubeMachineUpdater {
    client: kube::Client,
}

impl KubeMachineUpdater {
    pub fn new(client: kube::Client) -> Self {
        KubeMachineUpdater { client }
    }
}

const UPDATE_CONFLICT_RETRIES: usize = 5;

#[async_trait]
impl MachineUpdater for KubeMachineUpdater {
    async fn update(
        &self,
        machine: &Machine,
        mutator: &(dyn Fn(&mut Machine) + Send + Sync),
    ) -> Result<Machine, MachineError> {
        let namespace = machine
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| MachineError::new_invalid_configuration("machine has no namespace".to_string()))?;
        let name = machine.machine_name();
        let api: Api<Machine> = Api::namespaced(self.client.clone(), &namespace);

        let mut last_error: Option<kube::Error> = None;
        for _attempt in 0..UPDATE_CONFLICT_RETRIES {
            let mut latest = api.get(&name).await.map_err(CommandError::from)?;
            mutator(&mut latest);

            match api.replace(&name, &PostParams::default(), &latest).await {
                Ok(updated) => return Ok(updated),
                // optimistic concurrency: refetch and retry on conflict
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    last_error = Some(kube::Error::Api(ae));
                }
                Err(e) => return Err(CommandError::from(e).into()),
            }
        }

        Err(MachineError::new_retryable(
            format!("machine `{name}` update kept conflicting"),
            last_error.map(|e| e.to_string()),
        ))
    }
}

/// In-memory updater for unit tests and the fake provider.
#[derive(Default)]
pub struct InMemoryMachineUpdater {}

#[async_trait]
impl MachineUpdater for InMemoryMachineUpdater {
    async fn update(
        &self,
        machine: &Machine,
        mutator: &(dyn Fn(&mut Machine) + Send + Sync),
    ) -> Result<Machine, MachineError> {
        let mut updated = machine.clone();
        mutator(&mut updated);
        Ok(updated)
    }
}

/// ProviderData: everything a driver may touch besides its own cloud.
#[derive(Clone)]
pub struct ProviderData {
    pub updater: Arc<dyn MachineUpdater>,
    pub resolver: ConfigVarResolver,
}

impl ProviderData {
    pub fn new(updater: Arc<dyn MachineUpdater>, resolver: ConfigVarResolver) -> Self {
        ProviderData { updater, resolver }
    }
}

/// Provider: the polymorphic driver boundary. One implementation per cloud;
/// all obey the same contract and failure taxonomy.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> Kind;

    /// Fills provider-specific defaults into the spec. Pure and idempotent;
    /// called before the spec is persisted.
    fn add_defaults(&self, spec: MachineSpec) -> Result<MachineSpec, MachineError>;

    /// Verifies every field and confirms declared placement exists on the
    /// cloud. Side-effect free; results are memoized by the registry.
    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError>;

    /// Returns `(cloud_config, cloud_provider_name)` for in-tree cloud
    /// integration; both empty when the cloud has none.
    async fn get_cloud_config(&self, spec: &MachineSpec) -> Result<(String, String), MachineError>;

    /// Provisions the VM and polls until it is visible through `get`.
    async fn create(&self, machine: &Machine, data: &ProviderData, userdata: &str)
    -> Result<Instance, MachineError>;

    /// Discovers the instance by `Machine-UID` tag only; the machine name is
    /// never used for correlation. Terminated entries are skipped.
    async fn get(&self, machine: &Machine, data: &ProviderData) -> Result<Instance, MachineError>;

    /// Tears down everything owned by the machine, driven by the finalizer
    /// ladder. `Ok(true)` only once all owned resources are gone; `Ok(false)`
    /// means "in progress, come back later".
    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError>;

    /// Rewrites the `Machine-UID` tag on every owned resource. Either all
    /// rewrites land or a retryable error makes the caller reissue.
    async fn migrate_uid(&self, machine: &Machine, data: &ProviderData, new_uid: &str) -> Result<(), MachineError>;

    /// Small label set for observability (size, region, zone, image).
    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError>;

    /// Populates the `instances_for_machine` gauge, de-duplicating credential
    /// tuples so one list call serves every machine sharing credentials.
    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_accepts_aliases() {
        // execute & verify:
        assert_eq!(Kind::from_str("amazon").unwrap(), Kind::Aws);
        assert_eq!(Kind::from_str("az").unwrap(), Kind::Azure);
        assert_eq!(Kind::from_str("equinix-metal").unwrap(), Kind::Equinixmetal);
        assert_eq!(Kind::from_str("packet").unwrap(), Kind::Packet);
        assert!(Kind::from_str("cloudfoundry").is_err());
    }

    #[test]
    fn test_kind_display_roundtrip() {
        // setup:
        let kinds = vec![
            Kind::Alibaba,
            Kind::Aws,
            Kind::Azure,
            Kind::Digitalocean,
            Kind::Equinixmetal,
            Kind::Fake,
            Kind::Gcp,
            Kind::Hetzner,
            Kind::Kubevirt,
            Kind::Linode,
            Kind::Nutanix,
            Kind::Openstack,
            Kind::Packet,
            Kind::Vsphere,
        ];

        for kind in kinds {
            // execute & verify:
            assert_eq!(Kind::from_str(&kind.to_string()).unwrap(), kind);
        }
    }

    #[test]
    fn test_instance_terminated() {
        // setup:
        let mut instance = Instance {
            id: "i-0123".to_string(),
            name: "node-1".to_string(),
            provider_id: None,
            addresses: HashMap::new(),
            status: InstanceStatus::Running,
        };

        // execute & verify:
        assert!(!instance.is_terminated());
        instance.status = InstanceStatus::Deleted;
        assert!(instance.is_terminated());
    }
}
