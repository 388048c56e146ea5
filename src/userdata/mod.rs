use std::collections::BTreeMap;
use std::net::IpAddr;

use kube::config::Kubeconfig;
use serde::Deserialize;
use tera::Context;

use crate::errors::{CommandError, MachineError};
use crate::kubeconfig;
use crate::machine::{ContainerRuntimeOpts, MachineSpec, OperatingSystem};
use crate::network::IpFamily;

pub mod amzn2;
pub mod bootstrap;
pub mod centos;
mod cloudinit;
pub mod containerruntime;
pub mod flatcar;
pub mod kubelet;
pub mod rhel;
pub mod rockylinux;
pub mod scripts;
pub mod ubuntu;
pub mod windows;

/// UserDataRequest: the normalized, deterministic input to every OS renderer.
/// Two cloud-provider fields exist because in-tree and external cloud
/// integration are selected differently: `cloud_provider_name` is the IaaS
/// the node runs on, `kubelet_cloud_provider_name` is what the kubelet gets
/// as `--cloud-provider` when the external CCM is off.
#[derive(Clone, Debug)]
pub struct UserDataRequest {
    pub machine_name: String,
    pub machine_spec: MachineSpec,
    pub kubeconfig: Kubeconfig,
    pub cloud_provider_name: String,
    pub kubelet_cloud_provider_name: Option<String>,
    pub cloud_config: String,
    pub cluster_dns_ips: Vec<IpAddr>,
    pub external_cloud_provider: bool,
    pub http_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub pause_image: Option<String>,
    pub kubelet_feature_gates: BTreeMap<String, bool>,
    /// Knob overrides: maxPods, kubeReserved, systemReserved, evictionHard,
    /// containerLogMaxSize, containerLogMaxFiles.
    pub kubelet_configs: BTreeMap<String, String>,
    pub node_port_range: Option<String>,
    /// Registry credentials already resolved out of their ConfigVars, so the
    /// renderer itself never performs I/O.
    pub registry_credentials: BTreeMap<String, containerruntime::RegistryAuth>,
}

impl UserDataRequest {
    pub fn operating_system(&self) -> OperatingSystem {
        self.machine_spec.provider_spec.operating_system
    }

    pub fn container_runtime(&self) -> ContainerRuntimeOpts {
        self.machine_spec
            .provider_spec
            .container_runtime
            .clone()
            .unwrap_or_default()
    }

    pub fn kubelet_version(&self) -> &str {
        &self.machine_spec.versions.kubelet
    }

    /// Address family of the node, derived from the cluster DNS addresses.
    pub fn ip_family(&self) -> IpFamily {
        let has_v4 = self.cluster_dns_ips.iter().any(|ip| ip.is_ipv4());
        let has_v6 = self.cluster_dns_ips.iter().any(|ip| ip.is_ipv6());
        match (has_v4, has_v6) {
            (true, true) => IpFamily::DualStack,
            (false, true) => IpFamily::IPv6,
            _ => IpFamily::IPv4,
        }
    }

    pub fn parse_os_spec<T>(&self) -> Result<T, MachineError>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match &self.machine_spec.provider_spec.operating_system_spec {
            serde_json::Value::Null => Ok(T::default()),
            value => serde_json::from_value(value.clone()).map_err(|e| {
                MachineError::new_invalid_configuration(format!("cannot parse operating system spec: {e}"))
            }),
        }
    }
}

/// UserDataProvider: one per operating system. Given the same request, the
/// rendered payload is byte-identical; no wall clock, no randomness.
pub trait UserDataProvider: Send + Sync {
    fn user_data(&self, req: &UserDataRequest) -> Result<String, MachineError>;
}

pub fn provider_for_os(os: OperatingSystem) -> Result<&'static dyn UserDataProvider, MachineError> {
    static UBUNTU: ubuntu::UbuntuProvider = ubuntu::UbuntuProvider {};
    static CENTOS: centos::CentosProvider = centos::CentosProvider {};
    static RHEL: rhel::RhelProvider = rhel::RhelProvider {};
    static ROCKYLINUX: rockylinux::RockyLinuxProvider = rockylinux::RockyLinuxProvider {};
    static AMZN2: amzn2::AmazonLinux2Provider = amzn2::AmazonLinux2Provider {};
    static FLATCAR: flatcar::FlatcarProvider = flatcar::FlatcarProvider {};
    static WINDOWS: windows::WindowsProvider = windows::WindowsProvider {};

    Ok(match os {
        OperatingSystem::Ubuntu => &UBUNTU,
        OperatingSystem::CentOs => &CENTOS,
        OperatingSystem::Rhel => &RHEL,
        OperatingSystem::RockyLinux => &ROCKYLINUX,
        OperatingSystem::AmazonLinux2 => &AMZN2,
        OperatingSystem::Flatcar => &FLATCAR,
        OperatingSystem::Windows => &WINDOWS,
    })
}

/// Builds the context every Linux template starts from. OS renderers add
/// their own package/runtime specifics on top.
pub(crate) fn base_context(req: &UserDataRequest) -> Result<Context, MachineError> {
    let mut context = Context::new();

    // kube-proxy relies on the cloud's private DNS name on AWS, so the
    // hostname is left to the cloud there
    let set_hostname = req.cloud_provider_name != "aws";
    context.insert("set_hostname", &set_hostname);
    context.insert("machine_name", &req.machine_name);

    context.insert("ssh_public_keys", &req.machine_spec.provider_spec.ssh_public_keys);
    context.insert("ssh_ca_public_key", &req.machine_spec.provider_spec.ca_public_key);
    context.insert(
        "ssh_config_addendum",
        &scripts::ssh_config_addendum(req.machine_spec.provider_spec.ca_public_key.as_deref()),
    );

    context.insert("kubelet_version", req.kubelet_version());
    context.insert("kubelet_systemd_unit", &kubelet::kubelet_systemd_unit(req)?);
    context.insert("kubelet_configuration", &kubelet::kubelet_configuration(req)?);
    context.insert("kubelet_healthcheck_systemd_unit", &scripts::kubelet_health_check_systemd_unit());
    context.insert(
        "container_runtime_healthcheck_systemd_unit",
        &scripts::container_runtime_health_check_systemd_unit(req.container_runtime().name),
    );
    context.insert("health_monitor_script", scripts::HEALTH_MONITOR_SCRIPT);

    context.insert("kernel_modules_script", scripts::KERNEL_MODULES_SCRIPT);
    context.insert("kernel_settings", &scripts::kernel_settings(req.ip_family()));
    context.insert("journald_config", scripts::JOURNALD_CONFIG);
    context.insert("disable_swap_script", scripts::DISABLE_SWAP_SCRIPT);
    context.insert("setup_service", scripts::SETUP_SERVICE);
    context.insert("os_extra_files", "");
    context.insert(
        "safe_download_binaries_script",
        &scripts::safe_download_binaries_script(req.kubelet_version())?,
    );
    context.insert("setup_net_env_script", &scripts::setup_net_env_script(req.ip_family()));

    context.insert(
        "proxy_environment",
        &scripts::proxy_environment(req.http_proxy.as_deref(), req.no_proxy.as_deref()),
    );
    context.insert("http_proxy", &req.http_proxy);
    context.insert("no_proxy", &req.no_proxy);

    context.insert("bootstrap_kubeconfig", &kubeconfig::stringify(&req.kubeconfig)?);
    context.insert("cluster_ca_cert", &kubeconfig::cluster_ca_pem(&req.kubeconfig)?);
    context.insert("cloud_config", &req.cloud_config);

    let runtime = req.container_runtime();
    context.insert("container_runtime_name", &runtime.name.to_string());
    context.insert("container_runtime_config", &containerruntime::runtime_config(req)?);
    context.insert("container_runtime_config_path", containerruntime::config_path(runtime.name));
    context.insert("container_runtime_auth_config", &containerruntime::auth_config(req)?);
    context.insert("container_runtime_auth_config_path", containerruntime::auth_config_path(runtime.name));
    context.insert("crictl_config", containerruntime::crictl_config(runtime.name));

    Ok(context)
}

/// Renders one of the OS templates with the shared engine.
pub(crate) fn render(template: &str, context: &Context) -> Result<String, MachineError> {
    let mut tera = crate::tera_utils::new_tera();
    tera.add_raw_template("userdata", template)
        .map_err(CommandError::from)?;
    tera.render("userdata", context)
        .map_err(CommandError::from)
        .map_err(MachineError::from)
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::cloud_provider::Kind;
    use crate::kubeconfig::test_helpers::bootstrap_kubeconfig;
    use crate::machine::{MachineVersions, ProviderSpec};

    pub const TEST_CA: &str = "-----BEGIN CERTIFICATE-----\nMIICyDCCAbCgAwIBAgIBADANBg\n-----END CERTIFICATE-----\n";

    pub fn request(os: OperatingSystem, cloud_provider_name: &str) -> UserDataRequest {
        UserDataRequest {
            machine_name: "node-1".to_string(),
            machine_spec: MachineSpec {
                versions: MachineVersions {
                    kubelet: "1.29.4".to_string(),
                },
                provider_spec: ProviderSpec {
                    cloud_provider: Kind::Fake,
                    cloud_provider_spec: serde_json::Value::Null,
                    operating_system: os,
                    operating_system_spec: serde_json::Value::Null,
                    ssh_public_keys: vec!["ssh-ed25519 AAAAC3Nza test-key".to_string()],
                    ca_public_key: None,
                    network: None,
                    container_runtime: None,
                },
                taints: vec![],
                labels: BTreeMap::new(),
            },
            kubeconfig: bootstrap_kubeconfig("https://api.cluster.example:6443", TEST_CA, "bootstrap-token"),
            cloud_provider_name: cloud_provider_name.to_string(),
            kubelet_cloud_provider_name: None,
            cloud_config: String::new(),
            cluster_dns_ips: vec!["10.96.0.10".parse().unwrap()],
            external_cloud_provider: false,
            http_proxy: None,
            no_proxy: None,
            pause_image: None,
            kubelet_feature_gates: BTreeMap::new(),
            kubelet_configs: BTreeMap::new(),
            node_port_range: None,
            registry_credentials: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;
    use test_helpers::request;

    #[test]
    fn test_renderers_are_deterministic() {
        for os in OperatingSystem::iter() {
            // setup:
            let req = request(os, "fake");
            let provider = provider_for_os(os).unwrap();

            // execute:
            let first = provider.user_data(&req).unwrap();
            let second = provider.user_data(&req).unwrap();

            // verify: byte-identical output for the same request
            assert_eq!(first, second, "renderer for {os} is not deterministic");
        }
    }

    #[test]
    fn test_ip_family_from_cluster_dns() {
        // setup:
        let mut req = request(OperatingSystem::Ubuntu, "fake");

        // execute & verify:
        assert_eq!(req.ip_family(), IpFamily::IPv4);

        req.cluster_dns_ips = vec!["fd00::10".parse().unwrap()];
        assert_eq!(req.ip_family(), IpFamily::IPv6);

        req.cluster_dns_ips = vec!["10.96.0.10".parse().unwrap(), "fd00::10".parse().unwrap()];
        assert_eq!(req.ip_family(), IpFamily::DualStack);
    }
}
