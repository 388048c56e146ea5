use serde::Deserialize;

use crate::errors::MachineError;
use crate::userdata::containerruntime::{self, PackageFamily};
use crate::userdata::{UserDataProvider, UserDataRequest, base_context, cloudinit, render};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UbuntuSpec {
    pub dist_upgrade_on_boot: bool,
}

pub struct UbuntuProvider {}

impl UserDataProvider for UbuntuProvider {
    fn user_data(&self, req: &UserDataRequest) -> Result<String, MachineError> {
        let os_spec: UbuntuSpec = req.parse_os_spec()?;
        let runtime = req.container_runtime();

        let mut context = base_context(req)?;
        context.insert("setup_script", &setup_script(req, &os_spec));
        if let Some(network) = &req.machine_spec.provider_spec.network {
            crate::network::parse_cidr(&network.cidr)
                .map_err(|e| MachineError::new_invalid_configuration(e.to_string()))?;
            context.insert("os_extra_files", &netplan_extra_file(network));
        }

        render(cloudinit::TEMPLATE, &context).map(|userdata| {
            debug!(
                "rendered ubuntu user-data for kubelet {} with {} runtime",
                req.kubelet_version(),
                runtime.name
            );
            userdata
        })
    }
}

fn setup_script(req: &UserDataRequest, os_spec: &UbuntuSpec) -> String {
    let runtime = req.container_runtime();
    let dist_upgrade = if os_spec.dist_upgrade_on_boot {
        "apt-get update\nDEBIAN_FRONTEND=noninteractive apt-get dist-upgrade -y\n\n"
    } else {
        ""
    };
    let install_runtime = containerruntime::install_script(runtime.name, PackageFamily::Apt, runtime.version.as_deref());
    let apply_netplan = if req.machine_spec.provider_spec.network.is_some() {
        "netplan apply\n\n"
    } else {
        ""
    };
    let runtime_name = runtime.name;

    format!(
        r#"#!/usr/bin/env bash
set -xeuo pipefail
export DEBIAN_FRONTEND=noninteractive

{dist_upgrade}{apply_netplan}apt-get update
apt-get install -y --no-install-recommends \
  ca-certificates \
  ceph-common \
  cifs-utils \
  conntrack \
  curl \
  e2fsprogs \
  ebtables \
  ethtool \
  glusterfs-client \
  iptables \
  ipvsadm \
  jq \
  kmod \
  nfs-common \
  openssh-client \
  socat \
  util-linux

{install_runtime}
/bin/bash /opt/disable-swap.sh
/bin/bash /opt/load-kernel-modules.sh
sysctl --system

/opt/bin/download.sh

systemctl daemon-reload
systemctl enable --now kubelet
systemctl enable --now --no-block kubelet-healthcheck.service
systemctl enable --now --no-block {runtime_name}-healthcheck.service
"#
    )
}

// rendered separately so the skeleton stays OS-agnostic
fn netplan_extra_file(network: &crate::machine::NetworkConfig) -> String {
    let dns_servers = network.dns.servers.join(",");
    format!(
        r#"
- path: /etc/netplan/99-machine-static.yaml
  content: |
    network:
      version: 2
      ethernets:
        default:
          match:
            name: "e*"
          addresses: ["{cidr}"]
          routes:
          - to: default
            via: {gateway}
          nameservers:
            addresses: [{dns_servers}]"#,
        cidr = network.cidr,
        gateway = network.gateway,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{NetworkConfig, OperatingSystem};
    use crate::userdata::test_helpers::request;

    #[test]
    fn test_ubuntu_userdata_contains_node_plumbing() {
        // setup:
        let req = request(OperatingSystem::Ubuntu, "hetzner");

        // execute:
        let userdata = UbuntuProvider {}.user_data(&req).unwrap();

        // verify:
        assert!(userdata.starts_with("#cloud-config"));
        assert!(userdata.contains("ssh-ed25519 AAAAC3Nza test-key"));
        assert!(userdata.contains("/etc/kubernetes/bootstrap-kubelet.conf"));
        assert!(userdata.contains("/etc/kubernetes/pki/ca.crt"));
        assert!(userdata.contains("apt-get install -y --no-install-recommends"));
        assert!(userdata.contains("systemctl enable --now kubelet"));
        assert!(userdata.contains("modprobe br_netfilter"));
        assert!(userdata.contains("SystemMaxUse=5G"));
        assert!(userdata.contains("containerd-healthcheck.service"));
    }

    #[test]
    fn test_ubuntu_dist_upgrade_knob() {
        // setup:
        let mut req = request(OperatingSystem::Ubuntu, "hetzner");
        req.machine_spec.provider_spec.operating_system_spec = serde_json::json!({"distUpgradeOnBoot": true});

        // execute:
        let userdata = UbuntuProvider {}.user_data(&req).unwrap();

        // verify:
        assert!(userdata.contains("apt-get dist-upgrade -y"));
    }

    #[test]
    fn test_ubuntu_static_network_renders_netplan() {
        // setup:
        let mut req = request(OperatingSystem::Ubuntu, "vsphere");
        req.machine_spec.provider_spec.network = Some(NetworkConfig {
            cidr: "10.10.10.5/24".to_string(),
            gateway: "10.10.10.1".to_string(),
            dns: crate::machine::DnsConfig {
                servers: vec!["10.10.10.2".to_string()],
            },
        });

        // execute:
        let userdata = UbuntuProvider {}.user_data(&req).unwrap();

        // verify:
        assert!(userdata.contains("/etc/netplan/99-machine-static.yaml"));
        assert!(userdata.contains("addresses: [\"10.10.10.5/24\"]"));
        assert!(userdata.contains("via: 10.10.10.1"));
        assert!(userdata.contains("netplan apply"));
    }
}
