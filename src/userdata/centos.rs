use serde::Deserialize;

use crate::errors::MachineError;
use crate::userdata::containerruntime::{self, PackageFamily};
use crate::userdata::{UserDataProvider, UserDataRequest, base_context, cloudinit, render, scripts};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CentosSpec {
    pub dist_upgrade_on_boot: bool,
}

pub struct CentosProvider {}

impl UserDataProvider for CentosProvider {
    fn user_data(&self, req: &UserDataRequest) -> Result<String, MachineError> {
        let os_spec: CentosSpec = req.parse_os_spec()?;

        let mut context = base_context(req)?;
        context.insert("setup_script", &setup_script(req, os_spec.dist_upgrade_on_boot));
        if let Some(network) = &req.machine_spec.provider_spec.network {
            context.insert("os_extra_files", &scripts::ifcfg_write_files_entry(network)?);
        }

        render(cloudinit::TEMPLATE, &context)
    }
}

fn setup_script(req: &UserDataRequest, dist_upgrade_on_boot: bool) -> String {
    let runtime = req.container_runtime();
    let upgrade = if dist_upgrade_on_boot { "yum upgrade -y\n\n" } else { "" };
    let install_runtime = containerruntime::install_script(runtime.name, PackageFamily::Yum, runtime.version.as_deref());
    let runtime_name = runtime.name;

    format!(
        r#"#!/usr/bin/env bash
set -xeuo pipefail

setenforce 0 || true
sed -i 's/SELINUX=enforcing/SELINUX=permissive/g' /etc/selinux/config

{upgrade}yum install -y \
  ceph-common \
  conntrack-tools \
  curl \
  e2fsprogs \
  ebtables \
  ethtool \
  glusterfs-fuse \
  iptables \
  ipvsadm \
  jq \
  nfs-utils \
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::OperatingSystem;
    use crate::userdata::test_helpers::request;

    #[test]
    fn test_centos_userdata_disables_selinux() {
        // setup:
        let req = request(OperatingSystem::CentOs, "openstack");

        // execute:
        let userdata = CentosProvider {}.user_data(&req).unwrap();

        // verify:
        assert!(userdata.starts_with("#cloud-config"));
        assert!(userdata.contains("setenforce 0"));
        assert!(userdata.contains("SELINUX=permissive"));
        assert!(userdata.contains("yum install -y"));
        assert!(userdata.contains("systemctl enable --now kubelet"));
    }
}
