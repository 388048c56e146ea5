use serde::Deserialize;

use crate::errors::MachineError;
use crate::userdata::containerruntime::{self, PackageFamily};
use crate::userdata::{UserDataProvider, UserDataRequest, base_context, cloudinit, render};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AmazonLinux2Spec {
    pub dist_upgrade_on_boot: bool,
}

pub struct AmazonLinux2Provider {}

impl UserDataProvider for AmazonLinux2Provider {
    fn user_data(&self, req: &UserDataRequest) -> Result<String, MachineError> {
        let os_spec: AmazonLinux2Spec = req.parse_os_spec()?;

        let mut context = base_context(req)?;
        context.insert("setup_script", &setup_script(req, os_spec.dist_upgrade_on_boot));

        render(cloudinit::TEMPLATE, &context)
    }
}

fn setup_script(req: &UserDataRequest, dist_upgrade_on_boot: bool) -> String {
    let runtime = req.container_runtime();
    let upgrade = if dist_upgrade_on_boot { "yum upgrade -y\n\n" } else { "" };
    let install_runtime =
        containerruntime::install_script(runtime.name, PackageFamily::AmazonLinux, runtime.version.as_deref());
    let runtime_name = runtime.name;

    format!(
        r#"#!/usr/bin/env bash
set -xeuo pipefail

{upgrade}yum install -y \
  conntrack-tools \
  curl \
  e2fsprogs \
  ebtables \
  ethtool \
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
    fn test_amzn2_userdata_leaves_hostname_to_the_cloud() {
        // setup: Amazon Linux 2 practically always runs on AWS
        let req = request(OperatingSystem::AmazonLinux2, "aws");

        // execute:
        let userdata = AmazonLinux2Provider {}.user_data(&req).unwrap();

        // verify:
        assert!(!userdata.contains("hostname:"));
        assert!(userdata.contains("yum install -y"));
        assert!(userdata.contains("systemctl enable --now kubelet"));
    }
}
