use serde::Deserialize;

use crate::config::ConfigVarString;
use crate::errors::MachineError;
use crate::userdata::containerruntime::{self, PackageFamily};
use crate::userdata::{UserDataProvider, UserDataRequest, base_context, cloudinit, render, scripts};

/// RHEL nodes may attach themselves to a subscription on first boot; the
/// credentials stay ConfigVars and reach the script through the environment,
/// never through the rendered payload.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RhelSpec {
    pub dist_upgrade_on_boot: bool,
    pub attach_subscription: bool,
    pub rhel_subscription_manager_user: ConfigVarString,
    pub rhel_subscription_manager_password: ConfigVarString,
}

pub struct RhelProvider {}

impl UserDataProvider for RhelProvider {
    fn user_data(&self, req: &UserDataRequest) -> Result<String, MachineError> {
        let os_spec: RhelSpec = req.parse_os_spec()?;

        let mut context = base_context(req)?;
        context.insert("setup_script", &setup_script(req, &os_spec));
        if let Some(network) = &req.machine_spec.provider_spec.network {
            context.insert("os_extra_files", &scripts::ifcfg_write_files_entry(network)?);
        }

        render(cloudinit::TEMPLATE, &context)
    }
}

fn setup_script(req: &UserDataRequest, os_spec: &RhelSpec) -> String {
    let runtime = req.container_runtime();
    let upgrade = if os_spec.dist_upgrade_on_boot { "yum upgrade -y\n\n" } else { "" };
    let subscription = if os_spec.attach_subscription {
        "subscription-manager register --username \"$RHEL_SUBSCRIPTION_USER\" --password \"$RHEL_SUBSCRIPTION_PASSWORD\" --auto-attach || true\n\n"
    } else {
        ""
    };
    let install_runtime = containerruntime::install_script(runtime.name, PackageFamily::Yum, runtime.version.as_deref());
    let runtime_name = runtime.name;

    format!(
        r#"#!/usr/bin/env bash
set -xeuo pipefail

setenforce 0 || true
sed -i 's/SELINUX=enforcing/SELINUX=permissive/g' /etc/selinux/config

{subscription}{upgrade}yum install -y \
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
    fn test_rhel_userdata_basics() {
        // setup:
        let req = request(OperatingSystem::Rhel, "aws");

        // execute:
        let userdata = RhelProvider {}.user_data(&req).unwrap();

        // verify: no hostname on AWS, selinux off, no subscription by default
        assert!(!userdata.contains("hostname:"));
        assert!(userdata.contains("setenforce 0"));
        assert!(!userdata.contains("subscription-manager"));
    }

    #[test]
    fn test_rhel_subscription_attach() {
        // setup:
        let mut req = request(OperatingSystem::Rhel, "aws");
        req.machine_spec.provider_spec.operating_system_spec = serde_json::json!({"attachSubscription": true});

        // execute:
        let userdata = RhelProvider {}.user_data(&req).unwrap();

        // verify:
        assert!(userdata.contains("subscription-manager register"));
    }
}
