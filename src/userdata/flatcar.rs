use serde::{Deserialize, Serialize};

use crate::errors::{CommandError, MachineError};
use crate::kubeconfig;
use crate::userdata::{UserDataProvider, UserDataRequest, base_context, cloudinit, kubelet, render, scripts};

/// How the image consumes its provisioning payload. Ignition is the Flatcar
/// default; AWS forces cloud-init because Ignition payloads blow through the
/// 16 KiB user-data cap.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
pub enum ProvisioningUtility {
    #[serde(rename = "cloud-init")]
    CloudInit,
    #[serde(rename = "ignition")]
    Ignition,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlatcarSpec {
    pub provisioning_utility: Option<ProvisioningUtility>,
    pub disable_auto_update: bool,
}

impl FlatcarSpec {
    fn effective_utility(&self, cloud_provider_name: &str) -> ProvisioningUtility {
        if cloud_provider_name == "aws" {
            return ProvisioningUtility::CloudInit;
        }
        self.provisioning_utility.unwrap_or(ProvisioningUtility::Ignition)
    }
}

pub struct FlatcarProvider {}

impl UserDataProvider for FlatcarProvider {
    fn user_data(&self, req: &UserDataRequest) -> Result<String, MachineError> {
        let os_spec: FlatcarSpec = req.parse_os_spec()?;

        match os_spec.effective_utility(&req.cloud_provider_name) {
            ProvisioningUtility::CloudInit => {
                let mut context = base_context(req)?;
                context.insert("setup_script", &setup_script(req, &os_spec));
                render(cloudinit::TEMPLATE, &context)
            }
            ProvisioningUtility::Ignition => ignition_config(req, &os_spec),
        }
    }
}

fn setup_script(req: &UserDataRequest, os_spec: &FlatcarSpec) -> String {
    // the runtime ships with the image, only its unit needs starting
    let runtime_name = req.container_runtime().name;
    let mask_updates = if os_spec.disable_auto_update {
        "systemctl mask update-engine.service locksmithd.service\nsystemctl stop update-engine.service locksmithd.service || true\n\n"
    } else {
        ""
    };

    format!(
        r#"#!/usr/bin/env bash
set -xeuo pipefail

{mask_updates}systemctl enable --now {runtime_name}
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

#[derive(Serialize)]
struct IgnitionDocument {
    ignition: IgnitionMeta,
    storage: IgnitionStorage,
    systemd: IgnitionSystemd,
    passwd: IgnitionPasswd,
}

#[derive(Serialize)]
struct IgnitionMeta {
    version: String,
}

#[derive(Serialize)]
struct IgnitionStorage {
    files: Vec<IgnitionFile>,
}

#[derive(Serialize)]
struct IgnitionFile {
    path: String,
    mode: u32,
    contents: IgnitionContents,
}

#[derive(Serialize)]
struct IgnitionContents {
    source: String,
}

#[derive(Serialize)]
struct IgnitionSystemd {
    units: Vec<IgnitionUnit>,
}

#[derive(Serialize)]
struct IgnitionUnit {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mask: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    contents: Option<String>,
}

#[derive(Serialize)]
struct IgnitionPasswd {
    users: Vec<IgnitionUser>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IgnitionUser {
    name: String,
    ssh_authorized_keys: Vec<String>,
}

fn data_url(content: &str) -> String {
    format!("data:,{}", urlencoding::encode(content))
}

fn file(path: &str, mode: u32, content: &str) -> IgnitionFile {
    IgnitionFile {
        path: path.to_string(),
        mode,
        contents: IgnitionContents {
            source: data_url(content),
        },
    }
}

fn ignition_config(req: &UserDataRequest, os_spec: &FlatcarSpec) -> Result<String, MachineError> {
    let runtime_name = req.container_runtime().name;

    let mut files = vec![
        file("/etc/systemd/journald.conf.d/max_disk_use.conf", 0o644, scripts::JOURNALD_CONFIG),
        file("/opt/load-kernel-modules.sh", 0o755, scripts::KERNEL_MODULES_SCRIPT),
        file("/etc/sysctl.d/k8s.conf", 0o644, &scripts::kernel_settings(req.ip_family())),
        file("/opt/disable-swap.sh", 0o755, scripts::DISABLE_SWAP_SCRIPT),
        file("/opt/bin/setup_net_env.sh", 0o755, &scripts::setup_net_env_script(req.ip_family())),
        file("/opt/bin/download.sh", 0o755, &scripts::safe_download_binaries_script(req.kubelet_version())?),
        file("/opt/bin/health-monitor.sh", 0o755, scripts::HEALTH_MONITOR_SCRIPT),
        file(
            kubelet::BOOTSTRAP_KUBECONFIG_PATH,
            0o600,
            &kubeconfig::stringify(&req.kubeconfig)?,
        ),
        file("/etc/kubernetes/pki/ca.crt", 0o644, &kubeconfig::cluster_ca_pem(&req.kubeconfig)?),
        file(kubelet::KUBELET_CONFIG_PATH, 0o644, &kubelet::kubelet_configuration(req)?),
        file(
            super::containerruntime::config_path(runtime_name),
            0o644,
            &super::containerruntime::runtime_config(req)?,
        ),
        file("/etc/crictl.yaml", 0o644, super::containerruntime::crictl_config(runtime_name)),
        file("/opt/bin/setup.sh", 0o755, &setup_script(req, os_spec)),
    ];

    if !req.cloud_config.is_empty() {
        files.push(file(kubelet::CLOUD_CONFIG_PATH, 0o600, &req.cloud_config));
    }

    let proxy_environment = scripts::proxy_environment(req.http_proxy.as_deref(), req.no_proxy.as_deref());
    if !proxy_environment.is_empty() {
        files.push(file("/etc/environment", 0o644, &proxy_environment));
    }

    if let Some(ca_public_key) = &req.machine_spec.provider_spec.ca_public_key {
        files.push(file("/etc/ssh/trusted_user_ca_keys.pub", 0o644, ca_public_key));
        files.push(file(
            "/etc/ssh/sshd_config.d/trusted-ca.conf",
            0o644,
            &scripts::ssh_config_addendum(Some(ca_public_key)),
        ));
    }

    let mut units = vec![
        IgnitionUnit {
            name: "kubelet.service".to_string(),
            enabled: None,
            mask: None,
            contents: Some(kubelet::kubelet_systemd_unit(req)?),
        },
        IgnitionUnit {
            name: "kubelet-healthcheck.service".to_string(),
            enabled: None,
            mask: None,
            contents: Some(scripts::kubelet_health_check_systemd_unit()),
        },
        IgnitionUnit {
            name: format!("{runtime_name}-healthcheck.service"),
            enabled: None,
            mask: None,
            contents: Some(scripts::container_runtime_health_check_systemd_unit(runtime_name)),
        },
        IgnitionUnit {
            name: "setup.service".to_string(),
            enabled: Some(true),
            mask: None,
            contents: Some(scripts::SETUP_SERVICE.to_string()),
        },
    ];

    if os_spec.disable_auto_update {
        units.push(IgnitionUnit {
            name: "update-engine.service".to_string(),
            enabled: None,
            mask: Some(true),
            contents: None,
        });
        units.push(IgnitionUnit {
            name: "locksmithd.service".to_string(),
            enabled: None,
            mask: Some(true),
            contents: None,
        });
    }

    let document = IgnitionDocument {
        ignition: IgnitionMeta {
            version: "3.3.0".to_string(),
        },
        storage: IgnitionStorage { files },
        systemd: IgnitionSystemd { units },
        passwd: IgnitionPasswd {
            users: vec![IgnitionUser {
                name: "core".to_string(),
                ssh_authorized_keys: req.machine_spec.provider_spec.ssh_public_keys.clone(),
            }],
        },
    };

    serde_json::to_string(&document)
        .map_err(CommandError::from)
        .map_err(MachineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::OperatingSystem;
    use crate::userdata::test_helpers::request;

    #[test]
    fn test_flatcar_defaults_to_ignition() {
        // setup:
        let req = request(OperatingSystem::Flatcar, "hetzner");

        // execute:
        let userdata = FlatcarProvider {}.user_data(&req).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&userdata).unwrap();

        // verify:
        assert_eq!(parsed["ignition"]["version"], "3.3.0");
        assert_eq!(parsed["passwd"]["users"][0]["name"], "core");
        let files = parsed["storage"]["files"].as_array().unwrap();
        assert!(
            files
                .iter()
                .any(|f| f["path"] == "/etc/kubernetes/bootstrap-kubelet.conf")
        );
    }

    #[test]
    fn test_flatcar_on_aws_forces_cloud_init() {
        // setup:
        let req = request(OperatingSystem::Flatcar, "aws");

        // execute:
        let userdata = FlatcarProvider {}.user_data(&req).unwrap();

        // verify:
        assert!(userdata.starts_with("#cloud-config"));
    }

    #[test]
    fn test_flatcar_auto_update_masking() {
        // setup:
        let mut req = request(OperatingSystem::Flatcar, "hetzner");
        req.machine_spec.provider_spec.operating_system_spec =
            serde_json::json!({"disableAutoUpdate": true, "provisioningUtility": "ignition"});

        // execute:
        let userdata = FlatcarProvider {}.user_data(&req).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&userdata).unwrap();

        // verify:
        let units = parsed["systemd"]["units"].as_array().unwrap();
        assert!(
            units
                .iter()
                .any(|u| u["name"] == "update-engine.service" && u["mask"] == true)
        );
    }

    #[test]
    fn test_flatcar_explicit_cloud_init() {
        // setup:
        let mut req = request(OperatingSystem::Flatcar, "openstack");
        req.machine_spec.provider_spec.operating_system_spec = serde_json::json!({"provisioningUtility": "cloud-init"});

        // execute:
        let userdata = FlatcarProvider {}.user_data(&req).unwrap();

        // verify: no package manager on flatcar
        assert!(userdata.starts_with("#cloud-config"));
        assert!(!userdata.contains("apt-get"));
        assert!(!userdata.contains("yum install"));
    }
}
