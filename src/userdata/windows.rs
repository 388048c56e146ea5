use base64::Engine;
use base64::engine::general_purpose;
use serde::Deserialize;

use crate::errors::MachineError;
use crate::kubeconfig;
use crate::userdata::{UserDataProvider, UserDataRequest, kubelet};

/// Windows nodes are provisioned through cloudbase-init with a PowerShell
/// payload. Support is narrow: DHCP networking only, containerd only.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WindowsSpec {}

pub struct WindowsProvider {}

impl UserDataProvider for WindowsProvider {
    fn user_data(&self, req: &UserDataRequest) -> Result<String, MachineError> {
        let _os_spec: WindowsSpec = req.parse_os_spec()?;

        if req.machine_spec.provider_spec.network.is_some() {
            return Err(MachineError::new_invalid_configuration(
                "static IP configuration is not supported on windows".to_string(),
            ));
        }

        let kubelet_version = req.kubelet_version().trim_start_matches('v');
        let bootstrap_kubeconfig = general_purpose::STANDARD.encode(kubeconfig::stringify(&req.kubeconfig)?);
        let cluster_ca = general_purpose::STANDARD.encode(kubeconfig::cluster_ca_pem(&req.kubeconfig)?);
        let kubelet_configuration = general_purpose::STANDARD.encode(kubelet::kubelet_configuration(req)?);
        let cloud_provider_flags =
            kubelet::cloud_provider_flags(req.kubelet_cloud_provider_name.as_deref(), req.external_cloud_provider)
                .join(" ");
        let cluster_dns = req
            .cluster_dns_ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");

        Ok(format!(
            r#"#ps1
$ErrorActionPreference = "Stop"

New-Item -ItemType Directory -Force -Path C:\etc\kubernetes\pki | Out-Null
New-Item -ItemType Directory -Force -Path C:\var\lib\kubelet | Out-Null
New-Item -ItemType Directory -Force -Path C:\opt\bin | Out-Null

function Write-Base64File {{
    param([string]$Path, [string]$Content)
    [System.IO.File]::WriteAllBytes($Path, [System.Convert]::FromBase64String($Content))
}}

Write-Base64File -Path C:\etc\kubernetes\bootstrap-kubelet.conf -Content "{bootstrap_kubeconfig}"
Write-Base64File -Path C:\etc\kubernetes\pki\ca.crt -Content "{cluster_ca}"
Write-Base64File -Path C:\etc\kubernetes\kubelet.conf -Content "{kubelet_configuration}"

$kubeletUrl = "https://dl.k8s.io/v{kubelet_version}/bin/windows/amd64/kubelet.exe"
$kubeletSum = (Invoke-WebRequest -UseBasicParsing -Uri "$kubeletUrl.sha256").Content.Trim()
Invoke-WebRequest -UseBasicParsing -Uri $kubeletUrl -OutFile C:\opt\bin\kubelet.exe
if ((Get-FileHash C:\opt\bin\kubelet.exe -Algorithm SHA256).Hash.ToLower() -ne $kubeletSum.ToLower()) {{
    throw "kubelet.exe checksum mismatch"
}}

& sc.exe create kubelet binPath= ("C:\opt\bin\kubelet.exe " + `
    "--bootstrap-kubeconfig=C:\etc\kubernetes\bootstrap-kubelet.conf " + `
    "--kubeconfig=C:\var\lib\kubelet\kubeconfig " + `
    "--config=C:\etc\kubernetes\kubelet.conf " + `
    "--cert-dir=C:\etc\kubernetes\pki " + `
    "--cluster-dns={cluster_dns} " + `
    "{cloud_provider_flags}") start= auto
Start-Service kubelet
"#
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{DnsConfig, NetworkConfig, OperatingSystem};
    use crate::userdata::test_helpers::request;

    #[test]
    fn test_windows_userdata_is_powershell() {
        // setup:
        let mut req = request(OperatingSystem::Windows, "azure");
        req.machine_spec.provider_spec.operating_system = OperatingSystem::Windows;

        // execute:
        let userdata = WindowsProvider {}.user_data(&req).unwrap();

        // verify:
        assert!(userdata.starts_with("#ps1"));
        assert!(userdata.contains("kubelet.exe"));
        assert!(userdata.contains("checksum mismatch"));
    }

    #[test]
    fn test_windows_rejects_static_ip() {
        // setup:
        let mut req = request(OperatingSystem::Windows, "vsphere");
        req.machine_spec.provider_spec.network = Some(NetworkConfig {
            cidr: "10.0.0.5/24".to_string(),
            gateway: "10.0.0.1".to_string(),
            dns: DnsConfig::default(),
        });

        // execute:
        let err = WindowsProvider {}.user_data(&req).unwrap_err();

        // verify:
        assert!(err.is_terminal());
    }
}
