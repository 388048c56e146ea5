use std::collections::BTreeMap;

use crate::config::SecretStore;
use crate::errors::{CommandError, MachineError};
use crate::machine::OperatingSystem;
use crate::userdata::kubelet::BOOTSTRAP_KUBECONFIG_PATH;

/// Namespace in the control cluster holding the real provisioning payloads
/// and the getter token.
pub const BOOTSTRAP_SECRET_NAMESPACE: &str = "cloud-init-settings";
pub const BOOTSTRAP_TOKEN_SECRET_PREFIX: &str = "cloud-init-getter-token";
pub const BOOTSTRAP_CLOUD_INIT_KEY: &str = "cloud-init";
pub const BOOTSTRAP_TOKEN_KEY: &str = "token";

const BOOTSTRAP_CONFIG_DST: &str = "/etc/cloud/cloud.cfg.d/99-bootstrap-config.cfg";

/// Stores the real payload under the machine's name; the VM fetches it at
/// first boot through the token.
pub async fn store_bootstrap_payload(
    store: &dyn SecretStore,
    machine_name: &str,
    payload: &str,
) -> Result<(), MachineError> {
    let data = BTreeMap::from([(BOOTSTRAP_CLOUD_INIT_KEY.to_string(), payload.as_bytes().to_vec())]);
    store
        .create_secret(BOOTSTRAP_SECRET_NAMESPACE, machine_name, data)
        .await
        .map_err(MachineError::from)?;
    Ok(())
}

/// Reads the bearer token VMs use to fetch their payload.
pub async fn bootstrap_token(store: &dyn SecretStore) -> Result<String, MachineError> {
    let mut names = store
        .list_secret_names_by_prefix(BOOTSTRAP_SECRET_NAMESPACE, BOOTSTRAP_TOKEN_SECRET_PREFIX)
        .await
        .map_err(MachineError::from)?;
    names.sort();

    let name = names.first().ok_or_else(|| {
        MachineError::new_invalid_configuration(format!(
            "no `{BOOTSTRAP_TOKEN_SECRET_PREFIX}*` secret found in namespace `{BOOTSTRAP_SECRET_NAMESPACE}`"
        ))
    })?;

    let data = store
        .get_secret(BOOTSTRAP_SECRET_NAMESPACE, name)
        .await
        .map_err(MachineError::from)?;

    let token = data.get(BOOTSTRAP_TOKEN_KEY).ok_or_else(|| {
        MachineError::new_invalid_configuration(format!(
            "secret `{BOOTSTRAP_SECRET_NAMESPACE}/{name}` has no `{BOOTSTRAP_TOKEN_KEY}` key"
        ))
    })?;

    String::from_utf8(token.clone()).map_err(|_| {
        MachineError::new_invalid_configuration(format!(
            "secret `{BOOTSTRAP_SECRET_NAMESPACE}/{name}` token is not valid UTF-8"
        ))
    })
}

/// Recovers the API server URL from a rendered payload by locating the
/// bootstrap kubeconfig among its `write_files` entries.
pub fn api_server_url_from_userdata(userdata: &str) -> Result<String, MachineError> {
    let document: serde_yaml::Value = serde_yaml::from_str(userdata.trim_start_matches("#cloud-config"))
        .map_err(CommandError::from)?;

    let write_files = document
        .get("write_files")
        .and_then(|v| v.as_sequence())
        .ok_or_else(|| {
            MachineError::new_invalid_configuration("rendered payload has no write_files section".to_string())
        })?;

    for file in write_files {
        let path = file.get("path").and_then(|p| p.as_str()).unwrap_or_default();
        if path != BOOTSTRAP_KUBECONFIG_PATH {
            continue;
        }

        let content = file.get("content").and_then(|c| c.as_str()).ok_or_else(|| {
            MachineError::new_invalid_configuration("bootstrap kubeconfig entry has no content".to_string())
        })?;

        let kubeconfig: kube::config::Kubeconfig = serde_yaml::from_str(content).map_err(CommandError::from)?;
        return Ok(crate::kubeconfig::server_url(&kubeconfig)?.to_string());
    }

    Err(MachineError::new_invalid_configuration(format!(
        "rendered payload does not write `{BOOTSTRAP_KUBECONFIG_PATH}`"
    )))
}

fn fetch_packages_line(os: OperatingSystem) -> &'static str {
    match os {
        OperatingSystem::Ubuntu => "apt-get update && apt-get install -y curl jq",
        OperatingSystem::CentOs | OperatingSystem::Rhel | OperatingSystem::RockyLinux | OperatingSystem::AmazonLinux2 => {
            "yum install -y curl jq"
        }
        // curl and jq ship with the image
        OperatingSystem::Flatcar => "true",
        OperatingSystem::Windows => "true",
    }
}

/// The stub the cloud actually receives: a minimal cloud-init that exchanges
/// the bearer token for the real payload, re-seeds cloud-init with it and
/// re-runs the init stage.
pub fn bootstrap_stub(
    machine_name: &str,
    token: &str,
    api_server_url: &str,
    os: OperatingSystem,
) -> Result<String, MachineError> {
    if os == OperatingSystem::Windows {
        return Err(MachineError::new_unsupported_operating_system(os, "bootstrap token exchange"));
    }

    let api_server_url = api_server_url.trim_end_matches('/');
    let packages_line = fetch_packages_line(os);

    Ok(format!(
        r#"#cloud-config
write_files:
- path: /opt/bin/bootstrap
  permissions: "0755"
  content: |
    #!/bin/bash
    set -xeuo pipefail
    {packages_line}
    curl -s -k -v --header 'Authorization: Bearer {token}' \
      {api_server_url}/api/v1/namespaces/{BOOTSTRAP_SECRET_NAMESPACE}/secrets/{machine_name} \
      | jq '.data["{BOOTSTRAP_CLOUD_INIT_KEY}"]' -r | base64 -d > {BOOTSTRAP_CONFIG_DST}
    cloud-init clean
    cloud-init --file {BOOTSTRAP_CONFIG_DST} init
    systemctl daemon-reload
- path: /etc/systemd/system/bootstrap.service
  permissions: "0644"
  content: |
    [Unit]
    Requires=network-online.target
    After=network-online.target

    [Service]
    Type=oneshot
    RemainAfterExit=true
    ExecStart=/opt/bin/bootstrap

    [Install]
    WantedBy=multi-user.target
runcmd:
- systemctl restart bootstrap.service
"#
    ))
}

/// Full out-of-band exchange: stores the real payload, then returns the stub
/// to hand to the cloud instead.
pub async fn inject_bootstrap_exchange(
    store: &dyn SecretStore,
    machine_name: &str,
    userdata: &str,
    os: OperatingSystem,
) -> Result<String, MachineError> {
    let api_server_url = api_server_url_from_userdata(userdata)?;
    let token = bootstrap_token(store).await?;
    store_bootstrap_payload(store, machine_name, userdata).await?;
    bootstrap_stub(machine_name, &token, &api_server_url, os)
}

/// Decodes the payload back out of a secret, for tests and debugging.
pub fn payload_from_secret(data: &BTreeMap<String, Vec<u8>>) -> Result<String, MachineError> {
    let raw = data.get(BOOTSTRAP_CLOUD_INIT_KEY).ok_or_else(|| {
        MachineError::new_invalid_configuration(format!("secret has no `{BOOTSTRAP_CLOUD_INIT_KEY}` key"))
    })?;
    String::from_utf8(raw.clone())
        .map_err(|_| MachineError::new_invalid_configuration("bootstrap payload is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemorySecretStore;
    use crate::machine::OperatingSystem;
    use crate::userdata::{provider_for_os, test_helpers::request};

    #[tokio::test]
    async fn test_full_bootstrap_exchange() {
        // setup:
        let store = InMemorySecretStore::new().with_secret(
            BOOTSTRAP_SECRET_NAMESPACE,
            "cloud-init-getter-token-x7k2m",
            BOOTSTRAP_TOKEN_KEY,
            "bearer-123",
        );
        let req = request(OperatingSystem::Ubuntu, "fake");
        let payload = provider_for_os(OperatingSystem::Ubuntu)
            .unwrap()
            .user_data(&req)
            .unwrap();

        // execute:
        let stub = inject_bootstrap_exchange(&store, "node-1", &payload, OperatingSystem::Ubuntu)
            .await
            .unwrap();

        // verify: the stub fetches from the server embedded in the payload
        assert!(stub.contains("Authorization: Bearer bearer-123"));
        assert!(stub.contains("https://api.cluster.example:6443/api/v1/namespaces/cloud-init-settings/secrets/node-1"));
        assert!(stub.contains("cloud-init clean"));
        assert!(stub.contains("/etc/cloud/cloud.cfg.d/99-bootstrap-config.cfg"));

        // verify: the real payload is stored under the machine name
        let stored = store.get_secret(BOOTSTRAP_SECRET_NAMESPACE, "node-1").await.unwrap();
        assert_eq!(payload_from_secret(&stored).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_missing_token_secret_is_terminal() {
        // setup:
        let store = InMemorySecretStore::new();

        // execute:
        let err = bootstrap_token(&store).await.unwrap_err();

        // verify:
        assert!(err.is_terminal());
    }

    #[test]
    fn test_api_server_url_extraction_requires_bootstrap_kubeconfig() {
        // setup:
        let userdata = "#cloud-config\nwrite_files:\n- path: /etc/motd\n  content: |\n    hello\n";

        // execute & verify:
        assert!(api_server_url_from_userdata(userdata).is_err());
    }

    #[test]
    fn test_stub_rejects_windows() {
        // execute & verify:
        assert!(bootstrap_stub("node-1", "t", "https://api", OperatingSystem::Windows).is_err());
    }
}
