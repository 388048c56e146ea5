use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::{CommandError, MachineError};
use crate::machine::ContainerRuntimeKind;
use crate::network::IpFamily;
use crate::userdata::UserDataRequest;

pub const BOOTSTRAP_KUBECONFIG_PATH: &str = "/etc/kubernetes/bootstrap-kubelet.conf";
pub const KUBECONFIG_PATH: &str = "/var/lib/kubelet/kubeconfig";
pub const KUBELET_CONFIG_PATH: &str = "/etc/kubernetes/kubelet.conf";
pub const CERT_DIR: &str = "/etc/kubernetes/pki";
pub const CLOUD_CONFIG_PATH: &str = "/etc/kubernetes/cloud-config";
pub const NODE_IP_ENV_FILE: &str = "/etc/kubernetes/nodeip.conf";

fn parse_kubelet_version(raw: &str) -> Result<semver::Version, MachineError> {
    semver::Version::parse(raw.trim_start_matches('v'))
        .map_err(|e| MachineError::new_invalid_configuration(format!("cannot parse kubelet version `{raw}`: {e}")))
}

fn version_below(version: &semver::Version, range: &str) -> bool {
    semver::VersionReq::parse(range).unwrap().matches(version)
}

/// Flags the kubelet gets as one shell-continued string, embedded into the
/// systemd unit. Includes the version-gated legacy flags for older kubelets.
pub fn kubelet_flags(req: &UserDataRequest) -> Result<String, MachineError> {
    let version = parse_kubelet_version(req.kubelet_version())?;
    let mut flags: Vec<String> = vec![
        format!("--bootstrap-kubeconfig={BOOTSTRAP_KUBECONFIG_PATH}"),
        format!("--kubeconfig={KUBECONFIG_PATH}"),
        format!("--config={KUBELET_CONFIG_PATH}"),
        format!("--cert-dir={CERT_DIR}"),
    ];

    flags.extend(cloud_provider_flags(
        req.kubelet_cloud_provider_name.as_deref(),
        req.external_cloud_provider,
    ));

    // kube-proxy needs the cloud's private DNS name on AWS, the override
    // would break node correlation there
    if req.cloud_provider_name != "aws" {
        flags.push("--hostname-override=${KUBELET_HOSTNAME}".to_string());
    }

    flags.push("--exit-on-lock-contention".to_string());
    flags.push("--lock-file=/tmp/kubelet.lock".to_string());

    if let Some(pause_image) = &req.pause_image {
        flags.push(format!("--pod-infra-container-image={pause_image}"));
    }

    if req.container_runtime().name == ContainerRuntimeKind::Containerd {
        flags.push("--container-runtime-endpoint=unix:///run/containerd/containerd.sock".to_string());
    }

    if !req.machine_spec.taints.is_empty() {
        let taints = req
            .machine_spec
            .taints
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");
        flags.push(format!("--register-with-taints={taints}"));
    }

    // only when dual-stack and the cloud will not publish addresses itself
    if req.ip_family() == IpFamily::DualStack
        && req.kubelet_cloud_provider_name.is_none()
        && !req.external_cloud_provider
    {
        flags.push("--node-ip=${KUBELET_NODE_IP}".to_string());
    }

    if version_below(&version, "< 1.23") {
        flags.push("--dynamic-config-dir=/etc/kubernetes/dynamic-config-dir".to_string());
        flags.push("--feature-gates=DynamicKubeletConfig=true".to_string());
    }

    if version_below(&version, "< 1.24") {
        flags.push("--network-plugin=cni".to_string());
    }

    Ok(flags.join(" \\\n  "))
}

pub fn cloud_provider_flags(kubelet_cloud_provider_name: Option<&str>, external: bool) -> Vec<String> {
    if external {
        return vec!["--cloud-provider=external".to_string()];
    }

    match kubelet_cloud_provider_name {
        Some(name) if !name.is_empty() => vec![
            format!("--cloud-provider={name}"),
            format!("--cloud-config={CLOUD_CONFIG_PATH}"),
        ],
        _ => vec![],
    }
}

/// The kubelet unit: flags wrapped with the ExecStartPre ladder (kernel
/// modules, swap off, node-IP env) and hard dependencies on the runtime and
/// both health checkers.
pub fn kubelet_systemd_unit(req: &UserDataRequest) -> Result<String, MachineError> {
    let runtime = req.container_runtime().name;
    let flags = kubelet_flags(req)?;

    Ok(format!(
        r#"[Unit]
After={runtime}.service
Requires={runtime}.service
Requires=kubelet-healthcheck.service
Requires={runtime}-healthcheck.service
Description=kubelet: The Kubernetes Node Agent
Documentation=https://kubernetes.io/docs/home/

[Service]
Restart=always
StartLimitInterval=0
RestartSec=10
CPUAccounting=true
MemoryAccounting=true
Environment="PATH=/opt/bin:/bin:/sbin:/usr/local/bin:/usr/local/sbin:/usr/bin:/usr/sbin"
EnvironmentFile=-/etc/environment
EnvironmentFile=-{NODE_IP_ENV_FILE}
ExecStartPre=/bin/bash /opt/load-kernel-modules.sh
ExecStartPre=/bin/bash /opt/disable-swap.sh
ExecStartPre=/bin/bash /opt/bin/setup_net_env.sh
ExecStart=/opt/bin/kubelet $KUBELET_EXTRA_ARGS \
  {flags}

[Install]
WantedBy=multi-user.target
"#
    ))
}

#[derive(Serialize)]
struct WebhookAuthn {
    enabled: bool,
}

#[derive(Serialize)]
struct AnonymousAuthn {
    enabled: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct X509Authn {
    client_ca_file: String,
}

#[derive(Serialize)]
struct Authentication {
    anonymous: AnonymousAuthn,
    webhook: WebhookAuthn,
    x509: X509Authn,
}

#[derive(Serialize)]
struct Authorization {
    mode: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfiguration {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    authentication: Authentication,
    authorization: Authorization,
    cgroup_driver: String,
    cluster_dns: Vec<String>,
    cluster_domain: String,
    container_log_max_size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    container_log_max_files: Option<u32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    feature_gates: BTreeMap<String, bool>,
    eviction_hard: BTreeMap<String, String>,
    kube_reserved: BTreeMap<String, String>,
    system_reserved: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_pods: Option<u32>,
    protect_kernel_defaults: bool,
    read_only_port: u16,
    rotate_certificates: bool,
    server_tls_bootstrap: bool,
    static_pod_path: String,
    tls_cipher_suites: Vec<String>,
    volume_plugin_dir: String,
}

const TLS_CIPHER_SUITES: &[&str] = &[
    // TLS 1.3
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    // TLS 1.2
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305",
];

fn default_reserved() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("cpu".to_string(), "200m".to_string()),
        ("memory".to_string(), "200Mi".to_string()),
        ("ephemeral-storage".to_string(), "1Gi".to_string()),
    ])
}

fn default_eviction_hard() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("memory.available".to_string(), "100Mi".to_string()),
        ("nodefs.available".to_string(), "10%".to_string()),
    ])
}

// "cpu=500m,memory=500Mi" -> merged over the defaults
fn merge_resource_list(defaults: BTreeMap<String, String>, raw: Option<&String>) -> Result<BTreeMap<String, String>, MachineError> {
    let mut merged = defaults;
    if let Some(raw) = raw {
        for pair in raw.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                MachineError::new_invalid_configuration(format!("cannot parse resource list entry `{pair}`"))
            })?;
            merged.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(merged)
}

// eviction thresholds use `<` instead of `=` as the key/value separator
fn merge_eviction_list(defaults: BTreeMap<String, String>, raw: Option<&String>) -> Result<BTreeMap<String, String>, MachineError> {
    let mut merged = defaults;
    if let Some(raw) = raw {
        for pair in raw.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('<').ok_or_else(|| {
                MachineError::new_invalid_configuration(format!("cannot parse eviction entry `{pair}`"))
            })?;
            merged.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(merged)
}

/// Emits the KubeletConfiguration document written to
/// `/etc/kubernetes/kubelet.conf`. Defaults are locked down (webhook
/// authn/authz, no anonymous, no read-only port, kernel defaults protected)
/// and only the documented knobs are overridable.
pub fn kubelet_configuration(req: &UserDataRequest) -> Result<String, MachineError> {
    let knobs = &req.kubelet_configs;

    let max_pods = match knobs.get("maxPods") {
        Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
            MachineError::new_invalid_configuration(format!("kubelet config maxPods `{raw}` is not a number"))
        })?),
        None => Some(110),
    };

    let container_log_max_files = match knobs.get("containerLogMaxFiles") {
        Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
            MachineError::new_invalid_configuration(format!(
                "kubelet config containerLogMaxFiles `{raw}` is not a number"
            ))
        })?),
        None => None,
    };

    let configuration = KubeletConfiguration {
        api_version: "kubelet.config.k8s.io/v1beta1".to_string(),
        kind: "KubeletConfiguration".to_string(),
        authentication: Authentication {
            anonymous: AnonymousAuthn { enabled: false },
            webhook: WebhookAuthn { enabled: true },
            x509: X509Authn {
                client_ca_file: format!("{CERT_DIR}/ca.crt"),
            },
        },
        authorization: Authorization {
            mode: "Webhook".to_string(),
        },
        cgroup_driver: "systemd".to_string(),
        cluster_dns: req.cluster_dns_ips.iter().map(|ip| ip.to_string()).collect(),
        cluster_domain: "cluster.local".to_string(),
        container_log_max_size: knobs
            .get("containerLogMaxSize")
            .cloned()
            .unwrap_or_else(|| "100Mi".to_string()),
        container_log_max_files,
        feature_gates: req.kubelet_feature_gates.clone(),
        eviction_hard: merge_eviction_list(default_eviction_hard(), knobs.get("evictionHard"))?,
        kube_reserved: merge_resource_list(default_reserved(), knobs.get("kubeReserved"))?,
        system_reserved: merge_resource_list(default_reserved(), knobs.get("systemReserved"))?,
        max_pods,
        protect_kernel_defaults: true,
        read_only_port: 0,
        rotate_certificates: true,
        server_tls_bootstrap: true,
        static_pod_path: "/etc/kubernetes/manifests".to_string(),
        tls_cipher_suites: TLS_CIPHER_SUITES.iter().map(|s| s.to_string()).collect(),
        volume_plugin_dir: "/var/lib/kubelet/volumeplugins".to_string(),
    };

    serde_yaml::to_string(&configuration)
        .map_err(CommandError::from)
        .map_err(MachineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{OperatingSystem, Taint};
    use crate::userdata::test_helpers::request;

    #[test]
    fn test_kubelet_configuration_is_locked_down() {
        // setup:
        let req = request(OperatingSystem::Ubuntu, "fake");

        // execute:
        let yaml = kubelet_configuration(&req).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        // verify:
        assert_eq!(parsed["authentication"]["anonymous"]["enabled"], serde_yaml::Value::Bool(false));
        assert_eq!(parsed["authorization"]["mode"], serde_yaml::Value::String("Webhook".to_string()));
        assert_eq!(parsed["readOnlyPort"], serde_yaml::Value::Number(0.into()));
        assert_eq!(parsed["rotateCertificates"], serde_yaml::Value::Bool(true));
        assert_eq!(parsed["protectKernelDefaults"], serde_yaml::Value::Bool(true));
        assert_eq!(parsed["containerLogMaxSize"], serde_yaml::Value::String("100Mi".to_string()));
    }

    #[test]
    fn test_kubelet_configuration_knob_overrides_merge_with_defaults() {
        // setup:
        let mut req = request(OperatingSystem::Ubuntu, "fake");
        req.kubelet_configs.insert("maxPods".to_string(), "200".to_string());
        req.kubelet_configs
            .insert("kubeReserved".to_string(), "cpu=500m,memory=500Mi".to_string());

        // execute:
        let yaml = kubelet_configuration(&req).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        // verify:
        assert_eq!(parsed["maxPods"], serde_yaml::Value::Number(200.into()));
        assert_eq!(parsed["kubeReserved"]["cpu"], serde_yaml::Value::String("500m".to_string()));
        assert_eq!(parsed["kubeReserved"]["memory"], serde_yaml::Value::String("500Mi".to_string()));
        // the untouched default survives the merge
        assert_eq!(
            parsed["kubeReserved"]["ephemeral-storage"],
            serde_yaml::Value::String("1Gi".to_string())
        );
    }

    #[test]
    fn test_kubelet_configuration_rejects_bad_max_pods() {
        // setup:
        let mut req = request(OperatingSystem::Ubuntu, "fake");
        req.kubelet_configs.insert("maxPods".to_string(), "many".to_string());

        // execute & verify:
        assert!(kubelet_configuration(&req).unwrap_err().is_terminal());
    }

    #[test]
    fn test_kubelet_flags_hostname_skipped_on_aws() {
        // setup:
        let on_aws = request(OperatingSystem::Ubuntu, "aws");
        let elsewhere = request(OperatingSystem::Ubuntu, "hetzner");

        // execute & verify:
        assert!(!kubelet_flags(&on_aws).unwrap().contains("--hostname-override"));
        assert!(kubelet_flags(&elsewhere).unwrap().contains("--hostname-override"));
    }

    #[test]
    fn test_kubelet_flags_version_gates() {
        // setup:
        let mut req = request(OperatingSystem::Ubuntu, "fake");

        // execute & verify: modern kubelet has no legacy flags
        let flags = kubelet_flags(&req).unwrap();
        assert!(!flags.contains("--dynamic-config-dir"));
        assert!(!flags.contains("--network-plugin=cni"));

        // execute & verify: 1.22 gets both
        req.machine_spec.versions.kubelet = "1.22.9".to_string();
        let flags = kubelet_flags(&req).unwrap();
        assert!(flags.contains("--dynamic-config-dir=/etc/kubernetes/dynamic-config-dir"));
        assert!(flags.contains("--feature-gates=DynamicKubeletConfig=true"));
        assert!(flags.contains("--network-plugin=cni"));

        // execute & verify: 1.23 keeps only the cni flag
        req.machine_spec.versions.kubelet = "1.23.5".to_string();
        let flags = kubelet_flags(&req).unwrap();
        assert!(!flags.contains("--dynamic-config-dir"));
        assert!(flags.contains("--network-plugin=cni"));
    }

    #[test]
    fn test_cloud_provider_flags_modes() {
        // execute & verify: external CCM wins
        assert_eq!(cloud_provider_flags(Some("aws"), true), vec!["--cloud-provider=external"]);

        // execute & verify: in-tree gets name + config file
        assert_eq!(
            cloud_provider_flags(Some("aws"), false),
            vec![
                "--cloud-provider=aws".to_string(),
                "--cloud-config=/etc/kubernetes/cloud-config".to_string()
            ]
        );

        // execute & verify: no cloud integration at all
        assert!(cloud_provider_flags(None, false).is_empty());
    }

    #[test]
    fn test_kubelet_flags_taints_and_node_ip() {
        // setup:
        let mut req = request(OperatingSystem::Ubuntu, "fake");
        req.machine_spec.taints = vec![Taint {
            key: "dedicated".to_string(),
            value: "gpu".to_string(),
            effect: "NoSchedule".to_string(),
        }];
        req.cluster_dns_ips = vec!["10.96.0.10".parse().unwrap(), "fd00::10".parse().unwrap()];

        // execute:
        let flags = kubelet_flags(&req).unwrap();

        // verify:
        assert!(flags.contains("--register-with-taints=dedicated=gpu:NoSchedule"));
        assert!(flags.contains("--node-ip=${KUBELET_NODE_IP}"));

        // setup: a cloud that publishes addresses itself
        req.kubelet_cloud_provider_name = Some("aws".to_string());

        // execute & verify:
        assert!(!kubelet_flags(&req).unwrap().contains("--node-ip"));
    }

    #[test]
    fn test_kubelet_systemd_unit_wiring() {
        // setup:
        let req = request(OperatingSystem::Ubuntu, "fake");

        // execute:
        let unit = kubelet_systemd_unit(&req).unwrap();

        // verify:
        assert!(unit.contains("After=containerd.service"));
        assert!(unit.contains("Requires=kubelet-healthcheck.service"));
        assert!(unit.contains("Requires=containerd-healthcheck.service"));
        assert!(unit.contains("ExecStartPre=/bin/bash /opt/load-kernel-modules.sh"));
        assert!(unit.contains("ExecStartPre=/bin/bash /opt/disable-swap.sh"));
        assert!(unit.contains("--bootstrap-kubeconfig=/etc/kubernetes/bootstrap-kubelet.conf"));
    }
}
