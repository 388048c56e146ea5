use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose;
use serde::Serialize;

use crate::config::ConfigVarResolver;
use crate::errors::{CommandError, MachineError};
use crate::machine::{ContainerRuntimeKind, ContainerRuntimeOpts};
use crate::userdata::UserDataRequest;

pub const DEFAULT_CONTAINERD_VERSION: &str = "1.6";
pub const DEFAULT_DOCKER_VERSION: &str = "20.10";

/// Package family of the distribution a runtime gets installed on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PackageFamily {
    Apt,
    Yum,
    AmazonLinux,
}

/// Plain credentials for one registry host, resolved out of the ConfigVars
/// before rendering so the renderer itself stays pure.
#[derive(Clone, Debug, Default)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

pub async fn resolve_registry_credentials(
    opts: &ContainerRuntimeOpts,
    resolver: &ConfigVarResolver,
) -> Result<BTreeMap<String, RegistryAuth>, MachineError> {
    let mut resolved = BTreeMap::new();
    for (host, credentials) in &opts.registry_credentials {
        resolved.insert(
            host.clone(),
            RegistryAuth {
                username: resolver.get_string(&credentials.username).await?,
                password: resolver.get_string(&credentials.password).await?,
            },
        );
    }
    Ok(resolved)
}

pub fn config_path(runtime: ContainerRuntimeKind) -> &'static str {
    match runtime {
        ContainerRuntimeKind::Containerd => "/etc/containerd/config.toml",
        ContainerRuntimeKind::Docker => "/etc/docker/daemon.json",
    }
}

pub fn auth_config_path(runtime: ContainerRuntimeKind) -> &'static str {
    match runtime {
        ContainerRuntimeKind::Containerd => "",
        ContainerRuntimeKind::Docker => "/root/.docker/config.json",
    }
}

pub fn crictl_config(runtime: ContainerRuntimeKind) -> &'static str {
    match runtime {
        ContainerRuntimeKind::Containerd => "runtime-endpoint: unix:///run/containerd/containerd.sock\n",
        ContainerRuntimeKind::Docker => "runtime-endpoint: unix:///var/run/dockershim.sock\n",
    }
}

/// Main runtime configuration file: containerd's config.toml (registry
/// mirrors and auth inline) or docker's daemon.json.
pub fn runtime_config(req: &UserDataRequest) -> Result<String, MachineError> {
    let opts = req.container_runtime();
    match opts.name {
        ContainerRuntimeKind::Containerd => Ok(containerd_config(&opts, &req.registry_credentials)),
        ContainerRuntimeKind::Docker => docker_daemon_config(&opts),
    }
}

/// Secondary auth file; empty for containerd, whose auth lives in config.toml.
pub fn auth_config(req: &UserDataRequest) -> Result<String, MachineError> {
    match req.container_runtime().name {
        ContainerRuntimeKind::Containerd => Ok(String::new()),
        ContainerRuntimeKind::Docker => docker_auth_config(&req.registry_credentials),
    }
}

fn containerd_config(opts: &ContainerRuntimeOpts, credentials: &BTreeMap<String, RegistryAuth>) -> String {
    let mut out = String::from(
        r#"version = 2

[metrics]
address = "127.0.0.1:1338"

[plugins]
[plugins."io.containerd.grpc.v1.cri"]
[plugins."io.containerd.grpc.v1.cri".containerd]
[plugins."io.containerd.grpc.v1.cri".containerd.runtimes]
[plugins."io.containerd.grpc.v1.cri".containerd.runtimes.runc]
runtime_type = "io.containerd.runc.v2"
[plugins."io.containerd.grpc.v1.cri".containerd.runtimes.runc.options]
SystemdCgroup = true
[plugins."io.containerd.grpc.v1.cri".registry]
[plugins."io.containerd.grpc.v1.cri".registry.mirrors]
[plugins."io.containerd.grpc.v1.cri".registry.mirrors."docker.io"]
endpoint = ["https://registry-1.docker.io"]
"#,
    );

    for (registry, endpoints) in &opts.registry_mirrors {
        if registry == "docker.io" {
            continue;
        }
        out.push_str(&format!(
            "[plugins.\"io.containerd.grpc.v1.cri\".registry.mirrors.\"{registry}\"]\n"
        ));
        let endpoints = endpoints
            .iter()
            .map(|e| format!("\"{e}\""))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("endpoint = [{endpoints}]\n"));
    }

    for (host, auth) in credentials {
        out.push_str(&format!(
            "[plugins.\"io.containerd.grpc.v1.cri\".registry.configs.\"{host}\".auth]\n"
        ));
        out.push_str(&format!("username = \"{}\"\n", auth.username));
        out.push_str(&format!("password = \"{}\"\n", auth.password));
    }

    out
}

#[derive(Serialize)]
struct DockerLogOpts {
    #[serde(rename = "max-file")]
    max_file: String,
    #[serde(rename = "max-size")]
    max_size: String,
}

#[derive(Serialize)]
struct DockerDaemonConfig {
    #[serde(rename = "exec-opts")]
    exec_opts: Vec<String>,
    #[serde(rename = "storage-driver")]
    storage_driver: String,
    #[serde(rename = "log-driver")]
    log_driver: String,
    #[serde(rename = "log-opts")]
    log_opts: DockerLogOpts,
    #[serde(rename = "registry-mirrors", skip_serializing_if = "Vec::is_empty")]
    registry_mirrors: Vec<String>,
    #[serde(rename = "insecure-registries", skip_serializing_if = "Vec::is_empty")]
    insecure_registries: Vec<String>,
}

fn docker_daemon_config(opts: &ContainerRuntimeOpts) -> Result<String, MachineError> {
    // docker knows only one mirror list, keyed mirrors collapse into it
    let registry_mirrors = opts.registry_mirrors.values().flatten().cloned().collect();

    let config = DockerDaemonConfig {
        exec_opts: vec!["native.cgroupdriver=systemd".to_string()],
        storage_driver: "overlay2".to_string(),
        log_driver: "json-file".to_string(),
        log_opts: DockerLogOpts {
            max_file: "5".to_string(),
            max_size: "100m".to_string(),
        },
        registry_mirrors,
        insecure_registries: opts.insecure_registries.clone(),
    };

    serde_json::to_string_pretty(&config)
        .map_err(CommandError::from)
        .map_err(MachineError::from)
}

fn docker_auth_config(credentials: &BTreeMap<String, RegistryAuth>) -> Result<String, MachineError> {
    if credentials.is_empty() {
        return Ok(String::new());
    }

    #[derive(Serialize)]
    struct Auths {
        auths: BTreeMap<String, Auth>,
    }

    #[derive(Serialize)]
    struct Auth {
        auth: String,
    }

    let auths = Auths {
        auths: credentials
            .iter()
            .map(|(host, auth)| {
                (
                    host.clone(),
                    Auth {
                        auth: general_purpose::STANDARD.encode(format!("{}:{}", auth.username, auth.password)),
                    },
                )
            })
            .collect(),
    };

    serde_json::to_string_pretty(&auths)
        .map_err(CommandError::from)
        .map_err(MachineError::from)
}

/// Shell fragment installing and starting the runtime, embedded into each
/// OS's setup script. Flatcar ships its runtimes pre-installed and never
/// calls this.
pub fn install_script(runtime: ContainerRuntimeKind, family: PackageFamily, version: Option<&str>) -> String {
    match (runtime, family) {
        (ContainerRuntimeKind::Containerd, PackageFamily::Apt) => {
            let version = version.unwrap_or(DEFAULT_CONTAINERD_VERSION);
            format!(
                r#"apt-get update
apt-get install -y apt-transport-https ca-certificates curl software-properties-common lsb-release
curl -fsSL https://download.docker.com/linux/ubuntu/gpg | apt-key add -
add-apt-repository "deb https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable"
apt-get install -y --allow-downgrades containerd.io={version}*
apt-mark hold containerd.io
systemctl daemon-reload
systemctl enable --now containerd
"#
            )
        }
        (ContainerRuntimeKind::Containerd, PackageFamily::Yum) => {
            let version = version.unwrap_or(DEFAULT_CONTAINERD_VERSION);
            format!(
                r#"yum install -y yum-utils
yum-config-manager --add-repo=https://download.docker.com/linux/centos/docker-ce.repo
yum install -y containerd.io-{version}*
systemctl daemon-reload
systemctl enable --now containerd
"#
            )
        }
        (ContainerRuntimeKind::Containerd, PackageFamily::AmazonLinux) => {
            let version = version.unwrap_or(DEFAULT_CONTAINERD_VERSION);
            format!(
                r#"yum install -y containerd-{version}*
systemctl daemon-reload
systemctl enable --now containerd
"#
            )
        }
        (ContainerRuntimeKind::Docker, PackageFamily::Apt) => {
            let version = version.unwrap_or(DEFAULT_DOCKER_VERSION);
            format!(
                r#"apt-get update
apt-get install -y apt-transport-https ca-certificates curl software-properties-common lsb-release
curl -fsSL https://download.docker.com/linux/ubuntu/gpg | apt-key add -
add-apt-repository "deb https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable"
apt-get install -y --allow-downgrades docker-ce=5:{version}* docker-ce-cli=5:{version}* containerd.io
apt-mark hold docker-ce docker-ce-cli containerd.io
systemctl daemon-reload
systemctl enable --now docker
"#
            )
        }
        (ContainerRuntimeKind::Docker, PackageFamily::Yum) => {
            let version = version.unwrap_or(DEFAULT_DOCKER_VERSION);
            format!(
                r#"yum install -y yum-utils
yum-config-manager --add-repo=https://download.docker.com/linux/centos/docker-ce.repo
yum install -y docker-ce-{version}* docker-ce-cli-{version}* containerd.io
systemctl daemon-reload
systemctl enable --now docker
"#
            )
        }
        (ContainerRuntimeKind::Docker, PackageFamily::AmazonLinux) => {
            let version = version.unwrap_or(DEFAULT_DOCKER_VERSION);
            format!(
                r#"amazon-linux-extras enable docker
yum install -y docker-{version}*
systemctl daemon-reload
systemctl enable --now docker
"#
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{OperatingSystem, RegistryCredentials};
    use crate::userdata::test_helpers::request;

    #[test]
    fn test_containerd_config_has_systemd_cgroups_and_mirrors() {
        // setup:
        let mut req = request(OperatingSystem::Ubuntu, "fake");
        let mut opts = ContainerRuntimeOpts::default();
        opts.registry_mirrors.insert(
            "quay.io".to_string(),
            vec!["https://mirror.internal/quay".to_string()],
        );
        req.machine_spec.provider_spec.container_runtime = Some(opts);

        // execute:
        let config = runtime_config(&req).unwrap();

        // verify:
        assert!(config.contains("SystemdCgroup = true"));
        assert!(config.contains("registry.mirrors.\"quay.io\""));
        assert!(config.contains("https://mirror.internal/quay"));
    }

    #[test]
    fn test_docker_daemon_config() {
        // setup:
        let mut req = request(OperatingSystem::Ubuntu, "fake");
        let mut opts = ContainerRuntimeOpts {
            name: ContainerRuntimeKind::Docker,
            ..Default::default()
        };
        opts.insecure_registries.push("registry.local:5000".to_string());
        req.machine_spec.provider_spec.container_runtime = Some(opts);

        // execute:
        let config = runtime_config(&req).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&config).unwrap();

        // verify:
        assert_eq!(parsed["exec-opts"][0], "native.cgroupdriver=systemd");
        assert_eq!(parsed["insecure-registries"][0], "registry.local:5000");
    }

    #[tokio::test]
    async fn test_resolve_registry_credentials_and_docker_auth() {
        // setup:
        use crate::config::{ConfigVarString, InMemorySecretStore};
        use std::sync::Arc;

        let resolver = ConfigVarResolver::new(Arc::new(InMemorySecretStore::new()));
        let mut opts = ContainerRuntimeOpts {
            name: ContainerRuntimeKind::Docker,
            ..Default::default()
        };
        opts.registry_credentials.insert(
            "registry.example.com".to_string(),
            RegistryCredentials {
                username: ConfigVarString::from_literal("bob"),
                password: ConfigVarString::from_literal("hunter2"),
            },
        );

        // execute:
        let resolved = resolve_registry_credentials(&opts, &resolver).await.unwrap();
        let auth_json = docker_auth_config(&resolved).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&auth_json).unwrap();

        // verify:
        use base64::Engine;
        let expected = base64::engine::general_purpose::STANDARD.encode("bob:hunter2");
        assert_eq!(parsed["auths"]["registry.example.com"]["auth"], expected);
    }

    #[test]
    fn test_install_script_pins_versions() {
        // execute & verify:
        let apt = install_script(ContainerRuntimeKind::Containerd, PackageFamily::Apt, Some("1.7"));
        assert!(apt.contains("containerd.io=1.7*"));
        assert!(apt.contains("apt-mark hold containerd.io"));

        let yum = install_script(ContainerRuntimeKind::Docker, PackageFamily::Yum, None);
        assert!(yum.contains(&format!("docker-ce-{DEFAULT_DOCKER_VERSION}*")));

        let amzn = install_script(ContainerRuntimeKind::Docker, PackageFamily::AmazonLinux, None);
        assert!(amzn.contains("amazon-linux-extras enable docker"));
    }
}
