use crate::errors::MachineError;
use crate::machine::{ContainerRuntimeKind, NetworkConfig};
use crate::network::{IpFamily, cidr_netmask, ip_family_of_cidrs, parse_cidr};

const CNI_VERSION: &str = "v1.4.0";

/// Loads everything kube-proxy's IPVS mode and the CNI plugins need.
pub const KERNEL_MODULES_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail

modprobe ip_vs
modprobe ip_vs_rr
modprobe ip_vs_wrr
modprobe ip_vs_sh
modprobe overlay
modprobe br_netfilter

if modinfo nf_conntrack_ipv4 &> /dev/null; then
  modprobe nf_conntrack_ipv4
else
  modprobe nf_conntrack
fi
"#;

pub const DISABLE_SWAP_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail

# The kubelet refuses to run with swap on
sed -i.orig '/.*swap.*/d' /etc/fstab
swapoff -a
"#;

pub const JOURNALD_CONFIG: &str = r#"[Journal]
SystemMaxUse=5G
"#;

/// One-shot unit that runs the rendered setup script on first boot.
pub const SETUP_SERVICE: &str = r#"[Unit]
Requires=network-online.target
After=network-online.target

[Service]
Type=oneshot
RemainAfterExit=true
EnvironmentFile=-/etc/environment
ExecStart=/opt/bin/setup.sh

[Install]
WantedBy=multi-user.target
"#;

pub fn kernel_settings(ip_family: IpFamily) -> String {
    let mut settings = vec![
        "net.bridge.bridge-nf-call-iptables = 1",
        "kernel.panic_on_oops = 1",
        "kernel.panic = 10",
        "net.ipv4.ip_forward = 1",
        "vm.overcommit_memory = 1",
        "fs.inotify.max_user_watches = 1048576",
        "fs.inotify.max_user_instances = 8192",
    ];

    if ip_family.has_ipv6() {
        settings.push("net.bridge.bridge-nf-call-ip6tables = 1");
        settings.push("net.ipv6.conf.all.forwarding = 1");
    }

    let mut out = settings.join("\n");
    out.push('\n');
    out
}

/// Derives the crictl release to pair with a kubelet: same minor, patch zero.
fn crictl_version(kubelet_version: &str) -> Result<String, MachineError> {
    let version = semver::Version::parse(kubelet_version.trim_start_matches('v')).map_err(|e| {
        MachineError::new_invalid_configuration(format!("cannot parse kubelet version `{kubelet_version}`: {e}"))
    })?;
    Ok(format!("v{}.{}.0", version.major, version.minor))
}

/// Downloads CNI plugins, crictl and the kube binaries, verifying every
/// artifact against the SHA-256 sums served by the upstream mirror, then
/// installs into /opt/bin with symlinks into /usr/local/bin. Architecture is
/// detected via `uname -m` unless HOST_ARCH is set.
pub fn safe_download_binaries_script(kubelet_version: &str) -> Result<String, MachineError> {
    let kubelet_version = kubelet_version.trim_start_matches('v');
    let crictl_version = crictl_version(kubelet_version)?;

    Ok(format!(
        r#"#!/usr/bin/env bash
set -xeuo pipefail

opt_bin=/opt/bin
usr_local_bin=/usr/local/bin
cni_bin_dir=/opt/cni/bin

mkdir -p /etc/cni/net.d /etc/kubernetes/manifests "$opt_bin" "$cni_bin_dir"
arch=${{HOST_ARCH-}}
if [ -z "$arch" ]
then
case $(uname -m) in
x86_64)
    arch="amd64"
    ;;
aarch64)
    arch="arm64"
    ;;
*)
    echo "unsupported CPU architecture, exiting"
    exit 1
    ;;
esac
fi

# CNI variables
CNI_VERSION="${{CNI_VERSION:-{CNI_VERSION}}}"
cni_base_url="https://github.com/containernetworking/plugins/releases/download/$CNI_VERSION"
cni_filename="cni-plugins-linux-$arch-$CNI_VERSION.tgz"

# download CNI
curl -Lfo "$cni_bin_dir/$cni_filename" "$cni_base_url/$cni_filename"

# download CNI checksum
cni_sum=$(curl -Lf "$cni_base_url/$cni_filename.sha256")
cd "$cni_bin_dir"

# verify CNI checksum
sha256sum -c <<<"$cni_sum"

# unpack CNI
tar xvf "$cni_filename"
rm -f "$cni_filename"
cd -

# crictl variables
CRI_TOOLS_RELEASE="${{CRI_TOOLS_RELEASE:-{crictl_version}}}"
cri_tools_base_url="https://github.com/kubernetes-sigs/cri-tools/releases/download/$CRI_TOOLS_RELEASE"
cri_tools_filename="crictl-$CRI_TOOLS_RELEASE-linux-$arch.tar.gz"

# download crictl
curl -Lfo "$opt_bin/$cri_tools_filename" "$cri_tools_base_url/$cri_tools_filename"

# download crictl checksum, which contains an invalid filename prefix
cri_tools_sum=$(curl -Lf "$cri_tools_base_url/$cri_tools_filename.sha256" | sed 's/\*\///')
cd "$opt_bin"

# verify crictl checksum
echo "$cri_tools_sum  $cri_tools_filename" | sha256sum -c

# unpack crictl and symlink to path so it's available to all users
tar xvf "$cri_tools_filename"
rm -f "$cri_tools_filename"
ln -sf "$opt_bin/crictl" "$usr_local_bin"/crictl || echo "cannot create symlink for crictl"
cd -

# kubelet
KUBE_VERSION="${{KUBE_VERSION:-v{kubelet_version}}}"
kube_dir="$opt_bin/kubernetes-$KUBE_VERSION"
kube_base_url="https://dl.k8s.io/$KUBE_VERSION/bin/linux/$arch"
kube_sum_file="$kube_dir/sha256"

# create versioned kube dir
mkdir -p "$kube_dir"
: >"$kube_sum_file"

for bin in kubelet kubeadm kubectl; do
    # download kube binary
    curl -Lfo "$kube_dir/$bin" "$kube_base_url/$bin"
    chmod +x "$kube_dir/$bin"

    # download kube binary checksum
    sum=$(curl -Lf "$kube_base_url/$bin.sha256")

    # save kube binary checksum
    echo "$sum  $kube_dir/$bin" >>"$kube_sum_file"
done

# check kube binaries checksum
sha256sum -c "$kube_sum_file"

for bin in kubelet kubeadm kubectl; do
    # link kube binaries from verioned dir to $opt_bin
    ln -sf "$kube_dir/$bin" "$opt_bin"/$bin

    # link kube binaries from verioned dir to $usr_local_bin
    ln -sf "$kube_dir/$bin" "$usr_local_bin"/$bin
done
"#
    ))
}

/// Reboot-the-node-as-last-resort watchdog, installed to
/// /opt/bin/health-monitor.sh and driven by the two health-check units.
pub const HEALTH_MONITOR_SCRIPT: &str = r#"#!/usr/bin/env bash
# Script to monitor the health of the container runtime and the kubelet and
# restart them when they go unresponsive.

set -o nounset
set -o pipefail

function container_runtime_monitoring {
  local -r max_attempts=5
  local attempt=1
  local -r container_runtime_name="${CONTAINER_RUNTIME_NAME:-docker}"
  local healthcheck_command="docker ps"
  if [[ ${CONTAINER_RUNTIME:-} == "containerd" ]]; then
    healthcheck_command="ctr t ls"
  fi
  until timeout 60 ${healthcheck_command} > /dev/null; do
    if (( attempt == max_attempts )); then
      echo "Max attempt ${max_attempts} reached! Proceeding to monitor container runtime healthiness."
      break
    fi
    echo "$attempt initial attempt \"${healthcheck_command}\"! Trying again in $attempt seconds."
    sleep "$(( 2 ** attempt++ ))"
  done
  while true; do
    if ! timeout 60 ${healthcheck_command} > /dev/null; then
      echo "Container runtime ${container_runtime_name} failed!"
      if [[ "$container_runtime_name" == "docker" ]]; then
        pkill -SIGUSR1 dockerd
      fi
      systemctl kill --kill-who=main "${container_runtime_name}"
      sleep 120
    else
      sleep "${SLEEP_SECONDS}"
    fi
  done
}

function kubelet_monitoring {
  echo "Wait for 2 minutes for kubelet to be functional"
  sleep 120
  local -r max_seconds=10
  local output=""
  while true; do
    local failed=false
    if ! output=$(curl -m "${max_seconds}" -f -s -S http://127.0.0.1:10248/healthz 2>&1); then
      failed=true
      # Print the response and/or errors.
      echo "$output"
    fi
    if [[ "$failed" == "true" ]]; then
      echo "Kubelet is unhealthy!"
      systemctl kill kubelet
      sleep 60
    else
      sleep "${SLEEP_SECONDS}"
    fi
  done
}

SLEEP_SECONDS=10
component=$1
echo "Start kubernetes health monitoring for ${component}"
if [[ "${component}" == "container-runtime" ]]; then
  container_runtime_monitoring
elif [[ "${component}" == "kubelet" ]]; then
  kubelet_monitoring
else
  echo "Health monitoring for component ${component} is not supported!"
fi
"#;

pub fn kubelet_health_check_systemd_unit() -> String {
    r#"[Unit]
Requires=kubelet.service
After=kubelet.service

[Service]
ExecStart=/opt/bin/health-monitor.sh kubelet

[Install]
WantedBy=multi-user.target
"#
    .to_string()
}

pub fn container_runtime_health_check_systemd_unit(runtime: ContainerRuntimeKind) -> String {
    format!(
        r#"[Unit]
Requires={runtime}.service
After={runtime}.service

[Service]
Environment="CONTAINER_RUNTIME={runtime}"
ExecStart=/opt/bin/health-monitor.sh container-runtime

[Install]
WantedBy=multi-user.target
"#
    )
}

/// Writes /etc/kubernetes/nodeip.conf with the addresses the kubelet unit
/// reads through its EnvironmentFile.
pub fn setup_net_env_script(ip_family: IpFamily) -> String {
    let node_ip_assignment = match ip_family {
        IpFamily::IPv4 => "node_ip=$default_ipv4",
        IpFamily::IPv6 => "node_ip=$default_ipv6",
        IpFamily::DualStack => "node_ip=\"$default_ipv4,$default_ipv6\"",
    };

    format!(
        r#"#!/usr/bin/env bash
set -euo pipefail

default_ipv4=$(ip -4 -o route get 1 2>/dev/null | grep -oP "src \K\S+" || true)
default_ipv6=$(ip -6 -o route get 1:: 2>/dev/null | grep -oP "src \K\S+" || true)
{node_ip_assignment}

cat > /etc/kubernetes/nodeip.conf <<EOF
KUBELET_NODE_IP=$node_ip
KUBELET_HOSTNAME=$(hostname -f 2>/dev/null || hostname)
EOF
"#
    )
}

/// Static interface configuration in sysconfig style, used by the yum-based
/// distributions when the machine carries a static IP block.
pub fn ifcfg_static_network(network: &NetworkConfig) -> Result<String, MachineError> {
    let cidr = parse_cidr(&network.cidr)
        .map_err(|e| MachineError::new_invalid_configuration(e.to_string()))?;
    let netmask = cidr_netmask(&network.cidr)
        .map_err(|e| MachineError::new_invalid_configuration(e.to_string()))?;
    let family = ip_family_of_cidrs(&[network.cidr.clone()])
        .map_err(|e| MachineError::new_invalid_configuration(e.to_string()))?;

    let mut lines = vec![
        "DEVICE=eth0".to_string(),
        "BOOTPROTO=none".to_string(),
        "ONBOOT=yes".to_string(),
        format!("IPADDR={}", cidr.addr()),
        format!("NETMASK={netmask}"),
        format!("GATEWAY={}", network.gateway),
    ];
    if family.has_ipv6() {
        lines.push("IPV6INIT=yes".to_string());
    }
    for (index, server) in network.dns.servers.iter().enumerate() {
        lines.push(format!("DNS{}={server}", index + 1));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

/// The same, wrapped as a write_files entry for the cloud-init skeleton.
pub fn ifcfg_write_files_entry(network: &NetworkConfig) -> Result<String, MachineError> {
    let content = ifcfg_static_network(network)?;
    let indented = content
        .lines()
        .map(|line| {
            if line.is_empty() {
                line.to_string()
            } else {
                format!("    {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    Ok(format!(
        "\n- path: /etc/sysconfig/network-scripts/ifcfg-eth0\n  content: |\n{indented}"
    ))
}

/// sshd config addendum for clusters running an SSH CA; empty when none is
/// configured.
pub fn ssh_config_addendum(ca_public_key: Option<&str>) -> String {
    match ca_public_key {
        Some(_) => r#"TrustedUserCAKeys /etc/ssh/trusted_user_ca_keys.pub
"#
        .to_string(),
        None => String::new(),
    }
}

/// Environment entries rendered into /etc/environment and the systemd proxy
/// drop-ins; empty when no proxy is configured.
pub fn proxy_environment(http_proxy: Option<&str>, no_proxy: Option<&str>) -> String {
    let mut lines = vec![];

    if let Some(http_proxy) = http_proxy {
        if !http_proxy.is_empty() {
            lines.push(format!("HTTP_PROXY={http_proxy}"));
            lines.push(format!("http_proxy={http_proxy}"));
            lines.push(format!("HTTPS_PROXY={http_proxy}"));
            lines.push(format!("https_proxy={http_proxy}"));
        }
    }

    if let Some(no_proxy) = no_proxy {
        if !no_proxy.is_empty() {
            lines.push(format!("NO_PROXY={no_proxy}"));
            lines.push(format!("no_proxy={no_proxy}"));
        }
    }

    if lines.is_empty() {
        return String::new();
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crictl_version_follows_kubelet_minor() {
        // execute & verify:
        assert_eq!(crictl_version("1.29.4").unwrap(), "v1.29.0");
        assert_eq!(crictl_version("v1.31.0").unwrap(), "v1.31.0");
        assert!(crictl_version("latest").is_err());
    }

    #[test]
    fn test_safe_download_binaries_script_verifies_checksums() {
        // execute:
        let script = safe_download_binaries_script("1.29.4").unwrap();

        // verify:
        assert!(script.contains("KUBE_VERSION:-v1.29.4"));
        assert!(script.contains("CRI_TOOLS_RELEASE:-v1.29.0"));
        assert!(script.contains("sha256sum -c"));
        assert!(script.contains("HOST_ARCH"));
        assert!(script.contains("uname -m"));
        assert!(script.contains("/opt/bin"));
        assert!(script.contains("/usr/local/bin"));
    }

    #[test]
    fn test_kernel_settings_per_family() {
        // execute:
        let v4_only = kernel_settings(IpFamily::IPv4);
        let dual = kernel_settings(IpFamily::DualStack);

        // verify:
        assert!(v4_only.contains("net.bridge.bridge-nf-call-iptables = 1"));
        assert!(!v4_only.contains("ip6tables"));
        assert!(dual.contains("net.bridge.bridge-nf-call-ip6tables = 1"));
        assert!(dual.contains("net.ipv6.conf.all.forwarding = 1"));
    }

    #[test]
    fn test_proxy_environment() {
        // execute & verify:
        assert_eq!(proxy_environment(None, None), "");

        let env = proxy_environment(Some("http://proxy:3128"), Some("10.0.0.0/8,cluster.local"));
        assert!(env.contains("HTTP_PROXY=http://proxy:3128"));
        assert!(env.contains("https_proxy=http://proxy:3128"));
        assert!(env.contains("NO_PROXY=10.0.0.0/8,cluster.local"));
    }

    #[test]
    fn test_health_check_units_target_their_service() {
        // execute & verify:
        assert!(kubelet_health_check_systemd_unit().contains("health-monitor.sh kubelet"));
        let unit = container_runtime_health_check_systemd_unit(ContainerRuntimeKind::Containerd);
        assert!(unit.contains("Requires=containerd.service"));
        assert!(unit.contains("health-monitor.sh container-runtime"));
    }

    #[test]
    fn test_ifcfg_static_network() {
        // setup:
        use crate::machine::DnsConfig;
        let network = NetworkConfig {
            cidr: "10.10.10.5/24".to_string(),
            gateway: "10.10.10.1".to_string(),
            dns: DnsConfig {
                servers: vec!["10.10.10.2".to_string(), "10.10.10.3".to_string()],
            },
        };

        // execute:
        let ifcfg = ifcfg_static_network(&network).unwrap();

        // verify:
        assert!(ifcfg.contains("IPADDR=10.10.10.5"));
        assert!(ifcfg.contains("NETMASK=255.255.255.0"));
        assert!(ifcfg.contains("GATEWAY=10.10.10.1"));
        assert!(ifcfg.contains("DNS1=10.10.10.2"));
        assert!(ifcfg.contains("DNS2=10.10.10.3"));
        assert!(!ifcfg.contains("IPV6INIT"));

        // execute & verify: a bogus CIDR is a terminal misconfiguration
        let broken = NetworkConfig {
            cidr: "not-a-cidr".to_string(),
            gateway: String::new(),
            dns: DnsConfig::default(),
        };
        assert!(ifcfg_static_network(&broken).unwrap_err().is_terminal());
    }

    #[test]
    fn test_setup_net_env_dual_stack_joins_families() {
        // execute:
        let script = setup_net_env_script(IpFamily::DualStack);

        // verify:
        assert!(script.contains("$default_ipv4,$default_ipv6"));
    }
}
