/// Skeleton shared by every cloud-init based renderer. Each OS contributes
/// its own `setup_script` and optional `os_extra_files` entries; everything
/// else is common node plumbing.
pub(crate) const TEMPLATE: &str = r#"#cloud-config
{%- if set_hostname and machine_name %}
hostname: {{ machine_name }}
{%- endif %}
ssh_pwauth: false
{%- if ssh_public_keys %}
ssh_authorized_keys:
{%- for key in ssh_public_keys %}
- "{{ key }}"
{%- endfor %}
{%- endif %}
write_files:
- path: /etc/systemd/journald.conf.d/max_disk_use.conf
  content: |
{{ journald_config | indent(prefix="    ") }}
- path: /opt/load-kernel-modules.sh
  permissions: "0755"
  content: |
{{ kernel_modules_script | indent(prefix="    ") }}
- path: /etc/sysctl.d/k8s.conf
  content: |
{{ kernel_settings | indent(prefix="    ") }}
- path: /opt/disable-swap.sh
  permissions: "0755"
  content: |
{{ disable_swap_script | indent(prefix="    ") }}
- path: /opt/bin/setup_net_env.sh
  permissions: "0755"
  content: |
{{ setup_net_env_script | indent(prefix="    ") }}
- path: /opt/bin/download.sh
  permissions: "0755"
  content: |
{{ safe_download_binaries_script | indent(prefix="    ") }}
- path: /opt/bin/health-monitor.sh
  permissions: "0755"
  content: |
{{ health_monitor_script | indent(prefix="    ") }}
{%- if proxy_environment %}
- path: /etc/environment
  content: |
{{ proxy_environment | indent(prefix="    ") }}
{%- endif %}
{%- if ssh_ca_public_key %}
- path: /etc/ssh/trusted_user_ca_keys.pub
  content: |
{{ ssh_ca_public_key | indent(prefix="    ") }}
- path: /etc/ssh/sshd_config.d/trusted-ca.conf
  content: |
{{ ssh_config_addendum | indent(prefix="    ") }}
{%- endif %}
- path: /etc/systemd/system/kubelet.service
  content: |
{{ kubelet_systemd_unit | indent(prefix="    ") }}
- path: /etc/systemd/system/kubelet-healthcheck.service
  content: |
{{ kubelet_healthcheck_systemd_unit | indent(prefix="    ") }}
- path: /etc/systemd/system/{{ container_runtime_name }}-healthcheck.service
  content: |
{{ container_runtime_healthcheck_systemd_unit | indent(prefix="    ") }}
- path: {{ container_runtime_config_path }}
  content: |
{{ container_runtime_config | indent(prefix="    ") }}
{%- if container_runtime_auth_config %}
- path: {{ container_runtime_auth_config_path }}
  permissions: "0600"
  content: |
{{ container_runtime_auth_config | indent(prefix="    ") }}
{%- endif %}
- path: /etc/crictl.yaml
  content: |
{{ crictl_config | indent(prefix="    ") }}
- path: /etc/kubernetes/bootstrap-kubelet.conf
  permissions: "0600"
  content: |
{{ bootstrap_kubeconfig | indent(prefix="    ") }}
- path: /etc/kubernetes/pki/ca.crt
  content: |
{{ cluster_ca_cert | indent(prefix="    ") }}
- path: /etc/kubernetes/kubelet.conf
  content: |
{{ kubelet_configuration | indent(prefix="    ") }}
{%- if cloud_config %}
- path: /etc/kubernetes/cloud-config
  permissions: "0600"
  content: |
{{ cloud_config | indent(prefix="    ") }}
{%- endif %}
{{- os_extra_files }}
- path: /opt/bin/setup.sh
  permissions: "0755"
  content: |
{{ setup_script | indent(prefix="    ") }}
- path: /etc/systemd/system/setup.service
  permissions: "0644"
  content: |
{{ setup_service | indent(prefix="    ") }}
runcmd:
- systemctl restart setup.service
"#;
