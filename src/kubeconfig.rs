use base64::Engine;
use base64::engine::general_purpose;
use kube::config::Kubeconfig;
use url::Url;

use crate::errors::CommandError;

/// Returns the API server URL of the first cluster in a kubeconfig. The
/// bootstrap kubeconfigs handled here always carry exactly one cluster.
pub fn server_url(kubeconfig: &Kubeconfig) -> Result<Url, CommandError> {
    let cluster = kubeconfig
        .clusters
        .first()
        .and_then(|named| named.cluster.as_ref())
        .ok_or_else(|| CommandError::new_from_safe_message("Kubeconfig contains no cluster".to_string()))?;

    let server = cluster
        .server
        .as_ref()
        .ok_or_else(|| CommandError::new_from_safe_message("Kubeconfig cluster has no server".to_string()))?;

    Url::parse(server).map_err(CommandError::from)
}

/// Returns the PEM-encoded CA of the first cluster. Only inline
/// `certificate-authority-data` is accepted: a file path would reference the
/// controller host, not the node being provisioned.
pub fn cluster_ca_pem(kubeconfig: &Kubeconfig) -> Result<String, CommandError> {
    let cluster = kubeconfig
        .clusters
        .first()
        .and_then(|named| named.cluster.as_ref())
        .ok_or_else(|| CommandError::new_from_safe_message("Kubeconfig contains no cluster".to_string()))?;

    let ca_data = cluster.certificate_authority_data.as_ref().ok_or_else(|| {
        CommandError::new_from_safe_message("Kubeconfig cluster has no inline certificate-authority-data".to_string())
    })?;

    let decoded = general_purpose::STANDARD
        .decode(ca_data)
        .map_err(|e| CommandError::new("Cannot decode certificate-authority-data".to_string(), Some(e.to_string())))?;

    String::from_utf8(decoded)
        .map_err(|e| CommandError::new("certificate-authority-data is not valid UTF-8".to_string(), Some(e.to_string())))
}

/// Serializes a kubeconfig for embedding into user-data.
pub fn stringify(kubeconfig: &Kubeconfig) -> Result<String, CommandError> {
    serde_yaml::to_string(kubeconfig).map_err(CommandError::from)
}

#[cfg(test)]
pub mod test_helpers {
    use kube::config::{AuthInfo, Cluster, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext};

    pub fn bootstrap_kubeconfig(server: &str, ca_pem: &str, token: &str) -> Kubeconfig {
        use base64::Engine;
        use base64::engine::general_purpose;

        Kubeconfig {
            clusters: vec![NamedCluster {
                name: "".to_string(),
                cluster: Some(Cluster {
                    server: Some(server.to_string()),
                    certificate_authority_data: Some(general_purpose::STANDARD.encode(ca_pem)),
                    ..Default::default()
                }),
            }],
            auth_infos: vec![NamedAuthInfo {
                name: "".to_string(),
                auth_info: Some(AuthInfo {
                    token: Some(token.to_string().into()),
                    ..Default::default()
                }),
            }],
            contexts: vec![NamedContext {
                name: "".to_string(),
                context: None,
            }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_url_and_ca_extraction() {
        // setup:
        let ca = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n";
        let kubeconfig = test_helpers::bootstrap_kubeconfig("https://api.cluster.example:6443", ca, "token");

        // execute & verify:
        assert_eq!(
            server_url(&kubeconfig).unwrap().as_str(),
            "https://api.cluster.example:6443/"
        );
        assert_eq!(cluster_ca_pem(&kubeconfig).unwrap(), ca);
    }

    #[test]
    fn test_empty_kubeconfig_is_rejected() {
        // setup:
        let kubeconfig = Kubeconfig::default();

        // execute & verify:
        assert!(server_url(&kubeconfig).is_err());
        assert!(cluster_ca_pem(&kubeconfig).is_err());
    }

    #[test]
    fn test_stringify_roundtrips() {
        // setup:
        let kubeconfig = test_helpers::bootstrap_kubeconfig("https://api.cluster.example:6443", "ca", "token");

        // execute:
        let yaml = stringify(&kubeconfig).unwrap();

        // verify:
        assert!(yaml.contains("https://api.cluster.example:6443"));
        let reparsed: Kubeconfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(server_url(&reparsed).unwrap(), server_url(&kubeconfig).unwrap());
    }
}
