use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, PostParams};
use kube::core::ObjectMeta;
use schemars::JsonSchema;
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

use crate::errors::{CommandError, MachineError};

/// GlobalSecretKeySelector: points to one key inside a secret of the control
/// cluster. This is how credentials stay out of the Machine record.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSecretKeySelector {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: String,
}

/// ConfigVarString: a leaf configuration value resolved from, in order, an
/// inline literal, a secret key reference, or an environment variable.
#[derive(Clone, Debug, Default, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigVarString {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<GlobalSecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var_name: Option<String>,
}

impl ConfigVarString {
    pub fn from_literal(value: &str) -> Self {
        ConfigVarString {
            value: value.to_string(),
            ..Default::default()
        }
    }
}

impl From<&str> for ConfigVarString {
    fn from(value: &str) -> Self {
        ConfigVarString::from_literal(value)
    }
}

// Accepts both the shorthand `"literal"` and the full object form.
impl<'de> Deserialize<'de> for ConfigVarString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Literal(String),
            Full {
                #[serde(default)]
                value: String,
                #[serde(default, rename = "secretKeyRef")]
                secret_key_ref: Option<GlobalSecretKeySelector>,
                #[serde(default, rename = "envVarName")]
                env_var_name: Option<String>,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Literal(value) => ConfigVarString {
                value,
                ..Default::default()
            },
            Repr::Full {
                value,
                secret_key_ref,
                env_var_name,
            } => ConfigVarString {
                value,
                secret_key_ref,
                env_var_name,
            },
        })
    }
}

/// ConfigVarBool: same resolution chain as ConfigVarString; the resolver also
/// reports whether any source was set at all, so explicit `false` can be told
/// apart from "use the provider default".
#[derive(Clone, Debug, Default, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigVarBool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<GlobalSecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var_name: Option<String>,
}

impl ConfigVarBool {
    pub fn from_literal(value: bool) -> Self {
        ConfigVarBool {
            value: Some(value),
            ..Default::default()
        }
    }
}

impl From<bool> for ConfigVarBool {
    fn from(value: bool) -> Self {
        ConfigVarBool::from_literal(value)
    }
}

impl<'de> Deserialize<'de> for ConfigVarBool {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Literal(bool),
            Full {
                #[serde(default)]
                value: Option<bool>,
                #[serde(default, rename = "secretKeyRef")]
                secret_key_ref: Option<GlobalSecretKeySelector>,
                #[serde(default, rename = "envVarName")]
                env_var_name: Option<String>,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Literal(value) => ConfigVarBool {
                value: Some(value),
                ..Default::default()
            },
            Repr::Full {
                value,
                secret_key_ref,
                env_var_name,
            } => ConfigVarBool {
                value,
                secret_key_ref,
                env_var_name,
            },
        })
    }
}

/// SecretStore: remote control-cluster secret access. Injected so the config
/// resolver and the bootstrap exchange never hold a kube client directly.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>, CommandError>;
    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), CommandError>;
    async fn list_secret_names_by_prefix(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, CommandError>;
}

pub struct KubeSecretStore {
    client: kube::Client,
}

impl KubeSecretStore {
    pub fn new(client: kube::Client) -> Self {
        KubeSecretStore { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>, CommandError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await.map_err(|e| {
            CommandError::new(format!("Cannot get secret `{namespace}/{name}`"), Some(e.to_string()))
        })?;

        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, ByteString(v))| (k, v))
            .collect())
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), CommandError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            ..Default::default()
        };

        api.create(&PostParams::default(), &secret).await.map_err(|e| {
            CommandError::new(format!("Cannot create secret `{namespace}/{name}`"), Some(e.to_string()))
        })?;

        Ok(())
    }

    async fn list_secret_names_by_prefix(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, CommandError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secrets = api.list(&ListParams::default()).await.map_err(|e| {
            CommandError::new(format!("Cannot list secrets in `{namespace}`"), Some(e.to_string()))
        })?;

        Ok(secrets
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .filter(|name| name.starts_with(prefix))
            .collect())
    }
}

/// In-memory store used by the fake provider and the test suite.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<HashMap<(String, String), BTreeMap<String, Vec<u8>>>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, namespace: &str, name: &str, key: &str, value: &str) -> Self {
        {
            let mut secrets = self.secrets.lock().unwrap();
            secrets
                .entry((namespace.to_string(), name.to_string()))
                .or_default()
                .insert(key.to_string(), value.as_bytes().to_vec());
        }
        self
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, Vec<u8>>, CommandError> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| CommandError::new_from_safe_message(format!("Cannot get secret `{namespace}/{name}`")))
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), CommandError> {
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }

    async fn list_secret_names_by_prefix(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, CommandError> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .keys()
            .filter(|(ns, name)| ns == namespace && name.starts_with(prefix))
            .map(|(_, name)| name.clone())
            .collect())
    }
}

/// ConfigVarResolver: pure resolution from (ConfigVar, secret store, env) to a
/// plain value. Literal wins over secret ref wins over env; any secret I/O or
/// parse failure is a terminal misconfiguration.
#[derive(Clone)]
pub struct ConfigVarResolver {
    secret_store: Arc<dyn SecretStore>,
}

impl ConfigVarResolver {
    pub fn new(secret_store: Arc<dyn SecretStore>) -> Self {
        ConfigVarResolver { secret_store }
    }

    pub async fn get_string(&self, var: &ConfigVarString) -> Result<String, MachineError> {
        if !var.value.is_empty() {
            return Ok(var.value.clone());
        }

        if let Some(selector) = &var.secret_key_ref {
            return self.string_from_secret(selector).await;
        }

        if let Some(env_var_name) = &var.env_var_name {
            return Ok(std::env::var(env_var_name).unwrap_or_default());
        }

        Ok(String::new())
    }

    /// Same as `get_string` but falls back to the given well-known environment
    /// variable when the var itself carries no source.
    pub async fn get_string_or_env(&self, var: &ConfigVarString, env_var_name: &str) -> Result<String, MachineError> {
        let value = self.get_string(var).await?;
        if !value.is_empty() {
            return Ok(value);
        }

        Ok(std::env::var(env_var_name).unwrap_or_default())
    }

    /// Returns `(value, was_set)`: `was_set` is false only when no source
    /// produced a value, letting callers apply provider defaults.
    pub async fn get_bool(&self, var: &ConfigVarBool) -> Result<(bool, bool), MachineError> {
        if let Some(value) = var.value {
            return Ok((value, true));
        }

        if let Some(selector) = &var.secret_key_ref {
            let raw = self.string_from_secret(selector).await?;
            let value = raw.trim().parse::<bool>().map_err(|_| {
                MachineError::new_invalid_configuration(format!(
                    "secret `{}/{}` key `{}` is not a bool",
                    selector.namespace, selector.name, selector.key
                ))
            })?;
            return Ok((value, true));
        }

        if let Some(env_var_name) = &var.env_var_name {
            if let Ok(raw) = std::env::var(env_var_name) {
                let value = raw.trim().parse::<bool>().map_err(|_| {
                    MachineError::new_invalid_configuration(format!(
                        "environment variable `{env_var_name}` is not a bool"
                    ))
                })?;
                return Ok((value, true));
            }
        }

        Ok((false, false))
    }

    async fn string_from_secret(&self, selector: &GlobalSecretKeySelector) -> Result<String, MachineError> {
        let data = self
            .secret_store
            .get_secret(&selector.namespace, &selector.name)
            .await
            .map_err(|e| {
                MachineError::new_invalid_configuration(format!(
                    "cannot read secret `{}/{}`: {e}",
                    selector.namespace, selector.name
                ))
            })?;

        let value = data.get(&selector.key).ok_or_else(|| {
            MachineError::new_invalid_configuration(format!(
                "secret `{}/{}` has no key `{}`",
                selector.namespace, selector.name, selector.key
            ))
        })?;

        String::from_utf8(value.clone()).map_err(|_| {
            MachineError::new_invalid_configuration(format!(
                "secret `{}/{}` key `{}` is not valid UTF-8",
                selector.namespace, selector.name, selector.key
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_with(store: InMemorySecretStore) -> ConfigVarResolver {
        ConfigVarResolver::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_literal_wins_over_secret_ref() {
        // setup:
        let resolver = resolver_with(InMemorySecretStore::new().with_secret("kube-system", "creds", "token", "from-secret"));
        let var = ConfigVarString {
            value: "from-literal".to_string(),
            secret_key_ref: Some(GlobalSecretKeySelector {
                namespace: "kube-system".to_string(),
                name: "creds".to_string(),
                key: "token".to_string(),
            }),
            env_var_name: None,
        };

        // execute & verify:
        assert_eq!(resolver.get_string(&var).await.unwrap(), "from-literal");
    }

    #[tokio::test]
    async fn test_secret_ref_resolution() {
        // setup:
        let resolver = resolver_with(InMemorySecretStore::new().with_secret("kube-system", "creds", "token", "s3cr3t"));
        let var = ConfigVarString {
            value: String::new(),
            secret_key_ref: Some(GlobalSecretKeySelector {
                namespace: "kube-system".to_string(),
                name: "creds".to_string(),
                key: "token".to_string(),
            }),
            env_var_name: None,
        };

        // execute & verify:
        assert_eq!(resolver.get_string(&var).await.unwrap(), "s3cr3t");
    }

    #[tokio::test]
    async fn test_missing_secret_key_is_terminal() {
        // setup:
        let resolver = resolver_with(InMemorySecretStore::new().with_secret("kube-system", "creds", "token", "s3cr3t"));
        let var = ConfigVarString {
            value: String::new(),
            secret_key_ref: Some(GlobalSecretKeySelector {
                namespace: "kube-system".to_string(),
                name: "creds".to_string(),
                key: "missing".to_string(),
            }),
            env_var_name: None,
        };

        // execute:
        let err = resolver.get_string(&var).await.unwrap_err();

        // verify:
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_env_fallback() {
        // setup:
        unsafe { std::env::set_var("MACHINE_ENGINE_TEST_TOKEN", "from-env") };
        let resolver = resolver_with(InMemorySecretStore::new());
        let var = ConfigVarString::default();

        // execute & verify:
        assert_eq!(
            resolver
                .get_string_or_env(&var, "MACHINE_ENGINE_TEST_TOKEN")
                .await
                .unwrap(),
            "from-env"
        );
    }

    #[tokio::test]
    async fn test_bool_was_set_semantics() {
        // setup:
        let resolver = resolver_with(InMemorySecretStore::new());

        // execute & verify: explicit false is set
        let (value, was_set) = resolver.get_bool(&ConfigVarBool::from_literal(false)).await.unwrap();
        assert!(!value);
        assert!(was_set);

        // execute & verify: unset var keeps default path open
        let (value, was_set) = resolver.get_bool(&ConfigVarBool::default()).await.unwrap();
        assert!(!value);
        assert!(!was_set);
    }

    #[test]
    fn test_config_var_string_accepts_shorthand_and_full_form() {
        // setup:
        let shorthand: ConfigVarString = serde_json::from_str("\"eu-west-1\"").unwrap();
        let full: ConfigVarString = serde_json::from_str(
            "{\"secretKeyRef\": {\"namespace\": \"kube-system\", \"name\": \"creds\", \"key\": \"region\"}}",
        )
        .unwrap();

        // verify:
        assert_eq!(shorthand.value, "eu-west-1");
        assert_eq!(full.secret_key_ref.unwrap().key, "region");
    }
}
