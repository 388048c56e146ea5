use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cloud_provider::{Instance, Kind, Provider, ProviderData};
use crate::errors::{CommandError, MachineError};
use crate::machine::{Machine, MachineSpec};
use crate::utilities::calculate_hash;

pub const VALIDATION_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

struct CacheEntry {
    inserted_at: Instant,
    result: Result<(), MachineError>,
}

/// ValidationCache: TTL-bounded memoization of `validate` results, keyed by a
/// fingerprint of the raw provider spec. Credentials are referenced, not
/// resolved, inside that spec, so no secret material enters the key. Negative
/// results are cached too. The one async mutex makes the miss path
/// single-flight: within a TTL at most one cloud call is issued per spec.
pub struct ValidationCache {
    ttl: Duration,
    entries: Mutex<HashMap<u64, CacheEntry>>,
}

impl ValidationCache {
    pub fn new(ttl: Duration) -> Self {
        ValidationCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn fingerprint(spec: &MachineSpec) -> Result<u64, MachineError> {
        let serialized = serde_json::to_string(&spec.provider_spec).map_err(CommandError::from)?;
        Ok(calculate_hash(&serialized))
    }

    pub async fn validate_through(&self, spec: &MachineSpec, inner: &dyn Provider) -> Result<(), MachineError> {
        let key = Self::fingerprint(spec)?;

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return entry.result.clone();
            }
        }

        // still holding the lock: concurrent misses collapse into one call
        let result = inner.validate(spec).await;
        entries.insert(
            key,
            CacheEntry {
                inserted_at: Instant::now(),
                result: result.clone(),
            },
        );

        result
    }
}

/// Transparent wrapper handed out by the registry: callers see the Provider
/// contract, only `validate` is memoized.
pub struct CachedValidationProvider {
    inner: Arc<dyn Provider>,
    cache: Arc<ValidationCache>,
}

impl CachedValidationProvider {
    pub fn new(inner: Arc<dyn Provider>, cache: Arc<ValidationCache>) -> Self {
        CachedValidationProvider { inner, cache }
    }
}

#[async_trait]
impl Provider for CachedValidationProvider {
    fn kind(&self) -> Kind {
        self.inner.kind()
    }

    fn add_defaults(&self, spec: MachineSpec) -> Result<MachineSpec, MachineError> {
        self.inner.add_defaults(spec)
    }

    async fn validate(&self, spec: &MachineSpec) -> Result<(), MachineError> {
        self.cache.validate_through(spec, self.inner.as_ref()).await
    }

    async fn get_cloud_config(&self, spec: &MachineSpec) -> Result<(String, String), MachineError> {
        self.inner.get_cloud_config(spec).await
    }

    async fn create(
        &self,
        machine: &Machine,
        data: &ProviderData,
        userdata: &str,
    ) -> Result<Instance, MachineError> {
        self.inner.create(machine, data, userdata).await
    }

    async fn get(&self, machine: &Machine, data: &ProviderData) -> Result<Instance, MachineError> {
        self.inner.get(machine, data).await
    }

    async fn cleanup(&self, machine: &Machine, data: &ProviderData) -> Result<bool, MachineError> {
        self.inner.cleanup(machine, data).await
    }

    async fn migrate_uid(&self, machine: &Machine, data: &ProviderData, new_uid: &str) -> Result<(), MachineError> {
        self.inner.migrate_uid(machine, data, new_uid).await
    }

    fn machine_metrics_labels(&self, machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
        self.inner.machine_metrics_labels(machine)
    }

    async fn set_metrics_for_machines(&self, machines: &[Machine]) -> Result<(), MachineError> {
        self.inner.set_metrics_for_machines(machines).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::test_helpers;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        validate_calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        fn kind(&self) -> Kind {
            Kind::Fake
        }

        fn add_defaults(&self, spec: MachineSpec) -> Result<MachineSpec, MachineError> {
            Ok(spec)
        }

        async fn validate(&self, _spec: &MachineSpec) -> Result<(), MachineError> {
            self.validate_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(MachineError::new_invalid_configuration("boom".to_string()))
            } else {
                Ok(())
            }
        }

        async fn get_cloud_config(&self, _spec: &MachineSpec) -> Result<(String, String), MachineError> {
            Ok((String::new(), String::new()))
        }

        async fn create(
            &self,
            _machine: &Machine,
            _data: &ProviderData,
            _userdata: &str,
        ) -> Result<Instance, MachineError> {
            unimplemented!()
        }

        async fn get(&self, machine: &Machine, _data: &ProviderData) -> Result<Instance, MachineError> {
            Err(MachineError::InstanceNotFound(machine.machine_name()))
        }

        async fn cleanup(&self, _machine: &Machine, _data: &ProviderData) -> Result<bool, MachineError> {
            Ok(true)
        }

        async fn migrate_uid(
            &self,
            _machine: &Machine,
            _data: &ProviderData,
            _new_uid: &str,
        ) -> Result<(), MachineError> {
            Ok(())
        }

        fn machine_metrics_labels(&self, _machine: &Machine) -> Result<BTreeMap<String, String>, MachineError> {
            Ok(BTreeMap::new())
        }

        async fn set_metrics_for_machines(&self, _machines: &[Machine]) -> Result<(), MachineError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_validate_is_memoized_within_ttl() {
        // setup:
        let inner = Arc::new(CountingProvider {
            validate_calls: AtomicU32::new(0),
            fail: false,
        });
        let cached = CachedValidationProvider::new(inner.clone(), Arc::new(ValidationCache::new(VALIDATION_CACHE_TTL)));
        let machine = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({"region": "fra1"}));

        // execute:
        for _ in 0..5 {
            cached.validate(&machine.spec).await.unwrap();
        }

        // verify:
        assert_eq!(inner.validate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_results_are_cached() {
        // setup:
        let inner = Arc::new(CountingProvider {
            validate_calls: AtomicU32::new(0),
            fail: true,
        });
        let cached = CachedValidationProvider::new(inner.clone(), Arc::new(ValidationCache::new(VALIDATION_CACHE_TTL)));
        let machine = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({"region": "fra1"}));

        // execute:
        for _ in 0..3 {
            assert!(cached.validate(&machine.spec).await.is_err());
        }

        // verify:
        assert_eq!(inner.validate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spec_change_resets_the_cache_key() {
        // setup:
        let inner = Arc::new(CountingProvider {
            validate_calls: AtomicU32::new(0),
            fail: false,
        });
        let cached = CachedValidationProvider::new(inner.clone(), Arc::new(ValidationCache::new(VALIDATION_CACHE_TTL)));
        let machine_a = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({"region": "fra1"}));
        let machine_b = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({"region": "nbg1"}));

        // execute:
        cached.validate(&machine_a.spec).await.unwrap();
        cached.validate(&machine_b.spec).await.unwrap();

        // verify:
        assert_eq!(inner.validate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_validates_issue_one_call() {
        // setup:
        let inner = Arc::new(CountingProvider {
            validate_calls: AtomicU32::new(0),
            fail: false,
        });
        let cached = Arc::new(CachedValidationProvider::new(
            inner.clone(),
            Arc::new(ValidationCache::new(VALIDATION_CACHE_TTL)),
        ));
        let machine = test_helpers::machine("node-1", "abc", Kind::Fake, serde_json::json!({"region": "fra1"}));

        // execute:
        let mut handles = vec![];
        for _ in 0..8 {
            let cached = cached.clone();
            let spec = machine.spec.clone();
            handles.push(tokio::spawn(async move { cached.validate(&spec).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // verify:
        assert_eq!(inner.validate_calls.load(Ordering::SeqCst), 1);
    }
}
