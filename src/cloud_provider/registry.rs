use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::cloud_provider::cache::{CachedValidationProvider, VALIDATION_CACHE_TTL, ValidationCache};
use crate::cloud_provider::{Kind, Provider};
use crate::config::ConfigVarResolver;
use crate::errors::MachineError;

type Constructor = fn(ConfigVarResolver) -> Arc<dyn Provider>;

/// ProviderRegistry: maps a cloud-provider tag to a driver constructor and
/// hands out drivers wrapped in the shared validation cache.
pub struct ProviderRegistry {
    constructors: HashMap<Kind, Constructor>,
    validation_cache: Arc<ValidationCache>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let mut registry = ProviderRegistry {
            constructors: HashMap::new(),
            validation_cache: Arc::new(ValidationCache::new(VALIDATION_CACHE_TTL)),
        };

        registry.register(Kind::Alibaba, |r| Arc::new(super::alibaba::AlibabaProvider::new(r)));
        registry.register(Kind::Aws, |r| Arc::new(super::aws::AwsProvider::new(r)));
        registry.register(Kind::Azure, |r| Arc::new(super::azure::AzureProvider::new(r)));
        registry.register(Kind::Digitalocean, |r| {
            Arc::new(super::digitalocean::DigitaloceanProvider::new(r))
        });
        registry.register(Kind::Equinixmetal, |r| {
            Arc::new(super::equinixmetal::EquinixMetalProvider::new(r))
        });
        registry.register(Kind::Fake, |r| Arc::new(super::fake::FakeProvider::new(r)));
        registry.register(Kind::Gcp, |r| Arc::new(super::gcp::GcpProvider::new(r)));
        registry.register(Kind::Hetzner, |r| Arc::new(super::hetzner::HetznerProvider::new(r)));
        registry.register(Kind::Kubevirt, |r| Arc::new(super::kubevirt::KubevirtProvider::new(r)));
        registry.register(Kind::Linode, |r| Arc::new(super::linode::LinodeProvider::new(r)));
        registry.register(Kind::Nutanix, |r| Arc::new(super::nutanix::NutanixProvider::new(r)));
        registry.register(Kind::Openstack, |r| {
            Arc::new(super::openstack::OpenstackProvider::new(r))
        });
        registry.register(Kind::Packet, |r| {
            Arc::new(super::equinixmetal::EquinixMetalProvider::new_legacy_packet(r))
        });
        registry.register(Kind::Vsphere, |r| Arc::new(super::vsphere::VsphereProvider::new(r)));

        registry
    }

    pub fn register(&mut self, kind: Kind, constructor: Constructor) {
        self.constructors.insert(kind, constructor);
    }

    pub fn for_provider(&self, kind: Kind, resolver: ConfigVarResolver) -> Result<Arc<dyn Provider>, MachineError> {
        let constructor = self
            .constructors
            .get(&kind)
            .ok_or_else(|| MachineError::ProviderNotFound(kind.to_string()))?;

        if kind == Kind::Packet {
            warn!("provider tag `packet` is deprecated, use `equinixmetal`");
        }

        Ok(Arc::new(CachedValidationProvider::new(
            constructor(resolver),
            self.validation_cache.clone(),
        )))
    }

    /// Tag-level entry point used by the outer reconciler.
    pub fn for_provider_tag(&self, tag: &str, resolver: ConfigVarResolver) -> Result<Arc<dyn Provider>, MachineError> {
        let kind = Kind::from_str(tag).map_err(|_| MachineError::ProviderNotFound(tag.to_string()))?;
        self.for_provider(kind, resolver)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemorySecretStore;

    fn resolver() -> ConfigVarResolver {
        ConfigVarResolver::new(Arc::new(InMemorySecretStore::new()))
    }

    #[test]
    fn test_every_kind_has_a_constructor() {
        // setup:
        let registry = ProviderRegistry::new();
        let kinds = vec![
            Kind::Alibaba,
            Kind::Aws,
            Kind::Azure,
            Kind::Digitalocean,
            Kind::Equinixmetal,
            Kind::Fake,
            Kind::Gcp,
            Kind::Hetzner,
            Kind::Kubevirt,
            Kind::Linode,
            Kind::Nutanix,
            Kind::Openstack,
            Kind::Packet,
            Kind::Vsphere,
        ];

        for kind in kinds {
            // execute:
            let provider = registry.for_provider(kind, resolver()).unwrap();

            // verify: the cache wrapper is transparent about the driver's kind
            assert_eq!(provider.kind(), kind);
        }
    }

    #[test]
    fn test_unknown_tag_is_a_distinct_error() {
        // setup:
        let registry = ProviderRegistry::new();

        // execute:
        let err = registry.for_provider_tag("cloudfoundry", resolver()).unwrap_err();

        // verify:
        assert!(matches!(err, MachineError::ProviderNotFound(_)));
    }
}
