// Adapter registry
// Explicit map from adapter key to constructor. Credentials are resolved by the
// caller's SecretProvider before a constructor ever runs.

use crate::descriptor::ProviderDescriptor;
use crate::supplier::SupplierAdapter;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("No adapter registered for key '{0}'")]
    UnknownAdapter(String),

    #[error("No credentials available for provider '{0}'")]
    MissingCredentials(String),

    #[error("Adapter construction failed for '{provider_id}': {message}")]
    ConstructionFailed {
        provider_id: String,
        message: String,
    },
}

// Fully resolved secret material for one provider
#[derive(Clone, Default, PartialEq)]
pub struct Credentials {
    pub client_id: Option<String>,
    pub secret: String,
    pub extra: HashMap<String, String>,
}

impl Credentials {
    pub fn new(client_id: Option<&str>, secret: &str) -> Self {
        Self {
            client_id: client_id.map(str::to_string),
            secret: secret.to_string(),
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }
}

// Keeps secrets out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("secret", &"***")
            .field("extra_keys", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub trait SecretProvider: Send + Sync + 'static {
    fn resolve(&self, provider_id: &str) -> Result<Credentials, RegistryError>;
}

// In-memory secrets, mostly for tests and local runs
#[derive(Debug, Default, Clone)]
pub struct StaticSecrets {
    credentials: HashMap<String, Credentials>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider_id: &str, credentials: Credentials) -> Self {
        self.credentials.insert(provider_id.to_string(), credentials);
        self
    }
}

impl SecretProvider for StaticSecrets {
    fn resolve(&self, provider_id: &str) -> Result<Credentials, RegistryError> {
        self.credentials
            .get(provider_id)
            .cloned()
            .ok_or_else(|| RegistryError::MissingCredentials(provider_id.to_string()))
    }
}

pub type AdapterConstructor = Arc<
    dyn Fn(&ProviderDescriptor, Credentials) -> Result<Arc<dyn SupplierAdapter>, RegistryError>
        + Send
        + Sync,
>;

pub type AdapterMap = HashMap<String, Arc<dyn SupplierAdapter>>;

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    constructors: HashMap<String, AdapterConstructor>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, key: &str, constructor: F) -> Self
    where
        F: Fn(&ProviderDescriptor, Credentials) -> Result<Arc<dyn SupplierAdapter>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(key.to_string(), Arc::new(constructor));
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.constructors.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn build(
        &self,
        descriptor: &ProviderDescriptor,
        secrets: &dyn SecretProvider,
    ) -> Result<Arc<dyn SupplierAdapter>, RegistryError> {
        let key = descriptor.adapter_key();
        let constructor = self
            .constructors
            .get(key)
            .ok_or_else(|| RegistryError::UnknownAdapter(key.to_string()))?;
        let credentials = secrets.resolve(&descriptor.id)?;
        let adapter = constructor(descriptor, credentials)?;
        debug!(provider_id = %descriptor.id, adapter = key, "Built supplier adapter");
        Ok(adapter)
    }

    // Builds every descriptor it can; failures are returned next to the adapters
    pub fn build_all<'a>(
        &self,
        descriptors: impl IntoIterator<Item = &'a ProviderDescriptor>,
        secrets: &dyn SecretProvider,
    ) -> (AdapterMap, Vec<(String, RegistryError)>) {
        let mut adapters = AdapterMap::new();
        let mut failures = Vec::new();
        for descriptor in descriptors {
            match self.build(descriptor, secrets) {
                Ok(adapter) => {
                    adapters.insert(descriptor.id.clone(), adapter);
                }
                Err(e) => {
                    warn!(provider_id = %descriptor.id, error = %e, "Supplier adapter unavailable");
                    failures.push((descriptor.id.clone(), e));
                }
            }
        }
        (adapters, failures)
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ServiceType;
    use crate::supplier::mock_supplier::{MockBehavior, MockSupplier};

    fn registry() -> AdapterRegistry {
        AdapterRegistry::new()
            .register("mock", |descriptor, _credentials| {
                Ok(Arc::new(MockSupplier::new(&descriptor.id, MockBehavior::Items(1)))
                    as Arc<dyn SupplierAdapter>)
            })
            .register("strict", |descriptor, credentials| {
                if credentials.client_id.is_none() {
                    return Err(RegistryError::ConstructionFailed {
                        provider_id: descriptor.id.clone(),
                        message: "client id required".to_string(),
                    });
                }
                Ok(Arc::new(MockSupplier::new(&descriptor.id, MockBehavior::Empty))
                    as Arc<dyn SupplierAdapter>)
            })
    }

    #[test]
    fn test_build_uses_adapter_key_and_provider_credentials() {
        let secrets = StaticSecrets::new().with("amadeus", Credentials::new(None, "s3cret"));
        let descriptor =
            ProviderDescriptor::new("amadeus", 10, &[ServiceType::Flight]).with_adapter("mock");

        let adapter = registry().build(&descriptor, &secrets).unwrap();
        assert_eq!(adapter.provider_id(), "amadeus");
    }

    #[test]
    fn test_build_errors() {
        let secrets = StaticSecrets::new().with("sabre", Credentials::new(None, "s3cret"));
        let registry = registry();

        let unknown = ProviderDescriptor::new("sabre", 10, &[ServiceType::Flight]);
        assert_eq!(
            registry.build(&unknown, &secrets).err(),
            Some(RegistryError::UnknownAdapter("sabre".to_string()))
        );

        let no_secret =
            ProviderDescriptor::new("travelport", 10, &[ServiceType::Flight]).with_adapter("mock");
        assert_eq!(
            registry.build(&no_secret, &secrets).err(),
            Some(RegistryError::MissingCredentials("travelport".to_string()))
        );

        let strict =
            ProviderDescriptor::new("sabre", 10, &[ServiceType::Flight]).with_adapter("strict");
        assert!(matches!(
            registry.build(&strict, &secrets),
            Err(RegistryError::ConstructionFailed { .. })
        ));
    }

    #[test]
    fn test_build_all_collects_failures() {
        let secrets = StaticSecrets::new()
            .with("a", Credentials::new(Some("id"), "x"))
            .with("b", Credentials::new(None, "x"));
        let descriptors = vec![
            ProviderDescriptor::new("a", 1, &[ServiceType::Hotel]).with_adapter("strict"),
            ProviderDescriptor::new("b", 2, &[ServiceType::Hotel]).with_adapter("strict"),
            ProviderDescriptor::new("c", 3, &[ServiceType::Hotel]).with_adapter("mock"),
        ];

        let (adapters, failures) = registry().build_all(&descriptors, &secrets);
        assert_eq!(adapters.len(), 1);
        assert!(adapters.contains_key("a"));
        let failed: Vec<&str> = failures.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(failed, vec!["b", "c"]);
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let credentials = Credentials::new(Some("client"), "top-secret").with_extra("pcc", "X1");
        let printed = format!("{:?}", credentials);
        assert!(!printed.contains("top-secret"));
        assert!(printed.contains("client"));
        assert_eq!(registry().keys(), vec!["mock", "strict"]);
    }
}
