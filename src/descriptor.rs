// Provider descriptor store
// Static policy for every known supplier. Readers always see a complete snapshot;
// reload() builds a new snapshot and swaps it in one step.

use crate::config::ConfigError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Provider not found: {0}")]
    NotFound(String),
}

// Inventory families a supplier can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Hotel,
    Flight,
    Activity,
    Car,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Hotel,
        ServiceType::Flight,
        ServiceType::Activity,
        ServiceType::Car,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Hotel => "hotel",
            ServiceType::Flight => "flight",
            ServiceType::Activity => "activity",
            ServiceType::Car => "car",
        }
    }

    // Dense index, used for per-service-type counters
    pub fn index(&self) -> usize {
        match self {
            ServiceType::Hotel => 0,
            ServiceType::Flight => 1,
            ServiceType::Activity => 2,
            ServiceType::Car => 3,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hotel" | "hotels" => Ok(ServiceType::Hotel),
            "flight" | "flights" => Ok(ServiceType::Flight),
            "activity" | "activities" => Ok(ServiceType::Activity),
            "car" | "cars" => Ok(ServiceType::Car),
            other => Err(format!("unknown service type '{}'", other)),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

// Identity and static routing policy for one supplier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub display_name: String,
    pub service_types: BTreeSet<ServiceType>,
    #[serde(default)]
    pub supported_regions: BTreeSet<String>,
    // Lower is tried first
    pub priority: i32,
    #[serde(default)]
    pub eco_rating: u8,
    #[serde(default)]
    pub fee_transparency_score: u8,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(
        default = "default_timeout",
        rename = "default_timeout_secs",
        with = "duration_secs"
    )]
    pub default_timeout: Duration,
    // Registry key of the adapter constructor, defaults to the provider id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
}

impl ProviderDescriptor {
    pub fn new(id: &str, priority: i32, service_types: &[ServiceType]) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            service_types: service_types.iter().copied().collect(),
            supported_regions: BTreeSet::new(),
            priority,
            eco_rating: 0,
            fee_transparency_score: 0,
            is_active: true,
            default_timeout: default_timeout(),
            adapter: None,
        }
    }

    pub fn with_regions(mut self, regions: &[&str]) -> Self {
        self.supported_regions = regions.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_scores(mut self, eco_rating: u8, fee_transparency_score: u8) -> Self {
        self.eco_rating = eco_rating;
        self.fee_transparency_score = fee_transparency_score;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_adapter(mut self, adapter: &str) -> Self {
        self.adapter = Some(adapter.to_string());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn adapter_key(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.id)
    }

    // Capability filter: service type must match, and the region too when one is requested
    pub fn supports(&self, service_type: ServiceType, region: Option<&str>) -> bool {
        if !self.service_types.contains(&service_type) {
            return false;
        }
        region.map_or(true, |r| self.supported_regions.contains(r))
    }
}

pub fn capability_filter<'a>(
    descriptors: impl IntoIterator<Item = &'a Arc<ProviderDescriptor>>,
    service_type: ServiceType,
    region: Option<&str>,
) -> Vec<Arc<ProviderDescriptor>> {
    descriptors
        .into_iter()
        .filter(|d| d.is_active && d.supports(service_type, region))
        .cloned()
        .collect()
}

pub fn validate_descriptors(descriptors: &[ProviderDescriptor]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for d in descriptors {
        if d.id.trim().is_empty() {
            return Err(ConfigError::Invalid("provider id must not be empty".into()));
        }
        if !seen.insert(d.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate provider id '{}'",
                d.id
            )));
        }
        if d.service_types.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "provider '{}' declares no service type",
                d.id
            )));
        }
        if d.eco_rating > 100 || d.fee_transparency_score > 100 {
            return Err(ConfigError::Invalid(format!(
                "provider '{}' scores must be within 0-100",
                d.id
            )));
        }
        if d.default_timeout.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "provider '{}' timeout must be greater than zero",
                d.id
            )));
        }
    }
    Ok(())
}

// Immutable, published set of descriptors
#[derive(Debug, Default)]
pub struct DescriptorSnapshot {
    version: u64,
    descriptors: Vec<Arc<ProviderDescriptor>>,
    by_id: HashMap<String, usize>,
}

impl DescriptorSnapshot {
    fn build(version: u64, descriptors: Vec<ProviderDescriptor>) -> Self {
        let descriptors: Vec<Arc<ProviderDescriptor>> =
            descriptors.into_iter().map(Arc::new).collect();
        let by_id = descriptors
            .iter()
            .enumerate()
            .map(|(idx, d)| (d.id.clone(), idx))
            .collect();
        Self {
            version,
            descriptors,
            by_id,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn all(&self) -> &[Arc<ProviderDescriptor>] {
        &self.descriptors
    }

    // Active descriptors in configuration order
    pub fn active(&self) -> impl Iterator<Item = &Arc<ProviderDescriptor>> {
        self.descriptors.iter().filter(|d| d.is_active)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ProviderDescriptor>> {
        self.by_id.get(id).map(|&idx| &self.descriptors[idx])
    }
}

pub struct DescriptorStore {
    current: RwLock<Arc<DescriptorSnapshot>>,
}

impl DescriptorStore {
    pub fn new(descriptors: Vec<ProviderDescriptor>) -> Result<Self, ConfigError> {
        validate_descriptors(&descriptors)?;
        Ok(Self {
            current: RwLock::new(Arc::new(DescriptorSnapshot::build(1, descriptors))),
        })
    }

    pub fn snapshot(&self) -> Arc<DescriptorSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn list_active(&self) -> Vec<Arc<ProviderDescriptor>> {
        self.snapshot().active().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<Arc<ProviderDescriptor>, StoreError> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    // Validates first, a rejected reload leaves the current snapshot in place
    pub fn reload(&self, descriptors: Vec<ProviderDescriptor>) -> Result<u64, ConfigError> {
        validate_descriptors(&descriptors)?;
        let mut current = self.current.write();
        let version = current.version() + 1;
        let count = descriptors.len();
        *current = Arc::new(DescriptorSnapshot::build(version, descriptors));
        info!(version, providers = count, "Provider descriptors reloaded");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn sample() -> Vec<ProviderDescriptor> {
        vec![
            ProviderDescriptor::new("amadeus", 10, &[ServiceType::Flight, ServiceType::Hotel])
                .with_regions(&["EU", "NA"]),
            ProviderDescriptor::new("hotelbeds", 20, &[ServiceType::Hotel]).with_regions(&["EU"]),
            ProviderDescriptor::new("viator", 30, &[ServiceType::Activity]).inactive(),
        ]
    }

    #[test]
    fn test_list_active_skips_inactive_and_keeps_order() {
        let store = DescriptorStore::new(sample()).unwrap();
        let ids: Vec<String> = store.list_active().iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["amadeus", "hotelbeds"]);
    }

    #[test]
    fn test_get_unknown_provider_is_not_found() {
        let store = DescriptorStore::new(sample()).unwrap();
        assert!(store.get("viator").is_ok());
        assert_eq!(
            store.get("sabre").unwrap_err(),
            StoreError::NotFound("sabre".to_string())
        );
    }

    #[test]
    fn test_reload_swaps_snapshot_without_touching_held_one() {
        let store = DescriptorStore::new(sample()).unwrap();
        let before = store.snapshot();

        let version = store
            .reload(vec![ProviderDescriptor::new("sabre", 5, &[ServiceType::Flight])])
            .unwrap();
        assert_eq!(version, 2);

        // The old snapshot is still complete for whoever holds it
        assert_eq!(before.all().len(), 3);
        assert!(before.get("amadeus").is_some());

        let after = store.snapshot();
        assert_eq!(after.all().len(), 1);
        assert!(store.get("amadeus").is_err());
    }

    #[test]
    fn test_rejected_reload_keeps_current_snapshot() {
        let store = DescriptorStore::new(sample()).unwrap();
        let duplicate = vec![
            ProviderDescriptor::new("a", 1, &[ServiceType::Car]),
            ProviderDescriptor::new("a", 2, &[ServiceType::Car]),
        ];
        assert!(store.reload(duplicate).is_err());
        assert_eq!(store.snapshot().version(), 1);
        assert_eq!(store.list_active().len(), 2);
    }

    #[test_case(ServiceType::Hotel, None, true; "hotel any region")]
    #[test_case(ServiceType::Hotel, Some("EU"), true; "hotel in supported region")]
    #[test_case(ServiceType::Hotel, Some("APAC"), false; "hotel in unsupported region")]
    #[test_case(ServiceType::Car, None, false; "unsupported service type")]
    fn test_supports(service_type: ServiceType, region: Option<&str>, expected: bool) {
        let d = ProviderDescriptor::new("amadeus", 10, &[ServiceType::Flight, ServiceType::Hotel])
            .with_regions(&["EU", "NA"]);
        assert_eq!(d.supports(service_type, region), expected);
    }

    #[test]
    fn test_capability_filter_excludes_inactive() {
        let store = DescriptorStore::new(sample()).unwrap();
        let snapshot = store.snapshot();

        let hotels = capability_filter(snapshot.all(), ServiceType::Hotel, Some("EU"));
        assert_eq!(hotels.len(), 2);

        let activities = capability_filter(snapshot.all(), ServiceType::Activity, None);
        assert!(activities.is_empty());
    }

    #[test_case(ProviderDescriptor::new(" ", 1, &[ServiceType::Hotel]); "empty id")]
    #[test_case(ProviderDescriptor::new("x", 1, &[]); "no service type")]
    #[test_case(
        ProviderDescriptor::new("x", 1, &[ServiceType::Hotel]).with_scores(101, 0);
        "eco out of range"
    )]
    #[test_case(
        ProviderDescriptor::new("x", 1, &[ServiceType::Hotel]).with_timeout(Duration::ZERO);
        "zero timeout"
    )]
    fn test_validation_rejects(descriptor: ProviderDescriptor) {
        assert!(matches!(
            validate_descriptors(&[descriptor]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_descriptor_json_defaults() {
        let json = r#"{
            "id": "hotelbeds",
            "display_name": "HotelBeds",
            "service_types": ["hotel", "activity"],
            "priority": 20
        }"#;
        let d: ProviderDescriptor = serde_json::from_str(json).unwrap();
        assert!(d.is_active);
        assert_eq!(d.default_timeout, Duration::from_secs(30));
        assert_eq!(d.adapter_key(), "hotelbeds");
        assert!(d.supported_regions.is_empty());
        assert!(d.service_types.contains(&ServiceType::Activity));
    }

    #[test]
    fn test_service_type_parsing() {
        assert_eq!("Hotels".parse::<ServiceType>(), Ok(ServiceType::Hotel));
        assert_eq!("car".parse::<ServiceType>(), Ok(ServiceType::Car));
        assert!("cruise".parse::<ServiceType>().is_err());
        assert_eq!(ServiceType::Flight.to_string(), "flight");
    }
}
