// Rotation Selector
// Orders the capable, healthy providers for a request. Selection reads the current
// descriptor snapshot and health state only; it never calls a supplier.

use crate::descriptor::{
    capability_filter, DescriptorSnapshot, DescriptorStore, ProviderDescriptor, ServiceType,
};
use crate::health::HealthTracker;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

// Ordered dispatch plan for one request
#[derive(Debug, Clone, Default)]
pub struct SelectionPlan {
    pub providers: Vec<Arc<ProviderDescriptor>>,
    // Nothing eligible, so the best-priority capable provider was chosen regardless of health
    pub last_resort: bool,
}

impl SelectionPlan {
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|d| d.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

// Ranking comparator; sort_by is stable so equal keys keep configuration order
pub fn compare_providers(
    a: &ProviderDescriptor,
    b: &ProviderDescriptor,
    eco_priority: bool,
) -> CmpOrdering {
    if eco_priority {
        b.eco_rating
            .cmp(&a.eco_rating)
            .then_with(|| a.priority.cmp(&b.priority))
            .then_with(|| b.fee_transparency_score.cmp(&a.fee_transparency_score))
    } else {
        a.priority.cmp(&b.priority)
    }
}

pub fn rank(providers: &mut [Arc<ProviderDescriptor>], eco_priority: bool) {
    providers.sort_by(|a, b| compare_providers(a, b, eco_priority));
}

pub struct RotationSelector {
    store: Arc<DescriptorStore>,
    health: Arc<HealthTracker>,
    // One counter per ServiceType::index()
    rotation_counters: [AtomicUsize; 4],
}

impl RotationSelector {
    pub fn new(store: Arc<DescriptorStore>, health: Arc<HealthTracker>) -> Self {
        Self {
            store,
            health,
            rotation_counters: Default::default(),
        }
    }

    pub fn plan(
        &self,
        service_type: ServiceType,
        region: Option<&str>,
        eco_priority: bool,
    ) -> SelectionPlan {
        self.plan_in(&self.store.snapshot(), service_type, region, eco_priority)
    }

    // Plans against a snapshot the caller already holds
    pub fn plan_in(
        &self,
        snapshot: &DescriptorSnapshot,
        service_type: ServiceType,
        region: Option<&str>,
        eco_priority: bool,
    ) -> SelectionPlan {
        let capable = capability_filter(snapshot.all(), service_type, region);

        let mut eligible: Vec<Arc<ProviderDescriptor>> = capable
            .iter()
            .filter(|d| self.health.is_eligible(&d.id))
            .cloned()
            .collect();

        if !eligible.is_empty() {
            rank(&mut eligible, eco_priority);
            debug!(
                service_type = %service_type,
                region = region.unwrap_or("*"),
                eco_priority,
                providers = ?eligible.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
                "Selected providers"
            );
            return SelectionPlan {
                providers: eligible,
                last_resort: false,
            };
        }

        // min_by_key returns the first of equal minimums, keeping config order on ties
        match capable.into_iter().min_by_key(|d| d.priority) {
            Some(best) => {
                warn!(
                    service_type = %service_type,
                    provider_id = %best.id,
                    "No eligible provider, falling back to last-resort attempt"
                );
                SelectionPlan {
                    providers: vec![best],
                    last_resort: true,
                }
            }
            None => SelectionPlan::default(),
        }
    }

    pub fn select(
        &self,
        service_type: ServiceType,
        region: Option<&str>,
        eco_priority: bool,
    ) -> Vec<String> {
        self.plan(service_type, region, eco_priority).provider_ids()
    }

    // Round-robin variant: the ranked list is rotated by a per-service-type counter
    pub fn plan_rotated(
        &self,
        service_type: ServiceType,
        region: Option<&str>,
        eco_priority: bool,
    ) -> SelectionPlan {
        self.plan_rotated_in(&self.store.snapshot(), service_type, region, eco_priority)
    }

    pub fn plan_rotated_in(
        &self,
        snapshot: &DescriptorSnapshot,
        service_type: ServiceType,
        region: Option<&str>,
        eco_priority: bool,
    ) -> SelectionPlan {
        let mut plan = self.plan_in(snapshot, service_type, region, eco_priority);
        if plan.providers.len() > 1 {
            let offset = self.next_rotation(service_type) % plan.providers.len();
            plan.providers.rotate_left(offset);
        }
        plan
    }

    fn next_rotation(&self, service_type: ServiceType) -> usize {
        self.rotation_counters[service_type.index()].fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::HealthConfig;
    use chrono::Duration;

    fn selector(
        descriptors: Vec<ProviderDescriptor>,
    ) -> (RotationSelector, Arc<HealthTracker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let health = Arc::new(HealthTracker::with_clock(
            HealthConfig::default(),
            clock.clone(),
        ));
        let store = Arc::new(DescriptorStore::new(descriptors).unwrap());
        (RotationSelector::new(store, health.clone()), health, clock)
    }

    fn eco_trio() -> Vec<ProviderDescriptor> {
        vec![
            ProviderDescriptor::new("A", 10, &[ServiceType::Hotel]).with_scores(75, 50),
            ProviderDescriptor::new("B", 20, &[ServiceType::Hotel]).with_scores(80, 50),
            ProviderDescriptor::new("C", 15, &[ServiceType::Hotel]).with_scores(85, 50),
        ]
    }

    fn trip(health: &HealthTracker, id: &str) {
        for _ in 0..6 {
            health.record_failure(id, 100);
        }
    }

    #[test]
    fn test_priority_order_without_eco() {
        let (selector, _, _) = selector(eco_trio());
        assert_eq!(selector.select(ServiceType::Hotel, None, false), vec!["A", "C", "B"]);
    }

    #[test]
    fn test_eco_priority_order() {
        let (selector, _, _) = selector(eco_trio());
        assert_eq!(selector.select(ServiceType::Hotel, None, true), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_eco_ties_break_on_priority_then_fee_transparency() {
        let (selector, _, _) = selector(vec![
            ProviderDescriptor::new("low-fee", 20, &[ServiceType::Flight]).with_scores(70, 40),
            ProviderDescriptor::new("high-fee", 20, &[ServiceType::Flight]).with_scores(70, 90),
            ProviderDescriptor::new("first", 10, &[ServiceType::Flight]).with_scores(70, 10),
        ]);
        assert_eq!(
            selector.select(ServiceType::Flight, None, true),
            vec!["first", "high-fee", "low-fee"]
        );
    }

    #[test]
    fn test_equal_priorities_keep_configuration_order() {
        let (selector, _, _) = selector(vec![
            ProviderDescriptor::new("x", 5, &[ServiceType::Car]),
            ProviderDescriptor::new("y", 1, &[ServiceType::Car]),
            ProviderDescriptor::new("z", 5, &[ServiceType::Car]),
            ProviderDescriptor::new("w", 5, &[ServiceType::Car]),
        ]);
        for _ in 0..10 {
            assert_eq!(
                selector.select(ServiceType::Car, None, false),
                vec!["y", "x", "z", "w"]
            );
        }
    }

    #[test]
    fn test_filters_service_type_region_and_activity() {
        let (selector, _, _) = selector(vec![
            ProviderDescriptor::new("eu-hotels", 1, &[ServiceType::Hotel]).with_regions(&["EU"]),
            ProviderDescriptor::new("us-hotels", 2, &[ServiceType::Hotel]).with_regions(&["NA"]),
            ProviderDescriptor::new("flights", 3, &[ServiceType::Flight]).with_regions(&["EU"]),
            ProviderDescriptor::new("retired", 0, &[ServiceType::Hotel])
                .with_regions(&["EU"])
                .inactive(),
        ]);
        assert_eq!(selector.select(ServiceType::Hotel, Some("EU"), false), vec!["eu-hotels"]);
        assert_eq!(
            selector.select(ServiceType::Hotel, None, false),
            vec!["eu-hotels", "us-hotels"]
        );
        assert!(selector.select(ServiceType::Hotel, Some("APAC"), false).is_empty());
    }

    #[test]
    fn test_cooling_down_provider_is_skipped_until_cooldown_ends() {
        let (selector, health, clock) = selector(eco_trio());
        trip(&health, "A");

        assert_eq!(selector.select(ServiceType::Hotel, None, false), vec!["C", "B"]);

        clock.advance(Duration::minutes(5));
        assert_eq!(selector.select(ServiceType::Hotel, None, false), vec!["A", "C", "B"]);
    }

    #[test]
    fn test_last_resort_when_everything_is_cooling_down() {
        let (selector, health, _) = selector(eco_trio());
        for id in ["A", "B", "C"] {
            trip(&health, id);
        }

        let plan = selector.plan(ServiceType::Hotel, None, true);
        assert!(plan.last_resort);
        assert_eq!(plan.provider_ids(), vec!["A"]);
    }

    #[test]
    fn test_no_capable_provider_gives_empty_plan() {
        let (selector, _, _) = selector(eco_trio());
        let plan = selector.plan(ServiceType::Activity, None, false);
        assert!(plan.is_empty());
        assert!(!plan.last_resort);
    }

    #[test]
    fn test_round_robin_rotates_per_service_type() {
        let (selector, _, _) = selector(vec![
            ProviderDescriptor::new("h1", 1, &[ServiceType::Hotel]),
            ProviderDescriptor::new("h2", 2, &[ServiceType::Hotel]),
            ProviderDescriptor::new("h3", 3, &[ServiceType::Hotel]),
            ProviderDescriptor::new("f1", 1, &[ServiceType::Flight]),
            ProviderDescriptor::new("f2", 2, &[ServiceType::Flight]),
        ]);

        let first: Vec<Vec<String>> = (0..4)
            .map(|_| selector.plan_rotated(ServiceType::Hotel, None, false).provider_ids())
            .collect();
        assert_eq!(first[0], vec!["h1", "h2", "h3"]);
        assert_eq!(first[1], vec!["h2", "h3", "h1"]);
        assert_eq!(first[2], vec!["h3", "h1", "h2"]);
        assert_eq!(first[3], vec!["h1", "h2", "h3"]);

        // Flight counter is independent of the hotel one
        assert_eq!(
            selector.plan_rotated(ServiceType::Flight, None, false).provider_ids(),
            vec!["f1", "f2"]
        );
    }

    #[test]
    fn test_plan_in_uses_the_given_snapshot() {
        let store = Arc::new(DescriptorStore::new(eco_trio()).unwrap());
        let health = Arc::new(HealthTracker::new(HealthConfig::default()));
        let selector = RotationSelector::new(store.clone(), health);

        let held = store.snapshot();
        store
            .reload(vec![ProviderDescriptor::new("D", 1, &[ServiceType::Hotel])])
            .unwrap();
        assert_eq!(
            selector.plan_in(&held, ServiceType::Hotel, None, false).provider_ids(),
            vec!["A", "C", "B"]
        );
    }

    #[test]
    fn test_selection_sees_reloaded_snapshot() {
        let store = Arc::new(DescriptorStore::new(eco_trio()).unwrap());
        let health = Arc::new(HealthTracker::new(HealthConfig::default()));
        let selector = RotationSelector::new(store.clone(), health);

        store
            .reload(vec![ProviderDescriptor::new("D", 1, &[ServiceType::Hotel])])
            .unwrap();
        assert_eq!(selector.select(ServiceType::Hotel, None, false), vec!["D"]);
    }
}
