use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{seq::SliceRandom, thread_rng, Rng};
use std::sync::Arc;
use std::thread;
use travel_provider_orchestrator::config::HealthConfig;
use travel_provider_orchestrator::descriptor::{DescriptorStore, ProviderDescriptor, ServiceType};
use travel_provider_orchestrator::health::HealthTracker;
use travel_provider_orchestrator::selector::RotationSelector;

const REGIONS: [&str; 4] = ["EU", "NA", "APAC", "LATAM"];

// Random provider set with mixed capabilities, scores and regions
fn providers(count: usize) -> Vec<ProviderDescriptor> {
    let mut rng = thread_rng();
    (0..count)
        .map(|i| {
            let mut service_types: Vec<ServiceType> = ServiceType::ALL
                .iter()
                .copied()
                .filter(|_| rng.gen_bool(0.5))
                .collect();
            if service_types.is_empty() {
                service_types.push(ServiceType::Hotel);
            }
            let region_count = rng.gen_range(1..=REGIONS.len());
            let regions: Vec<&str> = REGIONS
                .choose_multiple(&mut rng, region_count)
                .copied()
                .collect();
            let priority = rng.gen_range(0..100);
            ProviderDescriptor::new(&format!("provider{}", i), priority, &service_types)
                .with_regions(&regions)
                .with_scores(rng.gen_range(0..=100), rng.gen_range(0..=100))
        })
        .collect()
}

fn setup(count: usize) -> (Arc<RotationSelector>, Arc<HealthTracker>) {
    let descriptors = providers(count);
    let ids: Vec<String> = descriptors.iter().map(|d| d.id.clone()).collect();
    let store = Arc::new(DescriptorStore::new(descriptors).unwrap());
    let health = Arc::new(HealthTracker::new(HealthConfig::default()));

    // Every provider has history, a fifth of them end up cooling down
    let mut rng = thread_rng();
    for id in &ids {
        for _ in 0..rng.gen_range(0..3) {
            health.record_failure(id, rng.gen_range(50..2000));
        }
        health.record_success(id, rng.gen_range(50..800));
    }
    for id in ids.choose_multiple(&mut rng, count / 5) {
        for _ in 0..6 {
            health.record_failure(id, 1500);
        }
    }

    (
        Arc::new(RotationSelector::new(store, Arc::clone(&health))),
        health,
    )
}

pub fn selection_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("provider_selection");

    for count in [10, 100, 1000].iter() {
        let (selector, _) = setup(*count);

        group.bench_with_input(BenchmarkId::new("priority", count), count, |b, _| {
            b.iter(|| selector.select(black_box(ServiceType::Hotel), black_box(Some("EU")), false))
        });

        group.bench_with_input(BenchmarkId::new("eco_priority", count), count, |b, _| {
            b.iter(|| selector.select(black_box(ServiceType::Flight), black_box(None), true))
        });
    }

    group.finish();
}

// Selection racing health updates from other threads
pub fn contended_selection_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_selection");

    for threads in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            threads,
            |b, &threads| {
                let (selector, health) = setup(200);
                let ids: Vec<String> = (0..200).map(|i| format!("provider{}", i)).collect();

                b.iter(|| {
                    let mut handles = vec![];
                    for t in 0..threads {
                        let selector = Arc::clone(&selector);
                        let health = Arc::clone(&health);
                        let ids = ids.clone();

                        handles.push(thread::spawn(move || {
                            let mut rng = thread_rng();
                            for _ in 0..100 {
                                if t % 2 == 0 {
                                    let service_type =
                                        *ServiceType::ALL.choose(&mut rng).unwrap();
                                    let eco_priority = rng.gen_bool(0.5);
                                    black_box(selector.select(service_type, None, eco_priority));
                                } else {
                                    let id = ids.choose(&mut rng).unwrap();
                                    if rng.gen_bool(0.3) {
                                        health.record_failure(id, 900);
                                    } else {
                                        health.record_success(id, 120);
                                    }
                                }
                            }
                        }));
                    }

                    for handle in handles {
                        handle.join().unwrap();
                    }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, selection_benchmark, contended_selection_benchmark);
criterion_main!(benches);
