// Orchestrator
// Facade over the descriptor store, health tracker, selector, executor and attempt
// log. Supplier adapters are held privately here; callers reach a supplier only
// through a search, a probe or warm-up authentication.

use crate::attempt_log::{AttemptLogger, AttemptLoggerStats, AttemptSink, ProviderStats, SinkError};
use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::descriptor::{
    validate_descriptors, DescriptorSnapshot, DescriptorStore, ProviderDescriptor, ServiceType,
};
use crate::executor::{
    AggregateResult, Dispatch, FallbackResult, OrchestrationError, RequestScope, SearchExecutor,
    SearchMode,
};
use crate::health::{HealthRecord, HealthState, HealthTracker};
use crate::registry::{AdapterMap, AdapterRegistry, RegistryError, SecretProvider};
use crate::selector::{RotationSelector, SelectionPlan};
use crate::supplier::{ProbeReport, ProbeStatus, SearchQuery, SupplierAdapter, SupplierError};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

pub fn new_correlation_id() -> String {
    format!("search-{:016x}", rand::random::<u64>())
}

// Descriptors and the adapters built for them, published together on reload
struct Catalog {
    descriptors: Arc<DescriptorSnapshot>,
    adapters: AdapterMap,
    adapter_failures: Vec<(String, RegistryError)>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<DescriptorStore>,
    health: Arc<HealthTracker>,
    selector: RotationSelector,
    executor: SearchExecutor,
    logger: Arc<AttemptLogger>,
    registry: AdapterRegistry,
    secrets: Arc<dyn SecretProvider>,
    catalog: RwLock<Arc<Catalog>>,
}

impl Orchestrator {
    // Must be called inside a tokio runtime; the attempt log writer is spawned here
    pub fn new(
        config: OrchestratorConfig,
        registry: AdapterRegistry,
        secrets: Arc<dyn SecretProvider>,
        sink: Arc<dyn AttemptSink>,
    ) -> Result<Self, OrchestrationError> {
        Self::with_clock(config, registry, secrets, sink, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: OrchestratorConfig,
        registry: AdapterRegistry,
        secrets: Arc<dyn SecretProvider>,
        sink: Arc<dyn AttemptSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OrchestrationError> {
        config.validate()?;

        let store = Arc::new(DescriptorStore::new(config.providers.clone())?);
        let health = Arc::new(HealthTracker::with_clock(config.health.clone(), clock));
        let logger = Arc::new(AttemptLogger::new(sink, &config.attempt_log));
        let (adapters, failures) = registry.build_all(&config.providers, secrets.as_ref());

        info!(
            providers = config.providers.len(),
            adapters = adapters.len(),
            adapter_failures = failures.len(),
            round_robin = config.rotation.round_robin,
            "Orchestrator initialized"
        );

        Ok(Self {
            selector: RotationSelector::new(Arc::clone(&store), Arc::clone(&health)),
            executor: SearchExecutor::new(Arc::clone(&health), Arc::clone(&logger)),
            config,
            health,
            logger,
            registry,
            secrets,
            catalog: RwLock::new(Arc::new(Catalog {
                descriptors: store.snapshot(),
                adapters,
                adapter_failures: failures,
            })),
            store,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn descriptors(&self) -> &DescriptorStore {
        &self.store
    }

    pub async fn search_fallback(
        &self,
        query: SearchQuery,
    ) -> Result<FallbackResult, OrchestrationError> {
        let (correlation_id, plan, dispatches) = self.prepare(&query)?;
        let span = info_span!(
            "provider_search",
            correlation_id = %correlation_id,
            mode = %SearchMode::Fallback,
            service_type = %query.service_type
        );
        let scope = RequestScope::new(&correlation_id, query, plan.last_resort);
        self.executor
            .run_fallback(&scope, &dispatches)
            .instrument(span)
            .await
    }

    pub async fn search_aggregate(
        &self,
        query: SearchQuery,
    ) -> Result<AggregateResult, OrchestrationError> {
        let (correlation_id, plan, mut dispatches) = self.prepare(&query)?;
        let max_providers = query
            .max_providers
            .unwrap_or(self.config.aggregate.default_max_providers);
        dispatches.truncate(max_providers);

        let span = info_span!(
            "provider_search",
            correlation_id = %correlation_id,
            mode = %SearchMode::Aggregate,
            service_type = %query.service_type,
            max_providers
        );
        let scope = RequestScope::new(&correlation_id, query, plan.last_resort);
        self.executor
            .run_aggregate(&scope, &dispatches)
            .instrument(span)
            .await
    }

    // Ranked eligible provider ids, without calling anyone
    pub fn select(
        &self,
        service_type: ServiceType,
        region: Option<&str>,
        eco_priority: bool,
    ) -> Vec<String> {
        self.selector.select(service_type, region, eco_priority)
    }

    // Plan and adapters come from one catalog, so a concurrent reload is seen whole
    fn prepare(
        &self,
        query: &SearchQuery,
    ) -> Result<(String, SelectionPlan, Vec<Dispatch>), OrchestrationError> {
        query.validate().map_err(OrchestrationError::InvalidQuery)?;

        let correlation_id = query
            .correlation_id
            .clone()
            .unwrap_or_else(new_correlation_id);
        let region = query.region.as_deref();
        let catalog = self.catalog();
        let plan = if self.config.rotation.round_robin {
            self.selector.plan_rotated_in(
                &catalog.descriptors,
                query.service_type,
                region,
                query.eco_priority,
            )
        } else {
            self.selector.plan_in(
                &catalog.descriptors,
                query.service_type,
                region,
                query.eco_priority,
            )
        };

        if plan.is_empty() {
            warn!(
                correlation_id = %correlation_id,
                service_type = %query.service_type,
                region = region.unwrap_or("*"),
                "No provider configured for request"
            );
            return Err(OrchestrationError::NoProviders {
                service_type: query.service_type,
                region: query.region.clone(),
            });
        }
        if plan.last_resort {
            info!(
                correlation_id = %correlation_id,
                provider_id = %plan.providers[0].id,
                "Attempting last-resort provider"
            );
        }

        let dispatches = plan
            .providers
            .iter()
            .map(|descriptor| Dispatch {
                descriptor: Arc::clone(descriptor),
                adapter: catalog.adapters.get(&descriptor.id).cloned(),
            })
            .collect();
        Ok((correlation_id, plan, dispatches))
    }

    fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read())
    }

    // Validates and rebuilds adapters, then publishes descriptors and adapters as one catalog
    pub fn reload(&self, descriptors: Vec<ProviderDescriptor>) -> Result<u64, OrchestrationError> {
        validate_descriptors(&descriptors)?;
        let (adapters, failures) = self
            .registry
            .build_all(&descriptors, self.secrets.as_ref());

        // Held across the store swap so concurrent reloads publish in store order
        let mut catalog = self.catalog.write();
        let version = self.store.reload(descriptors)?;
        let snapshot = self.store.snapshot();
        self.health.retain(|id| snapshot.get(id).is_some());

        info!(
            version,
            adapters = adapters.len(),
            adapter_failures = failures.len(),
            "Supplier adapters rebuilt"
        );
        *catalog = Arc::new(Catalog {
            descriptors: snapshot,
            adapters,
            adapter_failures: failures,
        });
        Ok(version)
    }

    pub fn adapter_failures(&self) -> Vec<(String, RegistryError)> {
        self.catalog().adapter_failures.clone()
    }

    // Startup check for deployments that must not run with a missing adapter
    pub fn require_adapters(&self) -> Result<(), OrchestrationError> {
        match self.catalog().adapter_failures.first() {
            Some((_, e)) => Err(e.clone().into()),
            None => Ok(()),
        }
    }

    pub async fn authenticate_all(&self) -> Vec<(String, Result<(), SupplierError>)> {
        let catalog = self.catalog();

        let calls = catalog.descriptors.active().filter_map(|descriptor| {
            let adapter = catalog.adapters.get(&descriptor.id).cloned()?;
            let timeout = descriptor.default_timeout;
            let provider_id = descriptor.id.clone();
            Some(async move {
                let start = Instant::now();
                let result = match tokio::time::timeout(
                    timeout,
                    AssertUnwindSafe(adapter.authenticate()).catch_unwind(),
                )
                .await
                {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(SupplierError::Unknown("authenticate panicked".to_string())),
                    Err(_) => Err(SupplierError::Timeout(timeout.as_millis() as u64)),
                };
                (provider_id, result, start.elapsed().as_millis() as u64)
            })
        });

        let results = join_all(calls).await;
        results
            .into_iter()
            .map(|(provider_id, result, response_time_ms)| {
                if let Err(e) = &result {
                    warn!(provider_id = %provider_id, error = %e, "Supplier authentication failed");
                    self.health.record_failure(&provider_id, response_time_ms);
                }
                (provider_id, result)
            })
            .collect()
    }

    // Probes every active provider once and feeds the results into health tracking
    pub async fn run_health_checks(&self) -> Vec<ProbeReport> {
        let catalog = self.catalog();

        let probes = catalog.descriptors.active().map(|descriptor| {
            probe(
                Arc::clone(descriptor),
                catalog.adapters.get(&descriptor.id).cloned(),
            )
        });
        let reports = join_all(probes).await;

        for report in &reports {
            match report.status {
                ProbeStatus::Up => self
                    .health
                    .record_success(&report.provider_id, report.response_time_ms),
                ProbeStatus::Degraded => {
                    warn!(provider_id = %report.provider_id, "Provider degraded");
                    self.health
                        .record_success(&report.provider_id, report.response_time_ms);
                }
                ProbeStatus::Down => {
                    warn!(
                        provider_id = %report.provider_id,
                        error = report.error_message.as_deref().unwrap_or(""),
                        "Provider health check failed"
                    );
                    self.health
                        .record_failure(&report.provider_id, report.response_time_ms);
                }
            }
        }
        reports
    }

    // Periodic probing; stops once the orchestrator is dropped
    pub fn spawn_health_monitor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.config.health.probe_interval()?;
        let weak = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    debug!("Orchestrator dropped, stopping health monitor");
                    break;
                };
                let reports = orchestrator.run_health_checks().await;
                let down = reports
                    .iter()
                    .filter(|r| r.status == ProbeStatus::Down)
                    .count();
                debug!(probed = reports.len(), down, "Health probe round finished");
            }
        }))
    }

    pub fn health_snapshot(&self) -> Vec<(String, HealthRecord)> {
        self.health.snapshot()
    }

    pub fn provider_health(&self, provider_id: &str) -> HealthState {
        self.health.state(provider_id)
    }

    pub fn reset_provider_health(&self, provider_id: &str) -> bool {
        self.health.reset(provider_id)
    }

    // Flushes pending log writes first so recent attempts are counted
    pub async fn provider_stats(
        &self,
        service_type: Option<ServiceType>,
    ) -> Result<HashMap<String, ProviderStats>, SinkError> {
        self.logger.flush().await;
        self.logger.stats_by_provider(service_type).await
    }

    pub async fn flush_attempt_log(&self) {
        self.logger.flush().await;
    }

    pub fn attempt_logger_stats(&self) -> AttemptLoggerStats {
        self.logger.stats()
    }
}

async fn probe(
    descriptor: Arc<ProviderDescriptor>,
    adapter: Option<Arc<dyn SupplierAdapter>>,
) -> ProbeReport {
    let down = |message: String, response_time_ms: u64| ProbeReport {
        provider_id: descriptor.id.clone(),
        status: ProbeStatus::Down,
        response_time_ms,
        error_message: Some(message),
    };

    let Some(adapter) = adapter else {
        return down("no adapter available".to_string(), 0);
    };

    let timeout = descriptor.default_timeout;
    let start = Instant::now();
    match tokio::time::timeout(timeout, AssertUnwindSafe(adapter.health_check()).catch_unwind())
        .await
    {
        Ok(Ok(report)) => report,
        Ok(Err(_)) => down(
            "health check panicked".to_string(),
            start.elapsed().as_millis() as u64,
        ),
        Err(_) => down(
            SupplierError::Timeout(timeout.as_millis() as u64).to_string(),
            start.elapsed().as_millis() as u64,
        ),
    }
}
