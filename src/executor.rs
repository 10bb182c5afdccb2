// Search Executor
// Runs an ordered provider plan in one of two modes:
//  - fallback: one supplier at a time, stop at the first non-empty success
//  - aggregate: bounded concurrent fan-out, merge every non-empty success
// Supplier errors, timeouts and panics are turned into outcomes here and never
// escape to the caller.

use crate::attempt_log::{AttemptLogEntry, AttemptLogger};
use crate::config::ConfigError;
use crate::descriptor::{ProviderDescriptor, ServiceType};
use crate::health::HealthTracker;
use crate::registry::RegistryError;
use crate::supplier::{ErrorKind, SearchQuery, SupplierAdapter, SupplierError, SupplierOutcome};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Fallback,
    Aggregate,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Fallback => f.write_str("fallback"),
            SearchMode::Aggregate => f.write_str("aggregate"),
        }
    }
}

// One result record with the provider it came from
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedItem {
    pub provider_id: String,
    pub item: Value,
}

#[derive(Debug, Clone)]
pub struct FallbackResult {
    pub correlation_id: String,
    pub service_type: ServiceType,
    pub provider_used: String,
    pub items: Vec<TaggedItem>,
    pub attempts: Vec<AttemptLogEntry>,
    pub last_resort: bool,
}

impl FallbackResult {
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }
}

#[derive(Debug, Clone)]
pub struct AggregateResult {
    pub correlation_id: String,
    pub service_type: ServiceType,
    // Grouped by provider, in plan order
    pub items: Vec<TaggedItem>,
    pub providers_succeeded: Vec<String>,
    // In completion order
    pub attempts: Vec<AttemptLogEntry>,
    pub last_resort: bool,
}

impl AggregateResult {
    pub fn items_from(&self, provider_id: &str) -> usize {
        self.items
            .iter()
            .filter(|item| item.provider_id == provider_id)
            .count()
    }

    pub fn failed_providers(&self) -> Vec<String> {
        self.attempts
            .iter()
            .filter(|a| a.error_kind.map_or(false, |k| k.counts_as_failure()))
            .map(|a| a.provider_id.clone())
            .collect()
    }
}

// Counts per error kind, lets callers tell why a rotation failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureSummary {
    pub authentication_failures: usize,
    pub timeouts: usize,
    pub rate_limited: usize,
    pub malformed_responses: usize,
    pub no_results: usize,
    pub unknown_errors: usize,
}

impl FailureSummary {
    pub fn from_attempts(attempts: &[AttemptLogEntry]) -> Self {
        let mut summary = Self::default();
        for kind in attempts.iter().filter_map(|a| a.error_kind) {
            match kind {
                ErrorKind::AuthenticationFailure => summary.authentication_failures += 1,
                ErrorKind::Timeout => summary.timeouts += 1,
                ErrorKind::RateLimited => summary.rate_limited += 1,
                ErrorKind::MalformedResponse => summary.malformed_responses += 1,
                ErrorKind::NoResults => summary.no_results += 1,
                ErrorKind::UnknownError => summary.unknown_errors += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.authentication_failures
            + self.timeouts
            + self.rate_limited
            + self.malformed_responses
            + self.no_results
            + self.unknown_errors
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        match kind {
            ErrorKind::AuthenticationFailure => self.authentication_failures,
            ErrorKind::Timeout => self.timeouts,
            ErrorKind::RateLimited => self.rate_limited,
            ErrorKind::MalformedResponse => self.malformed_responses,
            ErrorKind::NoResults => self.no_results,
            ErrorKind::UnknownError => self.unknown_errors,
        }
    }

    // True when every attempt ended with this kind
    pub fn all(&self, kind: ErrorKind) -> bool {
        self.total() > 0 && self.count(kind) == self.total()
    }
}

#[derive(Debug, Clone)]
pub struct RotationFailure {
    pub correlation_id: String,
    pub service_type: ServiceType,
    pub mode: SearchMode,
    pub attempts: Vec<AttemptLogEntry>,
    pub summary: FailureSummary,
    pub last_resort: bool,
}

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Invalid search query: {0}")]
    InvalidQuery(String),

    #[error("No provider configured for {service_type} (region: {region:?})")]
    NoProviders {
        service_type: ServiceType,
        region: Option<String>,
    },

    #[error(
        "All providers exhausted for {} {} search {} after {} attempts",
        .0.mode,
        .0.service_type,
        .0.correlation_id,
        .0.attempts.len()
    )]
    Exhausted(Box<RotationFailure>),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Adapter registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl OrchestrationError {
    pub fn rotation_failure(&self) -> Option<&RotationFailure> {
        match self {
            OrchestrationError::Exhausted(failure) => Some(failure),
            _ => None,
        }
    }
}

// Sequential rotation: each provider is tried only after the previous one settled
enum FallbackState {
    Pending,
    Trying(usize),
    Success(SupplierOutcome),
    // Index of the next provider to try
    Next(usize),
    Exhausted,
}

// A provider ready to be called; no adapter means construction failed earlier
#[derive(Clone)]
pub struct Dispatch {
    pub descriptor: Arc<ProviderDescriptor>,
    pub adapter: Option<Arc<dyn SupplierAdapter>>,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("provider_id", &self.descriptor.id)
            .field("has_adapter", &self.adapter.is_some())
            .finish()
    }
}

// Per-request identity shared by every attempt. Owned, so attempt tasks can
// outlive an abandoned request.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub correlation_id: Arc<str>,
    pub query: Arc<SearchQuery>,
    pub last_resort: bool,
}

impl RequestScope {
    pub fn new(correlation_id: &str, query: SearchQuery, last_resort: bool) -> Self {
        Self {
            correlation_id: Arc::from(correlation_id),
            query: Arc::new(query),
            last_resort,
        }
    }
}

// Fallback numbers attempts as they are dispatched, aggregate as they complete
#[derive(Debug, Clone)]
enum AttemptOrder {
    Dispatch(u32),
    Completion(Arc<AtomicU32>),
}

impl AttemptOrder {
    fn resolve(&self) -> u32 {
        match self {
            AttemptOrder::Dispatch(order) => *order,
            AttemptOrder::Completion(counter) => counter.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }
}

#[derive(Clone)]
pub struct SearchExecutor {
    health: Arc<HealthTracker>,
    logger: Arc<AttemptLogger>,
}

impl SearchExecutor {
    pub fn new(health: Arc<HealthTracker>, logger: Arc<AttemptLogger>) -> Self {
        Self { health, logger }
    }

    pub async fn run_fallback(
        &self,
        scope: &RequestScope,
        plan: &[Dispatch],
    ) -> Result<FallbackResult, OrchestrationError> {
        let mut attempts = Vec::with_capacity(plan.len());
        let mut state = FallbackState::Pending;

        loop {
            state = match state {
                FallbackState::Pending if plan.is_empty() => FallbackState::Exhausted,
                FallbackState::Pending => FallbackState::Trying(0),
                FallbackState::Trying(idx) if !self.claim(scope, &plan[idx]) => {
                    FallbackState::Next(idx + 1)
                }
                FallbackState::Trying(idx) => {
                    let dispatch = &plan[idx];
                    let attempt_order = attempts.len() as u32 + 1;
                    debug!(
                        correlation_id = %scope.correlation_id,
                        provider_id = %dispatch.descriptor.id,
                        attempt_order,
                        "Trying provider"
                    );

                    let (outcome, entry) = self
                        .attempt(scope, dispatch, AttemptOrder::Dispatch(attempt_order))
                        .await;
                    attempts.push(entry);
                    if outcome.has_items() {
                        FallbackState::Success(outcome)
                    } else {
                        FallbackState::Next(idx + 1)
                    }
                }
                FallbackState::Next(idx) if idx < plan.len() => FallbackState::Trying(idx),
                FallbackState::Next(_) => FallbackState::Exhausted,
                FallbackState::Success(outcome) => {
                    info!(
                        correlation_id = %scope.correlation_id,
                        provider_id = %outcome.provider_id,
                        attempts = attempts.len(),
                        items = outcome.item_count,
                        "Fallback search succeeded"
                    );
                    return Ok(FallbackResult {
                        correlation_id: scope.correlation_id.to_string(),
                        service_type: scope.query.service_type,
                        provider_used: outcome.provider_id.clone(),
                        items: tag_items(outcome),
                        attempts,
                        last_resort: scope.last_resort,
                    });
                }
                FallbackState::Exhausted => {
                    return Err(self.exhausted(scope, SearchMode::Fallback, attempts));
                }
            };
        }
    }

    pub async fn run_aggregate(
        &self,
        scope: &RequestScope,
        plan: &[Dispatch],
    ) -> Result<AggregateResult, OrchestrationError> {
        let completed = Arc::new(AtomicU32::new(0));
        let dispatched: Vec<(usize, &Dispatch)> = plan
            .iter()
            .enumerate()
            .filter(|(_, dispatch)| self.claim(scope, dispatch))
            .collect();
        let width = dispatched.len().max(1);

        // All dispatched at once; each call carries its own timeout so a slow peer
        // only delays its own outcome
        let mut in_flight = stream::iter(dispatched.iter().map(|&(rank, dispatch)| {
            self.attempt(scope, dispatch, AttemptOrder::Completion(Arc::clone(&completed)))
                .map(move |settled| (rank, settled))
        }))
        .buffer_unordered(width);

        let mut attempts = Vec::with_capacity(dispatched.len());
        let mut successes = Vec::new();
        while let Some((rank, (outcome, entry))) = in_flight.next().await {
            attempts.push(entry);
            if outcome.has_items() {
                successes.push((rank, outcome));
            }
        }
        drop(in_flight);
        attempts.sort_by_key(|entry| entry.attempt_order);

        if successes.is_empty() {
            return Err(self.exhausted(scope, SearchMode::Aggregate, attempts));
        }

        successes.sort_by_key(|(rank, _)| *rank);
        let providers_succeeded: Vec<String> = successes
            .iter()
            .map(|(_, outcome)| outcome.provider_id.clone())
            .collect();
        let items: Vec<TaggedItem> = successes
            .into_iter()
            .flat_map(|(_, outcome)| tag_items(outcome))
            .collect();

        info!(
            correlation_id = %scope.correlation_id,
            dispatched = dispatched.len(),
            succeeded = providers_succeeded.len(),
            items = items.len(),
            "Aggregate search completed"
        );

        Ok(AggregateResult {
            correlation_id: scope.correlation_id.to_string(),
            service_type: scope.query.service_type,
            items,
            providers_succeeded,
            attempts,
            last_resort: scope.last_resort,
        })
    }

    // A last-resort attempt ignores health, everything else goes through the trial gate
    fn claim(&self, scope: &RequestScope, dispatch: &Dispatch) -> bool {
        if scope.last_resort || self.health.claim_dispatch(&dispatch.descriptor.id) {
            return true;
        }
        debug!(
            correlation_id = %scope.correlation_id,
            provider_id = %dispatch.descriptor.id,
            "Recovery trial already in flight, skipping provider"
        );
        false
    }

    // The call and its bookkeeping run on their own task: dropping the request
    // drops only the result, the supplier call still settles health and the log
    async fn attempt(
        &self,
        scope: &RequestScope,
        dispatch: &Dispatch,
        order: AttemptOrder,
    ) -> (SupplierOutcome, AttemptLogEntry) {
        let task = {
            let executor = self.clone();
            let scope = scope.clone();
            let dispatch = dispatch.clone();
            let order = order.clone();
            tokio::spawn(
                async move {
                    let outcome = executor.call_supplier(&dispatch, &scope.query).await;
                    let entry = executor.settle(&scope, order.resolve(), &outcome);
                    (outcome, entry)
                }
                .in_current_span(),
            )
        };

        match task.await {
            Ok(settled) => settled,
            Err(e) => {
                warn!(
                    correlation_id = %scope.correlation_id,
                    provider_id = %dispatch.descriptor.id,
                    error = %e,
                    "Attempt task did not complete"
                );
                self.health.release_trial(&dispatch.descriptor.id);
                let outcome = SupplierOutcome::from_result(
                    &dispatch.descriptor.id,
                    Err(SupplierError::Unknown(format!("attempt task failed: {}", e))),
                    0,
                );
                let entry = AttemptLogEntry::from_outcome(
                    &scope.correlation_id,
                    scope.query.service_type,
                    order.resolve(),
                    &outcome,
                    self.health.clock().now(),
                );
                (outcome, entry)
            }
        }
    }

    // One supplier call bounded by the provider's timeout
    pub async fn call_supplier(&self, dispatch: &Dispatch, query: &SearchQuery) -> SupplierOutcome {
        let provider_id = dispatch.descriptor.id.as_str();
        let Some(adapter) = dispatch.adapter.as_ref() else {
            return SupplierOutcome::from_result(
                provider_id,
                Err(SupplierError::Unknown(format!(
                    "no adapter available for provider '{}'",
                    provider_id
                ))),
                0,
            );
        };

        let timeout = dispatch.descriptor.default_timeout;
        let start = Instant::now();
        let call = AssertUnwindSafe(adapter.search(query)).catch_unwind();
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(SupplierError::Unknown(format!(
                "supplier panicked: {}",
                panic_message(panic.as_ref())
            ))),
            Err(_) => Err(SupplierError::Timeout(timeout.as_millis() as u64)),
        };
        SupplierOutcome::from_result(provider_id, result, start.elapsed().as_millis() as u64)
    }

    // Health bookkeeping and attempt logging for one finished call
    fn settle(
        &self,
        scope: &RequestScope,
        attempt_order: u32,
        outcome: &SupplierOutcome,
    ) -> AttemptLogEntry {
        let provider_id = outcome.provider_id.as_str();
        match outcome.error_kind {
            None => self.health.record_success(provider_id, outcome.response_time_ms),
            Some(kind) if kind.counts_as_failure() => {
                warn!(
                    correlation_id = %scope.correlation_id,
                    provider_id,
                    attempt_order,
                    error_kind = %kind,
                    error = outcome.error_message.as_deref().unwrap_or(""),
                    "Provider attempt failed"
                );
                self.health
                    .record_failure(provider_id, outcome.response_time_ms);
            }
            Some(_) => {
                debug!(
                    correlation_id = %scope.correlation_id,
                    provider_id,
                    attempt_order,
                    "Provider returned no results"
                );
                self.health.release_trial(provider_id);
            }
        }

        let entry = AttemptLogEntry::from_outcome(
            &scope.correlation_id,
            scope.query.service_type,
            attempt_order,
            outcome,
            self.health.clock().now(),
        );
        self.logger.append(entry.clone());
        entry
    }

    fn exhausted(
        &self,
        scope: &RequestScope,
        mode: SearchMode,
        attempts: Vec<AttemptLogEntry>,
    ) -> OrchestrationError {
        let summary = FailureSummary::from_attempts(&attempts);
        warn!(
            correlation_id = %scope.correlation_id,
            mode = %mode,
            attempts = attempts.len(),
            timeouts = summary.timeouts,
            no_results = summary.no_results,
            authentication_failures = summary.authentication_failures,
            "All providers exhausted"
        );
        OrchestrationError::Exhausted(Box::new(RotationFailure {
            correlation_id: scope.correlation_id.to_string(),
            service_type: scope.query.service_type,
            mode,
            attempts,
            summary,
            last_resort: scope.last_resort,
        }))
    }
}

fn tag_items(outcome: SupplierOutcome) -> Vec<TaggedItem> {
    let provider_id = outcome.provider_id;
    outcome
        .items
        .into_iter()
        .map(|item| TaggedItem {
            provider_id: provider_id.clone(),
            item,
        })
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
