// Supplier contract
// The orchestrator only ever talks to suppliers through SupplierAdapter. Payloads stay
// opaque JSON records; only the number of items matters for routing decisions.

use crate::descriptor::ServiceType;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

// Error types for a single supplier call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SupplierError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SupplierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupplierError::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            SupplierError::Timeout(_) => ErrorKind::Timeout,
            SupplierError::RateLimited { .. } => ErrorKind::RateLimited,
            SupplierError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            SupplierError::Unknown(_) => ErrorKind::UnknownError,
        }
    }
}

// Outcome classification recorded for every attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthenticationFailure,
    Timeout,
    RateLimited,
    MalformedResponse,
    NoResults,
    UnknownError,
}

impl ErrorKind {
    // An empty inventory is a valid answer, everything else counts against health
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, ErrorKind::NoResults)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AuthenticationFailure => "authentication_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::NoResults => "no_results",
            ErrorKind::UnknownError => "unknown_error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub service_type: ServiceType,
    pub destination: String,
    pub origin: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub party_size: u32,
    pub currency: String,
    pub region: Option<String>,
    pub eco_priority: bool,
    // Aggregate mode only
    pub max_providers: Option<usize>,
    // Caller supplied id, generated when absent
    pub correlation_id: Option<String>,
}

impl SearchQuery {
    pub fn new(
        service_type: ServiceType,
        destination: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            service_type,
            destination: destination.to_string(),
            origin: None,
            start_date,
            end_date,
            party_size: 1,
            currency: "EUR".to_string(),
            region: None,
            eco_priority: false,
            max_providers: None,
            correlation_id: None,
        }
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    pub fn with_party_size(mut self, party_size: u32) -> Self {
        self.party_size = party_size;
        self
    }

    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = currency.to_string();
        self
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    pub fn with_eco_priority(mut self, eco_priority: bool) -> Self {
        self.eco_priority = eco_priority;
        self
    }

    pub fn with_max_providers(mut self, max_providers: usize) -> Self {
        self.max_providers = Some(max_providers);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.destination.trim().is_empty() {
            return Err("destination must not be empty".to_string());
        }
        if self.end_date < self.start_date {
            return Err(format!(
                "end date {} is before start date {}",
                self.end_date, self.start_date
            ));
        }
        if self.party_size == 0 {
            return Err("party size must be at least 1".to_string());
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid currency code '{}'", self.currency));
        }
        if self.max_providers == Some(0) {
            return Err("max providers must be at least 1".to_string());
        }
        Ok(())
    }
}

// Result of one supplier call as seen by the executor
#[derive(Debug, Clone, PartialEq)]
pub struct SupplierOutcome {
    pub provider_id: String,
    pub success: bool,
    pub items: Vec<Value>,
    pub item_count: usize,
    pub response_time_ms: u64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl SupplierOutcome {
    pub fn from_result(
        provider_id: &str,
        result: Result<Vec<Value>, SupplierError>,
        response_time_ms: u64,
    ) -> Self {
        match result {
            Ok(items) if items.is_empty() => Self {
                provider_id: provider_id.to_string(),
                success: true,
                items,
                item_count: 0,
                response_time_ms,
                error_kind: Some(ErrorKind::NoResults),
                error_message: None,
            },
            Ok(items) => Self {
                provider_id: provider_id.to_string(),
                success: true,
                item_count: items.len(),
                items,
                response_time_ms,
                error_kind: None,
                error_message: None,
            },
            Err(e) => Self {
                provider_id: provider_id.to_string(),
                success: false,
                items: Vec::new(),
                item_count: 0,
                response_time_ms,
                error_kind: Some(e.kind()),
                error_message: Some(e.to_string()),
            },
        }
    }

    pub fn has_items(&self) -> bool {
        self.success && self.item_count > 0
    }

    pub fn is_failure(&self) -> bool {
        self.error_kind.map_or(false, |kind| kind.counts_as_failure())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Up,
    Degraded,
    Down,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub provider_id: String,
    pub status: ProbeStatus,
    pub response_time_ms: u64,
    pub error_message: Option<String>,
}

// Supplier adapter contract, implemented per external integration
#[async_trait]
pub trait SupplierAdapter: Send + Sync + 'static {
    fn provider_id(&self) -> &str;

    async fn authenticate(&self) -> Result<(), SupplierError>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, SupplierError>;

    // Default probe: an authentication round trip
    async fn health_check(&self) -> ProbeReport {
        let start = Instant::now();
        let result = self.authenticate().await;
        let response_time_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => ProbeReport {
                provider_id: self.provider_id().to_string(),
                status: ProbeStatus::Up,
                response_time_ms,
                error_message: None,
            },
            Err(e) => ProbeReport {
                provider_id: self.provider_id().to_string(),
                status: ProbeStatus::Down,
                response_time_ms,
                error_message: Some(e.to_string()),
            },
        }
    }
}

// Scriptable supplier for tests
#[cfg(test)]
pub mod mock_supplier {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        Items(usize),
        Empty,
        Fail(SupplierError),
        Panic,
    }

    pub struct MockSupplier {
        id: String,
        behavior: Mutex<MockBehavior>,
        // Consumed before falling back to `behavior`
        script: Mutex<VecDeque<MockBehavior>>,
        delay_ms: AtomicUsize,
        auth_error: Mutex<Option<SupplierError>>,
        search_calls: AtomicUsize,
        auth_calls: AtomicUsize,
    }

    impl MockSupplier {
        pub fn new(id: &str, behavior: MockBehavior) -> Self {
            Self {
                id: id.to_string(),
                behavior: Mutex::new(behavior),
                script: Mutex::new(VecDeque::new()),
                delay_ms: AtomicUsize::new(0),
                auth_error: Mutex::new(None),
                search_calls: AtomicUsize::new(0),
                auth_calls: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(self, delay: Duration) -> Self {
            self.delay_ms
                .store(delay.as_millis() as usize, Ordering::SeqCst);
            self
        }

        pub fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock() = behavior;
        }

        pub fn push_script(&self, behavior: MockBehavior) {
            self.script.lock().push_back(behavior);
        }

        pub fn reject_credentials(&self, message: &str) {
            *self.auth_error.lock() =
                Some(SupplierError::AuthenticationFailure(message.to_string()));
        }

        pub fn search_calls(&self) -> usize {
            self.search_calls.load(Ordering::SeqCst)
        }

        pub fn auth_calls(&self) -> usize {
            self.auth_calls.load(Ordering::SeqCst)
        }

        fn next_behavior(&self) -> MockBehavior {
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.behavior.lock().clone())
        }
    }

    #[async_trait]
    impl SupplierAdapter for MockSupplier {
        fn provider_id(&self) -> &str {
            &self.id
        }

        async fn authenticate(&self) -> Result<(), SupplierError> {
            self.auth_calls.fetch_add(1, Ordering::SeqCst);
            let auth_error = self.auth_error.lock().clone();
            match auth_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn search(&self, query: &SearchQuery) -> Result<Vec<Value>, SupplierError> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);

            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }

            match self.next_behavior() {
                MockBehavior::Items(count) => Ok((0..count)
                    .map(|i| {
                        serde_json::json!({
                            "supplier": self.id,
                            "ref": format!("{}-{}", self.id, i),
                            "destination": query.destination,
                        })
                    })
                    .collect()),
                MockBehavior::Empty => Ok(Vec::new()),
                MockBehavior::Fail(e) => Err(e),
                MockBehavior::Panic => panic!("supplier {} blew up", self.id),
            }
        }
    }
}
