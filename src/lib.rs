// Travel provider orchestration library

// Export modules for each component
pub mod attempt_log;
pub mod clock;
pub mod config;
pub mod descriptor;
pub mod executor;
pub mod health;
pub mod orchestrator;
pub mod registry;
pub mod selector;
pub mod supplier;
pub mod telemetry;

// Re-export key types for convenience
pub use attempt_log::{
    AttemptLogEntry, AttemptLogger, AttemptOutcome, AttemptSink, JsonLinesAttemptSink,
    MemoryAttemptSink, ProviderStats, SinkError,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, OrchestratorConfig};
pub use descriptor::{DescriptorStore, ProviderDescriptor, ServiceType, StoreError};
pub use executor::{
    AggregateResult, FailureSummary, FallbackResult, OrchestrationError, RotationFailure,
    SearchMode, TaggedItem,
};
pub use health::{HealthRecord, HealthState, HealthTracker};
pub use orchestrator::{new_correlation_id, Orchestrator};
pub use registry::{AdapterRegistry, Credentials, RegistryError, SecretProvider, StaticSecrets};
pub use selector::{RotationSelector, SelectionPlan};
pub use supplier::{
    ErrorKind, ProbeReport, ProbeStatus, SearchQuery, SupplierAdapter, SupplierError,
    SupplierOutcome,
};
pub use telemetry::init_tracing;
