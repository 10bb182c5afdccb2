// Health Tracker
// Per-provider mutable health state. Every update to a record runs while holding
// that record's map entry, so concurrent searches hitting the same provider are
// linearized and never lose a failure count.

use crate::clock::{Clock, SystemClock};
use crate::config::HealthConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub is_healthy: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_response_time_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    // A recovering provider gets a single trial dispatch until its outcome is recorded
    pub trial_in_flight: bool,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            is_healthy: true,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_response_time_ms: 0.0,
            last_success_at: None,
            last_failure_at: None,
            cooldown_until: None,
            trial_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    CoolingDown { until: DateTime<Utc> },
    // Cooldown elapsed: eligible for one trial, and one more failure puts the
    // provider straight back into cooldown
    Recovering,
}

impl HealthRecord {
    pub fn state(&self, now: DateTime<Utc>) -> HealthState {
        match self.cooldown_until {
            Some(until) if !self.is_healthy && now < until => HealthState::CoolingDown { until },
            _ if self.is_healthy => HealthState::Healthy,
            _ => HealthState::Recovering,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state(now) {
            HealthState::Healthy => true,
            HealthState::CoolingDown { .. } => false,
            HealthState::Recovering => !self.trial_in_flight,
        }
    }

    // Optimistic reset once the cooldown window has passed
    fn settle_cooldown(&mut self, now: DateTime<Utc>) {
        if !self.is_healthy && self.cooldown_until.map_or(true, |until| now >= until) {
            self.is_healthy = true;
            self.cooldown_until = None;
        }
    }
}

pub struct HealthTracker {
    records: DashMap<String, HealthRecord>,
    config: HealthConfig,
    clock: Arc<dyn Clock>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // No record yet counts as healthy
    pub fn is_eligible(&self, provider_id: &str) -> bool {
        let now = self.clock.now();
        self.records
            .get(provider_id)
            .map_or(true, |record| record.is_eligible(now))
    }

    pub fn state(&self, provider_id: &str) -> HealthState {
        let now = self.clock.now();
        self.records
            .get(provider_id)
            .map_or(HealthState::Healthy, |record| record.state(now))
    }

    pub fn record_success(&self, provider_id: &str, response_time_ms: u64) {
        let now = self.clock.now();
        let weight = self.config.latency_ema_weight;
        let mut record = self.records.entry(provider_id.to_string()).or_default();

        let was_unhealthy = !record.is_healthy;
        let sample = response_time_ms as f64;
        record.avg_response_time_ms = if record.success_count == 0 {
            sample
        } else {
            weight * sample + (1.0 - weight) * record.avg_response_time_ms
        };
        record.success_count += 1;
        record.consecutive_failures = 0;
        record.is_healthy = true;
        record.cooldown_until = None;
        record.trial_in_flight = false;
        record.last_success_at = Some(now);

        if was_unhealthy {
            info!(provider_id, "Provider recovered");
        }
        debug!(
            provider_id,
            response_time_ms,
            avg_response_time_ms = record.avg_response_time_ms,
            "Recorded provider success"
        );
    }

    pub fn record_failure(&self, provider_id: &str, response_time_ms: u64) {
        let now = self.clock.now();
        let mut record = self.records.entry(provider_id.to_string()).or_default();

        record.settle_cooldown(now);
        record.trial_in_flight = false;
        record.failure_count += 1;
        record.consecutive_failures += 1;
        record.last_failure_at = Some(now);

        if record.consecutive_failures > self.config.failure_threshold {
            let cooldown = chrono::Duration::from_std(self.config.cooldown())
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
            let until = now + cooldown;
            record.is_healthy = false;
            record.cooldown_until = Some(until);
            warn!(
                provider_id,
                consecutive_failures = record.consecutive_failures,
                cooldown_until = %until,
                "Provider marked unhealthy, entering cooldown"
            );
        } else {
            debug!(
                provider_id,
                response_time_ms,
                consecutive_failures = record.consecutive_failures,
                "Recorded provider failure"
            );
        }
    }

    pub fn record(&self, provider_id: &str) -> Option<HealthRecord> {
        self.records.get(provider_id).map(|record| record.clone())
    }

    pub fn snapshot(&self) -> Vec<(String, HealthRecord)> {
        let mut records: Vec<(String, HealthRecord)> = self
            .records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    // Called right before a supplier call. Healthy providers always pass; a recovering
    // provider passes once, until its trial outcome is recorded.
    pub fn claim_dispatch(&self, provider_id: &str) -> bool {
        let now = self.clock.now();
        let Some(mut record) = self.records.get_mut(provider_id) else {
            return true;
        };
        match record.state(now) {
            HealthState::Healthy => true,
            HealthState::CoolingDown { .. } => false,
            HealthState::Recovering if record.trial_in_flight => false,
            HealthState::Recovering => {
                record.trial_in_flight = true;
                info!(provider_id, "Dispatching recovery trial");
                true
            }
        }
    }

    // Ends a trial whose outcome leaves the counters alone (zero results)
    pub fn release_trial(&self, provider_id: &str) {
        if let Some(mut record) = self.records.get_mut(provider_id) {
            record.trial_in_flight = false;
        }
    }

    pub fn reset(&self, provider_id: &str) -> bool {
        let removed = self.records.remove(provider_id).is_some();
        if removed {
            info!(provider_id, "Provider health reset");
        }
        removed
    }

    // Drop records of providers that no longer exist
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.records.retain(|id, _| keep(id));
    }
}
