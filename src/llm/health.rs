//! Per-provider circuit breaker.
//!
//! Two states per provider:
//!
//! ```text
//! +---------+   errors in window > threshold   +-----------+
//! | Healthy | -------------------------------> | Unhealthy |
//! +---------+                                  +-----------+
//!      ^                                             |
//!      |        now >= unhealthy_until               |
//!      +---------------------------------------------+
//! ```
//!
//! Recovery is timed, not probed. Only rate limits, server errors and
//! timeouts count against a provider; caller mistakes (auth, malformed
//! request) say nothing about provider health.
//!
//! Writes for one provider are serialized by that provider's mutex so a burst
//! of concurrent failures cannot lose increments. The read path
//! ([`HealthTracker::is_healthy`]) only loads an atomic deadline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ProviderError;
use crate::llm::registry::ModelDefinition;

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// The breaker trips once qualifying errors in the window exceed this.
    pub failure_threshold: u32,
    /// Rolling window over which errors are counted.
    #[serde(rename = "window_secs", with = "crate::config::secs")]
    pub window: Duration,
    /// How long a tripped provider stays excluded.
    #[serde(rename = "cooldown_secs", with = "crate::config::secs")]
    pub cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Result of one attempt against a provider, as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    ServerError,
    Timeout,
    /// Auth or malformed request. Never counted.
    CallerError,
}

impl AttemptOutcome {
    pub fn from_error(err: &ProviderError) -> Self {
        match err {
            ProviderError::RateLimited { .. } => AttemptOutcome::RateLimited,
            ProviderError::ServerError { .. } => AttemptOutcome::ServerError,
            ProviderError::Timeout { .. } => AttemptOutcome::Timeout,
            ProviderError::AuthFailed { .. } | ProviderError::InvalidRequest { .. } => {
                AttemptOutcome::CallerError
            }
        }
    }

    /// Whether this outcome counts toward tripping the breaker.
    pub fn is_qualifying(self) -> bool {
        matches!(
            self,
            AttemptOutcome::RateLimited | AttemptOutcome::ServerError | AttemptOutcome::Timeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Healthy,
    Unhealthy,
}

/// Point-in-time view of a provider's breaker.
#[derive(Debug, Clone)]
pub struct ProviderHealthState {
    pub provider_id: String,
    /// Qualifying errors currently inside the window.
    pub error_count: u32,
    /// Time of the oldest error still inside the window.
    pub window_start: Option<Instant>,
    pub status: ProviderStatus,
    pub unhealthy_until: Option<Instant>,
}

/// State change caused by [`HealthTracker::record_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Tripped { error_count: u32, cooldown: Duration },
    Recovered,
}

/// Candidate chain after health filtering.
#[derive(Debug, Clone)]
pub struct FilteredChain {
    pub candidates: Vec<ModelDefinition>,
    /// Every candidate was unhealthy and the first original was kept anyway.
    pub bypassed: bool,
}

#[derive(Default)]
struct ErrorWindow {
    errors: VecDeque<Instant>,
}

struct ProviderSlot {
    /// Milliseconds since the tracker epoch at which the provider becomes
    /// eligible again. `0` means healthy.
    unhealthy_until_ms: AtomicU64,
    window: Mutex<ErrorWindow>,
}

impl ProviderSlot {
    fn new() -> Self {
        Self {
            unhealthy_until_ms: AtomicU64::new(0),
            window: Mutex::new(ErrorWindow::default()),
        }
    }
}

/// Tracks breaker state for every provider seen so far.
pub struct HealthTracker {
    config: HealthConfig,
    epoch: Instant,
    slots: RwLock<HashMap<String, Arc<ProviderSlot>>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Offset from the epoch, shifted by one so `0` stays free as the
    /// "healthy" sentinel.
    fn now_ms(&self) -> u64 {
        self.to_ms(Instant::now())
    }

    fn to_ms(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64 + 1
    }

    fn instant_at_ms(&self, ms: u64) -> Instant {
        self.epoch + Duration::from_millis(ms.saturating_sub(1))
    }

    fn slot(&self, provider: &str) -> Option<Arc<ProviderSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider)
            .cloned()
    }

    fn slot_or_insert(&self, provider: &str) -> Arc<ProviderSlot> {
        if let Some(slot) = self.slot(provider) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            slots
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(ProviderSlot::new())),
        )
    }

    /// `true` unless the provider is inside an unexpired cooldown.
    pub fn is_healthy(&self, provider: &str) -> bool {
        let Some(slot) = self.slot(provider) else {
            return true;
        };
        let until = slot.unhealthy_until_ms.load(Ordering::Acquire);
        until == 0 || self.now_ms() >= until
    }

    /// Record the outcome of one attempt.
    pub fn record_outcome(&self, provider: &str, outcome: AttemptOutcome) -> HealthTransition {
        if outcome == AttemptOutcome::CallerError {
            return HealthTransition::Unchanged;
        }

        let slot = self.slot_or_insert(provider);
        let mut window = slot.window.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let now_ms = self.to_ms(now);
        let until = slot.unhealthy_until_ms.load(Ordering::Acquire);

        if until != 0 && now_ms >= until {
            self.recover(provider, &slot, &mut window, "cooldown elapsed");
            if outcome == AttemptOutcome::Success {
                return HealthTransition::Recovered;
            }
        } else if until != 0 {
            // Still cooling down. A success here came through a bypass and
            // is direct evidence the provider works again.
            if outcome == AttemptOutcome::Success {
                self.recover(provider, &slot, &mut window, "success while unhealthy");
                return HealthTransition::Recovered;
            }
            return HealthTransition::Unchanged;
        }

        if outcome == AttemptOutcome::Success {
            return HealthTransition::Unchanged;
        }

        window.errors.push_back(now);
        while let Some(&oldest) = window.errors.front() {
            if now.saturating_duration_since(oldest) >= self.config.window {
                window.errors.pop_front();
            } else {
                break;
            }
        }

        let error_count = window.errors.len() as u32;
        if error_count > self.config.failure_threshold {
            let deadline = self.to_ms(now + self.config.cooldown);
            slot.unhealthy_until_ms.store(deadline, Ordering::Release);
            tracing::warn!(
                provider,
                error_count,
                window_secs = self.config.window.as_secs(),
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit breaker tripped, provider marked unhealthy"
            );
            return HealthTransition::Tripped {
                error_count,
                cooldown: self.config.cooldown,
            };
        }

        tracing::debug!(provider, error_count, ?outcome, "Recorded provider error");
        HealthTransition::Unchanged
    }

    fn recover(&self, provider: &str, slot: &ProviderSlot, window: &mut ErrorWindow, reason: &str) {
        window.errors.clear();
        slot.unhealthy_until_ms.store(0, Ordering::Release);
        tracing::info!(provider, reason, "Provider recovered, marked healthy");
    }

    /// Force a provider back to healthy.
    pub fn reset(&self, provider: &str) {
        if let Some(slot) = self.slot(provider) {
            let mut window = slot.window.lock().unwrap_or_else(|e| e.into_inner());
            self.recover(provider, &slot, &mut window, "manual reset");
        }
    }

    /// Recover every provider whose cooldown has elapsed. Returns their ids.
    pub fn sweep(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<ProviderSlot>)> = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let now_ms = self.now_ms();
        let mut recovered = Vec::new();
        for (provider, slot) in slots {
            let mut window = slot.window.lock().unwrap_or_else(|e| e.into_inner());
            let until = slot.unhealthy_until_ms.load(Ordering::Acquire);
            if until != 0 && now_ms >= until {
                self.recover(&provider, &slot, &mut window, "cooldown elapsed");
                recovered.push(provider);
            }
        }
        recovered
    }

    pub fn snapshot(&self, provider: &str) -> ProviderHealthState {
        let Some(slot) = self.slot(provider) else {
            return ProviderHealthState {
                provider_id: provider.to_string(),
                error_count: 0,
                window_start: None,
                status: ProviderStatus::Healthy,
                unhealthy_until: None,
            };
        };

        let window = slot.window.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let until = slot.unhealthy_until_ms.load(Ordering::Acquire);
        let unhealthy = until != 0 && self.to_ms(now) < until;
        let live: Vec<Instant> = if unhealthy {
            window.errors.iter().copied().collect()
        } else {
            window
                .errors
                .iter()
                .copied()
                .filter(|&t| now.saturating_duration_since(t) < self.config.window)
                .collect()
        };

        ProviderHealthState {
            provider_id: provider.to_string(),
            error_count: if until != 0 && !unhealthy { 0 } else { live.len() as u32 },
            window_start: if until != 0 && !unhealthy { None } else { live.first().copied() },
            status: if unhealthy {
                ProviderStatus::Unhealthy
            } else {
                ProviderStatus::Healthy
            },
            unhealthy_until: unhealthy.then(|| self.instant_at_ms(until)),
        }
    }

    /// Snapshots of every known provider, sorted by id.
    pub fn snapshots(&self) -> Vec<ProviderHealthState> {
        let mut ids: Vec<String> = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids.iter().map(|id| self.snapshot(id)).collect()
    }

    /// Drop candidates whose provider is unhealthy.
    pub fn filter(&self, chain: &[ModelDefinition]) -> Vec<ModelDefinition> {
        chain
            .iter()
            .filter(|m| self.is_healthy(&m.provider))
            .cloned()
            .collect()
    }

    /// Like [`filter`](Self::filter), but if every candidate is unhealthy the
    /// first original candidate is kept so the request is still attempted.
    pub fn filter_or_bypass(&self, chain: &[ModelDefinition]) -> FilteredChain {
        let candidates = self.filter(chain);
        match chain.first() {
            Some(first) if candidates.is_empty() => {
                tracing::warn!(
                    model = %first.id,
                    provider = %first.provider,
                    chain_len = chain.len(),
                    "All candidates unhealthy, bypassing health filter"
                );
                FilteredChain {
                    candidates: vec![first.clone()],
                    bypassed: true,
                }
            }
            _ => FilteredChain {
                candidates,
                bypassed: false,
            },
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
