//! # Circuit Breaker (C3)
//!
//! Per-provider failure isolation. The dispatcher (C8) classifies each
//! provider outcome as retryable or fatal (§7) and reports it here;
//! the breaker itself never inspects error values, so it stays
//! decoupled from the provider error taxonomy.
//!
//! ## States
//!
//! - **Closed** — all calls admitted; consecutive retryable failures
//!   are counted.
//! - **Open** — all calls rejected until `cooldown` has elapsed since
//!   the state was entered; the first caller after cooldown is
//!   admitted and flips the breaker to half-open.
//! - **HalfOpen** — up to `probe_limit` concurrent calls admitted as
//!   probes; a single success closes the breaker (configurable via
//!   `success_threshold`), a single failure reopens it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Operational state of a provider's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Result of a guarded call, reported by the caller rather than
/// inferred from an error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Counts toward the failure threshold.
    RetryableFailure,
    /// Does not count toward the failure threshold (e.g. a 4xx
    /// client error the provider is not responsible for).
    FatalFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive retryable failures in `Closed` before tripping to `Open`.
    pub failure_threshold: u32,
    /// Time to wait in `Open` before admitting a probe.
    #[serde(with = "crate::common::duration_serde")]
    pub cooldown: Duration,
    /// Max concurrent probes admitted while `HalfOpen`.
    pub probe_limit: u32,
    /// Consecutive half-open successes required to close. Spec default is 1.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_success_threshold() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            probe_limit: 1,
            success_threshold: 1,
        }
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_successes: u32,
    half_open_probes_in_flight: u32,
    opened_at: Option<Instant>,
    last_failure_time: Option<Instant>,
    last_success_time: Option<Instant>,
    last_transition: Instant,
}

impl Default for State {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_successes: 0,
            half_open_probes_in_flight: 0,
            opened_at: None,
            last_failure_time: None,
            last_success_time: None,
            last_transition: Instant::now(),
        }
    }
}

/// Raised when a call is rejected by the breaker rather than attempted.
#[derive(Debug, thiserror::Error)]
#[error("circuit open for provider")]
pub struct CircuitOpen;

/// A state-change event emitted for the metrics/audit layer (C9).
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub provider_id: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

pub struct CircuitBreaker {
    provider_id: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<State>>,
}

impl CircuitBreaker {
    pub fn new(provider_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self { provider_id: provider_id.into(), config, state: Arc::new(RwLock::new(State::default())) }
    }

    /// Admission check. Returns `Ok(())` if the caller may proceed with
    /// the provider call; `Err(CircuitOpen)` otherwise. On the
    /// transition from `Open` to `HalfOpen` or `Closed` to `Open`, a
    /// [`TransitionEvent`] is returned alongside for the caller to
    /// forward to the metrics layer.
    pub async fn try_acquire(&self) -> Result<Option<TransitionEvent>, CircuitOpen> {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let opened_at = state.opened_at.unwrap_or(state.last_transition);
                if opened_at.elapsed() >= self.config.cooldown {
                    let event = self.transition(&mut state, CircuitState::HalfOpen);
                    state.half_open_probes_in_flight = 1;
                    Ok(Some(event))
                } else {
                    Err(CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_probes_in_flight < self.config.probe_limit {
                    state.half_open_probes_in_flight += 1;
                    Ok(None)
                } else {
                    Err(CircuitOpen)
                }
            }
        }
    }

    /// Reports the outcome of a call previously admitted via
    /// [`Self::try_acquire`]. Returns the transition event, if any.
    pub async fn report(&self, outcome: Outcome) -> Option<TransitionEvent> {
        let mut state = self.state.write().await;
        match outcome {
            Outcome::Success => self.on_success(&mut state),
            Outcome::RetryableFailure => self.on_failure(&mut state),
            Outcome::FatalFailure => {
                // Does not count toward the threshold, but still
                // releases the half-open probe slot it occupied.
                if state.state == CircuitState::HalfOpen {
                    state.half_open_probes_in_flight = state.half_open_probes_in_flight.saturating_sub(1);
                }
                None
            }
        }
    }

    fn on_success(&self, state: &mut State) -> Option<TransitionEvent> {
        state.success_count += 1;
        state.last_success_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                state.half_open_probes_in_flight = state.half_open_probes_in_flight.saturating_sub(1);
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.success_threshold {
                    state.failure_count = 0;
                    Some(self.transition(state, CircuitState::Closed))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    fn on_failure(&self, state: &mut State) -> Option<TransitionEvent> {
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    Some(self.transition(state, CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                state.half_open_probes_in_flight = state.half_open_probes_in_flight.saturating_sub(1);
                Some(self.transition(state, CircuitState::Open))
            }
            CircuitState::Open => None,
        }
    }

    fn transition(&self, state: &mut State, to: CircuitState) -> TransitionEvent {
        let from = state.state;
        state.state = to;
        state.last_transition = Instant::now();
        state.half_open_successes = 0;
        if to == CircuitState::Open {
            state.opened_at = Some(Instant::now());
        }
        tracing::info!(provider_id = %self.provider_id, ?from, ?to, "circuit breaker transition");
        TransitionEvent { provider_id: self.provider_id.clone(), from, to }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.read().await;
        CircuitBreakerMetrics {
            provider_id: self.provider_id.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_time: state.last_failure_time,
            last_success_time: state.last_success_time,
        }
    }

    pub async fn force_open(&self) {
        let mut state = self.state.write().await;
        self.transition(&mut state, CircuitState::Open);
    }

    pub async fn force_closed(&self) {
        let mut state = self.state.write().await;
        state.failure_count = 0;
        state.half_open_probes_in_flight = 0;
        self.transition(&mut state, CircuitState::Closed);
    }
}

#[derive(Debug)]
pub struct CircuitBreakerMetrics {
    pub provider_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
}
