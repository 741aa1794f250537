//! Running pulse count, persisted on every mutation.

use crate::error::{AgentError, Result};
use crate::meter::{MeterState, PulseEvent};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Result of a state mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// State after the mutation
    pub state: MeterState,
    /// Whether the mutation reached durable storage
    pub persisted: bool,
}

struct Inner {
    state: MeterState,
    store: Box<dyn StateStore>,
    dirty: bool,
}

/// Single source of truth for how much has been measured.
///
/// The state and its store sit behind one mutex, so the persisted sequence of
/// states always matches the order in which pulses and reports were applied.
pub struct Accumulator {
    inner: Mutex<Inner>,
}

impl Accumulator {
    /// Start from an explicit state.
    pub fn new(state: MeterState, store: Box<dyn StateStore>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                store,
                dirty: false,
            }),
        }
    }

    /// Restore the last persisted state from `store`.
    ///
    /// A store that holds only corrupted records is reset to zero so the
    /// device keeps counting; any other storage error aborts startup.
    pub fn recover(mut store: Box<dyn StateStore>) -> Result<Self> {
        let state = match store.load() {
            Ok(Some(state)) => {
                info!(
                    total = state.total_pulses,
                    outstanding = state.pulses_since_last_report,
                    "Recovered meter state"
                );
                state
            }
            Ok(None) => {
                info!("No persisted meter state, starting from zero");
                MeterState::default()
            }
            Err(AgentError::StorageCorrupt(reason)) => {
                error!("Persisted meter state is unrecoverable, resetting: {}", reason);
                MeterState::default()
            }
            Err(e) => return Err(e),
        };

        Ok(Self::new(state, store))
    }

    /// Count a confirmed pulse and persist before acknowledging it.
    pub fn on_pulse(&self, event: &PulseEvent) -> Receipt {
        let mut inner = self.lock();
        inner.state.record_pulse();
        debug!(
            sequence = event.sequence,
            total = inner.state.total_pulses,
            outstanding = inner.state.pulses_since_last_report,
            "Pulse counted"
        );
        Self::persist_locked(&mut inner)
    }

    /// Subtract `count` successfully pushed pulses and persist the new baseline.
    pub fn on_report_success(&self, count: u64, at: DateTime<Utc>) -> Receipt {
        let mut inner = self.lock();
        let applied = inner.state.record_report(count, at);
        if applied < count {
            warn!(
                reported = count,
                applied, "Report covered more pulses than were outstanding"
            );
        }
        Self::persist_locked(&mut inner)
    }

    /// Retry a persist that failed earlier.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.dirty {
            return Ok(());
        }
        let state = inner.state.clone();
        inner.store.save(&state)?;
        inner.dirty = false;
        Ok(())
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> MeterState {
        self.lock().state.clone()
    }

    /// Pulses not yet covered by a successful push.
    pub fn outstanding(&self) -> u64 {
        self.lock().state.pulses_since_last_report
    }

    /// Whether the in-memory state is ahead of storage.
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    fn persist_locked(inner: &mut Inner) -> Receipt {
        let state = inner.state.clone();
        let persisted = match inner.store.save(&state) {
            Ok(()) => {
                inner.dirty = false;
                true
            }
            Err(e) => {
                warn!("Meter state kept in memory only: {}", e);
                inner.dirty = true;
                false
            }
        };
        Receipt { state, persisted }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Accumulator")
            .field("state", &inner.state)
            .field("dirty", &inner.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::time::Instant;

    fn pulse(sequence: u64) -> PulseEvent {
        PulseEvent {
            sequence,
            at: Instant::now(),
        }
    }

    #[test]
    fn test_each_pulse_is_persisted() {
        let store = MemoryStore::new();
        let accumulator = Accumulator::new(MeterState::default(), Box::new(store.clone()));

        for n in 1..=3 {
            let receipt = accumulator.on_pulse(&pulse(n));
            assert!(receipt.persisted);
            assert_eq!(store.saved(), Some(receipt.state));
        }
        assert_eq!(store.writes(), 3);
        assert_eq!(accumulator.outstanding(), 3);
    }

    #[test]
    fn test_report_success_subtracts_not_resets() {
        let store = MemoryStore::new();
        let accumulator = Accumulator::new(MeterState::default(), Box::new(store.clone()));
        for n in 1..=30 {
            accumulator.on_pulse(&pulse(n));
        }

        let receipt = accumulator.on_report_success(25, Utc::now());
        assert_eq!(receipt.state.pulses_since_last_report, 5);
        assert_eq!(receipt.state.total_pulses, 30);
        assert_eq!(store.saved().unwrap().pulses_since_last_report, 5);
    }

    #[test]
    fn test_storage_failure_keeps_counting() {
        let store = MemoryStore::new();
        let accumulator = Accumulator::new(MeterState::default(), Box::new(store.clone()));
        accumulator.on_pulse(&pulse(1));

        store.set_fail_writes(true);
        let receipt = accumulator.on_pulse(&pulse(2));
        assert!(!receipt.persisted);
        assert_eq!(receipt.state.total_pulses, 2);
        assert!(accumulator.is_dirty());
        assert_eq!(store.saved().unwrap().total_pulses, 1);

        store.set_fail_writes(false);
        accumulator.flush().unwrap();
        assert!(!accumulator.is_dirty());
        assert_eq!(store.saved().unwrap().total_pulses, 2);
    }

    #[test]
    fn test_recover_from_store() {
        let saved = MeterState {
            total_pulses: 120,
            pulses_since_last_report: 7,
            last_report_timestamp: None,
        };
        let store = MemoryStore::with_state(saved.clone());
        let accumulator = Accumulator::recover(Box::new(store)).unwrap();
        assert_eq!(accumulator.snapshot(), saved);
    }
}
