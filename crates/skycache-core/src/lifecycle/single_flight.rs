use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct Flight {
    started: Instant,
    generation: u64,
}

#[derive(Debug, Default)]
struct State {
    current: Option<Flight>,
    next_generation: u64,
}

/// Lets at most one execution of a lifecycle operation run at a time.
///
/// A flight older than `stale_after` is treated as abandoned and may be
/// taken over, so a holder that never finished cannot block the operation
/// forever. The abandoned holder's guard no longer clears the flag.
#[derive(Debug)]
pub struct SingleFlight {
    operation: &'static str,
    stale_after: Duration,
    state: Mutex<State>,
}

/// Held for the duration of one flight. Dropping it ends the flight.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
    generation: u64,
}

impl SingleFlight {
    pub fn new(operation: &'static str, stale_after: Duration) -> Self {
        Self {
            operation,
            stale_after,
            state: Mutex::new(State::default()),
        }
    }

    /// Start a flight, or return `None` if one is already in progress.
    pub fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(flight) = state.current {
            let held_for = flight.started.elapsed();
            if held_for < self.stale_after {
                debug!(operation = self.operation, ?held_for, "Already in progress, skipping");
                return None;
            }
            warn!(operation = self.operation, ?held_for, "Taking over abandoned flight");
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.current = Some(Flight {
            started: Instant::now(),
            generation,
        });

        Some(FlightGuard {
            flight: self,
            generation,
        })
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .is_some()
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .flight
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.current.map(|f| f.generation) == Some(self.generation) {
            state.current = None;
        }
    }
}
