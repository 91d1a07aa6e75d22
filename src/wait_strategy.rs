//! Wait strategies: how a consumer burns (or saves) CPU while waiting.
//!
//! A strategy is stateless policy shared by every barrier in an engine and is
//! chosen once at construction. Each variant trades latency against CPU in a
//! different place:
//!
//! - [`BusySpinWaitStrategy`]: tight re-check loop. Lowest latency, pins a
//!   core at 100%.
//! - [`YieldingWaitStrategy`]: spins briefly, then yields its time slice
//!   between checks.
//! - [`SleepingWaitStrategy`]: spins, yields, then sleeps between checks.
//!   Bounded CPU, highest tail latency of the spinning family.
//! - [`BlockingWaitStrategy`]: parks on a condvar and is woken by publishers.
//!   Lowest CPU, highest latency; optionally bounded, surfacing
//!   [`EngineError::Timeout`] as a distinct result.
//!
//! Every strategy re-checks the barrier's alert flag inside its wait loop, so
//! a halt request interrupts even a busy-spinning consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::sequence::Sequence;
use crate::{EngineError, Result};

/// Policy invoked by a barrier when the awaited sequence is not yet available.
pub trait WaitStrategy: Send + Sync + std::fmt::Debug {
    /// Wait until the highest available sequence reaches `sequence`.
    ///
    /// "Available" is the cursor when `dependents` is empty, otherwise the
    /// minimum of the dependent sequences (a consumer may never overtake the
    /// stages it depends on). Returns the available sequence, which may be
    /// higher than requested.
    ///
    /// # Errors
    /// [`EngineError::Alerted`] if `alerted` becomes true while waiting;
    /// [`EngineError::Timeout`] if the strategy is bounded and the bound
    /// elapses first.
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alerted: &AtomicBool,
    ) -> Result<i64>;

    /// Wake any thread parked in [`WaitStrategy::wait_for`]. Called by
    /// publishers and by barriers when alerting. Only the blocking strategy
    /// has anything to do here.
    fn signal_all_when_blocking(&self);
}

/// Highest available sequence for a waiting consumer.
#[inline]
fn available_sequence(cursor: &Sequence, dependents: &[Arc<Sequence>]) -> i64 {
    if dependents.is_empty() {
        cursor.get()
    } else {
        Sequence::minimum_sequence(dependents, i64::MAX)
    }
}

/// Tight re-check loop with a spin hint. Dedicate a core to each consumer.
#[derive(Debug, Default)]
pub struct BusySpinWaitStrategy;

impl BusySpinWaitStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl WaitStrategy for BusySpinWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alerted: &AtomicBool,
    ) -> Result<i64> {
        loop {
            let available = available_sequence(cursor, dependents);
            if available >= sequence {
                return Ok(available);
            }
            if alerted.load(Ordering::Acquire) {
                return Err(EngineError::Alerted);
            }
            std::hint::spin_loop();
        }
    }

    fn signal_all_when_blocking(&self) {}
}

/// Spins for a bounded number of iterations, then yields between checks.
#[derive(Debug, Default)]
pub struct YieldingWaitStrategy;

const SPIN_TRIES: u32 = 100;

impl YieldingWaitStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alerted: &AtomicBool,
    ) -> Result<i64> {
        let mut counter = SPIN_TRIES;
        loop {
            let available = available_sequence(cursor, dependents);
            if available >= sequence {
                return Ok(available);
            }
            if alerted.load(Ordering::Acquire) {
                return Err(EngineError::Alerted);
            }
            if counter > 0 {
                counter -= 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn signal_all_when_blocking(&self) {}
}

/// Spins, then yields, then sleeps between checks.
#[derive(Debug)]
pub struct SleepingWaitStrategy {
    sleep_duration: Duration,
}

impl SleepingWaitStrategy {
    pub fn new() -> Self {
        Self {
            sleep_duration: Duration::from_micros(100),
        }
    }

    /// Use a custom sleep interval between checks.
    pub fn with_sleep(sleep_duration: Duration) -> Self {
        Self { sleep_duration }
    }
}

impl Default for SleepingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alerted: &AtomicBool,
    ) -> Result<i64> {
        let mut counter = 2 * SPIN_TRIES;
        loop {
            let available = available_sequence(cursor, dependents);
            if available >= sequence {
                return Ok(available);
            }
            if alerted.load(Ordering::Acquire) {
                return Err(EngineError::Alerted);
            }
            if counter > SPIN_TRIES {
                counter -= 1;
                std::hint::spin_loop();
            } else if counter > 0 {
                counter -= 1;
                std::thread::yield_now();
            } else {
                std::thread::sleep(self.sleep_duration);
            }
        }
    }

    fn signal_all_when_blocking(&self) {}
}

/// Parks on a condvar until a publisher signals, optionally bounded.
///
/// Publishers call [`WaitStrategy::signal_all_when_blocking`] after every
/// publish, so a parked consumer cannot miss an update: the availability
/// check happens under the lock before each park, and the park itself uses a
/// short tick as a backstop.
#[derive(Debug, Default)]
pub struct BlockingWaitStrategy {
    mutex: Mutex<()>,
    condvar: Condvar,
    timeout: Option<Duration>,
}

/// Backstop re-check interval while parked.
const PARK_TICK: Duration = Duration::from_millis(1);

impl BlockingWaitStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every wait: once `timeout` elapses with no new sequence, the
    /// wait returns [`EngineError::Timeout`] instead of parking further.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            timeout: Some(timeout),
        }
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &[Arc<Sequence>],
        alerted: &AtomicBool,
    ) -> Result<i64> {
        // Fast path: no need to touch the lock when data is already there.
        let available = available_sequence(cursor, dependents);
        if available >= sequence {
            return Ok(available);
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut guard = self.mutex.lock();
        loop {
            let available = available_sequence(cursor, dependents);
            if available >= sequence {
                return Ok(available);
            }
            if alerted.load(Ordering::Acquire) {
                return Err(EngineError::Alerted);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(EngineError::Timeout(sequence));
                }
            }
            self.condvar.wait_for(&mut guard, PARK_TICK);
        }
    }

    fn signal_all_when_blocking(&self) {
        self.condvar.notify_all();
    }
}
