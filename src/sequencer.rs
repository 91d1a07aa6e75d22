//! Sequencers coordinate slot claims between producers and consumers.
//!
//! A sequencer owns the cursor (the highest published sequence) and the set
//! of gating sequences (consumer positions). A claim may only advance while
//! `claimed - min(gating) < capacity`; this is the engine's sole backpressure
//! mechanism, so a producer can never overrun an unconsumed slot.
//!
//! Two variants:
//!
//! - [`SingleProducerSequencer`]: claiming is a plain increment of a
//!   producer-local counter; publish is one release store of the cursor. By
//!   contract only one thread claims.
//! - [`MultiProducerSequencer`]: claiming is a CAS loop on the cursor, and
//!   publish marks a per-slot availability flag, because sequences may finish
//!   writing out of claim order. Consumers must only trust the highest
//!   *contiguous* published sequence.

use std::sync::atomic::{AtomicI64, AtomicI32, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

use crate::sequence::Sequence;
use crate::wait_strategy::WaitStrategy;
use crate::{is_power_of_two, EngineError, Result, INITIAL_CURSOR_VALUE};

/// Claim/publish coordination for one ring buffer.
pub trait Sequencer: Send + Sync + std::fmt::Debug {
    /// Claim the next sequence, waiting (spin/yield) while the ring is full.
    /// The blocking claim never fails; it only waits.
    fn claim_next(&self) -> i64 {
        self.claim_batch(1)
    }

    /// Claim the next `n` sequences, waiting while capacity is short.
    /// Returns the highest claimed sequence.
    ///
    /// # Panics
    /// Panics if `n < 1` or `n` exceeds the ring capacity, since such a claim
    /// could never be satisfied.
    fn claim_batch(&self, n: i64) -> i64;

    /// Claim the next sequence without waiting.
    ///
    /// # Errors
    /// [`EngineError::InsufficientCapacity`] when the ring is full.
    fn try_claim_next(&self) -> Result<i64> {
        self.try_claim_batch(1)
    }

    /// Claim the next `n` sequences without waiting.
    fn try_claim_batch(&self, n: i64) -> Result<i64>;

    /// Make `sequence` visible to consumers. Acts as the release barrier for
    /// the slot write that preceded it.
    fn publish(&self, sequence: i64);

    /// Publish every sequence in `low..=high`.
    fn publish_range(&self, low: i64, high: i64);

    /// True once `sequence` has been published.
    fn is_available(&self, sequence: i64) -> bool;

    /// Highest sequence in `from..=to` such that every sequence up to it has
    /// been published. Returns `from - 1` when `from` itself is unpublished.
    fn highest_published(&self, from: i64, to: i64) -> i64;

    /// The cursor this sequencer advances.
    fn cursor(&self) -> Arc<Sequence>;

    /// Ring capacity.
    fn capacity(&self) -> usize;

    /// Free slots left before a claim would wait.
    fn remaining_capacity(&self) -> i64;

    /// Register consumer sequences the producer must not overtake.
    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]);

    /// Unregister a gating sequence. Returns true if it was present.
    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool;

    /// Minimum over the gating sequences, or the cursor value when none are
    /// registered.
    fn minimum_gating_sequence(&self) -> i64;
}

/// One spin-then-yield step of a producer capacity wait.
#[inline]
fn claim_backoff(counter: &mut u32) {
    if *counter < 100 {
        *counter += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

fn assert_valid_batch(n: i64, capacity: i64) {
    assert!(
        n >= 1 && n <= capacity,
        "batch of {n} can never fit a ring of capacity {capacity}"
    );
}

/// Sequencer for exactly one producer thread.
///
/// The claim counter is producer-local; the shared cursor only moves on
/// publish, so consumers can never observe a claimed-but-unwritten slot.
#[derive(Debug)]
pub struct SingleProducerSequencer {
    capacity: i64,
    cursor: Arc<Sequence>,
    /// Highest claimed sequence. Written only by the producer thread.
    next_value: CachePadded<AtomicI64>,
    /// Last observed minimum gating sequence, to avoid re-reading consumer
    /// positions on every claim.
    cached_gating: CachePadded<AtomicI64>,
    gating_sequences: RwLock<Vec<Arc<Sequence>>>,
    wait_strategy: Arc<dyn WaitStrategy>,
}

impl SingleProducerSequencer {
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        assert!(is_power_of_two(capacity), "capacity must be a power of two");
        Self {
            capacity: capacity as i64,
            cursor: Arc::new(Sequence::default()),
            next_value: CachePadded::new(AtomicI64::new(INITIAL_CURSOR_VALUE)),
            cached_gating: CachePadded::new(AtomicI64::new(INITIAL_CURSOR_VALUE)),
            gating_sequences: RwLock::new(Vec::new()),
            wait_strategy,
        }
    }

    fn minimum_gating(&self, fallback: i64) -> i64 {
        let sequences = self.gating_sequences.read();
        Sequence::minimum_sequence(&sequences, fallback)
    }
}

impl Sequencer for SingleProducerSequencer {
    fn claim_batch(&self, n: i64) -> i64 {
        assert_valid_batch(n, self.capacity);

        let claimed = self.next_value.load(Ordering::Relaxed);
        let next = claimed + n;
        let wrap_point = next - self.capacity;

        if wrap_point > self.cached_gating.load(Ordering::Relaxed) {
            let mut counter = 0;
            loop {
                let min = self.minimum_gating(claimed);
                if wrap_point <= min {
                    self.cached_gating.store(min, Ordering::Relaxed);
                    break;
                }
                claim_backoff(&mut counter);
            }
        }

        self.next_value.store(next, Ordering::Relaxed);
        next
    }

    fn try_claim_batch(&self, n: i64) -> Result<i64> {
        assert_valid_batch(n, self.capacity);

        let claimed = self.next_value.load(Ordering::Relaxed);
        let next = claimed + n;
        let wrap_point = next - self.capacity;

        if wrap_point > self.cached_gating.load(Ordering::Relaxed) {
            let min = self.minimum_gating(claimed);
            if wrap_point > min {
                return Err(EngineError::InsufficientCapacity);
            }
            self.cached_gating.store(min, Ordering::Relaxed);
        }

        self.next_value.store(next, Ordering::Relaxed);
        Ok(next)
    }

    fn publish(&self, sequence: i64) {
        self.cursor.set(sequence);
        self.wait_strategy.signal_all_when_blocking();
    }

    fn publish_range(&self, _low: i64, high: i64) {
        // Cursor publication is cumulative for a single producer.
        self.publish(high);
    }

    fn is_available(&self, sequence: i64) -> bool {
        sequence <= self.cursor.get()
    }

    fn highest_published(&self, _from: i64, to: i64) -> i64 {
        // Everything at or below the cursor is published, and `to` never
        // exceeds what the barrier observed on the cursor.
        to
    }

    fn cursor(&self) -> Arc<Sequence> {
        Arc::clone(&self.cursor)
    }

    fn capacity(&self) -> usize {
        self.capacity as usize
    }

    fn remaining_capacity(&self) -> i64 {
        let claimed = self.next_value.load(Ordering::Relaxed);
        let consumed = self.minimum_gating(claimed);
        self.capacity - (claimed - consumed)
    }

    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]) {
        self.gating_sequences.write().extend_from_slice(sequences);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        let mut sequences = self.gating_sequences.write();
        if let Some(pos) = sequences.iter().position(|s| Arc::ptr_eq(s, sequence)) {
            sequences.remove(pos);
            true
        } else {
            false
        }
    }

    fn minimum_gating_sequence(&self) -> i64 {
        self.minimum_gating(self.cursor.get())
    }
}

/// Sequencer for concurrent producer threads.
///
/// The cursor tracks the highest *claimed* sequence. Because claims can
/// complete their writes out of order, publication is tracked per slot with
/// an epoch flag (`sequence >> log2(capacity)`), and consumers read the
/// highest contiguous published sequence through
/// [`Sequencer::highest_published`].
#[derive(Debug)]
pub struct MultiProducerSequencer {
    capacity: i64,
    cursor: Arc<Sequence>,
    gating_sequences: RwLock<Vec<Arc<Sequence>>>,
    wait_strategy: Arc<dyn WaitStrategy>,
    /// Per-slot publication epoch, initialised to -1 (never published).
    available: Box<[AtomicI32]>,
    index_mask: i64,
    index_shift: u32,
    cached_gating: CachePadded<AtomicI64>,
}

impl MultiProducerSequencer {
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        assert!(is_power_of_two(capacity), "capacity must be a power of two");
        let available: Box<[AtomicI32]> = (0..capacity).map(|_| AtomicI32::new(-1)).collect();
        Self {
            capacity: capacity as i64,
            cursor: Arc::new(Sequence::default()),
            gating_sequences: RwLock::new(Vec::new()),
            wait_strategy,
            available,
            index_mask: (capacity - 1) as i64,
            index_shift: capacity.trailing_zeros(),
            cached_gating: CachePadded::new(AtomicI64::new(INITIAL_CURSOR_VALUE)),
        }
    }

    fn minimum_gating(&self, fallback: i64) -> i64 {
        let sequences = self.gating_sequences.read();
        Sequence::minimum_sequence(&sequences, fallback)
    }

    #[inline]
    fn availability_flag(&self, sequence: i64) -> i32 {
        (sequence >> self.index_shift) as i32
    }

    #[inline]
    fn set_available(&self, sequence: i64) {
        let index = (sequence & self.index_mask) as usize;
        self.available[index].store(self.availability_flag(sequence), Ordering::Release);
    }

    #[inline]
    fn is_published(&self, sequence: i64) -> bool {
        let index = (sequence & self.index_mask) as usize;
        self.available[index].load(Ordering::Acquire) == self.availability_flag(sequence)
    }

    /// Capacity check against the cached (and, on miss, refreshed) minimum
    /// gating sequence.
    fn has_capacity(&self, current: i64, n: i64) -> bool {
        let wrap_point = current + n - self.capacity;
        if wrap_point > self.cached_gating.load(Ordering::Acquire) {
            let min = self.minimum_gating(current);
            self.cached_gating.store(min, Ordering::Release);
            if wrap_point > min {
                return false;
            }
        }
        true
    }
}

impl Sequencer for MultiProducerSequencer {
    fn claim_batch(&self, n: i64) -> i64 {
        assert_valid_batch(n, self.capacity);

        let mut counter = 0;
        loop {
            let current = self.cursor.get();
            if !self.has_capacity(current, n) {
                claim_backoff(&mut counter);
                continue;
            }
            let next = current + n;
            if self.cursor.compare_and_set(current, next) {
                return next;
            }
            // Lost the CAS to another producer; re-read and retry.
        }
    }

    fn try_claim_batch(&self, n: i64) -> Result<i64> {
        assert_valid_batch(n, self.capacity);

        loop {
            let current = self.cursor.get();
            if !self.has_capacity(current, n) {
                return Err(EngineError::InsufficientCapacity);
            }
            let next = current + n;
            if self.cursor.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    fn publish(&self, sequence: i64) {
        self.set_available(sequence);
        self.wait_strategy.signal_all_when_blocking();
    }

    fn publish_range(&self, low: i64, high: i64) {
        for sequence in low..=high {
            self.set_available(sequence);
        }
        self.wait_strategy.signal_all_when_blocking();
    }

    fn is_available(&self, sequence: i64) -> bool {
        self.is_published(sequence)
    }

    fn highest_published(&self, from: i64, to: i64) -> i64 {
        let mut sequence = from;
        while sequence <= to {
            if !self.is_published(sequence) {
                return sequence - 1;
            }
            sequence += 1;
        }
        to
    }

    fn cursor(&self) -> Arc<Sequence> {
        Arc::clone(&self.cursor)
    }

    fn capacity(&self) -> usize {
        self.capacity as usize
    }

    fn remaining_capacity(&self) -> i64 {
        let claimed = self.cursor.get();
        let consumed = self.minimum_gating(claimed);
        self.capacity - (claimed - consumed)
    }

    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]) {
        self.gating_sequences.write().extend_from_slice(sequences);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        let mut sequences = self.gating_sequences.write();
        if let Some(pos) = sequences.iter().position(|s| Arc::ptr_eq(s, sequence)) {
            sequences.remove(pos);
            true
        } else {
            false
        }
    }

    fn minimum_gating_sequence(&self) -> i64 {
        self.minimum_gating(self.cursor.get())
    }
}
