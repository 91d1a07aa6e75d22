//! Sequence barriers: a consumer's view of what is safe to read.
//!
//! A barrier combines the sequencer's cursor with the sequences of any
//! upstream consumers this one must stay behind, and delegates the actual
//! waiting to the engine's wait strategy. It also carries the alert flag that
//! makes halting cooperative: an alerted barrier interrupts the wait and
//! surfaces [`EngineError::Alerted`] instead of a sequence.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;

use crate::sequence::Sequence;
use crate::sequencer::Sequencer;
use crate::wait_strategy::WaitStrategy;
use crate::{EngineError, Result};

/// Per-consumer coordination point.
pub trait SequenceBarrier: Send + Sync {
    /// Wait until `sequence` is safe to read.
    ///
    /// Returns the highest available sequence, which is usually higher than
    /// requested (the consumer then drains the whole run as one batch). With
    /// a multi-producer sequencer the result can also be *lower* than
    /// requested when a publication gap exists; callers must re-wait in that
    /// case.
    ///
    /// # Errors
    /// [`EngineError::Alerted`] once the barrier is alerted,
    /// [`EngineError::Timeout`] from a bounded wait strategy.
    fn wait_for(&self, sequence: i64) -> Result<i64>;

    /// The cursor this barrier tracks.
    fn cursor(&self) -> Arc<Sequence>;

    /// Interrupt any waiting thread and make subsequent waits fail fast.
    fn alert(&self);

    /// Reset the alert flag, re-arming the barrier.
    fn clear_alert(&self);

    /// True while the barrier is alerted.
    fn is_alerted(&self) -> bool;
}

/// Standard barrier implementation over a sequencer.
pub struct ProcessingSequenceBarrier {
    cursor: Arc<Sequence>,
    /// Upstream consumers this barrier must wait behind; empty for the first
    /// stage of a pipeline.
    dependents: Vec<Arc<Sequence>>,
    wait_strategy: Arc<dyn WaitStrategy>,
    sequencer: Arc<dyn Sequencer>,
    alerted: AtomicBool,
}

impl ProcessingSequenceBarrier {
    pub fn new(
        sequencer: Arc<dyn Sequencer>,
        wait_strategy: Arc<dyn WaitStrategy>,
        dependents: Vec<Arc<Sequence>>,
    ) -> Self {
        Self {
            cursor: sequencer.cursor(),
            dependents,
            wait_strategy,
            sequencer,
            alerted: AtomicBool::new(false),
        }
    }
}

impl SequenceBarrier for ProcessingSequenceBarrier {
    fn wait_for(&self, sequence: i64) -> Result<i64> {
        if self.is_alerted() {
            return Err(EngineError::Alerted);
        }

        let available =
            self.wait_strategy
                .wait_for(sequence, &self.cursor, &self.dependents, &self.alerted)?;

        // Pair with the publisher's release store before any slot read.
        fence(Ordering::Acquire);

        if available < sequence {
            return Ok(available);
        }

        // A multi-producer cursor counts claims, not publications; trim the
        // result to the highest contiguous published sequence.
        Ok(self.sequencer.highest_published(sequence, available))
    }

    fn cursor(&self) -> Arc<Sequence> {
        Arc::clone(&self.cursor)
    }

    fn alert(&self) {
        self.alerted.store(true, Ordering::Release);
        self.wait_strategy.signal_all_when_blocking();
    }

    fn clear_alert(&self) {
        self.alerted.store(false, Ordering::Release);
    }

    fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::{MultiProducerSequencer, SingleProducerSequencer};
    use crate::wait_strategy::BusySpinWaitStrategy;
    use std::thread;
    use std::time::Duration;

    fn barrier_over(
        sequencer: Arc<dyn Sequencer>,
        dependents: Vec<Arc<Sequence>>,
    ) -> ProcessingSequenceBarrier {
        ProcessingSequenceBarrier::new(
            sequencer,
            Arc::new(BusySpinWaitStrategy::new()),
            dependents,
        )
    }

    #[test]
    fn test_wait_for_returns_published_sequence() {
        let sequencer: Arc<dyn Sequencer> = Arc::new(SingleProducerSequencer::new(
            8,
            Arc::new(BusySpinWaitStrategy::new()),
        ));
        let barrier = barrier_over(Arc::clone(&sequencer), vec![]);

        let seq = sequencer.claim_batch(3);
        sequencer.publish(seq);

        assert_eq!(barrier.wait_for(0), Ok(2));
    }

    #[test]
    fn test_alert_interrupts_and_fails_fast() {
        let sequencer: Arc<dyn Sequencer> = Arc::new(SingleProducerSequencer::new(
            8,
            Arc::new(BusySpinWaitStrategy::new()),
        ));
        let barrier = Arc::new(barrier_over(Arc::clone(&sequencer), vec![]));

        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait_for(0))
        };

        thread::sleep(Duration::from_millis(5));
        barrier.alert();
        assert_eq!(waiter.join().unwrap(), Err(EngineError::Alerted));

        // Alert is sticky until cleared.
        assert_eq!(barrier.wait_for(0), Err(EngineError::Alerted));
        barrier.clear_alert();
        assert!(!barrier.is_alerted());
    }

    #[test]
    fn test_dependent_sequences_cap_availability() {
        let sequencer: Arc<dyn Sequencer> = Arc::new(SingleProducerSequencer::new(
            8,
            Arc::new(BusySpinWaitStrategy::new()),
        ));
        let upstream = Arc::new(Sequence::new(3));
        let barrier = barrier_over(Arc::clone(&sequencer), vec![Arc::clone(&upstream)]);

        let seq = sequencer.claim_batch(6);
        sequencer.publish(seq);

        // Cursor is at 5 but the upstream consumer has only reached 3.
        assert_eq!(barrier.wait_for(0), Ok(3));
    }

    #[test]
    fn test_multi_producer_gap_trims_result() {
        let sequencer = Arc::new(MultiProducerSequencer::new(
            8,
            Arc::new(BusySpinWaitStrategy::new()),
        ));
        let barrier = barrier_over(sequencer.clone() as Arc<dyn Sequencer>, vec![]);

        let first = sequencer.try_claim_next().unwrap();
        let second = sequencer.try_claim_next().unwrap();
        sequencer.publish(second);

        // The cursor has advanced past the unpublished first claim; the
        // barrier must not expose the gap, so the result falls short of the
        // request and the caller re-waits.
        assert_eq!(barrier.wait_for(first), Ok(first - 1));

        sequencer.publish(first);
        assert_eq!(barrier.wait_for(first), Ok(second));
    }
}
