//! Producer facade: claim, mutate the slot in place, publish.
//!
//! The closure-based API keeps the claim/publish pairing structural: every
//! claimed sequence is published before the call returns, on every path. The
//! blocking variants never fail, they wait for capacity; the `try_` variants
//! surface [`EngineError::InsufficientCapacity`] and leave retry policy to
//! the caller.

use std::sync::Arc;

use crate::ring_buffer::{BatchIterMut, RingBuffer};
use crate::sequencer::Sequencer;
use crate::Result;

/// Handle for publishing events into the ring.
///
/// In single-producer mode exactly one handle exists and it must stay on one
/// thread at a time (it is `Send` but deliberately not `Clone`); in
/// multi-producer mode handles are cloned freely via
/// [`crate::Engine::producer`].
pub struct EventProducer<T>
where
    T: Send + Sync,
{
    ring_buffer: Arc<RingBuffer<T>>,
    sequencer: Arc<dyn Sequencer>,
}

impl<T> EventProducer<T>
where
    T: Send + Sync,
{
    pub(crate) fn new(ring_buffer: Arc<RingBuffer<T>>, sequencer: Arc<dyn Sequencer>) -> Self {
        Self {
            ring_buffer,
            sequencer,
        }
    }

    /// Publish one event, waiting for capacity if the ring is full.
    /// Returns the published sequence.
    pub fn publish<F>(&mut self, write: F) -> i64
    where
        F: FnOnce(&mut T),
    {
        let sequence = self.sequencer.claim_next();
        // SAFETY: the sequence was claimed exclusively and is unpublished.
        let event = unsafe { &mut *self.ring_buffer.get_mut_unchecked(sequence) };
        write(event);
        self.sequencer.publish(sequence);
        sequence
    }

    /// Publish one event without waiting.
    ///
    /// # Errors
    /// [`crate::EngineError::InsufficientCapacity`] when the ring is full;
    /// nothing is claimed in that case.
    pub fn try_publish<F>(&mut self, write: F) -> Result<i64>
    where
        F: FnOnce(&mut T),
    {
        let sequence = self.sequencer.try_claim_next()?;
        // SAFETY: the sequence was claimed exclusively and is unpublished.
        let event = unsafe { &mut *self.ring_buffer.get_mut_unchecked(sequence) };
        write(event);
        self.sequencer.publish(sequence);
        Ok(sequence)
    }

    /// Publish `n` events as one claim, waiting for capacity as needed.
    /// The closure receives an iterator over the claimed slots in sequence
    /// order. Returns the highest published sequence.
    pub fn batch_publish<F>(&mut self, n: usize, write: F) -> i64
    where
        F: FnOnce(BatchIterMut<'_, T>),
    {
        let high = self.sequencer.claim_batch(n as i64);
        let low = high - (n as i64 - 1);
        // SAFETY: the whole range was claimed exclusively.
        let iter = unsafe { self.ring_buffer.batch_iter_mut(low, high) };
        write(iter);
        self.sequencer.publish_range(low, high);
        high
    }

    /// Publish `n` events as one claim without waiting.
    pub fn try_batch_publish<F>(&mut self, n: usize, write: F) -> Result<i64>
    where
        F: FnOnce(BatchIterMut<'_, T>),
    {
        let high = self.sequencer.try_claim_batch(n as i64)?;
        let low = high - (n as i64 - 1);
        // SAFETY: the whole range was claimed exclusively.
        let iter = unsafe { self.ring_buffer.batch_iter_mut(low, high) };
        write(iter);
        self.sequencer.publish_range(low, high);
        Ok(high)
    }

    /// Highest published sequence.
    pub fn cursor(&self) -> i64 {
        self.sequencer.cursor().get()
    }

    /// Free slots before a blocking publish would wait.
    pub fn remaining_capacity(&self) -> i64 {
        self.sequencer.remaining_capacity()
    }
}

impl<T> std::fmt::Debug for EventProducer<T>
where
    T: Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProducer")
            .field("cursor", &self.cursor())
            .field("remaining_capacity", &self.remaining_capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DefaultEventFactory;
    use crate::sequence::Sequence;
    use crate::sequencer::SingleProducerSequencer;
    use crate::wait_strategy::BusySpinWaitStrategy;
    use crate::EngineError;

    #[derive(Debug, Default)]
    struct TestEvent {
        value: i64,
    }

    fn producer(capacity: usize) -> (EventProducer<TestEvent>, Arc<dyn Sequencer>) {
        let ring_buffer = Arc::new(
            RingBuffer::new(capacity, DefaultEventFactory::<TestEvent>::new()).unwrap(),
        );
        let sequencer: Arc<dyn Sequencer> = Arc::new(SingleProducerSequencer::new(
            capacity,
            Arc::new(BusySpinWaitStrategy::new()),
        ));
        (
            EventProducer::new(ring_buffer, Arc::clone(&sequencer)),
            sequencer,
        )
    }

    #[test]
    fn test_publish_writes_then_publishes() {
        let (mut producer, sequencer) = producer(8);

        let seq = producer.publish(|event| event.value = 42);
        assert_eq!(seq, 0);
        assert_eq!(sequencer.cursor().get(), 0);
        assert_eq!(producer.cursor(), 0);
    }

    #[test]
    fn test_try_publish_reports_full_ring() {
        let (mut producer, sequencer) = producer(2);
        let consumer = Arc::new(Sequence::default());
        sequencer.add_gating_sequences(&[consumer]);

        assert!(producer.try_publish(|e| e.value = 1).is_ok());
        assert!(producer.try_publish(|e| e.value = 2).is_ok());
        assert_eq!(
            producer.try_publish(|e| e.value = 3),
            Err(EngineError::InsufficientCapacity)
        );
    }

    #[test]
    fn test_batch_publish_fills_slots_in_order() {
        let (mut producer, sequencer) = producer(8);

        let mut next = 10;
        let high = producer.batch_publish(4, |iter| {
            for event in iter {
                event.value = next;
                next += 1;
            }
        });

        assert_eq!(high, 3);
        assert_eq!(sequencer.cursor().get(), 3);
    }

    #[test]
    fn test_remaining_capacity_tracks_consumption() {
        let (mut producer, sequencer) = producer(4);
        let consumer = Arc::new(Sequence::default());
        sequencer.add_gating_sequences(&[Arc::clone(&consumer)]);

        assert_eq!(producer.remaining_capacity(), 4);
        producer.publish(|e| e.value = 1);
        assert_eq!(producer.remaining_capacity(), 3);
        consumer.set(0);
        assert_eq!(producer.remaining_capacity(), 4);
    }
}
