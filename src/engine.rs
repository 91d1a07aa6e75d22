//! Engine construction, topology, and lifecycle.
//!
//! The engine owns the ring buffer, the sequencer, every processor, and the
//! threads they run on. Configuration is fixed at construction (capacity,
//! producer mode, wait strategy, slot factory); consumers are then registered
//! as a topology:
//!
//! - [`Engine::handle_events_with`] / [`EngineTopology::then`]: broadcast
//!   stages, every handler sees every event, later stages wait behind earlier
//!   ones.
//! - [`Engine::handle_events_with_pool`] / [`EngineTopology::then_pool`]:
//!   competing consumers, each event delivered to exactly one pool member.
//!
//! There is no global executor: [`Engine::start`] spawns one dedicated thread
//! per processor and keeps the join handles; [`Engine::shutdown`] halts every
//! processor and joins every thread before returning.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, error, info};

use crate::barrier::{ProcessingSequenceBarrier, SequenceBarrier};
use crate::handler::{ErrorPolicy, EventFactory, EventHandler};
use crate::processor::{BatchEventProcessor, ProcessorHandle, Runnable};
use crate::producer::EventProducer;
use crate::ring_buffer::RingBuffer;
use crate::sequence::Sequence;
use crate::sequencer::{MultiProducerSequencer, Sequencer, SingleProducerSequencer};
use crate::thread::ThreadContext;
use crate::wait_strategy::WaitStrategy;
use crate::worker::WorkerPool;
use crate::{EngineError, Result};

/// Selects the claim/publish algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMode {
    /// One producer thread; claims are plain increments, publish is a single
    /// release store.
    Single,
    /// Concurrent producers; claims CAS on the cursor and publication is
    /// tracked per slot.
    Multi,
}

/// The sequencing engine.
pub struct Engine<T>
where
    T: Send + Sync + 'static,
{
    ring_buffer: Arc<RingBuffer<T>>,
    sequencer: Arc<dyn Sequencer>,
    wait_strategy: Arc<dyn WaitStrategy>,
    producer_mode: ProducerMode,
    error_policy: ErrorPolicy,
    runnables: Vec<Box<dyn Runnable>>,
    handles: Vec<ProcessorHandle>,
    threads: Vec<JoinHandle<()>>,
    pin_cores: Vec<usize>,
    started: bool,
    producer_created: bool,
}

impl<T> Engine<T>
where
    T: Send + Sync + 'static,
{
    /// Build an engine over `capacity` slots, each constructed by `factory`.
    ///
    /// # Errors
    /// [`EngineError::InvalidCapacity`] if `capacity` is not a power of two.
    pub fn new<F, W>(
        factory: F,
        capacity: usize,
        producer_mode: ProducerMode,
        wait_strategy: W,
    ) -> Result<Self>
    where
        F: EventFactory<T>,
        W: WaitStrategy + 'static,
    {
        let wait_strategy: Arc<dyn WaitStrategy> = Arc::new(wait_strategy);
        let ring_buffer = Arc::new(RingBuffer::new(capacity, factory)?);
        let sequencer: Arc<dyn Sequencer> = match producer_mode {
            ProducerMode::Single => Arc::new(SingleProducerSequencer::new(
                capacity,
                Arc::clone(&wait_strategy),
            )),
            ProducerMode::Multi => Arc::new(MultiProducerSequencer::new(
                capacity,
                Arc::clone(&wait_strategy),
            )),
        };

        Ok(Self {
            ring_buffer,
            sequencer,
            wait_strategy,
            producer_mode,
            error_policy: ErrorPolicy::default(),
            runnables: Vec::new(),
            handles: Vec::new(),
            threads: Vec::new(),
            pin_cores: Vec::new(),
            started: false,
            producer_created: false,
        })
    }

    /// Policy applied when a handler returns an error. Applies to handlers
    /// registered after this call.
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Pin processor threads to `cores`, round-robin, in registration order.
    pub fn pin_processors_to(mut self, cores: Vec<usize>) -> Self {
        self.pin_cores = cores;
        self
    }

    /// Register the first broadcast consumer stage.
    pub fn handle_events_with<H>(mut self, handler: H) -> EngineTopology<T>
    where
        H: EventHandler<T> + 'static,
    {
        let stage = self.add_processor(handler, vec![]);
        EngineTopology {
            engine: self,
            last_stage: vec![stage],
        }
    }

    /// Register the first consumer stage as a competing-consumer pool: each
    /// event goes to exactly one of `handlers`.
    pub fn handle_events_with_pool<H>(mut self, handlers: Vec<H>) -> EngineTopology<T>
    where
        H: EventHandler<T> + 'static,
    {
        let stage = self.add_pool(handlers, vec![]);
        EngineTopology {
            engine: self,
            last_stage: stage,
        }
    }

    fn new_barrier(&self, dependents: Vec<Arc<Sequence>>) -> Arc<dyn SequenceBarrier> {
        Arc::new(ProcessingSequenceBarrier::new(
            Arc::clone(&self.sequencer),
            Arc::clone(&self.wait_strategy),
            dependents,
        ))
    }

    fn add_processor<H>(&mut self, handler: H, dependents: Vec<Arc<Sequence>>) -> Arc<Sequence>
    where
        H: EventHandler<T> + 'static,
    {
        let barrier = self.new_barrier(dependents);
        let processor = BatchEventProcessor::new(
            Arc::clone(&self.ring_buffer),
            barrier,
            handler,
            self.error_policy,
        );
        let sequence = processor.sequence();
        self.sequencer.add_gating_sequences(&[Arc::clone(&sequence)]);
        self.handles.push(processor.handle());
        self.runnables.push(Box::new(processor));
        sequence
    }

    fn add_pool<H>(
        &mut self,
        handlers: Vec<H>,
        dependents: Vec<Arc<Sequence>>,
    ) -> Vec<Arc<Sequence>>
    where
        H: EventHandler<T> + 'static,
    {
        let barrier = self.new_barrier(dependents);
        let pool = WorkerPool::new(
            Arc::clone(&self.ring_buffer),
            barrier,
            handlers,
            self.error_policy,
        );
        let gating = pool.gating_sequences();
        self.sequencer.add_gating_sequences(&gating);
        pool.align_to(self.sequencer.cursor().get());
        self.handles.extend(pool.handles().iter().cloned());
        let member_sequences: Vec<Arc<Sequence>> =
            pool.handles().iter().map(|h| h.sequence()).collect();
        self.runnables.extend(pool.into_workers());
        member_sequences
    }

    /// Spawn one dedicated thread per registered processor.
    ///
    /// # Errors
    /// [`EngineError::AlreadyStarted`] on a second call.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }

        for (index, mut runnable) in self.runnables.drain(..).enumerate() {
            let mut context = ThreadContext::new().named(format!("processor-{index}"));
            if !self.pin_cores.is_empty() {
                context = context.pinned_to(self.pin_cores[index % self.pin_cores.len()]);
            }
            let thread = context.spawn(move || {
                if let Err(fault) = runnable.run() {
                    error!(%fault, "processor stopped on error");
                }
            });
            self.threads.push(thread);
        }

        self.started = true;
        info!(
            capacity = self.sequencer.capacity(),
            processors = self.threads.len(),
            mode = ?self.producer_mode,
            "engine started"
        );
        Ok(())
    }

    /// A handle for publishing events.
    ///
    /// # Errors
    /// In single-producer mode exactly one handle is handed out; a second
    /// request returns [`EngineError::ProducerAlreadyCreated`]. Multi mode
    /// hands out any number.
    pub fn producer(&mut self) -> Result<EventProducer<T>> {
        match self.producer_mode {
            ProducerMode::Single => {
                if self.producer_created {
                    return Err(EngineError::ProducerAlreadyCreated);
                }
                self.producer_created = true;
                Ok(EventProducer::new(
                    Arc::clone(&self.ring_buffer),
                    Arc::clone(&self.sequencer),
                ))
            }
            ProducerMode::Multi => Ok(EventProducer::new(
                Arc::clone(&self.ring_buffer),
                Arc::clone(&self.sequencer),
            )),
        }
    }

    /// Wait until every gating sequence has caught up with the cursor, i.e.
    /// every published event has been consumed.
    pub fn drain(&self) {
        let cursor = self.sequencer.cursor();
        while self.sequencer.minimum_gating_sequence() < cursor.get() {
            // Nudge parked consumers so they can observe the cursor.
            self.wait_strategy.signal_all_when_blocking();
            std::thread::yield_now();
        }
        debug!(cursor = cursor.get(), "engine drained");
    }

    /// Request a graceful stop of every processor. Honored at batch
    /// boundaries; does not wait. Already-published events that were not yet
    /// consumed stay in the ring (call [`Engine::drain`] first to avoid
    /// that).
    pub fn halt(&self) {
        for handle in &self.handles {
            handle.halt();
        }
    }

    /// True once every processor has reached its terminal state.
    pub fn is_halted(&self) -> bool {
        self.handles.iter().all(ProcessorHandle::is_halted)
    }

    /// Halt every processor and join every thread.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.halt();
        while let Some(thread) = self.threads.pop() {
            if thread.join().is_err() {
                error!("processor thread panicked during shutdown");
            }
        }
        self.started = false;
        info!("engine shut down");
        Ok(())
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.sequencer.capacity()
    }

    /// Free slots before a blocking claim would wait.
    pub fn remaining_capacity(&self) -> i64 {
        self.sequencer.remaining_capacity()
    }

    /// The highest published sequence.
    pub fn cursor(&self) -> i64 {
        self.sequencer.cursor().get()
    }

    /// Control handles for every registered processor.
    pub fn processor_handles(&self) -> &[ProcessorHandle] {
        &self.handles
    }
}

impl<T> Drop for Engine<T>
where
    T: Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Best-effort cleanup; the documented path is an explicit shutdown.
        let _ = self.shutdown();
    }
}

/// Fluent topology builder returned by the first stage registration.
pub struct EngineTopology<T>
where
    T: Send + Sync + 'static,
{
    engine: Engine<T>,
    last_stage: Vec<Arc<Sequence>>,
}

impl<T> EngineTopology<T>
where
    T: Send + Sync + 'static,
{
    /// Add a broadcast stage that waits behind the previous stage.
    pub fn then<H>(mut self, handler: H) -> Self
    where
        H: EventHandler<T> + 'static,
    {
        let dependents = self.last_stage.clone();
        let stage = self.engine.add_processor(handler, dependents);
        self.last_stage = vec![stage];
        self
    }

    /// Add a competing-consumer pool that waits behind the previous stage.
    pub fn then_pool<H>(mut self, handlers: Vec<H>) -> Self
    where
        H: EventHandler<T> + 'static,
    {
        let dependents = self.last_stage.clone();
        let stage = self.engine.add_pool(handlers, dependents);
        self.last_stage = stage;
        self
    }

    /// Finish the topology.
    pub fn build(self) -> Engine<T> {
        self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DefaultEventFactory;
    use crate::wait_strategy::YieldingWaitStrategy;

    #[derive(Debug, Default)]
    struct TestEvent {
        value: i64,
    }

    fn noop_engine(mode: ProducerMode) -> Engine<TestEvent> {
        Engine::new(
            DefaultEventFactory::<TestEvent>::new(),
            8,
            mode,
            YieldingWaitStrategy::new(),
        )
        .unwrap()
        .handle_events_with(|_: &mut TestEvent, _: i64, _: bool| Ok(()))
        .build()
    }

    #[test]
    fn test_engine_rejects_invalid_capacity() {
        let result = Engine::<TestEvent>::new(
            DefaultEventFactory::<TestEvent>::new(),
            12,
            ProducerMode::Single,
            YieldingWaitStrategy::new(),
        );
        assert!(matches!(result, Err(EngineError::InvalidCapacity(12))));
    }

    #[test]
    fn test_single_mode_hands_out_one_producer() {
        let mut engine = noop_engine(ProducerMode::Single);
        assert!(engine.producer().is_ok());
        assert_eq!(
            engine.producer().unwrap_err(),
            EngineError::ProducerAlreadyCreated
        );
    }

    #[test]
    fn test_multi_mode_hands_out_many_producers() {
        let mut engine = noop_engine(ProducerMode::Multi);
        assert!(engine.producer().is_ok());
        assert!(engine.producer().is_ok());
    }

    #[test]
    fn test_start_twice_fails() {
        let mut engine = noop_engine(ProducerMode::Single);
        engine.start().unwrap();
        assert_eq!(engine.start().unwrap_err(), EngineError::AlreadyStarted);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_without_start_is_noop() {
        let mut engine = noop_engine(ProducerMode::Single);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_end_to_end_single_stage() {
        let mut engine = Engine::new(
            DefaultEventFactory::<TestEvent>::new(),
            8,
            ProducerMode::Single,
            YieldingWaitStrategy::new(),
        )
        .unwrap()
        .handle_events_with(|event: &mut TestEvent, sequence: i64, _: bool| {
            assert_eq!(event.value, sequence * 2);
            Ok(())
        })
        .build();

        engine.start().unwrap();
        let mut producer = engine.producer().unwrap();
        for i in 0..50 {
            producer.publish(|event| event.value = i * 2);
        }
        engine.drain();
        engine.shutdown().unwrap();
        assert!(engine.is_halted());
    }

    #[test]
    fn test_pipeline_stage_waits_behind_first() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let first_seen = Arc::new(AtomicI64::new(-1));
        let checker = Arc::clone(&first_seen);

        let mut engine = Engine::new(
            DefaultEventFactory::<TestEvent>::new(),
            8,
            ProducerMode::Single,
            YieldingWaitStrategy::new(),
        )
        .unwrap()
        .handle_events_with(move |_: &mut TestEvent, sequence: i64, _: bool| {
            first_seen.store(sequence, Ordering::Release);
            Ok(())
        })
        .then(move |_: &mut TestEvent, sequence: i64, _: bool| {
            // The first stage must already have passed this sequence.
            assert!(checker.load(Ordering::Acquire) >= sequence);
            Ok(())
        })
        .build();

        engine.start().unwrap();
        let mut producer = engine.producer().unwrap();
        for i in 0..100 {
            producer.publish(|event| event.value = i);
        }
        engine.drain();
        engine.shutdown().unwrap();
    }
}
