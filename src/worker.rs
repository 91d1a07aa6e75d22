//! Competing consumers: a pool of processors splitting one stream.
//!
//! Pool members race to claim the next unclaimed sequence with a
//! compare-and-set on a pool-shared work sequence, so each published event is
//! delivered to exactly one member. Every member also maintains its own
//! sequence for gating, and the pool registers the work sequence and all
//! member sequences with the sequencer.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::barrier::SequenceBarrier;
use crate::handler::{ErrorPolicy, EventHandler};
use crate::processor::{ProcessorHandle, ProcessorState, Runnable};
use crate::ring_buffer::RingBuffer;
use crate::sequence::Sequence;
use crate::{EngineError, Result};

/// One member of a [`WorkerPool`].
///
/// Uses the same barrier mechanics as a broadcast processor, but advances by
/// CAS-claiming individual sequences from the shared work sequence instead of
/// draining every one. Handlers are invoked with `end_of_batch` always true,
/// since a member never sees a contiguous batch.
pub struct WorkProcessor<T, H>
where
    T: Send + Sync,
    H: EventHandler<T>,
{
    handler: H,
    ring_buffer: Arc<RingBuffer<T>>,
    barrier: Arc<dyn SequenceBarrier>,
    /// This member's gating sequence.
    sequence: Arc<Sequence>,
    /// Pool-shared claim counter.
    work_sequence: Arc<Sequence>,
    state: Arc<AtomicU8>,
    error_policy: ErrorPolicy,
}

impl<T, H> WorkProcessor<T, H>
where
    T: Send + Sync,
    H: EventHandler<T>,
{
    pub fn new(
        ring_buffer: Arc<RingBuffer<T>>,
        barrier: Arc<dyn SequenceBarrier>,
        handler: H,
        work_sequence: Arc<Sequence>,
        error_policy: ErrorPolicy,
    ) -> Self {
        Self {
            handler,
            ring_buffer,
            barrier,
            sequence: Arc::new(Sequence::default()),
            work_sequence,
            state: Arc::new(AtomicU8::new(ProcessorState::Idle as u8)),
            error_policy,
        }
    }

    pub fn sequence(&self) -> Arc<Sequence> {
        Arc::clone(&self.sequence)
    }

    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle::new(
            Arc::clone(&self.sequence),
            Arc::clone(&self.state),
            Arc::clone(&self.barrier),
        )
    }

    fn transition_to_running(&self) -> Result<()> {
        for from in [ProcessorState::Idle, ProcessorState::Halted] {
            if self
                .state
                .compare_exchange(
                    from as u8,
                    ProcessorState::Running as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(EngineError::AlreadyRunning)
    }

    fn halt_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) == ProcessorState::Halting as u8
    }

    /// Run the work loop on the current thread until halted.
    pub fn run(&mut self) -> Result<()> {
        self.transition_to_running()?;
        self.barrier.clear_alert();
        self.handler.on_start();
        debug!("work processor running");

        let result = self.work_until_halt();

        self.handler.on_shutdown();
        self.state
            .store(ProcessorState::Halted as u8, Ordering::Release);
        debug!(sequence = self.sequence.get(), "work processor halted");
        result
    }

    fn work_until_halt(&mut self) -> Result<()> {
        let mut processed = true;
        let mut cached_available = i64::MIN;
        let mut next_sequence = self.work_sequence.get();

        loop {
            if processed {
                processed = false;
                // Claim the next unclaimed sequence. Publishing our own
                // sequence first keeps the gating view conservative while the
                // claim is in flight.
                loop {
                    next_sequence = self.work_sequence.get() + 1;
                    self.sequence.set(next_sequence - 1);
                    if self
                        .work_sequence
                        .compare_and_set(next_sequence - 1, next_sequence)
                    {
                        break;
                    }
                }
            }

            if cached_available >= next_sequence {
                // SAFETY: exactly one member wins each sequence, and the
                // barrier confirmed it is published.
                let event = unsafe { &mut *self.ring_buffer.get_mut_unchecked(next_sequence) };
                if let Err(fault) = self.handler.on_event(event, next_sequence, true) {
                    match self.error_policy {
                        ErrorPolicy::Halt => {
                            error!(sequence = next_sequence, %fault, "handler fault, halting worker");
                            self.sequence.set(next_sequence);
                            return Err(EngineError::HandlerFault {
                                sequence: next_sequence,
                            });
                        }
                        ErrorPolicy::SkipAndContinue => {
                            warn!(sequence = next_sequence, %fault, "handler fault, skipping event");
                        }
                    }
                }
                processed = true;
            } else {
                match self.barrier.wait_for(next_sequence) {
                    Ok(available) => cached_available = available,
                    Err(EngineError::Alerted) => return Ok(()),
                    Err(EngineError::Timeout(sequence)) => {
                        self.handler.on_timeout(sequence)?;
                    }
                    Err(other) => return Err(other),
                }
            }

            if self.halt_requested() {
                return Ok(());
            }
        }
    }
}

impl<T, H> Runnable for WorkProcessor<T, H>
where
    T: Send + Sync,
    H: EventHandler<T>,
{
    fn run(&mut self) -> Result<()> {
        WorkProcessor::run(self)
    }
}

/// A group of [`WorkProcessor`]s splitting one stream exactly once.
pub struct WorkerPool<T>
where
    T: Send + Sync,
{
    work_sequence: Arc<Sequence>,
    workers: Vec<Box<dyn Runnable>>,
    handles: Vec<ProcessorHandle>,
    _marker: std::marker::PhantomData<fn(&mut T)>,
}

impl<T> WorkerPool<T>
where
    T: Send + Sync + 'static,
{
    /// Build a pool with one [`WorkProcessor`] per handler, all competing on
    /// a shared work sequence and a shared barrier.
    ///
    /// The returned pool owns the processors; register
    /// [`WorkerPool::gating_sequences`] with the sequencer before starting.
    pub fn new<H>(
        ring_buffer: Arc<RingBuffer<T>>,
        barrier: Arc<dyn SequenceBarrier>,
        handlers: Vec<H>,
        error_policy: ErrorPolicy,
    ) -> Self
    where
        H: EventHandler<T> + 'static,
    {
        let work_sequence = Arc::new(Sequence::default());
        let mut workers: Vec<Box<dyn Runnable>> = Vec::with_capacity(handlers.len());
        let mut handles = Vec::with_capacity(handlers.len());

        for handler in handlers {
            let worker = WorkProcessor::new(
                Arc::clone(&ring_buffer),
                Arc::clone(&barrier),
                handler,
                Arc::clone(&work_sequence),
                error_policy,
            );
            handles.push(worker.handle());
            workers.push(Box::new(worker));
        }

        Self {
            work_sequence,
            workers,
            handles,
            _marker: std::marker::PhantomData,
        }
    }

    /// Sequences the sequencer must gate on: every member's own sequence and
    /// the shared work sequence.
    pub fn gating_sequences(&self) -> Vec<Arc<Sequence>> {
        let mut sequences: Vec<Arc<Sequence>> =
            self.handles.iter().map(|h| h.sequence()).collect();
        sequences.push(Arc::clone(&self.work_sequence));
        sequences
    }

    /// Align the pool's claim counter and member sequences with `cursor`
    /// before starting, so members begin at the next published sequence.
    pub fn align_to(&self, cursor: i64) {
        self.work_sequence.set(cursor);
        for handle in &self.handles {
            handle.sequence().set(cursor);
        }
    }

    /// Control handles for every member.
    pub fn handles(&self) -> &[ProcessorHandle] {
        &self.handles
    }

    /// Take ownership of the member run loops for spawning.
    pub fn into_workers(self) -> Vec<Box<dyn Runnable>> {
        self.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::ProcessingSequenceBarrier;
    use crate::handler::DefaultEventFactory;
    use crate::sequencer::{Sequencer, SingleProducerSequencer};
    use crate::wait_strategy::YieldingWaitStrategy;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::thread;

    #[derive(Debug, Default)]
    struct TestEvent {
        value: i64,
    }

    struct Recorder {
        worker_id: usize,
        seen: Arc<Mutex<Vec<(usize, i64, i64)>>>,
    }

    impl EventHandler<TestEvent> for Recorder {
        fn on_event(&mut self, event: &mut TestEvent, sequence: i64, _: bool) -> Result<()> {
            self.seen.lock().push((self.worker_id, sequence, event.value));
            Ok(())
        }
    }

    #[test]
    fn test_pool_delivers_each_sequence_exactly_once() {
        const MEMBERS: usize = 3;
        const EVENTS: i64 = 200;

        let wait_strategy = Arc::new(YieldingWaitStrategy::new());
        let ring_buffer = Arc::new(
            RingBuffer::new(16, DefaultEventFactory::<TestEvent>::new()).unwrap(),
        );
        let sequencer: Arc<dyn Sequencer> =
            Arc::new(SingleProducerSequencer::new(16, wait_strategy.clone()));
        let barrier: Arc<dyn SequenceBarrier> = Arc::new(ProcessingSequenceBarrier::new(
            Arc::clone(&sequencer),
            wait_strategy,
            vec![],
        ));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handlers: Vec<Recorder> = (0..MEMBERS)
            .map(|worker_id| Recorder {
                worker_id,
                seen: Arc::clone(&seen),
            })
            .collect();

        let pool = WorkerPool::new(
            Arc::clone(&ring_buffer),
            Arc::clone(&barrier),
            handlers,
            ErrorPolicy::Halt,
        );
        sequencer.add_gating_sequences(&pool.gating_sequences());
        pool.align_to(sequencer.cursor().get());

        let handles: Vec<ProcessorHandle> = pool.handles().to_vec();
        let threads: Vec<_> = pool
            .into_workers()
            .into_iter()
            .map(|mut worker| thread::spawn(move || worker.run()))
            .collect();

        for value in 0..EVENTS {
            let seq = sequencer.claim_next();
            unsafe {
                (*ring_buffer.get_mut_unchecked(seq)).value = value;
            }
            sequencer.publish(seq);
        }

        // Wait for the pool to drain everything.
        while seen.lock().len() < EVENTS as usize {
            thread::yield_now();
        }
        for handle in &handles {
            handle.halt();
        }
        for thread in threads {
            thread.join().unwrap().unwrap();
        }

        let seen = seen.lock();
        let mut by_sequence: HashMap<i64, Vec<usize>> = HashMap::new();
        for (worker_id, sequence, value) in seen.iter() {
            assert_eq!(sequence, value, "slot payload must match its sequence");
            by_sequence.entry(*sequence).or_default().push(*worker_id);
        }

        // Union covers every sequence exactly once; no sequence is handled
        // by two members.
        assert_eq!(by_sequence.len(), EVENTS as usize);
        for (sequence, owners) in by_sequence {
            assert_eq!(owners.len(), 1, "sequence {sequence} handled twice");
        }
    }

    #[test]
    fn test_pool_gating_includes_members_and_work_sequence() {
        let wait_strategy = Arc::new(YieldingWaitStrategy::new());
        let ring_buffer = Arc::new(
            RingBuffer::new(8, DefaultEventFactory::<TestEvent>::new()).unwrap(),
        );
        let sequencer: Arc<dyn Sequencer> =
            Arc::new(SingleProducerSequencer::new(8, wait_strategy.clone()));
        let barrier: Arc<dyn SequenceBarrier> = Arc::new(ProcessingSequenceBarrier::new(
            Arc::clone(&sequencer),
            wait_strategy,
            vec![],
        ));

        let handlers: Vec<_> = (0..2)
            .map(|_| |_: &mut TestEvent, _: i64, _: bool| Ok(()))
            .collect();
        let pool = WorkerPool::new(ring_buffer, barrier, handlers, ErrorPolicy::Halt);

        assert_eq!(pool.gating_sequences().len(), 3);
    }
}
