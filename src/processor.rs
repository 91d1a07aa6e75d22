//! The dedicated consumption loop bound to one handler.
//!
//! A processor drains every newly available sequence as one batch, invokes
//! its handler once per event, then advances its own sequence, which is what
//! re-opens producer capacity. Halting is cooperative and only honored at a
//! batch boundary, so no event is ever abandoned partway through a handler
//! invocation.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::barrier::SequenceBarrier;
use crate::handler::{ErrorPolicy, EventHandler};
use crate::ring_buffer::RingBuffer;
use crate::sequence::Sequence;
use crate::{EngineError, Result};

/// Lifecycle of a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Idle = 0,
    Running = 1,
    Halting = 2,
    Halted = 3,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Halting,
            _ => Self::Halted,
        }
    }
}

/// Anything the engine can run on a dedicated thread.
pub trait Runnable: Send {
    fn run(&mut self) -> Result<()>;
}

/// Shared control surface for a processor running on another thread.
#[derive(Clone)]
pub struct ProcessorHandle {
    sequence: Arc<Sequence>,
    state: Arc<AtomicU8>,
    barrier: Arc<dyn SequenceBarrier>,
}

impl ProcessorHandle {
    pub(crate) fn new(
        sequence: Arc<Sequence>,
        state: Arc<AtomicU8>,
        barrier: Arc<dyn SequenceBarrier>,
    ) -> Self {
        Self {
            sequence,
            state,
            barrier,
        }
    }

    /// The processor's own sequence: the highest event it has fully handled.
    pub fn sequence(&self) -> Arc<Sequence> {
        Arc::clone(&self.sequence)
    }

    /// Request a graceful stop. Honored at the next batch boundary.
    pub fn halt(&self) {
        let state = &self.state;
        // Idle processors jump straight to Halted; running ones get a
        // cooperative request plus a barrier alert to interrupt the wait.
        if state
            .compare_exchange(
                ProcessorState::Running as u8,
                ProcessorState::Halting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            let _ = state.compare_exchange(
                ProcessorState::Idle as u8,
                ProcessorState::Halted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        self.barrier.alert();
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessorState::Running
    }

    /// Terminal state, observable for join/shutdown coordination.
    pub fn is_halted(&self) -> bool {
        self.state() == ProcessorState::Halted
    }
}

/// Consumption loop delivering every published event to one handler.
pub struct BatchEventProcessor<T, H>
where
    T: Send + Sync,
    H: EventHandler<T>,
{
    handler: H,
    ring_buffer: Arc<RingBuffer<T>>,
    barrier: Arc<dyn SequenceBarrier>,
    sequence: Arc<Sequence>,
    state: Arc<AtomicU8>,
    error_policy: ErrorPolicy,
}

impl<T, H> BatchEventProcessor<T, H>
where
    T: Send + Sync,
    H: EventHandler<T>,
{
    pub fn new(
        ring_buffer: Arc<RingBuffer<T>>,
        barrier: Arc<dyn SequenceBarrier>,
        handler: H,
        error_policy: ErrorPolicy,
    ) -> Self {
        Self {
            handler,
            ring_buffer,
            barrier,
            sequence: Arc::new(Sequence::default()),
            state: Arc::new(AtomicU8::new(ProcessorState::Idle as u8)),
            error_policy,
        }
    }

    /// The sequence to register as a gating sequence with the sequencer.
    pub fn sequence(&self) -> Arc<Sequence> {
        Arc::clone(&self.sequence)
    }

    /// Control handle usable from other threads.
    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle {
            sequence: Arc::clone(&self.sequence),
            state: Arc::clone(&self.state),
            barrier: Arc::clone(&self.barrier),
        }
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

    /// Drain `from..=to`, returning the failing sequence if the halt policy
    /// fired.
    fn drain_batch(&mut self, from: i64, to: i64) -> std::result::Result<(), i64> {
        for sequence in from..=to {
            let end_of_batch = sequence == to;
            // SAFETY: the barrier reported this range available and this
            // processor is the only consumer advancing over it.
            let event = unsafe { &mut *self.ring_buffer.get_mut_unchecked(sequence) };
            if let Err(fault) = self.handler.on_event(event, sequence, end_of_batch) {
                match self.error_policy {
                    ErrorPolicy::Halt => {
                        error!(sequence, %fault, "handler fault, halting processor");
                        return Err(sequence);
                    }
                    ErrorPolicy::SkipAndContinue => {
                        warn!(sequence, %fault, "handler fault, skipping event");
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the processing loop on the current thread until halted.
    ///
    /// A halted processor can be run again and resumes from its own sequence
    /// with no loss of already-published events.
    ///
    /// # Errors
    /// [`EngineError::AlreadyRunning`] if the processor is mid-run elsewhere;
    /// [`EngineError::HandlerFault`] when the halt policy stops the loop on a
    /// failing sequence.
    pub fn run(&mut self) -> Result<()> {
        self.transition_to_running()?;
        self.barrier.clear_alert();
        self.handler.on_start();
        debug!(sequence = self.sequence.get(), "processor running");

        let result = self.process_until_halt();

        self.handler.on_shutdown();
        self.state
            .store(ProcessorState::Halted as u8, Ordering::Release);
        debug!(sequence = self.sequence.get(), "processor halted");
        result
    }

    fn process_until_halt(&mut self) -> Result<()> {
        let mut next_sequence = self.sequence.get() + 1;

        loop {
            match self.barrier.wait_for(next_sequence) {
                Ok(available) if available >= next_sequence => {
                    if let Err(failing) = self.drain_batch(next_sequence, available) {
                        // Credit the events handled before the fault.
                        self.sequence.set(failing - 1);
                        return Err(EngineError::HandlerFault { sequence: failing });
                    }
                    self.sequence.set(available);
                    next_sequence = available + 1;
                }
                Ok(_) => {
                    // Publication gap (multi-producer); nothing contiguous yet.
                }
                Err(EngineError::Alerted) => return Ok(()),
                Err(EngineError::Timeout(sequence)) => {
                    self.handler.on_timeout(sequence)?;
                }
                Err(other) => return Err(other),
            }

            if self.halt_requested() {
                return Ok(());
            }
        }
    }
}

impl<T, H> Runnable for BatchEventProcessor<T, H>
where
    T: Send + Sync,
    H: EventHandler<T>,
{
    fn run(&mut self) -> Result<()> {
        BatchEventProcessor::run(self)
    }
}
