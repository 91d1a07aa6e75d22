//! `Ringline` - Lock-Free Sequencing Engine
//!
//! A single-writer/multi-reader ring buffer that hands a stream of mutable,
//! pre-allocated event slots from one producer (or several, in multi-producer
//! mode) to one or more consumer threads with strict ordering, bounded memory,
//! and no locks or per-event allocation on the hot path.
//!
//! ## Features
//!
//! - **Lock-free**: atomic sequence coordination only, no mutexes on the hot path
//! - **Zero-allocation**: every slot is allocated once at construction and
//!   mutated in place, indexed by `sequence & (capacity - 1)`
//! - **Backpressure by construction**: a producer cannot overrun the slowest
//!   consumer; the ring is the only buffer
//! - **Pluggable waiting**: busy-spin, yielding, sleeping, and blocking wait
//!   strategies selected at construction
//! - **Broadcast or exactly-once**: independent processors each see every
//!   event, or a worker pool splits the stream so each event is handled once
//!
//! ## Quick Start
//!
//! ```rust
//! use ringline::{Engine, ProducerMode, YieldingWaitStrategy};
//!
//! #[derive(Debug, Default)]
//! struct Tick {
//!     value: i64,
//! }
//!
//! # fn main() -> ringline::Result<()> {
//! let mut engine = Engine::new(
//!     ringline::DefaultEventFactory::<Tick>::new(),
//!     64,
//!     ProducerMode::Single,
//!     YieldingWaitStrategy::new(),
//! )?
//! .handle_events_with(|event: &mut Tick, sequence: i64, _end_of_batch: bool| {
//!     assert_eq!(event.value, sequence);
//!     Ok(())
//! })
//! .build();
//!
//! engine.start()?;
//! let mut producer = engine.producer()?;
//! for i in 0..32 {
//!     producer.publish(|event| event.value = i);
//! }
//! engine.drain();
//! engine.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Sequence`]: cache-line-isolated monotonic counter
//! - [`RingBuffer`]: pre-allocated power-of-two slot array
//! - [`Sequencer`]: claim/publish coordination and gating
//!   ([`SingleProducerSequencer`], [`MultiProducerSequencer`])
//! - [`SequenceBarrier`]: per-consumer view of safe-to-read sequences
//! - [`WaitStrategy`]: how a consumer waits for new sequences
//! - [`BatchEventProcessor`]: dedicated consumption loop for one handler
//! - [`WorkerPool`]: competing consumers with exactly-once delivery
//! - [`Engine`]: construction configuration, topology, and lifecycle

pub mod barrier;
pub mod engine;
pub mod handler;
pub mod processor;
pub mod producer;
pub mod ring_buffer;
pub mod sequence;
pub mod sequencer;
pub mod thread;
pub mod wait_strategy;
pub mod worker;


pub use barrier::{ProcessingSequenceBarrier, SequenceBarrier};
pub use engine::{Engine, EngineTopology, ProducerMode};
pub use handler::{
    ClosureEventHandler, DefaultEventFactory, ErrorPolicy, EventFactory, EventHandler,
};
pub use processor::{BatchEventProcessor, ProcessorHandle, ProcessorState, Runnable};
pub use producer::EventProducer;
pub use ring_buffer::{BatchIterMut, RingBuffer};
pub use sequence::Sequence;
pub use sequencer::{MultiProducerSequencer, Sequencer, SingleProducerSequencer};
pub use wait_strategy::{
    BlockingWaitStrategy, BusySpinWaitStrategy, SleepingWaitStrategy, WaitStrategy,
    YieldingWaitStrategy,
};
pub use worker::{WorkProcessor, WorkerPool};

/// The value every sequence starts at. The first published sequence is 0.
pub const INITIAL_CURSOR_VALUE: i64 = -1;

/// Errors surfaced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// A non-blocking claim found no free slot. Recoverable: retry or back off.
    #[error("insufficient capacity in ring buffer")]
    InsufficientCapacity,

    /// Ring capacity must be a power of two.
    #[error("capacity must be a power of two, got {0}")]
    InvalidCapacity(usize),

    /// The barrier was alerted while waiting, typically by a halt request.
    #[error("sequence barrier alerted")]
    Alerted,

    /// A bounded wait strategy gave up waiting for the given sequence.
    #[error("timed out waiting for sequence {0}")]
    Timeout(i64),

    /// A handler failed and the processor's error policy halted it.
    #[error("handler fault at sequence {sequence}")]
    HandlerFault { sequence: i64 },

    /// The processor is already running.
    #[error("processor is already running")]
    AlreadyRunning,

    /// The engine has already been started.
    #[error("engine already started")]
    AlreadyStarted,

    /// A single-producer engine hands out exactly one producer handle.
    #[error("producer handle already created for single-producer engine")]
    ProducerAlreadyCreated,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// True if `n` is a non-zero power of two.
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(2));
        assert!(is_power_of_two(8));
        assert!(is_power_of_two(1024));

        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(3));
        assert!(!is_power_of_two(1023));
    }

    #[test]
    fn test_error_display_reports_sequence() {
        let err = EngineError::HandlerFault { sequence: 42 };
        assert!(err.to_string().contains("42"));

        let err = EngineError::Timeout(7);
        assert!(err.to_string().contains('7'));
    }
}
