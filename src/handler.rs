//! Slot factories, event handlers, and the handler fault policy.
//!
//! Handlers are the boundary to business logic. One callback contract serves
//! both delivery modes: broadcast processors invoke it for every event with a
//! real end-of-batch flag, worker-pool members invoke it for the events they
//! win with `end_of_batch` always true.

use crate::Result;

/// Supplies one reusable slot instance per ring position at construction.
pub trait EventFactory<T>: Send + Sync {
    fn new_instance(&self) -> T;
}

/// Any `Fn() -> T` closure is a factory.
impl<T, F> EventFactory<T> for F
where
    F: Fn() -> T + Send + Sync,
{
    fn new_instance(&self) -> T {
        self()
    }
}

/// Factory for slot types that implement `Default`.
#[derive(Debug)]
pub struct DefaultEventFactory<T: Default> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Default> DefaultEventFactory<T> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Default> Default for DefaultEventFactory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default + Send + Sync> EventFactory<T> for DefaultEventFactory<T> {
    fn new_instance(&self) -> T {
        T::default()
    }
}

/// Callback invoked once per delivered event.
///
/// `end_of_batch` is true for the last event of a drained batch, which is the
/// natural point to flush any work the handler has been accumulating.
pub trait EventHandler<T>: Send {
    fn on_event(&mut self, event: &mut T, sequence: i64, end_of_batch: bool) -> Result<()>;

    /// Called once when the owning processor enters its run loop.
    fn on_start(&mut self) {}

    /// Called once when the owning processor leaves its run loop.
    fn on_shutdown(&mut self) {}

    /// Called when a bounded wait strategy times out with no new sequence.
    /// `sequence` is the sequence the processor was waiting for.
    fn on_timeout(&mut self, _sequence: i64) -> Result<()> {
        Ok(())
    }
}

/// Any `FnMut(&mut T, i64, bool) -> Result<()>` closure is a handler.
impl<T, F> EventHandler<T> for F
where
    F: FnMut(&mut T, i64, bool) -> Result<()> + Send,
{
    fn on_event(&mut self, event: &mut T, sequence: i64, end_of_batch: bool) -> Result<()> {
        self(event, sequence, end_of_batch)
    }
}

/// Adapter turning an infallible closure into an [`EventHandler`].
pub struct ClosureEventHandler<T, F>
where
    F: FnMut(&mut T, i64, bool) + Send,
{
    callback: F,
    _marker: std::marker::PhantomData<fn(&mut T)>,
}

impl<T, F> ClosureEventHandler<T, F>
where
    F: FnMut(&mut T, i64, bool) + Send,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, F> EventHandler<T> for ClosureEventHandler<T, F>
where
    T: Send,
    F: FnMut(&mut T, i64, bool) + Send,
{
    fn on_event(&mut self, event: &mut T, sequence: i64, end_of_batch: bool) -> Result<()> {
        (self.callback)(event, sequence, end_of_batch);
        Ok(())
    }
}

/// What a processor does when its handler returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Halt the processor and report the failing sequence. The default.
    #[default]
    Halt,
    /// Log the fault and keep processing. Explicit opt-in: the failed event's
    /// data is dropped from this handler's point of view.
    SkipAndContinue,
}
