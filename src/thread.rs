//! Processor thread spawning, naming, and optional CPU core pinning.

use std::thread::JoinHandle;

use tracing::{debug, warn};

/// Naming and placement for one processor thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadContext {
    name: Option<String>,
    core: Option<usize>,
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the thread (visible in profilers and thread dumps).
    pub fn named<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pin the thread to a CPU core. Pinning failures are logged, not fatal:
    /// the thread still runs, just unpinned.
    pub fn pinned_to(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }

    pub(crate) fn spawn<F>(self, f: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = self.name.unwrap_or_else(|| "processor".to_string());
        let core = self.core;
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Some(core) = core {
                    if core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                        debug!(thread = %name, core, "pinned processor thread");
                    } else {
                        warn!(thread = %name, core, "failed to pin processor thread");
                    }
                }
                f();
            })
            .expect("spawning a processor thread failed")
    }
}

/// IDs of the cores available for pinning.
pub fn available_cores() -> Vec<usize> {
    core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .map(|core| core.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawn_runs_closure_on_named_thread() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let handle = ThreadContext::new().named("test-processor").spawn(move || {
            assert_eq!(
                std::thread::current().name(),
                Some("test-processor")
            );
            flag.store(true, Ordering::Release);
        });

        handle.join().unwrap();
        assert!(ran.load(Ordering::Acquire));
    }
}
