//! Best-effort shutdown cleanup.
//!
//! Termination runs each registered callback once, synchronously, in
//! registration order. In-flight requests are not drained; shutdown is
//! abrupt by design.

/// A stack of cleanup callbacks run on shutdown.
#[derive(Default)]
pub struct CleanupStack {
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl CleanupStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback.
    pub fn register(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// Runs all callbacks in registration order, consuming the stack.
    pub fn run(self) {
        for callback in self.callbacks {
            callback();
        }
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}
