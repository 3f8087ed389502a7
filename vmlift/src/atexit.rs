//! LIFO cleanup stack for scoped resources.
//!
//! Scratch directories, overlays, mounted filesystems, child processes
//! and provisioned targets all register an action here. The stack runs
//! in reverse registration order, on success and on failure alike, and
//! is idempotent: each action fires at most once, so running the stack a
//! second time is a no-op. Action failures are logged warnings, never
//! surfaced as pipeline errors.

use tracing::{debug, warn};

/// Handle to one registered action, used to disarm it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionId(usize);

/// One pending cleanup action.
struct Action {
    /// Short human-readable label for logs.
    label: String,
    /// The action; `None` once fired or disarmed.
    run: Option<Box<dyn FnOnce() -> std::io::Result<()>>>,
}

/// Stack of cleanup actions, run LIFO.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<Action>,
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupStack")
            .field("pending", &self.actions.iter().filter(|a| a.run.is_some()).count())
            .finish()
    }
}

impl CleanupStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action; later actions run first.
    pub fn push(
        &mut self,
        label: impl Into<String>,
        action: impl FnOnce() -> std::io::Result<()> + 'static,
    ) -> ActionId {
        self.actions.push(Action {
            label: label.into(),
            run: Some(Box::new(action)),
        });
        ActionId(self.actions.len() - 1)
    }

    /// Disarms an action so it never runs (e.g. "delete target on
    /// failure" after a fully successful run).
    pub fn disarm(&mut self, id: ActionId) {
        if let Some(a) = self.actions.get_mut(id.0) {
            a.run = None;
        }
    }

    /// Runs all pending actions in LIFO order, swallowing failures.
    pub fn run(&mut self) {
        for action in self.actions.iter_mut().rev() {
            if let Some(run) = action.run.take() {
                debug!(label = %action.label, "cleanup");
                if let Err(e) = run() {
                    warn!(label = %action.label, error = %e, "cleanup action failed");
                }
            }
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.run();
    }
}
