use std::future::Future;

use futures::future::BoxFuture;

use crate::MonounitResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, MonounitResult<()>> + Send>;

/// A stack of compensating actions for a multi-step operation.
///
/// Each successful mutating step pushes the action that undoes it. When a later step fails the
/// stack is unwound newest first; when the whole operation succeeds it is committed and the
/// actions are dropped unrun. Failures of the actions themselves are logged and never replace
/// the error that caused the unwind.
#[derive(Default)]
pub struct Rollback {
    actions: Vec<(String, Compensation)>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Rollback {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the action that undoes a step. A step that can fail half way records it before
    /// it runs, and its undo must then tolerate finding nothing to undo.
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = MonounitResult<()>> + Send + 'static,
    {
        self.actions
            .push((label.into(), Box::new(move || Box::pin(undo()))));
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no action is pending.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Labels of the pending actions, oldest first.
    pub fn labels(&self) -> Vec<&str> {
        self.actions.iter().map(|(label, _)| label.as_str()).collect()
    }

    /// Runs every pending action, newest first.
    pub async fn unwind(&mut self) {
        while let Some((label, undo)) = self.actions.pop() {
            tracing::info!("rolling back: {label}");
            if let Err(e) = undo().await {
                tracing::warn!("rollback step '{label}' failed: {e}");
            }
        }
    }

    /// Passes `result` through, unwinding first when it is an error.
    pub async fn guard<T>(&mut self, result: MonounitResult<T>) -> MonounitResult<T> {
        if result.is_err() {
            self.unwind().await;
        }
        result
    }

    /// Drops every pending action without running it.
    pub fn commit(&mut self) {
        self.actions.clear();
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rollback")
            .field("actions", &self.labels())
            .finish()
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            tracing::warn!(
                "dropping {} compensating actions that were neither run nor committed: {:?}",
                self.actions.len(),
                self.labels()
            );
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
