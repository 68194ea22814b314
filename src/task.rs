//! Ownership of the background tasks of a node.

use std::future::Future;

use log::{debug, trace};

/// A handle to a task, which is only used to abort the task. In case this handle is dropped, the
/// task is cancelled automatically.
pub struct AbortHandle(tokio::task::AbortHandle);

impl AbortHandle {
    /// Abort the task this `AbortHandle` is referencing. Calling this more than once has no
    /// further effect.
    #[inline]
    pub fn abort(&self) {
        self.0.abort()
    }
}

impl Drop for AbortHandle {
    #[inline]
    fn drop(&mut self) {
        self.0.abort()
    }
}

impl From<tokio::task::AbortHandle> for AbortHandle {
    #[inline]
    fn from(value: tokio::task::AbortHandle) -> Self {
        Self(value)
    }
}

/// A set of named tasks which all get cancelled when the set is dropped.
#[derive(Default)]
pub struct TaskSet {
    tasks: Vec<(&'static str, AbortHandle)>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task on the current runtime and take ownership of it.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        trace!("Spawning {name} task");
        let handle = tokio::spawn(async move {
            task.await;
            debug!("{name} task finished");
        });
        self.tasks.push((name, handle.abort_handle().into()));
    }

    /// Add the tasks of another set to this one.
    pub fn extend(&mut self, mut other: TaskSet) {
        self.tasks.extend(std::mem::take(&mut other.tasks));
    }

    /// Cancel every task in the set.
    pub fn abort_all(&mut self) {
        for (name, handle) in self.tasks.drain(..) {
            trace!("Aborting {name} task");
            handle.abort();
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}
