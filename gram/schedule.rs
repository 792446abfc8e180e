// ========================================================================================
//
//                    Fire-when-ready task graphs and shared failure state
//
// ========================================================================================
//
// A task runs once every prerequisite has finished. Each task carries an atomic
// count of unmet prerequisites; whichever prerequisite brings that count to zero
// spawns it onto the rayon pool. There are no barriers besides the implicit join
// at the end of the enclosing `rayon::scope`.
//
// A panic inside any task is caught, its message is stored, and a shared
// cancellation flag is raised. Tasks that have not started yet see the flag and
// return without doing work, so the scope drains quickly and the caller gets a
// `GramError::TaskFailed` instead of a partially updated result.

use crate::types::GramError;
use rayon::Scope;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked with a non-string payload".to_string()
    }
}

/// Cancellation flag plus the first failure message seen by any task.
#[derive(Debug, Default)]
pub struct FailureSlot {
    cancelled: AtomicBool,
    message: Mutex<Option<String>>,
}

impl FailureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Stores `message` unless an earlier failure already did, then cancels.
    pub fn record(&self, message: String) {
        let mut slot = match self.message.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(message);
        }
        self.cancelled.store(true, Ordering::Release);
    }

    /// Runs `f`, turning a panic into a recorded failure. Returns `None` when `f`
    /// panicked or the slot was already cancelled.
    pub fn guard<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.is_cancelled() {
            return None;
        }
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                self.record(panic_message(payload.as_ref()));
                None
            }
        }
    }

    pub fn into_result(self, stage: &'static str) -> Result<(), GramError> {
        let message = match self.message.into_inner() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        match message {
            Some(message) => Err(GramError::TaskFailed { stage, message }),
            None if self.cancelled.into_inner() => Err(GramError::TaskFailed {
                stage,
                message: "cancelled".to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// A dependency graph over tasks `0..len`, consumed by a single `run`.
#[derive(Debug)]
pub struct TaskGraph {
    pending: Vec<AtomicUsize>,
    successors: Vec<Vec<usize>>,
}

impl TaskGraph {
    pub fn new(len: usize) -> Self {
        Self {
            pending: (0..len).map(|_| AtomicUsize::new(0)).collect(),
            successors: vec![Vec::new(); len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.successors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.successors.is_empty()
    }

    /// Makes `after` wait for `before`.
    pub fn add_edge(&mut self, before: usize, after: usize) {
        self.successors[before].push(after);
        *self.pending[after].get_mut() += 1;
    }

    /// Number of unmet prerequisites of `task` before the graph runs.
    pub fn dependencies(&mut self, task: usize) -> usize {
        *self.pending[task].get_mut()
    }

    /// Executes every task exactly once, respecting the edges. `body` receives
    /// the task index.
    pub fn run<F>(self, stage: &'static str, body: F) -> Result<(), GramError>
    where
        F: Fn(usize) + Sync,
    {
        let total = self.len();
        let roots: Vec<usize> = (0..total)
            .filter(|&t| self.pending[t].load(Ordering::Relaxed) == 0)
            .collect();
        log::trace!("{stage}: {total} tasks, {} ready at start", roots.len());
        let run = Run {
            graph: &self,
            body: &body,
            failure: FailureSlot::new(),
            completed: AtomicUsize::new(0),
        };
        rayon::scope(|s| {
            for &root in &roots {
                run.spawn(s, root);
            }
        });
        let completed = run.completed.load(Ordering::Acquire);
        run.failure.into_result(stage)?;
        if completed != total {
            return Err(GramError::IncompleteSchedule { completed, total });
        }
        Ok(())
    }
}

struct Run<'a, F> {
    graph: &'a TaskGraph,
    body: &'a F,
    failure: FailureSlot,
    completed: AtomicUsize,
}

impl<'a, F> Run<'a, F>
where
    F: Fn(usize) + Sync,
{
    fn spawn<'s>(&'s self, s: &Scope<'s>, task: usize) {
        s.spawn(move |s| self.execute(s, task));
    }

    fn execute<'s>(&'s self, s: &Scope<'s>, task: usize) {
        if self.failure.guard(|| (self.body)(task)).is_none() {
            return;
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
        for &next in &self.graph.successors[task] {
            if self.graph.pending[next].fetch_sub(1, Ordering::AcqRel) == 1 {
                self.spawn(s, next);
            }
        }
    }
}
