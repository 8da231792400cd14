use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashSet,
    panic::{catch_unwind, AssertUnwindSafe},
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use futures::{future::ready, FutureExt};
use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::{
    constraint::{CancelToken, Constraint, ValidationFuture},
    core::{is_runtime_exists, waker_from_sink, RunKey, WakeSink},
    helper::ValidationHelper,
    Dependency, ValidationOutcome, ValidationResult,
};


/// Lifecycle report of one validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[display(style = "lowercase")]
pub enum ValidatorState {
    Started,
    Succeeded,
    Failed,
    Cancelled,
}

/// A lifecycle report together with the constraint that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{index}:{state}")]
pub struct ValidatorEvent {
    pub index: usize,
    pub state: ValidatorState,
    /// Another run of the same constraint follows immediately.
    pub intermediate: bool,
}

/// Runs one constraint so that at most one of its runs is current.
///
/// Starting a run while another is outstanding cancels the outstanding run.
/// Completions are keyed by run number, so a stale wake-up of a replaced run is ignored.
pub(crate) struct SerializedValidator<T: 'static, D: 'static> {
    index: usize,
    constraint: Constraint<T, D>,
    dependencies: HashSet<Dependency>,
    next_run: Cell<u64>,
    current: RefCell<Option<Run<T, D>>>,
    last_valid: Cell<Option<bool>>,
}

struct Run<T, D> {
    id: u64,
    value: T,
    cancel: CancelToken,
    waker: Waker,
    /// `None` while the future is being polled.
    future: Option<ValidationFuture<D>>,
}

impl<T: Clone + 'static, D: Clone + 'static> SerializedValidator<T, D> {
    pub fn new(index: usize, constraint: Constraint<T, D>) -> Self {
        let dependencies = constraint.dependencies().iter().cloned().collect();
        Self {
            index,
            constraint,
            dependencies,
            next_run: Cell::new(0),
            current: RefCell::new(None),
            last_valid: Cell::new(None),
        }
    }

    pub fn is_dependency(&self, dependency: &Dependency) -> bool {
        self.dependencies.contains(dependency)
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.constraint.dependencies().iter()
    }

    /// Validity of the latest completed run. `None` if there is none or it was cancelled.
    pub fn last_valid(&self) -> Option<bool> {
        self.last_valid.get()
    }

    /// Starts a run for `value` without polling it, cancelling the outstanding run.
    ///
    /// Returns the run number to pass to [`poll_run`](Self::poll_run).
    pub fn start(&self, value: T, helper: &Rc<ValidationHelper<T, D>>) -> u64 {
        let stale = self.current.borrow_mut().take();
        if let Some(stale) = stale {
            self.cancel(stale, helper);
        }

        let id = self.next_run.get();
        self.next_run.set(id + 1);
        tracing::trace!(index = self.index, run = id, name = helper.name(), "validation started");
        helper.on_started(self.index);

        let cancel = CancelToken::new();
        let validated = catch_unwind(AssertUnwindSafe(|| {
            self.constraint.validate(&value, cancel.clone())
        }));
        let future = match validated {
            Ok(Ok(future)) => future,
            Ok(Err(e)) => {
                tracing::debug!(index = self.index, run = id, name = helper.name(), error = %e, "constraint failed synchronously");
                failed_future()
            }
            Err(payload) => {
                tracing::debug!(index = self.index, run = id, name = helper.name(), panic = panic_message(&*payload), "constraint panicked");
                failed_future()
            }
        };
        let sink: Weak<dyn WakeSink> = Rc::downgrade(helper) as Weak<dyn WakeSink>;
        let waker = waker_from_sink(
            sink,
            RunKey {
                index: self.index,
                run: id,
            },
        );
        *self.current.borrow_mut() = Some(Run {
            id,
            value,
            cancel,
            waker,
            future: Some(future),
        });
        id
    }

    /// Polls run `id` once, reporting its completion if it is ready.
    pub fn poll_run(&self, id: u64, helper: &Rc<ValidationHelper<T, D>>) {
        let Some((mut future, waker)) = self.take_future(id) else {
            return;
        };
        let poll = catch_unwind(AssertUnwindSafe(|| {
            future.poll_unpin(&mut Context::from_waker(&waker))
        }))
        .unwrap_or_else(|payload| {
            tracing::debug!(index = self.index, run = id, name = helper.name(), panic = panic_message(&*payload), "validation future panicked");
            Poll::Ready(ValidationOutcome::Completed(ValidationResult::invalid()))
        });

        let outcome = match poll {
            Poll::Ready(outcome) => outcome,
            Poll::Pending => {
                let mut current = self.current.borrow_mut();
                if let Some(run) = current.as_mut().filter(|run| run.id == id) {
                    run.future = Some(future);
                    if !is_runtime_exists() {
                        tracing::warn!(
                            index = self.index,
                            run = id,
                            name = helper.name(),
                            "validation is pending but no `Runtime` exists on this thread"
                        );
                    }
                }
                return;
            }
        };
        drop(future);
        let run = {
            let mut current = self.current.borrow_mut();
            match current.take() {
                Some(run) if run.id == id => run,
                other => {
                    *current = other;
                    return;
                }
            }
        };
        // A queued invalidation restarts this constraint right after the current cycle step.
        let intermediate = helper.is_restart_queued(self.index);
        match outcome {
            ValidationOutcome::Completed(result) => {
                self.complete(id, run.value, result, intermediate, helper)
            }
            ValidationOutcome::Cancelled => {
                tracing::debug!(index = self.index, run = id, name = helper.name(), "validation cancelled by its source");
                self.last_valid.set(None);
                helper.on_cancelled(self.index, intermediate);
            }
        }
    }

    fn take_future(&self, id: u64) -> Option<(ValidationFuture<D>, Waker)> {
        let mut current = self.current.borrow_mut();
        let run = current.as_mut()?;
        if run.id != id {
            return None;
        }
        Some((run.future.take()?, run.waker.clone()))
    }

    fn cancel(&self, run: Run<T, D>, helper: &Rc<ValidationHelper<T, D>>) {
        run.cancel.cancel();
        tracing::debug!(index = self.index, run = run.id, name = helper.name(), "validation cancelled");
        drop(run);
        self.last_valid.set(None);
        helper.on_cancelled(self.index, true);
    }

    fn complete(
        &self,
        id: u64,
        value: T,
        result: ValidationResult<D>,
        intermediate: bool,
        helper: &Rc<ValidationHelper<T, D>>,
    ) {
        let valid = result.is_valid();
        tracing::trace!(index = self.index, run = id, name = helper.name(), valid, "validation completed");
        self.last_valid.set(Some(valid));
        helper.on_completed(self.index, value, result, intermediate);
    }
}
impl<T: 'static, D: 'static> Drop for SerializedValidator<T, D> {
    fn drop(&mut self) {
        if let Some(run) = self.current.get_mut() {
            run.cancel.cancel();
        }
    }
}

fn failed_future<D: 'static>() -> ValidationFuture<D> {
    ready(ValidationOutcome::Completed(ValidationResult::invalid())).boxed_local()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
