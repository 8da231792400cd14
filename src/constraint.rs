use std::{
    future::Future,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use derive_ex::derive_ex;
use futures::{
    future::{ready, LocalBoxFuture},
    FutureExt,
};
use parse_display::Display;

use crate::{Dependency, ToDependency, ValidationOutcome, ValidationResult};

pub type ValidationFuture<D> = LocalBoxFuture<'static, ValidationOutcome<D>>;

type ValidateFn<T, D> = dyn Fn(&T, CancelToken) -> Result<ValidationFuture<D>, ConstraintError>;

/// A check applied to a value, together with the dependencies that re-trigger it.
///
/// A constraint maps a value to a future producing a [`ValidationResult`],
/// or a [`ValidationOutcome`] when the run can end up cancelled by its own source.
/// Synchronous constraints return a future that is ready on the first poll;
/// asynchronous ones may complete later, possibly after a background computation.
///
/// The engine may drop the future of an outdated run at any point.
/// Work that continues outside the future (for example on another thread) should poll
/// the [`CancelToken`] passed to [`Constraint::from_cancellable`].
#[derive_ex(Clone, bound())]
pub struct Constraint<T: 'static, D: 'static> {
    validate: Rc<ValidateFn<T, D>>,
    dependencies: Vec<Dependency>,
}

impl<T: 'static, D: 'static> Constraint<T, D> {
    /// Creates a constraint whose function may fail before producing a future.
    ///
    /// A failure is reported as an invalid result without a diagnostic.
    pub fn from_try_fn<Fut>(
        f: impl Fn(&T, CancelToken) -> Result<Fut, ConstraintError> + 'static,
    ) -> Self
    where
        Fut: Future<Output = ValidationResult<D>> + 'static,
    {
        Self::from_raw(move |value, cancel| {
            f(value, cancel).map(|fut| fut.map(ValidationOutcome::Completed).boxed_local())
        })
    }

    /// Creates a constraint whose runs may report themselves cancelled.
    ///
    /// A run that resolves to [`ValidationOutcome::Cancelled`] is reported as cancelled
    /// and leaves the outcome of this constraint unknown.
    pub fn from_outcome<Fut>(f: impl Fn(&T, CancelToken) -> Fut + 'static) -> Self
    where
        Fut: Future<Output = ValidationOutcome<D>> + 'static,
    {
        Self::from_raw(move |value, cancel| Ok(f(value, cancel).boxed_local()))
    }

    fn from_raw(
        f: impl Fn(&T, CancelToken) -> Result<ValidationFuture<D>, ConstraintError> + 'static,
    ) -> Self {
        Self {
            validate: Rc::new(f),
            dependencies: Vec::new(),
        }
    }

    /// Creates a synchronous constraint.
    pub fn from_fn(f: impl Fn(&T) -> ValidationResult<D> + 'static) -> Self {
        Self::from_try_fn(move |value: &T, _| Ok(ready(f(value))))
    }

    pub fn from_async<Fut>(f: impl Fn(&T) -> Fut + 'static) -> Self
    where
        Fut: Future<Output = ValidationResult<D>> + 'static,
    {
        Self::from_try_fn(move |value: &T, _| Ok(f(value)))
    }

    pub fn from_cancellable<Fut>(f: impl Fn(&T, CancelToken) -> Fut + 'static) -> Self
    where
        Fut: Future<Output = ValidationResult<D>> + 'static,
    {
        Self::from_try_fn(move |value: &T, cancel| Ok(f(value, cancel)))
    }

    /// Re-runs this constraint whenever `dependency` is invalidated.
    pub fn depends_on(mut self, dependency: &impl ToDependency) -> Self {
        self.dependencies.push(dependency.to_dependency());
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = Dependency>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub(crate) fn validate(
        &self,
        value: &T,
        cancel: CancelToken,
    ) -> Result<ValidationFuture<D>, ConstraintError> {
        (self.validate)(value, cancel)
    }
}
impl<T, D> std::fmt::Debug for Constraint<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Constraint")
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Cooperative cancellation signal of one validation run.
///
/// The token can be moved to other threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A constraint function failed before producing its future.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
#[display("constraint failed: {message}")]
pub struct ConstraintError {
    message: String,
}

impl ConstraintError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
    pub fn from_error(e: &impl std::error::Error) -> Self {
        Self::new(e.to_string())
    }
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::error::Error for ConstraintError {}
