use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use derive_ex::derive_ex;
use parse_display::Display;
use serde::{Serialize, Serializer};

use crate::{
    helper::{ChangeKind, Flag, Trigger, ValidationHelper, ValueSource},
    state::DependencySinks,
    Constraint, Dependency, DependencyNode, DependencySink, DiagnosticList, Slot, State,
    Subscription, ToDependency, ValidationState, ValidatorEvent,
};


const SOURCE: Slot = Slot(0);
const USER_MODIFIED: Slot = Slot(1);

/// Failure of an operation on a [`ConstrainedValue`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ConstrainedValueError {
    #[display("cannot set a value that is bound to a source")]
    Bound,
}

impl std::error::Error for ConstrainedValueError {}

/// A value whose validity is tracked against a set of constraints.
///
/// Every change of the value, or of a dependency of one of its constraints, starts the affected constraints.
/// The flags, the diagnostics and the constrained value (the latest value that satisfied every constraint)
/// are kept consistent with the latest result of each constraint.
///
/// Runs whose future is ready on the first poll complete inside [`set`](Self::set).
/// Runs that stay pending complete when their waker fires and [`Runtime::update`](crate::Runtime::update) is called.
#[derive_ex(Clone, bound())]
pub struct ConstrainedValue<T: 'static, D: 'static>(Rc<ConstrainedNode<T, D>>);

impl<T: Clone + 'static, D: Clone + 'static> ConstrainedValue<T, D> {
    /// Creates a value validated against `constraints` immediately.
    pub fn new(value: T, constraints: impl IntoIterator<Item = Constraint<T, D>>) -> Self {
        Self::builder(value).constraints(constraints).build()
    }

    pub fn builder(value: T) -> ConstrainedValueBuilder<T, D> {
        ConstrainedValueBuilder::new(value)
    }

    pub fn name(&self) -> Option<&str> {
        self.0.helper.name()
    }

    pub fn get(&self) -> T {
        self.0.value.borrow().clone()
    }

    /// Sets the value and starts every constraint.
    ///
    /// Fails if the value is bound to a source.
    pub fn set(&self, value: T) -> Result<(), ConstrainedValueError> {
        if self.is_bound() {
            return Err(ConstrainedValueError::Bound);
        }
        *self.0.value.borrow_mut() = value;
        self.0.changed();
        Ok(())
    }

    /// Sets the value only if it differs from the current value.
    pub fn set_dedup(&self, value: T) -> Result<(), ConstrainedValueError>
    where
        T: PartialEq,
    {
        if self.is_bound() {
            return Err(ConstrainedValueError::Bound);
        }
        let changed = {
            let mut this_value = self.0.value.borrow_mut();
            if *this_value != value {
                *this_value = value;
                true
            } else {
                false
            }
        };
        if changed {
            self.0.changed();
        }
        Ok(())
    }

    /// Makes the value follow `source`. The current value of `source` is taken over immediately.
    pub fn bind(&self, source: &State<T>) {
        self.0.clone().bind(source);
    }

    /// Stops following the source. The value keeps the last value of the source.
    pub fn unbind(&self) {
        let binding = self.0.binding.borrow_mut().take();
        drop(binding);
    }

    pub fn is_bound(&self) -> bool {
        self.0.binding.borrow().is_some()
    }

    /// Runs every constraint again against the current value.
    pub fn revalidate(&self) {
        self.0.helper.invalidate(Trigger::Value);
    }

    /// Runs `f` with notifications deferred, so that each flag fires at most one edge for the whole batch.
    ///
    /// # Panics
    ///
    /// Panics if called while a batch of this value is already open.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.0.helper.begin_quiescence();
        let _guard = BatchGuard(&self.0.helper);
        f()
    }

    pub fn is_valid(&self) -> bool {
        self.0.helper.flag(Flag::Valid)
    }
    pub fn is_invalid(&self) -> bool {
        self.0.helper.flag(Flag::Invalid)
    }
    pub fn is_user_valid(&self) -> bool {
        self.0.helper.flag(Flag::UserValid)
    }
    pub fn is_user_invalid(&self) -> bool {
        self.0.helper.flag(Flag::UserInvalid)
    }
    pub fn is_validating(&self) -> bool {
        self.0.helper.flag(Flag::Validating)
    }
    pub fn flag(&self, flag: Flag) -> bool {
        self.0.helper.flag(flag)
    }
    pub fn validation_state(&self) -> ValidationState {
        self.0.helper.validation_state()
    }

    pub fn diagnostics(&self) -> DiagnosticList<D> {
        self.0.helper.diagnostics().clone()
    }

    pub fn constraint_count(&self) -> usize {
        self.0.helper.constraint_count()
    }

    /// The latest value that satisfied every constraint.
    pub fn constrained_value(&self) -> T {
        self.0.helper.deferred().get()
    }

    pub fn is_user_modified(&self) -> bool {
        self.0.helper.is_user_modified()
    }
    pub fn set_user_modified(&self, value: bool) {
        self.0.helper.set_user_modified(value);
    }

    /// Calls `f` with `(value, kind, old, new)` each time `valid`, `invalid` or `validating` changes.
    pub fn add_listener(
        &self,
        f: impl Fn(&T, ChangeKind, bool, bool) + 'static,
    ) -> Subscription {
        self.0.helper.subscribe(f)
    }

    pub fn subscribe_flag(&self, flag: Flag, f: impl Fn(bool) + 'static) -> Subscription {
        self.0.helper.subscribe_flag(flag, f)
    }

    pub fn subscribe_constrained_value(&self, f: impl Fn(&T) + 'static) -> Subscription {
        self.0.helper.deferred().subscribe(f)
    }

    /// Calls `f` with every lifecycle report of every constraint.
    pub fn subscribe_validator_events(&self, f: impl Fn(ValidatorEvent) + 'static) -> Subscription {
        self.0.helper.subscribe_validator_events(f)
    }

    pub fn to_dependency(&self) -> Dependency {
        Dependency::from_node(self.0.clone())
    }
}
impl<T, D> std::fmt::Debug for ConstrainedValue<T, D>
where
    T: Clone + std::fmt::Debug + 'static,
    D: Clone + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("ConstrainedValue");
        if let Some(name) = self.name() {
            s.field("name", &name);
        }
        match self.0.value.try_borrow() {
            Ok(value) => s.field("value", &*value),
            Err(_) => s.field("value", &"<borrowed>"),
        };
        s.field("state", &self.validation_state()).finish()
    }
}
impl<T, D> Serialize for ConstrainedValue<T, D>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.0.value.try_borrow() {
            Ok(value) => T::serialize(&*value, serializer),
            Err(_) => Err(serde::ser::Error::custom("borrowed")),
        }
    }
}
impl<T: Clone + 'static, D: Clone + 'static> ToDependency for ConstrainedValue<T, D> {
    fn to_dependency(&self) -> Dependency {
        self.to_dependency()
    }
}

/// Configures a [`ConstrainedValue`].
pub struct ConstrainedValueBuilder<T: 'static, D: 'static> {
    value: T,
    name: Option<String>,
    constraints: Vec<Constraint<T, D>>,
    initial_state: ValidationState,
    user_modified: Option<State<bool>>,
    source: Option<State<T>>,
}

impl<T: Clone + 'static, D: Clone + 'static> ConstrainedValueBuilder<T, D> {
    fn new(value: T) -> Self {
        Self {
            value,
            name: None,
            constraints: Vec::new(),
            initial_state: ValidationState::Unknown,
            user_modified: None,
            source: None,
        }
    }

    /// Name used in `Debug` output and in log events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn constraint(mut self, constraint: Constraint<T, D>) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn constraints(mut self, constraints: impl IntoIterator<Item = Constraint<T, D>>) -> Self {
        self.constraints.extend(constraints);
        self
    }

    /// The validation state assumed at construction.
    ///
    /// With `Unknown` (the default) every constraint runs once during [`build`](Self::build).
    /// With `Valid` or `Invalid` no constraint runs until the value or a dependency changes.
    pub fn initial_state(mut self, initial_state: ValidationState) -> Self {
        self.initial_state = initial_state;
        self
    }

    /// Follows `user_modified` for the `user_valid` and `user_invalid` flags.
    pub fn user_modified(mut self, user_modified: &State<bool>) -> Self {
        self.user_modified = Some(user_modified.clone());
        self
    }

    /// Binds the value to `source`. The initial value is replaced by the value of `source`.
    pub fn bind(mut self, source: &State<T>) -> Self {
        self.source = Some(source.clone());
        self
    }

    pub fn build(self) -> ConstrainedValue<T, D> {
        let value = match &self.source {
            Some(source) => source.get(),
            None => self.value,
        };
        let name = self.name;
        let initial_state = self.initial_state;
        let constraints = self.constraints;
        let node = Rc::new_cyclic(|this: &Weak<ConstrainedNode<T, D>>| {
            let source: Weak<dyn ValueSource<T>> = this.clone() as Weak<dyn ValueSource<T>>;
            ConstrainedNode {
                helper: ValidationHelper::new(name, source, value.clone(), initial_state, constraints),
                value: RefCell::new(value),
                binding: RefCell::new(None),
                user_modified: RefCell::new(None),
                sinks: DependencySinks::new(),
            }
        });
        if let Some(user_modified) = self.user_modified {
            node.helper.set_user_modified(user_modified.get());
            let sink = node.clone().into_sink();
            let s = user_modified.subscribe(sink, USER_MODIFIED);
            *node.user_modified.borrow_mut() = Some((user_modified, s));
        }
        if let Some(source) = self.source {
            let sink = node.clone().into_sink();
            let s = source.subscribe(sink, SOURCE);
            *node.binding.borrow_mut() = Some((source, s));
        }
        if initial_state == ValidationState::Unknown {
            node.helper.invalidate(Trigger::Value);
        }
        ConstrainedValue(node)
    }
}

struct ConstrainedNode<T: 'static, D: 'static> {
    value: RefCell<T>,
    binding: RefCell<Option<(State<T>, Subscription)>>,
    user_modified: RefCell<Option<(State<bool>, Subscription)>>,
    helper: Rc<ValidationHelper<T, D>>,
    sinks: DependencySinks,
}

impl<T: Clone + 'static, D: Clone + 'static> ConstrainedNode<T, D> {
    fn sinks(&self) -> &DependencySinks {
        &self.sinks
    }

    fn into_sink(self: Rc<Self>) -> Weak<dyn DependencySink> {
        Rc::downgrade(&self) as Weak<dyn DependencySink>
    }

    fn changed(self: &Rc<Self>) {
        self.helper.invalidate(Trigger::Value);
        self.sinks.notify(&Dependency::from_node(self.clone()));
    }

    fn bind(self: Rc<Self>, source: &State<T>) {
        let s = source.subscribe(self.clone().into_sink(), SOURCE);
        let old = self.binding.borrow_mut().replace((source.clone(), s));
        drop(old);
        self.pull_source();
    }

    fn pull_source(self: &Rc<Self>) {
        let Some(value) = self.binding.borrow().as_ref().map(|(source, _)| source.get()) else {
            return;
        };
        *self.value.borrow_mut() = value;
        self.changed();
    }

    fn pull_user_modified(&self) {
        let value = self.user_modified.borrow().as_ref().map(|(s, _)| s.get());
        if let Some(value) = value {
            self.helper.set_user_modified(value);
        }
    }
}

impl<T: Clone + 'static, D: Clone + 'static> ValueSource<T> for ConstrainedNode<T, D> {
    fn read_value(&self) -> T {
        self.value.borrow().clone()
    }
}

impl<T: Clone + 'static, D: Clone + 'static> DependencyNode for ConstrainedNode<T, D> {
    fn subscribe(self: Rc<Self>, sink: Weak<dyn DependencySink>, slot: Slot) -> Subscription {
        self.sinks
            .subscribe(Rc::downgrade(&self), Self::sinks, sink, slot)
    }
}

impl<T: Clone + 'static, D: Clone + 'static> DependencySink for ConstrainedNode<T, D> {
    fn invalidated(self: Rc<Self>, slot: Slot, _dependency: &Dependency) {
        match slot {
            SOURCE => self.pull_source(),
            USER_MODIFIED => self.pull_user_modified(),
            _ => {}
        }
    }
}

struct BatchGuard<'a, T: Clone + 'static, D: Clone + 'static>(&'a Rc<ValidationHelper<T, D>>);

impl<T: Clone + 'static, D: Clone + 'static> Drop for BatchGuard<'_, T, D> {
    fn drop(&mut self) {
        self.0.end_quiescence();
    }
}
