use std::{
    cell::{Cell, RefCell},
    collections::{HashSet, VecDeque},
    mem::take,
    rc::{Rc, Weak},
};

use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::{
    core::{RunKey, WakeSink},
    deferred::DeferredValue,
    utils::Listeners,
    validator::{SerializedValidator, ValidatorEvent, ValidatorState},
    Constraint, Dependency, DependencySink, DiagnosticList, Slot, Subscription,
    ValidationResult, ValidationState,
};


/// The flag reported by a validation listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[display(style = "snake_case")]
pub enum ChangeKind {
    Valid,
    Invalid,
    Validating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[display(style = "snake_case")]
pub enum Flag {
    Valid,
    Invalid,
    /// `valid` and the value was modified by the user.
    UserValid,
    /// `invalid` and the value was modified by the user.
    UserInvalid,
    Validating,
}

impl Flag {
    pub fn change_kind(self) -> Option<ChangeKind> {
        match self {
            Flag::Valid => Some(ChangeKind::Valid),
            Flag::Invalid => Some(ChangeKind::Invalid),
            Flag::Validating => Some(ChangeKind::Validating),
            Flag::UserValid | Flag::UserInvalid => None,
        }
    }
}

const ALL_FLAGS: &[Flag] = &[
    Flag::Valid,
    Flag::UserValid,
    Flag::Invalid,
    Flag::UserInvalid,
    Flag::Validating,
];
const VALIDATING_FLAG: &[Flag] = &[Flag::Validating];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Flags {
    valid: bool,
    invalid: bool,
    user_valid: bool,
    user_invalid: bool,
    validating: bool,
}
impl Flags {
    fn get(&self, flag: Flag) -> bool {
        match flag {
            Flag::Valid => self.valid,
            Flag::Invalid => self.invalid,
            Flag::UserValid => self.user_valid,
            Flag::UserInvalid => self.user_invalid,
            Flag::Validating => self.validating,
        }
    }
    fn set(&mut self, flag: Flag, value: bool) {
        match flag {
            Flag::Valid => self.valid = value,
            Flag::Invalid => self.invalid = value,
            Flag::UserValid => self.user_valid = value,
            Flag::UserInvalid => self.user_invalid = value,
            Flag::Validating => self.validating = value,
        }
    }
    fn settle(&mut self, state: ValidationState, user_modified: bool) {
        self.validating = false;
        self.valid = state == ValidationState::Valid;
        self.invalid = state == ValidationState::Invalid;
        self.user_valid = user_modified && self.valid;
        self.user_invalid = user_modified && self.invalid;
    }
}

struct HelperState {
    current: Flags,
    last: Flags,
    running: usize,
    is_quiescent: bool,
    user_modified: bool,
    /// A run reported or a candidate was stored since quiescence began.
    is_touched: bool,
}
impl HelperState {
    fn finish_run(&mut self) -> usize {
        if self.running == 0 {
            panic!("A validation run completed without being started.");
        }
        self.running -= 1;
        self.running
    }
}

/// Reads the current value of the constrained value that owns a [`ValidationHelper`].
pub(crate) trait ValueSource<T>: 'static {
    fn read_value(&self) -> T;
}

pub(crate) enum Trigger {
    Value,
    Dependency(Dependency),
    Wake(RunKey),
}

/// Merges the lifecycle reports of every constraint of one value into its validation flags.
///
/// Every invalidation runs inside a quiescence bracket, so each flag fires at most one edge per cycle.
/// Invalidations that arrive while a cycle is being processed are queued and handled by the same cycle.
pub(crate) struct ValidationHelper<T: 'static, D: 'static> {
    name: Option<String>,
    source: Weak<dyn ValueSource<T>>,
    validators: Vec<SerializedValidator<T, D>>,
    state: RefCell<HelperState>,
    diagnostics: DiagnosticList<D>,
    deferred: Rc<DeferredValue<T>>,
    queue: RefCell<VecDeque<Trigger>>,
    is_dispatching: Cell<bool>,
    listeners: Listeners<dyn Fn(&T, ChangeKind, bool, bool)>,
    flag_listeners: Listeners<dyn Fn(Flag, bool)>,
    event_listeners: Listeners<dyn Fn(ValidatorEvent)>,
    dependency_subscriptions: RefCell<Vec<Subscription>>,
}

impl<T: Clone + 'static, D: Clone + 'static> ValidationHelper<T, D> {
    pub fn new(
        name: Option<String>,
        source: Weak<dyn ValueSource<T>>,
        value: T,
        initial_state: ValidationState,
        constraints: Vec<Constraint<T, D>>,
    ) -> Rc<Self> {
        let flags = Flags {
            valid: constraints.is_empty() || initial_state == ValidationState::Valid,
            invalid: !constraints.is_empty() && initial_state == ValidationState::Invalid,
            ..Flags::default()
        };
        let validators: Vec<_> = constraints
            .into_iter()
            .enumerate()
            .map(|(index, c)| SerializedValidator::new(index, c))
            .collect();
        let this = Rc::new(Self {
            name,
            source,
            diagnostics: DiagnosticList::new(validators.len()),
            validators,
            state: RefCell::new(HelperState {
                current: flags,
                last: flags,
                running: 0,
                is_quiescent: false,
                user_modified: false,
                is_touched: false,
            }),
            deferred: DeferredValue::new(value),
            queue: RefCell::new(VecDeque::new()),
            is_dispatching: Cell::new(false),
            listeners: Listeners::new(),
            flag_listeners: Listeners::new(),
            event_listeners: Listeners::new(),
            dependency_subscriptions: RefCell::new(Vec::new()),
        });

        let sink: Weak<dyn DependencySink> = Rc::downgrade(&this) as Weak<dyn DependencySink>;
        let mut subscribed = HashSet::new();
        let mut subscriptions = Vec::new();
        for dependency in this.validators.iter().flat_map(|v| v.dependencies()) {
            if subscribed.insert(dependency.clone()) {
                subscriptions.push(dependency.subscribe(sink.clone(), Slot(0)));
            }
        }
        *this.dependency_subscriptions.borrow_mut() = subscriptions;
        this
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    pub fn diagnostics(&self) -> &DiagnosticList<D> {
        &self.diagnostics
    }
    pub fn deferred(&self) -> &Rc<DeferredValue<T>> {
        &self.deferred
    }
    pub fn constraint_count(&self) -> usize {
        self.validators.len()
    }

    pub fn flag(&self, flag: Flag) -> bool {
        self.state.borrow().current.get(flag)
    }

    /// The aggregate state as seen by the flags: `Invalid` as soon as any run fails.
    pub fn validation_state(&self) -> ValidationState {
        let current = self.state.borrow().current;
        if current.invalid {
            ValidationState::Invalid
        } else if current.valid {
            ValidationState::Valid
        } else {
            ValidationState::Unknown
        }
    }

    pub fn is_quiescent(&self) -> bool {
        self.state.borrow().is_quiescent
    }

    pub fn is_user_modified(&self) -> bool {
        self.state.borrow().user_modified
    }

    pub fn set_user_modified(&self, value: bool) {
        let is_quiescent = {
            let mut s = self.state.borrow_mut();
            if s.user_modified == value {
                return;
            }
            s.user_modified = value;
            s.current.user_valid = value && s.current.valid;
            s.current.user_invalid = value && s.current.invalid;
            s.is_quiescent
        };
        if !is_quiescent {
            self.fire(ALL_FLAGS);
        }
    }

    /// Queues `trigger` and processes the queue unless a cycle is already being processed.
    pub fn invalidate(self: &Rc<Self>, trigger: Trigger) {
        self.queue.borrow_mut().push_back(trigger);
        if self.is_dispatching.replace(true) {
            return;
        }
        let _guard = DispatchGuard(&self.is_dispatching);
        while self.has_pending() {
            let _bracket = (!self.is_quiescent()).then(|| QuiescenceGuard::begin(self));
            while let Some(trigger) = self.pop_trigger() {
                self.dispatch(trigger);
            }
        }
    }
    fn has_pending(&self) -> bool {
        !self.queue.borrow().is_empty()
    }
    fn pop_trigger(&self) -> Option<Trigger> {
        self.queue.borrow_mut().pop_front()
    }

    fn dispatch(self: &Rc<Self>, trigger: Trigger) {
        let targets: Vec<usize> = match &trigger {
            Trigger::Wake(key) => {
                if let Some(validator) = self.validators.get(key.index) {
                    validator.poll_run(key.run, self);
                }
                return;
            }
            Trigger::Value => (0..self.validators.len()).collect(),
            Trigger::Dependency(dependency) => self
                .validators
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_dependency(dependency))
                .map(|(index, _)| index)
                .collect(),
        };
        let Some(value) = self.read_value() else {
            return;
        };
        if self.validators.is_empty() {
            self.deferred.store(value);
            self.state.borrow_mut().is_touched = true;
            return;
        }
        let runs: Vec<(usize, u64)> = targets
            .into_iter()
            .map(|index| (index, self.validators[index].start(value.clone(), self)))
            .collect();
        for (index, run) in runs {
            self.validators[index].poll_run(run, self);
        }
    }

    /// Returns `true` if a queued invalidation will start the constraint at `index` again.
    pub(crate) fn is_restart_queued(&self, index: usize) -> bool {
        let validator = &self.validators[index];
        self.queue.borrow().iter().any(|trigger| match trigger {
            Trigger::Value => true,
            Trigger::Dependency(dependency) => validator.is_dependency(dependency),
            Trigger::Wake(_) => false,
        })
    }

    fn read_value(&self) -> Option<T> {
        Some(self.source.upgrade()?.read_value())
    }

    pub fn begin_quiescence(&self) {
        {
            let mut s = self.state.borrow_mut();
            if s.is_quiescent {
                panic!("`ValidationHelper` is already quiescent.");
            }
            s.is_quiescent = true;
            s.is_touched = false;
        }
        self.diagnostics.begin_quiescence();
    }

    pub fn end_quiescence(&self) {
        {
            let mut s = self.state.borrow_mut();
            if !s.is_quiescent {
                panic!("`ValidationHelper` is not quiescent.");
            }
            s.is_quiescent = false;
            if s.running == 0 && take(&mut s.is_touched) {
                let state = self.aggregate();
                let user_modified = s.user_modified;
                s.current.settle(state, user_modified);
                if state == ValidationState::Valid {
                    self.deferred.apply();
                }
            }
        }
        self.diagnostics.end_quiescence();
        self.fire(ALL_FLAGS);
        self.deferred.flush();
    }

    fn aggregate(&self) -> ValidationState {
        ValidationState::from_outcomes(self.validators.iter().map(|v| v.last_valid()))
    }

    pub(crate) fn on_started(&self, index: usize) {
        self.diagnostics.clear_diagnostic(index);
        self.report(index, ValidatorState::Started, false);
    }

    pub(crate) fn on_completed(
        &self,
        index: usize,
        value: T,
        result: ValidationResult<D>,
        intermediate: bool,
    ) {
        let valid = result.is_valid();
        match result.into_diagnostic() {
            Some(diagnostic) => self.diagnostics.set_diagnostic(index, diagnostic, valid),
            None => self.diagnostics.clear_diagnostic(index),
        }
        if valid {
            self.deferred.store(value);
            self.report(index, ValidatorState::Succeeded, intermediate);
        } else {
            self.report(index, ValidatorState::Failed, intermediate);
        }
    }

    pub(crate) fn on_cancelled(&self, index: usize, intermediate: bool) {
        self.report(index, ValidatorState::Cancelled, intermediate);
    }

    fn report(&self, index: usize, state: ValidatorState, intermediate: bool) {
        let (flags, is_quiescent) = {
            let mut s = self.state.borrow_mut();
            s.is_touched = true;
            let flags = match state {
                ValidatorState::Started => {
                    s.running += 1;
                    if s.running == 1 {
                        s.current = Flags {
                            validating: true,
                            ..Flags::default()
                        };
                    }
                    Some(ALL_FLAGS)
                }
                ValidatorState::Succeeded => {
                    if s.finish_run() == 0 {
                        let aggregate = self.aggregate();
                        if !intermediate {
                            let user_modified = s.user_modified;
                            s.current.settle(aggregate, user_modified);
                        }
                        if aggregate == ValidationState::Valid {
                            self.deferred.apply();
                        }
                        Some(ALL_FLAGS)
                    } else {
                        None
                    }
                }
                ValidatorState::Failed => {
                    let running = s.finish_run();
                    let user_modified = s.user_modified;
                    s.current = Flags {
                        valid: false,
                        invalid: true,
                        user_valid: false,
                        user_invalid: user_modified,
                        validating: running > 0,
                    };
                    (!intermediate).then_some(ALL_FLAGS)
                }
                ValidatorState::Cancelled => {
                    if s.finish_run() == 0 {
                        s.current.validating = false;
                        (!intermediate).then_some(VALIDATING_FLAG)
                    } else {
                        None
                    }
                }
            };
            (flags, s.is_quiescent)
        };
        let event = ValidatorEvent {
            index,
            state,
            intermediate,
        };
        for listener in self.event_listeners.snapshot() {
            listener(event);
        }
        if let Some(flags) = flags {
            if !is_quiescent {
                self.fire(flags);
                self.deferred.flush();
            }
        }
    }

    fn fire(&self, flags: &[Flag]) {
        let edges: Vec<(Flag, bool, bool)> = {
            let mut s = self.state.borrow_mut();
            let mut edges = Vec::new();
            for &flag in flags {
                let old = s.last.get(flag);
                let new = s.current.get(flag);
                if old != new {
                    s.last.set(flag, new);
                    edges.push((flag, old, new));
                }
            }
            edges
        };
        if edges.is_empty() {
            return;
        }
        let value = if self.listeners.is_empty() {
            None
        } else {
            self.read_value()
        };
        for (flag, old, new) in edges {
            if let (Some(kind), Some(value)) = (flag.change_kind(), &value) {
                for listener in self.listeners.snapshot() {
                    listener(value, kind, old, new);
                }
            }
            for listener in self.flag_listeners.snapshot() {
                listener(flag, new);
            }
        }
    }

    fn listeners(&self) -> &Listeners<dyn Fn(&T, ChangeKind, bool, bool)> {
        &self.listeners
    }
    fn flag_listeners(&self) -> &Listeners<dyn Fn(Flag, bool)> {
        &self.flag_listeners
    }
    fn event_listeners(&self) -> &Listeners<dyn Fn(ValidatorEvent)> {
        &self.event_listeners
    }

    /// Calls `f` with `(value, kind, old, new)` for each edge of `valid`, `invalid` or `validating`.
    pub fn subscribe(
        self: &Rc<Self>,
        f: impl Fn(&T, ChangeKind, bool, bool) + 'static,
    ) -> Subscription {
        self.listeners
            .subscribe(Rc::downgrade(self), Self::listeners, Rc::new(f))
    }

    pub fn subscribe_flag(self: &Rc<Self>, flag: Flag, f: impl Fn(bool) + 'static) -> Subscription {
        self.flag_listeners.subscribe(
            Rc::downgrade(self),
            Self::flag_listeners,
            Rc::new(move |changed: Flag, value: bool| {
                if changed == flag {
                    f(value)
                }
            }),
        )
    }

    pub fn subscribe_validator_events(
        self: &Rc<Self>,
        f: impl Fn(ValidatorEvent) + 'static,
    ) -> Subscription {
        self.event_listeners
            .subscribe(Rc::downgrade(self), Self::event_listeners, Rc::new(f))
    }
}

impl<T: Clone + 'static, D: Clone + 'static> DependencySink for ValidationHelper<T, D> {
    fn invalidated(self: Rc<Self>, _slot: Slot, dependency: &Dependency) {
        self.invalidate(Trigger::Dependency(dependency.clone()));
    }
}

impl<T: Clone + 'static, D: Clone + 'static> WakeSink for ValidationHelper<T, D> {
    fn on_wake(self: Rc<Self>, key: RunKey) {
        self.invalidate(Trigger::Wake(key));
    }
}

/// Ends the quiescence bracket it opened, also when a listener unwinds.
struct QuiescenceGuard<'a, T: Clone + 'static, D: Clone + 'static>(&'a ValidationHelper<T, D>);

impl<'a, T: Clone + 'static, D: Clone + 'static> QuiescenceGuard<'a, T, D> {
    fn begin(helper: &'a ValidationHelper<T, D>) -> Self {
        helper.begin_quiescence();
        Self(helper)
    }
}
impl<T: Clone + 'static, D: Clone + 'static> Drop for QuiescenceGuard<'_, T, D> {
    fn drop(&mut self) {
        self.0.end_quiescence();
    }
}

struct DispatchGuard<'a>(&'a Cell<bool>);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}
