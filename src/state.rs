use std::{
    cell::{Ref, RefCell},
    hash::{Hash, Hasher},
    rc::{Rc, Weak},
};

use derive_ex::derive_ex;
use serde::{Deserialize, Serialize};
use slabmap::SlabMap;

use crate::Subscription;

#[cfg(test)]
mod tests;

/// Distinguishes the registrations of one [`DependencySink`] from each other.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Slot(pub usize);

/// Something that can be listed as a dependency of a constraint.
pub trait DependencyNode: 'static {
    fn subscribe(self: Rc<Self>, sink: Weak<dyn DependencySink>, slot: Slot) -> Subscription;
}

/// Receives a notification each time a subscribed dependency is invalidated.
pub trait DependencySink: 'static {
    fn invalidated(self: Rc<Self>, slot: Slot, dependency: &Dependency);
}

/// Type-erased handle to a dependency.
///
/// Two handles are equal when they refer to the same node.
#[derive(Clone)]
pub struct Dependency(Rc<dyn DependencyNode>);

impl Dependency {
    pub fn from_node(node: Rc<dyn DependencyNode>) -> Self {
        Self(node)
    }
    pub fn subscribe(&self, sink: Weak<dyn DependencySink>, slot: Slot) -> Subscription {
        self.0.clone().subscribe(sink, slot)
    }
    fn addr(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }
}
impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}
impl Eq for Dependency {}
impl Hash for Dependency {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state)
    }
}
impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dependency({:p})", self.addr())
    }
}

pub trait ToDependency {
    fn to_dependency(&self) -> Dependency;
}
impl ToDependency for Dependency {
    fn to_dependency(&self) -> Dependency {
        self.clone()
    }
}

/// Sinks subscribed to one dependency node.
pub(crate) struct DependencySinks(RefCell<SlabMap<(Weak<dyn DependencySink>, Slot)>>);

impl DependencySinks {
    pub fn new() -> Self {
        Self(RefCell::new(SlabMap::new()))
    }

    pub fn subscribe<N: 'static>(
        &self,
        this: Weak<N>,
        table: fn(&N) -> &Self,
        sink: Weak<dyn DependencySink>,
        slot: Slot,
    ) -> Subscription {
        let key = self.0.borrow_mut().insert((sink, slot));
        Subscription::from_weak_fn(this, move |this| {
            table(&this).0.borrow_mut().remove(key);
        })
    }

    /// Notifies every live sink. Sinks may subscribe or unsubscribe while being notified.
    pub fn notify(&self, dependency: &Dependency) {
        let sinks: Vec<_> = {
            let mut sinks = self.0.borrow_mut();
            sinks.optimize();
            sinks
                .values()
                .filter_map(|(sink, slot)| Some((sink.upgrade()?, *slot)))
                .collect()
        };
        for (sink, slot) in sinks {
            sink.invalidated(slot, dependency);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }
}

/// Similar to `Rc<RefCell<T>>`, but notifies the constraints that depend on it when it changes.
#[derive_ex(Clone, bound())]
pub struct State<T: 'static>(Rc<StateNode<T>>);

impl<T: 'static> State<T> {
    /// Create a new `State` with the given initial value.
    pub fn new(value: T) -> Self {
        Self(Rc::new(StateNode {
            sinks: DependencySinks::new(),
            value: RefCell::new(value),
        }))
    }

    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.value.borrow()
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.borrow().clone()
    }

    /// Sets the value of the state and notifies the dependents.
    pub fn set(&self, value: T) {
        *self.0.value.borrow_mut() = value;
        self.notify();
    }

    /// Sets the value of the state and notifies the dependents only if the current value is different from `value`.
    pub fn set_dedup(&self, value: T)
    where
        T: PartialEq,
    {
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
            self.notify();
        }
    }

    /// Notifies the dependents without changing the value.
    pub fn notify(&self) {
        self.0.sinks.notify(&self.to_dependency());
    }

    pub fn to_dependency(&self) -> Dependency {
        Dependency::from_node(self.0.clone())
    }

    pub(crate) fn subscribe(&self, sink: Weak<dyn DependencySink>, slot: Slot) -> Subscription {
        self.0.clone().subscribe(sink, slot)
    }
}
impl<T: std::fmt::Debug> std::fmt::Debug for State<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.value.try_borrow() {
            Ok(value) => std::fmt::Debug::fmt(&*value, f),
            Err(_) => write!(f, "<borrowed>"),
        }
    }
}
impl<T: Default> Default for State<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
impl<T> Serialize for State<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        match self.0.value.try_borrow() {
            Ok(value) => T::serialize(&*value, serializer),
            Err(_) => Err(serde::ser::Error::custom("borrowed")),
        }
    }
}
impl<'de, T> Deserialize<'de> for State<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<State<T>, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        T::deserialize(deserializer).map(|value| State::new(value))
    }
}
impl<T> ToDependency for State<T> {
    fn to_dependency(&self) -> Dependency {
        self.to_dependency()
    }
}

struct StateNode<T: 'static> {
    sinks: DependencySinks,
    value: RefCell<T>,
}
impl<T: 'static> StateNode<T> {
    fn sinks(&self) -> &DependencySinks {
        &self.sinks
    }
}

impl<T: 'static> DependencyNode for StateNode<T> {
    fn subscribe(self: Rc<Self>, sink: Weak<dyn DependencySink>, slot: Slot) -> Subscription {
        self.sinks
            .subscribe(Rc::downgrade(&self), Self::sinks, sink, slot)
    }
}
