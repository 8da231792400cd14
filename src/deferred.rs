use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{utils::Listeners, Subscription};

/// The most recent value that satisfied every constraint.
///
/// A successful run stores its value as the candidate.
/// The candidate replaces the committed value only when the whole constraint set is valid.
pub(crate) struct DeferredValue<T: 'static> {
    value: RefCell<T>,
    candidate: RefCell<Option<T>>,
    is_dirty: Cell<bool>,
    listeners: Listeners<dyn Fn(&T)>,
}

impl<T: Clone + 'static> DeferredValue<T> {
    pub fn new(value: T) -> Rc<Self> {
        Rc::new(Self {
            value: RefCell::new(value),
            candidate: RefCell::new(None),
            is_dirty: Cell::new(false),
            listeners: Listeners::new(),
        })
    }
    fn listeners(&self) -> &Listeners<dyn Fn(&T)> {
        &self.listeners
    }

    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    pub fn store(&self, candidate: T) {
        *self.candidate.borrow_mut() = Some(candidate);
    }

    /// Commits the stored candidate. Returns `false` if there was none.
    pub fn apply(&self) -> bool {
        let Some(candidate) = self.candidate.borrow_mut().take() else {
            return false;
        };
        *self.value.borrow_mut() = candidate;
        self.is_dirty.set(true);
        true
    }

    /// Notifies the listeners once if a commit happened since the last flush.
    pub fn flush(&self) {
        if !self.is_dirty.replace(false) {
            return;
        }
        let value = self.get();
        for listener in self.listeners.snapshot() {
            listener(&value);
        }
    }

    pub fn subscribe(self: &Rc<Self>, f: impl Fn(&T) + 'static) -> Subscription {
        self.listeners
            .subscribe(Rc::downgrade(self), Self::listeners, Rc::new(f))
    }
}
