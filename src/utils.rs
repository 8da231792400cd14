use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use slabmap::SlabMap;

use crate::Subscription;

#[cfg(test)]
pub mod test_helpers;

/// Callbacks registered on a node, keyed so that a [`Subscription`] can remove them.
pub(crate) struct Listeners<F: ?Sized + 'static>(RefCell<SlabMap<Rc<F>>>);

impl<F: ?Sized + 'static> Listeners<F> {
    pub fn new() -> Self {
        Self(RefCell::new(SlabMap::new()))
    }

    /// Registers `f` and returns a `Subscription` that removes it from the table reached through `this`.
    pub fn subscribe<N: 'static>(
        &self,
        this: Weak<N>,
        table: fn(&N) -> &Self,
        f: Rc<F>,
    ) -> Subscription {
        let key = self.0.borrow_mut().insert(f);
        Subscription::from_weak_fn(this, move |this| {
            table(&this).0.borrow_mut().remove(key);
        })
    }

    /// Clones the registered callbacks so they can run without holding the table borrowed.
    pub fn snapshot(&self) -> Vec<Rc<F>> {
        let mut listeners = self.0.borrow_mut();
        listeners.optimize();
        listeners.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}
impl<F: ?Sized + 'static> Default for Listeners<F> {
    fn default() -> Self {
        Self::new()
    }
}
