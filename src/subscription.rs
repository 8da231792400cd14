use std::{
    mem::take,
    rc::{Rc, Weak},
};


/// A registration that is removed when dropped.
///
/// Every listener and dependency registration in this crate returns a `Subscription`.
/// The registering side owns it, so a source never keeps its observers alive.
#[derive(Default)]
#[must_use]
pub struct Subscription(RawSubscription);

impl Subscription {
    pub fn empty() -> Self {
        Subscription(RawSubscription::Empty)
    }
    pub fn from_fn(f: impl FnOnce() + 'static) -> Self {
        Subscription(RawSubscription::Fn(Box::new(f)))
    }

    /// Calls `unsubscribe` on drop if `this` is still alive.
    pub fn from_weak_fn<T: 'static>(this: Weak<T>, unsubscribe: impl FnOnce(Rc<T>) + 'static) -> Self {
        Self::from_fn(move || {
            if let Some(this) = this.upgrade() {
                unsubscribe(this)
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.0, RawSubscription::Empty)
    }
}
impl Drop for Subscription {
    fn drop(&mut self) {
        match take(&mut self.0) {
            RawSubscription::Empty => {}
            RawSubscription::Fn(f) => f(),
        }
    }
}
impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            RawSubscription::Empty => write!(f, "Subscription(<empty>)"),
            _ => write!(f, "Subscription"),
        }
    }
}

#[derive(Default)]
enum RawSubscription {
    #[default]
    Empty,
    Fn(Box<dyn FnOnce() + 'static>),
}
