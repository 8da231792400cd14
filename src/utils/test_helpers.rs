use std::{any::Any, cell::RefCell, collections::VecDeque, rc::Rc};

use assert_call::call;
use futures::channel::oneshot;

use crate::{Constraint, ValidationOutcome, ValidationResult};

pub fn call_on_drop(s: impl Into<String>) -> impl Any {
    struct OnDrop(String);
    impl Drop for OnDrop {
        fn drop(&mut self) {
            call!("{}", self.0);
        }
    }
    OnDrop(s.into())
}

/// Results of the runs started by a [`pending_constraint`], completed by the test.
pub struct Completer<D>(Rc<RefCell<VecDeque<oneshot::Sender<ValidationResult<D>>>>>);

impl<D> Completer<D> {
    /// Completes the oldest outstanding run. Returns `false` if the run was already dropped.
    pub fn complete_first(&self, result: ValidationResult<D>) -> bool {
        let sender = self.0.borrow_mut().pop_front().expect("no run");
        sender.send(result).is_ok()
    }
    pub fn complete_last(&self, result: ValidationResult<D>) -> bool {
        let sender = self.0.borrow_mut().pop_back().expect("no run");
        sender.send(result).is_ok()
    }
    /// Number of runs started and not yet completed by the test, including dropped ones.
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }
}

/// A constraint whose runs stay pending until the [`Completer`] completes them.
///
/// Dropping a run's sender without completing it cancels the run.
pub fn pending_constraint<T: 'static, D: 'static>() -> (Constraint<T, D>, Completer<D>) {
    let senders = Rc::new(RefCell::new(VecDeque::new()));
    let s = senders.clone();
    let c = Constraint::from_outcome(move |_: &T, _| {
        let (tx, rx) = oneshot::channel();
        s.borrow_mut().push_back(tx);
        async move { ValidationOutcome::from(rx.await.ok()) }
    });
    (c, Completer(senders))
}
