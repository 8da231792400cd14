use std::collections::HashSet;

use assert_call::{call, CallRecorder};

use super::*;

struct Sink;

impl DependencySink for Sink {
    fn invalidated(self: Rc<Self>, slot: Slot, _dependency: &Dependency) {
        call!("invalidated {}", slot.0);
    }
}

fn sink() -> (Rc<Sink>, Weak<dyn DependencySink>) {
    let sink = Rc::new(Sink);
    let weak: Weak<dyn DependencySink> = Rc::downgrade(&sink) as Weak<dyn DependencySink>;
    (sink, weak)
}

#[test]
fn new_and_set() {
    let s = State::new(10);
    assert_eq!(s.get(), 10);
    s.set(20);
    assert_eq!(*s.borrow(), 20);
}

#[test]
fn set_notifies_dependents() {
    let mut cr = CallRecorder::new();
    let s = State::new(1);
    let (_sink, weak) = sink();
    let _sub = s.subscribe(weak, Slot(4));

    s.set(1);
    cr.verify("invalidated 4");
    s.notify();
    cr.verify("invalidated 4");
}

#[test]
fn set_dedup_notifies_only_on_change() {
    let mut cr = CallRecorder::new();
    let s = State::new(1);
    let (_sink, weak) = sink();
    let _sub = s.subscribe(weak, Slot(0));

    s.set_dedup(1);
    cr.verify(());
    s.set_dedup(2);
    cr.verify("invalidated 0");
}

#[test]
fn dropping_subscription_unsubscribes() {
    let mut cr = CallRecorder::new();
    let s = State::new(1);
    let (_sink, weak) = sink();
    let sub = s.subscribe(weak, Slot(0));
    assert_eq!(s.0.sinks.len(), 1);

    drop(sub);
    assert_eq!(s.0.sinks.len(), 0);
    s.set(2);
    cr.verify(());
}

#[test]
fn dropped_sink_is_skipped() {
    let mut cr = CallRecorder::new();
    let s = State::new(1);
    let (sink, weak) = sink();
    let _sub = s.subscribe(weak, Slot(0));
    drop(sink);
    s.set(2);
    cr.verify(());
}

#[test]
fn dependency_identity() {
    let a = State::new(0);
    let b = State::new(0);
    assert_eq!(a.to_dependency(), a.clone().to_dependency());
    assert_ne!(a.to_dependency(), b.to_dependency());

    let set: HashSet<Dependency> = [a.to_dependency(), a.to_dependency(), b.to_dependency()]
        .into_iter()
        .collect();
    assert_eq!(set.len(), 2);
}

#[test]
fn debug_and_default() {
    let s: State<i32> = State::default();
    assert_eq!(format!("{s:?}"), "0");
}

#[test]
fn serde() {
    let s = State::new(vec![1, 2]);
    assert_eq!(serde_json::to_string(&s).unwrap(), "[1,2]");
    let s: State<Vec<i32>> = serde_json::from_str("[3]").unwrap();
    assert_eq!(s.get(), vec![3]);
}
