use std::{
    future::Future,
    task::{Context, Poll},
    thread,
};

use assert_call::{call, CallRecorder};
use futures::channel::oneshot;

use super::*;

struct Sink;

impl WakeSink for Sink {
    fn on_wake(self: Rc<Self>, key: RunKey) {
        call!("wake {}:{}", key.index, key.run);
    }
}

fn sink() -> (Rc<Sink>, Weak<dyn WakeSink>) {
    let sink = Rc::new(Sink);
    let weak: Weak<dyn WakeSink> = Rc::downgrade(&sink) as Weak<dyn WakeSink>;
    (sink, weak)
}

#[test]
#[should_panic]
fn second_runtime_panics() {
    let _rt0 = Runtime::new();
    let _rt1 = Runtime::new();
}

#[test]
fn runtime_can_be_recreated() {
    {
        let _rt = Runtime::new();
        assert!(is_runtime_exists());
    }
    assert!(!is_runtime_exists());
    let _rt = Runtime::new();
}

#[test]
fn wake_is_delivered_on_update() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let (_sink, weak) = sink();
    let waker = waker_from_sink(weak, RunKey { index: 1, run: 2 });

    waker.wake_by_ref();
    cr.verify(());
    rt.update();
    cr.verify("wake 1:2");
    rt.update();
    cr.verify(());
}

#[test]
fn wake_after_sink_dropped_is_ignored() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let (sink, weak) = sink();
    let waker = waker_from_sink(weak, RunKey { index: 0, run: 0 });
    drop(sink);
    waker.wake();
    assert!(rt.run_wakes());
    cr.verify(());
}

#[test]
fn wake_from_other_thread() {
    let mut rt = Runtime::new();
    let mut cr = CallRecorder::new();
    let (_sink, weak) = sink();
    let waker = waker_from_sink(weak, RunKey { index: 3, run: 4 });
    thread::spawn(move || waker.wake()).join().unwrap();
    rt.update();
    cr.verify("wake 3:4");
}

#[test]
fn run_wakes_without_wake_returns_false() {
    let mut rt = Runtime::new();
    assert!(!rt.run_wakes());
}

#[test]
fn wait_for_ready_resolves_after_wake() {
    let mut rt = Runtime::new();
    let (_sink, weak) = sink();
    let waker = waker_from_sink(weak, RunKey { index: 0, run: 0 });

    let (tx, rx) = oneshot::channel::<()>();
    let handle = thread::spawn(move || {
        futures::executor::block_on(rx).unwrap();
        waker.wake();
    });

    let mut fut = Box::pin(rt.wait_for_ready());
    let noop = futures::task::noop_waker();
    let mut cx = Context::from_waker(&noop);
    assert!(fut.as_mut().poll(&mut cx).is_pending());
    tx.send(()).unwrap();
    handle.join().unwrap();
    assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(()));
}

#[test]
fn wakes_without_runtime_are_kept_once_per_task() {
    let mut cr = CallRecorder::new();
    let (_sink, weak) = sink();
    let waker = waker_from_sink(weak.clone(), RunKey { index: 0, run: 0 });
    for _ in 0..3 {
        waker.wake_by_ref();
    }
    let _other = waker_from_sink(weak, RunKey { index: 0, run: 1 });
    assert_eq!(Globals::with(|g| g.polls.len()), 0);
    assert_eq!(
        Globals::with(|g| g.wakes.requests.0.lock().unwrap().wakes.len()),
        1
    );

    let mut rt = Runtime::new();
    rt.update();
    cr.verify("wake 0:0");
}

#[test]
fn dropped_waker_without_runtime_is_forgotten() {
    let mut cr = CallRecorder::new();
    let (_sink, weak) = sink();
    let waker = waker_from_sink(weak.clone(), RunKey { index: 0, run: 0 });
    waker.wake();
    let _other = waker_from_sink(weak, RunKey { index: 0, run: 1 });
    assert_eq!(
        Globals::with(|g| g.wakes.requests.0.lock().unwrap().wakes.len()),
        0
    );

    let mut rt = Runtime::new();
    assert!(!rt.run_wakes());
    cr.verify(());
}
