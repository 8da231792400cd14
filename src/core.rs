use std::{
    cell::RefCell,
    future::poll_fn,
    mem::{replace, swap, take},
    rc::{Rc, Weak},
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Wake, Waker},
    thread::AccessError,
};

use derive_ex::derive_ex;
use slabmap::SlabMap;

#[cfg(test)]
mod tests;

thread_local! {
    static GLOBALS: RefCell<Globals> = RefCell::new(Globals::new());
}

struct Globals {
    is_runtime_exists: bool,
    polls: Vec<PollTask>,
    need_wake: bool,
    wakes: WakeTable,
}
impl Globals {
    fn new() -> Self {
        Self {
            is_runtime_exists: false,
            polls: Vec::new(),
            need_wake: false,
            wakes: WakeTable::default(),
        }
    }
    fn with<T>(f: impl FnOnce(&mut Self) -> T) -> T {
        GLOBALS.with(|g| f(&mut g.borrow_mut()))
    }
    fn try_with<T>(f: impl FnOnce(&mut Self) -> T) -> Result<T, AccessError> {
        GLOBALS.try_with(|g| f(&mut g.borrow_mut()))
    }
    fn get_polls(polls: &mut Vec<PollTask>) -> bool {
        Self::with(|g| {
            g.apply_wake();
            swap(polls, &mut g.polls);
        });
        !polls.is_empty()
    }
    fn apply_wake(&mut self) {
        let mut requests = self.wakes.requests.0.lock().unwrap();
        let RawWakeRequests { wakes, drops, .. } = &mut *requests;
        if self.is_runtime_exists {
            for key in wakes.drain(..) {
                if let Some(task) = self.wakes.tasks.get(key) {
                    self.polls.push(task.clone());
                }
            }
        } else {
            // Kept for the next `Runtime`, at most once per live task.
            wakes.retain(|key| !drops.contains(key));
            wakes.sort_unstable();
            wakes.dedup();
        }
        for key in drops.drain(..) {
            self.wakes.tasks.remove(key);
        }
    }
    fn wait_for_ready(&mut self, cx: &Context) -> Poll<()> {
        self.need_wake = false;
        if !self.polls.is_empty() {
            return Poll::Ready(());
        }
        let mut requests = self.wakes.requests.0.lock().unwrap();
        if !requests.drops.is_empty() || !requests.wakes.is_empty() {
            return Poll::Ready(());
        }
        requests.waker = Some(cx.waker().clone());
        self.need_wake = true;
        Poll::Pending
    }
    fn finish_runtime(&mut self) {
        self.is_runtime_exists = false;
    }
}

/// Delivers the completions of asynchronous validation runs onto the current thread.
///
/// Validation runs whose future is ready on the first poll complete synchronously and never need a `Runtime`.
/// A run that returns `Pending` is resumed only when its waker fires and [`update`](Self::update) is called
/// on the thread that owns the constrained value.
#[derive_ex(Default)]
#[default(Self::new())]
pub struct Runtime {
    polls_buffer: Vec<PollTask>,
}
impl Runtime {
    pub fn new() -> Self {
        if Globals::with(|g| replace(&mut g.is_runtime_exists, true)) {
            panic!("Only one `Runtime` can exist in the same thread at the same time.");
        };
        Self {
            polls_buffer: Vec::new(),
        }
    }

    /// Poll every validation run that was woken since the last call.
    ///
    /// Returns `true` if any run was polled.
    pub fn run_wakes(&mut self) -> bool {
        let mut handled = false;
        let mut polls = take(&mut self.polls_buffer);
        while Globals::get_polls(&mut polls) {
            for task in polls.drain(..) {
                task.call();
                handled = true;
            }
        }
        self.polls_buffer = polls;
        handled
    }

    /// Repeat [`run_wakes`](Self::run_wakes) until there is nothing left to poll.
    pub fn update(&mut self) {
        while self.run_wakes() {}
    }

    /// Wait while there is no process to be executed by [`update`](Self::update).
    pub async fn wait_for_ready(&mut self) {
        poll_fn(|cx| Globals::with(|g| g.wait_for_ready(cx))).await
    }
}
impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = Globals::try_with(|g| g.finish_runtime());
    }
}

pub(crate) fn is_runtime_exists() -> bool {
    Globals::try_with(|g| g.is_runtime_exists).unwrap_or(false)
}

/// Identifies one validation run: the constraint index and the run number within that constraint.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) struct RunKey {
    pub index: usize,
    pub run: u64,
}

pub(crate) trait WakeSink: 'static {
    fn on_wake(self: Rc<Self>, key: RunKey);
}

#[derive(Clone)]
struct PollTask {
    sink: Weak<dyn WakeSink>,
    key: RunKey,
}
impl PollTask {
    fn call(self) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_wake(self.key)
        }
    }
}

/// Creates a waker that delivers `key` to `sink` on the next [`Runtime::update`].
///
/// Pending wake and drop requests are applied first so that the task table does not grow
/// on threads where every run completes synchronously.
pub(crate) fn waker_from_sink(sink: Weak<dyn WakeSink>, key: RunKey) -> Waker {
    Globals::with(|g| {
        g.apply_wake();
        g.wakes.insert(PollTask { sink, key })
    })
    .into()
}

#[derive(Default)]
struct WakeTable {
    tasks: SlabMap<PollTask>,
    requests: WakeRequests,
}

impl WakeTable {
    fn insert(&mut self, task: PollTask) -> Arc<RawWake> {
        RawWake::new(&self.requests, self.tasks.insert(task))
    }
}

#[derive(Clone, Default)]
struct WakeRequests(Arc<Mutex<RawWakeRequests>>);

#[derive(Default)]
struct RawWakeRequests {
    wakes: Vec<usize>,
    drops: Vec<usize>,
    waker: Option<Waker>,
}
impl RawWakeRequests {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

struct RawWake {
    requests: WakeRequests,
    key: usize,
}
impl RawWake {
    fn new(requests: &WakeRequests, key: usize) -> Arc<Self> {
        Arc::new(RawWake {
            requests: requests.clone(),
            key,
        })
    }
    fn requests(&self) -> MutexGuard<'_, RawWakeRequests> {
        self.requests.0.lock().unwrap()
    }
}

impl Wake for RawWake {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }
    fn wake_by_ref(self: &Arc<Self>) {
        let mut requests = self.requests();
        requests.wakes.push(self.key);
        requests.wake();
    }
}
impl Drop for RawWake {
    fn drop(&mut self) {
        self.requests().drops.push(self.key);
    }
}
