//! The bounded work dispatcher and its underlying alarm timer.
//!
//! A [`Timer`] runs a pool of worker threads over a single ordered alarm
//! queue. Alarms are closures with an optional deadline; zero-delay alarms
//! service in insertion order. *Limitable* alarms respect a maximum
//! in-flight bound (blocking producers when full); locally-originated work
//! is added non-limitable and bypasses the bound to avoid deadlock.
//!
//! Callbacks run holding the timer's reentrancy lock, so application
//! callbacks are serialized until one of them explicitly calls
//! [`Timer::enable_concurrent_callbacks`], which releases the lock for the
//! remainder of that invocation. Reentrancy is tracked per thread:
//! [`is_reentrant_call`] reports true inside a callback and false anywhere
//! else.
//!
//! A [`Dispatcher`] wraps a timer with the pending-work sentinel: three
//! deferred-work categories armed by flag, serviced in a fixed order with
//! registration callbacks last.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use meshbus_core::status::Status;
use tracing::{debug, warn};

/// Default number of concurrent dispatcher workers.
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Default bound on limitable alarms (queued plus in flight).
pub const DEFAULT_MAX_ALARMS: usize = 250;

/// Why an alarm's closure is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmReason {
    /// The alarm came due normally.
    Triggered,
    /// The timer is exiting; remaining alarms are flushed with this reason.
    Exiting,
}

/// Identifier of a queued alarm, usable with [`Timer::remove_alarm`].
pub type AlarmId = u64;

type AlarmWork = Box<dyn FnOnce(AlarmReason) + Send>;

struct AlarmRecord {
    limitable: bool,
    work: AlarmWork,
}

struct TimerState {
    queue: BTreeMap<(Instant, AlarmId), AlarmRecord>,
    /// Limitable alarms queued or executing.
    limitable_count: usize,
    running: bool,
}

struct ReentrancyGate {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl ReentrancyGate {
    fn acquire(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        while owner.is_some() && *owner != Some(me) {
            owner = self.released.wait(owner).unwrap();
        }
        *owner = Some(me);
        REENTRANT.with(|held| held.set(true));
    }

    fn release_if_held(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap();
        if *owner == Some(me) {
            *owner = None;
            REENTRANT.with(|held| held.set(false));
            self.released.notify_one();
        }
    }
}

thread_local! {
    /// True while the current thread holds a timer's reentrancy lock.
    static REENTRANT: Cell<bool> = const { Cell::new(false) };
    /// Timer instance the current thread is servicing a callback for.
    static SERVICING: Cell<Option<u64>> = const { Cell::new(None) };
}

/// True inside a dispatcher callback that has not enabled concurrent
/// callbacks; false everywhere else.
#[must_use]
pub fn is_reentrant_call() -> bool {
    REENTRANT.with(Cell::get)
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct TimerShared {
    id: u64,
    name: String,
    concurrency: usize,
    max_alarms: usize,
    next_alarm: AtomicU64,
    state: Mutex<TimerState>,
    work_available: Condvar,
    space_available: Condvar,
    gate: ReentrancyGate,
}

/// Worker-pool alarm timer with a single ordered queue.
pub struct Timer {
    shared: Arc<TimerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Timer {
    /// Creates a stopped timer.
    #[must_use]
    pub fn new(name: &str, concurrency: usize, max_alarms: usize) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
                name: name.to_string(),
                concurrency: concurrency.max(1),
                max_alarms: max_alarms.max(1),
                next_alarm: AtomicU64::new(1),
                state: Mutex::new(TimerState {
                    queue: BTreeMap::new(),
                    limitable_count: 0,
                    running: false,
                }),
                work_available: Condvar::new(),
                space_available: Condvar::new(),
                gate: ReentrancyGate {
                    owner: Mutex::new(None),
                    released: Condvar::new(),
                },
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Starts the worker pool. Idempotent while running.
    pub fn start(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.running {
            return;
        }
        state.running = true;
        drop(state);

        let mut workers = self.workers.lock().unwrap();
        for n in 0..self.shared.concurrency {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{n}", shared.name))
                .spawn(move || worker_loop(&shared))
                .expect("spawn timer worker");
            workers.push(handle);
        }
    }

    /// Stops the timer: new adds fail and workers flush remaining alarms
    /// with [`AlarmReason::Exiting`].
    pub fn stop(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.running = false;
        drop(state);
        self.shared.work_available.notify_all();
        self.shared.space_available.notify_all();
    }

    /// Waits for the worker pool to drain and exit.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Adds an alarm, blocking while the limitable bound is reached.
    ///
    /// # Errors
    ///
    /// [`Status::TimerExiting`] when the timer is not running.
    pub fn add_alarm(
        &self,
        delay: Duration,
        limitable: bool,
        work: impl FnOnce(AlarmReason) + Send + 'static,
    ) -> Result<AlarmId, Status> {
        let mut state = self.shared.state.lock().unwrap();
        while state.running && limitable && state.limitable_count >= self.shared.max_alarms {
            state = self.shared.space_available.wait(state).unwrap();
        }
        self.insert_alarm(state, delay, limitable, Box::new(work))
    }

    /// Adds an alarm without blocking.
    ///
    /// # Errors
    ///
    /// [`Status::TimerExiting`] when stopped; [`Status::Fail`] when the
    /// limitable bound is reached.
    pub fn add_alarm_nonblocking(
        &self,
        delay: Duration,
        limitable: bool,
        work: impl FnOnce(AlarmReason) + Send + 'static,
    ) -> Result<AlarmId, Status> {
        let state = self.shared.state.lock().unwrap();
        if limitable && state.limitable_count >= self.shared.max_alarms {
            return Err(Status::Fail);
        }
        self.insert_alarm(state, delay, limitable, Box::new(work))
    }

    fn insert_alarm(
        &self,
        mut state: std::sync::MutexGuard<'_, TimerState>,
        delay: Duration,
        limitable: bool,
        work: AlarmWork,
    ) -> Result<AlarmId, Status> {
        if !state.running {
            return Err(Status::TimerExiting);
        }
        let id = self.shared.next_alarm.fetch_add(1, Ordering::Relaxed);
        let due = Instant::now() + delay;
        state.queue.insert((due, id), AlarmRecord { limitable, work });
        if limitable {
            state.limitable_count += 1;
        }
        drop(state);
        self.shared.work_available.notify_one();
        Ok(id)
    }

    /// Cancels a queued alarm. Returns false if it already fired or was
    /// removed; an executing alarm is not waited for.
    pub fn remove_alarm(&self, id: AlarmId) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let key = state.queue.keys().find(|(_, aid)| *aid == id).copied();
        match key {
            Some(key) => {
                let record = state.queue.remove(&key).expect("key just found");
                if record.limitable {
                    state.limitable_count -= 1;
                    drop(state);
                    self.shared.space_available.notify_one();
                }
                true
            }
            None => false,
        }
    }

    /// Releases the reentrancy lock for the remainder of the current
    /// callback, letting other workers run callbacks concurrently.
    pub fn enable_concurrent_callbacks(&self) {
        if SERVICING.with(Cell::get) == Some(self.shared.id) {
            self.shared.gate.release_if_held();
        }
    }

    /// True when the current thread is servicing one of this timer's
    /// callbacks.
    #[must_use]
    pub fn is_timer_thread(&self) -> bool {
        SERVICING.with(Cell::get) == Some(self.shared.id)
    }

    /// Number of queued alarms.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }
}

fn worker_loop(shared: &Arc<TimerShared>) {
    loop {
        let mut state = shared.state.lock().unwrap();

        if !state.running {
            // Drain remaining alarms with the exiting reason, one at a time
            // so the pool shares the flush.
            let Some(key) = state.queue.keys().next().copied() else {
                return;
            };
            let record = state.queue.remove(&key).expect("key just found");
            drop(state);
            run_alarm(shared, record, AlarmReason::Exiting);
            continue;
        }

        let now = Instant::now();
        match state.queue.keys().next().copied() {
            None => {
                let _unused = shared.work_available.wait(state).unwrap();
            }
            Some(key) if key.0 <= now => {
                let record = state.queue.remove(&key).expect("key just found");
                drop(state);
                run_alarm(shared, record, AlarmReason::Triggered);
            }
            Some(key) => {
                let wait = key.0.saturating_duration_since(now);
                let _unused = shared.work_available.wait_timeout(state, wait).unwrap();
            }
        }
    }
}

fn run_alarm(shared: &Arc<TimerShared>, record: AlarmRecord, reason: AlarmReason) {
    SERVICING.with(|servicing| servicing.set(Some(shared.id)));
    shared.gate.acquire();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        (record.work)(reason);
    }));
    if result.is_err() {
        warn!(timer = %shared.name, "alarm callback panicked");
    }

    shared.gate.release_if_held();
    SERVICING.with(|servicing| servicing.set(None));

    if record.limitable {
        let mut state = shared.state.lock().unwrap();
        state.limitable_count -= 1;
        drop(state);
        shared.space_available.notify_one();
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Deferred work the dispatcher's pending sentinel drives, in service
/// order: observer work, cached property replies, then registration
/// callbacks.
pub trait DeferredWork: Send + Sync {
    /// Observer-manager work.
    fn perform_observer_work(&self) {}
    /// Cached property-reply deliveries.
    fn perform_cached_property_reply_work(&self) {}
    /// Deferred registration callbacks. Runs last because it enables
    /// concurrent callbacks, which must not influence the other categories.
    fn perform_deferred_callbacks(&self) {}
}

struct PendingFlags {
    observer: bool,
    cached_reply: bool,
    deferred_callbacks: bool,
}

struct DispatcherInner {
    timer: Timer,
    flags: Mutex<PendingFlags>,
    hooks: RwLock<Weak<dyn DeferredWork>>,
}

/// Bounded, ordered work pipeline feeding application callbacks.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Creates a stopped dispatcher.
    #[must_use]
    pub fn new(name: &str, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                timer: Timer::new(name, concurrency, DEFAULT_MAX_ALARMS),
                flags: Mutex::new(PendingFlags {
                    observer: false,
                    cached_reply: false,
                    deferred_callbacks: false,
                }),
                hooks: RwLock::new(Weak::<NoDeferredWork>::new() as Weak<dyn DeferredWork>),
            }),
        }
    }

    /// Attaches the deferred-work hooks.
    pub fn set_hooks(&self, hooks: Weak<dyn DeferredWork>) {
        *self.inner.hooks.write().unwrap() = hooks;
    }

    /// Starts the worker pool.
    pub fn start(&self) {
        self.inner.timer.start();
    }

    /// Stops the pipeline; queued messages flush with the exiting reason.
    pub fn stop(&self) {
        self.inner.timer.stop();
    }

    /// Joins the worker pool.
    pub fn join(&self) {
        self.inner.timer.join();
    }

    /// Enqueues a message-delivery item. `limitable` items respect the
    /// in-flight bound; locally-originated items bypass it.
    ///
    /// # Errors
    ///
    /// [`Status::Stopping`] when the dispatcher refuses new items.
    pub fn dispatch(
        &self,
        limitable: bool,
        work: impl FnOnce(AlarmReason) + Send + 'static,
    ) -> Result<(), Status> {
        self.inner
            .timer
            .add_alarm(Duration::ZERO, limitable, work)
            .map(|_| ())
            .map_err(|_| Status::Stopping)
    }

    /// Arms the observer-work category of the pending sentinel.
    pub fn trigger_observer_work(&self) {
        self.trigger(|flags| {
            if flags.observer {
                return false;
            }
            flags.observer = true;
            true
        });
    }

    /// Arms the cached-property-reply category of the pending sentinel.
    pub fn trigger_cached_property_reply_work(&self) {
        self.trigger(|flags| {
            if flags.cached_reply {
                return false;
            }
            flags.cached_reply = true;
            true
        });
    }

    /// Arms the registration-callback category of the pending sentinel.
    pub fn trigger_deferred_callbacks(&self) {
        self.trigger(|flags| {
            if flags.deferred_callbacks {
                return false;
            }
            flags.deferred_callbacks = true;
            true
        });
    }

    fn trigger(&self, arm: impl FnOnce(&mut PendingFlags) -> bool) {
        {
            let mut flags = self.inner.flags.lock().unwrap();
            if !arm(&mut flags) {
                return;
            }
        }
        // Never block here: this may run inside a triggered alarm, where a
        // blocking add is an instant deadlock; and if the queue is full the
        // work rides along with an existing alarm anyway.
        let inner = Arc::downgrade(&self.inner);
        if self
            .inner
            .timer
            .add_alarm_nonblocking(Duration::ZERO, false, move |reason| {
                if reason != AlarmReason::Triggered {
                    return;
                }
                if let Some(inner) = inner.upgrade() {
                    service_pending(&inner);
                }
            })
            .is_err()
        {
            debug!("pending-work sentinel not armed; dispatcher stopping");
        }
    }

    /// Releases the reentrancy lock for the remainder of the current
    /// callback.
    pub fn enable_concurrent_callbacks(&self) {
        self.inner.timer.enable_concurrent_callbacks();
    }

    /// True when the current thread is one of this dispatcher's workers
    /// servicing a callback.
    #[must_use]
    pub fn is_dispatch_thread(&self) -> bool {
        self.inner.timer.is_timer_thread()
    }
}

fn service_pending(inner: &Arc<DispatcherInner>) {
    let hooks = inner.hooks.read().unwrap().upgrade();
    let Some(hooks) = hooks else { return };

    // Flags are re-read under the lock between categories; anything armed
    // during service is picked up by the sentinel the trigger re-armed.
    let mut flags = inner.flags.lock().unwrap();

    if flags.observer {
        flags.observer = false;
        drop(flags);
        hooks.perform_observer_work();
        flags = inner.flags.lock().unwrap();
    }

    if flags.cached_reply {
        flags.cached_reply = false;
        drop(flags);
        hooks.perform_cached_property_reply_work();
        flags = inner.flags.lock().unwrap();
    }

    // Deferred callbacks go last: they enable concurrent callbacks, which
    // must not influence the preceding work items.
    if flags.deferred_callbacks {
        flags.deferred_callbacks = false;
        drop(flags);
        inner.timer.enable_concurrent_callbacks();
        hooks.perform_deferred_callbacks();
    } else {
        drop(flags);
    }
}

struct NoDeferredWork;
impl DeferredWork for NoDeferredWork {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;

    fn started_timer(concurrency: usize) -> Timer {
        let timer = Timer::new("test-timer", concurrency, 8);
        timer.start();
        timer
    }

    #[test]
    fn test_alarms_service_in_insertion_order() {
        let timer = started_timer(1);
        let (tx, rx) = mpsc::channel();
        for n in 0..8 {
            let tx = tx.clone();
            timer
                .add_alarm(Duration::ZERO, true, move |_| {
                    tx.send(n).unwrap();
                })
                .unwrap();
        }
        let order: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
        timer.stop();
        timer.join();
    }

    #[test]
    fn test_deadline_alarm_fires_after_delay() {
        let timer = started_timer(2);
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        timer
            .add_alarm(Duration::from_millis(50), false, move |reason| {
                tx.send((reason, Instant::now())).unwrap();
            })
            .unwrap();
        let (reason, fired_at) = rx.recv().unwrap();
        assert_eq!(reason, AlarmReason::Triggered);
        assert!(fired_at.duration_since(start) >= Duration::from_millis(45));
        timer.stop();
        timer.join();
    }

    #[test]
    fn test_remove_alarm_cancels() {
        let timer = started_timer(1);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let id = timer
            .add_alarm(Duration::from_millis(200), false, move |_| {
                fired_clone.store(true, Ordering::SeqCst);
            })
            .unwrap();
        assert!(timer.remove_alarm(id));
        assert!(!timer.remove_alarm(id));
        thread::sleep(Duration::from_millis(250));
        assert!(!fired.load(Ordering::SeqCst));
        timer.stop();
        timer.join();
    }

    #[test]
    fn test_stop_flushes_with_exiting_reason() {
        let timer = started_timer(1);
        let (tx, rx) = mpsc::channel();
        timer
            .add_alarm(Duration::from_secs(3600), false, move |reason| {
                tx.send(reason).unwrap();
            })
            .unwrap();
        timer.stop();
        timer.join();
        assert_eq!(rx.recv().unwrap(), AlarmReason::Exiting);
    }

    #[test]
    fn test_add_after_stop_fails() {
        let timer = started_timer(1);
        timer.stop();
        timer.join();
        let err = timer.add_alarm(Duration::ZERO, false, |_| {}).unwrap_err();
        assert_eq!(err, Status::TimerExiting);
    }

    #[test]
    fn test_reentrancy_reported_inside_callback_only() {
        let timer = started_timer(2);
        assert!(!is_reentrant_call());
        let (tx, rx) = mpsc::channel();
        timer
            .add_alarm(Duration::ZERO, false, move |_| {
                tx.send(is_reentrant_call()).unwrap();
            })
            .unwrap();
        assert!(rx.recv().unwrap());
        assert!(!is_reentrant_call());
        timer.stop();
        timer.join();
    }

    #[test]
    fn test_callbacks_serialized_until_concurrency_enabled() {
        let timer = Arc::new(started_timer(4));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        for _ in 0..4 {
            let active = active.clone();
            let peak = peak.clone();
            let done = done_tx.clone();
            timer
                .add_alarm(Duration::ZERO, true, move |_| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.send(()).unwrap();
                })
                .unwrap();
        }
        for _ in 0..4 {
            done_rx.recv().unwrap();
        }
        // Without enable_concurrent_callbacks the reentrancy lock keeps
        // application callbacks serialized.
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        // Now the same load with callbacks that release the lock.
        let peak2 = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let timer_ref = timer.clone();
            let active = active.clone();
            let peak2 = peak2.clone();
            let done = done_tx.clone();
            timer
                .add_alarm(Duration::ZERO, true, move |_| {
                    timer_ref.enable_concurrent_callbacks();
                    assert!(!is_reentrant_call());
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak2.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(30));
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.send(()).unwrap();
                })
                .unwrap();
        }
        for _ in 0..4 {
            done_rx.recv().unwrap();
        }
        assert!(peak2.load(Ordering::SeqCst) > 1);

        timer.stop();
        timer.join();
    }

    #[test]
    fn test_dispatcher_pending_work_order() {
        struct Recorder {
            order: Mutex<Vec<&'static str>>,
        }
        impl DeferredWork for Recorder {
            fn perform_observer_work(&self) {
                self.order.lock().unwrap().push("observer");
            }
            fn perform_cached_property_reply_work(&self) {
                self.order.lock().unwrap().push("cached");
            }
            fn perform_deferred_callbacks(&self) {
                self.order.lock().unwrap().push("deferred");
            }
        }

        let dispatcher = Dispatcher::new("test-dispatcher", 1);
        let recorder = Arc::new(Recorder {
            order: Mutex::new(Vec::new()),
        });
        let hooks: Arc<dyn DeferredWork> = recorder.clone();
        dispatcher.set_hooks(Arc::downgrade(&hooks));
        dispatcher.start();

        // Park the single worker on a blocker so the three categories can
        // be armed (in reverse order) before any sentinel is serviced.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        dispatcher
            .dispatch(false, move |_| {
                let _ = release_rx.recv();
            })
            .unwrap();
        dispatcher.trigger_deferred_callbacks();
        dispatcher.trigger_cached_property_reply_work();
        dispatcher.trigger_observer_work();
        release_tx.send(()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if recorder.order.lock().unwrap().len() >= 3 {
                break;
            }
            assert!(Instant::now() < deadline, "pending work never serviced");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            &*recorder.order.lock().unwrap(),
            &["observer", "cached", "deferred"]
        );

        dispatcher.stop();
        dispatcher.join();
    }

    #[test]
    fn test_dispatch_after_stop_reports_stopping() {
        let dispatcher = Dispatcher::new("stopped", 1);
        dispatcher.start();
        dispatcher.stop();
        dispatcher.join();
        assert_eq!(
            dispatcher.dispatch(true, |_| {}).unwrap_err(),
            Status::Stopping
        );
    }
}
