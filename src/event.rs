use alloc::boxed::Box;
use alloc::sync::Arc;
use core::time::Duration;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Stays signaled until reset.
    Notification,
    /// Auto-resets after releasing one waiter.
    Synchronization,
}

/// Kernel event used as an IRP's user completion event.
#[derive(Debug)]
pub struct KEvent {
    kind: EventType,
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl KEvent {
    pub fn new(kind: EventType, initial: bool) -> Self {
        Self {
            kind,
            signaled: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn notification() -> Arc<Self> {
        Arc::new(Self::new(EventType::Notification, false))
    }

    /// Returns the previous state.
    pub fn set(&self) -> bool {
        let mut s = self.signaled.lock();
        let prev = *s;
        *s = true;
        if self.kind == EventType::Notification {
            self.cv.notify_all();
        } else {
            self.cv.notify_one();
        }
        prev
    }

    pub fn reset(&self) -> bool {
        core::mem::replace(&mut *self.signaled.lock(), false)
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    pub fn wait(&self) {
        let mut s = self.signaled.lock();
        while !*s {
            self.cv.wait(&mut s);
        }
        if self.kind == EventType::Synchronization {
            *s = false;
        }
    }

    /// `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut s = self.signaled.lock();
        while !*s {
            if self.cv.wait_for(&mut s, timeout).timed_out() {
                if !*s {
                    return false;
                }
                break;
            }
        }
        if self.kind == EventType::Synchronization {
            *s = false;
        }
        true
    }
}

pub type Apc = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Stop,
    Activity,
    /// One or more queued APCs ran during the wait.
    IoCompletion,
}

#[derive(Default)]
struct WaitState {
    stop: bool,
    activity: bool,
}

/// The dispatcher's alertable wait: a stop event, a sticky channel-activity
/// event and an APC queue drained by the waiting thread.
pub struct WaitSet {
    state: Mutex<WaitState>,
    cv: Condvar,
    apcs: SegQueue<Apc>,
}

impl WaitSet {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WaitState::default()),
            cv: Condvar::new(),
            apcs: SegQueue::new(),
        }
    }

    pub fn signal_stop(&self) {
        self.state.lock().stop = true;
        self.cv.notify_all();
    }

    pub fn notify_activity(&self) {
        self.state.lock().activity = true;
        self.cv.notify_all();
    }

    pub fn queue_apc(&self, apc: Apc) {
        self.apcs.push(apc);
        let _g = self.state.lock();
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stop
    }

    fn run_apcs(&self) -> usize {
        let mut ran = 0;
        while let Some(apc) = self.apcs.pop() {
            apc();
            ran += 1;
        }
        ran
    }

    pub fn wait_alertable(&self) -> WaitResult {
        let mut st = self.state.lock();
        loop {
            if st.stop {
                return WaitResult::Stop;
            }
            if st.activity {
                st.activity = false;
                return WaitResult::Activity;
            }
            if !self.apcs.is_empty() {
                drop(st);
                self.run_apcs();
                return WaitResult::IoCompletion;
            }
            self.cv.wait(&mut st);
        }
    }
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Handed to the request channel so it can wake a dispatcher blocked in
/// [`WaitSet::wait_alertable`].
#[derive(Clone)]
pub struct Notifier(Arc<WaitSet>);

impl Notifier {
    pub(crate) fn new(set: Arc<WaitSet>) -> Self {
        Self(set)
    }

    #[inline]
    pub fn notify(&self) {
        self.0.notify_activity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn notification_event_releases_all_waiters() {
        let ev = KEvent::notification();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let ev = ev.clone();
                thread::spawn(move || ev.wait())
            })
            .collect();
        assert!(!ev.set());
        for w in waiters {
            w.join().unwrap();
        }
        assert!(ev.is_set());
    }

    #[test]
    fn synchronization_event_auto_resets() {
        let ev = KEvent::new(EventType::Synchronization, true);
        ev.wait();
        assert!(!ev.is_set());
        assert!(!ev.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn stop_wins_over_activity() {
        let ws = WaitSet::new();
        ws.notify_activity();
        assert_eq!(ws.wait_alertable(), WaitResult::Activity);
        ws.notify_activity();
        ws.signal_stop();
        assert_eq!(ws.wait_alertable(), WaitResult::Stop);
    }

    #[test]
    fn apcs_run_on_the_waiting_thread() {
        let ws = Arc::new(WaitSet::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let ws = ws.clone();
            thread::spawn(move || {
                let me = thread::current().id();
                let r = ws.wait_alertable();
                (r, me)
            })
        };
        let seen = Arc::new(Mutex::new(None));
        {
            let hits = hits.clone();
            let seen = seen.clone();
            ws.queue_apc(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = Some(thread::current().id());
            }));
        }
        let (r, tid) = waiter.join().unwrap();
        assert_eq!(r, WaitResult::IoCompletion);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), Some(tid));
    }
}
