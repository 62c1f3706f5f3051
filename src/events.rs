//! Future/event manager: exactly-once completion of asynchronous operations.
//!
//! Every async request tracks one event under a process-wide monotonic
//! [`FutureId`]. Completion delivery depends on the event's callback mode:
//! spontaneous events fire the moment the reply arrives, poll events fire
//! from [`EventManager::process_events`], wait events fire from
//! [`EventManager::wait_any`]. A callback is a consumed-by-value `FnOnce`
//! taken out of the table together with its event, so firing twice is
//! unrepresentable.
//!
//! This is the one component shared across threads (registration can race
//! with completion from the endpoint's processing thread), hence the single
//! mutex; callbacks always run outside the lock.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::command::{MapAsyncStatus, RequestDeviceStatus};
use crate::handle::FutureId;

/// When a tracked event's callback is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
    /// Only from `wait_any` (or shutdown).
    WaitAnyOnly,
    /// From `process_events` (or `wait_any`/shutdown).
    AllowProcessEvents,
    /// Immediately when the completion arrives.
    AllowSpontaneous,
}

/// Per-kind completion callback. One variant per async operation kind; a
/// match at completion time replaces per-kind subclasses.
pub enum EventCallback {
    MapAsync(Box<dyn FnOnce(MapAsyncStatus) + Send>),
    RequestDevice(Box<dyn FnOnce(RequestDeviceStatus) + Send>),
}

impl std::fmt::Debug for EventCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCallback::MapAsync(_) => f.write_str("EventCallback::MapAsync"),
            EventCallback::RequestDevice(_) => f.write_str("EventCallback::RequestDevice"),
        }
    }
}

/// Captured result of a completed operation, held until the callback mode
/// lets it fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCompletion {
    MapAsync(MapAsyncStatus),
    RequestDevice(RequestDeviceStatus),
}

impl EventCallback {
    /// Consumes the callback. `None` is the forced-shutdown completion; a
    /// completion of the wrong kind also degrades to the shutdown status so
    /// the exactly-once guarantee holds unconditionally.
    fn invoke(self, completion: Option<EventCompletion>) {
        match (self, completion) {
            (EventCallback::MapAsync(cb), Some(EventCompletion::MapAsync(status))) => cb(status),
            (EventCallback::MapAsync(cb), _) => cb(MapAsyncStatus::DeviceLost),
            (EventCallback::RequestDevice(cb), Some(EventCompletion::RequestDevice(status))) => {
                cb(status)
            }
            (EventCallback::RequestDevice(cb), _) => cb(RequestDeviceStatus::Shutdown),
        }
    }
}

#[derive(Debug)]
struct TrackedEvent {
    mode: CallbackMode,
    /// `Some` once the operation is Ready; first completion wins.
    completion: Option<EventCompletion>,
    callback: EventCallback,
}

/// Result of [`EventManager::wait_any`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Success,
    TimedOut,
    /// Timed waits are a capability this implementation does not carry;
    /// reported, never silently degraded to a poll.
    UnsupportedTimeout,
}

/// One entry of a `wait_any` call; `completed` is an out-parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FutureWaitInfo {
    pub future: FutureId,
    pub completed: bool,
}

impl FutureWaitInfo {
    pub fn new(future: FutureId) -> Self {
        Self {
            future,
            completed: false,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_future: FutureId,
    events: HashMap<FutureId, TrackedEvent>,
    shut_down: bool,
}

#[derive(Debug)]
pub struct EventManager {
    inner: Mutex<Inner>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_future: 1,
                events: HashMap::new(),
                shut_down: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new event. If the manager is already shut down the
    /// callback completes synchronously with the shutdown status instead.
    pub fn track(&self, mode: CallbackMode, callback: EventCallback) -> FutureId {
        let mut inner = self.lock();
        let future = inner.next_future;
        inner.next_future += 1;
        if inner.shut_down {
            drop(inner);
            callback.invoke(None);
            return future;
        }
        inner.events.insert(
            future,
            TrackedEvent {
                mode,
                completion: None,
                callback,
            },
        );
        future
    }

    /// Marks a tracked event Ready. Spontaneous events fire immediately;
    /// others hold the completion until polled or waited on. Returns false
    /// for an unknown (already completed, or stale) future id.
    pub fn set_ready(&self, future: FutureId, completion: EventCompletion) -> bool {
        let mut inner = self.lock();
        let Some(event) = inner.events.get_mut(&future) else {
            return false;
        };
        if event.completion.is_none() {
            event.completion = Some(completion);
        }
        if event.mode == CallbackMode::AllowSpontaneous {
            let event = inner.events.remove(&future).expect("event is present");
            drop(inner);
            event.callback.invoke(event.completion);
        }
        true
    }

    /// Fires and removes every Ready poll-mode event.
    pub fn process_events(&self) {
        let ready: Vec<TrackedEvent> = {
            let mut inner = self.lock();
            let ids: Vec<FutureId> = inner
                .events
                .iter()
                .filter(|(_, e)| {
                    e.mode == CallbackMode::AllowProcessEvents && e.completion.is_some()
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .map(|id| inner.events.remove(&id).expect("id was just collected"))
                .collect()
        };
        for event in ready {
            event.callback.invoke(event.completion);
        }
    }

    /// Reports per-future completion. A zero timeout is a non-blocking poll:
    /// if nothing in `infos` is ready, everything is left untouched and
    /// `TimedOut` is returned. Non-zero timeouts are an unsupported
    /// capability and fail explicitly.
    pub fn wait_any(&self, infos: &mut [FutureWaitInfo], timeout_ns: u64) -> WaitStatus {
        if infos.is_empty() {
            return WaitStatus::Success;
        }
        if timeout_ns != 0 {
            return WaitStatus::UnsupportedTimeout;
        }

        let mut fired: Vec<TrackedEvent> = Vec::new();
        let mut any_completed = false;
        {
            let mut inner = self.lock();
            for info in infos.iter_mut() {
                match inner.events.get(&info.future) {
                    None => {
                        // Unknown means it already completed (ids are never
                        // reused), or was never tracked; either way it is not
                        // pending.
                        info.completed = true;
                        any_completed = true;
                    }
                    Some(event) if event.completion.is_some() => {
                        let event = inner.events.remove(&info.future).expect("event is present");
                        fired.push(event);
                        info.completed = true;
                        any_completed = true;
                    }
                    Some(_) => {
                        info.completed = false;
                    }
                }
            }
        }

        for event in fired {
            event.callback.invoke(event.completion);
        }

        if any_completed {
            WaitStatus::Success
        } else {
            WaitStatus::TimedOut
        }
    }

    /// Forces every still-tracked event to a shutdown completion, looping to
    /// a fixed point because a callback may register new events. Idempotent.
    pub fn shutdown(&self) {
        let mut total = 0usize;
        loop {
            let drained: Vec<TrackedEvent> = {
                let mut inner = self.lock();
                inner.shut_down = true;
                inner.events.drain().map(|(_, event)| event).collect()
            };
            if drained.is_empty() {
                break;
            }
            total += drained.len();
            for event in drained {
                event.callback.invoke(None);
            }
        }
        if total > 0 {
            tracing::debug!(events = total, "event manager shutdown resolved events");
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_len(&self) -> usize {
        self.lock().events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> EventCallback {
        let counter = Arc::clone(counter);
        EventCallback::MapAsync(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn spontaneous_fires_on_set_ready() {
        let mgr = EventManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = mgr.track(CallbackMode::AllowSpontaneous, counting_callback(&fired));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(mgr.set_ready(id, EventCompletion::MapAsync(MapAsyncStatus::Success)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Completed ids are gone; a second ready is a no-op.
        assert!(!mgr.set_ready(id, EventCompletion::MapAsync(MapAsyncStatus::Success)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn track_after_shutdown_completes_immediately() {
        let mgr = EventManager::new();
        mgr.shutdown();
        let status = Arc::new(Mutex::new(None));
        let status2 = Arc::clone(&status);
        mgr.track(
            CallbackMode::WaitAnyOnly,
            EventCallback::MapAsync(Box::new(move |s| {
                *status2.lock().unwrap() = Some(s);
            })),
        );
        assert_eq!(*status.lock().unwrap(), Some(MapAsyncStatus::DeviceLost));
        assert_eq!(mgr.tracked_len(), 0);
    }

    #[test]
    fn shutdown_reaches_fixed_point_through_reentrant_tracks() {
        let mgr = Arc::new(EventManager::new());
        let fired = Arc::new(AtomicUsize::new(0));

        // A callback that registers another event when forced to complete.
        let mgr2 = Arc::clone(&mgr);
        let fired2 = Arc::clone(&fired);
        mgr.track(
            CallbackMode::WaitAnyOnly,
            EventCallback::RequestDevice(Box::new(move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
                let fired3 = Arc::clone(&fired2);
                mgr2.track(
                    CallbackMode::WaitAnyOnly,
                    EventCallback::RequestDevice(Box::new(move |_| {
                        fired3.fetch_add(1, Ordering::SeqCst);
                    })),
                );
            })),
        );

        mgr.shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.tracked_len(), 0);
    }
}
