//! Callback-mode and wait semantics of the future/event table.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gpu_wire::command::MapAsyncStatus;
use gpu_wire::events::{
    CallbackMode, EventCallback, EventCompletion, EventManager, FutureWaitInfo, WaitStatus,
};

fn counter_callback(counter: &Arc<AtomicUsize>) -> EventCallback {
    let counter = Arc::clone(counter);
    EventCallback::MapAsync(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }))
}

#[test]
fn process_events_fires_only_poll_mode_events() {
    let mgr = EventManager::new();
    let polled = Arc::new(AtomicUsize::new(0));
    let waited = Arc::new(AtomicUsize::new(0));

    let poll_id = mgr.track(CallbackMode::AllowProcessEvents, counter_callback(&polled));
    let wait_id = mgr.track(CallbackMode::WaitAnyOnly, counter_callback(&waited));

    mgr.set_ready(poll_id, EventCompletion::MapAsync(MapAsyncStatus::Success));
    mgr.set_ready(wait_id, EventCompletion::MapAsync(MapAsyncStatus::Success));
    // Nothing fires until the application turn.
    assert_eq!(polled.load(Ordering::SeqCst), 0);

    mgr.process_events();
    assert_eq!(polled.load(Ordering::SeqCst), 1);
    assert_eq!(waited.load(Ordering::SeqCst), 0, "wait-only stays parked");

    // Ready wait-only events fire from wait_any.
    let mut infos = [FutureWaitInfo::new(wait_id)];
    assert_eq!(mgr.wait_any(&mut infos, 0), WaitStatus::Success);
    assert!(infos[0].completed);
    assert_eq!(waited.load(Ordering::SeqCst), 1);
}

#[test]
fn wait_any_zero_timeout_is_a_poll() {
    let mgr = EventManager::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let pending = mgr.track(CallbackMode::WaitAnyOnly, counter_callback(&fired));
    let ready = mgr.track(CallbackMode::WaitAnyOnly, counter_callback(&fired));
    mgr.set_ready(ready, EventCompletion::MapAsync(MapAsyncStatus::Success));

    let mut infos = [FutureWaitInfo::new(pending), FutureWaitInfo::new(ready)];
    assert_eq!(mgr.wait_any(&mut infos, 0), WaitStatus::Success);
    assert!(!infos[0].completed);
    assert!(infos[1].completed);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Nothing left ready: the poll reports a timeout and touches nothing.
    let mut infos = [FutureWaitInfo::new(pending)];
    assert_eq!(mgr.wait_any(&mut infos, 0), WaitStatus::TimedOut);
    assert!(!infos[0].completed);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn nonzero_timeout_is_reported_unsupported() {
    let mgr = EventManager::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let id = mgr.track(CallbackMode::WaitAnyOnly, counter_callback(&fired));

    let mut infos = [FutureWaitInfo::new(id)];
    assert_eq!(mgr.wait_any(&mut infos, 1_000_000), WaitStatus::UnsupportedTimeout);
    assert!(!infos[0].completed);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn wait_any_on_nothing_succeeds_and_unknown_ids_count_as_done() {
    let mgr = EventManager::new();
    assert_eq!(mgr.wait_any(&mut [], 0), WaitStatus::Success);

    // An id that already completed (or never existed) is not pending.
    let fired = Arc::new(AtomicUsize::new(0));
    let id = mgr.track(CallbackMode::AllowSpontaneous, counter_callback(&fired));
    mgr.set_ready(id, EventCompletion::MapAsync(MapAsyncStatus::Success));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let mut infos = [FutureWaitInfo::new(id)];
    assert_eq!(mgr.wait_any(&mut infos, 0), WaitStatus::Success);
    assert!(infos[0].completed);
    assert_eq!(fired.load(Ordering::SeqCst), 1, "no second delivery");
}

#[test]
fn first_completion_wins() {
    let mgr = EventManager::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    let id = mgr.track(
        CallbackMode::WaitAnyOnly,
        EventCallback::MapAsync(Box::new(move |s| seen2.lock().unwrap().push(s))),
    );

    mgr.set_ready(
        id,
        EventCompletion::MapAsync(MapAsyncStatus::UnmappedBeforeCallback),
    );
    // A later (stale) completion must not override the first.
    mgr.set_ready(id, EventCompletion::MapAsync(MapAsyncStatus::Success));

    let mut infos = [FutureWaitInfo::new(id)];
    mgr.wait_any(&mut infos, 0);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![MapAsyncStatus::UnmappedBeforeCallback]
    );
}

#[test]
fn shutdown_is_idempotent_and_resolves_everything() {
    let mgr = EventManager::new();
    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        mgr.track(CallbackMode::WaitAnyOnly, counter_callback(&fired));
    }
    mgr.shutdown();
    assert_eq!(fired.load(Ordering::SeqCst), 5);
    mgr.shutdown();
    assert_eq!(fired.load(Ordering::SeqCst), 5);
}
