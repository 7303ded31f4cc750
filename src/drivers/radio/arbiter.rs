//! The shared-radio arbiter: reference-counted sharing of one physical dongle
//! across multiple logical connections at different addresses.
//!
//! The registry is process-wide, keyed by radio index, because the dongle
//! itself is a single USB device shared by every [`super::RadioLinkDriver`]
//! that opens `radio://<index>/...` URIs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use tokio::sync::Notify;

use crate::error::Result;

use super::transport::RadioTransport;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Initializing,
    Ready,
    Destroying,
}

struct Entry {
    transport: Option<Arc<RadioTransport>>,
    refcount: usize,
    state: State,
    notify: Arc<Notify>,
}

type Registry = StdMutex<HashMap<u8, Entry>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()))
}

enum Action {
    Create(Arc<Notify>),
    Ready(Arc<RadioTransport>),
}

/// Acquires a reference to the transport for physical radio `index`, opening
/// it via `open` if this is the first acquisition, or waiting for a
/// concurrent open/close to settle otherwise.
///
/// `open` is only invoked when no entry yet exists for `index`; concurrent
/// callers racing to acquire the same, not-yet-open index all wait on the
/// same in-flight open rather than each performing their own USB probe.
pub async fn acquire<F, Fut>(index: u8, open: F) -> Result<Arc<RadioTransport>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<RadioTransport>>,
{
    loop {
        let mut reg = registry().lock().unwrap();
        let action = match reg.get_mut(&index) {
            None => {
                let notify = Arc::new(Notify::new());
                reg.insert(
                    index,
                    Entry {
                        transport: None,
                        refcount: 0,
                        state: State::Initializing,
                        notify: notify.clone(),
                    },
                );
                Action::Create(notify)
            }
            Some(entry) if entry.state == State::Destroying || entry.state == State::Initializing => {
                // The `Notified` future is created here, still under the
                // registry lock, and awaited only after the lock is
                // released. Creating it earlier than the unlock guarantees
                // that a `notify_waiters()` racing in on another thread
                // (from `Create`'s completion or from `release`) can never
                // land in the gap between unlock and the first poll of
                // `notified()`, which would otherwise be missed entirely.
                let notify = Arc::clone(&entry.notify);
                let notified = notify.notified();
                drop(reg);
                notified.await;
                continue;
            }
            Some(entry) => {
                entry.refcount += 1;
                Action::Ready(entry.transport.clone().expect("ready entry has a transport"))
            }
        };
        drop(reg);

        match action {
            Action::Create(notify) => {
                let opened = open().await;
                let mut reg = registry().lock().unwrap();
                match opened {
                    Ok(transport) => {
                        let transport = Arc::new(transport);
                        if let Some(entry) = reg.get_mut(&index) {
                            entry.transport = Some(Arc::clone(&transport));
                            entry.refcount = 1;
                            entry.state = State::Ready;
                        }
                        drop(reg);
                        notify.notify_waiters();
                        return Ok(transport);
                    }
                    Err(e) => {
                        reg.remove(&index);
                        drop(reg);
                        notify.notify_waiters();
                        return Err(e);
                    }
                }
            }
            Action::Ready(transport) => return Ok(transport),
        }
    }
}

/// Releases one acquisition of `index`. Once the refcount reaches zero the
/// transport is dropped (closing the underlying worker thread's channel,
/// which ends it) and any waiters retrying `acquire` are woken.
pub fn release(index: u8) {
    let mut reg = registry().lock().unwrap();
    if let Some(entry) = reg.get_mut(&index) {
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            entry.state = State::Destroying;
            entry.transport = None;
            let notify = Arc::clone(&entry.notify);
            reg.remove(&index);
            drop(reg);
            notify.notify_waiters();
        }
    }
}

/// Number of live acquisitions currently held for `index`, for diagnostics
/// and tests.
pub fn refcount(index: u8) -> usize {
    registry()
        .lock()
        .unwrap()
        .get(&index)
        .map(|e| e.refcount)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::backend::mock::MockBackend;

    fn open_mock() -> std::pin::Pin<Box<dyn Future<Output = Result<RadioTransport>>>> {
        Box::pin(async { Ok(RadioTransport::spawn(Box::new(MockBackend::default()))) })
    }

    #[tokio::test]
    async fn concurrent_acquire_coalesces_into_one_open() {
        let index = 200; // a test-private index to avoid cross-test interference
        let a = acquire(index, open_mock).await.unwrap();
        let b = acquire(index, open_mock).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(refcount(index), 2);

        release(index);
        assert_eq!(refcount(index), 1);
        release(index);
        assert_eq!(refcount(index), 0);
    }

    #[tokio::test]
    async fn reacquiring_after_full_release_opens_again() {
        let index = 201;
        let a = acquire(index, open_mock).await.unwrap();
        release(index);
        let b = acquire(index, open_mock).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        release(index);
    }

    // Regression test for a missed-wakeup hang: on a real multi-threaded
    // runtime, two tasks racing `acquire()` on a brand-new index must both
    // resolve even though one of them spends time in the `Initializing` wait
    // branch while the other is off running `open()`.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn truly_concurrent_acquire_on_a_new_index_does_not_hang() {
        let index = 202;
        let (a, b) = tokio::join!(acquire(index, open_mock), acquire(index, open_mock));
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(refcount(index), 2);

        release(index);
        release(index);
        assert_eq!(refcount(index), 0);
    }
}
