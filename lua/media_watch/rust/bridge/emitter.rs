use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;

use super::lifecycle::{lock_recovering, lock_state, BridgeState};
use super::observer::{NativeSignal, NotifyFn};
use super::sink::ChangeSink;
use crate::error::Error;
use crate::types::ChangeEvent;

thread_local! {
    // Subscription whose sink is running `on_event` on this thread.
    static DELIVERING: Cell<Option<u64>> = const { Cell::new(None) };
}

struct DeliveringScope {
    outer: Option<u64>,
}

impl DeliveringScope {
    fn enter(subscription: u64) -> Self {
        Self {
            outer: DELIVERING.with(|current| current.replace(Some(subscription))),
        }
    }
}

impl Drop for DeliveringScope {
    fn drop(&mut self) {
        DELIVERING.with(|current| current.set(self.outer));
    }
}

fn delivering_on_this_thread(subscription: u64) -> bool {
    DELIVERING.with(|current| current.get() == Some(subscription))
}

/// Delivery side of one subscription.
///
/// The sink sits behind its own lock, so the bridge state lock is never held
/// while consumer code runs and a sink may call back into the bridge. Once
/// `closed` is set no new event reaches the sink; [`Delivery::finish`] waits
/// for an in-flight `on_event` on another thread, or leaves the close to the
/// delivering thread when called from inside the sink itself.
pub(super) struct Delivery {
    id: u64,
    closed: AtomicBool,
    delivered: AtomicU64,
    sink: Mutex<Option<Box<dyn ChangeSink>>>,
}

impl Delivery {
    pub(super) fn new(id: u64, sink: Box<dyn ChangeSink>) -> Arc<Self> {
        Arc::new(Self {
            id,
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            sink: Mutex::new(Some(sink)),
        })
    }

    #[inline]
    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Stops delivery without waiting for the sink.
    pub(super) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Stops delivery and hands the sink its terminal notifications.
    pub(super) fn finish(&self, error: Option<&Error>) {
        self.close();
        if delivering_on_this_thread(self.id) {
            // Called from the sink's own `on_event`; `deliver` closes it once
            // that call returns.
            return;
        }

        let sink = lock_recovering(&self.sink, "sink").take();
        if let Some(mut sink) = sink {
            if let Some(error) = error {
                sink.on_error(error);
            }
            sink.on_close();
        }
    }

    fn deliver(&self, event: ChangeEvent) {
        if delivering_on_this_thread(self.id) {
            trace!(subscription = self.id, "Dropping signal raised from inside its own sink");
            return;
        }

        let mut slot = lock_recovering(&self.sink, "sink");
        if self.closed.load(Ordering::SeqCst) {
            trace!(subscription = self.id, "Dropping native signal for closed subscription");
            return;
        }
        let Some(sink) = slot.as_mut() else {
            return;
        };

        trace!(
            subscription = self.id,
            uri = event.subject.as_deref().unwrap_or("<none>"),
            "Delivering change event"
        );
        {
            let _scope = DeliveringScope::enter(self.id);
            sink.on_event(&event);
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);

        // The sink ended its own subscription.
        if self.closed.load(Ordering::SeqCst) {
            if let Some(mut sink) = slot.take() {
                sink.on_close();
            }
        }
    }
}

/// Callback handed to the native source for one subscription. It only holds a
/// weak reference, so a registration that outlives the bridge delivers nothing.
pub(super) fn notifier(state: Weak<Mutex<BridgeState>>, subscription: u64) -> NotifyFn {
    Arc::new(move |signal| emit(&state, subscription, signal))
}

fn emit(state: &Weak<Mutex<BridgeState>>, subscription: u64, signal: NativeSignal) {
    let Some(state) = state.upgrade() else {
        trace!("Bridge dropped, ignoring native signal");
        return;
    };

    let delivery = match lock_state(&state).current.as_ref() {
        Some(current) if current.id() == subscription => Arc::clone(current),
        _ => {
            trace!(subscription, "Dropping native signal for stale subscription");
            return;
        }
    };

    delivery.deliver(ChangeEvent::changed(signal.subject));
}
