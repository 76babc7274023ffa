use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

use super::emitter::{notifier, Delivery};
use super::notify_source::NotifySource;
use super::observer::{ObserverHandle, RegistrationToken};
use super::sink::{channel, ChangeSink, ChangeStream};
use crate::config::{BridgeConfig, WatchScope};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Detached,
    Attached,
}

/// Native registration backing the current subscription.
struct ObserverRegistration {
    subscription: u64,
    token: RegistrationToken,
}

#[derive(Default)]
pub(super) struct BridgeState {
    pub(super) current: Option<Arc<Delivery>>,
    next_id: u64,
}

pub(super) fn lock_recovering<'a, T>(mutex: &'a Mutex<T>, name: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("Bridge {} mutex poisoned, recovering: {:?}", name, poisoned);
            poisoned.into_inner()
        }
    }
}

#[inline]
pub(super) fn lock_state(state: &Mutex<BridgeState>) -> MutexGuard<'_, BridgeState> {
    lock_recovering(state, "state")
}

/// Connects one downstream subscriber at a time to a native change source.
///
/// `attach` and `detach` serialize on a lifecycle lock that is held across the
/// native `register`/`unregister` calls, so at most one native registration is
/// alive at any time. Native callbacks only take the short state lock to find
/// the current subscription and never wait on the lifecycle lock; sinks run
/// outside both locks and may attach or detach from inside `on_event`.
pub struct ChangeBridge {
    config: BridgeConfig,
    source: Arc<dyn ObserverHandle>,
    lifecycle: Mutex<Option<ObserverRegistration>>,
    state: Arc<Mutex<BridgeState>>,
}

impl std::fmt::Debug for ChangeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBridge")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ChangeBridge {
    pub fn new(config: BridgeConfig, source: Arc<dyn ObserverHandle>) -> Self {
        Self {
            config,
            source,
            lifecycle: Mutex::new(None),
            state: Arc::new(Mutex::new(BridgeState::default())),
        }
    }

    /// Bridge over the filesystem watcher for `config.scope`.
    pub fn with_notify(config: BridgeConfig) -> Self {
        let source = Arc::new(NotifySource::with_debounce(config.debounce));
        Self::new(config, source)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn scope(&self) -> &WatchScope {
        &self.config.scope
    }

    /// True when this bridge was built for exactly `config`, so a host can
    /// resubscribe on it instead of building a new one.
    pub fn is_configured_for(&self, config: &BridgeConfig) -> bool {
        self.config == *config
    }

    /// Starts a subscription delivering to `sink`. An attached subscription is
    /// replaced: its native registration is released before the new one is
    /// installed and its sink is closed before this returns.
    ///
    /// On registration failure the sink receives the error, the bridge is left
    /// detached and the same error is returned.
    pub fn attach(&self, sink: Box<dyn ChangeSink>) -> Result<()> {
        let mut registration = lock_recovering(&self.lifecycle, "lifecycle");

        let (delivery, previous) = {
            let mut state = lock_state(&self.state);
            state.next_id += 1;
            let delivery = Delivery::new(state.next_id, sink);
            let previous = state.current.replace(Arc::clone(&delivery));
            (delivery, previous)
        };
        let id = delivery.id();

        if let Some(previous) = &previous {
            previous.close();
            debug!(
                "Subscription {} replaced by {} after {} events",
                previous.id(),
                id,
                previous.delivered()
            );
        }
        if let Some(stale) = registration.take() {
            debug!("Releasing {} of subscription {}", stale.token, stale.subscription);
            self.source.unregister(stale.token);
        }

        let registered = self
            .source
            .register(&self.config.scope, notifier(Arc::downgrade(&self.state), id));

        let failure = match registered {
            Ok(token) => {
                *registration = Some(ObserverRegistration {
                    subscription: id,
                    token,
                });
                info!(
                    "Subscription {} attached to {} via {}",
                    id,
                    self.config.scope.root.display(),
                    token
                );
                None
            }
            Err(error) => {
                error!(
                    "Failed to attach subscription {} to {}: {}",
                    id,
                    self.config.scope.root.display(),
                    error
                );
                let mut state = lock_state(&self.state);
                if state.current.as_ref().is_some_and(|current| current.id() == id) {
                    state.current = None;
                }
                Some(error)
            }
        };
        drop(registration);

        // Sinks may re-enter the bridge; finish them after the lifecycle lock.
        if let Some(previous) = previous {
            previous.finish(None);
        }
        match failure {
            None => Ok(()),
            Some(error) => {
                delivery.finish(Some(&error));
                Err(error)
            }
        }
    }

    /// Attaches a channel-backed sink and returns its receiving end.
    pub fn subscribe(&self) -> Result<ChangeStream> {
        let (sink, stream) = channel();
        self.attach(Box::new(sink))?;
        Ok(stream)
    }

    /// Ends the current subscription. No-op when detached. Once this returns
    /// the ended sink receives nothing but its close notification, which is
    /// deferred until `on_event` returns when called from inside the sink.
    pub fn detach(&self) {
        let mut registration = lock_recovering(&self.lifecycle, "lifecycle");
        let current = lock_state(&self.state).current.take();
        let Some(current) = current else {
            debug!("Detach requested with no active subscription");
            return;
        };

        current.close();
        if let Some(stale) = registration.take() {
            self.source.unregister(stale.token);
        }
        drop(registration);

        info!(
            "Subscription {} detached after {} events",
            current.id(),
            current.delivered()
        );
        current.finish(None);
    }

    pub fn state(&self) -> SubscriptionState {
        if lock_state(&self.state).current.is_some() {
            SubscriptionState::Attached
        } else {
            SubscriptionState::Detached
        }
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.state() == SubscriptionState::Attached
    }

    /// Number of subscriptions started so far.
    pub fn generation(&self) -> u64 {
        lock_state(&self.state).next_id
    }

    /// Events delivered to the current subscription.
    pub fn delivered(&self) -> u64 {
        lock_state(&self.state)
            .current
            .as_ref()
            .map_or(0, |current| current.delivered())
    }
}

impl Drop for ChangeBridge {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::manual_source::ManualSource;
    use crate::bridge::sink::{CallbackSink, StreamItem};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::{self, TryRecvError};
    use std::thread;
    use std::time::Duration;

    fn bridge() -> (ChangeBridge, Arc<ManualSource>) {
        let source = Arc::new(ManualSource::new());
        let bridge = ChangeBridge::new(
            BridgeConfig::new(WatchScope::recursive("/storage/emulated/0/DCIM")),
            source.clone(),
        );
        (bridge, source)
    }

    fn subject(item: Option<StreamItem>) -> Option<String> {
        match item {
            Some(StreamItem::Event(event)) => event.subject,
            other => panic!("expected change event, got {:?}", other),
        }
    }

    /// Runs `f` on a native-like thread; false if it did not finish in time.
    fn finishes_in_time(f: impl FnOnce() + Send + 'static) -> bool {
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            f();
            let _ = done_tx.send(());
        });
        done_rx.recv_timeout(Duration::from_secs(5)).is_ok()
    }

    #[test]
    fn test_attach_registers_one_observer() {
        let (bridge, source) = bridge();
        assert_eq!(bridge.state(), SubscriptionState::Detached);

        let _stream = bridge.subscribe().unwrap();
        assert_eq!(bridge.state(), SubscriptionState::Attached);
        assert_eq!(source.active_registrations(), 1);
        assert_eq!(bridge.generation(), 1);
    }

    #[test]
    fn test_signal_becomes_change_event() {
        let (bridge, source) = bridge();
        let stream = bridge.subscribe().unwrap();
        let token = source.latest_token().unwrap();

        source.fire(token, Some("content://media/external/images/42"));
        source.fire(token, None);

        assert_eq!(
            subject(stream.recv()).as_deref(),
            Some("content://media/external/images/42")
        );
        assert_eq!(subject(stream.recv()), None);
        assert_eq!(bridge.delivered(), 2);
    }

    #[test]
    fn test_detach_closes_stream_and_unregisters() {
        let (bridge, source) = bridge();
        let stream = bridge.subscribe().unwrap();
        let token = source.latest_token().unwrap();

        bridge.detach();

        assert_eq!(bridge.state(), SubscriptionState::Detached);
        assert_eq!(source.active_registrations(), 0);
        assert!(!source.fire(token, None));
        assert_eq!(stream.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_double_detach_unregisters_once() {
        let (bridge, source) = bridge();
        let _stream = bridge.subscribe().unwrap();

        bridge.detach();
        bridge.detach();

        assert_eq!(source.unregister_calls(), 1);
    }

    #[test]
    fn test_detach_without_attach_is_noop() {
        let (bridge, source) = bridge();
        bridge.detach();
        assert_eq!(source.unregister_calls(), 0);
        assert_eq!(bridge.state(), SubscriptionState::Detached);
    }

    #[test]
    fn test_late_callback_after_detach_is_dropped() {
        let (bridge, source) = bridge();
        let stream = bridge.subscribe().unwrap();
        let late = source.notifier(source.latest_token().unwrap()).unwrap();

        bridge.detach();
        late(crate::bridge::NativeSignal::with_subject("file:///late.jpg"));

        assert_eq!(stream.recv(), None);
    }

    #[test]
    fn test_registration_failure_is_terminal() {
        let (bridge, source) = bridge();
        source.deny_registrations(true);
        let (sink, stream) = channel();

        let err = bridge.attach(Box::new(sink)).unwrap_err();

        assert!(err.is_registration_failure());
        assert_eq!(bridge.state(), SubscriptionState::Detached);
        assert!(matches!(stream.recv(), Some(StreamItem::Failed(_))));
        assert_eq!(stream.recv(), None);

        // A fresh attach is the only retry.
        source.deny_registrations(false);
        let _stream = bridge.subscribe().unwrap();
        assert!(bridge.is_attached());
    }

    #[test]
    fn test_drop_releases_registration() {
        let (bridge, source) = bridge();
        let stream = bridge.subscribe().unwrap();

        drop(bridge);

        assert_eq!(source.active_registrations(), 0);
        assert_eq!(source.unregister_calls(), 1);
        assert_eq!(stream.recv(), None);
    }

    #[test]
    fn test_sink_can_detach_from_inside_on_event() {
        let (bridge, source) = bridge();
        let bridge = Arc::new(bridge);
        let seen = Arc::new(AtomicUsize::new(0));
        let ended = Arc::new(Mutex::new(Vec::new()));

        let sink = {
            let weak = Arc::downgrade(&bridge);
            let seen = Arc::clone(&seen);
            let ended = Arc::clone(&ended);
            CallbackSink::new(move |_event| {
                seen.fetch_add(1, Ordering::SeqCst);
                if let Some(bridge) = weak.upgrade() {
                    bridge.detach();
                }
            })
            .on_end(move |reason| ended.lock().unwrap().push(reason))
        };
        bridge.attach(Box::new(sink)).unwrap();
        let token = source.latest_token().unwrap();

        let firing = Arc::clone(&source);
        assert!(finishes_in_time(move || {
            firing.fire(token, Some("content://media/external/images/9"));
            firing.fire(token, Some("content://media/external/images/10"));
        }));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(*ended.lock().unwrap(), vec![None]);
        assert_eq!(bridge.state(), SubscriptionState::Detached);
        assert_eq!(source.active_registrations(), 0);
        assert_eq!(source.unregister_calls(), 1);
    }

    #[test]
    fn test_sink_can_resubscribe_from_inside_on_event() {
        let (bridge, source) = bridge();
        let bridge = Arc::new(bridge);
        let replacement: Arc<Mutex<Option<ChangeStream>>> = Arc::new(Mutex::new(None));
        let ended = Arc::new(Mutex::new(Vec::new()));

        let sink = {
            let weak = Arc::downgrade(&bridge);
            let replacement = Arc::clone(&replacement);
            let ended = Arc::clone(&ended);
            CallbackSink::new(move |_event| {
                if let Some(bridge) = weak.upgrade() {
                    *replacement.lock().unwrap() = Some(bridge.subscribe().unwrap());
                }
            })
            .on_end(move |reason| ended.lock().unwrap().push(reason))
        };
        bridge.attach(Box::new(sink)).unwrap();
        let first = source.latest_token().unwrap();

        let firing = Arc::clone(&source);
        assert!(finishes_in_time(move || {
            firing.fire(first, Some("first"));
            firing.fire_all(Some("second"));
        }));

        assert_eq!(*ended.lock().unwrap(), vec![None]);
        assert_eq!(source.active_registrations(), 1);
        assert_eq!(bridge.generation(), 2);

        let replacement = replacement.lock().unwrap().take().unwrap();
        assert_eq!(subject(replacement.try_recv().ok()).as_deref(), Some("second"));
        assert_eq!(replacement.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_sink_can_query_bridge_while_delivering() {
        let (bridge, source) = bridge();
        let bridge = Arc::new(bridge);
        let observed = Arc::new(Mutex::new(Vec::new()));

        let sink = {
            let weak = Arc::downgrade(&bridge);
            let observed = Arc::clone(&observed);
            CallbackSink::new(move |_event| {
                if let Some(bridge) = weak.upgrade() {
                    observed
                        .lock()
                        .unwrap()
                        .push((bridge.state(), bridge.delivered()));
                }
            })
        };
        bridge.attach(Box::new(sink)).unwrap();

        let firing = Arc::clone(&source);
        assert!(finishes_in_time(move || {
            firing.fire_all(None);
            firing.fire_all(None);
        }));

        assert_eq!(
            *observed.lock().unwrap(),
            vec![
                (SubscriptionState::Attached, 0),
                (SubscriptionState::Attached, 1)
            ]
        );
    }

    #[test]
    fn test_is_configured_for_compares_whole_config() {
        let config = BridgeConfig::new(WatchScope::recursive("/sdcard/DCIM")).debounce_ms(250);
        let bridge = ChangeBridge::new(config.clone(), Arc::new(ManualSource::new()));

        assert!(bridge.is_configured_for(&config));
        assert!(!bridge.is_configured_for(&config.clone().debounce_ms(0)));
        assert!(!bridge.is_configured_for(&config.clone().recursive(false)));
        assert_eq!(bridge.config().debounce, Some(Duration::from_millis(250)));
    }
}
