use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use super::observer::{NativeSignal, NotifyFn, ObserverHandle, RegistrationToken};
use crate::config::WatchScope;
use crate::error::{Error, Result};

/// Change source driven by the host.
///
/// Used where the native primitive lives outside Rust (a media-index callback
/// or storage-provider change token marshalled across FFI): the host keeps
/// the token returned by `register` and calls [`ManualSource::fire`] whenever
/// its platform reports a change.
#[derive(Default)]
pub struct ManualSource {
    next_token: AtomicU64,
    deny: AtomicBool,
    unregister_calls: AtomicUsize,
    registrations: Mutex<BTreeMap<RegistrationToken, NotifyFn>>,
}

impl std::fmt::Debug for ManualSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualSource")
            .field("active_registrations", &self.active_registrations())
            .field("unregister_calls", &self.unregister_calls())
            .finish_non_exhaustive()
    }
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse subsequent registrations, as a platform does once the app's
    /// media permission is revoked.
    pub fn deny_registrations(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Deliver one native signal through the callback registered as `token`.
    /// Returns false when the registration is gone.
    pub fn fire(&self, token: RegistrationToken, subject: Option<&str>) -> bool {
        let Some(notify) = self.notifier(token) else {
            trace!("Dropping host signal for released {}", token);
            return false;
        };
        notify(NativeSignal::new(subject.map(str::to_string)));
        true
    }

    /// Deliver one native signal to every live registration.
    pub fn fire_all(&self, subject: Option<&str>) -> usize {
        let callbacks: Vec<NotifyFn> = self.lock_registrations().values().cloned().collect();
        for notify in &callbacks {
            notify(NativeSignal::new(subject.map(str::to_string)));
        }
        callbacks.len()
    }

    /// Callback installed for `token`, if still registered. Holding on to it
    /// after `unregister` reproduces a native callback that arrives late.
    pub fn notifier(&self, token: RegistrationToken) -> Option<NotifyFn> {
        self.lock_registrations().get(&token).cloned()
    }

    pub fn latest_token(&self) -> Option<RegistrationToken> {
        self.lock_registrations().keys().next_back().copied()
    }

    pub fn active_registrations(&self) -> usize {
        self.lock_registrations().len()
    }

    pub fn unregister_calls(&self) -> usize {
        self.unregister_calls.load(Ordering::SeqCst)
    }

    fn lock_registrations(&self) -> MutexGuard<'_, BTreeMap<RegistrationToken, NotifyFn>> {
        match self.registrations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Registration table mutex poisoned, recovering: {:?}", poisoned);
                poisoned.into_inner()
            }
        }
    }
}

impl ObserverHandle for ManualSource {
    fn register(&self, scope: &WatchScope, on_change: NotifyFn) -> Result<RegistrationToken> {
        if self.deny.load(Ordering::SeqCst) {
            warn!("Host refused registration for {}", scope.root.display());
            return Err(Error::RegistrationDenied(scope.root.clone()));
        }

        let token = RegistrationToken(self.next_token.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock_registrations().insert(token, on_change);
        debug!("Host source registered {} for {}", token, scope.root.display());
        Ok(token)
    }

    fn unregister(&self, token: RegistrationToken) {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        if self.lock_registrations().remove(&token).is_none() {
            trace!("{} already released", token);
        }
    }
}
