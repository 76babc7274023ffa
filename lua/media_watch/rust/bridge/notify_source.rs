use notify::event::{AccessKind, AccessMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, trace};

use super::observer::{NativeSignal, NotifyFn, ObserverHandle, RegistrationToken};
use crate::config::WatchScope;
use crate::error::{Error, Result};
use crate::path_utils::{path_to_uri, resolve_scope_root};

enum NativeWatch {
    Direct(RecommendedWatcher),
    Debounced(Debouncer<RecommendedWatcher>),
}

/// Filesystem change source backed by the platform's recommended `notify`
/// watcher (inotify, FSEvents, ReadDirectoryChangesW, ...).
pub struct NotifySource {
    debounce: Option<Duration>,
    next_token: AtomicU64,
    watches: Mutex<HashMap<RegistrationToken, NativeWatch>>,
}

impl std::fmt::Debug for NotifySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySource")
            .field("debounce", &self.debounce)
            .field("active_watches", &self.active_watches())
            .finish()
    }
}

impl Default for NotifySource {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifySource {
    pub fn new() -> Self {
        Self::with_debounce(None)
    }

    pub fn with_debounce(debounce: Option<Duration>) -> Self {
        Self {
            debounce,
            next_token: AtomicU64::new(1),
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_watches(&self) -> usize {
        self.lock_watches().len()
    }

    fn lock_watches(&self) -> MutexGuard<'_, HashMap<RegistrationToken, NativeWatch>> {
        match self.watches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("Watch table mutex poisoned, recovering: {:?}", poisoned);
                poisoned.into_inner()
            }
        }
    }
}

/// Opening or reading a file is not a storage change; closing a file that was
/// open for writing is.
pub fn is_change_event(kind: &EventKind) -> bool {
    match kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Access(_) => false,
        _ => true,
    }
}

pub fn signal_from_event(event: &notify::Event) -> Option<NativeSignal> {
    if !is_change_event(&event.kind) {
        return None;
    }

    let subject = event.paths.first().and_then(|path| path_to_uri(path));
    Some(NativeSignal::new(subject))
}

impl ObserverHandle for NotifySource {
    fn register(&self, scope: &WatchScope, on_change: NotifyFn) -> Result<RegistrationToken> {
        let root = resolve_scope_root(&scope.root)?;
        let mode = if scope.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        let registration_error = |source| Error::Registration {
            scope: root.clone(),
            source,
        };

        let watch = match self.debounce {
            None => {
                let mut watcher =
                    notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                        match result {
                            Ok(event) => {
                                if let Some(signal) = signal_from_event(&event) {
                                    trace!(?event, "Native change event");
                                    on_change(signal);
                                }
                            }
                            Err(e) => error!("Media watcher error: {:?}", e),
                        }
                    })
                    .map_err(registration_error)?;
                watcher.watch(&root, mode).map_err(registration_error)?;
                NativeWatch::Direct(watcher)
            }
            Some(timeout) => {
                let mut debouncer = new_debouncer(timeout, move |result: DebounceEventResult| {
                    match result {
                        Ok(events) => {
                            for event in events {
                                trace!(?event, "Debounced native change event");
                                on_change(NativeSignal::new(path_to_uri(&event.path)));
                            }
                        }
                        Err(e) => error!("Media watcher error: {:?}", e),
                    }
                })
                .map_err(registration_error)?;
                debouncer
                    .watcher()
                    .watch(&root, mode)
                    .map_err(registration_error)?;
                NativeWatch::Debounced(debouncer)
            }
        };

        let token = RegistrationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.lock_watches().insert(token, watch);
        info!("Watching {} ({:?}) as {}", root.display(), mode, token);

        Ok(token)
    }

    fn unregister(&self, token: RegistrationToken) {
        let removed = self.lock_watches().remove(&token);
        match removed {
            // Dropping the watcher stops its event loop.
            Some(NativeWatch::Direct(watcher)) => drop(watcher),
            Some(NativeWatch::Debounced(debouncer)) => drop(debouncer),
            None => {
                trace!("{} already released", token);
                return;
            }
        }
        debug!("Released native watch {}", token);
    }
}
