use std::fmt;
use std::sync::Arc;

use crate::config::WatchScope;
use crate::error::Result;

/// Opaque id of one live native registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationToken(pub u64);

impl fmt::Display for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registration#{}", self.0)
    }
}

/// One raw "something changed" callback from the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeSignal {
    pub subject: Option<String>,
}

impl NativeSignal {
    pub fn new(subject: Option<String>) -> Self {
        Self { subject }
    }

    pub fn with_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
        }
    }
}

pub type NotifyFn = Arc<dyn Fn(NativeSignal) + Send + Sync>;

/// Platform adapter around a native change-notification primitive.
///
/// `register` installs `notify` for `scope` and must return before invoking
/// it; the callback may later run on any thread. `unregister` may be called
/// from any thread, for tokens whose source never fired, and more than once
/// for the same token. Neither call may wait for a callback that is running
/// on another thread.
pub trait ObserverHandle: Send + Sync {
    fn register(&self, scope: &WatchScope, notify: NotifyFn) -> Result<RegistrationToken>;

    fn unregister(&self, token: RegistrationToken);
}
