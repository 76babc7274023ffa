use std::path::PathBuf;
use std::time::Duration;

use crate::path_utils::default_media_root;

/// Root of the storage tree handed to the native change source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchScope {
    pub root: PathBuf,
    pub recursive: bool,
}

impl WatchScope {
    pub fn recursive(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            recursive: true,
        }
    }

    pub fn non_recursive(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            recursive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub scope: WatchScope,
    /// Coalescing window applied by the filesystem adapter before signals
    /// reach the bridge. `None` forwards every native event.
    pub debounce: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            scope: WatchScope::recursive(default_media_root()),
            debounce: None,
        }
    }
}

impl BridgeConfig {
    pub fn new(scope: WatchScope) -> Self {
        Self {
            scope,
            debounce: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scope.root = root.into();
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.scope.recursive = recursive;
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.debounce = (ms > 0).then(|| Duration::from_millis(ms));
        self
    }
}
