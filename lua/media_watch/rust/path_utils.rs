use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };

    match home_dir() {
        Some(home) if rest.as_os_str().is_empty() => home,
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Expand `~` and canonicalize, so native sources always see an absolute root.
pub fn resolve_scope_root(path: &Path) -> Result<PathBuf> {
    let expanded = expand_tilde(path);
    expanded
        .canonicalize()
        .map_err(|_| Error::ScopeNotFound(expanded))
}

/// Default media root: `~/Pictures`, then home, then the working directory.
pub fn default_media_root() -> PathBuf {
    match home_dir() {
        Some(home) => {
            let pictures = home.join("Pictures");
            if pictures.is_dir() {
                pictures
            } else {
                home
            }
        }
        None => PathBuf::from("."),
    }
}

pub fn path_to_uri(path: &Path) -> Option<String> {
    url::Url::from_file_path(path).ok().map(String::from)
}
