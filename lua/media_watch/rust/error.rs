use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to register change observer for {}: {source}", .scope.display())]
    Registration {
        scope: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("Registration denied for {}", .0.display())]
    RegistrationDenied(PathBuf),
    #[error("Watch scope does not exist: {}", .0.display())]
    ScopeNotFound(PathBuf),
    #[error("No subscription is attached")]
    NotAttached,
    #[error("Failed to serialize change payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to initialize logging: {0}")]
    Tracing(String),
}

impl Error {
    /// True for failures that end a subscription because the platform refused
    /// the observer registration.
    pub fn is_registration_failure(&self) -> bool {
        matches!(
            self,
            Error::Registration { .. } | Error::RegistrationDenied(_) | Error::ScopeNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(feature = "lua")]
impl From<Error> for mlua::Error {
    fn from(error: Error) -> Self {
        mlua::Error::RuntimeError(error.to_string())
    }
}
