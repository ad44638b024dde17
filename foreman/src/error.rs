//! Typed failure kinds that callers branch on.
//!
//! Everything travels as `anyhow::Error`; orchestration code recovers the kind
//! with `err.downcast_ref::<FleetError>()`.

/// Failure taxonomy shared by the store, transport, guard and watchdog layers.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Malformed workflow/guard spec or configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Clone, checkout or fetch failed for a task workspace.
    #[error("repo error for task {task_id}: {message}")]
    Repo { task_id: String, message: String },

    /// An envelope could not be parsed or written.
    #[error("transport error ({path}): {message}")]
    Transport { path: String, message: String },

    /// Direct lookup of a task id that is not in the store.
    #[error("task not found: {0}")]
    NotFound(String),

    /// Shutdown was requested while work was in flight.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl FleetError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// True if `err` (or anything it wraps) is a [`FleetError::Config`].
pub fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<FleetError>()
            .is_some_and(FleetError::is_config)
    })
}

/// True if `err` (or anything it wraps) is a [`FleetError::Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<FleetError>(),
            Some(FleetError::Cancelled(_))
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn config_error_survives_context_wrapping() {
        let err = Err::<(), _>(FleetError::config("bad guard"))
            .context("load workflow")
            .unwrap_err();
        assert!(is_config_error(&err));
        assert!(!is_cancelled(&err));
    }

    #[test]
    fn repo_error_is_not_config() {
        let err = anyhow::Error::from(FleetError::Repo {
            task_id: "t1".to_string(),
            message: "clone failed".to_string(),
        });
        assert!(!is_config_error(&err));
        assert!(err.to_string().contains("t1"));
    }
}
