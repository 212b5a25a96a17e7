use thiserror::Error;

use tandem_types::events::{ErrorKind, ServerEvent};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Authentication failed")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Store unavailable: {0}")]
    Store(#[from] anyhow::Error),
}

impl ChatError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Failed acknowledgment for the client command `event`.
    pub fn to_event(&self, event: &str) -> ServerEvent {
        let (kind, reason) = match self {
            Self::Unauthorized => (ErrorKind::Unauthorized, self.to_string()),
            Self::Validation(reason) => (ErrorKind::Validation, reason.clone()),
            // Store internals stay in the server log.
            Self::Store(_) => (ErrorKind::StoreUnavailable, "Store unavailable".to_string()),
        };

        ServerEvent::Error {
            event: event.to_string(),
            kind,
            reason,
        }
    }
}
