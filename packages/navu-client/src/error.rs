use thiserror::Error;

#[derive(Debug, Error)]
pub enum NavuError {
    /// No session token was configured for the client.
    #[error("session token must be provided for sessionId authentication")]
    MissingSession,

    /// The entity id is not present in the metadata catalog.
    #[error("entity '{entity}' not found in Navusoft metadata")]
    EntityNotFound { entity: String },

    /// The entity exists but declares no fields.
    #[error("no columns found for entity '{entity}'")]
    NoColumnsDefined { entity: String },

    /// The server did not answer within the read timeout.
    ///
    /// Raised per attempt while retrying; once retries are exhausted it is
    /// returned to the caller with the total attempt count.
    #[error("read timeout fetching '{entity}' after {attempts} attempt(s)")]
    ReadTimeout { entity: String, attempts: u32 },

    /// Non-success HTTP status. Never retried.
    #[error("Navusoft API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Filter could not be expressed safely.
    #[error("invalid filter: {reason}")]
    InvalidFilter { reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl NavuError {
    pub fn is_read_timeout(&self) -> bool {
        matches!(self, NavuError::ReadTimeout { .. })
    }

    /// Metadata errors only affect auto-resolved column lists.
    pub fn is_metadata(&self) -> bool {
        matches!(
            self,
            NavuError::EntityNotFound { .. } | NavuError::NoColumnsDefined { .. }
        )
    }

    /// HTTP status code, if the server answered with one.
    pub fn status(&self) -> Option<u16> {
        match self {
            NavuError::Api { status, .. } => Some(*status),
            NavuError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Classify a transport error for `entity`.
    ///
    /// Connect timeouts are reported as plain HTTP errors so they are not
    /// retried; only timeouts on an established request count as read timeouts.
    pub(crate) fn from_transport(entity: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() && !err.is_connect() {
            NavuError::ReadTimeout {
                entity: entity.to_string(),
                attempts: 1,
            }
        } else {
            NavuError::Http(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, NavuError>;
