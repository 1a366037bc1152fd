//! Session level failures and their translation into SMTP replies.

use thiserror::Error;

use crate::{
    auth::AuthError,
    smtp::status::{EnhancedCode, Reply, Status},
};

/// Everything a session operation can fail with.
///
/// The `Display` text is for the log. What the client sees comes from
/// [`SessionError::reply`], which never carries upstream detail.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication required")]
    AuthRequired,

    #[error("already authenticated")]
    AlreadyAuthenticated,

    #[error("unsupported authentication mechanism: {0}")]
    UnknownMechanism(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("unexpected authentication response")]
    UnexpectedResponse,

    #[error("malformed authentication response")]
    MalformedResponse,

    #[error("no recipients specified")]
    NoRecipients,

    #[error("message exceeds {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("failed to read message data: {0}")]
    Read(#[from] std::io::Error),

    #[error("relay failed")]
    RelayFailure,
}

impl From<AuthError> for SessionError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Failed => Self::AuthFailed,
            AuthError::UnexpectedResponse => Self::UnexpectedResponse,
            AuthError::Malformed => Self::MalformedResponse,
            AuthError::UnknownMechanism(mechanism) => Self::UnknownMechanism(mechanism),
        }
    }
}

impl SessionError {
    #[must_use]
    pub fn reply(&self) -> Reply {
        match self {
            Self::AuthRequired => Reply::new(
                Status::AuthRequired,
                EnhancedCode(5, 7, 0),
                "Authentication required",
            ),
            Self::AlreadyAuthenticated => Reply::new(
                Status::InvalidCommandSequence,
                EnhancedCode(5, 5, 1),
                "Already authenticated",
            ),
            Self::UnknownMechanism(_) => Reply::new(
                Status::ParameterNotImplemented,
                EnhancedCode(5, 5, 4),
                "Unsupported authentication mechanism",
            ),
            Self::AuthFailed => Reply::new(
                Status::AuthFailed,
                EnhancedCode(5, 7, 8),
                "Authentication credentials invalid",
            ),
            Self::UnexpectedResponse => Reply::new(
                Status::ArgumentSyntax,
                EnhancedCode(5, 5, 2),
                "Unexpected authentication response",
            ),
            Self::MalformedResponse => Reply::new(
                Status::ArgumentSyntax,
                EnhancedCode(5, 5, 2),
                "Malformed authentication response",
            ),
            Self::NoRecipients => Reply::new(
                Status::InvalidCommandSequence,
                EnhancedCode(5, 5, 1),
                "No recipients specified",
            ),
            Self::MessageTooLarge { .. } => Reply::new(
                Status::ExceededStorage,
                EnhancedCode(5, 3, 4),
                "Message too large",
            ),
            Self::Read(_) => Reply::new(
                Status::ActionUnavailable,
                EnhancedCode(4, 3, 0),
                "Error reading message data",
            ),
            Self::RelayFailure => Reply::new(
                Status::ActionUnavailable,
                EnhancedCode(4, 0, 0),
                "Temporary relay error, try again later",
            ),
        }
    }

    /// Whether the client may retry the same operation unchanged.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Read(_) | Self::RelayFailure)
    }
}
