//! Error types for the identity SDK.
//!
//! # Design
//! Uses thiserror for ergonomic error definitions. Every public operation
//! resolves with a typed result or fails with exactly one of these
//! variants. The taxonomy splits five ways:
//!
//! 1. network errors: transient, retried by the proactive refresh
//!    scheduler, never invalidate the session;
//! 2. session-invalidating errors: the backend rejected the session
//!    itself (disabled account, expired refresh token); cached on the user
//!    so later calls fail fast;
//! 3. argument/validation errors: caller misuse, never retried;
//! 4. multi-factor-required: a resumable state carried by a resolver, not
//!    a terminal failure;
//! 5. internal errors: invariant violations that indicate a bug.

use crate::auth::multi_factor::{MultiFactorInfo, MultiFactorResolver};
use thiserror::Error;

/// Authentication errors.
///
/// Maps Identity Toolkit server error codes to Rust enum variants via
/// [`AuthError::from_server_code`].
#[derive(Debug, Error, Clone)]
pub enum AuthError {
    /// Email address is malformed or missing.
    #[error("Invalid email address")]
    InvalidEmail,

    /// Password does not meet strength requirements.
    #[error("Weak password")]
    WeakPassword,

    /// Wrong password for the given account.
    #[error("Invalid password")]
    InvalidPassword,

    /// No account matches the supplied identifier.
    #[error("User not found")]
    UserNotFound,

    /// The account has been disabled by an administrator.
    #[error("User account disabled")]
    UserDisabled,

    /// Too many failed attempts; the backend is throttling.
    #[error("Too many requests, try again later")]
    TooManyRequests,

    /// The sign-in method is disabled for this project.
    #[error("Operation not allowed")]
    OperationNotAllowed,

    /// Email already in use by another account.
    #[error("Email already in use")]
    EmailAlreadyInUse,

    /// The credential is already associated with a different account.
    #[error("Credential already in use")]
    CredentialAlreadyInUse,

    /// The user already has a linked provider with this id.
    #[error("Provider already linked to user")]
    ProviderAlreadyLinked,

    /// No linked provider with this id exists on the user.
    #[error("No such provider")]
    NoSuchProvider,

    /// The supplied credential is malformed or unusable for this operation.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// The refresh token was rejected server-side. Session-invalidating.
    #[error("User token expired")]
    UserTokenExpired,

    /// The access token was rejected server-side. Session-invalidating.
    #[error("Invalid user token")]
    InvalidUserToken,

    /// A token pair update arrived without the refresh half.
    #[error("Missing refresh token")]
    MissingRefreshToken,

    /// Transport-level failure or timeout. Transient and retryable.
    #[error("Network request failed: {0}")]
    NetworkRequestFailed(String),

    /// The user passed to `update_current_user` belongs to another
    /// project, or an MFA continuation resolved to a different uid.
    #[error("User mismatch")]
    UserMismatch,

    /// The user's tenant id differs from the coordinator's.
    #[error("Tenant ID mismatch")]
    TenantIdMismatch,

    /// The backend demands a second factor. Raw wire-level form; the
    /// session coordinator translates it into
    /// [`AuthError::MultiFactorRequired`] before it reaches callers.
    #[error("Second factor required")]
    SecondFactorRequired {
        /// Opaque pending credential to finish the flow with.
        pending_credential: String,
        /// Enrolled second factors the caller may choose from.
        hints: Vec<MultiFactorInfo>,
    },

    /// The backend demands a second factor; resume through the resolver.
    #[error("Multi-factor authentication required")]
    MultiFactorRequired(MultiFactorResolver),

    /// The multi-factor continuation was already consumed.
    #[error("Multi-factor session already consumed")]
    MfaSessionConsumed,

    /// The object this operation was issued against has been destroyed.
    /// All pending and future operations on it fail with this error.
    #[error("Module destroyed")]
    ModuleDestroyed,

    /// Invariant violation. A bug, not a user-correctable condition.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Server error code with no dedicated variant.
    #[error("Server error: {0}")]
    ServerError(String),
}

impl AuthError {
    /// Create an internal error from a string.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this is a transient transport failure the scheduler may
    /// retry with backoff.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::NetworkRequestFailed(_))
    }

    /// Whether this error invalidates the whole session. Once one of
    /// these is observed, the user caches it and every subsequent
    /// operation fails fast with the same error.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Self::UserDisabled | Self::UserTokenExpired | Self::InvalidUserToken
        )
    }

    /// Create from an Identity Toolkit REST error code.
    pub fn from_server_code(code: &str) -> Self {
        // Some codes arrive with a trailing explanation,
        // e.g. "WEAK_PASSWORD : Password should be at least 6 characters".
        let code = code.split(':').next().unwrap_or(code).trim();
        match code {
            "EMAIL_NOT_FOUND" | "USER_NOT_FOUND" => Self::UserNotFound,
            "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" => Self::InvalidPassword,
            "USER_DISABLED" => Self::UserDisabled,
            "TOO_MANY_ATTEMPTS_TRY_LATER" => Self::TooManyRequests,
            "EMAIL_EXISTS" => Self::EmailAlreadyInUse,
            "CREDENTIAL_TOO_OLD_LOGIN_AGAIN" => {
                Self::InvalidCredential("credential too old, sign in again".to_string())
            }
            "OPERATION_NOT_ALLOWED" | "PASSWORD_LOGIN_DISABLED" => Self::OperationNotAllowed,
            "INVALID_EMAIL" => Self::InvalidEmail,
            "WEAK_PASSWORD" => Self::WeakPassword,
            "INVALID_IDP_RESPONSE" | "INVALID_PENDING_TOKEN" => {
                Self::InvalidCredential("invalid provider response".to_string())
            }
            "FEDERATED_USER_ID_ALREADY_LINKED" => Self::CredentialAlreadyInUse,
            "INVALID_ID_TOKEN" => Self::InvalidUserToken,
            "TOKEN_EXPIRED" | "INVALID_REFRESH_TOKEN" => Self::UserTokenExpired,
            "MISSING_REFRESH_TOKEN" => Self::MissingRefreshToken,
            "INVALID_CODE" | "INVALID_SESSION_INFO" => {
                Self::InvalidCredential("invalid verification code".to_string())
            }
            other => Self::ServerError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        Self::NetworkRequestFailed(err.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failure: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_server_code() {
        assert!(matches!(
            AuthError::from_server_code("EMAIL_NOT_FOUND"),
            AuthError::UserNotFound
        ));
        assert!(matches!(
            AuthError::from_server_code("INVALID_PASSWORD"),
            AuthError::InvalidPassword
        ));
        assert!(matches!(
            AuthError::from_server_code("TOKEN_EXPIRED"),
            AuthError::UserTokenExpired
        ));
        assert!(matches!(
            AuthError::from_server_code("SOMETHING_ELSE"),
            AuthError::ServerError(_)
        ));
    }

    #[test]
    fn test_from_server_code_with_trailing_message() {
        assert!(matches!(
            AuthError::from_server_code(
                "WEAK_PASSWORD : Password should be at least 6 characters"
            ),
            AuthError::WeakPassword
        ));
    }

    #[test]
    fn test_network_classification() {
        assert!(AuthError::NetworkRequestFailed("timeout".to_string()).is_network());
        assert!(!AuthError::UserDisabled.is_network());
    }

    #[test]
    fn test_session_invalidation_classification() {
        assert!(AuthError::UserDisabled.invalidates_session());
        assert!(AuthError::UserTokenExpired.invalidates_session());
        assert!(AuthError::InvalidUserToken.invalidates_session());
        assert!(!AuthError::NetworkRequestFailed("x".to_string()).invalidates_session());
        assert!(!AuthError::InvalidEmail.invalidates_session());
    }

    #[test]
    fn test_error_display() {
        let err = AuthError::ProviderAlreadyLinked;
        assert!(format!("{err}").contains("already linked"));
    }
}
