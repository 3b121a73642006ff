//! Multi-factor resolution.
//!
//! When the backend demands a second factor, the failed sign-in or reauth
//! surfaces as [`AuthError::MultiFactorRequired`] carrying a
//! [`MultiFactorResolver`]. The resolver holds the server's pending
//! credential and the enrolled factor hints; resolving it with an asserted
//! factor completes the interrupted operation.

use crate::auth::auth::Auth;
use crate::auth::user::User;
use crate::auth::{OperationType, UserCredential};
use crate::error::AuthError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One enrolled second factor, as hinted by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiFactorInfo {
    /// Server-side enrollment id.
    pub enrollment_id: String,
    /// User-visible label.
    pub display_name: Option<String>,
    /// Masked phone number for phone factors.
    pub phone_number: Option<String>,
    /// RFC 3339 enrollment time.
    pub enrolled_at: Option<String>,
}

/// Proof of a second factor, produced out of band.
#[derive(Debug, Clone)]
pub enum MultiFactorAssertion {
    /// Phone factor proven by an SMS code.
    Phone {
        /// Verification id from the SMS send.
        verification_id: String,
        /// The code the user received.
        code: String,
    },
}

impl MultiFactorAssertion {
    /// Phone assertion from a completed SMS verification.
    pub fn phone(verification_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Phone {
            verification_id: verification_id.into(),
            code: code.into(),
        }
    }
}

/// Which first-factor operation the second factor interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MfaOperation {
    SignIn,
    Reauthenticate,
}

struct ResolverInner {
    auth: Auth,
    // Set for reauthentication; the session must land on this user.
    originating_user: Option<User>,
    operation: MfaOperation,
    pending_credential: String,
    hints: Vec<MultiFactorInfo>,
    consumed: AtomicBool,
}

/// Continuation of a sign-in or reauth interrupted by a second-factor
/// challenge. Single-use; the pending credential is only valid for one
/// resolution.
#[derive(Clone)]
pub struct MultiFactorResolver {
    inner: Arc<ResolverInner>,
}

impl MultiFactorResolver {
    pub(crate) fn new(
        auth: Auth,
        originating_user: Option<User>,
        operation: MfaOperation,
        pending_credential: String,
        hints: Vec<MultiFactorInfo>,
    ) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                auth,
                originating_user,
                operation,
                pending_credential,
                hints,
                consumed: AtomicBool::new(false),
            }),
        }
    }

    /// Enrolled factors the user may assert.
    pub fn hints(&self) -> &[MultiFactorInfo] {
        &self.inner.hints
    }

    /// Complete the interrupted operation with an asserted second factor.
    pub async fn resolve_sign_in(
        &self,
        assertion: MultiFactorAssertion,
    ) -> Result<UserCredential, AuthError> {
        if self.inner.consumed.swap(true, Ordering::SeqCst) {
            return Err(AuthError::MfaSessionConsumed);
        }
        let MultiFactorAssertion::Phone {
            verification_id,
            code,
        } = &assertion;

        debug!(operation = ?self.inner.operation, "finalizing second factor");
        let resp = self
            .inner
            .auth
            .backend()
            .finalize_mfa_sign_in(&self.inner.pending_credential, verification_id, code)
            .await?
            .into_session()?;

        match self.inner.operation {
            MfaOperation::SignIn => {
                self.inner
                    .auth
                    .complete_sign_in(resp, OperationType::SignIn)
                    .await
            }
            MfaOperation::Reauthenticate => {
                let user = self
                    .inner
                    .originating_user
                    .as_ref()
                    .ok_or_else(|| AuthError::internal("reauth resolver lost its user"))?;
                user.finish_reauthentication(resp).await
            }
        }
    }
}

impl std::fmt::Debug for MultiFactorResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiFactorResolver")
            .field("operation", &self.inner.operation)
            .field("hints", &self.inner.hints)
            .field("pending_credential", &"<redacted>")
            .field("consumed", &self.inner.consumed.load(Ordering::SeqCst))
            .finish()
    }
}
