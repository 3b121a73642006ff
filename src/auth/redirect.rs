//! Redirect flow hooks.
//!
//! Full-page redirect sign-in is inherently host-specific, so the
//! coordinator only knows the [`RedirectResolver`] seam: an embedder
//! supplies one, and the coordinator calls back into it during
//! initialization to finish any sign-in that was pending when the process
//! went away.

use crate::auth::auth::Auth;
use crate::backend::IdTokenResponse;
use crate::error::AuthError;
use async_trait::async_trait;
use uuid::Uuid;

/// Host-side half of the redirect sign-in flow.
#[async_trait]
pub trait RedirectResolver: Send + Sync {
    /// Called once while the coordinator initializes, before any pending
    /// redirect is completed.
    async fn initialize(&self, auth: &Auth) -> Result<(), AuthError>;

    /// Finish a redirect sign-in that concluded while the app was away.
    /// Returns `Ok(None)` when nothing was pending.
    async fn complete_redirect(&self, auth: &Auth) -> Result<Option<IdTokenResponse>, AuthError>;
}

/// Fresh event id tying a stored user record to the redirect operation
/// that produced it.
pub(crate) fn new_redirect_event_id() -> String {
    Uuid::new_v4().to_string()
}
