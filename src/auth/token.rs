//! Token pair manager.
//!
//! Owns the short-lived access token / long-lived refresh token pair for
//! one user, the expiry clock, and the single coalesced refresh exchange.
//! Persistence and listener notification are the caller's job; this type
//! only mutates its own state.

use crate::backend::{Backend, IdTokenResponse, TokenApiResponse};
use crate::error::AuthError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Tokens within this margin of their expiration time are treated as
/// already expired, so callers never hand out a token that dies mid-use.
pub(crate) const TOKEN_EXPIRED_MARGIN_MS: i64 = 30_000;

/// The serializable token pair. Field names are a compatibility surface;
/// records written by older versions must keep deserializing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenPair {
    /// Long-lived refresh token.
    pub refresh_token: Option<String>,
    /// Short-lived access token (JWT).
    pub access_token: Option<String>,
    /// Absolute expiry of the access token, epoch millis.
    pub expiration_time: Option<i64>,
}

impl TokenPair {
    /// Invariant: never hold an access token without the means to renew
    /// it. Checked after every mutation path.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.access_token.is_some() && self.refresh_token.is_none() {
            return Err(AuthError::internal(
                "access token present without refresh token",
            ));
        }
        Ok(())
    }

    /// Whether the access token is within the safety margin of expiry.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.expiration_time {
            Some(expiration) => now_ms > expiration - TOKEN_EXPIRED_MARGIN_MS,
            None => true,
        }
    }
}

/// Owns one user's token pair and serializes its refresh exchanges.
pub(crate) struct TokenManager {
    state: RwLock<TokenPair>,
    // Guards the network exchange; waiters coalesce onto the winner's
    // result via the generation check.
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
}

impl TokenManager {
    pub(crate) fn new(pair: TokenPair) -> Result<Self, AuthError> {
        pair.validate()?;
        Ok(Self {
            state: RwLock::new(pair),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    // The lock only guards plain data writes, so a poisoned lock still
    // holds a consistent pair and can be recovered.
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, TokenPair> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, TokenPair> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn pair(&self) -> TokenPair {
        self.read_state().clone()
    }

    pub(crate) fn expiration_time(&self) -> Option<i64> {
        self.read_state().expiration_time
    }

    /// Replace the pair wholesale (deserialization, cross-tab sync).
    pub(crate) fn assign(&self, pair: TokenPair) -> Result<(), AuthError> {
        pair.validate()?;
        *self.write_state() = pair;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Populate from a sign-in/link/reauth response. Returns whether the
    /// access token actually changed.
    pub(crate) fn update_from_response(
        &self,
        resp: &IdTokenResponse,
        now_ms: i64,
    ) -> Result<bool, AuthError> {
        let (Some(id_token), Some(refresh_token)) = (&resp.id_token, &resp.refresh_token) else {
            return Err(AuthError::internal(
                "token response missing required fields",
            ));
        };
        self.install(
            id_token.clone(),
            refresh_token.clone(),
            resp.expires_in.as_deref(),
            now_ms,
        )
    }

    fn update_from_token_api(
        &self,
        resp: &TokenApiResponse,
        now_ms: i64,
    ) -> Result<bool, AuthError> {
        self.install(
            resp.id_token.clone(),
            resp.refresh_token.clone(),
            resp.expires_in.as_deref(),
            now_ms,
        )
    }

    fn install(
        &self,
        access_token: String,
        refresh_token: String,
        expires_in: Option<&str>,
        now_ms: i64,
    ) -> Result<bool, AuthError> {
        // Prefer the explicit expiresIn; fall back to the JWT's own
        // iat/exp claims when the response omits it.
        let lifetime_ms = match expires_in {
            Some(seconds) => seconds
                .parse::<i64>()
                .map(|s| s * 1000)
                .map_err(|_| AuthError::internal("malformed expiresIn in token response"))?,
            None => lifetime_from_jwt(&access_token).ok_or_else(|| {
                AuthError::internal("token response lacks expiresIn and decodable claims")
            })?,
        };

        let mut state = self.write_state();
        let changed = state.access_token.as_deref() != Some(access_token.as_str());
        state.access_token = Some(access_token);
        state.refresh_token = Some(refresh_token);
        state.expiration_time = Some(now_ms + lifetime_ms);
        state.validate()?;
        drop(state);

        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(changed)
    }

    /// Get a fresh access token.
    ///
    /// Returns `Ok(None)` when there is no session at all (no tokens).
    /// Concurrent callers coalesce onto one in-flight refresh exchange:
    /// whoever wins the lock performs the network call, everyone else
    /// observes the bumped generation and returns the new token without a
    /// second request.
    pub(crate) async fn get_token(
        &self,
        backend: &dyn Backend,
        force_refresh: bool,
        now_ms: i64,
    ) -> Result<Option<String>, AuthError> {
        let observed_generation = self.generation.load(Ordering::SeqCst);
        {
            let state = self.read_state();
            state.validate()?;
            if state.access_token.is_none() && state.refresh_token.is_none() {
                return Ok(None);
            }
            if !force_refresh && !state.is_expired(now_ms) {
                return Ok(state.access_token.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != observed_generation {
            // A concurrent caller already refreshed; coalesce onto its
            // result even when we were asked to force.
            let state = self.read_state();
            if !state.is_expired(now_ms) {
                return Ok(state.access_token.clone());
            }
        }

        let refresh_token = {
            let state = self.read_state();
            match &state.refresh_token {
                Some(token) => token.clone(),
                None => return Ok(None),
            }
        };

        debug!("exchanging refresh token for a new access token");
        let resp = backend.refresh_token(&refresh_token).await.map_err(|err| {
            if err.invalidates_session() {
                warn!(%err, "refresh token rejected by backend");
            }
            err
        })?;
        self.update_from_token_api(&resp, now_ms)?;

        Ok(self.read_state().access_token.clone())
    }
}

/// Derive the token lifetime from the JWT's embedded issued-at and expiry
/// claims.
fn lifetime_from_jwt(token: &str) -> Option<i64> {
    #[derive(Deserialize)]
    struct Claims {
        iat: i64,
        exp: i64,
    }
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    (claims.exp > claims.iat).then(|| (claims.exp - claims.iat) * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Mock JWT with iat/exp claims, signature irrelevant.
    fn mock_jwt(lifetime_secs: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let iat = now_ms() / 1000;
        let claims = format!(r#"{{"iat":{},"exp":{}}}"#, iat, iat + lifetime_secs);
        let payload = URL_SAFE_NO_PAD.encode(claims.as_bytes());
        format!("{header}.{payload}.sig")
    }

    struct CountingBackend {
        calls: AtomicUsize,
        fail_with: Option<AuthError>,
    }

    impl CountingBackend {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl Backend for CountingBackend {
        async fn refresh_token(
            &self,
            _refresh_token: &str,
        ) -> Result<TokenApiResponse, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent callers pile up on the refresh lock.
            tokio::task::yield_now().await;
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            Ok(TokenApiResponse {
                id_token: "new-access".to_string(),
                refresh_token: "new-refresh".to_string(),
                expires_in: Some("3600".to_string()),
            })
        }

        async fn sign_up(
            &self,
            _email: Option<&str>,
            _password: Option<&str>,
            _tenant_id: Option<&str>,
        ) -> Result<IdTokenResponse, AuthError> {
            unimplemented!()
        }
        async fn sign_in_with_password(
            &self,
            _email: &str,
            _password: &str,
            _tenant_id: Option<&str>,
        ) -> Result<IdTokenResponse, AuthError> {
            unimplemented!()
        }
        async fn sign_in_with_idp(
            &self,
            _req: crate::backend::IdpRequest,
        ) -> Result<IdTokenResponse, AuthError> {
            unimplemented!()
        }
        async fn sign_in_with_custom_token(
            &self,
            _token: &str,
        ) -> Result<IdTokenResponse, AuthError> {
            unimplemented!()
        }
        async fn sign_in_with_phone_number(
            &self,
            _verification_id: &str,
            _code: &str,
            _id_token: Option<&str>,
        ) -> Result<IdTokenResponse, AuthError> {
            unimplemented!()
        }
        async fn get_account_info(
            &self,
            _id_token: &str,
        ) -> Result<crate::backend::AccountInfo, AuthError> {
            unimplemented!()
        }
        async fn set_account_info(
            &self,
            _req: crate::backend::SetAccountInfoRequest,
        ) -> Result<crate::backend::SetAccountInfoResponse, AuthError> {
            unimplemented!()
        }
        async fn delete_account(&self, _id_token: &str) -> Result<(), AuthError> {
            unimplemented!()
        }
        async fn send_oob_code(
            &self,
            _request_type: crate::backend::OobRequestType,
            _email: Option<&str>,
            _id_token: Option<&str>,
        ) -> Result<(), AuthError> {
            unimplemented!()
        }
        async fn send_verification_code(
            &self,
            _phone_number: &str,
            _recaptcha_token: &str,
        ) -> Result<String, AuthError> {
            unimplemented!()
        }
        async fn finalize_mfa_sign_in(
            &self,
            _mfa_pending_credential: &str,
            _verification_id: &str,
            _code: &str,
        ) -> Result<IdTokenResponse, AuthError> {
            unimplemented!()
        }
    }

    fn fresh_pair() -> TokenPair {
        TokenPair {
            refresh_token: Some("refresh".to_string()),
            access_token: Some("access".to_string()),
            expiration_time: Some(now_ms() + 3_600_000),
        }
    }

    fn expired_pair() -> TokenPair {
        TokenPair {
            refresh_token: Some("refresh".to_string()),
            access_token: Some("stale".to_string()),
            expiration_time: Some(now_ms() - 1),
        }
    }

    #[test]
    fn test_invariant_rejects_orphan_access_token() {
        let pair = TokenPair {
            refresh_token: None,
            access_token: Some("access".to_string()),
            expiration_time: None,
        };
        assert!(pair.validate().is_err());
        assert!(TokenManager::new(pair).is_err());
    }

    #[test]
    fn test_invariant_holds_after_every_mutation() {
        let manager = TokenManager::new(TokenPair::default()).unwrap();

        let resp = IdTokenResponse {
            id_token: Some(mock_jwt(3600)),
            refresh_token: Some("r".to_string()),
            expires_in: Some("3600".to_string()),
            ..Default::default()
        };
        manager.update_from_response(&resp, now_ms()).unwrap();
        assert!(manager.pair().validate().is_ok());

        manager.assign(fresh_pair()).unwrap();
        assert!(manager.pair().validate().is_ok());
        assert!(manager
            .assign(TokenPair {
                access_token: Some("a".to_string()),
                refresh_token: None,
                expiration_time: None,
            })
            .is_err());

        let json = serde_json::to_value(manager.pair()).unwrap();
        let back: TokenPair = serde_json::from_value(json).unwrap();
        assert!(back.validate().is_ok());
    }

    #[test]
    fn test_expiry_margin() {
        let now = now_ms();
        let pair = TokenPair {
            refresh_token: Some("r".to_string()),
            access_token: Some("a".to_string()),
            expiration_time: Some(now + TOKEN_EXPIRED_MARGIN_MS - 1),
        };
        assert!(pair.is_expired(now));
        let pair = TokenPair {
            expiration_time: Some(now + TOKEN_EXPIRED_MARGIN_MS + 1000),
            ..pair
        };
        assert!(!pair.is_expired(now));
    }

    #[test]
    fn test_missing_response_fields_is_internal_error() {
        let manager = TokenManager::new(TokenPair::default()).unwrap();
        let resp = IdTokenResponse {
            id_token: Some("jwt".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            manager.update_from_response(&resp, now_ms()),
            Err(AuthError::Internal(_))
        ));
    }

    #[test]
    fn test_expiration_falls_back_to_jwt_claims() {
        let manager = TokenManager::new(TokenPair::default()).unwrap();
        let now = now_ms();
        let resp = IdTokenResponse {
            id_token: Some(mock_jwt(1800)),
            refresh_token: Some("r".to_string()),
            expires_in: None,
            ..Default::default()
        };
        manager.update_from_response(&resp, now).unwrap();
        assert_eq!(manager.expiration_time(), Some(now + 1_800_000));
    }

    #[tokio::test]
    async fn test_fresh_token_needs_no_network() {
        let backend = CountingBackend::new();
        let manager = TokenManager::new(fresh_pair()).unwrap();

        let t1 = manager.get_token(&backend, false, now_ms()).await.unwrap();
        let t2 = manager.get_token(&backend, false, now_ms()).await.unwrap();
        assert_eq!(t1.as_deref(), Some("access"));
        assert_eq!(t2.as_deref(), Some("access"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_session_returns_none() {
        let backend = CountingBackend::new();
        let manager = TokenManager::new(TokenPair::default()).unwrap();
        let token = manager.get_token(&backend, true, now_ms()).await.unwrap();
        assert!(token.is_none());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_coalesce() {
        let backend = Arc::new(CountingBackend::new());
        let manager = Arc::new(TokenManager::new(expired_pair()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let backend = Arc::clone(&backend);
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager
                    .get_token(backend.as_ref(), false, now_ms())
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().as_deref(), Some("new-access"));
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_rotates_refresh_token() {
        let backend = CountingBackend::new();
        let manager = TokenManager::new(expired_pair()).unwrap();
        manager.get_token(&backend, false, now_ms()).await.unwrap();
        let pair = manager.pair();
        assert_eq!(pair.refresh_token.as_deref(), Some("new-refresh"));
        assert!(!pair.is_expired(now_ms()));
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_fatal() {
        let backend = CountingBackend {
            calls: AtomicUsize::new(0),
            fail_with: Some(AuthError::UserTokenExpired),
        };
        let manager = TokenManager::new(expired_pair()).unwrap();
        let err = manager
            .get_token(&backend, false, now_ms())
            .await
            .unwrap_err();
        assert!(err.invalidates_session());
    }
}
