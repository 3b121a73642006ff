//! The signed-in user aggregate.
//!
//! A [`User`] is a cheap clone handle over shared state: immutable uid,
//! mutable profile, the token manager and the proactive refresh scheduler.
//! All mutation goes through methods here so the persisted record, the
//! listener channels and the scheduler stay consistent with each other.

use crate::auth::auth::{Auth, AuthInner};
use crate::auth::credential::AuthCredential;
use crate::auth::multi_factor::{MfaOperation, MultiFactorInfo};
use crate::auth::proactive_refresh::{ProactiveRefresh, RefreshTarget};
use crate::auth::token::{TokenManager, TokenPair};
use crate::auth::{AdditionalUserInfo, OperationType, UserCredential};
use crate::backend::{
    AccountInfo, Backend, IdTokenResponse, ProviderUserInfoWire, SetAccountInfoRequest,
};
use crate::error::AuthError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::watch;
use tracing::debug;
use async_trait::async_trait;

/// Profile of one linked provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderData {
    /// Provider id, e.g. "password" or "google.com".
    pub provider_id: String,
    /// Uid within the provider.
    pub uid: String,
    /// Display name from the provider.
    pub display_name: Option<String>,
    /// Photo URL from the provider.
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    /// Email from the provider.
    pub email: Option<String>,
    /// Phone number from the provider.
    pub phone_number: Option<String>,
}

impl Default for ProviderData {
    fn default() -> Self {
        Self {
            provider_id: String::new(),
            uid: String::new(),
            display_name: None,
            photo_url: None,
            email: None,
            phone_number: None,
        }
    }
}

impl From<ProviderUserInfoWire> for ProviderData {
    fn from(wire: ProviderUserInfoWire) -> Self {
        Self {
            uid: wire.raw_id.unwrap_or_default(),
            provider_id: wire.provider_id,
            display_name: wire.display_name,
            photo_url: wire.photo_url,
            email: wire.email,
            phone_number: wire.phone_number,
        }
    }
}

/// Account timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserMetadata {
    /// Account creation, epoch millis as a decimal string.
    pub creation_time: Option<String>,
    /// Last sign-in, epoch millis as a decimal string.
    pub last_sign_in_time: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Profile {
    email: Option<String>,
    email_verified: bool,
    display_name: Option<String>,
    photo_url: Option<String>,
    phone_number: Option<String>,
    is_anonymous: bool,
    tenant_id: Option<String>,
    created_at: Option<String>,
    last_login_at: Option<String>,
    provider_data: Vec<ProviderData>,
    mfa_enrollments: Vec<MultiFactorInfo>,
    redirect_event_id: Option<String>,
}

impl Profile {
    fn apply_account_info(&mut self, info: AccountInfo) {
        self.email = info.email;
        self.email_verified = info.email_verified;
        self.display_name = info.display_name;
        self.photo_url = info.photo_url;
        self.phone_number = info.phone_number;
        self.created_at = info.created_at;
        self.last_login_at = info.last_login_at;
        self.provider_data = info
            .provider_user_info
            .into_iter()
            .map(ProviderData::from)
            .collect();
        self.mfa_enrollments = info.mfa_info.into_iter().map(Into::into).collect();
        if !self.provider_data.is_empty() || self.email.is_some() {
            self.is_anonymous = false;
        }
    }
}

/// The wire form of a stored user record. Field names are a compatibility
/// surface shared with other SDKs writing the same storage keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct PersistedUser {
    pub uid: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub display_name: Option<String>,
    #[serde(rename = "photoURL")]
    pub photo_url: Option<String>,
    pub phone_number: Option<String>,
    pub is_anonymous: bool,
    pub tenant_id: Option<String>,
    pub provider_data: Vec<ProviderData>,
    pub sts_token_manager: TokenPair,
    pub created_at: Option<String>,
    pub last_login_at: Option<String>,
    #[serde(rename = "_redirectEventId")]
    pub redirect_event_id: Option<String>,
}

pub(crate) struct UserInner {
    uid: String,
    profile: RwLock<Profile>,
    tokens: TokenManager,
    backend: Arc<dyn Backend>,
    auth: Weak<AuthInner>,
    weak_self: Weak<UserInner>,
    proactive: ProactiveRefresh,
    // Bumped on every token pair change so the scheduler realigns.
    generation_tx: watch::Sender<u64>,
    // Last access token surfaced through notifications, to dedupe them.
    last_notified_token: Mutex<Option<String>>,
    // First fatal error seen; replayed to all later callers.
    invalidation: Mutex<Option<AuthError>>,
    destroyed: AtomicBool,
    destroy_tx: watch::Sender<bool>,
}

impl UserInner {
    fn read_profile(&self) -> std::sync::RwLockReadGuard<'_, Profile> {
        self.profile
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_profile(&self) -> std::sync::RwLockWriteGuard<'_, Profile> {
        self.profile
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl RefreshTarget for UserInner {
    fn expiration_time(&self) -> Option<i64> {
        self.tokens.expiration_time()
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let Some(inner) = self.weak_self.upgrade() else {
            return Err(AuthError::ModuleDestroyed);
        };
        User { inner }.get_id_token(true).await.map(|_| ())
    }

    fn token_changes(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }
}

/// A signed-in account. Clones share state.
#[derive(Clone)]
pub struct User {
    pub(crate) inner: Arc<UserInner>,
}

impl User {
    fn build(
        uid: String,
        profile: Profile,
        tokens: TokenManager,
        backend: Arc<dyn Backend>,
        auth: Weak<AuthInner>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<UserInner>| UserInner {
            uid,
            profile: RwLock::new(profile),
            tokens,
            backend,
            auth,
            weak_self: weak.clone(),
            proactive: ProactiveRefresh::new(weak.clone() as Weak<dyn RefreshTarget>),
            generation_tx: watch::channel(0).0,
            last_notified_token: Mutex::new(None),
            invalidation: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            destroy_tx: watch::channel(false).0,
        });
        Self { inner }
    }

    /// Create a user from a fresh session response. The profile is bare
    /// until the first reload.
    pub(crate) fn from_response(
        auth: Weak<AuthInner>,
        backend: Arc<dyn Backend>,
        resp: &IdTokenResponse,
        is_anonymous: bool,
    ) -> Result<Self, AuthError> {
        let uid = resp
            .local_id
            .clone()
            .ok_or_else(|| AuthError::internal("session response missing localId"))?;
        let tokens = TokenManager::new(TokenPair::default())?;
        tokens.update_from_response(resp, chrono::Utc::now().timestamp_millis())?;
        let profile = Profile {
            email: resp.email.clone(),
            display_name: resp.display_name.clone(),
            is_anonymous,
            ..Profile::default()
        };
        Ok(Self::build(uid, profile, tokens, backend, auth))
    }

    /// Rebuild a user from a stored record.
    pub(crate) fn from_record(
        auth: Weak<AuthInner>,
        backend: Arc<dyn Backend>,
        record: &serde_json::Value,
    ) -> Result<Self, AuthError> {
        let persisted: PersistedUser = serde_json::from_value(record.clone())?;
        if persisted.uid.is_empty() {
            return Err(AuthError::internal("stored user record missing uid"));
        }
        let tokens = TokenManager::new(persisted.sts_token_manager)?;
        let profile = Profile {
            email: persisted.email,
            email_verified: persisted.email_verified,
            display_name: persisted.display_name,
            photo_url: persisted.photo_url,
            phone_number: persisted.phone_number,
            is_anonymous: persisted.is_anonymous,
            tenant_id: persisted.tenant_id,
            created_at: persisted.created_at,
            last_login_at: persisted.last_login_at,
            provider_data: persisted.provider_data,
            mfa_enrollments: Vec::new(),
            redirect_event_id: persisted.redirect_event_id,
        };
        Ok(Self::build(persisted.uid, profile, tokens, backend, auth))
    }

    /// Serialize to the stored record form. Round-trips through
    /// [`from_record`](Self::from_record) without loss.
    pub(crate) fn to_record(&self) -> serde_json::Value {
        let profile = self.inner.read_profile();
        let persisted = PersistedUser {
            uid: self.inner.uid.clone(),
            email: profile.email.clone(),
            email_verified: profile.email_verified,
            display_name: profile.display_name.clone(),
            photo_url: profile.photo_url.clone(),
            phone_number: profile.phone_number.clone(),
            is_anonymous: profile.is_anonymous,
            tenant_id: profile.tenant_id.clone(),
            provider_data: profile.provider_data.clone(),
            sts_token_manager: self.inner.tokens.pair(),
            created_at: profile.created_at.clone(),
            last_login_at: profile.last_login_at.clone(),
            redirect_event_id: profile.redirect_event_id.clone(),
        };
        serde_json::to_value(persisted).unwrap_or(serde_json::Value::Null)
    }

    // ---- Read accessors ----

    /// Stable user id.
    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    /// Account email.
    pub fn email(&self) -> Option<String> {
        self.inner.read_profile().email.clone()
    }

    /// Whether the email has been verified.
    pub fn email_verified(&self) -> bool {
        self.inner.read_profile().email_verified
    }

    /// Display name.
    pub fn display_name(&self) -> Option<String> {
        self.inner.read_profile().display_name.clone()
    }

    /// Photo URL.
    pub fn photo_url(&self) -> Option<String> {
        self.inner.read_profile().photo_url.clone()
    }

    /// Phone number.
    pub fn phone_number(&self) -> Option<String> {
        self.inner.read_profile().phone_number.clone()
    }

    /// Whether this account was created anonymously and never upgraded.
    pub fn is_anonymous(&self) -> bool {
        self.inner.read_profile().is_anonymous
    }

    /// Tenant id, for multi-tenant projects.
    pub fn tenant_id(&self) -> Option<String> {
        self.inner.read_profile().tenant_id.clone()
    }

    /// Linked provider profiles.
    pub fn provider_data(&self) -> Vec<ProviderData> {
        self.inner.read_profile().provider_data.clone()
    }

    /// Enrolled second factors.
    pub fn multi_factor_info(&self) -> Vec<MultiFactorInfo> {
        self.inner.read_profile().mfa_enrollments.clone()
    }

    /// Account timestamps.
    pub fn metadata(&self) -> UserMetadata {
        let profile = self.inner.read_profile();
        UserMetadata {
            creation_time: profile.created_at.clone(),
            last_sign_in_time: profile.last_login_at.clone(),
        }
    }

    pub(crate) fn redirect_event_id(&self) -> Option<String> {
        self.inner.read_profile().redirect_event_id.clone()
    }

    pub(crate) fn set_redirect_event_id(&self, event_id: Option<String>) {
        self.inner.write_profile().redirect_event_id = event_id;
    }

    fn auth(&self) -> Option<Auth> {
        self.inner.auth.upgrade().map(Auth::from_inner)
    }

    fn tenant(&self) -> Option<String> {
        self.inner.read_profile().tenant_id.clone()
    }

    // ---- Lifecycle ----

    fn assert_alive(&self) -> Result<(), AuthError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(AuthError::ModuleDestroyed);
        }
        if let Some(err) = self
            .inner
            .invalidation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
        {
            return Err(err);
        }
        Ok(())
    }

    /// Race an in-flight operation against teardown so callers are not
    /// left hanging on a user that was signed out mid-call.
    async fn race_destroy<T, F>(&self, fut: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, AuthError>>,
    {
        let mut destroy_rx = self.inner.destroy_tx.subscribe();
        if *destroy_rx.borrow() {
            return Err(AuthError::ModuleDestroyed);
        }
        tokio::select! {
            result = fut => result,
            _ = destroy_rx.wait_for(|destroyed| *destroyed) => Err(AuthError::ModuleDestroyed),
        }
    }

    fn note_fatal(&self, err: &AuthError) {
        if !err.invalidates_session() {
            return;
        }
        let first = {
            let mut slot = self
                .inner
                .invalidation
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(err.clone());
                true
            } else {
                false
            }
        };
        // The coordinator hears about an invalidation exactly once.
        if first {
            if let Some(auth) = self.auth() {
                auth.user_invalidated(self);
            }
        }
    }

    /// Tear the user down: in-flight and future operations fail with
    /// [`AuthError::ModuleDestroyed`], the scheduler stops.
    pub(crate) fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(uid = %self.inner.uid, "destroying user");
        self.inner.proactive.stop();
        let _ = self.inner.destroy_tx.send(true);
    }

    pub(crate) fn start_proactive_refresh(&self) {
        self.inner.proactive.start();
    }

    pub(crate) fn stop_proactive_refresh(&self) {
        self.inner.proactive.stop();
    }

    // ---- Tokens ----

    /// Get a valid access token, refreshing it first if it is expired or
    /// `force_refresh` is set. Concurrent calls share one refresh.
    pub async fn get_id_token(&self, force_refresh: bool) -> Result<String, AuthError> {
        self.assert_alive()?;
        let now = chrono::Utc::now().timestamp_millis();
        let result = self
            .race_destroy(
                self.inner
                    .tokens
                    .get_token(self.inner.backend.as_ref(), force_refresh, now),
            )
            .await;
        match result {
            Ok(Some(token)) => {
                self.after_token_update(&token);
                Ok(token)
            }
            Ok(None) => Err(AuthError::internal("user has no token pair")),
            Err(err) => {
                self.note_fatal(&err);
                Err(err)
            }
        }
    }

    /// Record a token change exactly once: realign the scheduler and let
    /// the coordinator persist and notify.
    fn after_token_update(&self, token: &str) {
        let changed = {
            let mut last = self
                .inner
                .last_notified_token
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if last.as_deref() == Some(token) {
                false
            } else {
                *last = Some(token.to_string());
                true
            }
        };
        if changed {
            self.inner.generation_tx.send_modify(|g| *g += 1);
            if let Some(auth) = self.auth() {
                auth.on_user_token_change(self);
            }
        }
    }

    /// Absorb a fresh token pair from an RPC response, if it carries one.
    pub(crate) fn update_tokens_if_necessary(
        &self,
        resp: &IdTokenResponse,
    ) -> Result<(), AuthError> {
        if resp.id_token.is_none() || resp.refresh_token.is_none() {
            return Ok(());
        }
        self.inner
            .tokens
            .update_from_response(resp, chrono::Utc::now().timestamp_millis())?;
        if let Some(token) = self.inner.tokens.pair().access_token {
            self.after_token_update(&token);
        }
        Ok(())
    }

    // ---- Server state ----

    /// Refresh the profile from the server without touching storage.
    pub(crate) async fn reload_without_saving(&self) -> Result<(), AuthError> {
        self.assert_alive()?;
        let token = self.get_id_token(false).await?;
        let result = self
            .race_destroy(self.inner.backend.get_account_info(&token))
            .await;
        let info = match result {
            Ok(info) => info,
            Err(err) => {
                self.note_fatal(&err);
                return Err(err);
            }
        };
        self.inner.write_profile().apply_account_info(info);
        Ok(())
    }

    /// Refresh the profile from the server and persist the result.
    pub async fn reload(&self) -> Result<(), AuthError> {
        self.reload_without_saving().await?;
        if let Some(auth) = self.auth() {
            auth.persist_user_if_current(self).await?;
        }
        Ok(())
    }

    /// Delete the account server-side and sign out locally.
    pub async fn delete(&self) -> Result<(), AuthError> {
        let token = self.get_id_token(false).await?;
        self.race_destroy(self.inner.backend.delete_account(&token))
            .await?;
        if let Some(auth) = self.auth() {
            auth.sign_out_if_current(self).await?;
        }
        Ok(())
    }

    /// Update display name and/or photo URL. `None` leaves a field as is.
    pub async fn update_profile(
        &self,
        display_name: Option<String>,
        photo_url: Option<String>,
    ) -> Result<(), AuthError> {
        self.assert_alive()?;
        if display_name.is_none() && photo_url.is_none() {
            return Ok(());
        }
        let token = self.get_id_token(false).await?;
        let resp = self
            .race_destroy(self.inner.backend.set_account_info(SetAccountInfoRequest {
                id_token: token,
                display_name: display_name.clone(),
                photo_url: photo_url.clone(),
                return_secure_token: true,
                ..Default::default()
            }))
            .await?;
        {
            let mut profile = self.inner.write_profile();
            if display_name.is_some() {
                profile.display_name = display_name;
            }
            if photo_url.is_some() {
                profile.photo_url = photo_url;
            }
        }
        if let Some(id_token) = resp.id_token {
            let wrapped = IdTokenResponse {
                id_token: Some(id_token),
                refresh_token: resp.refresh_token,
                expires_in: resp.expires_in,
                ..Default::default()
            };
            self.update_tokens_if_necessary(&wrapped)?;
        }
        if let Some(auth) = self.auth() {
            auth.persist_user_if_current(self).await?;
        }
        Ok(())
    }

    /// Send the email verification mail for this account.
    pub async fn send_email_verification(&self) -> Result<(), AuthError> {
        let token = self.get_id_token(false).await?;
        self.race_destroy(self.inner.backend.send_oob_code(
            crate::backend::OobRequestType::VerifyEmail,
            None,
            Some(&token),
        ))
        .await
    }

    // ---- Linking and reauth ----

    /// Attach another provider to this account.
    pub async fn link_with_credential(
        &self,
        credential: AuthCredential,
    ) -> Result<UserCredential, AuthError> {
        self.assert_alive()?;
        let provider_id = credential.provider_id().to_string();
        // Checked locally before any network traffic.
        let already_linked = self
            .inner
            .read_profile()
            .provider_data
            .iter()
            .any(|p| p.provider_id == provider_id);
        if already_linked {
            return Err(AuthError::ProviderAlreadyLinked);
        }

        let token = self.get_id_token(false).await?;
        let resp = self
            .race_destroy(credential.link(self.inner.backend.as_ref(), &token))
            .await?
            .into_session()?;
        self.update_tokens_if_necessary(&resp)?;
        self.reload_without_saving().await?;
        if let Some(auth) = self.auth() {
            auth.persist_user_if_current(self).await?;
        }
        Ok(UserCredential {
            user: self.clone(),
            operation_type: OperationType::Link,
            additional_user_info: AdditionalUserInfo {
                provider_id: resp.provider_id.unwrap_or(provider_id),
                is_new_user: resp.is_new_user.unwrap_or(false),
            },
        })
    }

    /// Detach a provider from this account.
    pub async fn unlink(&self, provider_id: &str) -> Result<(), AuthError> {
        self.assert_alive()?;
        let linked = self
            .inner
            .read_profile()
            .provider_data
            .iter()
            .any(|p| p.provider_id == provider_id);
        if !linked {
            return Err(AuthError::NoSuchProvider);
        }

        let token = self.get_id_token(false).await?;
        let resp = self
            .race_destroy(self.inner.backend.set_account_info(SetAccountInfoRequest {
                id_token: token,
                delete_provider: vec![provider_id.to_string()],
                ..Default::default()
            }))
            .await?;
        {
            let mut profile = self.inner.write_profile();
            profile.provider_data = resp
                .provider_user_info
                .into_iter()
                .map(ProviderData::from)
                .collect();
            if !profile
                .provider_data
                .iter()
                .any(|p| p.phone_number.is_some())
            {
                profile.phone_number = None;
            }
        }
        if let Some(auth) = self.auth() {
            auth.persist_user_if_current(self).await?;
        }
        Ok(())
    }

    /// Prove the account's credential again, e.g. before a sensitive
    /// operation. Fails with [`AuthError::UserMismatch`] when the
    /// credential belongs to a different account.
    pub async fn reauthenticate_with_credential(
        &self,
        credential: AuthCredential,
    ) -> Result<UserCredential, AuthError> {
        self.assert_alive()?;
        let result = self
            .race_destroy(credential.reauthenticate(
                self.inner.backend.as_ref(),
                self.tenant().as_deref(),
            ))
            .await;
        let resp = match result {
            Ok(resp) => resp.into_session()?,
            // The account behind the credential no longer exists, so it
            // cannot be this one.
            Err(AuthError::UserNotFound) => return Err(AuthError::UserMismatch),
            Err(AuthError::SecondFactorRequired {
                pending_credential,
                hints,
            }) => {
                let Some(auth) = self.auth() else {
                    return Err(AuthError::SecondFactorRequired {
                        pending_credential,
                        hints,
                    });
                };
                return Err(auth.second_factor_error(
                    Some(self.clone()),
                    MfaOperation::Reauthenticate,
                    pending_credential,
                    hints,
                ));
            }
            Err(err) => return Err(err),
        };
        self.finish_reauthentication(resp).await
    }

    /// Land a completed reauth session on this user.
    pub(crate) async fn finish_reauthentication(
        &self,
        resp: IdTokenResponse,
    ) -> Result<UserCredential, AuthError> {
        match &resp.local_id {
            Some(uid) if *uid == self.inner.uid => {}
            _ => return Err(AuthError::UserMismatch),
        }
        self.update_tokens_if_necessary(&resp)?;
        if let Some(auth) = self.auth() {
            auth.persist_user_if_current(self).await?;
        }
        Ok(UserCredential {
            user: self.clone(),
            operation_type: OperationType::Reauthenticate,
            additional_user_info: AdditionalUserInfo {
                provider_id: resp.provider_id.unwrap_or_default(),
                is_new_user: false,
            },
        })
    }

    // ---- Cross-copy merge ----

    /// Merge another serialized copy of this same account in place, so
    /// existing clones observe the change. Tokens only move forward; a
    /// record without tokens never wipes a live pair.
    pub(crate) fn assign_record(&self, record: &serde_json::Value) -> Result<(), AuthError> {
        let persisted: PersistedUser = serde_json::from_value(record.clone())?;
        if persisted.uid != self.inner.uid {
            return Err(AuthError::internal("cannot assign a record for another uid"));
        }
        {
            let mut profile = self.inner.write_profile();
            profile.email = persisted.email;
            profile.email_verified = persisted.email_verified;
            profile.display_name = persisted.display_name;
            profile.photo_url = persisted.photo_url;
            profile.phone_number = persisted.phone_number;
            profile.is_anonymous = persisted.is_anonymous;
            profile.tenant_id = persisted.tenant_id;
            profile.created_at = persisted.created_at;
            profile.last_login_at = persisted.last_login_at;
            profile.provider_data = persisted.provider_data;
            profile.redirect_event_id = persisted.redirect_event_id;
        }
        if persisted.sts_token_manager.access_token.is_some()
            && persisted.sts_token_manager != self.inner.tokens.pair()
        {
            self.inner.tokens.assign(persisted.sts_token_manager)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let profile = self.inner.read_profile();
        f.debug_struct("User")
            .field("uid", &self.inner.uid)
            .field("email", &profile.email)
            .field("is_anonymous", &profile.is_anonymous)
            .field("providers", &profile.provider_data.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> serde_json::Value {
        json!({
            "uid": "uid-1",
            "email": "a@b.c",
            "emailVerified": true,
            "displayName": "Ada",
            "photoURL": "https://example.com/a.png",
            "isAnonymous": false,
            "providerData": [{
                "providerId": "password",
                "uid": "a@b.c",
                "email": "a@b.c"
            }],
            "stsTokenManager": {
                "refreshToken": "refresh",
                "accessToken": "access",
                "expirationTime": 1_700_000_000_000_i64
            },
            "createdAt": "1600000000000",
            "lastLoginAt": "1650000000000",
            "_redirectEventId": "event-7"
        })
    }

    #[test]
    fn test_persisted_user_round_trip() {
        let persisted: PersistedUser = serde_json::from_value(record()).unwrap();
        assert_eq!(persisted.uid, "uid-1");
        assert_eq!(persisted.photo_url.as_deref(), Some("https://example.com/a.png"));
        assert_eq!(persisted.redirect_event_id.as_deref(), Some("event-7"));
        assert_eq!(
            persisted.sts_token_manager.expiration_time,
            Some(1_700_000_000_000)
        );

        let back = serde_json::to_value(&persisted).unwrap();
        let again: PersistedUser = serde_json::from_value(back).unwrap();
        assert_eq!(persisted, again);
    }

    #[test]
    fn test_persisted_field_names_are_stable() {
        let persisted: PersistedUser = serde_json::from_value(record()).unwrap();
        let value = serde_json::to_value(&persisted).unwrap();
        assert!(value.get("photoURL").is_some());
        assert!(value.get("_redirectEventId").is_some());
        assert!(value.get("stsTokenManager").is_some());
        assert_eq!(value["stsTokenManager"]["refreshToken"], "refresh");
        assert_eq!(value["providerData"][0]["providerId"], "password");
    }

    #[test]
    fn test_record_with_orphan_access_token_is_rejected() {
        let mut bad = record();
        bad["stsTokenManager"]["refreshToken"] = serde_json::Value::Null;
        let persisted: PersistedUser = serde_json::from_value(bad).unwrap();
        assert!(TokenManager::new(persisted.sts_token_manager).is_err());
    }

    #[test]
    fn test_profile_merge_keeps_anonymous_until_provider_appears() {
        let mut profile = Profile {
            is_anonymous: true,
            ..Profile::default()
        };
        profile.apply_account_info(AccountInfo {
            local_id: "uid-1".to_string(),
            ..Default::default()
        });
        assert!(profile.is_anonymous);

        profile.apply_account_info(AccountInfo {
            local_id: "uid-1".to_string(),
            email: Some("a@b.c".to_string()),
            provider_user_info: vec![ProviderUserInfoWire {
                provider_id: "password".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(!profile.is_anonymous);
        assert_eq!(profile.provider_data.len(), 1);
    }
}
