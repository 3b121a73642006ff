//! Backend RPC layer.
//!
//! The identity backend is an external collaborator consumed through the
//! [`Backend`] trait; [`RestBackend`] is the production implementation over
//! the Identity Toolkit and Secure Token REST endpoints. Everything above
//! this module (token manager, user, coordinator) only sees typed requests,
//! typed responses and typed errors.

use crate::auth::multi_factor::MultiFactorInfo;
use crate::env::{request_timeout, EnvironmentProbe, StdEnvironment};
use crate::error::AuthError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const API_HOST: &str = "https://identitytoolkit.googleapis.com";
const TOKEN_API_HOST: &str = "https://securetoken.googleapis.com";

/// Response shape shared by every RPC that establishes or extends an
/// authenticated session. Carries at least `idToken` and `refreshToken`
/// when successful; carries `mfaPendingCredential` instead when the
/// backend demands a second factor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdTokenResponse {
    /// Short-lived access token (JWT).
    pub id_token: Option<String>,
    /// Long-lived refresh token.
    pub refresh_token: Option<String>,
    /// Seconds until `id_token` expires, as a decimal string.
    pub expires_in: Option<String>,
    /// Stable user id.
    pub local_id: Option<String>,
    /// Account email, if any.
    pub email: Option<String>,
    /// Display name, if any.
    pub display_name: Option<String>,
    /// Provider that produced this response (e.g. "google.com").
    pub provider_id: Option<String>,
    /// Whether the backend created a new account for this response.
    pub is_new_user: Option<bool>,
    /// Pending credential returned when a second factor is required.
    pub mfa_pending_credential: Option<String>,
    /// Enrolled second factors, present alongside `mfa_pending_credential`.
    pub mfa_info: Option<Vec<MfaEnrollmentWire>>,
}

impl IdTokenResponse {
    /// Split out the second-factor-required case; otherwise require the
    /// token pair to be present.
    pub fn into_session(self) -> Result<IdTokenResponse, AuthError> {
        if let Some(pending_credential) = self.mfa_pending_credential {
            let hints = self
                .mfa_info
                .unwrap_or_default()
                .into_iter()
                .map(MultiFactorInfo::from)
                .collect();
            return Err(AuthError::SecondFactorRequired {
                pending_credential,
                hints,
            });
        }
        if self.id_token.is_none() || self.refresh_token.is_none() {
            return Err(AuthError::internal(
                "session response missing token pair",
            ));
        }
        Ok(self)
    }
}

/// Wire form of an enrolled second factor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MfaEnrollmentWire {
    /// Enrollment id.
    pub mfa_enrollment_id: String,
    /// User-visible label.
    pub display_name: Option<String>,
    /// Masked phone number for phone factors.
    pub phone_info: Option<String>,
    /// RFC 3339 enrollment time.
    pub enrolled_at: Option<String>,
}

impl From<MfaEnrollmentWire> for MultiFactorInfo {
    fn from(wire: MfaEnrollmentWire) -> Self {
        MultiFactorInfo {
            enrollment_id: wire.mfa_enrollment_id,
            display_name: wire.display_name,
            phone_number: wire.phone_info,
            enrolled_at: wire.enrolled_at,
        }
    }
}

/// Response of the Secure Token refresh exchange. Snake-case on the wire,
/// unlike the Identity Toolkit endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenApiResponse {
    /// New access token.
    pub id_token: String,
    /// Rotated refresh token.
    pub refresh_token: String,
    /// Seconds until expiry, as a decimal string.
    pub expires_in: Option<String>,
}

/// One linked provider profile inside an account lookup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderUserInfoWire {
    /// Provider id (e.g. "password", "google.com").
    pub provider_id: String,
    /// Uid within the provider.
    pub raw_id: Option<String>,
    /// Display name from the provider.
    pub display_name: Option<String>,
    /// Photo URL from the provider.
    pub photo_url: Option<String>,
    /// Email from the provider.
    pub email: Option<String>,
    /// Phone number from the provider.
    pub phone_number: Option<String>,
}

/// Server-side view of an account, as returned by `getAccountInfo`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountInfo {
    /// Stable user id.
    pub local_id: String,
    /// Account email.
    pub email: Option<String>,
    /// Whether the email has been verified.
    pub email_verified: bool,
    /// Display name.
    pub display_name: Option<String>,
    /// Photo URL.
    pub photo_url: Option<String>,
    /// Phone number.
    pub phone_number: Option<String>,
    /// Tenant id, for multi-tenant projects.
    pub tenant_id: Option<String>,
    /// Creation time, epoch millis as a decimal string.
    pub created_at: Option<String>,
    /// Last sign-in time, epoch millis as a decimal string.
    pub last_login_at: Option<String>,
    /// Linked provider profiles.
    pub provider_user_info: Vec<ProviderUserInfoWire>,
    /// Enrolled second factors.
    pub mfa_info: Vec<MfaEnrollmentWire>,
}

/// Request for `setAccountInfo`: profile updates and provider unlinking.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAccountInfoRequest {
    /// Access token of the acting user.
    pub id_token: String,
    /// New display name, if changing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// New photo URL, if changing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    /// New email, if changing (used when linking a password credential).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// New password, if changing (used when linking a password credential).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Provider ids to unlink.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub delete_provider: Vec<String>,
    /// Ask the backend to mint a fresh token pair.
    pub return_secure_token: bool,
}

/// Response of `setAccountInfo`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetAccountInfoResponse {
    /// New access token, when `return_secure_token` was set.
    pub id_token: Option<String>,
    /// New refresh token, when `return_secure_token` was set.
    pub refresh_token: Option<String>,
    /// Seconds until expiry, as a decimal string.
    pub expires_in: Option<String>,
    /// Remaining linked provider profiles.
    pub provider_user_info: Vec<ProviderUserInfoWire>,
    /// Account email after the update.
    pub email: Option<String>,
}

/// Request for a federated (OAuth/SAML) sign-in, link or reauth.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdpRequest {
    /// URL-encoded provider assertion
    /// (`id_token=...&providerId=google.com` style).
    pub post_body: String,
    /// Required by the endpoint; no redirect actually happens.
    pub request_uri: String,
    /// Present when linking to an existing account.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Pending token from a previous partial federated flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_token: Option<String>,
    /// Ask the backend to mint a fresh token pair.
    pub return_secure_token: bool,
    /// Include provider credential details in the response.
    pub return_idp_credential: bool,
}

/// Kind of out-of-band email to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobRequestType {
    /// Password reset email, addressed by email.
    PasswordReset,
    /// Email verification, addressed by access token.
    VerifyEmail,
}

impl OobRequestType {
    fn as_wire(self) -> &'static str {
        match self {
            Self::PasswordReset => "PASSWORD_RESET",
            Self::VerifyEmail => "VERIFY_EMAIL",
        }
    }
}

/// The identity backend contract consumed by this SDK.
///
/// All responses representing a new authenticated session carry at least
/// `idToken` and `refreshToken`; implementations surface the server error
/// table through [`AuthError::from_server_code`] and transport failures as
/// [`AuthError::NetworkRequestFailed`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create an account. Empty email and password create an anonymous one.
    async fn sign_up(
        &self,
        email: Option<&str>,
        password: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<IdTokenResponse, AuthError>;

    /// Email/password sign-in.
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
        tenant_id: Option<&str>,
    ) -> Result<IdTokenResponse, AuthError>;

    /// Federated (OAuth/SAML) sign-in, link or reauth depending on the
    /// request fields.
    async fn sign_in_with_idp(&self, req: IdpRequest) -> Result<IdTokenResponse, AuthError>;

    /// Custom-token sign-in.
    async fn sign_in_with_custom_token(&self, token: &str) -> Result<IdTokenResponse, AuthError>;

    /// Phone sign-in (or link, when `id_token` is present) with a
    /// previously obtained verification id and the SMS code.
    async fn sign_in_with_phone_number(
        &self,
        verification_id: &str,
        code: &str,
        id_token: Option<&str>,
    ) -> Result<IdTokenResponse, AuthError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenApiResponse, AuthError>;

    /// Look up the account behind an access token.
    async fn get_account_info(&self, id_token: &str) -> Result<AccountInfo, AuthError>;

    /// Update profile fields or unlink providers.
    async fn set_account_info(
        &self,
        req: SetAccountInfoRequest,
    ) -> Result<SetAccountInfoResponse, AuthError>;

    /// Delete the account behind an access token.
    async fn delete_account(&self, id_token: &str) -> Result<(), AuthError>;

    /// Send an out-of-band email (password reset, email verification).
    async fn send_oob_code(
        &self,
        request_type: OobRequestType,
        email: Option<&str>,
        id_token: Option<&str>,
    ) -> Result<(), AuthError>;

    /// Start phone verification; returns the verification id (session
    /// info) to pair with the SMS code.
    async fn send_verification_code(
        &self,
        phone_number: &str,
        recaptcha_token: &str,
    ) -> Result<String, AuthError>;

    /// Finish a second-factor sign-in with the captured pending credential
    /// and an asserted phone factor.
    async fn finalize_mfa_sign_in(
        &self,
        mfa_pending_credential: &str,
        verification_id: &str,
        code: &str,
    ) -> Result<IdTokenResponse, AuthError>;
}

/// Production backend over the Identity Toolkit / Secure Token REST API.
pub struct RestBackend {
    api_key: String,
    http_client: reqwest::Client,
    env: Arc<dyn EnvironmentProbe>,
    api_host: String,
    token_api_host: String,
}

impl RestBackend {
    /// Create a backend for the given API key with the default environment
    /// probe.
    pub fn new(api_key: impl Into<String>) -> Result<Self, AuthError> {
        Self::with_environment(api_key, Arc::new(StdEnvironment))
    }

    /// Create a backend with an injected environment probe.
    pub fn with_environment(
        api_key: impl Into<String>,
        env: Arc<dyn EnvironmentProbe>,
    ) -> Result<Self, AuthError> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| AuthError::internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            http_client,
            env,
            api_host: API_HOST.to_string(),
            token_api_host: TOKEN_API_HOST.to_string(),
        })
    }

    /// Point the backend at a different host pair (emulator support).
    pub fn with_hosts(mut self, api_host: impl Into<String>, token_api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into();
        self.token_api_host = token_api_host.into();
        self
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> Result<T, AuthError> {
        // Every call races a fixed timeout; tokio::time::timeout drops the
        // losing side so no timer leaks either way.
        let timeout = request_timeout(self.env.as_ref());
        let send = self.http_client.post(&url).json(body).send();
        let response = tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| {
                warn!(url = %url, ?timeout, "backend request timed out");
                AuthError::NetworkRequestFailed("request timed out".to_string())
            })??;

        if !response.status().is_success() {
            let status = response.status();
            let error_body: serde_json::Value = response.json().await?;
            let code = error_body["error"]["message"]
                .as_str()
                .unwrap_or("UNKNOWN_ERROR");
            debug!(%status, code, "backend rejected request");
            return Err(AuthError::from_server_code(code));
        }

        Ok(response.json().await?)
    }

    fn accounts_url(&self, method: &str) -> String {
        format!(
            "{}/v1/accounts:{method}?key={}",
            self.api_host, self.api_key
        )
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn sign_up(
        &self,
        email: Option<&str>,
        password: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<IdTokenResponse, AuthError> {
        let mut body = serde_json::json!({ "returnSecureToken": true });
        if let Some(email) = email {
            body["email"] = serde_json::json!(email);
        }
        if let Some(password) = password {
            body["password"] = serde_json::json!(password);
        }
        if let Some(tenant_id) = tenant_id {
            body["tenantId"] = serde_json::json!(tenant_id);
        }
        let resp: IdTokenResponse = self.post(self.accounts_url("signUp"), &body).await?;
        resp.into_session()
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
        tenant_id: Option<&str>,
    ) -> Result<IdTokenResponse, AuthError> {
        let mut body = serde_json::json!({
            "email": email,
            "password": password,
            "returnSecureToken": true,
        });
        if let Some(tenant_id) = tenant_id {
            body["tenantId"] = serde_json::json!(tenant_id);
        }
        let resp: IdTokenResponse = self
            .post(self.accounts_url("signInWithPassword"), &body)
            .await?;
        resp.into_session()
    }

    async fn sign_in_with_idp(&self, req: IdpRequest) -> Result<IdTokenResponse, AuthError> {
        let resp: IdTokenResponse = self
            .post(self.accounts_url("signInWithIdp"), &req)
            .await?;
        resp.into_session()
    }

    async fn sign_in_with_custom_token(&self, token: &str) -> Result<IdTokenResponse, AuthError> {
        let body = serde_json::json!({ "token": token, "returnSecureToken": true });
        let resp: IdTokenResponse = self
            .post(self.accounts_url("signInWithCustomToken"), &body)
            .await?;
        resp.into_session()
    }

    async fn sign_in_with_phone_number(
        &self,
        verification_id: &str,
        code: &str,
        id_token: Option<&str>,
    ) -> Result<IdTokenResponse, AuthError> {
        let mut body = serde_json::json!({
            "sessionInfo": verification_id,
            "code": code,
        });
        if let Some(id_token) = id_token {
            body["idToken"] = serde_json::json!(id_token);
        }
        let resp: IdTokenResponse = self
            .post(self.accounts_url("signInWithPhoneNumber"), &body)
            .await?;
        resp.into_session()
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenApiResponse, AuthError> {
        let url = format!("{}/v1/token?key={}", self.token_api_host, self.api_key);
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });
        self.post(url, &body).await
    }

    async fn get_account_info(&self, id_token: &str) -> Result<AccountInfo, AuthError> {
        #[derive(Deserialize)]
        struct Lookup {
            #[serde(default)]
            users: Vec<AccountInfo>,
        }
        let body = serde_json::json!({ "idToken": id_token });
        let lookup: Lookup = self.post(self.accounts_url("lookup"), &body).await?;
        lookup
            .users
            .into_iter()
            .next()
            .ok_or(AuthError::UserNotFound)
    }

    async fn set_account_info(
        &self,
        req: SetAccountInfoRequest,
    ) -> Result<SetAccountInfoResponse, AuthError> {
        self.post(self.accounts_url("update"), &req).await
    }

    async fn delete_account(&self, id_token: &str) -> Result<(), AuthError> {
        let body = serde_json::json!({ "idToken": id_token });
        let _: serde_json::Value = self.post(self.accounts_url("delete"), &body).await?;
        Ok(())
    }

    async fn send_oob_code(
        &self,
        request_type: OobRequestType,
        email: Option<&str>,
        id_token: Option<&str>,
    ) -> Result<(), AuthError> {
        let mut body = serde_json::json!({ "requestType": request_type.as_wire() });
        if let Some(email) = email {
            body["email"] = serde_json::json!(email);
        }
        if let Some(id_token) = id_token {
            body["idToken"] = serde_json::json!(id_token);
        }
        let _: serde_json::Value = self.post(self.accounts_url("sendOobCode"), &body).await?;
        Ok(())
    }

    async fn send_verification_code(
        &self,
        phone_number: &str,
        recaptcha_token: &str,
    ) -> Result<String, AuthError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SendCode {
            session_info: String,
        }
        let body = serde_json::json!({
            "phoneNumber": phone_number,
            "recaptchaToken": recaptcha_token,
        });
        let resp: SendCode = self
            .post(self.accounts_url("sendVerificationCode"), &body)
            .await?;
        Ok(resp.session_info)
    }

    async fn finalize_mfa_sign_in(
        &self,
        mfa_pending_credential: &str,
        verification_id: &str,
        code: &str,
    ) -> Result<IdTokenResponse, AuthError> {
        let url = format!(
            "{}/v2/accounts/mfaSignIn:finalize?key={}",
            self.api_host, self.api_key
        );
        let body = serde_json::json!({
            "mfaPendingCredential": mfa_pending_credential,
            "phoneVerificationInfo": {
                "sessionInfo": verification_id,
                "code": code,
            },
        });
        let resp: IdTokenResponse = self.post(url, &body).await?;
        resp.into_session()
    }
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("api_key", &"<redacted>")
            .field("api_host", &self.api_host)
            .finish()
    }
}
