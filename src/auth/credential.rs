//! Authentication credentials.
//!
//! An [`AuthCredential`] is proof of identity that can be exchanged for a
//! session in three ways: signing in fresh, linking onto an existing
//! account, or reauthenticating the current one. Each variant knows which
//! backend RPC each exchange maps to.

use crate::backend::{Backend, IdTokenResponse, IdpRequest, SetAccountInfoRequest};
use crate::error::AuthError;
use async_trait::async_trait;
use tracing::debug;

/// Provider id of the email/password provider.
pub const PASSWORD_PROVIDER_ID: &str = "password";
/// Provider id of the phone provider.
pub const PHONE_PROVIDER_ID: &str = "phone";

// The IdP endpoint requires a requestUri even though no browser redirect
// is involved here.
const IDP_REQUEST_URI: &str = "http://localhost";

/// Proof of identity accepted by the sign-in, link and reauth flows.
#[derive(Debug, Clone)]
pub enum AuthCredential {
    /// Email and password.
    Password {
        /// Account email.
        email: String,
        /// Account password.
        password: String,
    },
    /// Phone number ownership, proven by an SMS code.
    Phone {
        /// Verification id from [`PhoneAuthProvider::verify_phone_number`].
        verification_id: String,
        /// SMS code the user received.
        code: String,
    },
    /// Federated OAuth assertion (Google, Apple, GitHub, ...).
    OAuth {
        /// Provider id, e.g. "google.com".
        provider_id: String,
        /// OIDC id token from the provider.
        id_token: Option<String>,
        /// OAuth access token from the provider.
        access_token: Option<String>,
        /// OAuth 1.0 token secret (Twitter-style providers).
        oauth_token_secret: Option<String>,
        /// Raw nonce for providers that require one (Apple).
        raw_nonce: Option<String>,
        /// Pending token from an earlier partial federated flow.
        pending_token: Option<String>,
    },
    /// SAML assertion carried as a pending token.
    Saml {
        /// Provider id, e.g. "saml.my-idp".
        provider_id: String,
        /// Pending token from the SAML handshake.
        pending_token: String,
    },
    /// Developer-minted custom token.
    Custom {
        /// The signed custom token.
        token: String,
    },
    /// No proof at all; creates or resumes an anonymous account.
    Anonymous,
}

impl AuthCredential {
    /// Email/password credential.
    pub fn password(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Phone credential from a completed SMS verification.
    pub fn phone(verification_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Phone {
            verification_id: verification_id.into(),
            code: code.into(),
        }
    }

    /// OAuth credential with an OIDC id token.
    pub fn oauth_id_token(provider_id: impl Into<String>, id_token: impl Into<String>) -> Self {
        Self::OAuth {
            provider_id: provider_id.into(),
            id_token: Some(id_token.into()),
            access_token: None,
            oauth_token_secret: None,
            raw_nonce: None,
            pending_token: None,
        }
    }

    /// OAuth credential with an access token.
    pub fn oauth_access_token(
        provider_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self::OAuth {
            provider_id: provider_id.into(),
            id_token: None,
            access_token: Some(access_token.into()),
            oauth_token_secret: None,
            raw_nonce: None,
            pending_token: None,
        }
    }

    /// Which provider this credential belongs to.
    pub fn provider_id(&self) -> &str {
        match self {
            Self::Password { .. } => PASSWORD_PROVIDER_ID,
            Self::Phone { .. } => PHONE_PROVIDER_ID,
            Self::OAuth { provider_id, .. } | Self::Saml { provider_id, .. } => provider_id,
            Self::Custom { .. } => "custom",
            Self::Anonymous => "anonymous",
        }
    }

    /// Exchange this credential for a brand new session.
    pub(crate) async fn sign_in(
        &self,
        backend: &dyn Backend,
        tenant_id: Option<&str>,
    ) -> Result<IdTokenResponse, AuthError> {
        debug!(provider = self.provider_id(), "exchanging credential for session");
        match self {
            Self::Password { email, password } => {
                backend
                    .sign_in_with_password(email, password, tenant_id)
                    .await
            }
            Self::Phone {
                verification_id,
                code,
            } => {
                backend
                    .sign_in_with_phone_number(verification_id, code, None)
                    .await
            }
            Self::OAuth { .. } | Self::Saml { .. } => {
                backend.sign_in_with_idp(self.idp_request(None)).await
            }
            Self::Custom { token } => backend.sign_in_with_custom_token(token).await,
            Self::Anonymous => backend.sign_up(None, None, tenant_id).await,
        }
    }

    /// Attach this credential's provider to the account behind `id_token`.
    pub(crate) async fn link(
        &self,
        backend: &dyn Backend,
        id_token: &str,
    ) -> Result<IdTokenResponse, AuthError> {
        debug!(provider = self.provider_id(), "linking credential");
        match self {
            Self::Password { email, password } => {
                let resp = backend
                    .set_account_info(SetAccountInfoRequest {
                        id_token: id_token.to_string(),
                        email: Some(email.clone()),
                        password: Some(password.clone()),
                        return_secure_token: true,
                        ..Default::default()
                    })
                    .await?;
                Ok(IdTokenResponse {
                    id_token: resp.id_token,
                    refresh_token: resp.refresh_token,
                    expires_in: resp.expires_in,
                    email: resp.email,
                    provider_id: Some(PASSWORD_PROVIDER_ID.to_string()),
                    ..Default::default()
                })
            }
            Self::Phone {
                verification_id,
                code,
            } => {
                backend
                    .sign_in_with_phone_number(verification_id, code, Some(id_token))
                    .await
            }
            Self::OAuth { .. } | Self::Saml { .. } => {
                backend
                    .sign_in_with_idp(self.idp_request(Some(id_token)))
                    .await
            }
            Self::Custom { .. } | Self::Anonymous => Err(AuthError::InvalidCredential(
                format!("{} credentials cannot be linked", self.provider_id()),
            )),
        }
    }

    /// Prove the account behind this credential is the one currently
    /// signed in. Same exchanges as [`sign_in`](Self::sign_in); the caller
    /// checks the returned uid.
    pub(crate) async fn reauthenticate(
        &self,
        backend: &dyn Backend,
        tenant_id: Option<&str>,
    ) -> Result<IdTokenResponse, AuthError> {
        match self {
            Self::Anonymous => Err(AuthError::InvalidCredential(
                "anonymous credentials cannot reauthenticate".to_string(),
            )),
            _ => self.sign_in(backend, tenant_id).await,
        }
    }

    fn idp_request(&self, id_token: Option<&str>) -> IdpRequest {
        let (post_body, pending_token) = match self {
            Self::OAuth {
                provider_id,
                id_token,
                access_token,
                oauth_token_secret,
                raw_nonce,
                pending_token,
            } => {
                let mut parts = Vec::new();
                if let Some(token) = id_token {
                    parts.push(format!("id_token={token}"));
                }
                if let Some(token) = access_token {
                    parts.push(format!("access_token={token}"));
                }
                if let Some(secret) = oauth_token_secret {
                    parts.push(format!("oauth_token_secret={secret}"));
                }
                if let Some(nonce) = raw_nonce {
                    parts.push(format!("nonce={nonce}"));
                }
                parts.push(format!("providerId={provider_id}"));
                (parts.join("&"), pending_token.clone())
            }
            Self::Saml {
                provider_id,
                pending_token,
            } => (
                format!("providerId={provider_id}"),
                Some(pending_token.clone()),
            ),
            // Reached only through the federated arms above.
            _ => (String::new(), None),
        };
        IdpRequest {
            post_body,
            request_uri: IDP_REQUEST_URI.to_string(),
            id_token: id_token.map(str::to_string),
            pending_token,
            return_secure_token: true,
            return_idp_credential: true,
        }
    }
}

/// Proof that the caller is a real application instance, demanded by the
/// phone verification endpoint (reCAPTCHA, app attestation and the like).
#[async_trait]
pub trait ApplicationVerifier: Send + Sync {
    /// Verifier kind, e.g. "recaptcha".
    fn verifier_type(&self) -> &str;

    /// Produce the proof string to attach to the request.
    async fn verify(&self) -> Result<String, AuthError>;
}

/// Entry point for phone number verification.
#[derive(Debug, Default)]
pub struct PhoneAuthProvider;

impl PhoneAuthProvider {
    /// Start phone verification: prove the app with `verifier`, ask the
    /// backend to send the SMS, and return the verification id to pair
    /// with the code the user types in.
    pub async fn verify_phone_number(
        backend: &dyn Backend,
        phone_number: &str,
        verifier: &dyn ApplicationVerifier,
    ) -> Result<String, AuthError> {
        let recaptcha_token = verifier.verify().await?;
        backend
            .send_verification_code(phone_number, &recaptcha_token)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_ids() {
        assert_eq!(
            AuthCredential::password("a@b.c", "pw").provider_id(),
            "password"
        );
        assert_eq!(AuthCredential::phone("v", "123456").provider_id(), "phone");
        assert_eq!(
            AuthCredential::oauth_id_token("google.com", "jwt").provider_id(),
            "google.com"
        );
    }

    #[test]
    fn test_oauth_post_body_carries_assertion() {
        let credential = AuthCredential::OAuth {
            provider_id: "apple.com".to_string(),
            id_token: Some("jwt".to_string()),
            access_token: None,
            oauth_token_secret: None,
            raw_nonce: Some("nonce-1".to_string()),
            pending_token: None,
        };
        let req = credential.idp_request(Some("session-jwt"));
        assert_eq!(req.post_body, "id_token=jwt&nonce=nonce-1&providerId=apple.com");
        assert_eq!(req.id_token.as_deref(), Some("session-jwt"));
        assert!(req.return_secure_token);
    }

    #[test]
    fn test_saml_uses_pending_token() {
        let credential = AuthCredential::Saml {
            provider_id: "saml.corp".to_string(),
            pending_token: "pending".to_string(),
        };
        let req = credential.idp_request(None);
        assert_eq!(req.post_body, "providerId=saml.corp");
        assert_eq!(req.pending_token.as_deref(), Some("pending"));
    }

    #[tokio::test]
    async fn test_anonymous_cannot_reauthenticate() {
        struct NoBackend;
        #[async_trait]
        impl Backend for NoBackend {
            async fn sign_up(
                &self,
                _: Option<&str>,
                _: Option<&str>,
                _: Option<&str>,
            ) -> Result<IdTokenResponse, AuthError> {
                unreachable!()
            }
            async fn sign_in_with_password(
                &self,
                _: &str,
                _: &str,
                _: Option<&str>,
            ) -> Result<IdTokenResponse, AuthError> {
                unreachable!()
            }
            async fn sign_in_with_idp(
                &self,
                _: IdpRequest,
            ) -> Result<IdTokenResponse, AuthError> {
                unreachable!()
            }
            async fn sign_in_with_custom_token(
                &self,
                _: &str,
            ) -> Result<IdTokenResponse, AuthError> {
                unreachable!()
            }
            async fn sign_in_with_phone_number(
                &self,
                _: &str,
                _: &str,
                _: Option<&str>,
            ) -> Result<IdTokenResponse, AuthError> {
                unreachable!()
            }
            async fn refresh_token(
                &self,
                _: &str,
            ) -> Result<crate::backend::TokenApiResponse, AuthError> {
                unreachable!()
            }
            async fn get_account_info(
                &self,
                _: &str,
            ) -> Result<crate::backend::AccountInfo, AuthError> {
                unreachable!()
            }
            async fn set_account_info(
                &self,
                _: SetAccountInfoRequest,
            ) -> Result<crate::backend::SetAccountInfoResponse, AuthError> {
                unreachable!()
            }
            async fn delete_account(&self, _: &str) -> Result<(), AuthError> {
                unreachable!()
            }
            async fn send_oob_code(
                &self,
                _: crate::backend::OobRequestType,
                _: Option<&str>,
                _: Option<&str>,
            ) -> Result<(), AuthError> {
                unreachable!()
            }
            async fn send_verification_code(
                &self,
                _: &str,
                _: &str,
            ) -> Result<String, AuthError> {
                unreachable!()
            }
            async fn finalize_mfa_sign_in(
                &self,
                _: &str,
                _: &str,
                _: &str,
            ) -> Result<IdTokenResponse, AuthError> {
                unreachable!()
            }
        }

        let result = AuthCredential::Anonymous
            .reauthenticate(&NoBackend, None)
            .await;
        assert!(matches!(result, Err(AuthError::InvalidCredential(_))));
    }
}
