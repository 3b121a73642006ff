//! Client-side identity SDK core: the session and token lifecycle.
//!
//! The crate keeps one signed-in [`User`] per [`Auth`] coordinator alive
//! across process restarts: tokens are refreshed ahead of expiry, the
//! session record is persisted through pluggable [`Persistence`] adapters,
//! and every state mutation is serialized so listeners and storage always
//! observe a consistent order.
//!
//! # Example
//!
//! ```no_run
//! use authkit::{AppConfig, Auth, AuthOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), authkit::AuthError> {
//!     let config = AppConfig::new("api-key", None)?;
//!     let auth = Auth::initialize(config, AuthOptions::default()).await?;
//!
//!     let credential = auth
//!         .sign_in_with_email_and_password("user@example.com", "password")
//!         .await?;
//!     println!("signed in as {}", credential.user.uid());
//!
//!     let token = credential.user.get_id_token(false).await?;
//!     println!("access token: {token}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod app;
pub mod auth;
pub mod backend;
pub mod env;
pub mod error;

pub use app::{AppConfig, DEFAULT_APP_NAME};
pub use auth::auth::{Auth, AuthOptions, ListenerRegistration};
pub use auth::credential::{ApplicationVerifier, AuthCredential, PhoneAuthProvider};
pub use auth::multi_factor::{MultiFactorAssertion, MultiFactorInfo, MultiFactorResolver};
pub use auth::persistence::{
    MemoryPersistence, Persistence, PersistenceType, PersistenceUserManager,
};
pub use auth::redirect::RedirectResolver;
pub use auth::token::TokenPair;
pub use auth::user::{ProviderData, User, UserMetadata};
pub use auth::{AdditionalUserInfo, OperationType, UserCredential};
pub use backend::{Backend, RestBackend};
pub use env::{EnvironmentProbe, StdEnvironment};
pub use error::AuthError;
