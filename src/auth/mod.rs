//! Session and token lifecycle: the coordinator, the user aggregate,
//! credentials, persistence and multi-factor resolution.

pub mod auth;
pub mod credential;
pub mod multi_factor;
pub mod persistence;
pub mod proactive_refresh;
mod queue;
pub mod redirect;
pub mod token;
pub mod user;

use crate::auth::user::User;

/// How a [`UserCredential`] came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// A fresh sign-in.
    SignIn,
    /// A provider linked onto an existing account.
    Link,
    /// A reauthentication of the current account.
    Reauthenticate,
}

/// Extra facts about a completed credential exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdditionalUserInfo {
    /// Provider that produced the session.
    pub provider_id: String,
    /// Whether the backend created a new account.
    pub is_new_user: bool,
}

/// Result of a successful sign-in, link or reauth.
#[derive(Debug, Clone)]
pub struct UserCredential {
    /// The signed-in user.
    pub user: User,
    /// Which operation produced this credential.
    pub operation_type: OperationType,
    /// Extra facts from the exchange.
    pub additional_user_info: AdditionalUserInfo,
}
