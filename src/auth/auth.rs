//! The session coordinator.
//!
//! One [`Auth`] per app owns the current-user slot. Every mutation of that
//! slot (sign-in, sign-out, storage sync, persistence swap) runs through a
//! serial operation queue, so operations settle in submission order and
//! the persisted record always reflects the last completed one. Two
//! listener channels hang off the slot: the id-token channel fires on
//! every visible change, the auth-state channel only when the signed-in
//! uid actually changes.

use crate::app::AppConfig;
use crate::auth::credential::AuthCredential;
use crate::auth::multi_factor::{MfaOperation, MultiFactorInfo, MultiFactorResolver};
use crate::auth::persistence::{
    Persistence, PersistenceUserManager, AUTH_USER_KEY, REDIRECT_USER_KEY,
};
use crate::auth::queue::OperationQueue;
use crate::auth::redirect::{new_redirect_event_id, RedirectResolver};
use crate::auth::user::User;
use crate::auth::{AdditionalUserInfo, OperationType, UserCredential};
use crate::backend::{Backend, IdTokenResponse, OobRequestType, RestBackend};
use crate::error::AuthError;
use futures::Stream;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

static AUTH_INSTANCES: Lazy<Mutex<HashMap<String, Auth>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Last uid handed to the auth-state channel. `Never` forces the first
/// notification through even when nobody is signed in.
enum LastUid {
    Never,
    SignedOut,
    Uid(String),
}

fn uid_changed(last: &LastUid, uid: Option<&str>) -> bool {
    match last {
        LastUid::Never => true,
        LastUid::SignedOut => uid.is_some(),
        LastUid::Uid(previous) => uid != Some(previous.as_str()),
    }
}

type Listener = Arc<dyn Fn(Option<User>) + Send + Sync>;

/// Which listener channel a registration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerChannel {
    AuthState,
    IdToken,
}

/// Handle for a registered listener; drop it to keep the listener, call
/// [`remove`](ListenerRegistration::remove) to detach it.
pub struct ListenerRegistration {
    auth: Auth,
    channel: ListenerChannel,
    id: Uuid,
}

impl ListenerRegistration {
    /// Detach the listener.
    pub fn remove(self) {
        let listeners = match self.channel {
            ListenerChannel::AuthState => &self.auth.inner.auth_state_listeners,
            ListenerChannel::IdToken => &self.auth.inner.id_token_listeners,
        };
        listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|(id, _)| *id != self.id);
    }
}

/// Construction options for a coordinator.
pub struct AuthOptions {
    /// Backend to talk to; defaults to [`RestBackend`] over the config's
    /// API key.
    pub backend: Option<Arc<dyn Backend>>,
    /// Persistence adapters, most preferred first. Empty means in-memory
    /// only.
    pub persistence_hierarchy: Vec<Arc<dyn Persistence>>,
    /// Host-side redirect support, if the embedder has any.
    pub redirect_resolver: Option<Arc<dyn RedirectResolver>>,
    /// Keep the signed-in user's token warm in the background.
    pub enable_proactive_refresh: bool,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            backend: None,
            persistence_hierarchy: Vec::new(),
            redirect_resolver: None,
            enable_proactive_refresh: false,
        }
    }
}

pub(crate) struct AuthInner {
    config: AppConfig,
    backend: Arc<dyn Backend>,
    queue: OperationQueue,
    current_user: RwLock<Option<User>>,
    user_manager: PersistenceUserManager,
    redirect_manager: PersistenceUserManager,
    redirect_user: RwLock<Option<User>>,
    redirect_resolver: Option<Arc<dyn RedirectResolver>>,
    last_notified_uid: Mutex<LastUid>,
    initialized_tx: watch::Sender<bool>,
    auth_state_listeners: Mutex<Vec<(Uuid, Listener)>>,
    id_token_listeners: Mutex<Vec<(Uuid, Listener)>>,
    state_broadcast: broadcast::Sender<Option<User>>,
    proactive_enabled: AtomicBool,
}

/// Session coordinator for one app. Clones share state.
#[derive(Clone)]
pub struct Auth {
    pub(crate) inner: Arc<AuthInner>,
}

impl Auth {
    /// Create a coordinator, restore any stored session, and register it
    /// under the config's app name for [`Auth::instance`].
    pub async fn initialize(config: AppConfig, options: AuthOptions) -> Result<Auth, AuthError> {
        let auth = Self::initialize_detached(config, options).await?;
        AUTH_INSTANCES
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(auth.app_name().to_string(), auth.clone());
        Ok(auth)
    }

    /// Like [`initialize`](Self::initialize) but without touching the
    /// instance registry, for embedders managing their own instances.
    pub async fn initialize_detached(
        config: AppConfig,
        options: AuthOptions,
    ) -> Result<Auth, AuthError> {
        let backend = match options.backend {
            Some(backend) => backend,
            None => Arc::new(RestBackend::new(config.api_key.clone())?),
        };
        let user_manager = PersistenceUserManager::create(
            options.persistence_hierarchy.clone(),
            &config.api_key,
            &config.app_name,
            AUTH_USER_KEY,
        )
        .await;
        let redirect_manager = PersistenceUserManager::create(
            options.persistence_hierarchy,
            &config.api_key,
            &config.app_name,
            REDIRECT_USER_KEY,
        )
        .await;

        let auth = Auth {
            inner: Arc::new(AuthInner {
                config,
                backend,
                queue: OperationQueue::new(),
                current_user: RwLock::new(None),
                user_manager,
                redirect_manager,
                redirect_user: RwLock::new(None),
                redirect_resolver: options.redirect_resolver,
                last_notified_uid: Mutex::new(LastUid::Never),
                initialized_tx: watch::channel(false).0,
                auth_state_listeners: Mutex::new(Vec::new()),
                id_token_listeners: Mutex::new(Vec::new()),
                state_broadcast: broadcast::channel(16).0,
                proactive_enabled: AtomicBool::new(options.enable_proactive_refresh),
            }),
        };

        // Weak capture: the manager outlives this closure but must not
        // keep the coordinator alive through it.
        let weak = Arc::downgrade(&auth.inner);
        auth.inner
            .user_manager
            .set_listener(Arc::new(move |value| {
                if let Some(inner) = weak.upgrade() {
                    Auth::from_inner(inner).handle_storage_event(value);
                }
            }))
            .await;

        let this = auth.clone();
        if let Err(err) = auth
            .inner
            .queue
            .enqueue(async move { this.initialize_current_user().await })
            .await
        {
            // A failed restore degrades to signed-out, it does not brick
            // the coordinator.
            warn!(%err, "session restore failed, starting signed out");
        }
        let _ = auth.inner.initialized_tx.send(true);

        let this = auth.clone();
        auth.inner
            .queue
            .enqueue(async move {
                this.notify_listeners().await;
                Ok(())
            })
            .await?;

        info!(app = %auth.app_name(), "auth coordinator initialized");
        Ok(auth)
    }

    /// Look up a previously initialized coordinator by app name.
    pub fn instance(app_name: &str) -> Option<Auth> {
        AUTH_INSTANCES
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(app_name)
            .cloned()
    }

    pub(crate) fn from_inner(inner: Arc<AuthInner>) -> Auth {
        Auth { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<AuthInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.inner.backend)
    }

    /// App name this coordinator was configured with.
    pub fn app_name(&self) -> &str {
        &self.inner.config.app_name
    }

    /// Configured tenant id, if any.
    pub fn tenant_id(&self) -> Option<String> {
        self.inner.config.tenant_id.clone()
    }

    /// The signed-in user, if any.
    pub async fn current_user(&self) -> Option<User> {
        self.inner.current_user.read().await.clone()
    }

    /// Wait until the stored session has been restored (or determined
    /// absent).
    pub async fn await_initialized(&self) {
        let mut rx = self.inner.initialized_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    // ---- Session restore ----

    async fn initialize_current_user(&self) -> Result<(), AuthError> {
        let stored = match self.inner.user_manager.get_current_record().await {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, "failed to read stored user record");
                None
            }
        };
        let mut future_user = stored.and_then(|record| {
            match User::from_record(self.downgrade(), self.backend(), &record) {
                Ok(user) => Some(user),
                Err(err) => {
                    warn!(%err, "stored user record unreadable, discarding");
                    None
                }
            }
        });

        if let Some(resolver) = self.inner.redirect_resolver.clone() {
            if let Err(err) = resolver.initialize(self).await {
                warn!(%err, "redirect resolver failed to initialize");
            }
            if let Ok(Some(record)) = self.inner.redirect_manager.get_current_record().await {
                match User::from_record(self.downgrade(), self.backend(), &record) {
                    Ok(user) => *self.inner.redirect_user.write().await = Some(user),
                    Err(err) => warn!(%err, "stored redirect record unreadable, discarding"),
                }
                let _ = self.inner.redirect_manager.remove_current_record().await;
            }

            let redirect_event_id = self
                .inner
                .redirect_user
                .read()
                .await
                .as_ref()
                .and_then(User::redirect_event_id);
            let stored_event_id = future_user.as_ref().and_then(User::redirect_event_id);

            // A concluded redirect takes over the slot, but only when it
            // is not stale bookkeeping for some other operation.
            match resolver.complete_redirect(self).await {
                Ok(Some(resp))
                    if redirect_event_id.is_none() || redirect_event_id == stored_event_id =>
                {
                    let built = resp.into_session().and_then(|resp| {
                        User::from_response(self.downgrade(), self.backend(), &resp, false)
                    });
                    match built {
                        Ok(user) => {
                            if let Err(err) = user.reload_without_saving().await {
                                warn!(%err, "redirect user failed to load, ignoring");
                            } else {
                                future_user = Some(user);
                            }
                        }
                        Err(err) => warn!(%err, "redirect sign-in result unusable"),
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "pending redirect sign-in failed"),
            }
        }

        let Some(user) = future_user else {
            return self.directly_set_current_user(None).await;
        };

        if user.redirect_event_id().is_some() {
            let adopted_by_redirect = self
                .inner
                .redirect_user
                .read()
                .await
                .as_ref()
                .is_some_and(|r| r.redirect_event_id() == user.redirect_event_id());
            if adopted_by_redirect {
                // The redirect flow already proved this session fresh; no
                // reload needed.
                return self.directly_set_current_user(Some(user)).await;
            }
        }
        self.reload_and_set_current_user_or_clear(user).await
    }

    /// Validate a restored user against the server. A network failure
    /// keeps the stored session (it can be validated later); any other
    /// failure clears it.
    async fn reload_and_set_current_user_or_clear(&self, user: User) -> Result<(), AuthError> {
        if let Err(err) = user.reload_without_saving().await {
            if !err.is_network() {
                warn!(%err, "restored user rejected by server, clearing session");
                return self.directly_set_current_user(None).await;
            }
            debug!(%err, "restored user could not be validated yet, keeping session");
        }
        self.directly_set_current_user(Some(user)).await
    }

    /// Install `user` as current and sync the persisted record. Must run
    /// inside a queued operation.
    async fn directly_set_current_user(&self, user: Option<User>) -> Result<(), AuthError> {
        let mut current = self.inner.current_user.write().await;
        let same = match (&*current, &user) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a.inner, &b.inner),
            (None, None) => true,
            _ => false,
        };
        if !same {
            if let Some(outgoing) = &*current {
                outgoing.stop_proactive_refresh();
            }
        }
        if let Some(incoming) = &user {
            if self.inner.proactive_enabled.load(Ordering::SeqCst) {
                incoming.start_proactive_refresh();
            }
        }
        *current = user.clone();
        drop(current);

        match &user {
            Some(user) => {
                self.inner
                    .user_manager
                    .set_current_record(user.to_record())
                    .await
            }
            None => self.inner.user_manager.remove_current_record().await,
        }
    }

    async fn is_current(&self, user: &User) -> bool {
        self.inner
            .current_user
            .read()
            .await
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(&current.inner, &user.inner))
    }

    async fn queue_set_user(&self, user: Option<User>) -> Result<(), AuthError> {
        let this = self.clone();
        self.inner
            .queue
            .enqueue(async move {
                this.directly_set_current_user(user).await?;
                this.notify_listeners().await;
                Ok(())
            })
            .await
    }

    // ---- Public session mutations ----

    /// Replace the current user. The update is serialized behind any
    /// in-flight operations.
    pub async fn update_current_user(&self, user: Option<User>) -> Result<(), AuthError> {
        if let Some(user) = &user {
            if user.tenant_id() != self.inner.config.tenant_id {
                return Err(AuthError::TenantIdMismatch);
            }
        }
        self.queue_set_user(user).await
    }

    /// Sign out. The user object stays usable for reads; the slot and the
    /// persisted record are cleared.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.queue_set_user(None).await
    }

    /// Swap the persistence adapter, moving the current record to it.
    pub async fn set_persistence(
        &self,
        persistence: Arc<dyn Persistence>,
    ) -> Result<(), AuthError> {
        let this = self.clone();
        self.inner
            .queue
            .enqueue(async move { this.inner.user_manager.set_persistence(persistence).await })
            .await
    }

    /// Keep the signed-in user's access token warm in the background.
    pub async fn enable_proactive_refresh(&self) {
        self.inner.proactive_enabled.store(true, Ordering::SeqCst);
        if let Some(user) = self.current_user().await {
            user.start_proactive_refresh();
        }
    }

    /// Stop background token refresh.
    pub async fn disable_proactive_refresh(&self) {
        self.inner.proactive_enabled.store(false, Ordering::SeqCst);
        if let Some(user) = self.current_user().await {
            user.stop_proactive_refresh();
        }
    }

    // ---- Sign-in surface ----

    /// Email/password sign-in.
    pub async fn sign_in_with_email_and_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<UserCredential, AuthError> {
        // Obvious input problems never reach the network.
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::InvalidEmail);
        }
        self.sign_in_with_credential(AuthCredential::password(email, password))
            .await
    }

    /// Create an email/password account and sign into it.
    pub async fn create_user_with_email_and_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<UserCredential, AuthError> {
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::InvalidEmail);
        }
        if password.len() < 6 {
            return Err(AuthError::WeakPassword);
        }
        let resp = self
            .inner
            .backend
            .sign_up(Some(email), Some(password), self.tenant_id().as_deref())
            .await?;
        self.complete_sign_in_inner(resp, OperationType::SignIn, false)
            .await
    }

    /// Sign in anonymously. Returns the existing session when the current
    /// user is already anonymous.
    pub async fn sign_in_anonymously(&self) -> Result<UserCredential, AuthError> {
        if let Some(user) = self.current_user().await {
            if user.is_anonymous() {
                return Ok(UserCredential {
                    user,
                    operation_type: OperationType::SignIn,
                    additional_user_info: AdditionalUserInfo {
                        provider_id: String::new(),
                        is_new_user: false,
                    },
                });
            }
        }
        let resp = self
            .inner
            .backend
            .sign_up(None, None, self.tenant_id().as_deref())
            .await?;
        self.complete_sign_in_inner(resp, OperationType::SignIn, true)
            .await
    }

    /// Sign in with a developer-minted custom token.
    pub async fn sign_in_with_custom_token(
        &self,
        token: &str,
    ) -> Result<UserCredential, AuthError> {
        self.sign_in_with_credential(AuthCredential::Custom {
            token: token.to_string(),
        })
        .await
    }

    /// Exchange any credential for a session.
    pub async fn sign_in_with_credential(
        &self,
        credential: AuthCredential,
    ) -> Result<UserCredential, AuthError> {
        let is_anonymous = matches!(credential, AuthCredential::Anonymous);
        let result = credential
            .sign_in(self.inner.backend.as_ref(), self.tenant_id().as_deref())
            .await;
        match result {
            Ok(resp) => {
                self.complete_sign_in_inner(resp, OperationType::SignIn, is_anonymous)
                    .await
            }
            Err(AuthError::SecondFactorRequired {
                pending_credential,
                hints,
            }) => Err(self.second_factor_error(None, MfaOperation::SignIn, pending_credential, hints)),
            Err(err) => Err(err),
        }
    }

    /// Send a password reset email.
    pub async fn send_password_reset_email(&self, email: &str) -> Result<(), AuthError> {
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::InvalidEmail);
        }
        self.inner
            .backend
            .send_oob_code(OobRequestType::PasswordReset, Some(email), None)
            .await
    }

    /// Land a completed first-plus-second-factor sign-in.
    pub(crate) async fn complete_sign_in(
        &self,
        resp: IdTokenResponse,
        operation_type: OperationType,
    ) -> Result<UserCredential, AuthError> {
        self.complete_sign_in_inner(resp, operation_type, false).await
    }

    async fn complete_sign_in_inner(
        &self,
        resp: IdTokenResponse,
        operation_type: OperationType,
        is_anonymous: bool,
    ) -> Result<UserCredential, AuthError> {
        let resp = resp.into_session()?;
        let user = User::from_response(self.downgrade(), self.backend(), &resp, is_anonymous)?;
        user.reload_without_saving().await?;
        self.queue_set_user(Some(user.clone())).await?;
        Ok(UserCredential {
            user,
            operation_type,
            additional_user_info: AdditionalUserInfo {
                provider_id: resp.provider_id.unwrap_or_default(),
                is_new_user: resp.is_new_user.unwrap_or(false),
            },
        })
    }

    pub(crate) fn second_factor_error(
        &self,
        originating_user: Option<User>,
        operation: MfaOperation,
        pending_credential: String,
        hints: Vec<MultiFactorInfo>,
    ) -> AuthError {
        AuthError::MultiFactorRequired(MultiFactorResolver::new(
            self.clone(),
            originating_user,
            operation,
            pending_credential,
            hints,
        ))
    }

    // ---- Redirect bookkeeping ----

    /// Record `user` as pending a redirect round-trip: a fresh event id is
    /// stamped on the user and the record is stored in the redirect slot.
    /// Resolver implementations call this before handing control away.
    pub async fn set_redirect_user(&self, user: Option<User>) -> Result<(), AuthError> {
        match user {
            Some(user) => {
                user.set_redirect_event_id(Some(new_redirect_event_id()));
                self.inner
                    .redirect_manager
                    .set_current_record(user.to_record())
                    .await?;
                self.persist_user_if_current(&user).await
            }
            None => self.inner.redirect_manager.remove_current_record().await,
        }
    }

    // ---- Hooks called from User ----

    /// Persist `user`'s record if it is the current one. Serialized
    /// behind in-flight operations.
    pub(crate) async fn persist_user_if_current(&self, user: &User) -> Result<(), AuthError> {
        let this = self.clone();
        let user = user.clone();
        self.inner
            .queue
            .enqueue(async move {
                if this.is_current(&user).await {
                    this.inner
                        .user_manager
                        .set_current_record(user.to_record())
                        .await?;
                }
                Ok(())
            })
            .await
    }

    /// Token pair changed on `user`: persist and notify if current.
    /// Fire-and-forget so it is safe to call from inside queued work.
    pub(crate) fn on_user_token_change(&self, user: &User) {
        let this = self.clone();
        let user = user.clone();
        let _ = self.inner.queue.submit(async move {
            if this.is_current(&user).await {
                this.inner
                    .user_manager
                    .set_current_record(user.to_record())
                    .await?;
                this.notify_listeners().await;
            }
            Ok(())
        });
    }

    /// `user` hit a fatal session error: clear the slot if current, then
    /// tear the user down.
    pub(crate) fn user_invalidated(&self, user: &User) {
        let this = self.clone();
        let user = user.clone();
        let _ = self.inner.queue.submit(async move {
            if this.is_current(&user).await {
                warn!(uid = %user.uid(), "current user invalidated, signing out");
                this.directly_set_current_user(None).await?;
                this.notify_listeners().await;
            }
            user.destroy();
            Ok(())
        });
    }

    /// Sign `user` out if it is current and tear it down; used after the
    /// account itself was deleted.
    pub(crate) async fn sign_out_if_current(&self, user: &User) -> Result<(), AuthError> {
        let this = self.clone();
        let user = user.clone();
        self.inner
            .queue
            .enqueue(async move {
                if this.is_current(&user).await {
                    this.directly_set_current_user(None).await?;
                    this.notify_listeners().await;
                }
                user.destroy();
                Ok(())
            })
            .await
    }

    // ---- Cross-process storage sync ----

    fn handle_storage_event(&self, value: Option<serde_json::Value>) {
        let this = self.clone();
        let _ = self.inner.queue.submit(async move {
            this.apply_storage_event(value).await
        });
    }

    async fn apply_storage_event(&self, value: Option<serde_json::Value>) -> Result<(), AuthError> {
        let current = self.current_user().await;
        let incoming_uid = value
            .as_ref()
            .and_then(|v| v.get("uid"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        match (&current, &value) {
            (None, None) => Ok(()),
            (Some(current_user), Some(record))
                if incoming_uid.as_deref() == Some(current_user.uid()) =>
            {
                // Same account updated elsewhere: merge in place so every
                // clone of the user observes it, then reconcile tokens.
                current_user.assign_record(record)?;
                if let Err(err) = current_user.get_id_token(false).await {
                    debug!(%err, "token reconcile after storage sync failed");
                }
                self.inner
                    .user_manager
                    .set_current_record(current_user.to_record())
                    .await?;
                self.notify_listeners().await;
                Ok(())
            }
            (_, Some(record)) => {
                let user = User::from_record(self.downgrade(), self.backend(), record)?;
                self.directly_set_current_user(Some(user)).await?;
                self.notify_listeners().await;
                Ok(())
            }
            (Some(_), None) => {
                self.directly_set_current_user(None).await?;
                self.notify_listeners().await;
                Ok(())
            }
        }
    }

    // ---- Listeners ----

    /// Observe uid-level changes: fires on sign-in, sign-out and user
    /// replacement, not on token rotation. The listener also fires once
    /// with the current state as soon as initialization settles.
    pub fn on_auth_state_changed(
        &self,
        listener: impl Fn(Option<User>) + Send + Sync + 'static,
    ) -> ListenerRegistration {
        self.add_listener(ListenerChannel::AuthState, Arc::new(listener))
    }

    /// Observe every visible session change, including token rotation.
    pub fn on_id_token_changed(
        &self,
        listener: impl Fn(Option<User>) + Send + Sync + 'static,
    ) -> ListenerRegistration {
        self.add_listener(ListenerChannel::IdToken, Arc::new(listener))
    }

    fn add_listener(&self, channel: ListenerChannel, listener: Listener) -> ListenerRegistration {
        let id = Uuid::new_v4();
        let listeners = match channel {
            ListenerChannel::AuthState => &self.inner.auth_state_listeners,
            ListenerChannel::IdToken => &self.inner.id_token_listeners,
        };
        listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, Arc::clone(&listener)));

        // Prompt callback with the settled state, without waiting for the
        // next mutation.
        let auth = self.clone();
        tokio::spawn(async move {
            auth.await_initialized().await;
            listener(auth.current_user().await);
        });

        ListenerRegistration {
            auth: self.clone(),
            channel,
            id,
        }
    }

    /// Stream of auth-state changes, for `while let` style consumers.
    pub fn auth_state_changes(&self) -> impl Stream<Item = Option<User>> {
        let mut rx = self.inner.state_broadcast.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(user) => yield user,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auth state stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Fan the current state out to the listener channels. Must run
    /// inside a queued operation.
    async fn notify_listeners(&self) {
        if !*self.inner.initialized_tx.borrow() {
            return;
        }
        let user = self.current_user().await;
        let uid = user.as_ref().map(|u| u.uid().to_string());

        let id_token_listeners: Vec<Listener> = self
            .inner
            .id_token_listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in id_token_listeners {
            listener(user.clone());
        }

        let changed = {
            let mut last = self
                .inner
                .last_notified_uid
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let changed = uid_changed(&*last, uid.as_deref());
            if changed {
                *last = match &uid {
                    Some(uid) => LastUid::Uid(uid.clone()),
                    None => LastUid::SignedOut,
                };
            }
            changed
        };
        if changed {
            let auth_state_listeners: Vec<Listener> = self
                .inner
                .auth_state_listeners
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();
            for listener in auth_state_listeners {
                listener(user.clone());
            }
            let _ = self.inner.state_broadcast.send(user);
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("app_name", &self.inner.config.app_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_change_detection() {
        // The very first notification always goes through.
        assert!(uid_changed(&LastUid::Never, None));
        assert!(uid_changed(&LastUid::Never, Some("a")));

        assert!(!uid_changed(&LastUid::SignedOut, None));
        assert!(uid_changed(&LastUid::SignedOut, Some("a")));

        assert!(!uid_changed(&LastUid::Uid("a".to_string()), Some("a")));
        assert!(uid_changed(&LastUid::Uid("a".to_string()), Some("b")));
        assert!(uid_changed(&LastUid::Uid("a".to_string()), None));
    }
}
