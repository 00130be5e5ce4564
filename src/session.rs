//! Who is logged in.
//!
//! [`SessionManager`] is the single writer of the session: it runs the auth
//! calls through a shared [`ApiClient`], installs the resulting token on the
//! client, and exposes the derived state to the presentation layer.
//!
//! Each state-changing call takes a ticket from a counter. A successful
//! result is only applied if no later call has been issued in the meantime,
//! so a slow first `login` cannot overwrite a faster second one. Clearing
//! is different: `logout` clears as soon as it is issued, and a rejected
//! persisted token is dropped whenever the client still holds it.
//!
//! Token writes to the store happen after the session lock is released.
//! [`TokenStore`](crate::TokenStore) implementations are still called from
//! async code and should be quick (one small key-value write).

use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::Method;
use serde::Serialize;
use tokio::sync::watch;

use crate::client::ApiClient;
use crate::error::Error;
use crate::token;
use crate::types::{
    AuthResponse, Credentials, ProfileResponse, Registration, Session, SessionToken, User,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    Authenticated,
}

/// Point-in-time view of the session, as published to subscribers.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct SessionSnapshot {
    pub state: AuthState,
    pub user: Option<User>,
    pub error: Option<String>,
}

impl SessionSnapshot {
    fn anonymous() -> Self {
        Self {
            state: AuthState::Anonymous,
            user: None,
            error: None,
        }
    }
}

struct Inner {
    session: Option<Session>,
    error: Option<String>,
    latest: u64,
}

pub struct SessionManager {
    client: Arc<ApiClient>,
    inner: RwLock<Inner>,
    notify: watch::Sender<SessionSnapshot>,
}

impl SessionManager {
    /// Create an anonymous manager. Call [`restore`](Self::restore) to pick
    /// up a session persisted by an earlier process.
    #[must_use]
    pub fn new(client: Arc<ApiClient>) -> Self {
        let (notify, _) = watch::channel(SessionSnapshot::anonymous());
        Self {
            client,
            inner: RwLock::new(Inner {
                session: None,
                error: None,
                latest: 0,
            }),
            notify,
        }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    /// Rehydrate from the token the client loaded at construction.
    ///
    /// Returns `true` if the session was restored. Any failure (expired
    /// token, rejected token, unreachable server) leaves the manager
    /// anonymous with the persisted token removed; it is never reported
    /// as an error.
    pub async fn restore(&self) -> bool {
        let ticket = self.issue();
        let Some(token) = self.client.token() else {
            return false;
        };

        if token::is_locally_expired(&token, token::now_unix()) {
            tracing::info!("Persisted token expired, starting anonymous");
            return self.apply_restore(ticket, token, None);
        }

        let endpoint = self.client.config().endpoints().profile.clone();
        let profile = match self.client.get::<ProfileResponse>(&endpoint).await {
            Ok(profile) => Some(User::from(profile)),
            Err(e) => {
                tracing::info!(error = %e, "Persisted token rejected, starting anonymous");
                None
            }
        };

        self.apply_restore(ticket, token, profile)
    }

    /// # Errors
    ///
    /// Returns the request failure (state unchanged), or
    /// [`Error::Superseded`] if a newer session call was issued meanwhile.
    pub async fn login(&self, credentials: &Credentials) -> Result<User, Error> {
        let ticket = self.issue();
        let endpoint = self.client.config().endpoints().login.clone();
        let result = self.authenticate(&endpoint, credentials).await;
        self.commit(ticket, result, "login")
    }

    /// # Errors
    ///
    /// Same as [`login`](Self::login).
    pub async fn register(&self, details: &Registration) -> Result<User, Error> {
        let ticket = self.issue();
        let endpoint = self.client.config().endpoints().register.clone();
        let result = self.authenticate(&endpoint, details).await;
        self.commit(ticket, result, "register")
    }

    /// End the session.
    ///
    /// Local state is cleared before the server is told, so the manager is
    /// anonymous from the moment this is called; only a later successful
    /// login can replace that. The server call is best-effort and still
    /// carries the old token.
    pub async fn logout(&self) {
        let endpoint = self.client.config().endpoints().logout.clone();
        let farewell = match self.client.token() {
            Some(_) => match self.client.describe::<()>(Method::POST, &endpoint, None) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot build logout request, clearing session locally");
                    None
                }
            },
            None => None,
        };

        let change = {
            let mut inner = self.inner.write();
            // Supersedes any login still in flight.
            inner.latest += 1;
            let change = self.client.cache_token(None);
            inner.session = None;
            inner.error = None;
            tracing::info!("Session ended");
            self.publish(&inner);
            change
        };
        self.client.persist(change);

        if let Some(descriptor) = farewell {
            if let Err(e) = self.client.send_discarding_body(descriptor).await {
                tracing::warn!(error = %e, "Logout request failed, session already cleared locally");
            }
        }
    }

    /// True iff a session is held and the client still carries a token.
    ///
    /// Computed on every call so the two can never disagree silently.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.read().session.is_some() && self.client.token().is_some()
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        if self.is_authenticated() {
            AuthState::Authenticated
        } else {
            AuthState::Anonymous
        }
    }

    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        self.inner.read().session.as_ref().map(|s| s.user().clone())
    }

    #[must_use]
    pub fn token(&self) -> Option<SessionToken> {
        self.inner.read().session.as_ref().map(|s| s.token().clone())
    }

    /// Message of the last failed operation, cleared by the next success.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    pub fn clear_error(&self) {
        let mut inner = self.inner.write();
        if inner.error.take().is_some() {
            self.publish(&inner);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_of(&self.inner.read())
    }

    /// Receive a fresh [`SessionSnapshot`] after every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.notify.subscribe()
    }

    async fn authenticate<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<Session, Error> {
        let (status, response) = self
            .client
            .request_with_status::<AuthResponse, B>(Method::POST, endpoint, Some(body))
            .await?;
        response.into_session(status)
    }

    fn issue(&self) -> u64 {
        let mut inner = self.inner.write();
        inner.latest += 1;
        inner.latest
    }

    fn commit(
        &self,
        ticket: u64,
        result: Result<Session, Error>,
        operation: &'static str,
    ) -> Result<User, Error> {
        let mut inner = self.inner.write();
        if inner.latest != ticket {
            tracing::debug!(ticket, latest = inner.latest, operation, "Discarding superseded result");
            return Err(Error::Superseded);
        }

        match result {
            Ok(session) => {
                let change = self.client.cache_token(Some(session.token().clone()));
                let user = session.user().clone();
                inner.session = Some(session);
                inner.error = None;
                tracing::info!(user_id = %user.id, role = %user.role, operation, "Session established");
                self.publish(&inner);
                drop(inner);
                self.client.persist(change);
                Ok(user)
            }
            Err(e) => {
                tracing::warn!(error = %e, operation, "Authentication failed");
                inner.error = Some(e.to_string());
                self.publish(&inner);
                Err(e)
            }
        }
    }

    /// Apply the outcome of a rehydration attempt for `token`.
    ///
    /// Both branches only act while the client still holds `token`: a newer
    /// successful login or a logout has already replaced it otherwise. A
    /// newer call that failed changed nothing, so a stale result is applied
    /// as long as no session has been installed in the meantime.
    fn apply_restore(&self, ticket: u64, token: SessionToken, profile: Option<User>) -> bool {
        let mut inner = self.inner.write();
        let current = inner.latest == ticket;
        if self.client.token().as_ref() != Some(&token) {
            tracing::debug!(ticket, latest = inner.latest, "Token changed during restore, discarding");
            return false;
        }

        match profile {
            Some(user) if current || inner.session.is_none() => {
                tracing::info!(user_id = %user.id, "Session restored");
                inner.session = Some(Session::new(token, user));
                self.publish(&inner);
                true
            }
            Some(_) => {
                tracing::debug!(ticket, latest = inner.latest, "Discarding superseded restore");
                false
            }
            None => {
                let change = self.client.cache_token(None);
                if inner.session.as_ref().is_some_and(|s| s.token() == &token) {
                    inner.session = None;
                }
                self.publish(&inner);
                drop(inner);
                self.client.persist(change);
                false
            }
        }
    }

    fn snapshot_of(&self, inner: &Inner) -> SessionSnapshot {
        let authenticated = inner.session.is_some() && self.client.token().is_some();
        SessionSnapshot {
            state: if authenticated {
                AuthState::Authenticated
            } else {
                AuthState::Anonymous
            },
            user: inner.session.as_ref().map(|s| s.user().clone()),
            error: inner.error.clone(),
        }
    }

    fn publish(&self, inner: &Inner) {
        self.notify.send_replace(self.snapshot_of(inner));
    }
}

#[cfg(feature = "federated")]
mod federated {
    use serde::{Deserialize, Serialize};
    use url::Url;

    use super::SessionManager;
    use crate::error::Error;
    use crate::pkce::{self, CHALLENGE_METHOD, Pkce};
    use crate::types::User;

    /// Where to send the user for a federated login, plus the values to
    /// keep until the provider redirects back.
    #[derive(Debug, Clone)]
    #[non_exhaustive]
    pub struct FederatedRedirect {
        pub url: Url,
        pub provider: String,
        pub redirect_uri: Url,
        pub state: String,
        pub pkce: Pkce,
    }

    /// Query parameters the provider appends to the redirect URI.
    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct FederatedCallback {
        pub code: Option<String>,
        pub state: Option<String>,
        pub error: Option<String>,
        pub error_description: Option<String>,
    }

    #[derive(Serialize)]
    struct CallbackExchange<'a> {
        provider: &'a str,
        code: &'a str,
        code_verifier: &'a str,
        redirect_uri: &'a str,
    }

    impl SessionManager {
        /// Build the authorization redirect for `provider`. Session state is
        /// not touched; finish with
        /// [`complete_federated_login`](Self::complete_federated_login).
        ///
        /// # Errors
        ///
        /// Returns [`Error::Config`] if `provider` is not a plain identifier.
        pub fn federated_login(
            &self,
            provider: &str,
            redirect_uri: &Url,
        ) -> Result<FederatedRedirect, Error> {
            let valid = !provider.is_empty()
                && provider
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid {
                return Err(Error::Config(format!("invalid OAuth provider `{provider}`")));
            }

            let state = pkce::new_state();
            let pkce = Pkce::generate();

            let authorize = self.client.config().endpoints().oauth_authorize.clone();
            let mut url = self
                .client
                .endpoint_url(&format!("{}/{provider}", authorize.trim_end_matches('/')))?;
            url.query_pairs_mut()
                .append_pair("redirect_uri", redirect_uri.as_str())
                .append_pair("state", &state)
                .append_pair("code_challenge", pkce.challenge())
                .append_pair("code_challenge_method", CHALLENGE_METHOD);

            Ok(FederatedRedirect {
                url,
                provider: provider.to_owned(),
                redirect_uri: redirect_uri.clone(),
                state,
                pkce,
            })
        }

        /// Finish a federated login through the same path as
        /// [`login`](Self::login).
        ///
        /// # Errors
        ///
        /// Returns [`Error::OAuth`] if the provider reported an error or no
        /// code, [`Error::StateMismatch`] if the callback does not belong to
        /// `pending`, and otherwise the same errors as `login`.
        pub async fn complete_federated_login(
            &self,
            pending: &FederatedRedirect,
            callback: &FederatedCallback,
        ) -> Result<User, Error> {
            let ticket = self.issue();
            let result = self.exchange_callback(pending, callback).await;
            self.commit(ticket, result, "federated_login")
        }

        async fn exchange_callback(
            &self,
            pending: &FederatedRedirect,
            callback: &FederatedCallback,
        ) -> Result<crate::types::Session, Error> {
            if let Some(error) = &callback.error {
                let desc = callback.error_description.as_deref().unwrap_or(error);
                return Err(Error::OAuth(desc.to_owned()));
            }
            let code = callback
                .code
                .as_deref()
                .ok_or_else(|| Error::OAuth("missing_code".into()))?;
            if callback.state.as_deref() != Some(pending.state.as_str()) {
                tracing::warn!(provider = %pending.provider, "OAuth state mismatch");
                return Err(Error::StateMismatch);
            }

            let endpoint = self.client.config().endpoints().oauth_callback.clone();
            let body = CallbackExchange {
                provider: &pending.provider,
                code,
                code_verifier: pending.pkce.verifier(),
                redirect_uri: pending.redirect_uri.as_str(),
            };
            self.authenticate(&endpoint, &body).await
        }
    }
}

#[cfg(feature = "federated")]
pub use federated::{FederatedCallback, FederatedRedirect};
