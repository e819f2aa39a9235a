//! Session store
//!
//! Single source of truth for the token pair and role. It persists them through
//! a [`TokenStore`], derives the logged-in state from the access token's `exp`
//! claim, and keeps the access token alive with a one-shot refresh timer that
//! fires [`SessionConfig::refresh_lead`] before expiry.
//!
//! Every refresh (proactive timer, startup reconciliation, or a `401` seen by
//! the [`Gateway`](crate::Gateway)) goes through one shared in-flight
//! operation, so at most one refresh call reaches the backend at a time.

pub mod storage;

use anagrafe_core::{AuthResponse, LoginRequest, RegistrationRequest, Role, UserResponse, jwt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::error::ClientError;
use storage::{StoredTokens, TokenStore};

/// Default time before expiry at which the access token is refreshed
pub const DEFAULT_REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);

/// Backend calls the session store depends on
#[async_trait]
pub trait AuthBackend: Send + Sync + 'static {
    async fn login(&self, credentials: &LoginRequest) -> Result<AuthResponse, ClientError>;

    async fn register(&self, profile: &RegistrationRequest) -> Result<UserResponse, ClientError>;

    async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, ClientError>;

    async fn logout(&self, refresh_token: &str) -> Result<(), ClientError>;
}

/// Session store configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long before expiry the proactive refresh fires
    pub refresh_lead: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_lead: DEFAULT_REFRESH_LEAD,
        }
    }
}

/// An authenticated session
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub role: Role,
    pub codice_fiscale: Option<String>,
}

impl Session {
    /// Expiry of the access token
    pub fn expires_at(&self) -> Result<DateTime<Utc>, anagrafe_core::TokenDecodeError> {
        jwt::expires_at(&self.access_token)
    }
}

impl From<AuthResponse> for Session {
    fn from(response: AuthResponse) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            role: response.ruolo,
            codice_fiscale: Some(response.codice_fiscale),
        }
    }
}

impl From<&Session> for StoredTokens {
    fn from(session: &Session) -> Self {
        Self {
            access_token: Some(session.access_token.clone()),
            refresh_token: Some(session.refresh_token.clone()),
            role: Some(session.role),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("codice_fiscale", &self.codice_fiscale)
            .finish_non_exhaustive()
    }
}

/// Published authentication state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub role: Option<Role>,
}

type RefreshFuture = BoxFuture<'static, Result<Session, Arc<ClientError>>>;

struct RefreshFlight {
    id: u64,
    future: Shared<RefreshFuture>,
}

struct RefreshTimer {
    id: u64,
    fires_at: Instant,
    handle: JoinHandle<()>,
}

struct Inner {
    backend: Arc<dyn AuthBackend>,
    tokens: Arc<dyn TokenStore>,
    config: SessionConfig,
    status: watch::Sender<AuthStatus>,
    in_flight: Mutex<Option<RefreshFlight>>,
    timer: Mutex<Option<RefreshTimer>>,
    next_timer_id: AtomicU64,
    next_flight_id: AtomicU64,
    /// Bumped whenever the stored session is replaced or cleared
    generation: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.handle.abort();
        }
    }
}

/// Handle to the process-wide session; cheap to clone
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    /// Create a store over already-persisted tokens
    ///
    /// Nothing is scheduled until [`start`](Self::start) runs.
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        tokens: Arc<dyn TokenStore>,
        config: SessionConfig,
    ) -> Self {
        let initial = status_of(&tokens.snapshot());
        let (status, _) = watch::channel(initial);

        Self {
            inner: Arc::new(Inner {
                backend,
                tokens,
                config,
                status,
                in_flight: Mutex::new(None),
                timer: Mutex::new(None),
                next_timer_id: AtomicU64::new(0),
                next_flight_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Reconcile persisted tokens at process start
    pub async fn start(&self) {
        self.check_token_validity().await;
    }

    /// Teardown hook: cancel the pending refresh timer
    pub fn shutdown(&self) {
        self.cancel_refresh_timer();
    }

    /// Log in and store the issued tokens. Nothing changes locally on failure.
    pub async fn login(&self, credentials: &LoginRequest) -> Result<Session, ClientError> {
        match self.inner.backend.login(credentials).await {
            Ok(response) => {
                let session = self.apply(response);
                if self.access_token().as_deref() == Some(session.access_token.as_str()) {
                    info!(role = %session.role, "logged in");
                } else {
                    warn!(
                        role = %session.role,
                        "issued access token expires within the refresh lead, session not kept"
                    );
                }
                Ok(session)
            }
            Err(err) => {
                warn!(error = %err, "login failed");
                Err(err)
            }
        }
    }

    /// Register an account; the session is left untouched
    pub async fn register(
        &self,
        profile: &RegistrationRequest,
    ) -> Result<UserResponse, ClientError> {
        self.inner
            .backend
            .register(profile)
            .await
            .inspect_err(|err| warn!(error = %err, "registration failed"))
    }

    /// Register an account, then log in with the same credentials
    pub async fn register_and_login(
        &self,
        profile: &RegistrationRequest,
    ) -> Result<Session, ClientError> {
        let user = self.register(profile).await?;
        debug!(user_id = user.id, "registered, logging in");
        self.login(&profile.credentials()).await
    }

    /// Exchange `refresh_token` for a new token pair
    ///
    /// Joins the refresh already in flight if there is one. On failure the
    /// session is cleared and every caller sharing the flight gets the error.
    /// A flight whose session was logged out or replaced meanwhile leaves the
    /// store alone and fails with [`ClientError::SessionClosed`].
    pub async fn refresh(&self, refresh_token: &str) -> Result<Session, ClientError> {
        let future = {
            let mut slot = lock(&self.inner.in_flight);
            if let Some(flight) = slot.as_ref() {
                debug!("joining in-flight token refresh");
                flight.future.clone()
            } else {
                let id = self.inner.next_flight_id.fetch_add(1, Ordering::Relaxed);
                let future = self.start_refresh(id, refresh_token.to_string()).shared();
                *slot = Some(RefreshFlight {
                    id,
                    future: future.clone(),
                });
                future
            }
        };

        future.await.map_err(ClientError::RefreshFailed)
    }

    /// Refresh with the stored refresh token
    pub async fn refresh_current(&self) -> Result<Session, ClientError> {
        let refresh_token = self.refresh_token().ok_or(ClientError::NoRefreshToken)?;
        self.refresh(&refresh_token).await
    }

    /// Clear the session now and revoke the refresh token in the background
    ///
    /// Local state is gone before this returns. The returned handle tracks the
    /// best-effort server call; its failure is only logged.
    pub fn logout(&self) -> Option<JoinHandle<()>> {
        let refresh_token = self.refresh_token();
        self.clear();
        info!("logged out");

        let refresh_token = refresh_token?;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, skipping server-side logout");
            return None;
        };

        let backend = Arc::clone(&self.inner.backend);
        Some(runtime.spawn(async move {
            if let Err(err) = backend.logout(&refresh_token).await {
                warn!(error = %err, "server-side logout failed, local session already cleared");
            }
        }))
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.tokens.snapshot().access_token
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner.tokens.snapshot().refresh_token
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.tokens.snapshot().role
    }

    pub fn is_admin(&self) -> bool {
        self.role() == Some(Role::Admin)
    }

    /// Whether a stored access token exists and has not expired
    pub fn has_valid_token(&self) -> bool {
        self.access_token()
            .is_some_and(|token| jwt::is_token_valid(&token, Utc::now()))
    }

    pub fn is_logged_in(&self) -> bool {
        self.has_valid_token()
    }

    /// Whether the stored role is one of `allowed`
    pub fn has_role(&self, allowed: &[Role]) -> bool {
        self.role().is_some_and(|role| allowed.contains(&role))
    }

    /// Expiry of the stored access token, when it can be decoded
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.access_token()
            .and_then(|token| jwt::expires_at(&token).ok())
    }

    /// Last published authentication state
    pub fn status(&self) -> AuthStatus {
        *self.inner.status.borrow()
    }

    /// Subscribe to authentication state changes
    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.inner.status.subscribe()
    }

    /// Time left until the scheduled proactive refresh
    pub fn next_refresh_in(&self) -> Option<Duration> {
        lock(&self.inner.timer)
            .as_ref()
            .map(|timer| timer.fires_at.saturating_duration_since(Instant::now()))
    }

    async fn check_token_validity(&self) {
        let stored = self.inner.tokens.snapshot();

        let Some(access_token) = stored.access_token else {
            self.clear();
            return;
        };

        let expires_at = match jwt::expires_at(&access_token) {
            Ok(expires_at) => expires_at,
            Err(err) => {
                warn!(error = %err, "stored access token has no usable expiry");
                return;
            }
        };

        if Utc::now() < expires_at {
            self.schedule_refresh(&access_token);
            return;
        }

        match stored.refresh_token {
            Some(refresh_token) => {
                info!("stored access token expired, refreshing");
                match self.refresh(&refresh_token).await {
                    Ok(_) => info!("access token refreshed at startup"),
                    Err(err) if is_superseded(&err) => {
                        debug!("session changed during startup refresh");
                    }
                    Err(_) => {
                        self.logout();
                    }
                }
            }
            None => {
                info!("stored access token expired and no refresh token, clearing session");
                self.clear();
            }
        }
    }

    fn start_refresh(&self, id: u64, refresh_token: String) -> RefreshFuture {
        let backend = Arc::clone(&self.inner.backend);
        let weak = Arc::downgrade(&self.inner);
        let generation = self.inner.generation.load(Ordering::SeqCst);

        async move {
            info!("refreshing access token");
            let outcome = backend.refresh(&refresh_token).await;

            let Some(inner) = weak.upgrade() else {
                return Err(Arc::new(ClientError::SessionClosed));
            };
            let store = SessionStore { inner };

            let result = if store.inner.generation.load(Ordering::SeqCst) == generation {
                match outcome {
                    Ok(response) => {
                        let session = store.apply(response);
                        debug!("access token refreshed");
                        Ok(session)
                    }
                    Err(err) => {
                        warn!(error = %err, "token refresh failed, ending session");
                        store.clear();
                        Err(Arc::new(err))
                    }
                }
            } else {
                info!("session changed while refreshing, discarding refresh result");
                Err(Arc::new(ClientError::SessionClosed))
            };

            store.release_flight(id);
            result
        }
        .boxed()
    }

    /// Empty the in-flight slot if it still holds flight `id`
    fn release_flight(&self, id: u64) {
        let mut slot = lock(&self.inner.in_flight);
        if slot.as_ref().is_some_and(|flight| flight.id == id) {
            slot.take();
        }
    }

    /// Store a freshly issued token pair and schedule its refresh
    fn apply(&self, response: AuthResponse) -> Session {
        let session = Session::from(response);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.tokens.replace(StoredTokens::from(&session));
        self.publish();
        self.schedule_refresh(&session.access_token);
        session
    }

    /// Drop tokens, role and schedule together
    ///
    /// A refresh still in flight is detached; its answer no longer applies.
    fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.in_flight).take();
        self.cancel_refresh_timer();
        self.inner.tokens.clear();
        self.publish();
    }

    fn publish(&self) {
        let status = status_of(&self.inner.tokens.snapshot());
        self.inner.status.send_replace(status);
    }

    fn schedule_refresh(&self, access_token: &str) {
        let expires_at = match jwt::expires_at(access_token) {
            Ok(expires_at) => expires_at,
            Err(err) => {
                warn!(error = %err, "access token has no usable expiry, refresh not scheduled");
                self.cancel_refresh_timer();
                return;
            }
        };

        if self.refresh_token().is_none() {
            info!("no refresh token to keep the session alive, logging out");
            self.logout();
            return;
        }

        let lead_ms =
            i64::try_from(self.inner.config.refresh_lead.as_millis()).unwrap_or(i64::MAX);
        let delay_ms = expires_at
            .timestamp_millis()
            .saturating_sub(Utc::now().timestamp_millis())
            .saturating_sub(lead_ms);

        if delay_ms <= 0 {
            info!(delay_ms, "access token expires within the refresh lead, logging out");
            self.logout();
            return;
        }

        let delay = Duration::from_millis(delay_ms.unsigned_abs());
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(run_refresh_timer(Arc::downgrade(&self.inner), id, delay));

        info!(minutes = delay.as_secs() / 60, "scheduled access token refresh");
        let previous = lock(&self.inner.timer).replace(RefreshTimer {
            id,
            fires_at: Instant::now() + delay,
            handle,
        });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    fn cancel_refresh_timer(&self) {
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.handle.abort();
        }
    }
}

async fn run_refresh_timer(weak: Weak<Inner>, id: u64, delay: Duration) {
    tokio::time::sleep(delay).await;

    let Some(inner) = weak.upgrade() else {
        return;
    };
    {
        // Detach ourselves so rescheduling during the refresh does not abort this task
        let mut timer = lock(&inner.timer);
        if timer.as_ref().is_some_and(|timer| timer.id == id) {
            timer.take();
        }
    }
    let store = SessionStore { inner };

    match store.refresh_token() {
        Some(refresh_token) => match store.refresh(&refresh_token).await {
            Ok(_) => {}
            Err(err) if is_superseded(&err) => {
                debug!("session changed during scheduled refresh");
            }
            Err(_) => {
                store.logout();
            }
        },
        None => {
            store.logout();
        }
    }
}

/// The refresh was overtaken by a logout or a new login
fn is_superseded(err: &ClientError) -> bool {
    matches!(
        err,
        ClientError::RefreshFailed(cause) if matches!(**cause, ClientError::SessionClosed)
    )
}

fn status_of(tokens: &StoredTokens) -> AuthStatus {
    let authenticated = tokens
        .access_token
        .as_deref()
        .is_some_and(|token| jwt::is_token_valid(token, Utc::now()));

    AuthStatus {
        authenticated,
        role: tokens.role,
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
