//! The session store: who is signed in, with which credential.
//!
//! `SessionStore` is the only component that mutates the credential and
//! identity, in memory or in persisted storage. It guarantees:
//!
//! - credential and identity are both present or both absent,
//! - at most one refresh network call is in flight; concurrent callers join
//!   the running episode and observe its outcome,
//! - a refresh that finishes after the session was torn down or replaced
//!   never reinstalls its credential,
//! - concurrent logouts collapse into a single teardown, and a teardown
//!   never removes a session installed by a login that finished after the
//!   logout began.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::client::ApiClient;

use super::error::{AuthError, RefreshError};
use super::identity::{Identity, Role};
use super::storage::{PersistedSession, SessionStorage};
use super::token::Credential;

/// Default margin before expiry at which the timer refreshes
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(60);

/// Default time the logout guard lingers after a teardown
pub const DEFAULT_LOGOUT_GUARD: Duration = Duration::from_secs(2);

/// Lower bound for the pre-emptive timer so short-lived tokens cannot spin
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub refresh_skew: Duration,
    pub logout_guard: Duration,
    pub preemptive_refresh: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_skew: DEFAULT_REFRESH_SKEW,
            logout_guard: DEFAULT_LOGOUT_GUARD,
            preemptive_refresh: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    UserRequested,
    RefreshRejected,
    Inactivity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn(Identity),
    Refreshed,
    LoggedOut { reason: LogoutReason },
    /// The UI should navigate to its login entry point.
    LoginRequired,
}

struct AuthState {
    credential: Credential,
    identity: Identity,
}

#[derive(Default)]
struct SessionState {
    auth: Option<AuthState>,
    /// Bumped whenever the session is replaced or torn down
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogoutGuard {
    Idle,
    Running,
    Lingering(Instant),
}

impl LogoutGuard {
    fn is_active(&self, now: Instant) -> bool {
        match *self {
            LogoutGuard::Idle => false,
            LogoutGuard::Running => true,
            LogoutGuard::Lingering(until) => now < until,
        }
    }
}

type Episode = Shared<BoxFuture<'static, Result<Credential, RefreshError>>>;

struct Inner {
    api: ApiClient,
    storage: Arc<dyn SessionStorage>,
    config: SessionConfig,
    state: RwLock<SessionState>,
    /// Orders writes to `storage`; never held together with `state`'s write lock
    storage_lock: Mutex<()>,
    identity_tx: watch::Sender<Option<Identity>>,
    events_tx: broadcast::Sender<SessionEvent>,
    episode: Mutex<Option<Episode>>,
    logout_guard: Mutex<LogoutGuard>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delay until the pre-emptive refresh for a token expiring at `expires_at`.
pub(crate) fn refresh_delay(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    skew: Duration,
) -> Duration {
    let remaining = expires_at - now;
    let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::MAX);
    let target = if remaining > skew {
        remaining - skew
    } else {
        remaining / 2
    };
    target.to_std().unwrap_or(Duration::ZERO).max(MIN_REFRESH_DELAY)
}

/// Handle to the session. Clone is cheap; all clones share one session.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

/// Non-owning handle used by background tasks so they never keep a dead
/// session alive.
#[derive(Clone)]
pub(crate) struct WeakSessionStore {
    inner: Weak<Inner>,
}

impl WeakSessionStore {
    pub(crate) fn upgrade(&self) -> Option<SessionStore> {
        self.inner.upgrade().map(|inner| SessionStore { inner })
    }
}

impl SessionStore {
    pub fn new(api: ApiClient, storage: Arc<dyn SessionStorage>, config: SessionConfig) -> Self {
        let (identity_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                storage,
                config,
                state: RwLock::new(SessionState::default()),
                storage_lock: Mutex::new(()),
                identity_tx,
                events_tx,
                episode: Mutex::new(None),
                logout_guard: Mutex::new(LogoutGuard::Idle),
                timer: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakSessionStore {
        WeakSessionStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    /// Sign in and install the new session
    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, AuthError> {
        debug!(username, "Logging in");
        let (credential, identity) = self.inner.api.login(username, password).await?;

        if credential.expires_at().is_none() {
            warn!("Access token from login has no readable expiry; treating it as expired");
        }

        *lock(&self.inner.logout_guard) = LogoutGuard::Idle;
        self.inner.install_session(credential.clone(), identity.clone());
        self.inner.schedule_refresh(&credential);
        let _ = self
            .inner
            .events_tx
            .send(SessionEvent::LoggedIn(identity.clone()));

        info!(username = %identity.username, role = %identity.role, "Login successful");
        Ok(identity)
    }

    /// Create an account without signing in
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        role: Option<Role>,
    ) -> Result<(), AuthError> {
        self.inner.api.register(username, password, role).await?;
        info!(username, "Account registered");
        Ok(())
    }

    /// End the session. Returns immediately if a logout is already running.
    pub async fn logout(&self) {
        self.inner.end_session(LogoutReason::UserRequested).await;
    }

    pub(crate) async fn logout_for(&self, reason: LogoutReason) {
        self.inner.end_session(reason).await;
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner
            .read_state()
            .auth
            .as_ref()
            .map(|auth| auth.credential.clone())
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner
            .read_state()
            .auth
            .as_ref()
            .map(|auth| auth.identity.clone())
    }

    /// Check if a credential exists and its access token has not expired
    pub fn is_valid(&self) -> bool {
        self.inner
            .read_state()
            .auth
            .as_ref()
            .map(|auth| auth.credential.is_valid())
            .unwrap_or(false)
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.inner
            .read_state()
            .auth
            .as_ref()
            .map(|auth| auth.identity.has_role(role))
            .unwrap_or(false)
    }

    /// Whether a refresh episode is currently in flight
    pub fn is_refreshing(&self) -> bool {
        lock(&self.inner.episode).is_some()
    }

    /// Current identity and all future changes to it
    pub fn subscribe_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.inner.identity_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Install the persisted session, if a complete one exists. No network
    /// call is made. Returns whether a session was restored.
    pub fn restore_from_storage(&self) -> bool {
        let Some(persisted) = PersistedSession::load(self.inner.storage.as_ref()) else {
            debug!("No persisted session to restore");
            return false;
        };

        let PersistedSession {
            credential,
            identity,
        } = persisted;
        debug!(
            username = %identity.username,
            valid = credential.is_valid(),
            "Restoring persisted session"
        );
        self.inner.install_session(credential.clone(), identity);
        self.inner.schedule_refresh(&credential);
        true
    }

    /// Obtain a fresh credential. Joins the in-flight refresh if there is one.
    pub async fn refresh(&self) -> Result<Credential, RefreshError> {
        self.refresh_rejected(None).await
    }

    /// Refresh on behalf of a call that was rejected while carrying
    /// `rejected_token`. If the session already moved on to a different
    /// access token, that one is returned without a network call.
    pub(crate) async fn refresh_rejected(
        &self,
        rejected_token: Option<&str>,
    ) -> Result<Credential, RefreshError> {
        let episode = {
            let mut slot = lock(&self.inner.episode);
            if let Some(episode) = slot.as_ref() {
                debug!("Joining in-flight refresh");
                episode.clone()
            } else {
                if let Some(rejected) = rejected_token {
                    if let Some(current) = self.credential() {
                        if current.access_token() != rejected {
                            debug!("Credential already renewed; skipping refresh");
                            return Ok(current);
                        }
                    }
                }
                let episode = self.inner.start_episode();
                *slot = Some(episode.clone());
                episode
            }
        };
        episode.await
    }

    /// Cancel the pre-emptive refresh timer
    pub fn shutdown(&self) {
        self.inner.cancel_timer();
    }
}

impl Inner {
    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn logout_guard_active(&self) -> bool {
        lock(&self.logout_guard).is_active(Instant::now())
    }

    fn generation(&self) -> u64 {
        self.read_state().generation
    }

    /// Write the session to storage unless it has been replaced or torn
    /// down since `generation`. Storage I/O happens outside the state lock.
    fn persist(&self, generation: u64, credential: &Credential, identity: &Identity) {
        let _storage = lock(&self.storage_lock);
        if self.generation() != generation {
            debug!("Session changed before it was persisted; skipping write");
            return;
        }
        let persisted = PersistedSession {
            credential: credential.clone(),
            identity: identity.clone(),
        };
        if let Err(e) = persisted.save(self.storage.as_ref()) {
            warn!(error = %e, "Failed to persist session");
        }
    }

    /// Replace the whole session. The identity observable changes under the
    /// same lock as the credential.
    fn install_session(&self, credential: Credential, identity: Identity) {
        let generation = {
            let mut state = self.write_state();
            state.generation += 1;
            state.auth = Some(AuthState {
                credential: credential.clone(),
                identity: identity.clone(),
            });
            self.identity_tx.send_replace(Some(identity.clone()));
            state.generation
        };
        self.persist(generation, &credential, &identity);
    }

    /// Tear down the session of `expected` generation. Returns false, leaving
    /// everything untouched, if a newer session has been installed since.
    fn clear_session(&self, expected: u64) -> bool {
        let generation = {
            let mut state = self.write_state();
            if state.generation != expected {
                return false;
            }
            state.generation += 1;
            state.auth = None;
            self.identity_tx.send_replace(None);
            state.generation
        };

        let _storage = lock(&self.storage_lock);
        if self.generation() == generation {
            if let Err(e) = PersistedSession::clear(self.storage.as_ref()) {
                warn!(error = %e, "Failed to clear persisted session");
            }
        }
        true
    }

    fn start_episode(self: &Arc<Self>) -> Episode {
        let inner = Arc::clone(self);
        // The refresh runs on its own task so it settles even if every
        // waiter is dropped.
        let handle = tokio::spawn(async move {
            let outcome = inner.perform_refresh().await;
            *lock(&inner.episode) = None;
            outcome
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(RefreshError::Transient(format!("Refresh task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    async fn perform_refresh(self: &Arc<Self>) -> Result<Credential, RefreshError> {
        if self.logout_guard_active() {
            debug!("Refresh rejected: logout in progress");
            return Err(RefreshError::LoggedOut);
        }

        let (generation, refresh_token) = {
            let state = self.read_state();
            match state.auth.as_ref() {
                Some(auth) => (state.generation, auth.credential.refresh_token().to_string()),
                None => return Err(RefreshError::NoSession),
            }
        };

        debug!("Refreshing access token");
        match self.api.refresh(&refresh_token).await {
            Ok(tokens) => {
                let (credential, identity) = {
                    let mut state = self.write_state();
                    if state.generation != generation || self.logout_guard_active() {
                        debug!("Discarding refresh result for a session that has ended");
                        return Err(RefreshError::LoggedOut);
                    }
                    let Some(auth) = state.auth.as_mut() else {
                        return Err(RefreshError::LoggedOut);
                    };
                    auth.credential = auth
                        .credential
                        .renewed(tokens.access_token, tokens.refresh_token);
                    (auth.credential.clone(), auth.identity.clone())
                };
                self.persist(generation, &credential, &identity);

                self.schedule_refresh(&credential);
                let _ = self.events_tx.send(SessionEvent::Refreshed);
                info!(expires_at = ?credential.expires_at(), "Access token refreshed");
                Ok(credential)
            }
            Err(e) if e.forces_logout() => {
                warn!(error = %e, "Refresh token rejected; ending session");
                self.end_session(LogoutReason::RefreshRejected).await;
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Refresh failed; keeping session for a later retry");
                Err(e)
            }
        }
    }

    async fn end_session(self: &Arc<Self>, reason: LogoutReason) {
        {
            let mut guard = lock(&self.logout_guard);
            if guard.is_active(Instant::now()) {
                debug!(?reason, "Logout already in progress");
                return;
            }
            *guard = LogoutGuard::Running;
        }

        let generation = self.generation();
        self.cancel_timer();

        // Best effort: the local teardown does not depend on the server
        if let Err(e) = self.api.logout().await {
            debug!(error = %e, "Server logout failed; continuing local cleanup");
        }

        if !self.clear_session(generation) {
            // A login finished while the server call was in flight; its
            // session stays and the guard must not block its refreshes.
            let mut guard = lock(&self.logout_guard);
            if *guard == LogoutGuard::Running {
                *guard = LogoutGuard::Idle;
            }
            info!(?reason, "Session replaced during logout; keeping the new session");
            return;
        }
        let _ = self.events_tx.send(SessionEvent::LoggedOut { reason });
        let _ = self.events_tx.send(SessionEvent::LoginRequired);

        *lock(&self.logout_guard) = LogoutGuard::Lingering(Instant::now() + self.config.logout_guard);
        info!(?reason, "Logged out");
    }

    fn schedule_refresh(self: &Arc<Self>, credential: &Credential) {
        if !self.config.preemptive_refresh {
            return;
        }
        let Some(expires_at) = credential.expires_at() else {
            debug!("Access token has no expiry; pre-emptive refresh not scheduled");
            self.cancel_timer();
            return;
        };

        let delay = refresh_delay(expires_at, Utc::now(), self.config.refresh_skew);
        debug!(delay_secs = delay.as_secs(), "Scheduling pre-emptive refresh");

        let weak = WeakSessionStore {
            inner: Arc::downgrade(self),
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(store) = weak.upgrade() else {
                return;
            };
            debug!("Pre-emptive refresh timer fired");
            if let Err(e) = store.refresh().await {
                warn!(error = %e, "Pre-emptive refresh failed");
            }
        });

        if let Some(previous) = lock(&self.timer).replace(handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
