//! Interactive sign-in: authorization URL construction, the local callback
//! listener or hosted poll loop, and the single-flight pending request.

pub mod callback;
pub mod pkce;
pub mod poll;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use crate::config::{CredentialConfig, SignInMode};
use crate::error::AuthError;
use crate::exchange::ExchangeEngine;
use crate::keyed::KeyedMutex;
use crate::store::DelegatedTokenStore;
use crate::token::{DelegatedToken, ScopeSet};

/// Terminal result of a sign-in attempt, shared by every waiter.
#[derive(Debug, Clone)]
pub enum SignInOutcome {
    Completed(DelegatedToken),
    Failed(SignInFailure),
}

/// Cloneable summary of why a sign-in did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInFailure {
    TimedOut(Duration),
    Cancelled(String),
    Rejected(String),
    Storage(String),
}

impl SignInFailure {
    fn from_error(err: &AuthError) -> Self {
        match err {
            AuthError::Timeout { duration } => SignInFailure::TimedOut(*duration),
            AuthError::UserCancelled(detail) => SignInFailure::Cancelled(detail.clone()),
            AuthError::StorageUnavailable(detail) => SignInFailure::Storage(detail.clone()),
            other => SignInFailure::Rejected(other.to_string()),
        }
    }

    pub fn to_error(&self) -> AuthError {
        match self {
            SignInFailure::TimedOut(duration) => AuthError::Timeout {
                duration: *duration,
            },
            SignInFailure::Cancelled(detail) => AuthError::UserCancelled(detail.clone()),
            SignInFailure::Rejected(detail) => AuthError::SignInFailed(detail.clone()),
            SignInFailure::Storage(detail) => AuthError::StorageUnavailable(detail.clone()),
        }
    }
}

type OutcomeSender = Arc<watch::Sender<Option<SignInOutcome>>>;

/// One pending interactive authorization attempt.
///
/// Dropping the last handle to a request aborts its listener or poll task.
pub struct SignInRequest {
    id: Uuid,
    subject: String,
    authorization_url: String,
    redirect_uri: String,
    created_at: DateTime<Utc>,
    outcome_tx: OutcomeSender,
    outcome_rx: watch::Receiver<Option<SignInOutcome>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignInRequest {
    fn is_resolved(&self) -> bool {
        self.outcome_rx.borrow().is_some()
    }

    /// Record `outcome` unless another one already won.
    fn resolve(&self, outcome: SignInOutcome) {
        resolve_once(&self.outcome_tx, outcome);
    }

    /// Stop the driver task and wait until its listener or poll loop is gone.
    async fn shutdown(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SignInRequest {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

fn resolve_once(tx: &watch::Sender<Option<SignInOutcome>>, outcome: SignInOutcome) {
    tx.send_if_modified(|slot| {
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        true
    });
}

/// Caller's reference to a pending sign-in. Cheap to clone; all clones
/// observe the same outcome.
#[derive(Clone)]
pub struct SignInHandle {
    request: Arc<SignInRequest>,
}

impl SignInHandle {
    pub fn id(&self) -> Uuid {
        self.request.id
    }

    pub fn subject(&self) -> &str {
        &self.request.subject
    }

    pub fn authorization_url(&self) -> &str {
        &self.request.authorization_url
    }

    pub fn redirect_uri(&self) -> &str {
        &self.request.redirect_uri
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.request.created_at
    }

    /// The outcome, if the request has resolved.
    pub fn outcome(&self) -> Option<SignInOutcome> {
        self.request.outcome_rx.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.request.is_resolved()
    }

    pub fn same_request(&self, other: &SignInHandle) -> bool {
        Arc::ptr_eq(&self.request, &other.request)
    }
}

impl std::fmt::Debug for SignInHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignInHandle")
            .field("id", &self.request.id)
            .field("subject", &self.request.subject)
            .field("created_at", &self.request.created_at)
            .finish()
    }
}

/// Drives interactive sign-in. At most one request is pending per subject;
/// later callers join it instead of generating a second URL.
pub struct SignInCoordinator {
    config: Arc<CredentialConfig>,
    engine: Arc<ExchangeEngine>,
    store: Arc<DelegatedTokenStore>,
    pending: Mutex<HashMap<String, Weak<SignInRequest>>>,
    /// Per subject, held across the bind so concurrent callers for the same
    /// subject see the new request instead of racing for the port.
    starting: KeyedMutex<String, ()>,
    urls_issued: AtomicUsize,
}

impl SignInCoordinator {
    pub fn new(
        config: Arc<CredentialConfig>,
        engine: Arc<ExchangeEngine>,
        store: Arc<DelegatedTokenStore>,
    ) -> Self {
        Self {
            config,
            engine,
            store,
            pending: Mutex::new(HashMap::new()),
            starting: KeyedMutex::new(),
            urls_issued: AtomicUsize::new(0),
        }
    }

    /// Start a sign-in for `subject`, or join the one already pending.
    /// Returns without waiting for the user.
    pub async fn begin_sign_in(
        &self,
        subject: &str,
        requested_scopes: &ScopeSet,
    ) -> Result<SignInHandle, AuthError> {
        let _starting = self.starting.lock(&subject.to_string()).await;
        if let Some(request) = self.live_request(subject) {
            tracing::debug!(subject, id = %request.id, "joining pending sign-in");
            return Ok(SignInHandle { request });
        }

        // Configured scopes always ride along so offline_access is never lost.
        let scopes: ScopeSet = self
            .config
            .delegated
            .scopes
            .iter()
            .chain(requested_scopes.iter())
            .collect();
        let state = pkce::generate_state();
        let mode = self.config.sign_in.mode;

        // Bind before registering so a bind failure leaves nothing pending.
        let (listener, redirect_uri, verifier, challenge) = match mode {
            SignInMode::Local => {
                let (listener, uri) = callback::bind_redirect(&self.config.redirect_uri()).await?;
                let challenge = pkce::generate_pkce();
                (
                    Some(listener),
                    uri,
                    Some(challenge.code_verifier),
                    Some(challenge.code_challenge),
                )
            }
            SignInMode::Hosted => (None, self.config.redirect_uri(), None, None),
        };
        let authorization_url =
            self.authorization_url(&redirect_uri, &scopes, &state, challenge.as_deref())?;

        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        let request = Arc::new(SignInRequest {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            authorization_url,
            redirect_uri: redirect_uri.clone(),
            created_at: Utc::now(),
            outcome_tx: tx.clone(),
            outcome_rx: rx,
            task: Mutex::new(None),
        });

        let driver = SignInDriver {
            engine: self.engine.clone(),
            store: self.store.clone(),
            subject: subject.to_string(),
            scopes,
            state,
            redirect_uri,
            verifier,
            poll_interval: self.config.sign_in.poll_interval,
        };
        let deadline = self.config.sign_in.timeout;
        let task = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(deadline, driver.run(listener)).await {
                Ok(Ok(token)) => SignInOutcome::Completed(token),
                Ok(Err(e)) => {
                    tracing::info!(subject = %driver.subject, "sign-in did not complete: {e}");
                    SignInOutcome::Failed(SignInFailure::from_error(&e))
                }
                Err(_) => SignInOutcome::Failed(SignInFailure::TimedOut(deadline)),
            };
            resolve_once(&tx, outcome);
        });
        *request.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subject.to_string(), Arc::downgrade(&request));
        self.urls_issued.fetch_add(1, Ordering::SeqCst);
        tracing::info!(subject, id = %request.id, ?mode, "sign-in started");
        Ok(SignInHandle { request })
    }

    /// Wait up to `timeout` for the sign-in behind `handle`.
    ///
    /// On timeout the request is abandoned for every waiter, its listener or
    /// poll loop is stopped before this returns, and the next
    /// `begin_sign_in` starts a fresh request.
    pub async fn await_completion(
        &self,
        handle: &SignInHandle,
        timeout: Duration,
    ) -> Result<DelegatedToken, AuthError> {
        let mut rx = handle.request.outcome_rx.clone();
        let waited = tokio::time::timeout(timeout, async {
            match rx.wait_for(Option::is_some).await {
                Ok(outcome) => (*outcome).clone(),
                Err(_) => None,
            }
        })
        .await;

        let outcome = match waited {
            Ok(Some(outcome)) => outcome,
            Ok(None) => SignInOutcome::Failed(SignInFailure::Rejected(
                "sign-in ended without a result".into(),
            )),
            Err(_) => {
                handle
                    .request
                    .resolve(SignInOutcome::Failed(SignInFailure::TimedOut(timeout)));
                // The driver may have resolved first; report whatever won.
                handle.outcome().unwrap_or(SignInOutcome::Failed(SignInFailure::TimedOut(timeout)))
            }
        };

        handle.request.shutdown().await;
        self.forget(handle);

        match outcome {
            SignInOutcome::Completed(token) => Ok(token),
            SignInOutcome::Failed(failure) => Err(failure.to_error()),
        }
    }

    /// Abandon a pending request and release its resources.
    pub async fn cancel(&self, handle: &SignInHandle) {
        handle.request.resolve(SignInOutcome::Failed(SignInFailure::Cancelled(
            "sign-in was abandoned".into(),
        )));
        handle.request.shutdown().await;
        self.forget(handle);
    }

    /// Number of unresolved requests that still have a live handle.
    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, weak| weak.upgrade().is_some_and(|r| !r.is_resolved()));
        pending.len()
    }

    /// Total authorization URLs generated over the coordinator's lifetime.
    pub fn urls_issued(&self) -> usize {
        self.urls_issued.load(Ordering::SeqCst)
    }

    fn live_request(&self, subject: &str) -> Option<Arc<SignInRequest>> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending
            .get(subject)
            .and_then(Weak::upgrade)
            .filter(|r| !r.is_resolved())
    }

    fn forget(&self, handle: &SignInHandle) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let same = pending
            .get(handle.subject())
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&handle.request)));
        if same {
            pending.remove(handle.subject());
        }
    }

    fn authorization_url(
        &self,
        redirect_uri: &str,
        scopes: &ScopeSet,
        state: &str,
        code_challenge: Option<&str>,
    ) -> Result<String, AuthError> {
        let mut params: Vec<(&str, String)> = vec![
            ("client_id", self.config.delegated.client_id.clone()),
            ("response_type", "code".into()),
            ("redirect_uri", redirect_uri.to_string()),
            ("response_mode", "query".into()),
            ("scope", scopes.to_param()),
            ("state", state.to_string()),
        ];
        if let Some(challenge) = code_challenge {
            params.push(("code_challenge", challenge.to_string()));
            params.push(("code_challenge_method", "S256".into()));
        }
        let url = Url::parse_with_params(&self.config.authorize_endpoint(), &params).map_err(
            |e| AuthError::ConfigError {
                path: "<authority>".into(),
                detail: format!("invalid authorize endpoint: {e}"),
            },
        )?;
        Ok(url.into())
    }
}

/// Everything the background task needs; holds no reference back to the
/// request so dropping the last handle can abort it.
struct SignInDriver {
    engine: Arc<ExchangeEngine>,
    store: Arc<DelegatedTokenStore>,
    subject: String,
    scopes: ScopeSet,
    state: String,
    redirect_uri: String,
    verifier: Option<String>,
    poll_interval: Duration,
}

impl SignInDriver {
    async fn run(
        &self,
        listener: Option<tokio::net::TcpListener>,
    ) -> Result<DelegatedToken, AuthError> {
        let Some(listener) = listener else {
            return Ok(poll::poll_for_token(&self.store, &self.subject, self.poll_interval).await);
        };

        let path = Url::parse(&self.redirect_uri)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/callback".into());
        let code = callback::wait_for_code(&listener, &path, &self.state).await?;
        drop(listener);

        let token = self
            .engine
            .redeem_authorization_code(
                &self.subject,
                &code,
                &self.redirect_uri,
                self.verifier.as_deref(),
                &self.scopes,
            )
            .await
            .map_err(|e| AuthError::SignInFailed(format!("code redemption failed: {e}")))?;
        self.store.put(&self.subject, &token).await?;
        tracing::info!(subject = %self.subject, "delegated token stored after sign-in");
        Ok(token)
    }
}
