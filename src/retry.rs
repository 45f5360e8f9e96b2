//! Auth-aware retry around delegated tool calls.
//!
//! A tool that reports missing authorization triggers sign-in and is then
//! re-invoked exactly once. The transitions live in [`RetryMachine`] so the
//! single-retry bound holds by construction.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::AuthError;
use crate::signin::{SignInCoordinator, SignInHandle, SignInOutcome};
use crate::store::DelegatedTokenStore;
use crate::token::{DelegatedToken, ScopeSet};

/// What a wrapped tool returns when it did not fail outright.
#[derive(Debug, Clone)]
pub enum ToolResponse {
    Ok(Value),
    /// The call needs delegated authorization it does not have.
    AuthRequired { scopes: ScopeSet },
}

/// A data-retrieval tool that may need a delegated token.
#[async_trait]
pub trait DelegatedTool: Send + Sync {
    fn name(&self) -> &str;

    /// Transport and other non-auth failures come back as `Err` and are
    /// propagated unchanged.
    async fn call(
        &self,
        args: &Value,
        token: Option<&DelegatedToken>,
    ) -> Result<ToolResponse, AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryState {
    Ready,
    Invoking,
    NeedsAuth,
    SigninPending,
    SigninDone,
    Retrying,
    Success,
    Failed,
}

impl RetryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RetryState::Success | RetryState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    Invoke,
    Responded { auth_required: bool },
    SignInStarted,
    SignInCompleted,
    SignInAbandoned,
}

/// Per-invocation state. Any event that does not fit the current state
/// moves the machine to `Failed`; terminal states ignore further events.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    state: RetryState,
    invocations: u32,
}

impl Default for RetryMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryMachine {
    pub fn new() -> Self {
        Self {
            state: RetryState::Ready,
            invocations: 0,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn invocations(&self) -> u32 {
        self.invocations
    }

    pub fn advance(&mut self, event: RetryEvent) -> RetryState {
        use RetryEvent as E;
        use RetryState as S;

        if self.state.is_terminal() {
            return self.state;
        }
        let next = match (self.state, event) {
            (S::Ready, E::Invoke) => S::Invoking,
            (S::Invoking, E::Responded { auth_required: false }) => S::Success,
            (S::Invoking, E::Responded { auth_required: true }) => S::NeedsAuth,
            (S::NeedsAuth, E::SignInStarted) => S::SigninPending,
            (S::SigninPending, E::SignInCompleted) => S::SigninDone,
            (S::SigninDone, E::Invoke) => S::Retrying,
            (S::Retrying, E::Responded { auth_required: false }) => S::Success,
            (S::Retrying, E::Responded { auth_required: true }) => S::Failed,
            _ => S::Failed,
        };
        if matches!(next, S::Invoking | S::Retrying) {
            self.invocations += 1;
        }
        tracing::trace!(from = ?self.state, to = ?next, ?event, "retry transition");
        self.state = next;
        next
    }
}

/// Sign-in prompt handed to the caller the first time auth is required.
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequiredPayload {
    pub sign_in_url: String,
    /// Pass to `resume_status` to learn whether the sign-in finished.
    pub resume_token: String,
    pub message: String,
    pub scopes: ScopeSet,
}

impl AuthRequiredPayload {
    fn new(handle: &SignInHandle, scopes: ScopeSet) -> Self {
        Self {
            sign_in_url: handle.authorization_url().to_string(),
            resume_token: handle.id().to_string(),
            message: format!(
                "Sign-in is required to continue. Open this link in your browser and \
                 complete the sign-in: {}",
                handle.authorization_url()
            ),
            scopes,
        }
    }
}

pub type AuthPromptFn = Arc<dyn Fn(&AuthRequiredPayload) + Send + Sync>;

/// How the caller wants to continue once sign-in is needed.
#[derive(Clone)]
pub enum Continuation {
    /// Wait here for sign-in (up to `timeout`), then retry. `notify` receives
    /// the prompt before the wait begins.
    Blocking {
        timeout: Duration,
        notify: Option<AuthPromptFn>,
    },
    /// Return the prompt immediately; sign-in proceeds in the background.
    Deferred,
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::Blocking { timeout, notify } => f
                .debug_struct("Blocking")
                .field("timeout", timeout)
                .field("notify", &notify.is_some())
                .finish(),
            Continuation::Deferred => f.write_str("Deferred"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success { result: Value },
    AuthRequired(AuthRequiredPayload),
    /// Authorization was still missing after the single retry.
    Failed {
        tool: String,
        scopes: ScopeSet,
        attempts: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResumeStatus {
    Pending { sign_in_url: String },
    Completed,
    Failed { message: String },
    Unknown,
}

/// How long a resolved deferred sign-in stays queryable when nobody asks.
pub const DEFAULT_RESUME_RETENTION: Duration = Duration::from_secs(15 * 60);

struct DeferredEntry {
    handle: SignInHandle,
    /// First time a sweep saw the request resolved.
    resolved_seen: Option<Instant>,
}

/// Drives [`RetryMachine`] against a real tool, token store, and coordinator.
pub struct AuthRetryWrapper {
    store: Arc<DelegatedTokenStore>,
    coordinator: Arc<SignInCoordinator>,
    deferred: Mutex<HashMap<Uuid, DeferredEntry>>,
    retention: Duration,
}

impl AuthRetryWrapper {
    pub fn new(store: Arc<DelegatedTokenStore>, coordinator: Arc<SignInCoordinator>) -> Self {
        Self {
            store,
            coordinator,
            deferred: Mutex::new(HashMap::new()),
            retention: DEFAULT_RESUME_RETENTION,
        }
    }

    pub fn with_resume_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Deferred sign-ins still tracked for `resume_status`.
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Register a deferred sign-in, first sweeping out resolved entries
    /// nobody asked about within the retention window.
    fn track_deferred(&self, handle: SignInHandle) {
        let now = Instant::now();
        let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        deferred.retain(|_, entry| {
            if !entry.handle.is_resolved() {
                return true;
            }
            let seen = *entry.resolved_seen.get_or_insert(now);
            now.duration_since(seen) < self.retention
        });
        deferred.insert(
            handle.id(),
            DeferredEntry {
                handle,
                resolved_seen: None,
            },
        );
    }

    pub async fn invoke(
        &self,
        subject: &str,
        tool: &dyn DelegatedTool,
        args: &Value,
        continuation: &Continuation,
    ) -> Result<InvocationOutcome, AuthError> {
        let mut machine = RetryMachine::new();
        let mut token = self.store.get(subject).await?;
        let mut missing = ScopeSet::default();

        loop {
            match machine.state() {
                RetryState::Ready | RetryState::SigninDone => {
                    machine.advance(RetryEvent::Invoke);
                    match tool.call(args, token.as_ref()).await? {
                        ToolResponse::Ok(result) => {
                            machine.advance(RetryEvent::Responded {
                                auth_required: false,
                            });
                            return Ok(InvocationOutcome::Success { result });
                        }
                        ToolResponse::AuthRequired { scopes } => {
                            tracing::info!(tool = tool.name(), subject, "delegated authorization required");
                            missing = scopes;
                            machine.advance(RetryEvent::Responded {
                                auth_required: true,
                            });
                        }
                    }
                }
                RetryState::NeedsAuth => {
                    if let Err(e) = self.store.invalidate(subject).await {
                        tracing::warn!(subject, "cannot invalidate delegated token: {e}");
                    }
                    let handle = self.coordinator.begin_sign_in(subject, &missing).await?;
                    machine.advance(RetryEvent::SignInStarted);
                    let payload = AuthRequiredPayload::new(&handle, missing.clone());

                    match continuation {
                        Continuation::Deferred => {
                            self.track_deferred(handle);
                            return Ok(InvocationOutcome::AuthRequired(payload));
                        }
                        Continuation::Blocking { timeout, notify } => {
                            if let Some(notify) = notify {
                                notify(&payload);
                            }
                            match self.coordinator.await_completion(&handle, *timeout).await {
                                Ok(fresh) => {
                                    token = Some(fresh);
                                    machine.advance(RetryEvent::SignInCompleted);
                                }
                                Err(e) => {
                                    machine.advance(RetryEvent::SignInAbandoned);
                                    return Err(e);
                                }
                            }
                        }
                    }
                }
                RetryState::Failed => {
                    tracing::warn!(
                        tool = tool.name(),
                        subject,
                        "authorization still missing after sign-in, giving up"
                    );
                    return Ok(InvocationOutcome::Failed {
                        tool: tool.name().to_string(),
                        scopes: missing,
                        attempts: machine.invocations(),
                    });
                }
                // Every tool call resolves Invoking/Retrying in the same arm, and
                // success returns directly.
                RetryState::Invoking
                | RetryState::Retrying
                | RetryState::SigninPending
                | RetryState::Success => {
                    return Ok(InvocationOutcome::Failed {
                        tool: tool.name().to_string(),
                        scopes: missing,
                        attempts: machine.invocations(),
                    });
                }
            }
        }
    }

    /// Completion status of a deferred sign-in. Resolved entries are
    /// reported once and then forgotten.
    pub fn resume_status(&self, resume_token: &str) -> ResumeStatus {
        let Ok(id) = Uuid::parse_str(resume_token) else {
            return ResumeStatus::Unknown;
        };
        let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = deferred.get(&id).map(|entry| &entry.handle) else {
            return ResumeStatus::Unknown;
        };
        let status = match handle.outcome() {
            None => {
                return ResumeStatus::Pending {
                    sign_in_url: handle.authorization_url().to_string(),
                }
            }
            Some(SignInOutcome::Completed(_)) => ResumeStatus::Completed,
            Some(SignInOutcome::Failed(failure)) => ResumeStatus::Failed {
                message: failure.to_error().to_string(),
            },
        };
        deferred.remove(&id);
        status
    }

    /// Drop every deferred sign-in for `subject`, aborting their tasks.
    pub fn forget_subject(&self, subject: &str) {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, entry| entry.handle.subject() != subject);
    }
}
