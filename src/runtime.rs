use std::sync::Arc;

use serde_json::Value;

use crate::config::{load_config, CredentialConfig};
use crate::error::AuthError;
use crate::exchange::{http_client, ExchangeEngine};
use crate::retry::{AuthRetryWrapper, Continuation, DelegatedTool, InvocationOutcome, ResumeStatus};
use crate::signin::{SignInCoordinator, SignInHandle};
use crate::store::{backend_for, DelegatedTokenStore, TokenBackend};
use crate::token::{AppOnlyToken, DelegatedToken, ScopeSet};

/// Entry point for front ends: owns the exchange engine, the token store,
/// the sign-in coordinator, and the retry wrapper for one configuration.
pub struct AuthRuntime {
    config: Arc<CredentialConfig>,
    engine: Arc<ExchangeEngine>,
    store: Arc<DelegatedTokenStore>,
    coordinator: Arc<SignInCoordinator>,
    wrapper: AuthRetryWrapper,
}

impl AuthRuntime {
    /// Load configuration from the usual places and build a runtime.
    pub fn from_config(path: Option<&str>) -> Result<Self, AuthError> {
        Self::new(load_config(path)?)
    }

    pub fn new(config: CredentialConfig) -> Result<Self, AuthError> {
        let http = http_client()?;
        let config = Arc::new(config);
        let engine = Arc::new(ExchangeEngine::new(config.clone(), http.clone()));
        let backend = backend_for(&config.storage, http);
        Ok(Self::assemble(config, engine, backend))
    }

    /// Build a runtime around a caller-supplied engine and backend.
    pub fn with_parts(
        config: Arc<CredentialConfig>,
        engine: ExchangeEngine,
        backend: Arc<dyn TokenBackend>,
    ) -> Self {
        Self::assemble(config, Arc::new(engine), backend)
    }

    fn assemble(
        config: Arc<CredentialConfig>,
        engine: Arc<ExchangeEngine>,
        backend: Arc<dyn TokenBackend>,
    ) -> Self {
        let store =
            Arc::new(DelegatedTokenStore::new(backend).with_refresher(engine.clone()));
        let coordinator = Arc::new(SignInCoordinator::new(
            config.clone(),
            engine.clone(),
            store.clone(),
        ));
        let wrapper = AuthRetryWrapper::new(store.clone(), coordinator.clone());
        Self {
            config,
            engine,
            store,
            coordinator,
            wrapper,
        }
    }

    /// Keep resolved deferred sign-ins queryable for `retention` after they
    /// are first seen resolved.
    pub fn with_resume_retention(mut self, retention: std::time::Duration) -> Self {
        self.wrapper = self.wrapper.with_resume_retention(retention);
        self
    }

    pub fn deferred_count(&self) -> usize {
        self.wrapper.deferred_count()
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    pub fn store(&self) -> &DelegatedTokenStore {
        &self.store
    }

    pub fn coordinator(&self) -> &SignInCoordinator {
        &self.coordinator
    }

    pub async fn acquire_app_only_token(
        &self,
        scopes: &ScopeSet,
    ) -> Result<AppOnlyToken, AuthError> {
        self.engine.acquire_app_only_token(scopes).await
    }

    /// Run `tool` for `subject`, signing in and retrying once if the tool
    /// reports missing delegated authorization.
    pub async fn invoke_with_delegated_auth(
        &self,
        subject: &str,
        tool: &dyn DelegatedTool,
        args: &Value,
        continuation: &Continuation,
    ) -> Result<InvocationOutcome, AuthError> {
        self.wrapper.invoke(subject, tool, args, continuation).await
    }

    pub async fn has_valid_delegated_token(&self, subject: &str) -> bool {
        self.store.has_valid_token(subject).await
    }

    /// Status of a deferred sign-in started by `invoke_with_delegated_auth`.
    pub fn resume_status(&self, resume_token: &str) -> ResumeStatus {
        self.wrapper.resume_status(resume_token)
    }

    /// Begin an explicit sign-in, outside any tool call.
    pub async fn begin_sign_in(
        &self,
        subject: &str,
        scopes: &ScopeSet,
    ) -> Result<SignInHandle, AuthError> {
        self.coordinator.begin_sign_in(subject, scopes).await
    }

    pub async fn await_sign_in(
        &self,
        handle: &SignInHandle,
        timeout: std::time::Duration,
    ) -> Result<DelegatedToken, AuthError> {
        self.coordinator.await_completion(handle, timeout).await
    }

    /// Delete the stored delegated token and abandon deferred sign-ins.
    pub async fn sign_out(&self, subject: &str) -> Result<(), AuthError> {
        self.wrapper.forget_subject(subject);
        self.store.invalidate(subject).await?;
        tracing::info!(subject, "signed out");
        Ok(())
    }
}
