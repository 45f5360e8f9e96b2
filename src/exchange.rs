//! Token-endpoint exchanges: app-only acquisition (legacy and blueprint),
//! authorization-code redemption, on-behalf-of upgrade, and refresh.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};

use crate::config::{BlueprintConfig, CredentialConfig, CredentialMode, LegacyConfig};
use crate::error::{AuthError, ExchangeStage};
use crate::keyed::KeyedMutex;
use crate::store::DelegatedRefresh;
use crate::token::{AppOnlyToken, BootstrapToken, DelegatedToken, ScopeSet, TokenResponse};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_EXCHANGE_SCOPE: &str = "api://AzureADTokenExchange/.default";
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const ERROR_BODY_LIMIT: usize = 500;

type Form = Vec<(&'static str, String)>;

pub fn default_retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}

/// Shared HTTP client for token endpoints, blob storage, and tools.
pub fn http_client() -> Result<reqwest::Client, AuthError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| AuthError::ConfigError {
            path: PathBuf::from("<http-client>"),
            detail: format!("Cannot build HTTP client: {e}"),
        })
}

/// How a delegated exchange authenticates the client.
enum ClientAuth<'a> {
    Secret {
        client_id: &'a str,
        secret: Option<&'a str>,
    },
    Assertion {
        blueprint: &'a BlueprintConfig,
    },
}

/// Obtains app-only tokens and performs the delegated exchanges.
///
/// App-only tokens are cached per scope set. Concurrent requests for the
/// same scopes wait on one exchange; different scope sets never contend.
pub struct ExchangeEngine {
    config: Arc<CredentialConfig>,
    http: reqwest::Client,
    cache: KeyedMutex<ScopeSet, Option<AppOnlyToken>>,
    retry_policy: ExponentialBuilder,
}

impl ExchangeEngine {
    pub fn new(config: Arc<CredentialConfig>, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            cache: KeyedMutex::new(),
            retry_policy: default_retry_policy(),
        }
    }

    pub fn with_retry_policy(mut self, policy: ExponentialBuilder) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Return a cached app-only token for `scopes`, or exchange for a new one.
    /// An empty scope set means the configured default app scopes.
    pub async fn acquire_app_only_token(
        &self,
        scopes: &ScopeSet,
    ) -> Result<AppOnlyToken, AuthError> {
        let scopes = if scopes.is_empty() {
            self.config.app_scopes.clone()
        } else {
            scopes.clone()
        };

        let mut slot = self.cache.lock(&scopes).await;
        if let Some(token) = slot.as_ref().filter(|t| t.is_usable()) {
            tracing::debug!(scopes = %scopes, "app-only token cache hit");
            return Ok(token.clone());
        }
        *slot = None;

        let token = match &self.config.credential {
            CredentialMode::Legacy(legacy) => self.client_credentials(legacy, &scopes).await?,
            CredentialMode::Blueprint(blueprint) => {
                self.blueprint_exchange(blueprint, &scopes).await?
            }
        };
        tracing::debug!(scopes = %scopes, expires_at = %token.expires_at, "app-only token acquired");
        *slot = Some(token.clone());
        Ok(token)
    }

    async fn client_credentials(
        &self,
        legacy: &LegacyConfig,
        scopes: &ScopeSet,
    ) -> Result<AppOnlyToken, AuthError> {
        let form: Form = vec![
            ("grant_type", "client_credentials".into()),
            ("client_id", legacy.client_id.clone()),
            ("client_secret", legacy.client_secret.clone()),
            ("scope", scopes.to_param()),
        ];
        let resp = self.post_token(ExchangeStage::ClientCredentials, &form).await?;
        Ok(resp.into_app_only(scopes))
    }

    /// Step one of the blueprint flow: prove the blueprint identity.
    pub async fn bootstrap_token(
        &self,
        blueprint: &BlueprintConfig,
    ) -> Result<BootstrapToken, AuthError> {
        let form: Form = vec![
            ("grant_type", "client_credentials".into()),
            ("client_id", blueprint.blueprint_client_id.clone()),
            ("client_secret", blueprint.blueprint_secret.clone()),
            ("scope", TOKEN_EXCHANGE_SCOPE.into()),
            ("fmi_path", blueprint.agent_client_id.clone()),
        ];
        let resp = self.post_token(ExchangeStage::Bootstrap, &form).await?;
        Ok(resp.into_bootstrap(&self.config.authority))
    }

    async fn blueprint_exchange(
        &self,
        blueprint: &BlueprintConfig,
        scopes: &ScopeSet,
    ) -> Result<AppOnlyToken, AuthError> {
        let bootstrap = self.bootstrap_token(blueprint).await?;
        tracing::debug!(issuer = %bootstrap.issuer, "bootstrap token obtained");
        let form: Form = vec![
            ("grant_type", "client_credentials".into()),
            ("client_id", blueprint.agent_client_id.clone()),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE.into()),
            ("client_assertion", bootstrap.value),
            ("scope", scopes.to_param()),
        ];
        let resp = self.post_token(ExchangeStage::Assertion, &form).await?;
        Ok(resp.into_app_only(scopes))
    }

    /// Redeem an authorization code for `subject`. In blueprint mode the
    /// user token is then upgraded via on-behalf-of when the tenant allows it.
    pub async fn redeem_authorization_code(
        &self,
        subject: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
        scopes: &ScopeSet,
    ) -> Result<DelegatedToken, AuthError> {
        let scopes = if scopes.is_empty() {
            &self.config.delegated.scopes
        } else {
            scopes
        };
        let mut grant: Form = vec![
            ("grant_type", "authorization_code".into()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("scope", scopes.to_param()),
        ];
        if let Some(verifier) = code_verifier {
            grant.push(("code_verifier", verifier.to_string()));
        }
        let user_token = self
            .delegated_exchange(ExchangeStage::AuthorizationCode, grant)
            .await?
            .into_delegated(subject, scopes);

        match &self.config.credential {
            CredentialMode::Blueprint(blueprint) => {
                match self.on_behalf_of(blueprint, &user_token).await {
                    Ok(agent_token) => Ok(agent_token),
                    Err(e) => {
                        tracing::info!("on-behalf-of upgrade unavailable, keeping user token: {e}");
                        Ok(user_token)
                    }
                }
            }
            CredentialMode::Legacy(_) => Ok(user_token),
        }
    }

    /// Exchange a user token for a delegated agent token.
    pub async fn on_behalf_of(
        &self,
        blueprint: &BlueprintConfig,
        user_token: &DelegatedToken,
    ) -> Result<DelegatedToken, AuthError> {
        let bootstrap = self.bootstrap_token(blueprint).await?;
        let scopes = if user_token.scopes.is_empty() {
            &self.config.delegated.scopes
        } else {
            &user_token.scopes
        };
        let form: Form = vec![
            ("grant_type", JWT_BEARER_GRANT.into()),
            ("client_id", blueprint.agent_client_id.clone()),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE.into()),
            ("client_assertion", bootstrap.value),
            ("assertion", user_token.access_token.clone()),
            ("scope", scopes.to_param()),
            ("requested_token_use", "on_behalf_of".into()),
        ];
        let resp = self.post_token(ExchangeStage::OnBehalfOf, &form).await?;
        Ok(resp.into_delegated(&user_token.subject, scopes))
    }

    /// Use a token's refresh value to obtain a new delegated token.
    pub async fn refresh_delegated(
        &self,
        token: &DelegatedToken,
    ) -> Result<DelegatedToken, AuthError> {
        let refresh = token
            .refresh_token
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| AuthError::InvalidCredentials {
                stage: ExchangeStage::Refresh,
                detail: "token has no refresh value".into(),
            })?;
        let scopes = if token.scopes.is_empty() {
            &self.config.delegated.scopes
        } else {
            &token.scopes
        };
        let grant: Form = vec![
            ("grant_type", "refresh_token".into()),
            ("refresh_token", refresh.to_string()),
            ("scope", scopes.to_param()),
        ];
        let mut refreshed = self
            .delegated_exchange(ExchangeStage::Refresh, grant)
            .await?
            .into_delegated(&token.subject, scopes);
        // Servers that don't rotate refresh values omit them from the response.
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = token.refresh_token.clone();
        }
        Ok(refreshed)
    }

    fn delegated_client_auths(&self) -> Vec<ClientAuth<'_>> {
        match &self.config.credential {
            CredentialMode::Legacy(_) => vec![ClientAuth::Secret {
                client_id: &self.config.delegated.client_id,
                secret: self.config.delegated.client_secret.as_deref(),
            }],
            CredentialMode::Blueprint(blueprint) => vec![
                ClientAuth::Secret {
                    client_id: &blueprint.blueprint_client_id,
                    secret: Some(&blueprint.blueprint_secret),
                },
                ClientAuth::Assertion { blueprint },
            ],
        }
    }

    async fn client_auth_params(&self, auth: &ClientAuth<'_>) -> Result<Form, AuthError> {
        Ok(match auth {
            ClientAuth::Secret { client_id, secret } => {
                let mut form: Form = vec![("client_id", client_id.to_string())];
                if let Some(secret) = secret {
                    form.push(("client_secret", secret.to_string()));
                }
                form
            }
            ClientAuth::Assertion { blueprint } => {
                let bootstrap = self.bootstrap_token(blueprint).await?;
                vec![
                    ("client_id", blueprint.agent_client_id.clone()),
                    ("client_assertion_type", CLIENT_ASSERTION_TYPE.into()),
                    ("client_assertion", bootstrap.value),
                ]
            }
        })
    }

    /// Try each configured client authentication in turn until one is
    /// accepted. Only credential rejections fall through to the next one.
    async fn delegated_exchange(
        &self,
        stage: ExchangeStage,
        grant: Form,
    ) -> Result<TokenResponse, AuthError> {
        let mut last_err = None;
        for auth in self.delegated_client_auths() {
            let mut form = grant.clone();
            form.extend(self.client_auth_params(&auth).await?);
            match self.post_token(stage, &form).await {
                Ok(resp) => return Ok(resp),
                Err(e @ AuthError::InvalidCredentials { .. }) => {
                    tracing::debug!(%stage, "client authentication rejected: {e}");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(AuthError::InvalidCredentials {
            stage,
            detail: "no delegated client configured".into(),
        }))
    }

    /// POST to the token endpoint, retrying transient failures with backoff.
    async fn post_token(&self, stage: ExchangeStage, form: &Form) -> Result<TokenResponse, AuthError> {
        (|| async { self.post_token_once(stage, form).await })
            .retry(self.retry_policy.clone())
            .when(|e: &AuthError| e.is_transient())
            .notify(|err: &AuthError, dur: Duration| {
                tracing::warn!("{stage} exchange retrying after error {err}, sleeping {dur:?}");
            })
            .await
    }

    async fn post_token_once(
        &self,
        stage: ExchangeStage,
        form: &Form,
    ) -> Result<TokenResponse, AuthError> {
        tracing::debug!(%stage, "token exchange request");
        let resp = self
            .http
            .post(self.config.token_endpoint())
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::Transient {
                stage,
                detail: format!("request failed: {e}"),
            })?;

        let status = resp.status();
        if status.is_success() {
            let parsed = resp.json::<TokenResponse>().await.map_err(|e| AuthError::Protocol {
                stage,
                detail: format!("cannot parse token response: {e}"),
            })?;
            parsed
                .check_lifetime()
                .map_err(|detail| AuthError::Protocol { stage, detail })?;
            return Ok(parsed);
        }

        let mut body = resp.text().await.unwrap_or_default();
        body.truncate(
            body.char_indices()
                .nth(ERROR_BODY_LIMIT)
                .map_or(body.len(), |(i, _)| i),
        );
        let detail = format!("status {status}: {body}");
        if status.is_client_error() {
            Err(AuthError::InvalidCredentials { stage, detail })
        } else if status.is_server_error() {
            Err(AuthError::Transient { stage, detail })
        } else {
            Err(AuthError::Protocol { stage, detail })
        }
    }
}

#[async_trait]
impl DelegatedRefresh for ExchangeEngine {
    async fn refresh(&self, token: &DelegatedToken) -> Result<DelegatedToken, AuthError> {
        self.refresh_delegated(token).await
    }
}
