use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::token::ScopeSet;

/// On-disk configuration, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub authority: Option<String>,
    #[serde(default)]
    pub credential: Option<CredentialMode>,
    #[serde(default)]
    pub app_scopes: Vec<String>,
    #[serde(default)]
    pub delegated: DelegatedSection,
    #[serde(default)]
    pub storage: Option<StorageSection>,
    #[serde(default)]
    pub sign_in: SignInSection,
    #[serde(default)]
    pub graph_base_url: Option<String>,
}

/// Which way the application-level token is acquired.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum CredentialMode {
    Legacy(LegacyConfig),
    Blueprint(BlueprintConfig),
}

impl CredentialMode {
    pub fn name(&self) -> &'static str {
        match self {
            CredentialMode::Legacy(_) => "legacy",
            CredentialMode::Blueprint(_) => "blueprint",
        }
    }
}

impl fmt::Debug for CredentialMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialMode::Legacy(c) => f
                .debug_struct("Legacy")
                .field("client_id", &c.client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
            CredentialMode::Blueprint(c) => f
                .debug_struct("Blueprint")
                .field("blueprint_client_id", &c.blueprint_client_id)
                .field("blueprint_secret", &"<redacted>")
                .field("agent_client_id", &c.agent_client_id)
                .finish(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintConfig {
    pub blueprint_client_id: String,
    pub blueprint_secret: String,
    pub agent_client_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedSection {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub redirect_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum StorageSection {
    Local {
        #[serde(default)]
        dir: Option<String>,
    },
    Remote {
        url: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInSection {
    #[serde(default)]
    pub mode: Option<SignInMode>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignInMode {
    /// Bind a short-lived listener on the redirect target.
    Local,
    /// Poll the storage backend for a token deposited out of band.
    Hosted,
}

/// Resolved, validated settings. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub tenant_id: String,
    pub authority: String,
    pub credential: CredentialMode,
    pub app_scopes: ScopeSet,
    pub delegated: DelegatedConfig,
    pub storage: StorageBackend,
    pub sign_in: SignInSettings,
    pub graph_base_url: String,
}

impl CredentialConfig {
    fn tenant_base(&self) -> String {
        format!("{}/{}", self.authority.trim_end_matches('/'), self.tenant_id)
    }

    pub fn token_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.tenant_base())
    }

    pub fn authorize_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.tenant_base())
    }

    pub fn redirect_uri(&self) -> String {
        format!(
            "{}/callback",
            self.delegated.redirect_base_url.trim_end_matches('/')
        )
    }
}

#[derive(Clone)]
pub struct DelegatedConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: ScopeSet,
    pub redirect_base_url: String,
}

impl fmt::Debug for DelegatedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("scopes", &self.scopes)
            .field("redirect_base_url", &self.redirect_base_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Local { dir: PathBuf },
    /// Object-store location; `{subject}` in the URL is replaced per subject.
    Remote { url: String },
}

#[derive(Debug, Clone)]
pub struct SignInSettings {
    pub mode: SignInMode,
    pub timeout: Duration,
    pub poll_interval: Duration,
}
