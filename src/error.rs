use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Which token-endpoint exchange produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStage {
    /// Single-step client-credentials exchange (legacy mode).
    ClientCredentials,
    /// Blueprint credential -> bootstrap token.
    Bootstrap,
    /// Bootstrap token presented as client assertion -> app-only token.
    Assertion,
    /// Authorization code redemption after interactive sign-in.
    AuthorizationCode,
    /// User token -> delegated agent token.
    OnBehalfOf,
    /// Refresh value -> new delegated token.
    Refresh,
}

impl ExchangeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeStage::ClientCredentials => "client credentials",
            ExchangeStage::Bootstrap => "bootstrap",
            ExchangeStage::Assertion => "assertion",
            ExchangeStage::AuthorizationCode => "authorization code",
            ExchangeStage::OnBehalfOf => "on-behalf-of",
            ExchangeStage::Refresh => "refresh",
        }
    }
}

impl fmt::Display for ExchangeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Credentials rejected during {stage} exchange: {detail}")]
    InvalidCredentials { stage: ExchangeStage, detail: String },

    #[error("Transient failure during {stage} exchange: {detail}")]
    Transient { stage: ExchangeStage, detail: String },

    #[error("Unexpected response during {stage} exchange: {detail}")]
    Protocol { stage: ExchangeStage, detail: String },

    #[error("Sign-in callback state did not match the pending request")]
    StateMismatch,

    #[error("{}", format_timeout(.duration))]
    Timeout { duration: Duration },

    #[error("Sign-in was cancelled: {0}")]
    UserCancelled(String),

    #[error("Sign-in failed: {0}")]
    SignInFailed(String),

    #[error("Token storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Error in config {}: {detail}", path.display())]
    ConfigError { path: PathBuf, detail: String },

    #[error("Tool '{tool}' failed: {source}")]
    ToolFailed {
        tool: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

fn format_timeout(duration: &Duration) -> String {
    format!(
        "Sign-in was not completed within {}s. Retry the original request to start over.",
        duration.as_secs()
    )
}

impl AuthError {
    /// Error code string for structured JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials { .. } => "invalid_credentials",
            AuthError::Transient { .. } => "transient",
            AuthError::Protocol { .. } => "protocol_error",
            AuthError::StateMismatch => "state_mismatch",
            AuthError::Timeout { .. } => "timeout",
            AuthError::UserCancelled(_) => "user_cancelled",
            AuthError::SignInFailed(_) => "sign_in_failed",
            AuthError::StorageUnavailable(_) => "storage_unavailable",
            AuthError::ConfigError { .. } => "config_error",
            AuthError::ToolFailed { .. } => "tool_failed",
            AuthError::IoError(_) => "io_error",
        }
    }

    /// Only network/5xx failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Transient { .. })
    }

    pub fn stage(&self) -> Option<ExchangeStage> {
        match self {
            AuthError::InvalidCredentials { stage, .. }
            | AuthError::Transient { stage, .. }
            | AuthError::Protocol { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            AuthError::ToolFailed { tool, .. } => Some(tool),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        if let Some(stage) = self.stage() {
            obj.insert("stage".into(), serde_json::Value::String(stage.to_string()));
        }
        if let Some(tool) = self.tool_name() {
            obj.insert("tool".into(), serde_json::Value::String(tool.to_string()));
        }
        obj.insert("message".into(), serde_json::Value::String(self.to_string()));
        obj.insert("code".into(), serde_json::Value::String(self.code().to_string()));
        serde_json::json!({ "error": obj })
    }
}
