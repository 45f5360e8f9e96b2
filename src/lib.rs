pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod keyed;
pub mod retry;
pub mod runtime;
pub mod signin;
pub mod store;
pub mod token;
pub mod tools;

pub use config::{load_config, CredentialConfig, CredentialMode};
pub use error::{AuthError, ExchangeStage};
pub use exchange::ExchangeEngine;
pub use retry::{
    AuthRequiredPayload, Continuation, DelegatedTool, InvocationOutcome, ResumeStatus, RetryState,
    ToolResponse,
};
pub use runtime::AuthRuntime;
pub use signin::{SignInCoordinator, SignInHandle};
pub use store::{DelegatedTokenStore, TokenBackend};
pub use token::{AppOnlyToken, DelegatedToken, ScopeSet};
pub use tools::GraphCalendarTool;

