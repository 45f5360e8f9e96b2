use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::error::AuthError;
use crate::exchange::http_client;
use crate::retry::{AuthPromptFn, AuthRequiredPayload, Continuation, InvocationOutcome};
use crate::runtime::AuthRuntime;
use crate::tools::GraphCalendarTool;

use super::output::{is_tty, print_outcome, print_sign_in_prompt};

/// Read upcoming calendar events, signing in first if needed.
pub async fn run_calendar(
    runtime: &AuthRuntime,
    subject: &str,
    days: u32,
    timeout: Option<Duration>,
    json: bool,
) -> Result<(), AuthError> {
    let config = runtime.config();
    let tool = GraphCalendarTool::new(
        config.graph_base_url.clone(),
        http_client()?,
        config.delegated.scopes.clone(),
    );
    let tty = is_tty();
    let notify: AuthPromptFn = Arc::new(move |payload: &AuthRequiredPayload| {
        print_sign_in_prompt(payload, tty);
        if webbrowser::open(&payload.sign_in_url).is_err() {
            tracing::warn!("Could not open browser automatically");
        }
    });
    let continuation = Continuation::Blocking {
        timeout: timeout.unwrap_or(config.sign_in.timeout),
        notify: Some(notify),
    };

    let outcome = runtime
        .invoke_with_delegated_auth(subject, &tool, &json!({ "days": days }), &continuation)
        .await?;
    print_outcome(&outcome, json, tty);

    match outcome {
        InvocationOutcome::Failed { tool, .. } => Err(AuthError::SignInFailed(format!(
            "'{tool}' still lacked authorization after signing in"
        ))),
        _ => Ok(()),
    }
}
