use std::time::Duration;

use serde_json::json;

use crate::config::StorageBackend;
use crate::error::AuthError;
use crate::runtime::AuthRuntime;
use crate::token::ScopeSet;

use super::output::{is_tty, ok_label, warn_label};

/// Print an app-only token: the raw value, or a JSON summary with `--json`.
pub async fn run_token(runtime: &AuthRuntime, scopes: &[String], json: bool) -> Result<(), AuthError> {
    let scopes = ScopeSet::new(scopes.iter().cloned());
    let token = runtime.acquire_app_only_token(&scopes).await?;
    if json {
        let out = json!({
            "accessToken": token.access_token,
            "expiresAt": token.expires_at.to_rfc3339(),
            "scopes": token.scopes,
            "mode": runtime.config().credential.name(),
        });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
    } else {
        println!("{}", token.access_token);
    }
    Ok(())
}

/// Interactive sign-in for `subject`, waiting up to `timeout`.
pub async fn run_login(
    runtime: &AuthRuntime,
    subject: &str,
    timeout: Option<Duration>,
    open_browser: bool,
) -> Result<(), AuthError> {
    let tty = is_tty();
    let handle = runtime.begin_sign_in(subject, &ScopeSet::default()).await?;
    let url = handle.authorization_url();

    eprintln!("Open this link to sign in:");
    eprintln!("  {url}");
    if open_browser && webbrowser::open(url).is_err() {
        tracing::warn!("Could not open browser automatically");
    }

    let timeout = timeout.unwrap_or(runtime.config().sign_in.timeout);
    let token = runtime.await_sign_in(&handle, timeout).await?;
    println!(
        "{} as '{subject}' (token expires {})",
        ok_label("Signed in", tty),
        token.expires_at.to_rfc3339()
    );
    Ok(())
}

pub async fn run_status(runtime: &AuthRuntime, subject: &str, json: bool) -> Result<(), AuthError> {
    let config = runtime.config();
    let signed_in = runtime.has_valid_delegated_token(subject).await;
    let storage = match &config.storage {
        StorageBackend::Local { .. } => "local",
        StorageBackend::Remote { .. } => "remote",
    };

    if json {
        let out = json!({
            "subject": subject,
            "signedIn": signed_in,
            "credentialMode": config.credential.name(),
            "storage": storage,
            "storageLocation": runtime.store().backend().describe(),
            "delegatedScopes": config.delegated.scopes,
        });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
        return Ok(());
    }

    let tty = is_tty();
    let state = if signed_in {
        ok_label("signed in", tty)
    } else {
        warn_label("not signed in", tty)
    };
    println!("{subject}: {state}");
    println!("  credential mode: {}", config.credential.name());
    println!("  token storage:   {}", runtime.store().backend().describe());
    println!("  delegated scopes: {}", config.delegated.scopes);
    Ok(())
}

pub async fn run_logout(runtime: &AuthRuntime, subject: &str) -> Result<(), AuthError> {
    runtime.sign_out(subject).await?;
    println!("Signed out '{subject}'");
    Ok(())
}
