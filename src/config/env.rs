use std::path::PathBuf;

use crate::error::AuthError;

use super::types::{
    BlueprintConfig, CredentialMode, FileConfig, LegacyConfig, SignInMode, StorageSection,
};

/// Expand environment variable references in a string.
///
/// Supported syntaxes:
/// - `${VAR}` - replaced with the variable's value; error if unset
/// - `${VAR:-fallback}` - replaced with the value, or `fallback` if unset or empty
/// - `$env:VAR` - same as `${VAR}`
pub fn expand_env_vars(input: &str) -> Result<String, AuthError> {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with<F>(input: &str, lookup: F) -> Result<String, AuthError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + 1..];

        if let Some(body) = tail.strip_prefix('{') {
            let close = body.find('}').ok_or_else(|| {
                env_error(format!("Unclosed variable reference: ${{{body}"))
            })?;
            let expr = &body[..close];
            match expr.split_once(":-") {
                Some((name, fallback)) => match lookup(name) {
                    Some(val) if !val.is_empty() => out.push_str(&val),
                    _ => out.push_str(fallback),
                },
                None => out.push_str(&required(&lookup, expr)?),
            }
            rest = &body[close + 1..];
        } else if let Some(after) = tail.strip_prefix("env:") {
            let len = after
                .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if len == 0 {
                return Err(env_error("Empty variable name in $env: reference".into()));
            }
            out.push_str(&required(&lookup, &after[..len])?);
            rest = &after[len..];
        } else {
            out.push('$');
            rest = tail;
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn required<F>(lookup: &F, name: &str) -> Result<String, AuthError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).ok_or_else(|| env_error(format!("Environment variable '{name}' is not set")))
}

fn expand_opt(value: &mut Option<String>) -> Result<(), AuthError> {
    if let Some(v) = value {
        *v = expand_env_vars(v)?;
    }
    Ok(())
}

/// Expand environment variables in every string field of a file config.
pub fn expand_file_config(config: &mut FileConfig) -> Result<(), AuthError> {
    expand_opt(&mut config.tenant_id)?;
    expand_opt(&mut config.authority)?;
    expand_opt(&mut config.graph_base_url)?;
    match &mut config.credential {
        Some(CredentialMode::Legacy(l)) => {
            l.client_id = expand_env_vars(&l.client_id)?;
            l.client_secret = expand_env_vars(&l.client_secret)?;
        }
        Some(CredentialMode::Blueprint(b)) => {
            b.blueprint_client_id = expand_env_vars(&b.blueprint_client_id)?;
            b.blueprint_secret = expand_env_vars(&b.blueprint_secret)?;
            b.agent_client_id = expand_env_vars(&b.agent_client_id)?;
        }
        None => {}
    }
    for scope in config.app_scopes.iter_mut().chain(config.delegated.scopes.iter_mut()) {
        *scope = expand_env_vars(scope)?;
    }
    expand_opt(&mut config.delegated.client_id)?;
    expand_opt(&mut config.delegated.client_secret)?;
    expand_opt(&mut config.delegated.redirect_base_url)?;
    match &mut config.storage {
        Some(StorageSection::Local { dir }) => expand_opt(dir)?,
        Some(StorageSection::Remote { url }) => *url = expand_env_vars(url)?,
        None => {}
    }
    Ok(())
}

/// Build a file config from the process environment, used when no config
/// file is found.
pub fn file_config_from_env() -> FileConfig {
    file_config_from_lookup(|name| std::env::var(name).ok())
}

fn file_config_from_lookup<F>(lookup: F) -> FileConfig
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    let blueprint = match (
        get("GRAPH_BLUEPRINT_CLIENT_ID"),
        get("GRAPH_BLUEPRINT_SECRET"),
        get("GRAPH_AGENT_CLIENT_ID"),
    ) {
        (Some(blueprint_client_id), Some(blueprint_secret), Some(agent_client_id)) => {
            Some(CredentialMode::Blueprint(BlueprintConfig {
                blueprint_client_id,
                blueprint_secret,
                agent_client_id,
            }))
        }
        _ => None,
    };
    let credential = blueprint.or_else(|| {
        match (get("GRAPH_CLIENT_ID"), get("GRAPH_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(CredentialMode::Legacy(LegacyConfig {
                client_id,
                client_secret,
            })),
            _ => None,
        }
    });

    let mut config = FileConfig {
        tenant_id: get("GRAPH_TENANT_ID"),
        credential,
        ..FileConfig::default()
    };
    config.delegated.client_id = get("GRAPH_DELEGATED_CLIENT_ID");
    config.delegated.client_secret = get("GRAPH_DELEGATED_CLIENT_SECRET");
    config.delegated.redirect_base_url = get("AUTH_REDIRECT_BASE_URL");
    if let Some(url) = get("TOKEN_STORAGE_URL") {
        config.storage = Some(StorageSection::Remote { url });
        config.sign_in.mode = Some(SignInMode::Hosted);
    }
    config
}

fn env_error(detail: String) -> AuthError {
    AuthError::ConfigError {
        path: PathBuf::from("<env>"),
        detail,
    }
}
