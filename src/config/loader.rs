use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AuthError;
use crate::token::ScopeSet;

use super::env::{expand_file_config, file_config_from_env};
use super::types::{
    CredentialConfig, CredentialMode, DelegatedConfig, FileConfig, SignInMode, SignInSettings,
    StorageBackend, StorageSection,
};

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_APP_SCOPE: &str = "https://graph.microsoft.com/.default";
pub const DEFAULT_DELEGATED_SCOPES: [&str; 2] =
    ["https://graph.microsoft.com/Calendars.Read", "offline_access"];
pub const DEFAULT_REDIRECT_BASE_URL: &str = "http://localhost:5050";
const DEFAULT_SIGN_IN_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Strip JSONC comments (`//` line and `/* */` block) outside of strings.
/// Newlines inside comments are kept so parse errors report the right line.
pub fn strip_jsonc_comments(input: &str) -> String {
    enum Mode {
        Code,
        Str,
        StrEscape,
        Line,
        Block,
    }

    let mut out = String::with_capacity(input.len());
    let mut mode = Mode::Code;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match mode {
            Mode::Code => match (ch, chars.peek().copied()) {
                ('"', _) => {
                    mode = Mode::Str;
                    out.push(ch);
                }
                ('/', Some('/')) => {
                    chars.next();
                    mode = Mode::Line;
                }
                ('/', Some('*')) => {
                    chars.next();
                    mode = Mode::Block;
                }
                _ => out.push(ch),
            },
            Mode::Str => {
                out.push(ch);
                match ch {
                    '\\' => mode = Mode::StrEscape,
                    '"' => mode = Mode::Code,
                    _ => {}
                }
            }
            Mode::StrEscape => {
                out.push(ch);
                mode = Mode::Str;
            }
            Mode::Line => {
                if ch == '\n' {
                    out.push('\n');
                    mode = Mode::Code;
                }
            }
            Mode::Block => {
                if ch == '\n' {
                    out.push('\n');
                } else if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    mode = Mode::Code;
                }
            }
        }
    }

    out
}

/// Find the config file to use, highest precedence first:
///
/// 1. `--config` CLI flag
/// 2. `DELEGAUTH_CONFIG` env var
/// 3. `./config/delegauth.json` (project-level)
/// 4. `~/.delegauth/delegauth.json` or `~/.delegauth/delegauth.jsonc`
pub fn discover_config_file(cli_config: Option<&str>) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = cli_config {
        candidates.push(PathBuf::from(path));
    }
    if let Ok(env_path) = std::env::var("DELEGAUTH_CONFIG") {
        candidates.push(PathBuf::from(env_path));
    }
    candidates.push(PathBuf::from("./config/delegauth.json"));
    if let Some(home) = dirs::home_dir() {
        let base = home.join(".delegauth");
        candidates.push(base.join("delegauth.json"));
        candidates.push(base.join("delegauth.jsonc"));
    }
    candidates.into_iter().find(|p| p.is_file())
}

/// Load a single config file, stripping JSONC comments and expanding
/// environment references.
pub fn load_config_file(path: &Path) -> Result<FileConfig, AuthError> {
    let content = std::fs::read_to_string(path).map_err(|e| AuthError::ConfigError {
        path: path.to_path_buf(),
        detail: format!("Cannot read file: {e}"),
    })?;

    let stripped = strip_jsonc_comments(&content);
    let mut config: FileConfig =
        serde_json::from_str(&stripped).map_err(|e| AuthError::ConfigError {
            path: path.to_path_buf(),
            detail: format!("Invalid JSON: {e}"),
        })?;
    expand_file_config(&mut config)?;
    Ok(config)
}

/// Load and resolve the process configuration.
///
/// An explicit `--config` path that does not exist is an error; otherwise
/// the environment is used when no file is discovered.
pub fn load_config(cli_config: Option<&str>) -> Result<CredentialConfig, AuthError> {
    if let Some(path) = cli_config {
        if !Path::new(path).is_file() {
            return Err(AuthError::ConfigError {
                path: PathBuf::from(path),
                detail: "Cannot read file: not found".into(),
            });
        }
    }

    match discover_config_file(cli_config) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading credential config");
            let file = load_config_file(&path)?;
            resolve(file, &path)
        }
        None => {
            tracing::debug!("no config file found; resolving from environment");
            resolve(file_config_from_env(), Path::new("<env>"))
        }
    }
}

/// Validate a file config into the immutable [`CredentialConfig`].
pub fn resolve(file: FileConfig, source: &Path) -> Result<CredentialConfig, AuthError> {
    let invalid = |detail: &str| AuthError::ConfigError {
        path: source.to_path_buf(),
        detail: detail.to_string(),
    };
    let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

    let tenant_id = non_empty(file.tenant_id).ok_or_else(|| invalid("missing tenantId"))?;
    let credential = file
        .credential
        .ok_or_else(|| invalid("missing credential (legacy client secret or blueprint identity)"))?;

    let (default_client_id, default_secret) = match &credential {
        CredentialMode::Legacy(l) => {
            if l.client_id.trim().is_empty() || l.client_secret.trim().is_empty() {
                return Err(invalid("legacy credential requires clientId and clientSecret"));
            }
            (l.client_id.clone(), Some(l.client_secret.clone()))
        }
        CredentialMode::Blueprint(b) => {
            if b.blueprint_client_id.trim().is_empty()
                || b.blueprint_secret.trim().is_empty()
                || b.agent_client_id.trim().is_empty()
            {
                return Err(invalid(
                    "blueprint credential requires blueprintClientId, blueprintSecret and agentClientId",
                ));
            }
            // Codes are issued to the agent identity; redemption authenticates
            // with the blueprint secret or a bootstrap assertion instead.
            (b.agent_client_id.clone(), None)
        }
    };

    let app_scopes = if file.app_scopes.is_empty() {
        ScopeSet::new([DEFAULT_APP_SCOPE])
    } else {
        ScopeSet::new(file.app_scopes)
    };
    let delegated_scopes = if file.delegated.scopes.is_empty() {
        ScopeSet::new(DEFAULT_DELEGATED_SCOPES)
    } else {
        ScopeSet::new(file.delegated.scopes)
    };

    let delegated = DelegatedConfig {
        client_id: non_empty(file.delegated.client_id).unwrap_or(default_client_id),
        client_secret: non_empty(file.delegated.client_secret).or(default_secret),
        scopes: delegated_scopes,
        redirect_base_url: non_empty(file.delegated.redirect_base_url)
            .unwrap_or_else(|| DEFAULT_REDIRECT_BASE_URL.to_string()),
    };
    url::Url::parse(&delegated.redirect_base_url)
        .map_err(|e| invalid(&format!("invalid delegated.redirectBaseUrl: {e}")))?;

    let storage = match file.storage {
        None | Some(StorageSection::Local { dir: None }) => StorageBackend::Local {
            dir: default_token_dir(),
        },
        Some(StorageSection::Local { dir: Some(dir) }) => StorageBackend::Local {
            dir: expand_home(&dir),
        },
        Some(StorageSection::Remote { url }) => {
            url::Url::parse(&url.replace("{subject}", "subject"))
                .map_err(|e| invalid(&format!("invalid storage.url: {e}")))?;
            StorageBackend::Remote { url }
        }
    };

    let mode = match (file.sign_in.mode, &storage) {
        (Some(mode), _) => mode,
        (None, StorageBackend::Remote { .. }) => SignInMode::Hosted,
        (None, StorageBackend::Local { .. }) => SignInMode::Local,
    };
    let sign_in = SignInSettings {
        mode,
        timeout: file
            .sign_in
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SIGN_IN_TIMEOUT),
        poll_interval: file
            .sign_in
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL),
    };
    if sign_in.poll_interval.is_zero() {
        return Err(invalid("signIn.pollIntervalMs must be greater than zero"));
    }

    Ok(CredentialConfig {
        tenant_id,
        authority: non_empty(file.authority).unwrap_or_else(|| DEFAULT_AUTHORITY.to_string()),
        credential,
        app_scopes,
        delegated,
        storage,
        sign_in,
        graph_base_url: non_empty(file.graph_base_url)
            .unwrap_or_else(|| DEFAULT_GRAPH_BASE_URL.to_string()),
    })
}

fn default_token_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".delegauth")
        .join("tokens")
}

fn expand_home(dir: &str) -> PathBuf {
    match dir.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{BlueprintConfig, LegacyConfig};

    fn legacy_file() -> FileConfig {
        FileConfig {
            tenant_id: Some("tenant".into()),
            credential: Some(CredentialMode::Legacy(LegacyConfig {
                client_id: "cid".into(),
                client_secret: "secret".into(),
            })),
            ..FileConfig::default()
        }
    }

    #[test]
    fn strip_line_and_block_comments() {
        let input = r#"{
  // line comment
  "a": 1, /* block */ "b": 2
  /*
   * multi-line
   */
}"#;
        let parsed: serde_json::Value =
            serde_json::from_str(&strip_jsonc_comments(input)).unwrap();
        assert_eq!(parsed["a"], 1);
        assert_eq!(parsed["b"], 2);
    }

    #[test]
    fn strip_preserves_slashes_in_strings() {
        let input = r#"{"url": "https://login.example.com/t", "esc": "a\"//b"}"#;
        let parsed: serde_json::Value =
            serde_json::from_str(&strip_jsonc_comments(input)).unwrap();
        assert_eq!(parsed["url"], "https://login.example.com/t");
        assert_eq!(parsed["esc"], "a\"//b");
    }

    #[test]
    fn strip_keeps_line_numbers() {
        let input = "{\n/* a\nb */\n}";
        assert_eq!(strip_jsonc_comments(input).lines().count(), input.lines().count());
    }

    #[test]
    fn resolve_legacy_defaults() {
        let cfg = resolve(legacy_file(), Path::new("<test>")).unwrap();
        assert_eq!(cfg.credential.name(), "legacy");
        assert_eq!(cfg.authority, DEFAULT_AUTHORITY);
        assert!(cfg.app_scopes.contains(DEFAULT_APP_SCOPE));
        assert!(cfg.delegated.scopes.contains("offline_access"));
        assert_eq!(cfg.delegated.client_id, "cid");
        assert_eq!(cfg.delegated.client_secret.as_deref(), Some("secret"));
        assert_eq!(cfg.sign_in.mode, SignInMode::Local);
        assert_eq!(cfg.sign_in.timeout, DEFAULT_SIGN_IN_TIMEOUT);
        assert!(matches!(cfg.storage, StorageBackend::Local { .. }));
    }

    #[test]
    fn resolve_endpoints() {
        let mut file = legacy_file();
        file.authority = Some("http://127.0.0.1:9999/".into());
        let cfg = resolve(file, Path::new("<test>")).unwrap();
        assert_eq!(cfg.token_endpoint(), "http://127.0.0.1:9999/tenant/oauth2/v2.0/token");
        assert_eq!(
            cfg.authorize_endpoint(),
            "http://127.0.0.1:9999/tenant/oauth2/v2.0/authorize"
        );
        assert_eq!(cfg.redirect_uri(), "http://localhost:5050/callback");
    }

    #[test]
    fn resolve_blueprint_uses_agent_as_delegated_client() {
        let file = FileConfig {
            tenant_id: Some("t".into()),
            credential: Some(CredentialMode::Blueprint(BlueprintConfig {
                blueprint_client_id: "bp".into(),
                blueprint_secret: "bps".into(),
                agent_client_id: "agent".into(),
            })),
            ..FileConfig::default()
        };
        let cfg = resolve(file, Path::new("<test>")).unwrap();
        assert_eq!(cfg.delegated.client_id, "agent");
        assert!(cfg.delegated.client_secret.is_none());
    }

    #[test]
    fn resolve_rejects_missing_tenant() {
        let mut file = legacy_file();
        file.tenant_id = Some(" ".into());
        let err = resolve(file, Path::new("/etc/x.json")).unwrap_err();
        assert!(err.to_string().contains("missing tenantId"));
        assert!(err.to_string().contains("/etc/x.json"));
    }

    #[test]
    fn resolve_rejects_missing_credential() {
        let mut file = legacy_file();
        file.credential = None;
        assert!(resolve(file, Path::new("<test>")).is_err());
    }

    #[test]
    fn resolve_rejects_empty_blueprint_fields() {
        let file = FileConfig {
            tenant_id: Some("t".into()),
            credential: Some(CredentialMode::Blueprint(BlueprintConfig {
                blueprint_client_id: "bp".into(),
                blueprint_secret: "".into(),
                agent_client_id: "agent".into(),
            })),
            ..FileConfig::default()
        };
        let err = resolve(file, Path::new("<test>")).unwrap_err();
        assert!(err.to_string().contains("blueprintSecret"));
    }

    #[test]
    fn resolve_remote_storage_defaults_to_hosted() {
        let mut file = legacy_file();
        file.storage = Some(StorageSection::Remote {
            url: "https://acct.blob.core.windows.net/c/{subject}.json?sig=x".into(),
        });
        let cfg = resolve(file, Path::new("<test>")).unwrap();
        assert_eq!(cfg.sign_in.mode, SignInMode::Hosted);
    }

    #[test]
    fn resolve_rejects_zero_poll_interval() {
        let mut file = legacy_file();
        file.sign_in.poll_interval_ms = Some(0);
        assert!(resolve(file, Path::new("<test>")).is_err());
    }

    #[test]
    fn load_config_file_parses_jsonc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("delegauth.jsonc");
        std::fs::write(
            &path,
            r#"{
  // tenant
  "tenantId": "t",
  "credential": { "mode": "legacy", "clientId": "c", "clientSecret": "s" },
  "storage": { "backend": "local", "dir": "/tmp/delegauth-tokens" }
}"#,
        )
        .unwrap();

        let file = load_config_file(&path).unwrap();
        let cfg = resolve(file, &path).unwrap();
        assert_eq!(
            cfg.storage,
            StorageBackend::Local {
                dir: PathBuf::from("/tmp/delegauth-tokens")
            }
        );
    }

    #[test]
    fn load_config_file_error_on_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not valid json at all").unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[test]
    fn load_config_explicit_missing_path_errors() {
        let err = load_config(Some("/nonexistent/delegauth.json")).unwrap_err();
        assert!(matches!(err, AuthError::ConfigError { .. }));
    }

    #[test]
    fn expand_home_handles_tilde() {
        let p = expand_home("~/tokens");
        assert!(p.ends_with("tokens"));
        assert_eq!(expand_home("/abs/dir"), PathBuf::from("/abs/dir"));
    }
}
