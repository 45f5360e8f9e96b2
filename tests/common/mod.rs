pub mod http_mock;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use backon::ExponentialBuilder;
use chrono::Utc;
use delegauth::config::{resolve, FileConfig};
use delegauth::store::FileBackend;
use delegauth::{AuthRuntime, CredentialConfig, DelegatedToken, ExchangeEngine, ScopeSet};
use serde_json::{json, Value};

#[allow(dead_code)]
pub const TENANT: &str = "tenant-1";

/// Legacy-mode config JSON pointing the authority at a mock server.
#[allow(dead_code)]
pub fn legacy_json(authority: &str, token_dir: &Path) -> Value {
    json!({
        "tenantId": TENANT,
        "authority": authority,
        "credential": { "mode": "legacy", "clientId": "legacy-app", "clientSecret": "legacy-secret" },
        "delegated": { "redirectBaseUrl": "http://localhost:0" },
        "storage": { "backend": "local", "dir": token_dir.to_string_lossy() },
        "signIn": { "mode": "local", "timeoutMs": 5000, "pollIntervalMs": 20 }
    })
}

#[allow(dead_code)]
pub fn blueprint_json(authority: &str, token_dir: &Path) -> Value {
    json!({
        "tenantId": TENANT,
        "authority": authority,
        "credential": {
            "mode": "blueprint",
            "blueprintClientId": "bp-app",
            "blueprintSecret": "bp-secret",
            "agentClientId": "agent-app"
        },
        "delegated": { "redirectBaseUrl": "http://localhost:0" },
        "storage": { "backend": "local", "dir": token_dir.to_string_lossy() },
        "signIn": { "mode": "local", "timeoutMs": 5000, "pollIntervalMs": 20 }
    })
}

#[allow(dead_code)]
pub fn config_from(value: Value) -> CredentialConfig {
    let file: FileConfig = serde_json::from_value(value).unwrap();
    resolve(file, Path::new("<test>")).unwrap()
}

/// Retries that finish in milliseconds.
#[allow(dead_code)]
pub fn fast_retry() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
        .with_max_times(2)
}

#[allow(dead_code)]
pub fn engine_for(config: &Arc<CredentialConfig>) -> ExchangeEngine {
    ExchangeEngine::new(config.clone(), reqwest::Client::new()).with_retry_policy(fast_retry())
}

/// Runtime over a local token directory with fast retries.
#[allow(dead_code)]
pub fn runtime_for(config: CredentialConfig, token_dir: &Path) -> AuthRuntime {
    let config = Arc::new(config);
    let engine = engine_for(&config);
    AuthRuntime::with_parts(
        config,
        engine,
        Arc::new(FileBackend::new(token_dir.to_path_buf())),
    )
}

#[allow(dead_code)]
pub fn delegated_token(access: &str, expires_in: chrono::Duration, refresh: Option<&str>) -> DelegatedToken {
    DelegatedToken {
        access_token: access.into(),
        refresh_token: refresh.map(String::from),
        expires_at: Utc::now() + expires_in,
        scopes: ScopeSet::new(["https://graph.microsoft.com/Calendars.Read"]),
        subject: "me".into(),
    }
}

/// A port that was free a moment ago.
#[allow(dead_code)]
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[allow(dead_code)]
pub fn query_param(url: &str, name: &str) -> Option<String> {
    url::Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Write a config file into `dir` and return its path.
#[allow(dead_code)]
pub fn write_config(dir: &Path, value: &Value) -> PathBuf {
    let path = dir.join("delegauth.json");
    std::fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path
}
