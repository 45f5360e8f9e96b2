use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockBuilder, ResponseTemplate};

use super::TENANT;

#[allow(dead_code)]
pub fn token_path() -> String {
    format!("/{TENANT}/oauth2/v2.0/token")
}

/// POST to the token endpoint whose form body contains every fragment.
#[allow(dead_code)]
pub fn token_request(fragments: &[&str]) -> MockBuilder {
    fragments.iter().fold(
        Mock::given(method("POST")).and(path(token_path())),
        |mock, fragment| mock.and(body_string_contains(*fragment)),
    )
}

#[allow(dead_code)]
pub fn token_ok(access: &str, expires_in: i64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "token_type": "Bearer",
        "access_token": access,
        "expires_in": expires_in,
    }))
}

#[allow(dead_code)]
pub fn token_ok_with_refresh(access: &str, refresh: &str, expires_in: i64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "token_type": "Bearer",
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": expires_in,
        "scope": "https://graph.microsoft.com/Calendars.Read offline_access",
    }))
}

#[allow(dead_code)]
pub fn token_error(status: u16, code: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({
        "error": code,
        "error_description": format!("{code}: rejected by mock"),
    }))
}
