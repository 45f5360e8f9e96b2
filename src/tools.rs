use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use url::Url;

use crate::error::AuthError;
use crate::retry::{DelegatedTool, ToolResponse};
use crate::token::{DelegatedToken, ScopeSet};

const DEFAULT_DAYS: i64 = 7;
const MAX_DAYS: i64 = 31;
const PAGE_SIZE: u32 = 50;

/// Reads the signed-in user's upcoming calendar events from Graph.
///
/// Arguments: `{"days": N}` (default 7, capped at 31).
pub struct GraphCalendarTool {
    base_url: String,
    http: reqwest::Client,
    scopes: ScopeSet,
}

impl GraphCalendarTool {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client, scopes: ScopeSet) -> Self {
        Self {
            base_url: base_url.into(),
            http,
            scopes,
        }
    }

    fn failed(&self, detail: String) -> AuthError {
        AuthError::ToolFailed {
            tool: self.name().to_string(),
            source: detail.into(),
        }
    }
}

fn window_days(args: &Value) -> i64 {
    args.get("days")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_DAYS)
        .clamp(1, MAX_DAYS)
}

/// Keep only the fields a conversation needs from a Graph event.
fn summarize_event(event: &Value) -> Value {
    json!({
        "subject": event.get("subject").cloned().unwrap_or(Value::Null),
        "start": event.pointer("/start/dateTime").cloned().unwrap_or(Value::Null),
        "end": event.pointer("/end/dateTime").cloned().unwrap_or(Value::Null),
        "location": event.pointer("/location/displayName").cloned().unwrap_or(Value::Null),
        "organizer": event
            .pointer("/organizer/emailAddress/name")
            .cloned()
            .unwrap_or(Value::Null),
    })
}

#[async_trait]
impl DelegatedTool for GraphCalendarTool {
    fn name(&self) -> &str {
        "calendar"
    }

    async fn call(
        &self,
        args: &Value,
        token: Option<&DelegatedToken>,
    ) -> Result<ToolResponse, AuthError> {
        let Some(token) = token else {
            return Ok(ToolResponse::AuthRequired {
                scopes: self.scopes.clone(),
            });
        };

        let start = Utc::now();
        let end = start + ChronoDuration::days(window_days(args));
        let url = Url::parse_with_params(
            &format!("{}/me/calendarView", self.base_url.trim_end_matches('/')),
            &[
                ("startDateTime", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("endDateTime", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("$select", "subject,start,end,location,organizer".into()),
                ("$orderby", "start/dateTime".into()),
                ("$top", PAGE_SIZE.to_string()),
            ],
        )
        .map_err(|e| self.failed(format!("invalid Graph base URL: {e}")))?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| self.failed(format!("request failed: {e}")))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::debug!(status = %resp.status(), "calendar call rejected the delegated token");
                Ok(ToolResponse::AuthRequired {
                    scopes: self.scopes.clone(),
                })
            }
            s if s.is_success() => {
                let body: Value = resp
                    .json()
                    .await
                    .map_err(|e| self.failed(format!("invalid response body: {e}")))?;
                let events: Vec<Value> = body
                    .get("value")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().map(summarize_event).collect())
                    .unwrap_or_default();
                Ok(ToolResponse::Ok(json!({
                    "count": events.len(),
                    "events": events,
                })))
            }
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(self.failed(format!("status {s}: {body}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_defaults_and_clamps() {
        assert_eq!(window_days(&json!({})), DEFAULT_DAYS);
        assert_eq!(window_days(&json!({"days": 3})), 3);
        assert_eq!(window_days(&json!({"days": 0})), 1);
        assert_eq!(window_days(&json!({"days": 400})), MAX_DAYS);
    }

    #[test]
    fn summarize_keeps_display_fields() {
        let event = json!({
            "subject": "Standup",
            "start": {"dateTime": "2030-01-01T09:00:00", "timeZone": "UTC"},
            "end": {"dateTime": "2030-01-01T09:15:00", "timeZone": "UTC"},
            "location": {"displayName": "Room 1"},
            "organizer": {"emailAddress": {"name": "Ada", "address": "ada@contoso.com"}},
            "bodyPreview": "ignored"
        });
        let s = summarize_event(&event);
        assert_eq!(s["subject"], "Standup");
        assert_eq!(s["location"], "Room 1");
        assert_eq!(s["organizer"], "Ada");
        assert!(s.get("bodyPreview").is_none());
    }

    #[tokio::test]
    async fn missing_token_is_auth_required() {
        let tool = GraphCalendarTool::new(
            "http://127.0.0.1:9",
            reqwest::Client::new(),
            ScopeSet::new(["Calendars.Read"]),
        );
        match tool.call(&json!({}), None).await.unwrap() {
            ToolResponse::AuthRequired { scopes } => assert!(scopes.contains("Calendars.Read")),
            other => panic!("expected auth required, got {other:?}"),
        }
    }
}
