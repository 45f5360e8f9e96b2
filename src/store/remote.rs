use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::AuthError;
use crate::store::TokenBackend;
use crate::token::DelegatedToken;

const SUBJECT_PLACEHOLDER: &str = "{subject}";

/// Token records in an HTTP object store (block-blob semantics).
///
/// The URL may carry its own query-string credentials. When it contains
/// `{subject}` each subject gets its own object; otherwise all subjects
/// share one object and only the last writer's record is kept.
pub struct BlobBackend {
    url: String,
    http: reqwest::Client,
}

impl BlobBackend {
    pub fn new(url: String, http: reqwest::Client) -> Self {
        Self { url, http }
    }

    pub fn object_url(&self, subject: &str) -> String {
        if self.url.contains(SUBJECT_PLACEHOLDER) {
            let encoded: String = url::form_urlencoded::byte_serialize(subject.as_bytes()).collect();
            self.url.replace(SUBJECT_PLACEHOLDER, &encoded)
        } else {
            self.url.clone()
        }
    }

    /// reqwest errors must arrive here with `without_url()` applied; their
    /// Display would otherwise repeat the query credentials.
    fn unavailable(&self, action: &str, detail: impl std::fmt::Display) -> AuthError {
        AuthError::StorageUnavailable(format!("{action} {}: {detail}", redact_query(&self.url)))
    }
}

/// Strip query-string credentials before a URL reaches a log or error.
fn redact_query(raw: &str) -> &str {
    raw.split('?').next().unwrap_or(raw)
}

#[async_trait]
impl TokenBackend for BlobBackend {
    async fn load(&self, subject: &str) -> Result<Option<DelegatedToken>, AuthError> {
        let resp = self
            .http
            .get(self.object_url(subject))
            .send()
            .await
            .map_err(|e| self.unavailable("GET", e.without_url()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let token = resp
                    .json::<DelegatedToken>()
                    .await
                    .map_err(|e| self.unavailable("parse record from", e.without_url()))?;
                Ok(Some(token))
            }
            s => Err(self.unavailable("GET", format!("status {s}"))),
        }
    }

    async fn save(&self, subject: &str, token: &DelegatedToken) -> Result<(), AuthError> {
        let resp = self
            .http
            .put(self.object_url(subject))
            .header("x-ms-blob-type", "BlockBlob")
            .json(token)
            .send()
            .await
            .map_err(|e| self.unavailable("PUT", e.without_url()))?;
        if !resp.status().is_success() {
            return Err(self.unavailable("PUT", format!("status {}", resp.status())));
        }
        tracing::debug!(url = redact_query(&self.url), "delegated token uploaded");
        Ok(())
    }

    async fn delete(&self, subject: &str) -> Result<(), AuthError> {
        let resp = self
            .http
            .delete(self.object_url(subject))
            .send()
            .await
            .map_err(|e| self.unavailable("DELETE", e.without_url()))?;
        match resp.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(self.unavailable("DELETE", format!("status {s}"))),
        }
    }

    fn describe(&self) -> String {
        format!("remote object {}", redact_query(&self.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_substitutes_subject() {
        let b = BlobBackend::new(
            "https://acct.blob/tokens/{subject}.json?sig=abc".into(),
            reqwest::Client::new(),
        );
        assert_eq!(
            b.object_url("alice@contoso.com"),
            "https://acct.blob/tokens/alice%40contoso.com.json?sig=abc"
        );
    }

    #[test]
    fn object_url_without_placeholder_is_shared() {
        let b = BlobBackend::new("https://acct.blob/t.json".into(), reqwest::Client::new());
        assert_eq!(b.object_url("a"), b.object_url("b"));
    }

    #[test]
    fn describe_hides_query_credentials() {
        let b = BlobBackend::new(
            "https://acct.blob/t.json?sv=1&sig=secret".into(),
            reqwest::Client::new(),
        );
        assert!(!b.describe().contains("secret"));
    }
}
