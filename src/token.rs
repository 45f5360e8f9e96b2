use std::collections::BTreeSet;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tokens within this many seconds of expiry are treated as already expired.
pub const SAFETY_MARGIN_SECS: i64 = 60;

/// Lifetime assumed when a token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

pub fn safety_margin() -> chrono::Duration {
    chrono::Duration::seconds(SAFETY_MARGIN_SECS)
}

/// Normalized, order-independent set of OAuth scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            scopes
                .into_iter()
                .map(Into::into)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    /// Parse a space-delimited scope string, as returned in token responses.
    pub fn parse(raw: &str) -> Self {
        Self::new(raw.split_whitespace())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Space-delimited form used in `scope` form parameters.
    pub fn to_param(&self) -> String {
        self.iter().collect::<Vec<_>>().join(" ")
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_param())
    }
}

impl<S: Into<String>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Application-level access token for non-delegated scopes.
#[derive(Debug, Clone)]
pub struct AppOnlyToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: ScopeSet,
}

impl AppOnlyToken {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        usable_before(self.expires_at, now)
    }

    pub fn is_usable(&self) -> bool {
        self.is_usable_at(Utc::now())
    }
}

/// Short-lived proof of the blueprint identity. Only ever presented as a
/// client assertion; deliberately not `Serialize`.
#[derive(Clone)]
pub struct BootstrapToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
}

impl fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("issuer", &self.issuer)
            .finish()
    }
}

/// User-scoped token persisted per subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatedToken {
    pub access_token: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub refresh_token: Option<String>,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: ScopeSet,
    #[serde(default)]
    pub subject: String,
}

impl DelegatedToken {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        usable_before(self.expires_at, now)
    }

    pub fn is_usable(&self) -> bool {
        self.is_usable_at(Utc::now())
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|r| !r.is_empty())
    }
}

/// Records at the edge of the representable range count as expired rather
/// than overflowing the margin arithmetic.
fn usable_before(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at
        .checked_sub_signed(safety_margin())
        .is_some_and(|deadline| now < deadline)
}

/// Hosted callbacks write `refresh_token: ""` when none was issued.
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()))
}

/// Accepts RFC 3339 strings as well as epoch seconds (integer or float).
fn flexible_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Epoch(f64),
        Text(DateTime<Utc>),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Text(dt) => Ok(dt),
        Raw::Epoch(secs) => {
            let whole = secs.trunc() as i64;
            let nanos = (secs.fract() * 1e9) as u32;
            DateTime::from_timestamp(whole, nanos)
                .ok_or_else(|| D::Error::custom(format!("timestamp {secs} out of range")))
        }
    }
}

/// Raw token response from the token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry implied by `expires_in`, or `None` when the server
    /// sent a lifetime that does not land on a representable instant.
    fn lifetime_end(&self) -> Option<DateTime<Utc>> {
        let secs = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        chrono::TimeDelta::try_seconds(secs).and_then(|d| Utc::now().checked_add_signed(d))
    }

    /// Reject responses whose `expires_in` cannot be turned into a deadline.
    pub fn check_lifetime(&self) -> Result<(), String> {
        match self.lifetime_end() {
            Some(_) => Ok(()),
            None => Err(format!(
                "expires_in {} is out of range",
                self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)
            )),
        }
    }

    fn expires_at(&self) -> DateTime<Utc> {
        self.lifetime_end().unwrap_or_else(Utc::now)
    }

    /// Prefer the scopes the server says it granted over the ones requested.
    fn granted_or(&self, requested: &ScopeSet) -> ScopeSet {
        match self.scope.as_deref() {
            Some(raw) if !raw.trim().is_empty() => ScopeSet::parse(raw),
            _ => requested.clone(),
        }
    }

    pub fn into_app_only(self, requested: &ScopeSet) -> AppOnlyToken {
        AppOnlyToken {
            expires_at: self.expires_at(),
            scopes: self.granted_or(requested),
            access_token: self.access_token,
        }
    }

    pub fn into_bootstrap(self, fallback_issuer: &str) -> BootstrapToken {
        let issuer = jwt_issuer(&self.access_token).unwrap_or_else(|| fallback_issuer.to_string());
        BootstrapToken {
            expires_at: self.expires_at(),
            issuer,
            value: self.access_token,
        }
    }

    pub fn into_delegated(self, subject: &str, requested: &ScopeSet) -> DelegatedToken {
        DelegatedToken {
            expires_at: self.expires_at(),
            scopes: self.granted_or(requested),
            refresh_token: self.refresh_token.filter(|r| !r.is_empty()),
            access_token: self.access_token,
            subject: subject.to_string(),
        }
    }
}

/// Read the `iss` claim from a JWT without verifying it.
pub fn jwt_issuer(raw: &str) -> Option<String> {
    let payload = raw.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("iss")?.as_str().map(str::to_string)
}
