//! Per-subject persistence of delegated tokens.

pub mod local;
pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StorageBackend;
use crate::error::AuthError;
use crate::keyed::KeyedMutex;
use crate::token::DelegatedToken;

pub use local::FileBackend;
pub use remote::BlobBackend;

/// Raw read/write access to wherever delegated tokens live.
#[async_trait]
pub trait TokenBackend: Send + Sync {
    /// `Ok(None)` when nothing is stored for `subject`.
    async fn load(&self, subject: &str) -> Result<Option<DelegatedToken>, AuthError>;
    async fn save(&self, subject: &str, token: &DelegatedToken) -> Result<(), AuthError>;
    /// Removing an absent record is not an error.
    async fn delete(&self, subject: &str) -> Result<(), AuthError>;
    fn describe(&self) -> String;
}

/// Exchanges a refresh value for a new delegated token.
#[async_trait]
pub trait DelegatedRefresh: Send + Sync {
    async fn refresh(&self, token: &DelegatedToken) -> Result<DelegatedToken, AuthError>;
}

/// Build the backend selected by configuration.
pub fn backend_for(
    storage: &StorageBackend,
    http: reqwest::Client,
) -> Arc<dyn TokenBackend> {
    match storage {
        StorageBackend::Local { dir } => Arc::new(FileBackend::new(dir.clone())),
        StorageBackend::Remote { url } => Arc::new(BlobBackend::new(url.clone(), http)),
    }
}

/// Delegated token store with transparent refresh.
///
/// All operations for one subject are serialized, so a refresh and a
/// concurrent `put` for the same subject never interleave.
pub struct DelegatedTokenStore {
    backend: Arc<dyn TokenBackend>,
    refresher: Option<Arc<dyn DelegatedRefresh>>,
    locks: KeyedMutex<String, ()>,
}

impl DelegatedTokenStore {
    pub fn new(backend: Arc<dyn TokenBackend>) -> Self {
        Self {
            backend,
            refresher: None,
            locks: KeyedMutex::new(),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn DelegatedRefresh>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn backend(&self) -> &dyn TokenBackend {
        self.backend.as_ref()
    }

    /// Return a usable token for `subject`, refreshing an expired one when
    /// possible. Unreadable storage is treated as "no token"; only a failure
    /// to persist a freshly refreshed token is reported as an error.
    pub async fn get(&self, subject: &str) -> Result<Option<DelegatedToken>, AuthError> {
        let _guard = self.locks.lock(&subject.to_string()).await;

        let stored = match self.backend.load(subject).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(subject, "cannot read delegated token, treating as absent: {e}");
                return Ok(None);
            }
        };
        let Some(token) = stored else {
            return Ok(None);
        };
        if token.is_usable() {
            return Ok(Some(token));
        }
        if !token.can_refresh() {
            tracing::debug!(subject, "stored delegated token expired without refresh value");
            return Ok(None);
        }
        let Some(refresher) = &self.refresher else {
            return Ok(None);
        };

        match refresher.refresh(&token).await {
            Ok(mut fresh) => {
                if fresh.subject.is_empty() {
                    fresh.subject = subject.to_string();
                }
                self.backend.save(subject, &fresh).await.map_err(|e| {
                    AuthError::StorageUnavailable(format!(
                        "refreshed token for '{subject}' could not be saved: {e}"
                    ))
                })?;
                tracing::info!(subject, "delegated token refreshed");
                Ok(Some(fresh))
            }
            Err(e) => {
                tracing::info!(subject, "delegated token refresh failed: {e}");
                Ok(None)
            }
        }
    }

    pub async fn put(&self, subject: &str, token: &DelegatedToken) -> Result<(), AuthError> {
        let _guard = self.locks.lock(&subject.to_string()).await;
        self.backend.save(subject, token).await
    }

    /// Remove the stored token. Idempotent.
    pub async fn invalidate(&self, subject: &str) -> Result<(), AuthError> {
        let _guard = self.locks.lock(&subject.to_string()).await;
        self.backend.delete(subject).await
    }

    /// True when `get` would return a token without any network call.
    pub async fn has_valid_token(&self, subject: &str) -> bool {
        let _guard = self.locks.lock(&subject.to_string()).await;
        matches!(self.backend.load(subject).await, Ok(Some(t)) if t.is_usable())
    }

    /// Read the stored record as-is, without refresh. Used by hosted sign-in
    /// polling, where the record is written by another process.
    pub async fn peek(&self, subject: &str) -> Result<Option<DelegatedToken>, AuthError> {
        let _guard = self.locks.lock(&subject.to_string()).await;
        self.backend.load(subject).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::ScopeSet;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryBackend {
        records: Mutex<HashMap<String, DelegatedToken>>,
        fail_reads: bool,
        fail_writes: bool,
    }

    #[async_trait]
    impl TokenBackend for MemoryBackend {
        async fn load(&self, subject: &str) -> Result<Option<DelegatedToken>, AuthError> {
            if self.fail_reads {
                return Err(AuthError::StorageUnavailable("read failed".into()));
            }
            Ok(self.records.lock().unwrap().get(subject).cloned())
        }
        async fn save(&self, subject: &str, token: &DelegatedToken) -> Result<(), AuthError> {
            if self.fail_writes {
                return Err(AuthError::StorageUnavailable("write failed".into()));
            }
            self.records
                .lock()
                .unwrap()
                .insert(subject.to_string(), token.clone());
            Ok(())
        }
        async fn delete(&self, subject: &str) -> Result<(), AuthError> {
            self.records.lock().unwrap().remove(subject);
            Ok(())
        }
        fn describe(&self) -> String {
            "memory".into()
        }
    }

    struct CountingRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DelegatedRefresh for CountingRefresher {
        async fn refresh(&self, token: &DelegatedToken) -> Result<DelegatedToken, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AuthError::InvalidCredentials {
                    stage: crate::error::ExchangeStage::Refresh,
                    detail: "invalid_grant".into(),
                });
            }
            Ok(DelegatedToken {
                access_token: "fresh".into(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                ..token.clone()
            })
        }
    }

    fn token(expires_in: chrono::Duration, refresh: Option<&str>) -> DelegatedToken {
        DelegatedToken {
            access_token: "stale".into(),
            refresh_token: refresh.map(String::from),
            expires_at: Utc::now() + expires_in,
            scopes: ScopeSet::new(["Calendars.Read"]),
            subject: "me".into(),
        }
    }

    fn refresher(fail: bool) -> Arc<CountingRefresher> {
        Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn get_returns_none_when_absent() {
        let store = DelegatedTokenStore::new(Arc::new(MemoryBackend::default()));
        assert!(store.get("me").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_returns_usable_token_without_refresh() {
        let r = refresher(false);
        let store = DelegatedTokenStore::new(Arc::new(MemoryBackend::default()))
            .with_refresher(r.clone());
        store.put("me", &token(chrono::Duration::hours(1), Some("r"))).await.unwrap();
        let got = store.get("me").await.unwrap().unwrap();
        assert_eq!(got.access_token, "stale");
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let r = refresher(false);
        let store = DelegatedTokenStore::new(Arc::new(MemoryBackend::default()))
            .with_refresher(r.clone());
        store.put("me", &token(chrono::Duration::seconds(30), Some("r"))).await.unwrap();

        let got = store.get("me").await.unwrap().unwrap();
        assert_eq!(got.access_token, "fresh");
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);

        let again = store.get("me").await.unwrap().unwrap();
        assert_eq!(again.access_token, "fresh");
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_without_refresh_value_is_absent() {
        let r = refresher(false);
        let store = DelegatedTokenStore::new(Arc::new(MemoryBackend::default()))
            .with_refresher(r.clone());
        store.put("me", &token(chrono::Duration::hours(-1), None)).await.unwrap();
        assert!(store.get("me").await.unwrap().is_none());
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_failure_is_absent_not_error() {
        let store = DelegatedTokenStore::new(Arc::new(MemoryBackend::default()))
            .with_refresher(refresher(true));
        store.put("me", &token(chrono::Duration::hours(-1), Some("r"))).await.unwrap();
        assert!(store.get("me").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_storage_is_absent() {
        let backend = MemoryBackend {
            fail_reads: true,
            ..MemoryBackend::default()
        };
        let store = DelegatedTokenStore::new(Arc::new(backend));
        assert!(store.get("me").await.unwrap().is_none());
        assert!(!store.has_valid_token("me").await);
    }

    #[tokio::test]
    async fn failed_save_after_refresh_is_storage_error() {
        let backend = MemoryBackend {
            fail_writes: true,
            ..MemoryBackend::default()
        };
        backend
            .records
            .lock()
            .unwrap()
            .insert("me".into(), token(chrono::Duration::hours(-1), Some("r")));
        let store = DelegatedTokenStore::new(Arc::new(backend)).with_refresher(refresher(false));
        let err = store.get("me").await.unwrap_err();
        assert_eq!(err.code(), "storage_unavailable");
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let store = DelegatedTokenStore::new(Arc::new(MemoryBackend::default()));
        store.put("me", &token(chrono::Duration::hours(1), None)).await.unwrap();
        store.invalidate("me").await.unwrap();
        store.invalidate("me").await.unwrap();
        assert!(store.get("me").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subjects_are_isolated() {
        let store = DelegatedTokenStore::new(Arc::new(MemoryBackend::default()));
        store.put("alice", &token(chrono::Duration::hours(1), None)).await.unwrap();
        assert!(store.has_valid_token("alice").await);
        assert!(!store.has_valid_token("bob").await);
    }
}
