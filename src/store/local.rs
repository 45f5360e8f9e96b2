use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::AuthError;
use crate::store::TokenBackend;
use crate::token::DelegatedToken;

/// One JSON file per subject under a directory.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn token_path(&self, subject: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_subject(subject)))
    }
}

/// Subjects become file names. Bytes outside a conservative charset are
/// percent-encoded, so distinct subjects always map to distinct files and
/// none can escape the token directory. A leading dot is encoded too, which
/// keeps records out of hidden-file territory.
fn encode_subject(subject: &str) -> String {
    let mut encoded = String::with_capacity(subject.len());
    for (i, b) in subject.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric()
            || matches!(b, b'-' | b'_' | b'@')
            || (b == b'.' && i > 0);
        if keep {
            encoded.push(char::from(b));
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

#[async_trait]
impl TokenBackend for FileBackend {
    async fn load(&self, subject: &str) -> Result<Option<DelegatedToken>, AuthError> {
        let path = self.token_path(subject);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&data).map(Some).map_err(|e| {
            AuthError::StorageUnavailable(format!("corrupt token file {}: {e}", path.display()))
        })
    }

    async fn save(&self, subject: &str, token: &DelegatedToken) -> Result<(), AuthError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.token_path(subject);
        let data = serde_json::to_string_pretty(token).map_err(|e| {
            AuthError::StorageUnavailable(format!("Failed to serialize token: {e}"))
        })?;

        // Write-then-rename so readers never observe a half-written file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        restrict_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %path.display(), "delegated token saved");
        Ok(())
    }

    async fn delete(&self, subject: &str) -> Result<(), AuthError> {
        match tokio::fs::remove_file(self.token_path(subject)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("local directory {}", self.dir.display())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
