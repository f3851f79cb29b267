//! Bearer credentials for API sources.
//!
//! The OAuth authorization flow itself lives outside the pipeline; this module
//! only reads the current token pair and exchanges the refresh token when the
//! API rejects the access token. Refreshed pairs are written back to the
//! credentials file so the next run starts from them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rela_storage::{HttpFetcher, HttpRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AdapterError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn current(&self) -> Result<Credential, AdapterError>;

    /// Exchanges the refresh token for a new pair. Failure is fatal to the run.
    async fn refresh(&self) -> Result<Credential, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct FileCredentialStore {
    path: PathBuf,
    oauth: Option<OAuthClientConfig>,
    http: Arc<HttpFetcher>,
    state: Mutex<Option<Credential>>,
}

impl FileCredentialStore {
    /// Loads the pair stored at `path`, falling back to `initial` (typically
    /// taken from the environment) when the file does not exist yet.
    pub async fn open(
        path: impl Into<PathBuf>,
        oauth: Option<OAuthClientConfig>,
        http: Arc<HttpFetcher>,
        initial: Option<Credential>,
    ) -> Result<Self, AdapterError> {
        let path = path.into();
        let stored = read_credential_file(&path).await?;
        Ok(Self {
            path,
            oauth,
            http,
            state: Mutex::new(stored.or(initial)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn read_credential_file(path: &Path) -> Result<Option<Credential>, AdapterError> {
    match fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| AdapterError::Parse(format!("credentials file {}: {e}", path.display()))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Temp file in the same directory, then rename, so readers never see a
/// half-written pair.
async fn write_credential_file(path: &Path, credential: &Credential) -> Result<(), AdapterError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(parent).await?;

    let body = serde_json::to_vec_pretty(credential)
        .map_err(|e| AdapterError::Parse(format!("serializing credential: {e}")))?;
    let temp_path = parent.join(format!(".credentials.{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(&body).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err.into());
    }
    Ok(())
}

#[async_trait]
impl CredentialProvider for FileCredentialStore {
    async fn current(&self) -> Result<Credential, AdapterError> {
        self.state
            .lock()
            .await
            .clone()
            .ok_or_else(|| AdapterError::MissingCredential(self.path.display().to_string()))
    }

    async fn refresh(&self) -> Result<Credential, AdapterError> {
        let mut state = self.state.lock().await;
        let Some(oauth) = &self.oauth else {
            return Err(AdapterError::CredentialRefresh(
                "no OAuth client configured".to_string(),
            ));
        };
        let Some(refresh_token) = state.as_ref().and_then(|c| c.refresh_token.clone()) else {
            return Err(AdapterError::CredentialRefresh(
                "no refresh token stored".to_string(),
            ));
        };

        let request = HttpRequest::post_json(
            oauth.token_url.clone(),
            json!({
                "grant_type": "refresh_token",
                "client_id": oauth.client_id,
                "client_secret": oauth.client_secret,
                "refresh_token": refresh_token,
            }),
        )
        .header("Accept", "application/json");

        let response = self
            .http
            .fetch(&request)
            .await
            .map_err(|e| AdapterError::CredentialRefresh(e.to_string()))?;
        let token: TokenResponse = response
            .json()
            .map_err(|e| AdapterError::CredentialRefresh(e.to_string()))?;

        let credential = Credential {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or(Some(refresh_token)),
            expires_at: token.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        };

        if let Err(err) = write_credential_file(&self.path, &credential).await {
            warn!(path = %self.path.display(), error = %err, "could not persist refreshed credential");
        }
        info!("access token refreshed");
        *state = Some(credential.clone());
        Ok(credential)
    }
}
