use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};

use super::{request_error, status_error, BackendError, Locator};
use crate::retry::RetryPolicy;

const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
/// Refresh access tokens this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub folder_name: String,
    /// Where the refresh credential obtained through consent is kept.
    pub credentials_file: PathBuf,
    pub auth_url: String,
    pub token_url: String,
    pub api_base: String,
}

impl DriveConfig {
    pub fn google(
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        folder_name: String,
        credentials_file: PathBuf,
    ) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_uri,
            folder_name,
            credentials_file,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            api_base: "https://www.googleapis.com".to_string(),
        }
    }
}

/// Refresh credential persisted after a completed consent flow.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    refresh_token: String,
    #[serde(default)]
    scope: Option<String>,
    obtained_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    trashed: bool,
}

#[derive(Deserialize)]
struct FileList {
    files: Vec<DriveFile>,
}

#[derive(Deserialize)]
struct GeneratedIds {
    ids: Vec<String>,
}

struct AccessToken {
    token: String,
    expires_at: Instant,
}

/// Consumer cloud drive (Google Drive v3) gated by a user-granted OAuth2 credential.
///
/// Without a usable refresh credential every operation fails with
/// [`BackendError::AuthorizationRequired`]; the caller completes consent out of band
/// and retries.
pub struct DriveStore {
    config: DriveConfig,
    client: Client,
    access_token: RwLock<Option<AccessToken>>,
    folder_id: OnceCell<String>,
    retry: RetryPolicy,
}

impl DriveStore {
    pub fn new(
        config: DriveConfig,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, anyhow::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            config,
            client,
            access_token: RwLock::new(None),
            folder_id: OnceCell::new(),
            retry,
        })
    }

    /// URL the user must visit to grant access.
    pub fn consent_url(&self) -> String {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", DRIVE_SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ];
        match url::Url::parse_with_params(&self.config.auth_url, &params) {
            Ok(url) => url.to_string(),
            Err(_) => self.config.auth_url.clone(),
        }
    }

    fn authorization_required(&self) -> BackendError {
        BackendError::AuthorizationRequired {
            consent_url: self.consent_url(),
        }
    }

    /// Finish the consent flow: trade the authorization code for a refresh credential
    /// and persist it.
    pub async fn exchange_code(&self, code: &str) -> Result<(), BackendError> {
        let resp = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(request_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Backend(format!(
                "Authorization code exchange failed ({status}): {body}"
            )));
        }

        let token: TokenResponse = resp.json().await.map_err(request_error)?;
        let refresh_token = token.refresh_token.ok_or_else(|| {
            BackendError::Backend("Token endpoint returned no refresh token".to_string())
        })?;

        let credential = StoredCredential {
            refresh_token,
            scope: token.scope,
            obtained_at: Utc::now(),
        };
        self.write_credential(&credential).await?;

        *self.access_token.write().await = Some(AccessToken {
            token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in.unwrap_or(3600)),
        });

        tracing::info!("Drive credential stored");
        Ok(())
    }

    /// Whether a refresh credential is on disk. Says nothing about its validity.
    pub async fn has_credential(&self) -> bool {
        tokio::fs::try_exists(&self.config.credentials_file)
            .await
            .unwrap_or(false)
    }

    async fn write_credential(&self, credential: &StoredCredential) -> Result<(), BackendError> {
        let path = &self.config.credentials_file;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(credential)
            .map_err(|e| BackendError::Backend(e.to_string()))?;
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, &data).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }

    async fn read_credential(&self) -> Result<StoredCredential, BackendError> {
        let raw = match tokio::fs::read_to_string(&self.config.credentials_file).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.authorization_required())
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw).map_err(|e| {
            tracing::warn!(error = %e, "Drive credential file is unreadable");
            self.authorization_required()
        })
    }

    async fn token(&self) -> Result<String, BackendError> {
        {
            let cached = self.access_token.read().await;
            if let Some(t) = cached.as_ref() {
                if t.expires_at > Instant::now() + EXPIRY_MARGIN {
                    return Ok(t.token.clone());
                }
            }
        }

        let credential = self.read_credential().await?;
        let resp = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", credential.refresh_token.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = resp.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            tracing::warn!(reason = %reason, "Drive credential refresh rejected");
            return Err(self.authorization_required());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, "Drive token refresh", &body));
        }

        let token: TokenResponse = resp.json().await.map_err(request_error)?;
        let access = token.access_token.clone();
        *self.access_token.write().await = Some(AccessToken {
            token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in.unwrap_or(3600)),
        });
        Ok(access)
    }

    /// Drop the cached access token and mark the failure transient so the retry
    /// loop refreshes it.
    async fn expired(&self, context: &str) -> BackendError {
        *self.access_token.write().await = None;
        BackendError::Retriable(format!("{context}: access token rejected"))
    }

    async fn folder(&self) -> Result<&str, BackendError> {
        let id = self
            .folder_id
            .get_or_try_init(|| async {
                self.retry
                    .run("drive.folder", || self.find_or_create_folder())
                    .await
            })
            .await?;
        Ok(id.as_str())
    }

    async fn find_or_create_folder(&self) -> Result<String, BackendError> {
        let token = self.token().await?;
        let query = format!(
            "name='{}' and mimeType='{FOLDER_MIME}' and trashed=false",
            self.config.folder_name.replace('\'', "\\'")
        );

        let resp = self
            .client
            .get(format!("{}/drive/v3/files", self.config.api_base))
            .bearer_auth(&token)
            .query(&[("q", query.as_str()), ("fields", "files(id)")])
            .send()
            .await
            .map_err(request_error)?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(self.expired("Drive folder lookup").await);
        }
        let resp = expect_success(resp, "Drive folder lookup").await?;
        let list: FileList = resp.json().await.map_err(request_error)?;
        if let Some(folder) = list.files.into_iter().next() {
            return Ok(folder.id);
        }

        let resp = self
            .client
            .post(format!("{}/drive/v3/files", self.config.api_base))
            .bearer_auth(&token)
            .query(&[("fields", "id")])
            .json(&serde_json::json!({
                "name": self.config.folder_name,
                "mimeType": FOLDER_MIME,
            }))
            .send()
            .await
            .map_err(request_error)?;
        let resp = expect_success(resp, "Drive folder create").await?;
        let folder: DriveFile = resp.json().await.map_err(request_error)?;
        tracing::info!(folder = %self.config.folder_name, "Created Drive folder");
        Ok(folder.id)
    }

    /// Reserve a file id up front. Creating with a fixed id makes the upload safe to
    /// retry: a repeat after a lost response conflicts instead of duplicating.
    async fn reserve_id(&self) -> Result<String, BackendError> {
        self.retry
            .run("drive.generate_ids", || async {
                let token = self.token().await?;
                let resp = self
                    .client
                    .get(format!("{}/drive/v3/files/generateIds", self.config.api_base))
                    .bearer_auth(&token)
                    .query(&[("count", "1"), ("space", "drive"), ("type", "files")])
                    .send()
                    .await
                    .map_err(request_error)?;
                if resp.status() == StatusCode::UNAUTHORIZED {
                    return Err(self.expired("Drive id reservation").await);
                }
                let resp = expect_success(resp, "Drive id reservation").await?;
                let generated: GeneratedIds = resp.json().await.map_err(request_error)?;
                generated.ids.into_iter().next().ok_or_else(|| {
                    BackendError::Backend("Drive returned no file id".to_string())
                })
            })
            .await
    }

    pub async fn put(&self, data: Bytes, content_type: &str) -> Result<Locator, BackendError> {
        let folder = self.folder().await?;
        let id = self.reserve_id().await?;
        let name = uuid::Uuid::new_v4().simple().to_string();
        let boundary = format!("docstore-{}", uuid::Uuid::new_v4().simple());
        let metadata = upload_metadata(&id, &name, folder, content_type);
        let body = multipart_related(&boundary, &metadata.to_string(), content_type, &data);

        self.retry
            .run("drive.put", || async {
                let token = self.token().await?;
                let resp = self
                    .client
                    .post(format!("{}/upload/drive/v3/files", self.config.api_base))
                    .bearer_auth(&token)
                    .query(&[("uploadType", "multipart"), ("fields", "id")])
                    .header(
                        "content-type",
                        format!("multipart/related; boundary={boundary}"),
                    )
                    .body(body.clone())
                    .send()
                    .await
                    .map_err(request_error)?;
                match resp.status() {
                    StatusCode::UNAUTHORIZED => Err(self.expired("Drive upload").await),
                    status if created_by_earlier_attempt(status) => {
                        tracing::debug!(id = %id, "Drive upload already landed");
                        Ok(())
                    }
                    _ => {
                        expect_success(resp, "Drive upload").await?;
                        Ok(())
                    }
                }
            })
            .await?;

        Ok(Locator::new(id))
    }

    pub async fn get(&self, locator: &Locator) -> Result<Bytes, BackendError> {
        self.retry
            .run("drive.get", || async {
                let token = self.token().await?;
                let resp = self
                    .client
                    .get(self.file_url(locator))
                    .bearer_auth(&token)
                    .query(&[("alt", "media")])
                    .send()
                    .await
                    .map_err(request_error)?;
                if resp.status() == StatusCode::UNAUTHORIZED {
                    return Err(self.expired("Drive download").await);
                }
                let resp = expect_success(resp, "Drive download").await?;
                resp.bytes().await.map_err(request_error)
            })
            .await
    }

    pub async fn delete(&self, locator: &Locator) -> Result<bool, BackendError> {
        self.retry
            .run("drive.delete", || async {
                let token = self.token().await?;
                let resp = self
                    .client
                    .delete(self.file_url(locator))
                    .bearer_auth(&token)
                    .send()
                    .await
                    .map_err(request_error)?;
                match resp.status() {
                    StatusCode::NOT_FOUND => Ok(false),
                    StatusCode::UNAUTHORIZED => Err(self.expired("Drive delete").await),
                    _ => {
                        expect_success(resp, "Drive delete").await?;
                        Ok(true)
                    }
                }
            })
            .await
    }

    pub async fn exists(&self, locator: &Locator) -> Result<bool, BackendError> {
        self.retry
            .run("drive.exists", || async {
                let token = self.token().await?;
                let resp = self
                    .client
                    .get(self.file_url(locator))
                    .bearer_auth(&token)
                    .query(&[("fields", "id,trashed")])
                    .send()
                    .await
                    .map_err(request_error)?;
                match resp.status() {
                    StatusCode::NOT_FOUND => Ok(false),
                    StatusCode::UNAUTHORIZED => Err(self.expired("Drive metadata").await),
                    _ => {
                        let resp = expect_success(resp, "Drive metadata").await?;
                        let file: DriveFile = resp.json().await.map_err(request_error)?;
                        Ok(!file.trashed)
                    }
                }
            })
            .await
    }

    fn file_url(&self, locator: &Locator) -> String {
        format!(
            "{}/drive/v3/files/{}",
            self.config.api_base,
            locator.as_str()
        )
    }
}

async fn expect_success(
    resp: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, BackendError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, context, &body))
}

/// Metadata part of an upload: the reserved id pins the file's identity.
fn upload_metadata(id: &str, name: &str, folder: &str, content_type: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "parents": [folder],
        "mimeType": content_type,
    })
}

/// A create with an already reserved id answers 409 once an earlier attempt stored it.
fn created_by_earlier_attempt(status: StatusCode) -> bool {
    status == StatusCode::CONFLICT
}

/// Body for Drive's `uploadType=multipart`: JSON metadata part followed by the media.
fn multipart_related(boundary: &str, metadata: &str, content_type: &str, data: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(data.len() + metadata.len() + 256);
    body.put_slice(format!("--{boundary}\r\n").as_bytes());
    body.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.put_slice(metadata.as_bytes());
    body.put_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.put_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.put_slice(data);
    body.put_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body.freeze()
}
