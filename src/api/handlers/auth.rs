use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::response::{ApiError, AppQuery, JSend};
use crate::backend::DriveStore;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ConsentResponse {
    pub consent_url: String,
    pub authorized: bool,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub authorized: bool,
}

fn drive(state: &AppState) -> Result<&DriveStore, ApiError> {
    state
        .content
        .backend()
        .as_drive()
        .ok_or_else(|| ApiError::not_found("Drive storage is not enabled"))
}

/// Route: GET /auth/drive
pub async fn drive_consent(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<ConsentResponse>>, ApiError> {
    let drive = drive(&state)?;
    Ok(JSend::success(ConsentResponse {
        consent_url: drive.consent_url(),
        authorized: drive.has_credential().await,
    }))
}

/// Route: GET /auth/drive/callback?code=...
pub async fn drive_callback(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<CallbackParams>,
) -> Result<Json<JSend<CallbackResponse>>, ApiError> {
    let drive = drive(&state)?;

    if let Some(error) = params.error {
        return Err(ApiError::bad_request(format!("Consent was not granted: {error}")));
    }
    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::bad_request("code query parameter is required"))?;

    drive.exchange_code(&code).await?;
    Ok(JSend::success(CallbackResponse { authorized: true }))
}
