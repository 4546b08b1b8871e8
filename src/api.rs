#![forbid(unsafe_code)]

// HTTP client adapter for the chat service REST API. One thin request
// wrapper, no retries; every call feeds the engine-level http_req_duration
// trend and http_req_failed rate, the caller decides what a non-2xx means.

use crate::metrics::Registry;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("invalid response body: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub nickname: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub user_id: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRoomRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDirectRoomRequest {
    pub target_user_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomResponse {
    pub id: u64,
}

/// Raw outcome of a single call.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    metrics: Arc<Registry>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, metrics: Arc<Registry>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            metrics,
        }
    }

    /// Issues one request and returns status plus raw body. Transport
    /// failures surface as errors; any received response, whatever its
    /// status, is handed back to the caller.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> ApiResult<ApiResponse> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), &url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let started = Instant::now();
        let result = request.send().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_duration("http_req_duration", elapsed_ms);

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                self.metrics
                    .add_rate("http_req_failed", !(200..300).contains(&status));
                let body = response.text().await.unwrap_or_default();
                debug!("{method} {path} -> {status} ({elapsed_ms}ms)");
                Ok(ApiResponse { status, body })
            }
            Err(e) => {
                self.metrics.add_rate("http_req_failed", true);
                debug!("{method} {path} -> transport error ({elapsed_ms}ms)");
                Err(e.into())
            }
        }
    }

    pub async fn signup(&self, signup: &SignupRequest) -> ApiResult<AuthResponse> {
        let response = self
            .request(
                Method::POST,
                "/api/auth/signup",
                Some(serde_json::to_value(signup)?),
                None,
            )
            .await?;
        if !response.is_success() {
            return Err(ApiError::UnexpectedStatus {
                status: response.status,
                body: response.body,
            });
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    pub async fn create_group_room(&self, token: &str, name: &str) -> ApiResult<RoomResponse> {
        let request = CreateGroupRoomRequest {
            name: name.to_string(),
        };
        let response = self
            .request(
                Method::POST,
                "/api/rooms/group",
                Some(serde_json::to_value(&request)?),
                Some(token),
            )
            .await?;
        if !response.is_success() {
            return Err(ApiError::UnexpectedStatus {
                status: response.status,
                body: response.body,
            });
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    pub async fn create_direct_room(
        &self,
        token: &str,
        target_user_id: u64,
    ) -> ApiResult<RoomResponse> {
        let request = CreateDirectRoomRequest { target_user_id };
        let response = self
            .request(
                Method::POST,
                "/api/rooms/direct",
                Some(serde_json::to_value(&request)?),
                Some(token),
            )
            .await?;
        if !response.is_success() {
            return Err(ApiError::UnexpectedStatus {
                status: response.status,
                body: response.body,
            });
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    pub async fn join_room(&self, token: &str, room_id: u64) -> ApiResult<()> {
        let response = self
            .request(
                Method::POST,
                &format!("/api/rooms/{room_id}/join"),
                None,
                Some(token),
            )
            .await?;
        if !response.is_success() {
            return Err(ApiError::UnexpectedStatus {
                status: response.status,
                body: response.body,
            });
        }
        Ok(())
    }

    pub async fn list_rooms(&self, token: &str) -> ApiResult<ApiResponse> {
        self.request(Method::GET, "/api/rooms", None, Some(token))
            .await
    }

    pub async fn room_detail(&self, token: &str, room_id: u64) -> ApiResult<ApiResponse> {
        self.request(Method::GET, &format!("/api/rooms/{room_id}"), None, Some(token))
            .await
    }

    pub async fn message_history(
        &self,
        token: &str,
        room_id: u64,
        size: u32,
    ) -> ApiResult<ApiResponse> {
        self.request(
            Method::GET,
            &format!("/api/rooms/{room_id}/messages?size={size}"),
            None,
            Some(token),
        )
        .await
    }
}
