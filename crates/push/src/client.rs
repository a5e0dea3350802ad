//! FCM delivery client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;

use caresync_core::push::PushMessageData;

use crate::error::{PushError, Result};

/// Default timeout for push delivery requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Delivery seam between the dispatcher and the external push service.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Sends one data message to the device addressed by `token`.
    async fn send_data_message(&self, token: &str, data: &PushMessageData) -> Result<()>;
}

#[derive(Serialize)]
struct FcmRequest<'a> {
    message: FcmMessage<'a>,
}

#[derive(Serialize)]
struct FcmMessage<'a> {
    token: &'a str,
    data: BTreeMap<&'static str, String>,
    android: FcmAndroidConfig,
}

#[derive(Serialize)]
struct FcmAndroidConfig {
    priority: &'static str,
}

/// Client for the FCM HTTP v1 message endpoint.
///
/// The bearer token is handed in by the caller; minting and refreshing OAuth
/// credentials is environment plumbing outside this crate.
#[derive(Debug, Clone)]
pub struct FcmClient {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: String,
}

impl FcmClient {
    /// Create a new client for the given `messages:send` endpoint.
    pub fn new(endpoint: &str, bearer_token: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bearer_token: bearer_token.to_string(),
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.bearer_token))
            .map_err(|_| PushError::InvalidRequest("invalid bearer token format".to_string()))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("push response status: {}", status);
            return;
        }
        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("push response error ({}): {}", status, preview);
    }
}

#[async_trait]
impl PushGateway for FcmClient {
    async fn send_data_message(&self, token: &str, data: &PushMessageData) -> Result<()> {
        let mut data_map = BTreeMap::new();
        data_map.insert("project", data.project.clone());
        data_map.insert("table", data.table.clone());
        if let Some(user) = &data.user {
            data_map.insert("user", user.clone());
        }
        let request = FcmRequest {
            message: FcmMessage {
                token,
                data: data_map,
                android: FcmAndroidConfig { priority: "HIGH" },
            },
        };
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);
        if !status.is_success() {
            return Err(PushError::service(status.as_u16(), body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_message_body_shape() {
        let mut data_map = BTreeMap::new();
        data_map.insert("project", "default".to_string());
        data_map.insert("table", "heart_rate".to_string());
        data_map.insert("user", "pat".to_string());
        let request = FcmRequest {
            message: FcmMessage {
                token: "tok",
                data: data_map,
                android: FcmAndroidConfig { priority: "HIGH" },
            },
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["message"]["token"], "tok");
        assert_eq!(body["message"]["android"]["priority"], "HIGH");
        assert_eq!(body["message"]["data"]["table"], "heart_rate");
    }
}
