use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::config::Config;
use crate::platform::model::{
    CreateSegmentResponse, CreatedSegment, ListSegmentsResponse, RemoteSegment,
};

pub mod model;

/// Tag attached to every segment this engine creates, so the list endpoint
/// can return only rows we own.
const MANAGED_BY_TAG: &str = "segment-batcher";

/// How the platform rejected (or failed to serve) a call. The class decides
/// the retry policy: validation failures are final for that segment,
/// credential failures abort the whole job, transient failures get bounded
/// retries.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("segment definition rejected: {0}")]
    Validation(String),
    #[error("credential rejected: {0}")]
    Credential(String),
    #[error("transient platform error: {0}")]
    Transient(String),
}

#[async_trait]
pub trait SegmentApi: Send + Sync {
    async fn create_segment(
        &self,
        account_ref: &str,
        name: &str,
        definition: &Value,
    ) -> Result<CreatedSegment, ApiError>;

    async fn list_owned_segments(&self, account_ref: &str) -> Result<Vec<RemoteSegment>, ApiError>;
}

#[derive(Clone)]
pub struct HttpSegmentApi {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpSegmentApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSegmentApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpSegmentApi {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.platform.api_base).context("invalid platform.api_base")?;
        Ok(Self::with_base_url(cfg.platform.token.clone(), base_url))
    }

    pub fn with_base_url(token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("segment-batcher/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn build_create_request(
        &self,
        account_ref: &str,
        name: &str,
        definition: &Value,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("v1/accounts/{}/segments", account_ref))
            .context("invalid platform base URL")?;
        let body = build_create_body(name, definition);
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(&body)
            .build()
            .context("failed to build creation request")
    }

    fn classify(status: StatusCode, body: String) -> ApiError {
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ApiError::Validation(body)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Credential(body),
            StatusCode::TOO_MANY_REQUESTS => {
                // The pacer should keep us under the platform caps; a 429 here
                // means the account spent budget outside this engine.
                warn!("platform returned 429 despite local pacing");
                ApiError::Transient(format!("429: {}", body))
            }
            other => ApiError::Transient(format!("{}: {}", other, body)),
        }
    }
}

#[async_trait]
impl SegmentApi for HttpSegmentApi {
    async fn create_segment(
        &self,
        account_ref: &str,
        name: &str,
        definition: &Value,
    ) -> Result<CreatedSegment, ApiError> {
        let request = self
            .build_create_request(account_ref, name, definition)
            .map_err(|e| ApiError::Transient(e.to_string()))?;

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| ApiError::Transient(format!("failed to reach platform: {}", e)))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, segment = name, "segment creation rejected");
            return Err(Self::classify(status, body));
        }

        let payload: CreateSegmentResponse = res
            .json()
            .await
            .map_err(|e| ApiError::Transient(format!("invalid creation response: {}", e)))?;
        Ok(CreatedSegment {
            external_id: payload.id,
        })
    }

    async fn list_owned_segments(&self, account_ref: &str) -> Result<Vec<RemoteSegment>, ApiError> {
        let mut url = self
            .base_url
            .join(&format!("v1/accounts/{}/segments", account_ref))
            .map_err(|e| ApiError::Transient(e.to_string()))?;
        url.query_pairs_mut().append_pair("managed_by", MANAGED_BY_TAG);

        let res = self
            .http
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| ApiError::Transient(format!("failed to reach platform: {}", e)))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }

        let payload: ListSegmentsResponse = res
            .json()
            .await
            .map_err(|e| ApiError::Transient(format!("invalid list response: {}", e)))?;
        Ok(payload.segments)
    }
}

pub fn build_create_body(name: &str, definition: &Value) -> Value {
    json!({
        "name": name,
        "definition": definition,
        "managed_by": MANAGED_BY_TAG,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_create_body_tags_ownership() {
        let body = build_create_body("VIP Buyers", &json!({"min_spend": 500}));
        assert_eq!(body["name"], "VIP Buyers");
        assert_eq!(body["definition"]["min_spend"], 500);
        assert_eq!(body["managed_by"], MANAGED_BY_TAG);
    }

    #[test]
    fn build_create_request_sets_headers_and_path() {
        let api = HttpSegmentApi::with_base_url(
            "token".into(),
            Url::parse("https://api.example.com/").unwrap(),
        );
        let request = api
            .build_create_request("acct-1", "VIP", &json!({}))
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/v1/accounts/acct-1/segments");
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn classify_maps_status_classes() {
        let v = HttpSegmentApi::classify(StatusCode::UNPROCESSABLE_ENTITY, "bad rule".into());
        assert!(matches!(v, ApiError::Validation(_)));
        let c = HttpSegmentApi::classify(StatusCode::UNAUTHORIZED, "expired".into());
        assert!(matches!(c, ApiError::Credential(_)));
        let t = HttpSegmentApi::classify(StatusCode::BAD_GATEWAY, "upstream".into());
        assert!(matches!(t, ApiError::Transient(_)));
        let q = HttpSegmentApi::classify(StatusCode::TOO_MANY_REQUESTS, "slow down".into());
        assert!(matches!(q, ApiError::Transient(_)));
    }
}
