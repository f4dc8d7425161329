//! Signed API gateway client.
//!
//! Every gateway call posts the same JSON envelope and receives the same
//! response shape. A non-200 `code` in the response body is an application
//! error and carries the server's message.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::{
    cloud::signing::{self, HeaderMap, SIGNATURE_METHOD},
    error::{MowerError, Result},
    types::{AppCredentials, CloudConfig},
};

/// Response code of a successful gateway call
pub const CODE_OK: i64 = 200;

/// RFC 1123 date as sent in the `date` header
pub(crate) fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Per-request metadata of a gateway envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// API version of the called path
    pub api_ver: String,
    /// Response language
    pub language: String,
    /// Session token for authenticated paths
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iot_token: Option<String>,
}

/// Gateway request envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayRequest {
    /// Unique request id
    pub id: String,
    /// Envelope version
    pub version: String,
    /// Request metadata
    pub request: RequestContext,
    /// Path-specific parameters
    pub params: Value,
}

impl GatewayRequest {
    /// Create an unauthenticated envelope with a fresh id
    #[must_use]
    pub fn new(api_ver: &str, language: &str, params: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: "1.0".to_string(),
            request: RequestContext {
                api_ver: api_ver.to_string(),
                language: language.to_string(),
                iot_token: None,
            },
            params,
        }
    }

    /// Attach the session token
    #[must_use]
    pub fn with_iot_token(mut self, iot_token: impl Into<String>) -> Self {
        self.request.iot_token = Some(iot_token.into());
        self
    }
}

/// Gateway response envelope
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayResponse {
    /// Application-level response code
    pub code: i64,
    /// Server message
    #[serde(default)]
    pub message: Option<String>,
    /// Server message, as some paths name it
    #[serde(default)]
    pub msg: Option<String>,
    /// Payload of a successful call
    #[serde(default)]
    pub data: Value,
    /// Echoed request id
    #[serde(default)]
    pub id: Option<String>,
}

impl GatewayResponse {
    /// Payload of a successful call
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Gateway`] with the server message if `code` is
    /// not 200.
    pub fn into_data(self) -> Result<Value> {
        if self.code == CODE_OK {
            Ok(self.data)
        } else {
            Err(MowerError::Gateway {
                code: self.code,
                message: self.message.or(self.msg).unwrap_or_default(),
            })
        }
    }
}

/// Vendor signed-request gateway
#[async_trait]
pub trait SignedGateway: Send + Sync {
    /// Post an envelope to `path` on `host`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP request fails or the response is not a
    /// gateway envelope. Application-level codes are left to the caller.
    async fn request(
        &self,
        host: &str,
        path: &str,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse>;
}

/// reqwest-backed [`SignedGateway`]
#[derive(Debug, Clone)]
pub struct HttpSignedGateway {
    client: reqwest::Client,
    credentials: AppCredentials,
    config: CloudConfig,
}

impl HttpSignedGateway {
    /// Create a gateway client with the configured HTTP timeout
    ///
    /// # Errors
    ///
    /// Returns [`MowerError::Http`] if the HTTP client cannot be created.
    pub fn new(credentials: AppCredentials, config: CloudConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()?;
        Ok(Self::with_client(client, credentials, config))
    }

    /// Create a gateway client on an existing reqwest client
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        credentials: AppCredentials,
        config: CloudConfig,
    ) -> Self {
        Self {
            client,
            credentials,
            config,
        }
    }

    fn headers(&self, host: &str, body: &[u8]) -> HeaderMap {
        [
            ("accept", "application/json; charset=utf-8".to_string()),
            ("content-type", "application/octet-stream; charset=utf-8".to_string()),
            ("content-md5", signing::content_md5(body)),
            ("date", http_date()),
            ("host", host.to_string()),
            ("x-ca-key", self.credentials.app_key.clone()),
            ("x-ca-nonce", Uuid::new_v4().to_string()),
            ("x-ca-signaturemethod", SIGNATURE_METHOD.to_string()),
            ("x-ca-timestamp", Utc::now().timestamp_millis().to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }
}

#[async_trait]
impl SignedGateway for HttpSignedGateway {
    async fn request(
        &self,
        host: &str,
        path: &str,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse> {
        let body = serde_json::to_vec(request)?;
        let mut headers = self.headers(host, &body);
        signing::sign_headers(&self.credentials, "POST", &mut headers, path)?;

        debug!("POST {}{} ({})", host, path, request.id);

        let mut builder = self.client.post(self.config.url(host, path));
        for (key, value) in headers.iter().filter(|(key, _)| key.as_str() != "host") {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MowerError::Gateway {
                code: i64::from(status.as_u16()),
                message,
            });
        }

        Ok(response.json::<GatewayResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let request = GatewayRequest::new("1.0.4", "en-US", json!({ "pageNo": 1 }))
            .with_iot_token("token-1");
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["version"], "1.0");
        assert_eq!(value["request"]["apiVer"], "1.0.4");
        assert_eq!(value["request"]["iotToken"], "token-1");
        assert_eq!(value["params"]["pageNo"], 1);
        assert_eq!(value["id"].as_str().unwrap().len(), 36);

        let anonymous = GatewayRequest::new("1.0.2", "en-US", Value::Null);
        let value = serde_json::to_value(&anonymous).unwrap();
        assert!(value["request"].get("iotToken").is_none());
    }

    #[test]
    fn test_non_200_code_carries_message() {
        let response: GatewayResponse =
            serde_json::from_str(r#"{"code": 2401, "msg": "identityId is blank"}"#).unwrap();
        let error = response.into_data().unwrap_err();
        assert!(matches!(
            error,
            MowerError::Gateway { code: 2401, ref message } if message == "identityId is blank"
        ));
    }

    #[test]
    fn test_success_returns_data() {
        let response: GatewayResponse =
            serde_json::from_str(r#"{"code": 200, "data": {"vid": "v-1"}}"#).unwrap();
        assert_eq!(response.into_data().unwrap(), json!({ "vid": "v-1" }));
    }

    #[test]
    fn test_http_date_format() {
        let date = http_date();
        assert!(date.ends_with(" GMT"));
        assert_eq!(date.len(), 29);
    }
}
