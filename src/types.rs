use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the wireless link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Connect in progress (connect mutex held)
    Connecting,
    /// Endpoints bound and notifications subscribed
    Bound,
    /// Idle timer expired, teardown in progress
    IdleDisconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Bound => write!(f, "Bound"),
            Self::IdleDisconnecting => write!(f, "Idle-Disconnecting"),
        }
    }
}

/// Device information gathered while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised device name
    pub name: String,
    /// Device address
    pub address: String,
    /// Signal strength (RSSI)
    pub rssi: i16,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            rssi: 0,
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Maximum transport connect attempts before giving up
    pub connect_attempts: u32,
    /// Per-attempt connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Scan timeout in milliseconds
    pub scan_timeout_ms: u64,
    /// Negotiated package length limit for outgoing frames
    pub package_length: usize,
    /// Write a BLE sync message after binding and before teardown
    pub sync_on_connect: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            connect_timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
            package_length: crate::protocol::MIN_PACKAGE_LENGTH,
            sync_on_connect: true,
        }
    }
}

/// Timer configuration for commands and the connection lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Local command timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Idle time after the last command before the link is torn down
    pub idle_disconnect_ms: u64,
    /// Backoff before a forced teardown after a transport error
    pub error_backoff_ms: u64,
    /// Delay between connect attempts
    pub retry_delay_ms: u64,
    /// Cloud command timeout in milliseconds
    pub cloud_response_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            idle_disconnect_ms: 10_000,
            error_backoff_ms: 250,
            retry_delay_ms: 250,
            cloud_response_timeout_ms: 10_000,
        }
    }
}

/// Application credentials used to sign cloud requests
#[derive(Clone, Serialize, Deserialize)]
pub struct AppCredentials {
    /// Application key
    pub app_key: String,
    /// Application secret
    pub app_secret: String,
}

impl AppCredentials {
    /// Create new credentials
    #[must_use]
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
        }
    }
}

impl fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredentials")
            .field("app_key", &self.app_key)
            .field("app_secret", &"<redacted>")
            .finish()
    }
}

/// Cloud endpoint and client identification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Domain of the signed API gateway used before the region is known
    pub gateway_domain: String,
    /// Domain of the open-account service issuing the volatile session id
    pub open_account_domain: String,
    /// URL scheme for every cloud request
    pub scheme: String,
    /// Language sent in gateway envelopes
    pub language: String,
    /// HTTP request timeout in milliseconds
    pub http_timeout_ms: u64,
    /// Refresh the session token when it expires within this many seconds
    pub refresh_margin_secs: i64,
    /// OAuth platform identifier sent during login
    pub oauth_platform: String,
    /// Application package id reported during login
    pub app_id: String,
    /// Application version reported during connect
    pub app_version: String,
    /// SDK version reported during connect
    pub sdk_version: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            gateway_domain: "api.link.aliyun.com".to_string(),
            open_account_domain: "sdk.openaccount.aliyun.com".to_string(),
            scheme: "https".to_string(),
            language: "en-US".to_string(),
            http_timeout_ms: 30_000,
            refresh_margin_secs: 300,
            oauth_platform: "23".to_string(),
            app_id: "com.agilexrobotics".to_string(),
            app_version: "1.11.188".to_string(),
            sdk_version: "3.4.2".to_string(),
        }
    }
}

impl CloudConfig {
    /// Build a URL on the given host using the configured scheme
    #[must_use]
    pub fn url(&self, host: &str, path: &str) -> String {
        format!("{}://{host}{path}", self.scheme)
    }
}
