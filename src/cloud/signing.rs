//! Request signatures for the cloud handshake.
//!
//! Two schemes are in use. Identity auth signs the ordered concatenation of
//! its parameters with HMAC-SHA1. Gateway requests use the canonical-request
//! scheme: a fixed set of standard headers, the remaining headers sorted by
//! key, and the resource, signed with HMAC-SHA256 and base64-encoded.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use std::collections::BTreeMap;

use crate::{
    error::{MowerError, Result},
    types::AppCredentials,
};

/// Header carrying the signature
pub const SIGNATURE_HEADER: &str = "x-ca-signature";

/// Header listing the keys covered by the signature
pub const SIGNED_HEADERS_HEADER: &str = "x-ca-signature-headers";

/// Signature method advertised in `x-ca-signaturemethod`
pub const SIGNATURE_METHOD: &str = "HmacSHA256";

/// Headers never included in the canonical header block
const RESERVED_HEADERS: [&str; 9] = [
    SIGNATURE_HEADER,
    SIGNED_HEADERS_HEADER,
    "accept",
    "content-md5",
    "content-type",
    "date",
    "host",
    "token",
    "user-agent",
];

/// Header map keyed by lowercase name, iterated in sorted order
pub type HeaderMap = BTreeMap<String, String>;

/// Identity-auth signature, hex HMAC-SHA1 over
/// `appKey{key}clientId{id}deviceSn{sn}timestamp{ts}`
///
/// # Errors
///
/// Returns [`MowerError::InvalidParameters`] if the secret cannot key the MAC.
pub fn identity_sign(
    credentials: &AppCredentials,
    client_id: &str,
    device_sn: &str,
    timestamp: &str,
) -> Result<String> {
    let message = format!(
        "appKey{}clientId{client_id}deviceSn{device_sn}timestamp{timestamp}",
        credentials.app_key
    );

    let mut mac = Hmac::<Sha1>::new_from_slice(credentials.app_secret.as_bytes())
        .map_err(|e| MowerError::InvalidParameters(format!("Invalid app secret: {e}")))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Base64 MD5 of a request body for `content-md5`
#[must_use]
pub fn content_md5(body: &[u8]) -> String {
    STANDARD.encode(md5::compute(body).0)
}

/// Keys and `key:value` lines of the headers covered by the signature
#[must_use]
pub fn canonical_headers(headers: &HeaderMap) -> (Vec<&str>, String) {
    let signed: Vec<(&str, &str)> = headers
        .iter()
        .filter(|(key, _)| !RESERVED_HEADERS.contains(&key.as_str()))
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();

    let lines = signed
        .iter()
        .map(|(key, value)| format!("{key}:{value}"))
        .collect::<Vec<_>>()
        .join("\n");

    (signed.into_iter().map(|(key, _)| key).collect(), lines)
}

/// String to sign for a request
///
/// `resource` is the path, followed by `?key=value` when the request carries
/// its body as a query parameter. Missing standard headers sign as empty.
#[must_use]
pub fn string_to_sign(method: &str, headers: &HeaderMap, resource: &str) -> String {
    let header = |key: &str| headers.get(key).map_or("", String::as_str);
    let (_, lines) = canonical_headers(headers);

    format!(
        "{method}\n{}\n{}\n{}\n{}\n{lines}\n{resource}",
        header("accept"),
        header("content-md5"),
        header("content-type"),
        header("date"),
    )
}

/// Base64 HMAC-SHA256 of `string_to_sign`
///
/// # Errors
///
/// Returns [`MowerError::InvalidParameters`] if the secret cannot key the MAC.
pub fn sign(secret: &str, string_to_sign: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| MowerError::InvalidParameters(format!("Invalid app secret: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Add the signature and signed-key list to `headers`
///
/// # Errors
///
/// Returns [`MowerError::InvalidParameters`] if the secret cannot key the MAC.
pub fn sign_headers(
    credentials: &AppCredentials,
    method: &str,
    headers: &mut HeaderMap,
    resource: &str,
) -> Result<()> {
    headers.remove(SIGNATURE_HEADER);
    headers.remove(SIGNED_HEADERS_HEADER);

    let signed_keys = canonical_headers(headers).0.join(",");
    let signature = sign(
        &credentials.app_secret,
        &string_to_sign(method, headers, resource),
    )?;

    headers.insert(SIGNED_HEADERS_HEADER.to_string(), signed_keys);
    headers.insert(SIGNATURE_HEADER.to_string(), signature);
    Ok(())
}
