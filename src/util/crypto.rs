use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SasError {
    /// The shared access key is not valid base64.
    #[error("invalid shared access key: {0}")]
    Key(#[from] base64::DecodeError),

    #[error("invalid shared access key length")]
    KeyLength,
}

/// Builds a shared-access-signature token for `resource`.
///
/// The signature is an HMAC-SHA256 over the URL-encoded resource URI and
/// the expiry timestamp, keyed with the base64-decoded shared access key.
/// Service-side credentials additionally carry a policy name (`skn`).
pub fn sas_token(
    resource: &str,
    key: &str,
    policy: Option<&str>,
    expiry: u64,
) -> Result<String, SasError> {
    let encoded_resource = utf8_percent_encode(resource, NON_ALPHANUMERIC).to_string();
    let to_sign = format!("{encoded_resource}\n{expiry}");

    let key = BASE64.decode(key)?;
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| SasError::KeyLength)?;
    mac.update(to_sign.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());
    let signature = utf8_percent_encode(&signature, NON_ALPHANUMERIC).to_string();

    let mut token =
        format!("SharedAccessSignature sr={encoded_resource}&sig={signature}&se={expiry}");
    if let Some(policy) = policy {
        token.push_str("&skn=");
        token.push_str(policy);
    }

    Ok(token)
}

/// Expiry timestamp `ttl` from now, in seconds since the Unix epoch.
pub fn expiry_after(ttl: Duration) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        + ttl.as_secs()
}
