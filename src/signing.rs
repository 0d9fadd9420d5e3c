//! Signed-URL generation and validation.
//!
//! Upload links sign `date-expire`; download links sign
//! `date-expire-bucket-object`.  Signatures are hex-encoded HMAC-SHA256
//! over the signing secret and are compared in constant time.  A link is
//! valid while `now - date <= expire` seconds.

use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::errors::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Timestamp format embedded in signed links.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Signs and verifies link query strings with a shared secret.
#[derive(Clone)]
pub struct LinkSigner {
    secret: String,
}

impl LinkSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Hex HMAC-SHA256 of `message` under the signing secret.
    fn digest(&self, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signature for an upload link issued at `date` with `expire` seconds.
    pub fn sign_upload(&self, date: &str, expire: i64) -> String {
        self.digest(&format!("{date}-{expire}"))
    }

    /// Signature for a download link, additionally bound to the target
    /// bucket and object name.
    pub fn sign_download(&self, date: &str, expire: i64, bucket: &str, object: &str) -> String {
        self.digest(&format!("{date}-{expire}-{bucket}-{object}"))
    }

    /// Verify an upload signature in constant time.
    pub fn check_upload(&self, date: &str, expire: i64, signature: &str) -> bool {
        let expected = self.sign_upload(date, expire);
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }

    /// Verify a download signature in constant time.
    pub fn check_download(
        &self,
        date: &str,
        expire: i64,
        bucket: &str,
        object: &str,
        signature: &str,
    ) -> bool {
        let expected = self.sign_download(date, expire, bucket, object);
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }
}

/// Current UTC timestamp in link format.
pub fn now_stamp() -> String {
    Utc::now().format(DATE_FORMAT).to_string()
}

/// Validate the shared `uid`/`date`/`expire` query parameters.
///
/// Returns the parsed uid, or a client-input error.  An expired link is
/// rejected regardless of an otherwise-correct signature, so callers check
/// expiry first.
pub fn check_link(uid: &str, date: &str, expire: &str) -> Result<(i64, i64), GatewayError> {
    let uid: i64 = uid.parse().map_err(|e| GatewayError::InvalidParam {
        message: format!("invalid uid parameter: {e}"),
    })?;

    let issued = NaiveDateTime::parse_from_str(date, DATE_FORMAT)
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        .map_err(|e| GatewayError::InvalidParam {
            message: format!("invalid date parameter: {e}"),
        })?;

    let expire: i64 = expire.parse().map_err(|e| GatewayError::InvalidParam {
        message: format!("invalid expire parameter: {e}"),
    })?;

    let age = (Utc::now() - issued).num_seconds();
    if age > expire {
        return Err(GatewayError::LinkExpired);
    }
    Ok((uid, expire))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn signer() -> LinkSigner {
        LinkSigner::new("test-secret")
    }

    #[test]
    fn test_upload_signature_roundtrip() {
        let s = signer();
        let date = "2026-08-23T10:00:00Z";
        let sig = s.sign_upload(date, 600);
        assert!(s.check_upload(date, 600, &sig));
    }

    #[test]
    fn test_upload_signature_mismatch() {
        let s = signer();
        let date = "2026-08-23T10:00:00Z";
        let sig = s.sign_upload(date, 600);
        // Tampered expire.
        assert!(!s.check_upload(date, 601, &sig));
        // Tampered signature.
        assert!(!s.check_upload(date, 600, "deadbeef"));
        // Different secret.
        assert!(!LinkSigner::new("other").check_upload(date, 600, &sig));
    }

    #[test]
    fn test_download_signature_binds_object() {
        let s = signer();
        let date = "2026-08-23T10:00:00Z";
        let sig = s.sign_download(date, 600, "image", "1.png");
        assert!(s.check_download(date, 600, "image", "1.png", &sig));
        assert!(!s.check_download(date, 600, "image", "2.png", &sig));
        assert!(!s.check_download(date, 600, "video", "1.png", &sig));
    }

    #[test]
    fn test_expired_link_rejected_despite_valid_signature() {
        let issued = (Utc::now() - Duration::seconds(120)).format(DATE_FORMAT).to_string();
        // Signature over the stale date is still internally consistent,
        // but the expiry window has passed.
        let result = check_link("42", &issued, "60");
        assert!(matches!(result, Err(GatewayError::LinkExpired)));
    }

    #[test]
    fn test_fresh_link_accepted() {
        let issued = now_stamp();
        let (uid, expire) = check_link("42", &issued, "600").unwrap();
        assert_eq!(uid, 42);
        assert_eq!(expire, 600);
    }

    #[test]
    fn test_malformed_parameters() {
        let issued = now_stamp();
        assert!(check_link("not-a-number", &issued, "60").is_err());
        assert!(check_link("42", "yesterday", "60").is_err());
        assert!(check_link("42", &issued, "soon").is_err());
    }
}
