//! HMAC presigned URLs
//!
//! URL format:
//! `<base>/storage/presigned/<bucket>/<escaped-key>?expires=<unix>&method=<M>&signature=<hex>`
//!
//! The signed path is the unescaped `/storage/presigned/<bucket>/<key>`.

use chrono::Utc;
use cirrus_common::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Path prefix under which presigned objects are served
pub const PRESIGN_PREFIX: &str = "/storage/presigned";

/// Path covered by the signature for `(bucket, key)`
#[must_use]
pub fn presigned_path(bucket: &str, key: &str) -> String {
    format!("{PRESIGN_PREFIX}/{bucket}/{key}")
}

/// Escape every path segment, keeping `/` separators
fn escape_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Signs and verifies presigned URLs with the storage secret
#[derive(Clone)]
pub struct Presigner {
    secret: Option<String>,
}

impl std::fmt::Debug for Presigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presigner")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Presigner {
    /// Create a presigner keyed with `secret`
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }

    /// Create a presigner from optional configuration.
    ///
    /// Without a secret every sign and verify call fails with `Internal`.
    #[must_use]
    pub fn from_secret(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// Produce a presigned URL for `method` on `(bucket, key)` valid until
    /// `expires_at` (unix seconds).
    pub fn sign(
        &self,
        base_url: &str,
        method: &str,
        bucket: &str,
        key: &str,
        expires_at: i64,
    ) -> Result<String> {
        if bucket.is_empty() || key.is_empty() {
            return Err(Error::invalid_input("bucket and key must not be empty"));
        }
        let path = presigned_path(bucket, key);
        let expires = expires_at.to_string();
        let signature = hex::encode(self.mac(method, &path, &expires)?.finalize().into_bytes());

        Ok(format!(
            "{base}{path}?expires={expires}&method={method}&signature={signature}",
            base = base_url.trim_end_matches('/'),
            path = escape_path(&path),
            method = urlencoding::encode(method),
        ))
    }

    /// Verify a presigned request against the current time
    pub fn verify(&self, method: &str, path: &str, expires: &str, signature: &str) -> Result<()> {
        self.verify_at(method, path, expires, signature, Utc::now().timestamp())
    }

    /// Verify a presigned request as of `now` (unix seconds).
    ///
    /// Checks run in order: expiration syntax, expiry, signature.
    pub fn verify_at(
        &self,
        method: &str,
        path: &str,
        expires: &str,
        signature: &str,
        now: i64,
    ) -> Result<()> {
        let expires_at: i64 = expires
            .trim()
            .parse()
            .map_err(|_| Error::invalid_input("bad expiration"))?;
        if now > expires_at {
            debug!(path, expires_at, now, "presigned URL expired");
            return Err(Error::forbidden("URL expired"));
        }

        let mac = self.mac(method, path, expires)?;
        let provided = hex::decode(signature).map_err(|_| Error::forbidden("invalid signature"))?;
        // verify_slice compares in constant time
        mac.verify_slice(&provided).map_err(|_| {
            debug!(path, method, "presigned URL signature mismatch");
            Error::forbidden("invalid signature")
        })
    }

    /// Verify a parsed URL against the current time
    pub fn verify_url(&self, url: &PresignedUrl) -> Result<()> {
        self.verify(&url.method, &url.path, &url.expires, &url.signature)
    }

    fn mac(&self, method: &str, path: &str, expires: &str) -> Result<HmacSha256> {
        let secret = self
            .secret
            .as_deref()
            .ok_or_else(|| Error::internal("presign secret is not configured"))?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| Error::internal(format!("invalid presign key: {e}")))?;
        mac.update(method.as_bytes());
        mac.update(b"\n");
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.as_bytes());
        Ok(mac)
    }
}

/// The verifiable parts of a presigned URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresignedUrl {
    pub method: String,
    /// Unescaped request path
    pub path: String,
    /// Raw `expires` query value
    pub expires: String,
    pub signature: String,
}

impl PresignedUrl {
    /// Extract method, path, expiration and signature from a URL (absolute
    /// or path-only) produced by [`Presigner::sign`].
    pub fn parse(url: &str) -> Result<Self> {
        let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
        let path_and_query = if url.contains("://") {
            without_scheme
                .find('/')
                .map(|i| &without_scheme[i..])
                .ok_or_else(|| Error::invalid_input("presigned URL has no path"))?
        } else {
            url
        };

        let (raw_path, query) = path_and_query
            .split_once('?')
            .ok_or_else(|| Error::invalid_input("presigned URL has no query string"))?;
        let path = decode(raw_path)?;
        if !path.starts_with(&format!("{PRESIGN_PREFIX}/")) {
            return Err(Error::invalid_input(format!(
                "path {path} is not under {PRESIGN_PREFIX}"
            )));
        }

        let mut method = None;
        let mut expires = None;
        let mut signature = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = decode(value)?;
            match name {
                "method" => method = Some(value),
                "expires" => expires = Some(value),
                "signature" => signature = Some(value),
                _ => {}
            }
        }

        let missing = |name: &str| Error::invalid_input(format!("presigned URL is missing {name}"));
        Ok(Self {
            method: method.ok_or_else(|| missing("method"))?,
            path,
            expires: expires.ok_or_else(|| missing("expires"))?,
            signature: signature.ok_or_else(|| missing("signature"))?,
        })
    }

    /// Split the path back into `(bucket, key)`
    pub fn object(&self) -> Result<(&str, &str)> {
        self.path
            .strip_prefix(PRESIGN_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.split_once('/'))
            .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
            .ok_or_else(|| Error::invalid_input(format!("malformed presigned path {}", self.path)))
    }
}

fn decode(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| Error::invalid_input(format!("bad percent-encoding in '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn signed() -> (Presigner, PresignedUrl) {
        let presigner = Presigner::new("s");
        let url = presigner
            .sign("http://h", "GET", "bk", "k/file.bin", NOW + 3600)
            .unwrap();
        (presigner, PresignedUrl::parse(&url).unwrap())
    }

    fn verify(p: &Presigner, u: &PresignedUrl, now: i64) -> Result<()> {
        p.verify_at(&u.method, &u.path, &u.expires, &u.signature, now)
    }

    #[test]
    fn test_sign_url_shape() {
        let presigner = Presigner::new("s");
        let url = presigner
            .sign("http://h/", "GET", "bk", "k/file.bin", NOW + 3600)
            .unwrap();
        assert!(url.starts_with("http://h/storage/presigned/bk/k/file.bin?"));
        assert!(url.contains("expires=1700003600"));
        assert!(url.contains("method=GET"));

        let sig = url.split("signature=").nth(1).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verify_roundtrip() {
        let (presigner, url) = signed();
        assert_eq!(url.method, "GET");
        assert_eq!(url.path, "/storage/presigned/bk/k/file.bin");
        assert_eq!(url.object().unwrap(), ("bk", "k/file.bin"));
        verify(&presigner, &url, NOW).unwrap();
        // valid up to and including the expiration second
        verify(&presigner, &url, NOW + 3600).unwrap();
    }

    #[test]
    fn test_expired() {
        let (presigner, url) = signed();
        let err = verify(&presigner, &url, NOW + 3601).unwrap_err();
        assert!(matches!(err, Error::Forbidden(ref m) if m == "URL expired"));
    }

    #[test]
    fn test_tampering_fails() {
        let (presigner, url) = signed();
        let is_invalid_signature =
            |r: Result<()>| matches!(r, Err(Error::Forbidden(ref m)) if m == "invalid signature");

        let mut u = url.clone();
        u.method = "PUT".into();
        assert!(is_invalid_signature(verify(&presigner, &u, NOW)));

        let mut u = url.clone();
        u.path = "/storage/presigned/bk/k/file.bim".into();
        assert!(is_invalid_signature(verify(&presigner, &u, NOW)));

        let mut u = url.clone();
        u.expires = (NOW + 3601).to_string();
        assert!(is_invalid_signature(verify(&presigner, &u, NOW)));

        let mut u = url.clone();
        let last = if u.signature.ends_with('0') { "1" } else { "0" };
        u.signature.replace_range(63.., last);
        assert!(is_invalid_signature(verify(&presigner, &u, NOW)));

        // truncated and non-hex signatures are rejected the same way
        let mut u = url.clone();
        u.signature.truncate(10);
        assert!(is_invalid_signature(verify(&presigner, &u, NOW)));
        let mut u = url;
        u.signature = "zz".into();
        assert!(is_invalid_signature(verify(&presigner, &u, NOW)));
    }

    #[test]
    fn test_other_secret_rejected() {
        let (_, url) = signed();
        let other = Presigner::new("t");
        assert!(verify(&other, &url, NOW).is_err());
    }

    #[test]
    fn test_bad_expiration() {
        let presigner = Presigner::new("s");
        let err = presigner
            .verify_at("GET", "/storage/presigned/bk/k", "soon", "00", NOW)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m == "bad expiration"));
    }

    #[test]
    fn test_missing_secret_is_internal() {
        let presigner = Presigner::from_secret(None);
        let err = presigner
            .verify_at("GET", "/storage/presigned/bk/k", "1700003600", "00", NOW)
            .unwrap_err();
        assert!(err.is_internal());
        assert!(presigner.sign("http://h", "GET", "bk", "k", NOW).is_err());
        let empty = Presigner::from_secret(Some(String::new()));
        assert!(empty.verify("GET", "/p", "99999999999", "00").unwrap_err().is_internal());
    }

    #[test]
    fn test_escaped_keys_roundtrip() {
        let presigner = Presigner::new("s");
        let url = presigner
            .sign("https://h:9000", "GET", "bk", "dir/a file?#.txt", NOW + 60)
            .unwrap();
        assert!(url.contains("/dir/a%20file%3F%23.txt?"));

        let parsed = PresignedUrl::parse(&url).unwrap();
        assert_eq!(parsed.path, "/storage/presigned/bk/dir/a file?#.txt");
        verify(&presigner, &parsed, NOW).unwrap();
    }

    #[test]
    fn test_parse_rejects_foreign_urls() {
        assert!(PresignedUrl::parse("http://h/other/bk/k?expires=1&method=GET&signature=00").is_err());
        assert!(PresignedUrl::parse("http://h/storage/presigned/bk/k").is_err());
        assert!(PresignedUrl::parse("/storage/presigned/bk/k?expires=1&method=GET").is_err());
        assert!(PresignedUrl::parse("/storage/presigned/bk/k?expires=1&method=GET&signature=00").is_ok());
    }
}
