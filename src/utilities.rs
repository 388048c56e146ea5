use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::{HeaderMap, HeaderValue};

use crate::errors::CommandError;

const HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

// generate the right header for token-authenticated provider APIs
pub fn get_header_with_bearer(token: &str) -> HeaderMap<HeaderValue> {
    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", "application/json".parse().unwrap());
    headers.insert("Authorization", format!("Bearer {token}").parse().unwrap());
    headers
}

pub fn calculate_hash<T: Hash>(t: &T) -> u64 {
    let mut s = DefaultHasher::new();
    t.hash(&mut s);
    s.finish()
}

/// Builds the shared HTTP client. When `ca_bundle_pem` is set, the contained
/// roots are trusted in addition to the system ones; drivers talking to
/// private API endpoints (OpenStack, vSphere, Nutanix) pass their bundle here.
pub fn http_client_with_ca(ca_bundle_pem: Option<&str>) -> Result<reqwest::Client, CommandError> {
    let mut builder = reqwest::Client::builder().timeout(HTTP_CLIENT_TIMEOUT);

    if let Some(pem) = ca_bundle_pem {
        let certificates = reqwest::Certificate::from_pem_bundle(pem.as_bytes())
            .map_err(|e| CommandError::new("Cannot parse CA bundle".to_string(), Some(e.to_string())))?;
        for certificate in certificates {
            builder = builder.add_root_certificate(certificate);
        }
    }

    builder
        .build()
        .map_err(|e| CommandError::new("Cannot build HTTP client".to_string(), Some(e.to_string())))
}

pub fn gzip(payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish().map_err(CommandError::from)
}

/// Compresses then base64-encodes a user-data payload, for clouds imposing a
/// size cap on what they accept at instance creation.
pub fn gzip_base64(payload: &str) -> Result<String, CommandError> {
    Ok(general_purpose::STANDARD.encode(gzip(payload.as_bytes())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn test_get_header_with_bearer() {
        // setup:
        let headers = get_header_with_bearer("my-token");

        // verify:
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer my-token");
        assert_eq!(headers.get("Content-Type").unwrap(), "application/json");
    }

    #[test]
    fn test_gzip_roundtrip() {
        // setup:
        let payload = "#cloud-config\nhostname: node-1\n".repeat(100);

        // execute:
        let compressed = gzip(payload.as_bytes()).unwrap();

        // verify:
        assert!(compressed.len() < payload.len());
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn test_calculate_hash_is_stable() {
        // setup:
        let value = ("eu-west-1", "ubuntu", "x86_64");

        // execute & verify:
        assert_eq!(calculate_hash(&value), calculate_hash(&value));
        assert_ne!(calculate_hash(&value), calculate_hash(&("eu-west-1", "ubuntu", "arm64")));
    }
}
