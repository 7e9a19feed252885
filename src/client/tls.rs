//! TLS connection setup (§4.3 "Transport"): either strict hostname
//! validation (the default) or a pinned SHA-256 certificate fingerprint.
//! Mirrors `tools::http::HttpsConnector::secure_stream`'s use of
//! `openssl`+`tokio_openssl`, minus the proxy/hyper plumbing this client
//! doesn't need since it owns its socket directly for the protocol
//! upgrade.

use openssl::hash::MessageDigest;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::error::ProtocolError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How the peer certificate is validated.
pub enum CertValidation {
    /// Standard hostname + CA chain validation.
    Strict,
    /// Accept any chain as long as the leaf certificate's SHA-256
    /// fingerprint matches (hex digits, colons ignored on either side).
    PinnedFingerprint(String),
}

pub async fn connect(
    host: &str,
    port: u16,
    validation: &CertValidation,
) -> Result<SslStream<TcpStream>, ProtocolError> {
    let tcp = TcpStream::connect((host, port)).await?;

    let mut builder =
        SslConnector::builder(SslMethod::tls()).map_err(|e| ProtocolError::Tls(e.to_string()))?;
    if matches!(validation, CertValidation::PinnedFingerprint(_)) {
        // Verification happens manually below against the fingerprint;
        // the handshake itself must not reject an otherwise-untrusted chain.
        builder.set_verify(SslVerifyMode::NONE);
    }
    let connector = builder.build();

    let config = connector.configure().map_err(|e| ProtocolError::Tls(e.to_string()))?;
    let ssl = config.into_ssl(host).map_err(|e| ProtocolError::Tls(e.to_string()))?;
    let mut stream = SslStream::new(ssl, tcp).map_err(|e| ProtocolError::Tls(e.to_string()))?;
    tokio::time::timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut stream).connect())
        .await
        .map_err(|_| ProtocolError::TlsTimeout(HANDSHAKE_TIMEOUT))?
        .map_err(|e| ProtocolError::Tls(e.to_string()))?;

    if let CertValidation::PinnedFingerprint(expected) = validation {
        verify_fingerprint(&stream, expected)?;
    }

    Ok(stream)
}

fn verify_fingerprint(stream: &SslStream<TcpStream>, expected: &str) -> Result<(), ProtocolError> {
    let cert = stream.ssl().peer_certificate().ok_or(ProtocolError::NoPeerCertificate)?;
    let der = cert.to_der().map_err(|e| ProtocolError::Tls(e.to_string()))?;
    let digest =
        openssl::hash::hash(MessageDigest::sha256(), &der).map_err(|e| ProtocolError::Tls(e.to_string()))?;
    let actual = to_hex(&digest);

    if normalize(&actual) != normalize(expected) {
        return Err(ProtocolError::FingerprintMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{:02x}", byte).unwrap();
    }
    out
}

fn normalize(fingerprint: &str) -> String {
    fingerprint.chars().filter(|c| *c != ':').flat_map(|c| c.to_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_ignores_colons_and_case() {
        assert_eq!(
            normalize("AB:CD:EF"),
            normalize("abcdef"),
        );
    }

    #[test]
    fn to_hex_matches_expected_format() {
        assert_eq!(to_hex(&[0xDE, 0xAD, 0xBE, 0xEF]), "deadbeef");
    }
}
