//! Typed error surface for the core. Library code returns one of these
//! instead of panicking; only the CLI binaries translate a top-level
//! `BackupError` into an exit code.

use thiserror::Error;

/// Errors raised while computing chunk boundaries.
#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("chunker returned boundary {0} past end of scanned block of length {1}")]
    BoundaryPastEnd(usize, usize),
}

/// Errors raised while encoding or decoding the archive/catalog streams.
#[derive(Error, Debug)]
pub enum PxarError {
    #[error("I/O error walking source tree: {0}")]
    Io(#[from] std::io::Error),
    #[error("path is not representable as a C string: {0}")]
    InvalidName(String),
    #[error("goodbye table has more than u32::MAX entries")]
    GoodbyeTableTooLarge,
}

/// Errors raised while parsing a previous DIDX/FIDX index.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error reading index: {0}")]
    Io(#[from] std::io::Error),
    #[error("index header magic mismatch")]
    WrongMagic,
    #[error("index too short to contain a 4096-byte header")]
    Truncated,
    #[error("index record table length {0} is not a multiple of the record size")]
    Misaligned(usize),
    #[error("digest error: {0}")]
    Digest(#[from] openssl::error::ErrorStack),
}

/// Errors raised by the chunk/blob wire codec.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("blob/chunk body shorter than the wire header")]
    Truncated,
    #[error("CRC32 checksum mismatch")]
    CrcMismatch,
    #[error("unknown wire magic {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("zstd compression failed: {0}")]
    Compress(String),
    #[error("zstd decompression failed: {0}")]
    Decompress(String),
}

/// Errors raised by the protocol client (TLS, upgrade, HTTP/2 endpoints).
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("certificate fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
    #[error("server presented no certificate during handshake")]
    NoPeerCertificate,
    #[error("upgrade response had no blank-line terminator before the connection closed")]
    UpgradeTruncated,
    #[error("upgrade response status was {0:?}, expected HTTP/1.1 101")]
    UpgradeRejected(String),
    #[error("TLS handshake did not complete within {0:?}")]
    TlsTimeout(std::time::Duration),
    #[error("upgrade response scan did not complete within {0:?}")]
    UpgradeTimeout(std::time::Duration),
    #[error("HTTP/2 handshake failed: {0}")]
    Http2Handshake(String),
    #[error("HTTP/2 request failed: {0}")]
    Http2Request(String),
    #[error("server returned unexpected HTTP status {0}")]
    UnexpectedStatus(http::StatusCode),
    #[error("failed to parse JSON response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error kinds from §7 of the design. The CLI layer maps these to
/// exit codes; nothing below the CLI boundary calls `std::process::exit`.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("lock contention: another instance is already running")]
    LockContention,
    #[error("authentication error: {0}")]
    Auth(String),
    #[error(transparent)]
    Protocol(ProtocolError),
    #[error("source I/O error: {0}")]
    SourceIo(#[from] std::io::Error),
    #[error(transparent)]
    Pxar(#[from] PxarError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Chunker(#[from] ChunkerError),
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("snapshot provider failed: {0}")]
    Snapshot(String),
}

impl From<ProtocolError> for BackupError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::FingerprintMismatch { .. } => BackupError::Auth(err.to_string()),
            ProtocolError::UpgradeRejected(_) => BackupError::Auth(err.to_string()),
            ProtocolError::UpgradeTimeout(_) => BackupError::Auth(err.to_string()),
            other => BackupError::Protocol(other),
        }
    }
}

/// Errors raised acquiring the single-instance lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("another instance is already running")]
    AlreadyLocked,
    #[error("I/O error acquiring lock: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a snapshot collaborator.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("failed to snapshot {path}: {reason}")]
    Failed { path: String, reason: String },
}

/// Errors raised by a result-notification collaborator.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("failed to deliver backup result notification: {0}")]
    Delivery(String),
}

/// Errors raised validating a [`crate::config::Config`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required option(s): {0}")]
    MissingFields(String),
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile { path: String, source: serde_json::Error },
}

impl From<SnapshotError> for BackupError {
    fn from(err: SnapshotError) -> Self {
        BackupError::Snapshot(err.to_string())
    }
}

impl From<LockError> for BackupError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyLocked => BackupError::LockContention,
            other => BackupError::Invariant(other.to_string()),
        }
    }
}
