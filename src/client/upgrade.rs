//! The literal HTTP/1.1 Upgrade handshake (§4.3 "Protocol upgrade"). Same
//! byte-scanning idiom as `tools::http::HttpsConnector::parse_connect_response`
//! (accumulate into a growing buffer, search only the newly-possible-match
//! window, cap total bytes read), adapted to this handshake's different
//! trigger text and terminator (`\r\n\r\n` *or* `\n\n`, and a status line
//! of `HTTP/1.1 101` rather than `200`).

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

const RESPONSE_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

pub enum Role {
    Writer,
    Reader,
}

impl Role {
    fn upgrade_header(&self) -> &'static str {
        match self {
            Role::Writer => "proxmox-backup-protocol-v1",
            Role::Reader => "proxmox-backup-reader-protocol-v1",
        }
    }
}

const MAX_RESPONSE_BYTES: usize = 32 * 1024;

/// Build and send the upgrade request, then read and validate the
/// response. On success the caller hands `stream` straight to an HTTP/2
/// client with no further framing of its own.
pub async fn perform<S>(
    stream: &mut S,
    host: &str,
    query: &str,
    auth_header: &str,
    role: Role,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET /api2/json/backup?{query} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Authorization: {auth_header}\r\n\
         Upgrade: {upgrade}\r\n\
         Connection: Upgrade\r\n\
         \r\n",
        query = query,
        host = host,
        auth_header = auth_header,
        upgrade = role.upgrade_header(),
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    read_upgrade_response(stream).await
}

async fn read_upgrade_response<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), ProtocolError> {
    tokio::time::timeout(RESPONSE_SCAN_TIMEOUT, scan_response(stream))
        .await
        .map_err(|_| ProtocolError::UpgradeTimeout(RESPONSE_SCAN_TIMEOUT))?
}

async fn scan_response<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), ProtocolError> {
    let mut data: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 256];

    loop {
        let n = stream.read(&mut buffer[..]).await?;
        if n == 0 {
            return Err(ProtocolError::UpgradeTruncated);
        }
        data.extend_from_slice(&buffer[..n]);

        if let Some(end) = find_terminator(&data) {
            let head = String::from_utf8_lossy(&data[..end]);
            let status_line = head.lines().next().unwrap_or("");
            if !status_line.starts_with("HTTP/1.1 101") {
                return Err(ProtocolError::UpgradeRejected(status_line.to_string()));
            }
            return Ok(());
        }

        if data.len() > MAX_RESPONSE_BYTES {
            return Err(ProtocolError::UpgradeTruncated);
        }
    }
}

/// Return the index just past whichever terminator (`\r\n\r\n` or
/// `\n\n`) appears first in `data`, if any.
fn find_terminator(data: &[u8]) -> Option<usize> {
    const CRLF: &[u8] = b"\r\n\r\n";
    const LF: &[u8] = b"\n\n";

    let crlf_pos = data.windows(CRLF.len()).position(|w| w == CRLF).map(|p| p + CRLF.len());
    let lf_pos = data.windows(LF.len()).position(|w| w == LF).map(|p| p + LF.len());

    match (crlf_pos, lf_pos) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
