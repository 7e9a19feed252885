//! The protocol client (C4): TLS, the literal HTTP/1.1 upgrade, then an
//! HTTP/2 connection multiplexing the endpoint calls in §4.3.

pub mod http2;
pub mod tls;
pub mod upgrade;

use bytes::Bytes;

use crate::error::ProtocolError;
use http2::ProtocolClient;
use tls::CertValidation;
use upgrade::Role;

pub struct SessionParams<'a> {
    pub host: &'a str,
    pub port: u16,
    pub validation: CertValidation,
    pub auth_header: String,
    pub backup_time: i64,
    pub backup_type: &'a str,
    pub store: &'a str,
    pub namespace: Option<&'a str>,
    pub backup_id: &'a str,
    pub role: Role,
}

/// Run the full handshake described in §4.3 and return a client ready to
/// issue endpoint calls. The base URL used by `ProtocolClient` is empty —
/// h2 requests only need a path-and-query once the connection itself is
/// already pointed at the right host.
pub async fn connect(params: SessionParams<'_>) -> Result<ProtocolClient, ProtocolError> {
    let mut stream = tls::connect(params.host, params.port, &params.validation).await?;

    let mut query = format!(
        "backup-time={}&backup-type={}&store={}&backup-id={}&debug=1",
        params.backup_time, params.backup_type, params.store, params.backup_id
    );
    if let Some(ns) = params.namespace {
        query.push_str("&ns=");
        query.push_str(ns);
    }

    upgrade::perform(&mut stream, params.host, &query, &params.auth_header, params.role).await?;

    let (send_request, connection) = h2::client::handshake(stream)
        .await
        .map_err(|e| ProtocolError::Http2Handshake(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            log::error!("HTTP/2 connection driver failed: {}", err);
        }
    });

    let send_request: h2::client::SendRequest<Bytes> = send_request;
    Ok(ProtocolClient::new(send_request, String::new(), params.auth_header.clone()))
}
