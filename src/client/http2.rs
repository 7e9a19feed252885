//! HTTP/2 endpoint calls over the already-upgraded connection (§4.3
//! "Endpoints used"). One `h2::client::SendRequest` is shared by every
//! caller; streams may be issued concurrently (§5 "Scheduling model"),
//! so this wraps it in a `Clone`-able handle rather than a `&mut`-only
//! client the way the teacher's `hyper`-based `SimpleHttp` does, since h2
//! already hands out cheap clones of its `SendRequest`.

use bytes::Bytes;
use h2::client::SendRequest;
use http::{Request, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::error::ProtocolError;

/// Batches of at most this many entries per assignment PUT (§4.3
/// "Assignment batching").
pub const ASSIGNMENT_BATCH_SIZE: usize = 128;

#[derive(Clone)]
pub struct ProtocolClient {
    send_request: SendRequest<Bytes>,
    base_url: String,
    auth_header: String,
}

impl ProtocolClient {
    pub fn new(send_request: SendRequest<Bytes>, base_url: String, auth_header: String) -> Self {
        Self { send_request, base_url, auth_header }
    }

    async fn request(
        &self,
        method: http::Method,
        path_and_query: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, ProtocolError> {
        let uri = format!("{}{}", self.base_url, path_and_query);
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(http::header::AUTHORIZATION, &self.auth_header);
        if let Some(content_type) = content_type {
            builder = builder.header(http::header::CONTENT_TYPE, content_type);
        }
        let request = builder
            .body(())
            .map_err(|e| ProtocolError::Http2Request(e.to_string()))?;

        let mut send_request = self.send_request.clone();
        let no_body = body.is_empty();
        let (response_fut, mut send_stream) = send_request
            .send_request(request, no_body)
            .map_err(|e| ProtocolError::Http2Request(e.to_string()))?;

        if !no_body {
            send_stream
                .send_data(Bytes::from(body), true)
                .map_err(|e| ProtocolError::Http2Request(e.to_string()))?;
        }

        let response = response_fut.await.map_err(|e| ProtocolError::Http2Request(e.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(ProtocolError::UnexpectedStatus(response.status()));
        }

        let mut body = response.into_body();
        let mut out = Vec::new();
        use futures::stream::StreamExt;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ProtocolError::Http2Request(e.to_string()))?;
            let _ = body.flow_control().release_capacity(chunk.len());
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    async fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Value, ProtocolError> {
        let bytes = serde_json::to_vec(body)?;
        let raw = self.request(http::Method::POST, path, Some("application/json"), bytes).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ProtocolError> {
        let bytes = serde_json::to_vec(body)?;
        self.request(http::Method::PUT, path, Some("application/json"), bytes).await?;
        Ok(())
    }

    pub async fn create_dynamic_index(&self, archive_name: &str) -> Result<u64, ProtocolError> {
        let body = serde_json::json!({ "archive-name": archive_name });
        let response = self.post_json("/dynamic_index", &body).await?;
        writer_id(&response)
    }

    pub async fn create_fixed_index(&self, archive_name: &str, size: u64) -> Result<u64, ProtocolError> {
        let body = serde_json::json!({ "archive-name": archive_name, "size": size });
        let response = self.post_json("/fixed_index", &body).await?;
        writer_id(&response)
    }

    pub async fn upload_dynamic_chunk(
        &self,
        wid: u64,
        digest: &str,
        encoded_size: u64,
        size: u64,
        body: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let path = format!(
            "/dynamic_chunk?digest={digest}&encoded-size={encoded_size}&size={size}&wid={wid}"
        );
        self.request(http::Method::POST, &path, Some("application/octet-stream"), body).await?;
        Ok(())
    }

    pub async fn upload_fixed_chunk(
        &self,
        wid: u64,
        digest: &str,
        encoded_size: u64,
        size: u64,
        offset: u64,
        body: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let path = format!(
            "/fixed_chunk?digest={digest}&encoded-size={encoded_size}&size={size}&wid={wid}&offset={offset}"
        );
        self.request(http::Method::POST, &path, Some("application/octet-stream"), body).await?;
        Ok(())
    }

    /// Assign one batch (≤ [`ASSIGNMENT_BATCH_SIZE`] entries) of chunks to
    /// offsets. The caller is responsible for batching and for offset
    /// ordering (§4.3, §5 ordering guarantee (i)).
    pub async fn assign_dynamic(
        &self,
        wid: u64,
        digest_list: &[String],
        offset_list: &[u64],
    ) -> Result<(), ProtocolError> {
        let body = serde_json::json!({ "digest-list": digest_list, "offset-list": offset_list, "wid": wid });
        self.put_json("/dynamic_index", &body).await
    }

    pub async fn assign_fixed(
        &self,
        wid: u64,
        digest_list: &[String],
        offset_list: &[u64],
    ) -> Result<(), ProtocolError> {
        let body = serde_json::json!({ "digest-list": digest_list, "offset-list": offset_list, "wid": wid });
        self.put_json("/fixed_index", &body).await
    }

    pub async fn close_dynamic_index(
        &self,
        wid: u64,
        csum: &str,
        size: u64,
        chunk_count: u64,
    ) -> Result<(), ProtocolError> {
        let body = serde_json::json!({ "wid": wid, "csum": csum, "size": size, "chunk-count": chunk_count });
        self.post_json("/dynamic_close", &body).await?;
        Ok(())
    }

    pub async fn close_fixed_index(
        &self,
        wid: u64,
        csum: &str,
        size: u64,
        chunk_count: u64,
    ) -> Result<(), ProtocolError> {
        let body = serde_json::json!({ "wid": wid, "csum": csum, "size": size, "chunk-count": chunk_count });
        self.post_json("/fixed_close", &body).await?;
        Ok(())
    }

    pub async fn upload_blob(&self, file_name: &str, body: Vec<u8>) -> Result<(), ProtocolError> {
        let path = format!("/blob?encoded-size={}&file-name={}", body.len(), file_name);
        self.request(http::Method::POST, &path, None, body).await?;
        Ok(())
    }

    pub async fn finish(&self) -> Result<(), ProtocolError> {
        self.request(http::Method::POST, "/finish", None, Vec::new()).await?;
        Ok(())
    }

    /// `None` if the server has nothing for this archive name yet.
    pub async fn download_previous(&self, archive_name: &str) -> Result<Option<Vec<u8>>, ProtocolError> {
        let path = format!("/previous?archive-name={}", archive_name);
        match self.request(http::Method::GET, &path, None, Vec::new()).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ProtocolError::UnexpectedStatus(StatusCode::NOT_FOUND)) => Ok(None),
            Err(other) => Err(other),
        }
    }
}

fn writer_id(response: &Value) -> Result<u64, ProtocolError> {
    response
        .get("data")
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::Http2Request("missing integer \"data\" field in response".into()))
}

/// Split a producer-ordered `(offset, fingerprint)` sequence into batches
/// of at most [`ASSIGNMENT_BATCH_SIZE`], preserving order both within and
/// across batches.
pub fn batch_assignments(entries: &[(u64, String)]) -> Vec<(Vec<String>, Vec<u64>)> {
    entries
        .chunks(ASSIGNMENT_BATCH_SIZE)
        .map(|batch| {
            let digests = batch.iter().map(|(_, d)| d.clone()).collect();
            let offsets = batch.iter().map(|(o, _)| *o).collect();
            (digests, offsets)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_id_extracts_data_field() {
        let response = serde_json::json!({ "data": 42 });
        assert_eq!(writer_id(&response).unwrap(), 42);
    }

    #[test]
    fn writer_id_rejects_missing_field() {
        let response = serde_json::json!({});
        assert!(writer_id(&response).is_err());
    }

    #[test]
    fn batches_respect_the_128_entry_cap_and_preserve_order() {
        let entries: Vec<(u64, String)> =
            (0..300u64).map(|i| (i * 4096, format!("digest-{i}"))).collect();
        let batches = batch_assignments(&entries);

        assert_eq!(batches.len(), 3); // 128 + 128 + 44
        assert_eq!(batches[0].1.len(), 128);
        assert_eq!(batches[2].1.len(), 44);

        let mut flat_offsets = Vec::new();
        for (_, offsets) in &batches {
            flat_offsets.extend(offsets.iter().copied());
        }
        assert_eq!(flat_offsets, entries.iter().map(|(o, _)| *o).collect::<Vec<_>>());
    }
}
