//! Dynamic chunk assembler (C5, §4.4). Wraps one writer session: feeds
//! bytes to the chunker, and for each completed chunk, fingerprints it,
//! consults the known-chunk set, uploads if new, and folds it into the
//! running digest and pending assignment list.
//!
//! Grounded on `directorybackup/main.go`'s `ChunkState.HandleData`/`Eof`,
//! generalized from that file's single hard-coded client call into an
//! assembler over the typed [`ProtocolClient`].

use std::sync::Arc;

use openssl::hash::{Hasher, MessageDigest};

use crate::chunker::ChunkAccumulator;
use crate::client::http2::{batch_assignments, ProtocolClient};
use crate::error::{BackupError, IndexError};
use crate::index::IndexDigest;
use crate::known_chunks::KnownChunkSet;
use crate::manifest::UploadStats;
use crate::wire;

pub struct DynamicAssembler {
    client: ProtocolClient,
    known_chunks: Arc<KnownChunkSet>,
    wid: u64,
    accumulator: ChunkAccumulator,
    digest: IndexDigest,
    pos: u64,
    chunk_count: u64,
    pending: Vec<(u64, String)>,
    stats: UploadStats,
}

impl DynamicAssembler {
    pub fn new(
        client: ProtocolClient,
        known_chunks: Arc<KnownChunkSet>,
        wid: u64,
        target_chunk_size: usize,
    ) -> Result<Self, BackupError> {
        Ok(Self {
            client,
            known_chunks,
            wid,
            accumulator: ChunkAccumulator::new(target_chunk_size),
            digest: IndexDigest::new_dynamic()?,
            pos: 0,
            chunk_count: 0,
            pending: Vec::new(),
            stats: UploadStats::default(),
        })
    }

    /// Feed the next slice of archive bytes, uploading every chunk the
    /// chunker cuts out of it.
    pub async fn handle_data(&mut self, data: &[u8]) -> Result<(), BackupError> {
        let mut completed = Vec::new();
        self.accumulator.push(data, |chunk| completed.push(chunk))?;
        for chunk in completed {
            self.handle_chunk(chunk).await?;
        }
        Ok(())
    }

    /// Flush any residual buffered bytes, then PUT the assignment list in
    /// batches and POST `/dynamic_close` (§4.4 "On EOF").
    pub async fn finish(mut self) -> Result<(String, u64, u64, UploadStats), BackupError> {
        if let Some(last) = std::mem::replace(&mut self.accumulator, ChunkAccumulator::new(1)).finish() {
            self.handle_chunk(last).await?;
        }

        for (digests, offsets) in batch_assignments(&self.pending) {
            self.client.assign_dynamic(self.wid, &digests, &offsets).await?;
        }

        let csum = self.digest.finish()?;
        let csum_hex = to_hex(&csum);
        self.client.close_dynamic_index(self.wid, &csum_hex, self.pos, self.chunk_count).await?;

        Ok((csum_hex, self.pos, self.chunk_count, self.stats))
    }

    async fn handle_chunk(&mut self, chunk: Vec<u8>) -> Result<(), BackupError> {
        let fingerprint = sha256(&chunk).map_err(IndexError::from)?;
        let start = self.pos;
        let end = start + chunk.len() as u64;

        if self.known_chunks.check_and_insert(fingerprint) {
            self.stats.record_duplicate(chunk.len() as u64);
        } else {
            let framed = wire::encode(&chunk)?;
            let wire_len = framed.bytes.len() as u64;
            self.client
                .upload_dynamic_chunk(self.wid, &to_hex(&fingerprint), wire_len, chunk.len() as u64, framed.bytes)
                .await?;
            self.stats.record_upload(chunk.len() as u64, wire_len);
        }

        self.digest.update(end, &fingerprint)?;
        self.pending.push((start, to_hex(&fingerprint)));
        self.pos = end;
        self.chunk_count += 1;
        Ok(())
    }
}

fn sha256(data: &[u8]) -> Result<[u8; 32], openssl::error::ErrorStack> {
    let mut hasher = Hasher::new(MessageDigest::sha256())?;
    hasher.update(data)?;
    let digest = hasher.finish()?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{:02x}", byte).unwrap();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream::StreamExt;

    /// An in-process h2 peer (over a `tokio::io::duplex` pipe rather than a
    /// real socket) that answers every request with a bare `200 {}` —
    /// enough for `ProtocolClient`'s plain and JSON-parsing call sites
    /// alike, without standing up anything resembling a real server.
    async fn fake_server() -> ProtocolClient {
        let (client_io, server_io) = tokio::io::duplex(1 << 20);

        tokio::spawn(async move {
            let mut connection = h2::server::handshake(server_io).await.unwrap();
            while let Some(result) = connection.accept().await {
                let (request, respond) = result.unwrap();
                tokio::spawn(async move {
                    let mut body = request.into_body();
                    while let Some(chunk) = body.next().await {
                        let chunk = chunk.unwrap();
                        let _ = body.flow_control().release_capacity(chunk.len());
                    }
                    let mut respond = respond;
                    let response = http::Response::builder().status(200).body(()).unwrap();
                    let mut send = respond.send_response(response, false).unwrap();
                    send.send_data(Bytes::from_static(b"{}"), true).unwrap();
                });
            }
        });

        let (send_request, connection) = h2::client::handshake(client_io).await.unwrap();
        tokio::spawn(async move {
            let _ = connection.await;
        });

        ProtocolClient::new(send_request, String::new(), "PBSAPIToken=test".to_string())
    }

    #[tokio::test]
    async fn repeated_chunk_is_uploaded_once_and_counted_as_duplicate() {
        let client = fake_server().await;
        let known_chunks = Arc::new(KnownChunkSet::new());
        let mut assembler = DynamicAssembler::new(client, known_chunks, 7, 1024).unwrap();

        // Forces two identical 4096-byte chunks (see chunker's own
        // `forces_cut_at_max_size`), leaving a 10-byte tail buffered.
        let data = vec![0xAAu8; 4096 * 2 + 10];
        assembler.handle_data(&data).await.unwrap();

        let (csum_hex, pos, chunk_count, stats) = assembler.finish().await.unwrap();

        assert_eq!(pos, data.len() as u64);
        assert_eq!(chunk_count, 3); // two identical chunks + the short tail
        assert_eq!(stats.size, data.len() as u64);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.new_chunks(), 2);
        assert_eq!(stats.reused_chunks(), 1);
        assert_eq!(csum_hex.len(), 64);
    }

    #[tokio::test]
    async fn empty_source_produces_no_chunks() {
        let client = fake_server().await;
        let known_chunks = Arc::new(KnownChunkSet::new());
        let assembler = DynamicAssembler::new(client, known_chunks, 7, 1024).unwrap();

        let (_, pos, chunk_count, stats) = assembler.finish().await.unwrap();

        assert_eq!(pos, 0);
        assert_eq!(chunk_count, 0);
        assert_eq!(stats.count, 0);
    }

    #[tokio::test]
    async fn previously_known_chunk_is_never_uploaded() {
        let client = fake_server().await;
        let known_chunks = Arc::new(KnownChunkSet::new());

        let data = vec![0x7Bu8; 4096 + 5];
        let fingerprint = sha256(&data[..4096]).unwrap();
        known_chunks.check_and_insert(fingerprint);

        let mut assembler = DynamicAssembler::new(client, known_chunks, 7, 1024).unwrap();
        assembler.handle_data(&data).await.unwrap();
        let (_, _, chunk_count, stats) = assembler.finish().await.unwrap();

        assert_eq!(chunk_count, 2); // the forced chunk plus the short tail
        assert_eq!(stats.duplicates, 1);
    }
}
