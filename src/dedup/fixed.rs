//! Fixed-chunk pipeline (C6, §4.5). A positioner task reads the source
//! sequentially and labels each 4 MiB block with its absolute offset; a
//! pool of `W` workers hash, dedup-check and upload blocks concurrently.
//! A mutex guards the shared offset→hash map and running counters.
//!
//! No direct teacher file in this lineage implements a worker pool over
//! a channel for chunk uploads (the closest, `client/pull.rs`'s
//! `ParallelHandler`, dispatched over named pull workers rather than
//! upload workers and was trimmed once this module subsumed what it was
//! grounding); this follows §4.5's prose directly, using
//! `crossbeam-channel` for the handoff the way `pxar::encoder` uses it
//! for archive frames.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use openssl::hash::{Hasher, MessageDigest};

use crate::client::http2::{batch_assignments, ProtocolClient};
use crate::error::{BackupError, IndexError};
use crate::index::IndexDigest;
use crate::known_chunks::KnownChunkSet;
use crate::manifest::UploadStats;
use crate::wire;

pub const CHUNK_SIZE: u64 = 4 * 1024 * 1024;
pub const WORKER_COUNT: usize = 8;

struct Shared {
    client: ProtocolClient,
    known_chunks: Arc<KnownChunkSet>,
    wid: u64,
    offset_to_fingerprint: Mutex<BTreeMap<u64, [u8; 32]>>,
    stats: Mutex<UploadStats>,
}

/// Drive the full fixed-chunk pipeline for one writer session and return
/// `(csum_hex, declared_size, chunk_count, stats)`, matching the
/// dynamic assembler's `finish()` shape.
pub async fn run<R: Read + Send + 'static>(
    client: ProtocolClient,
    known_chunks: Arc<KnownChunkSet>,
    wid: u64,
    mut source: R,
    declared_size: u64,
) -> Result<(String, u64, u64, UploadStats), BackupError> {
    let (tx, rx) = crossbeam_channel::bounded::<(u64, Vec<u8>)>(WORKER_COUNT * 2);

    let positioner = std::thread::spawn(move || -> Result<(), BackupError> {
        let mut offset = 0u64;
        let mut total_read = 0u64;
        loop {
            let mut buf = vec![0u8; CHUNK_SIZE as usize];
            let n = read_full(&mut source, &mut buf)?;
            if n == 0 {
                break;
            }
            total_read += n as u64;
            // §4.5 / §8 "source larger than declared size": raise before
            // this (or any further) chunk goes to the workers, not after.
            if total_read > declared_size {
                return Err(BackupError::Invariant(format!(
                    "source exceeds declared size {} bytes (observed at least {} bytes)",
                    declared_size, total_read
                )));
            }
            // Block devices and image files are padded to a full 4 MiB
            // multiple so every chunk uploaded is exactly CHUNK_SIZE
            // (§4.5 "the producer pads with zeros").
            if (n as u64) < CHUNK_SIZE {
                for byte in &mut buf[n..] {
                    *byte = 0;
                }
            }
            if tx.send((offset, buf)).is_err() {
                break;
            }
            offset += CHUNK_SIZE;
            if n < buf.len() {
                break;
            }
        }
        Ok(())
    });

    let shared = Arc::new(Shared {
        client,
        known_chunks,
        wid,
        offset_to_fingerprint: Mutex::new(BTreeMap::new()),
        stats: Mutex::new(UploadStats::default()),
    });

    let mut workers = Vec::new();
    for _ in 0..WORKER_COUNT {
        let rx = rx.clone();
        let shared = Arc::clone(&shared);
        workers.push(tokio::spawn(async move {
            while let Ok((offset, block)) = rx.recv() {
                worker_upload(&shared, offset, block).await?;
            }
            Ok::<(), BackupError>(())
        }));
    }

    for worker in workers {
        worker.await.map_err(|e| BackupError::Invariant(e.to_string()))??;
    }
    positioner
        .join()
        .map_err(|_| BackupError::Invariant("positioner thread panicked".into()))??;

    let shared = Arc::try_unwrap(shared)
        .unwrap_or_else(|_| unreachable!("all worker handles joined above"));
    finalize(shared, declared_size).await
}

async fn worker_upload(shared: &Shared, offset: u64, block: Vec<u8>) -> Result<(), BackupError> {
    let fingerprint = sha256(&block).map_err(IndexError::from)?;

    let already_known = shared.known_chunks.check_and_insert(fingerprint);
    if already_known {
        shared.stats.lock().unwrap().record_duplicate(block.len() as u64);
    } else {
        let framed = wire::encode(&block)?;
        let wire_len = framed.bytes.len() as u64;
        shared
            .client
            .upload_fixed_chunk(shared.wid, &to_hex(&fingerprint), wire_len, block.len() as u64, offset, framed.bytes)
            .await?;
        shared.stats.lock().unwrap().record_upload(block.len() as u64, wire_len);
    }

    shared.offset_to_fingerprint.lock().unwrap().insert(offset, fingerprint);
    Ok(())
}

async fn finalize(shared: Shared, declared_size: u64) -> Result<(String, u64, u64, UploadStats), BackupError> {
    let offsets = shared.offset_to_fingerprint.into_inner().unwrap();
    let chunk_count = offsets.len() as u64;

    // §4.5 invariant: chunk_count * CHUNK_SIZE >= declared_size.
    if chunk_count * CHUNK_SIZE < declared_size {
        return Err(BackupError::Invariant(format!(
            "fixed pipeline observed {} bytes, expected at least {}",
            chunk_count * CHUNK_SIZE,
            declared_size
        )));
    }

    let mut digest = IndexDigest::new_fixed()?;
    let mut pending = Vec::with_capacity(offsets.len());
    for (offset, fingerprint) in &offsets {
        digest.update(*offset, fingerprint)?;
        pending.push((*offset, to_hex(fingerprint)));
    }
    let csum = to_hex(&digest.finish()?);

    for (digests, offset_list) in batch_assignments(&pending) {
        shared.client.assign_fixed(shared.wid, &digests, &offset_list).await?;
    }

    shared.client.close_fixed_index(shared.wid, &csum, declared_size, chunk_count).await?;

    let stats = *shared.stats.lock().unwrap();
    Ok((csum, declared_size, chunk_count, stats))
}

fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
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

    /// Same in-process h2-over-`tokio::io::duplex` peer `dedup::dynamic`'s
    /// tests use: answers every request with a bare `200 {}`.
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
    async fn source_larger_than_declared_size_is_rejected_before_extra_upload() {
        let client = fake_server().await;
        let known_chunks = Arc::new(KnownChunkSet::new());

        // One full chunk declared, but the source actually holds two.
        let declared_size = CHUNK_SIZE;
        let source = std::io::Cursor::new(vec![0x11u8; (CHUNK_SIZE * 2) as usize]);

        let err = run(client, known_chunks, 1, source, declared_size).await.unwrap_err();
        assert!(matches!(err, BackupError::Invariant(_)), "expected Invariant, got {err:?}");
    }

    #[tokio::test]
    async fn source_matching_declared_size_with_padding_succeeds() {
        let client = fake_server().await;
        let known_chunks = Arc::new(KnownChunkSet::new());

        // Declared size falls short of a full chunk; the tail is zero-padded.
        let declared_size = CHUNK_SIZE - 100;
        let source = std::io::Cursor::new(vec![0x22u8; declared_size as usize]);

        let (_csum, size, chunk_count, stats) =
            run(client, known_chunks, 2, source, declared_size).await.unwrap();
        assert_eq!(size, declared_size);
        assert_eq!(chunk_count, 1);
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn read_full_handles_short_reads() {
        struct Stuttering<'a> {
            data: &'a [u8],
        }
        impl<'a> Read for Stuttering<'a> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = 3.min(buf.len()).min(self.data.len());
                buf[..n].copy_from_slice(&self.data[..n]);
                self.data = &self.data[n..];
                Ok(n)
            }
        }

        let data = vec![0xABu8; 10_000];
        let mut source = Stuttering { data: &data };
        let mut buf = vec![0u8; 10_000];
        let n = read_full(&mut source, &mut buf).unwrap();
        assert_eq!(n, 10_000);
        assert_eq!(buf, data);
    }

    #[test]
    fn sha256_is_deterministic() {
        assert_eq!(sha256(b"abc").unwrap(), sha256(b"abc").unwrap());
        assert_ne!(sha256(b"abc").unwrap(), sha256(b"abd").unwrap());
    }
}
