//! Chunk/blob wire framing (§3, §4.3 "Wire magics"). Unlike the teacher's
//! `DataBlobWriter`, which seeks back to patch a header into a local file
//! after the fact, chunks and blobs here are always built fully in memory
//! before being handed to the HTTP/2 client, so framing is a single
//! forward pass with no `Seek` requirement.

use crc32fast::Hasher as Crc32;

use crate::error::WireError;

pub const UNCOMPRESSED_MAGIC: [u8; 8] = [0x42, 0xAB, 0x38, 0x07, 0xBE, 0x83, 0x70, 0xA1];
pub const COMPRESSED_MAGIC: [u8; 8] = [0x31, 0xB9, 0x58, 0x42, 0x6F, 0xB6, 0xA3, 0x7F];

const HEADER_LEN: usize = 8 + 4;

/// A framed chunk or blob body, ready to upload as-is.
pub struct Framed {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

/// Frame `body`, compressing with zstd and keeping whichever form is
/// smaller on the wire (§3's "Chunk" definition: compressed form is used
/// only when strictly smaller).
pub fn encode(body: &[u8]) -> Result<Framed, WireError> {
    let compressed_body =
        zstd::block::compress(body, 0).map_err(|e| WireError::Compress(e.to_string()))?;

    if compressed_body.len() < body.len() {
        Ok(frame(&COMPRESSED_MAGIC, &compressed_body, true))
    } else {
        Ok(frame(&UNCOMPRESSED_MAGIC, body, false))
    }
}

fn frame(magic: &[u8; 8], body: &[u8], compressed: bool) -> Framed {
    let mut crc = Crc32::new();
    crc.update(body);
    let checksum = crc.finalize();

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(magic);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes.extend_from_slice(body);

    Framed { bytes, compressed }
}

/// Verify and decode a chunk/blob body back to its original bytes.
pub fn decode(raw: &[u8]) -> Result<Vec<u8>, WireError> {
    if raw.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }

    let mut magic = [0u8; 8];
    magic.copy_from_slice(&raw[0..8]);
    let expected_crc = u32::from_le_bytes(raw[8..12].try_into().unwrap());
    let body = &raw[HEADER_LEN..];

    let mut crc = Crc32::new();
    crc.update(body);
    if crc.finalize() != expected_crc {
        return Err(WireError::CrcMismatch);
    }

    match magic {
        UNCOMPRESSED_MAGIC => Ok(body.to_vec()),
        COMPRESSED_MAGIC => {
            // Chunks are capped well below 4 GiB; the teacher's own blob
            // reader uses the same assumption for `decompress`'s capacity.
            zstd::block::decompress(body, 16 * 1024 * 1024)
                .map_err(|e| WireError::Decompress(e.to_string()))
        }
        other => Err(WireError::UnknownMagic(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_incompressible_body() {
        let body: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let framed = encode(&body).unwrap();
        let decoded = decode(&framed.bytes).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn compresses_highly_repetitive_body() {
        let body = vec![0u8; 1 << 20];
        let framed = encode(&body).unwrap();
        assert!(framed.compressed);
        assert!(framed.bytes.len() < body.len());
        let decoded = decode(&framed.bytes).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn falls_back_to_uncompressed_for_random_small_body() {
        // A body so small that zstd's own header overhead can't shrink it.
        let body = vec![0x7fu8];
        let framed = encode(&body).unwrap();
        assert!(!framed.compressed);
        assert_eq!(&framed.bytes[0..8], &UNCOMPRESSED_MAGIC);
    }

    #[test]
    fn detects_corruption() {
        let body = b"hello world".to_vec();
        let mut framed = encode(&body).unwrap();
        let last = framed.bytes.len() - 1;
        framed.bytes[last] ^= 0xff;
        assert!(matches!(decode(&framed.bytes), Err(WireError::CrcMismatch)));
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(decode(&[0u8; 4]), Err(WireError::Truncated)));
    }
}
