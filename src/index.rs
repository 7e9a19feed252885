//! Previous-index parsing (§3 "Previous DIDX layout") and the running
//! index digest fed during a writer session (§3 "Running index digest").
//!
//! Both DIDX (dynamic) and FIDX (fixed) previous indexes share the same
//! on-disk shape: a 4096-byte opaque header (only the leading magic is
//! interpreted here) followed by a packed array of 40-byte
//! `{u64_LE offset, 32B sha256}` records running to end-of-file.

use openssl::hash::{Hasher, MessageDigest};

use crate::error::IndexError;

pub const DIDX_MAGIC: [u8; 8] = [0x1C, 0x91, 0x4E, 0xA5, 0x19, 0xBA, 0xB3, 0xCD];

// No FIDX magic constant is asserted here: unlike DIDX, none appears
// anywhere in the material this was built from. `parse_records` takes the
// expected magic as a parameter for exactly this reason — the fixed-index
// caller supplies whatever value its own previous-index download yields
// rather than this module guessing one.

const HEADER_LEN: usize = 4096;
const RECORD_LEN: usize = 40;

/// One `(offset, fingerprint)` record from a previous index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub offset: u64,
    pub fingerprint: [u8; 32],
}

/// Parse a previous DIDX or FIDX file's records, checking the header magic
/// against `expected_magic`. Used to seed the known-chunk set (§3).
pub fn parse_records(data: &[u8], expected_magic: [u8; 8]) -> Result<Vec<IndexRecord>, IndexError> {
    if data.len() < HEADER_LEN {
        return Err(IndexError::Truncated);
    }
    if data[0..8] != expected_magic {
        return Err(IndexError::WrongMagic);
    }

    let body = &data[HEADER_LEN..];
    if body.len() % RECORD_LEN != 0 {
        return Err(IndexError::Misaligned(body.len()));
    }

    let mut records = Vec::with_capacity(body.len() / RECORD_LEN);
    for chunk in body.chunks_exact(RECORD_LEN) {
        let offset = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&chunk[8..40]);
        records.push(IndexRecord { offset, fingerprint });
    }
    Ok(records)
}

/// The running SHA-256 fed during a writer session, whose final value
/// becomes the `csum` reported at session close (§3).
///
/// Dynamic sessions feed `(u64_LE end_offset, fingerprint)` per chunk in
/// assignment order; fixed sessions feed just the fingerprint, in strict
/// offset order.
pub enum IndexDigest {
    Dynamic(Hasher),
    Fixed(Hasher),
}

impl IndexDigest {
    pub fn new_dynamic() -> Result<Self, IndexError> {
        Ok(IndexDigest::Dynamic(Hasher::new(MessageDigest::sha256())?))
    }

    pub fn new_fixed() -> Result<Self, IndexError> {
        Ok(IndexDigest::Fixed(Hasher::new(MessageDigest::sha256())?))
    }

    pub fn update(&mut self, end_offset: u64, fingerprint: &[u8; 32]) -> Result<(), IndexError> {
        match self {
            IndexDigest::Dynamic(hasher) => {
                hasher.update(&end_offset.to_le_bytes())?;
                hasher.update(fingerprint)?;
            }
            IndexDigest::Fixed(hasher) => {
                hasher.update(fingerprint)?;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<[u8; 32], IndexError> {
        let mut hasher = match self {
            IndexDigest::Dynamic(h) => h,
            IndexDigest::Fixed(h) => h,
        };
        let digest = hasher.finish()?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index(magic: [u8; 8], records: &[(u64, [u8; 32])]) -> Vec<u8> {
        let mut data = vec![0u8; HEADER_LEN];
        data[0..8].copy_from_slice(&magic);
        for (offset, fp) in records {
            data.extend_from_slice(&offset.to_le_bytes());
            data.extend_from_slice(fp);
        }
        data
    }

    #[test]
    fn parses_well_formed_index() {
        let fp_a = [0xAAu8; 32];
        let fp_b = [0xBBu8; 32];
        let data = sample_index(DIDX_MAGIC, &[(4096, fp_a), (8192, fp_b)]);

        let records = parse_records(&data, DIDX_MAGIC).unwrap();
        assert_eq!(
            records,
            vec![
                IndexRecord { offset: 4096, fingerprint: fp_a },
                IndexRecord { offset: 8192, fingerprint: fp_b },
            ]
        );
    }

    const OTHER_MAGIC: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

    #[test]
    fn empty_record_table_is_valid() {
        let data = sample_index(OTHER_MAGIC, &[]);
        let records = parse_records(&data, OTHER_MAGIC).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn rejects_wrong_magic() {
        let data = sample_index(OTHER_MAGIC, &[]);
        assert!(matches!(parse_records(&data, DIDX_MAGIC), Err(IndexError::WrongMagic)));
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(parse_records(&[0u8; 10], DIDX_MAGIC), Err(IndexError::Truncated)));
    }

    #[test]
    fn rejects_misaligned_record_table() {
        let mut data = sample_index(DIDX_MAGIC, &[(0, [0u8; 32])]);
        data.pop();
        assert!(matches!(parse_records(&data, DIDX_MAGIC), Err(IndexError::Misaligned(_))));
    }

    #[test]
    fn dynamic_and_fixed_digests_diverge_for_same_chunks() {
        let fp = [0x11u8; 32];
        let mut dynamic = IndexDigest::new_dynamic().unwrap();
        dynamic.update(4096, &fp).unwrap();
        let mut fixed = IndexDigest::new_fixed().unwrap();
        fixed.update(4096, &fp).unwrap();
        assert_ne!(dynamic.finish().unwrap(), fixed.finish().unwrap());
    }

    #[test]
    fn fixed_digest_ignores_offset() {
        let fp = [0x22u8; 32];
        let mut a = IndexDigest::new_fixed().unwrap();
        a.update(100, &fp).unwrap();
        let mut b = IndexDigest::new_fixed().unwrap();
        b.update(999, &fp).unwrap();
        assert_eq!(a.finish().unwrap(), b.finish().unwrap());
    }
}
