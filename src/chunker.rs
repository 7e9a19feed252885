//! Content-defined chunking via a cyclic-polynomial ("buzhash") rolling
//! hash. A cut is declared where the low bits of the rolling hash are
//! zero, biasing the average chunk size toward the configured target.
//!
//! The consumer contract mirrors the old futures-based chunk stream: call
//! [`Chunker::scan`] with successive slices of the logical byte stream; a
//! non-zero return is a cut point *within that slice*, and any bytes past
//! the cut belong to the next chunk and must be re-submitted.

use crate::error::ChunkerError;

const WINDOW_SIZE: usize = 64;

/// Lookup table mapping each possible byte value to a pseudo-random u32,
/// used to fold a byte into the rolling hash. Generated with a simple
/// splitmix-style constant-multiply so it is reproducible without storing
/// a literal 256-entry table.
fn buzhash_table() -> &'static [u32; 256] {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        let mut seed: u32 = 0x9E3779B9;
        for (i, slot) in table.iter_mut().enumerate() {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed = seed.wrapping_add(i as u32).wrapping_mul(0x85EBCA6B);
            *slot = seed;
        }
        table
    })
}

#[inline]
fn rotate_left(value: u32, bits: u32) -> u32 {
    value.rotate_left(bits % 32)
}

/// Rolling buzhash chunker with a fixed sliding window. One instance
/// covers exactly one chunk boundary search; state is pure per-instance.
pub struct Chunker {
    target_size: usize,
    min_size: usize,
    max_size: usize,
    mask: u32,
    window: [u8; WINDOW_SIZE],
    window_pos: usize,
    window_filled: usize,
    hash: u32,
    chunk_len: usize,
}

impl Chunker {
    /// Build a chunker targeting `target_size` bytes per chunk. Minimum is
    /// `target_size / 4`, maximum is `target_size * 4`, matching §4.1.
    pub fn new(target_size: usize) -> Self {
        let bits = (usize::BITS - target_size.max(1).leading_zeros() - 1).max(1);
        Self {
            target_size,
            min_size: (target_size / 4).max(1),
            max_size: target_size * 4,
            mask: (1u32 << bits.min(31)) - 1,
            window: [0u8; WINDOW_SIZE],
            window_pos: 0,
            window_filled: 0,
            hash: 0,
            chunk_len: 0,
        }
    }

    /// Average chunk size this instance was configured for.
    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Feed the next slice of the logical stream. Returns the index within
    /// `data` at which a chunk boundary was found, or `0` if none (the
    /// entire slice belongs to the chunk still being accumulated). Bytes
    /// past a non-zero cut are not consumed; the caller re-invokes `scan`
    /// on the remainder to find the *next* boundary, so a single call
    /// never reports more than one cut.
    pub fn scan(&mut self, data: &[u8]) -> Result<usize, ChunkerError> {
        if data.is_empty() {
            return Ok(0);
        }

        let table = buzhash_table();

        for (i, &byte) in data.iter().enumerate() {
            self.chunk_len += 1;

            if self.window_filled == WINDOW_SIZE {
                let leaving = self.window[self.window_pos];
                self.hash ^= rotate_left(table[leaving as usize], WINDOW_SIZE as u32);
            } else {
                self.window_filled += 1;
            }

            self.hash = rotate_left(self.hash, 1) ^ table[byte as usize];
            self.window[self.window_pos] = byte;
            self.window_pos = (self.window_pos + 1) % WINDOW_SIZE;

            if self.chunk_len >= self.max_size {
                let cut = i + 1;
                self.reset();
                return Ok(cut);
            }

            if self.chunk_len >= self.min_size && (self.hash & self.mask) == 0 {
                let cut = i + 1;
                self.reset();
                return Ok(cut);
            }
        }

        Ok(0)
    }

    fn reset(&mut self) {
        self.window = [0u8; WINDOW_SIZE];
        self.window_pos = 0;
        self.window_filled = 0;
        self.hash = 0;
        self.chunk_len = 0;
    }
}

/// Drives a [`Chunker`] over successive input slices, handing complete
/// chunks to a caller-supplied sink. Replaces the old `ChunkStream`
/// combinator: instead of wrapping a futures `Stream`, this owns an
/// explicit buffer and exposes a synchronous push/finish contract so any
/// producer (sync reader, async task) can drive it.
pub struct ChunkAccumulator {
    chunker: Chunker,
    buffer: Vec<u8>,
}

impl ChunkAccumulator {
    pub fn new(target_size: usize) -> Self {
        Self {
            chunker: Chunker::new(target_size),
            buffer: Vec::with_capacity(target_size),
        }
    }

    /// Push more bytes from the logical stream, invoking `on_chunk` for
    /// every chunk boundary crossed. A single call may cross several
    /// boundaries if `data` is large.
    pub fn push(
        &mut self,
        mut data: &[u8],
        mut on_chunk: impl FnMut(Vec<u8>),
    ) -> Result<(), ChunkerError> {
        while !data.is_empty() {
            let cut = self.chunker.scan(data)?;
            if cut == 0 {
                self.buffer.extend_from_slice(data);
                break;
            }
            let (head, rest) = data.split_at(cut);
            self.buffer.extend_from_slice(head);
            let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunker.target_size()));
            on_chunk(chunk);
            data = rest;
        }
        Ok(())
    }

    /// Flush any residual buffered bytes as a final short chunk. Returns
    /// `None` if nothing was buffered (matches the "empty source" edge
    /// case in §4.1/§8).
    pub fn finish(mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_scan_returns_zero() {
        let mut chunker = Chunker::new(4 * 1024 * 1024);
        assert_eq!(chunker.scan(&[]).unwrap(), 0);
    }

    #[test]
    fn forces_cut_at_max_size() {
        let mut chunker = Chunker::new(1024);
        let data = vec![0xAAu8; 1024 * 4 + 10];
        let cut = chunker.scan(&data).unwrap();
        assert_eq!(cut, 1024 * 4);
    }

    #[test]
    fn deterministic_for_same_input() {
        let data = {
            let mut v = Vec::new();
            let mut x: u32 = 12345;
            for _ in 0..200_000 {
                x = x.wrapping_mul(1103515245).wrapping_add(12345);
                v.push((x >> 16) as u8);
            }
            v
        };

        let cuts_a = all_cuts(&data, 4096);
        let cuts_b = all_cuts(&data, 4096);
        assert_eq!(cuts_a, cuts_b);
        assert!(!cuts_a.is_empty());
    }

    #[test]
    fn accumulator_reassembles_original_bytes() {
        let data = {
            let mut v = Vec::new();
            let mut x: u32 = 999;
            for _ in 0..500_000 {
                x = x.wrapping_mul(1664525).wrapping_add(1013904223);
                v.push((x >> 24) as u8);
            }
            v
        };

        let mut acc = ChunkAccumulator::new(8192);
        let mut reassembled = Vec::new();
        let mut chunk_count = 0usize;
        for piece in data.chunks(777) {
            acc.push(piece, |chunk| {
                chunk_count += 1;
                reassembled.extend_from_slice(&chunk);
            })
            .unwrap();
        }
        if let Some(rest) = acc.finish() {
            reassembled.extend_from_slice(&rest);
        }

        assert_eq!(reassembled, data);
        assert!(chunk_count > 1);
    }

    fn all_cuts(data: &[u8], target: usize) -> Vec<usize> {
        let mut chunker = Chunker::new(target);
        let mut cuts = Vec::new();
        let mut offset = 0usize;
        let mut remaining = data;
        while !remaining.is_empty() {
            let cut = chunker.scan(remaining).unwrap();
            if cut == 0 {
                break;
            }
            offset += cut;
            cuts.push(offset);
            remaining = &remaining[cut..];
        }
        cuts
    }
}
