//! Wire constants and item payload layouts for the archive (pxar) stream.
//! Byte-for-byte layout matters here: these records are read by a server
//! that predates this implementation, so every field width and ordering
//! is fixed by §4.2 and must not drift.

pub const FILENAME_MAGIC: [u8; 8] = [0x16, 0x70, 0x11, 0x21, 0x06, 0x39, 0x17, 0xB3];
pub const ENTRY_MAGIC: [u8; 8] = [0xD5, 0x95, 0x64, 0x74, 0xE5, 0x88, 0xAC, 0xEF];
pub const PAYLOAD_MAGIC: [u8; 8] = [0x28, 0x14, 0x7A, 0x1B, 0x0B, 0x7C, 0x1A, 0x25];
pub const GOODBYE_MAGIC: [u8; 8] = [0x2F, 0xEC, 0x4F, 0xA6, 0x42, 0xD5, 0x73, 0x1D];

pub const GOODBYE_TAIL_MARKER: u64 = 0xef5eed5b753e1555;

pub const GOODBYE_HASH_K1: u64 = 0x83ac3f1cfbb450db;
pub const GOODBYE_HASH_K2: u64 = 0xaa4f1b6879369fbd;

pub const MODE_DIR: u64 = 0o040000;
pub const MODE_REG: u64 = 0o100000;

pub const HEADER_LEN: usize = 16;
pub const ENTRY_PAYLOAD_LEN: usize = 40;
pub const ENTRY_ITEM_LEN: usize = HEADER_LEN + ENTRY_PAYLOAD_LEN;
pub const GOODBYE_ITEM_LEN: usize = 24; // {u64 hash, u64 offset, u64 len}

/// Write a 16-byte item header: magic, then total length including this
/// header.
pub fn write_header(out: &mut Vec<u8>, magic: &[u8; 8], total_len: u64) {
    out.extend_from_slice(magic);
    out.extend_from_slice(&total_len.to_le_bytes());
}

/// `{mode, flags, uid, gid, mtime{secs, nanos, pad}}`, 40 bytes.
#[derive(Clone, Copy, Debug)]
pub struct PxarEntry {
    pub mode: u64,
    pub flags: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime_secs: u64,
    pub mtime_nanos: u32,
}

impl PxarEntry {
    pub fn write_item(&self, out: &mut Vec<u8>) {
        write_header(out, &ENTRY_MAGIC, ENTRY_ITEM_LEN as u64);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.uid.to_le_bytes());
        out.extend_from_slice(&self.gid.to_le_bytes());
        out.extend_from_slice(&self.mtime_secs.to_le_bytes());
        out.extend_from_slice(&self.mtime_nanos.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]); // pad
    }
}

/// Write a FILENAME item: NUL-terminated name.
pub fn write_filename(out: &mut Vec<u8>, name: &[u8]) {
    let total = HEADER_LEN as u64 + name.len() as u64 + 1;
    write_header(out, &FILENAME_MAGIC, total);
    out.extend_from_slice(name);
    out.push(0);
}

/// Write a PAYLOAD header only; caller streams the file body separately so
/// large files are never buffered whole (§4.2 invariant a).
pub fn write_payload_header(out: &mut Vec<u8>, file_len: u64) {
    write_header(out, &PAYLOAD_MAGIC, HEADER_LEN as u64 + file_len);
}

/// One entry in the GOODBYE table before BST reordering.
#[derive(Clone, Copy, Debug)]
pub struct GoodbyeItem {
    pub hash: u64,
    pub offset: u64,
    pub len: u64,
}

impl GoodbyeItem {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hash.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
    }
}

/// siphash24 of `name` keyed with the fixed GOODBYE keys.
pub fn goodbye_hash(name: &[u8]) -> u64 {
    use siphasher::sip::SipHasher24;
    use std::hash::Hasher;

    let mut hasher = SipHasher24::new_with_keys(GOODBYE_HASH_K1, GOODBYE_HASH_K2);
    hasher.write(name);
    hasher.finish()
}

/// POSIX mode bits for a directory with the given permission bits.
pub fn dir_mode(perm: u32) -> u64 {
    MODE_DIR | (perm as u64 & 0o7777)
}

/// POSIX mode bits for a regular file with the given permission bits.
pub fn file_mode(perm: u32) -> u64 {
    MODE_REG | (perm as u64 & 0o7777)
}
