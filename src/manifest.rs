//! Backup manifest (§3 "Backup manifest", §10.3's `UploadStats` addition).
//! Serialized as `index.json.blob` and POSTed as the last blob before
//! `/finish` (§4.4 step 5).

use serde::{Deserialize, Serialize};

/// Lowercase, no separators (unlike `tools::cert`'s colon-joined TLS
/// fingerprint form, which the manifest's `csum` field doesn't use).
fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{:02x}", byte).unwrap();
    }
    out
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Host,
    Vm,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CryptMode {
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFileEntry {
    pub filename: String,
    /// Hex-encoded SHA-256, the writer's closing `csum` (§3).
    pub csum: String,
    pub size: u64,
    #[serde(rename = "crypt-mode")]
    pub crypt_mode: CryptMode,
}

/// Per-writer upload accounting (§10.3), folded into the manifest's
/// `unprotected.chunk_upload_stats` and also what the email-notification
/// template's `{NewChunks, ReusedChunks}` variables (§7) are derived from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UploadStats {
    pub size: u64,
    pub compressed_size: u64,
    pub count: u64,
    pub duplicates: u64,
}

impl UploadStats {
    pub fn record_upload(&mut self, original_len: u64, wire_len: u64) {
        self.size += original_len;
        self.compressed_size += wire_len;
        self.count += 1;
    }

    pub fn record_duplicate(&mut self, original_len: u64) {
        self.size += original_len;
        self.count += 1;
        self.duplicates += 1;
    }

    pub fn new_chunks(&self) -> u64 {
        self.count - self.duplicates
    }

    pub fn reused_chunks(&self) -> u64 {
        self.duplicates
    }
}

impl std::ops::AddAssign for UploadStats {
    fn add_assign(&mut self, other: Self) {
        self.size += other.size;
        self.compressed_size += other.compressed_size;
        self.count += other.count;
        self.duplicates += other.duplicates;
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Unprotected {
    /// Accumulated across every writer session of the run (§10.3), not
    /// kept per-archive — matches the single `ChunkUploadStats` struct
    /// nested directly under `Unprotected` on the wire.
    pub chunk_upload_stats: UploadStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    #[serde(rename = "backup-id")]
    pub backup_id: String,
    #[serde(rename = "backup-time")]
    pub backup_time: i64,
    #[serde(rename = "backup-type")]
    pub backup_type: BackupType,
    pub files: Vec<ManifestFileEntry>,
    pub signature: Option<String>,
    pub unprotected: Unprotected,
}

impl BackupManifest {
    pub fn new(backup_id: String, backup_time: i64, backup_type: BackupType) -> Self {
        Self {
            backup_id,
            backup_time,
            backup_type,
            files: Vec::new(),
            signature: None,
            unprotected: Unprotected::default(),
        }
    }

    pub fn add_file(
        &mut self,
        archive_name: impl Into<String>,
        csum: [u8; 32],
        size: u64,
        stats: UploadStats,
    ) {
        let archive_name = archive_name.into();
        self.files.push(ManifestFileEntry {
            filename: archive_name.clone(),
            csum: to_hex(&csum),
            size,
            crypt_mode: CryptMode::None,
        });
        self.unprotected.chunk_upload_stats += stats;
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut manifest = BackupManifest::new("host1".into(), 1_700_000_000, BackupType::Host);
        let mut stats = UploadStats::default();
        stats.record_upload(4096, 2048);
        stats.record_duplicate(4096);
        manifest.add_file("backup.pxar.didx", [0x11u8; 32], 8192, stats);

        let bytes = manifest.to_json_bytes().unwrap();
        let parsed: BackupManifest = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed.backup_id, "host1");
        assert_eq!(parsed.backup_type, BackupType::Host);
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].csum, "11".repeat(32));
        assert_eq!(parsed.files[0].crypt_mode, CryptMode::None);
        assert!(parsed.signature.is_none());

        let stats = &parsed.unprotected.chunk_upload_stats;
        assert_eq!(stats.count, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.new_chunks(), 1);
        assert_eq!(stats.reused_chunks(), 1);
    }

    #[test]
    fn chunk_upload_stats_accumulate_across_writers() {
        let mut manifest = BackupManifest::new("host1".into(), 1_700_000_000, BackupType::Host);

        let mut archive_stats = UploadStats::default();
        archive_stats.record_upload(4096, 2048);
        manifest.add_file("backup.pxar.didx", [0x11u8; 32], 4096, archive_stats);

        let mut catalog_stats = UploadStats::default();
        catalog_stats.record_upload(1024, 512);
        catalog_stats.record_duplicate(1024);
        manifest.add_file("catalog.pcat1.didx", [0x22u8; 32], 2048, catalog_stats);

        let combined = manifest.unprotected.chunk_upload_stats;
        assert_eq!(combined.count, 3);
        assert_eq!(combined.duplicates, 1);
        assert_eq!(combined.size, 4096 + 1024 + 1024);
        assert_eq!(combined.compressed_size, 2048 + 512);
    }

    #[test]
    fn field_names_match_wire_contract() {
        let manifest = BackupManifest::new("vm1".into(), 42, BackupType::Vm);
        let value = serde_json::to_value(&manifest).unwrap();
        assert!(value.get("backup-id").is_some());
        assert!(value.get("backup-time").is_some());
        assert!(value.get("backup-type").is_some());
        assert_eq!(value["backup-type"], "vm");
    }
}
