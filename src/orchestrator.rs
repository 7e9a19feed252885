//! Session orchestrator (C7, §4.6): lock, connect, drive the writers for
//! one backup run, then the manifest/VM-config/finish tail.
//!
//! Grounded on `original_source/directorybackup/main.go`'s `main()`/
//! `backup()`/`backup_stream()` call order and
//! `original_source/machinebackup/config.go`'s per-device shape, re-
//! expressed as a scoped session object per §9 ("global mutable state
//! for snapshot cleanup and single-instance lock... a scoped session
//! object whose destruction releases all resources on every exit path").

use std::path::{Path, PathBuf};
use std::sync::Arc;

use url::Url;

use crate::client::http2::ProtocolClient;
use crate::client::tls::CertValidation;
use crate::client::upgrade::Role;
use crate::client::{connect, SessionParams};
use crate::collaborators::{ProcessLock, SnapshotSource};
use crate::dedup::{fixed, DynamicAssembler};
use crate::error::BackupError;
use crate::index::{parse_records, DIDX_MAGIC};
use crate::known_chunks::KnownChunkSet;
use crate::manifest::{BackupManifest, BackupType, UploadStats};
use crate::pxar::{self, Frame};

pub const ARCHIVE_NAME: &str = "backup.pxar.didx";
pub const CATALOG_NAME: &str = "catalog.pcat1.didx";
pub const MANIFEST_BLOB_NAME: &str = "index.json.blob";
pub const VM_CONFIG_BLOB_NAME: &str = "qemu-server.conf.blob";

/// Everything the orchestrator needs to open a session, independent of
/// which backup kind it's about to run.
pub struct SessionConfig {
    pub base_url: String,
    pub cert_fingerprint: Option<String>,
    pub auth_header: String,
    pub backup_time: i64,
    pub backup_type: BackupType,
    pub store: String,
    pub namespace: Option<String>,
    pub backup_id: String,
    pub target_chunk_size: usize,
}

/// Tallies carried back to the caller for the mail-notification
/// collaborator's template variables (§7).
#[derive(Debug, Clone, Copy, Default)]
pub struct BackupOutcome {
    pub new_chunks: u64,
    pub reused_chunks: u64,
}

impl From<&UploadStats> for BackupOutcome {
    fn from(stats: &UploadStats) -> Self {
        Self { new_chunks: stats.new_chunks(), reused_chunks: stats.reused_chunks() }
    }
}

impl std::ops::AddAssign for BackupOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.new_chunks += rhs.new_chunks;
        self.reused_chunks += rhs.reused_chunks;
    }
}

fn host_port(base_url: &str) -> Result<(String, u16), BackupError> {
    let url = Url::parse(base_url)
        .map_err(|e| BackupError::Invariant(format!("invalid base URL {base_url:?}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| BackupError::Invariant(format!("base URL {base_url:?} has no host")))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(8007);
    Ok((host, port))
}

async fn open_session(cfg: &SessionConfig, role: Role) -> Result<ProtocolClient, BackupError> {
    let (host, port) = host_port(&cfg.base_url)?;
    let validation = match &cfg.cert_fingerprint {
        Some(fp) if !fp.is_empty() => CertValidation::PinnedFingerprint(fp.clone()),
        _ => CertValidation::Strict,
    };

    let backup_type = match cfg.backup_type {
        BackupType::Host => "host",
        BackupType::Vm => "vm",
    };

    let client = connect(SessionParams {
        host: &host,
        port,
        validation,
        auth_header: cfg.auth_header.clone(),
        backup_time: cfg.backup_time,
        backup_type,
        store: &cfg.store,
        namespace: cfg.namespace.as_deref(),
        backup_id: &cfg.backup_id,
        role,
    })
    .await?;

    Ok(client)
}

/// Download and parse a previous DIDX index, seeding a known-chunk set.
/// A missing or wrong-magic previous index is non-fatal — the writer just
/// proceeds with an empty set (§4.6, §8 boundary behaviors).
async fn seed_known_chunks(
    client: &ProtocolClient,
    archive_name: &str,
    magic: [u8; 8],
) -> Arc<KnownChunkSet> {
    let previous = match client.download_previous(archive_name).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            log::debug!("no prior index for {archive_name}, starting with an empty known-chunk set");
            return Arc::new(KnownChunkSet::new());
        }
        Err(err) => {
            log::warn!("failed to download prior index for {archive_name}: {err}, proceeding with an empty known-chunk set");
            return Arc::new(KnownChunkSet::new());
        }
    };

    match parse_records(&previous, magic) {
        Ok(records) => {
            let set = KnownChunkSet::from_previous_index(&records);
            log::debug!("seeded {} known chunks from prior {archive_name}", set.len());
            Arc::new(set)
        }
        Err(err) => {
            log::warn!("prior index for {archive_name} has wrong magic or is malformed ({err}), proceeding with an empty known-chunk set");
            Arc::new(KnownChunkSet::new())
        }
    }
}

async fn close_and_record(
    manifest: &mut BackupManifest,
    archive_name: &str,
    result: Result<(String, u64, u64, UploadStats), BackupError>,
) -> Result<BackupOutcome, BackupError> {
    let (csum_hex, size, _chunk_count, stats) = result?;
    let mut csum = [0u8; 32];
    for (i, byte) in csum.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&csum_hex[i * 2..i * 2 + 2], 16)
            .map_err(|e| BackupError::Invariant(format!("non-hex csum {csum_hex:?}: {e}")))?;
    }
    let outcome = BackupOutcome::from(&stats);
    manifest.add_file(archive_name.to_string(), csum, size, stats);
    Ok(outcome)
}

/// Run a filesystem (directory or stream) backup: two dynamic writers
/// (archive + catalog) driven in parallel by the single archive walk
/// (§4.6 step 3, filesystem case).
pub async fn run_directory_backup<L: ProcessLock>(
    cfg: SessionConfig,
    source: PathBuf,
    snapshot: &dyn SnapshotSource,
    lock_path: &Path,
    pxar_out: Option<&Path>,
) -> Result<(BackupOutcome, BackupManifest), BackupError> {
    let _lock = L::acquire(lock_path)?;

    let mapped = snapshot.snapshot(std::slice::from_ref(&source))?;
    let walk_root = mapped.get(&source).cloned().unwrap_or(source);

    let client = open_session(&cfg, Role::Writer).await?;

    let archive_wid = client.create_dynamic_index(ARCHIVE_NAME).await?;
    let catalog_wid = client.create_dynamic_index(CATALOG_NAME).await?;

    let archive_known = seed_known_chunks(&client, ARCHIVE_NAME, DIDX_MAGIC).await;
    let catalog_known = seed_known_chunks(&client, CATALOG_NAME, DIDX_MAGIC).await;

    let mut archive_assembler =
        DynamicAssembler::new(client.clone(), archive_known, archive_wid, cfg.target_chunk_size)?;
    let mut catalog_assembler =
        DynamicAssembler::new(client.clone(), catalog_known, catalog_wid, cfg.target_chunk_size)?;

    // Debug mirror of the raw archive byte stream (§6's `-pxarout`), written
    // alongside the upload rather than instead of it.
    let mut pxar_out_file = pxar_out.map(std::fs::File::create).transpose()?;

    let rx = pxar::spawn(walk_root);
    while let Ok(frame) = rx.recv() {
        match frame? {
            Frame::Archive(bytes) => {
                if let Some(file) = pxar_out_file.as_mut() {
                    use std::io::Write as _;
                    file.write_all(&bytes)?;
                }
                archive_assembler.handle_data(&bytes).await?
            }
            Frame::Catalog(bytes) => catalog_assembler.handle_data(&bytes).await?,
        }
    }

    let mut manifest = BackupManifest::new(cfg.backup_id.clone(), cfg.backup_time, cfg.backup_type);
    let mut outcome = BackupOutcome::default();
    outcome += close_and_record(&mut manifest, ARCHIVE_NAME, archive_assembler.finish().await).await?;
    outcome += close_and_record(&mut manifest, CATALOG_NAME, catalog_assembler.finish().await).await?;

    client.upload_blob(MANIFEST_BLOB_NAME, manifest.to_json_bytes()?).await?;
    client.finish().await?;

    Ok((outcome, manifest))
}

/// One block device or image file to back up (§4.6 step 3, block-device
/// case).
pub struct DeviceSpec {
    pub archive_name: String,
    pub path: PathBuf,
    pub declared_size: u64,
    pub disk_index: u32,
}

/// Run a block-device (or VM disk image) backup: one fixed writer per
/// device, then an optional VM config blob when `backup_type == Vm`.
///
/// No FIDX magic constant is hard-coded anywhere in this crate (see
/// `index.rs`); `fidx_magic` is `None` unless the caller supplies one it
/// has independently confirmed, in which case prior FIDX indexes seed
/// the known-chunk set the same way DIDX indexes do for the dynamic
/// path. With `None`, every previous FIDX is treated as absent, which is
/// the documented non-fatal fallback (§8).
pub async fn run_block_device_backup<L: ProcessLock>(
    cfg: SessionConfig,
    devices: Vec<DeviceSpec>,
    fidx_magic: Option<[u8; 8]>,
    hostname: String,
    vm_uuid: Option<String>,
    lock_path: &Path,
) -> Result<(BackupOutcome, BackupManifest), BackupError> {
    let _lock = L::acquire(lock_path)?;

    let client = open_session(&cfg, Role::Writer).await?;

    let mut manifest = BackupManifest::new(cfg.backup_id.clone(), cfg.backup_time, cfg.backup_type);
    let mut outcome = BackupOutcome::default();
    let mut disk_entries = Vec::with_capacity(devices.len());

    for device in &devices {
        let wid = client.create_fixed_index(&device.archive_name, device.declared_size).await?;

        let known_chunks = match fidx_magic {
            Some(magic) => seed_known_chunks(&client, &device.archive_name, magic).await,
            None => {
                log::debug!(
                    "no FIDX magic configured; starting {} with an empty known-chunk set",
                    device.archive_name
                );
                Arc::new(KnownChunkSet::new())
            }
        };

        let source = std::fs::File::open(&device.path)?;
        let result = fixed::run(client.clone(), known_chunks, wid, source, device.declared_size).await;
        outcome += close_and_record(&mut manifest, &device.archive_name, result).await?;
        disk_entries.push(crate::vm_config::DiskEntry { index: device.disk_index, size_bytes: device.declared_size });
    }

    if cfg.backup_type == BackupType::Vm {
        let ctx = crate::vm_config::VmConfigContext {
            vm_uuid: vm_uuid.unwrap_or_else(generate_uuid),
            hostname,
            disks: disk_entries,
        };
        let rendered = crate::vm_config::render(crate::vm_config::DEFAULT_TEMPLATE, &ctx)?;
        client.upload_blob(VM_CONFIG_BLOB_NAME, rendered.into_bytes()).await?;
    }

    client.upload_blob(MANIFEST_BLOB_NAME, manifest.to_json_bytes()?).await?;
    client.finish().await?;

    Ok((outcome, manifest))
}

/// A v4-shaped UUID good enough to label a VM config blob. Not
/// cryptographically significant; `openssl::rand` just happens to be the
/// randomness source already in this dependency tree (TLS pulls it in
/// regardless).
fn generate_uuid() -> String {
    let mut bytes = [0u8; 16];
    openssl::rand::rand_bytes(&mut bytes).expect("OpenSSL RNG failure is unrecoverable");
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parses_scheme_and_explicit_port() {
        let (host, port) = host_port("https://backup.example.com:8007").unwrap();
        assert_eq!(host, "backup.example.com");
        assert_eq!(port, 8007);
    }

    #[test]
    fn host_port_falls_back_to_scheme_default() {
        let (_, port) = host_port("https://backup.example.com").unwrap();
        assert_eq!(port, 443);
    }

    #[test]
    fn host_port_rejects_garbage() {
        assert!(host_port("not a url").is_err());
    }

    #[test]
    fn generated_uuid_has_v4_shape() {
        let uuid = generate_uuid();
        let parts: Vec<&str> = uuid.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[2].chars().next().unwrap(), '4');
        assert!(matches!(parts[3].chars().next().unwrap(), '8' | '9' | 'a' | 'b'));
    }

    #[test]
    fn outcome_add_assign_accumulates_across_writers() {
        let mut total = BackupOutcome::default();
        total += BackupOutcome { new_chunks: 2, reused_chunks: 0 };
        total += BackupOutcome { new_chunks: 0, reused_chunks: 2 };
        assert_eq!(total.new_chunks, 2);
        assert_eq!(total.reused_chunks, 2);
    }
}
