//! CLI entry point for a block-device (or VM disk image) backup (§4.6,
//! §6). Same exit-code convention as `directory_backup`: 0 success, 1
//! invalid configuration or a failed backup/notification, 2 lock
//! contention.

use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};

use pbs_dedup_client::collaborators::{BackupResult, BackupResultSink, NoopResultSink, ProcessLock};
use pbs_dedup_client::config::{BackupKind, Config};
use pbs_dedup_client::error::BackupError;
use pbs_dedup_client::manifest::BackupType;
use pbs_dedup_client::orchestrator::{self, DeviceSpec, SessionConfig};

#[cfg(unix)]
type Lock = pbs_dedup_client::collaborators::UnixProcessLock;
#[cfg(not(unix))]
type Lock = pbs_dedup_client::collaborators::NoopProcessLock;

const LOCK_PATH: &str = "/var/run/pbs-dedup-client-machine-backup.lock";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Config::from_args().context("failed to parse configuration")?;
    if let Err(err) = config.validate(false) {
        eprintln!("invalid configuration: {err}");
        std::process::exit(1);
    }
    if config.backup_dev.is_empty() {
        eprintln!("invalid configuration: at least one -backupdev is required");
        std::process::exit(1);
    }

    let backup_type = match config.backup_type {
        Some(BackupKind::Vm) => BackupType::Vm,
        _ => BackupType::Host,
    };

    let start_time = SystemTime::now();
    let hostname = config.resolved_backup_id();
    let cfg = SessionConfig {
        base_url: config.base_url.clone(),
        cert_fingerprint: Some(config.cert_fingerprint.clone()).filter(|s| !s.is_empty()),
        auth_header: format!("PBSAPIToken={}:{}", config.auth_id, config.secret),
        backup_time: unix_time(start_time),
        backup_type,
        store: config.datastore.clone(),
        namespace: Some(config.namespace.clone()).filter(|s| !s.is_empty()),
        backup_id: hostname.clone(),
        target_chunk_size: 4 * 1024 * 1024,
    };

    let devices = match device_specs(&config.backup_dev) {
        Ok(devices) => devices,
        Err(err) => {
            eprintln!("failed to stat configured backup devices: {err}");
            std::process::exit(1);
        }
    };

    let lock_path = std::path::Path::new(LOCK_PATH);
    let run_result = orchestrator::run_block_device_backup::<Lock>(
        cfg,
        devices,
        None,
        hostname.clone(),
        None,
        lock_path,
    )
    .await;

    let end_time = SystemTime::now();

    let (success, error_str, new_chunks, reused_chunks) = match &run_result {
        Ok((outcome, _manifest)) => (true, None, outcome.new_chunks, outcome.reused_chunks),
        Err(err) => (false, Some(err.to_string()), 0, 0),
    };

    let sink = NoopResultSink;
    let mail_result = sink.send(&BackupResult {
        success,
        error_str,
        new_chunks,
        reused_chunks,
        hostname,
        datastore: config.datastore.clone(),
        start_time,
        end_time,
    });

    match run_result {
        Ok(_) => {
            if let Err(err) = mail_result {
                eprintln!("backup succeeded but result notification failed: {err}");
                std::process::exit(1);
            }
            Ok(())
        }
        Err(BackupError::LockContention) => {
            eprintln!("another backup instance is already running");
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("backup failed: {err}");
            std::process::exit(1);
        }
    }
}

fn device_specs(backup_dev: &[String]) -> std::io::Result<Vec<DeviceSpec>> {
    use std::io::Seek;

    let mut devices = Vec::with_capacity(backup_dev.len());
    for (index, path) in backup_dev.iter().enumerate() {
        let path = PathBuf::from(path);
        // `metadata().len()` reports 0 for block special files on Linux;
        // seeking to the end gives the real device size for both plain
        // image files and `/dev/...` block devices.
        let declared_size = std::fs::File::open(&path)?.seek(std::io::SeekFrom::End(0))?;
        let archive_name = format!(
            "drive-{}.img.fidx",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("disk")
        );
        devices.push(DeviceSpec { archive_name, path, declared_size, disk_index: index as u32 });
    }
    Ok(devices)
}

fn unix_time(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
