//! CLI entry point for a filesystem-tree backup (§4.6, §6). Exit codes
//! match the config/lock/backup split used throughout this lineage:
//! 0 success, 1 invalid configuration or a failed backup/notification,
//! 2 lock contention.

use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};

use pbs_dedup_client::collaborators::{
    BackupResult, BackupResultSink, NoopResultSink, NullSnapshot, ProcessLock,
};
use pbs_dedup_client::config::Config;
use pbs_dedup_client::error::BackupError;
use pbs_dedup_client::manifest::BackupType;
use pbs_dedup_client::orchestrator::{self, SessionConfig};

#[cfg(unix)]
type Lock = pbs_dedup_client::collaborators::UnixProcessLock;
#[cfg(not(unix))]
type Lock = pbs_dedup_client::collaborators::NoopProcessLock;

const LOCK_PATH: &str = "/var/run/pbs-dedup-client-directory-backup.lock";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Config::from_args().context("failed to parse configuration")?;
    if let Err(err) = config.validate(true) {
        eprintln!("invalid configuration: {err}");
        std::process::exit(1);
    }

    let start_time = SystemTime::now();
    let cfg = SessionConfig {
        base_url: config.base_url.clone(),
        cert_fingerprint: Some(config.cert_fingerprint.clone()).filter(|s| !s.is_empty()),
        auth_header: format!("PBSAPIToken={}:{}", config.auth_id, config.secret),
        backup_time: unix_time(start_time),
        backup_type: BackupType::Host,
        store: config.datastore.clone(),
        namespace: Some(config.namespace.clone()).filter(|s| !s.is_empty()),
        backup_id: config.resolved_backup_id(),
        target_chunk_size: 4 * 1024 * 1024,
    };

    let source = PathBuf::from(&config.backup_source_dir);
    let lock_path = std::path::Path::new(LOCK_PATH);
    let pxar_out = Some(&config.pxar_out).filter(|s| !s.is_empty()).map(PathBuf::from);

    let run_result = orchestrator::run_directory_backup::<Lock>(
        cfg,
        source,
        &NullSnapshot,
        lock_path,
        pxar_out.as_deref(),
    )
    .await;

    let end_time = SystemTime::now();
    let hostname = config.resolved_backup_id();

    let (success, error_str, new_chunks, reused_chunks) = match &run_result {
        Ok((outcome, _manifest)) => (true, None, outcome.new_chunks, outcome.reused_chunks),
        Err(err) => (false, Some(err.to_string()), 0, 0),
    };

    let sink = NoopResultSink;
    let mail_result = sink.send(&BackupResult {
        success,
        error_str: error_str.clone(),
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

fn unix_time(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
