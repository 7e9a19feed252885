//! External collaborator interfaces (§11): single-instance locking,
//! snapshot sourcing, desktop notification, and result-mail delivery.
//! Only the Unix lock and the null implementations are wired up here —
//! a real snapshot/notification/mail backend is out of scope for this
//! crate, per §1.

use std::path::{Path, PathBuf};

use crate::error::{LockError, NotifyError, SnapshotError};

/// Process-wide mutual exclusion so two backup runs never race against the
/// same datastore session. `acquire()` fails fast rather than waiting,
/// matching §5 "fail fast if another instance holds it".
pub trait ProcessLock: Sized {
    fn acquire(path: &Path) -> Result<Self, LockError>;
}

/// `{logical path -> readable path}` mapping handed to the archive walker,
/// so a platform with shadow-copy support can redirect reads to a frozen
/// view without the rest of the pipeline knowing.
pub type SnapshotMap = std::collections::HashMap<PathBuf, PathBuf>;

pub trait SnapshotSource {
    fn snapshot(&self, paths: &[PathBuf]) -> Result<SnapshotMap, SnapshotError>;
    fn cleanup(self: Box<Self>);
}

/// Passthrough snapshot source used whenever the platform offers no
/// shadow-copy facility (i.e. everywhere this crate currently targets).
pub struct NullSnapshot;

impl SnapshotSource for NullSnapshot {
    fn snapshot(&self, paths: &[PathBuf]) -> Result<SnapshotMap, SnapshotError> {
        Ok(paths.iter().map(|p| (p.clone(), p.clone())).collect())
    }

    fn cleanup(self: Box<Self>) {}
}

pub trait Notifier {
    fn notify(&self, title: &str, body: &str);
}

pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _title: &str, _body: &str) {}
}

/// The template variables a mail collaborator renders into the subject/body
/// text (§7's `{Status, Success, ErrorStr, NewChunks, ReusedChunks, ...}`).
#[derive(Debug, Clone)]
pub struct BackupResult {
    pub success: bool,
    pub error_str: Option<String>,
    pub new_chunks: u64,
    pub reused_chunks: u64,
    pub hostname: String,
    pub datastore: String,
    pub start_time: std::time::SystemTime,
    pub end_time: std::time::SystemTime,
}

pub trait BackupResultSink {
    fn send(&self, result: &BackupResult) -> Result<(), NotifyError>;
}

pub struct NoopResultSink;

impl BackupResultSink for NoopResultSink {
    fn send(&self, _result: &BackupResult) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[cfg(unix)]
pub struct UnixProcessLock {
    _file: std::fs::File,
}

#[cfg(unix)]
impl ProcessLock for UnixProcessLock {
    fn acquire(path: &Path) -> Result<Self, LockError> {
        use nix::fcntl::{flock, FlockArg};
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Self { _file: file }),
            Err(_) => Err(LockError::AlreadyLocked),
        }
    }
}

/// No-op lock for platforms without a flock-style primitive (§5 "on
/// platforms that don't, the lock is a no-op and always succeeds").
#[cfg(not(unix))]
pub struct NoopProcessLock;

#[cfg(not(unix))]
impl ProcessLock for NoopProcessLock {
    fn acquire(_path: &Path) -> Result<Self, LockError> {
        Ok(Self)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_on_the_same_path_fails() {
        let dir = std::env::temp_dir().join(format!(
            "pbs-dedup-client-lock-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let lock_path = dir.join("lock");

        let first = UnixProcessLock::acquire(&lock_path).unwrap();
        let second = UnixProcessLock::acquire(&lock_path);
        assert!(second.is_err());
        drop(first);

        let third = UnixProcessLock::acquire(&lock_path);
        assert!(third.is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn null_snapshot_is_an_identity_map() {
        let paths = vec![PathBuf::from("/a"), PathBuf::from("/b")];
        let map = NullSnapshot.snapshot(&paths).unwrap();
        assert_eq!(map.get(&PathBuf::from("/a")), Some(&PathBuf::from("/a")));
        assert_eq!(map.len(), 2);
    }
}
