//! The known-chunk set (§3 "Known-chunk set", §5 "Shared resources" (a)):
//! a concurrent set of fingerprints seeded from the previous snapshot's
//! index, consulted and grown as new chunks are observed during a run.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::index::IndexRecord;

/// Lives for one session (§3 "Lifecycle"). Cheap to clone-share: wrap in
/// an `Arc` at the call site the way the fixed pipeline's worker pool
/// shares its offset map.
pub struct KnownChunkSet {
    fingerprints: Mutex<HashSet<[u8; 32]>>,
}

impl KnownChunkSet {
    pub fn new() -> Self {
        Self { fingerprints: Mutex::new(HashSet::new()) }
    }

    /// Seed from a previously parsed DIDX/FIDX record list.
    pub fn from_previous_index(records: &[IndexRecord]) -> Self {
        let set = Self::new();
        {
            let mut guard = set.fingerprints.lock().unwrap();
            guard.extend(records.iter().map(|r| r.fingerprint));
        }
        set
    }

    /// Idempotent lookup: `true` iff `fingerprint` is already known.
    pub fn contains(&self, fingerprint: &[u8; 32]) -> bool {
        self.fingerprints.lock().unwrap().contains(fingerprint)
    }

    /// Atomically check-and-insert. Returns `true` if `fingerprint` was
    /// already present (so the caller must not re-upload it), `false` if
    /// this call just added it (so the caller must upload).
    pub fn check_and_insert(&self, fingerprint: [u8; 32]) -> bool {
        let mut guard = self.fingerprints.lock().unwrap();
        !guard.insert(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.fingerprints.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KnownChunkSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_from_previous_index_makes_those_fingerprints_known() {
        let records = vec![
            IndexRecord { offset: 0, fingerprint: [1u8; 32] },
            IndexRecord { offset: 4096, fingerprint: [2u8; 32] },
        ];
        let set = KnownChunkSet::from_previous_index(&records);
        assert!(set.contains(&[1u8; 32]));
        assert!(set.contains(&[2u8; 32]));
        assert!(!set.contains(&[3u8; 32]));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn check_and_insert_is_idempotent_and_reports_pre_existence() {
        let set = KnownChunkSet::new();
        assert!(!set.check_and_insert([9u8; 32])); // first observation: new
        assert!(set.check_and_insert([9u8; 32])); // second observation: already known
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn concurrent_observers_see_each_fingerprint_uploaded_exactly_once() {
        use std::sync::Arc;
        use std::thread;

        let set = Arc::new(KnownChunkSet::new());
        let fingerprint = [7u8; 32];
        let mut handles = Vec::new();
        for _ in 0..16 {
            let set = Arc::clone(&set);
            handles.push(thread::spawn(move || set.check_and_insert(fingerprint)));
        }

        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Exactly one call observed "new" (false); every other observed
        // "already known" (true) — §8's "uploaded exactly once" invariant.
        assert_eq!(results.iter().filter(|&&already_known| !already_known).count(), 1);
    }
}
