//! Depth-first archive walker. Per the design notes this does not invoke
//! caller callbacks from inside the recursion; instead it runs on its own
//! thread and pushes opaque [`Frame`]s down a channel, so the chunk
//! assemblers that eventually consume these bytes (`dedup::dynamic`) live
//! entirely outside the walk's call stack and can apply backpressure by
//! simply not draining the channel.

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};

use super::bst::arrange;
use super::catalog::{CatalogWriter, DirTable, CATALOG_MAGIC};
use super::format::*;
use crate::error::PxarError;

/// One piece of either the archive stream or the catalog stream, in the
/// order they must be written. The two streams are independent (§4.2
/// invariant c): a consumer dispatches on the variant into two separate
/// sinks/chunk assemblers.
pub enum Frame {
    Archive(Vec<u8>),
    Catalog(Vec<u8>),
}

/// Start walking `root` on a dedicated thread, returning the receiving end
/// of the frame channel immediately. An error encountered mid-walk is sent
/// as one final `Err` item before the channel closes.
pub fn spawn(root: PathBuf) -> Receiver<Result<Frame, PxarError>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        let walker = Walker::new(tx.clone());
        if let Err(err) = walker.run(&root) {
            let _ = tx.send(Err(err));
        }
    });
    rx
}

struct Walker {
    tx: Sender<Result<Frame, PxarError>>,
    archive_offset: u64,
    catalog: CatalogWriter,
}

impl Walker {
    fn new(tx: Sender<Result<Frame, PxarError>>) -> Self {
        let catalog = {
            let tx = tx.clone();
            let mut sink = move |b: &[u8]| {
                let _ = tx.send(Ok(Frame::Catalog(b.to_vec())));
            };
            CatalogWriter::new(&mut sink)
        };
        Self { tx, archive_offset: 0, catalog }
    }

    fn send_archive(&mut self, bytes: Vec<u8>) {
        self.archive_offset += bytes.len() as u64;
        let _ = self.tx.send(Ok(Frame::Archive(bytes)));
    }

    fn flush_catalog_table(&mut self, table: &DirTable) -> u64 {
        let tx = self.tx.clone();
        let mut sink = move |b: &[u8]| {
            let _ = tx.send(Ok(Frame::Catalog(b.to_vec())));
        };
        self.catalog.flush_table(table, &mut sink)
    }

    fn run(mut self, root: &Path) -> Result<(), PxarError> {
        let root_table_offset = self.encode_dir(root, true)?;

        let tx = self.tx.clone();
        let mut sink = move |b: &[u8]| {
            let _ = tx.send(Ok(Frame::Catalog(b.to_vec())));
        };
        self.catalog.finish(root_table_offset, &mut sink);
        Ok(())
    }

    /// Encode one directory (recursively) and return the catalog offset of
    /// its own directory table, for the parent to back-reference.
    fn encode_dir(&mut self, path: &Path, is_root: bool) -> Result<u64, PxarError> {
        let metadata = fs::symlink_metadata(path)?;

        if !is_root {
            let name = path
                .file_name()
                .ok_or_else(|| PxarError::InvalidName(path.display().to_string()))?;
            let mut header = Vec::new();
            write_filename(&mut header, name.as_bytes());
            self.send_archive(header);
        }

        let entry = PxarEntry {
            mode: dir_mode(metadata.permissions().mode()),
            flags: 0,
            uid: metadata.uid(),
            gid: metadata.gid(),
            mtime_secs: metadata.mtime().max(0) as u64,
            mtime_nanos: metadata.mtime_nsec() as u32,
        };
        let mut entry_buf = Vec::new();
        entry.write_item(&mut entry_buf);
        self.send_archive(entry_buf);

        let mut dir_entries: Vec<fs::DirEntry> = fs::read_dir(path)?.collect::<Result<_, _>>()?;
        // std::fs::read_dir order is not guaranteed stable across platforms;
        // sort so the same tree always produces the same archive, which
        // matters for the dedup round-trip property (§8).
        dir_entries.sort_by_key(|e| e.file_name());

        let mut children: Vec<(u64, u64, u64)> = Vec::new(); // (hash, start, end)
        let mut catalog_table = DirTable::new();

        for dir_entry in dir_entries {
            let child_path = dir_entry.path();
            let child_name = dir_entry.file_name();
            let child_name_bytes = child_name.as_bytes();
            let child_meta = fs::symlink_metadata(&child_path)?;
            let child_start = self.archive_offset;

            if child_meta.is_dir() {
                let child_table_offset = self.encode_dir(&child_path, false)?;
                catalog_table.add_dir(child_name_bytes, child_table_offset);
            } else if child_meta.is_file() {
                let size = child_meta.len();
                let mtime_secs = child_meta.mtime().max(0) as u64;
                let entry = PxarEntry {
                    mode: file_mode(child_meta.permissions().mode()),
                    flags: 0,
                    uid: child_meta.uid(),
                    gid: child_meta.gid(),
                    mtime_secs,
                    mtime_nanos: child_meta.mtime_nsec() as u32,
                };
                self.encode_file(child_name_bytes, &entry, &child_path, size)?;
                catalog_table.add_file(child_name_bytes, size, mtime_secs);
            } else {
                // Symlinks, device nodes, sockets and fifos are not part of
                // the item grammar this implementation covers (§4.2 only
                // names FILENAME/ENTRY/PAYLOAD/GOODBYE); skip them rather
                // than guess an encoding the server doesn't expect.
                continue;
            }

            let child_end = self.archive_offset;
            children.push((goodbye_hash(child_name_bytes), child_start, child_end));
        }

        self.write_goodbye(&children);

        Ok(self.flush_catalog_table(&catalog_table))
    }

    fn encode_file(
        &mut self,
        name: &[u8],
        entry: &PxarEntry,
        path: &Path,
        size: u64,
    ) -> Result<(), PxarError> {
        let mut header = Vec::new();
        write_filename(&mut header, name);
        entry.write_item(&mut header);
        write_payload_header(&mut header, size);
        self.send_archive(header);

        use std::io::Read;
        let mut file = fs::File::open(path)?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut remaining = size;
        while remaining > 0 {
            let to_read = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..to_read])?;
            self.send_archive(buf[..to_read].to_vec());
            remaining -= to_read as u64;
        }
        Ok(())
    }

    fn write_goodbye(&mut self, children: &[(u64, u64, u64)]) {
        let goodbye_header_offset = self.archive_offset;

        let mut sorted = children.to_vec();
        sorted.sort_by_key(|&(hash, _, _)| hash);

        let items: Vec<GoodbyeItem> = sorted
            .iter()
            .map(|&(hash, start, end)| GoodbyeItem {
                hash,
                offset: goodbye_header_offset - start,
                len: end - start,
            })
            .collect();

        let arranged = arrange(&items);

        let n = arranged.len() as u64;
        let total_len = HEADER_LEN as u64 + (n + 1) * GOODBYE_ITEM_LEN as u64;

        let mut buf = Vec::with_capacity(total_len as usize);
        write_header(&mut buf, &GOODBYE_MAGIC, total_len);
        for item in &arranged {
            item.write(&mut buf);
        }

        let tail = GoodbyeItem {
            hash: GOODBYE_TAIL_MARKER,
            offset: goodbye_header_offset,
            len: total_len,
        };
        tail.write(&mut buf);

        self.send_archive(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_tree_produces_both_streams_with_root_entry_first() {
        let dir = tempdir();
        fs::write(dir.join("hello.txt"), b"hi\n").unwrap();
        fs::create_dir(dir.join("sub")).unwrap();
        fs::write(dir.join("sub").join("nested.txt"), b"nested\n").unwrap();

        let rx = spawn(dir.clone());
        let mut archive_bytes = Vec::new();
        let mut catalog_bytes = Vec::new();
        for frame in rx {
            match frame.expect("walk should not fail") {
                Frame::Archive(b) => archive_bytes.extend(b),
                Frame::Catalog(b) => catalog_bytes.extend(b),
            }
        }

        assert!(!archive_bytes.is_empty());
        assert!(catalog_bytes.starts_with(&CATALOG_MAGIC));
        // Root directory has no FILENAME record; its ENTRY record is the
        // first thing in the archive stream.
        assert_eq!(&archive_bytes[0..8], &ENTRY_MAGIC);
        // The catalog stream ends with an absolute pointer strictly inside
        // the stream (not past the end).
        let pointer =
            u64::from_le_bytes(catalog_bytes[catalog_bytes.len() - 8..].try_into().unwrap());
        assert!(pointer < catalog_bytes.len() as u64);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_directory_still_emits_a_goodbye_sentinel() {
        let dir = tempdir();

        let rx = spawn(dir.clone());
        let mut archive_bytes = Vec::new();
        for frame in rx {
            if let Frame::Archive(b) = frame.unwrap() {
                archive_bytes.extend(b);
            }
        }

        // ENTRY (56 bytes) followed immediately by a GOODBYE table holding
        // only the tail sentinel (16 + 24 bytes).
        assert_eq!(&archive_bytes[0..8], &ENTRY_MAGIC);
        let goodbye_start = ENTRY_ITEM_LEN;
        assert_eq!(&archive_bytes[goodbye_start..goodbye_start + 8], &GOODBYE_MAGIC);
        let total_len = u64::from_le_bytes(
            archive_bytes[goodbye_start + 8..goodbye_start + 16].try_into().unwrap(),
        );
        assert_eq!(total_len as usize, HEADER_LEN + GOODBYE_ITEM_LEN);

        let _ = fs::remove_dir_all(&dir);
    }

    fn tempdir() -> PathBuf {
        let mut path = std::env::temp_dir();
        let unique = format!(
            "pbs-dedup-client-encoder-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        );
        path.push(unique);
        fs::create_dir_all(&path).unwrap();
        path
    }
}
