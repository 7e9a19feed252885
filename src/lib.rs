//! A deduplicating backup client for a Proxmox-Backup-style datastore
//! server: content-defined and fixed-size chunking, a PXAR archive
//! encoder, the HTTP/2 upload protocol, and the session orchestrator
//! that ties them together for the two CLI binaries in `src/bin/`.

pub mod chunker;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod dedup;
pub mod error;
pub mod index;
pub mod known_chunks;
pub mod manifest;
pub mod orchestrator;
pub mod pxar;
pub mod vm_config;
pub mod wire;
