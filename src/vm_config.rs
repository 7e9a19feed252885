//! VM configuration blob rendering (§4.6 step 4). The orchestrator hands
//! a small set of inputs — generated UUIDs, hostname, per-disk index and
//! size — through a Handlebars template and POSTs the rendered text as a
//! blob alongside the backed-up disk archives.
//!
//! The exact on-wire VM config grammar a PBS server expects is not present
//! anywhere in this lineage's retrieved material, so [`DEFAULT_TEMPLATE`]
//! is an illustrative default rather than an asserted wire format:
//! callers with an authoritative template supply their own via
//! [`render`]'s `template` argument.

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::BackupError;

#[derive(Debug, Clone, Serialize)]
pub struct DiskEntry {
    pub index: u32,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmConfigContext {
    pub vm_uuid: String,
    pub hostname: String,
    pub disks: Vec<DiskEntry>,
}

pub const DEFAULT_TEMPLATE: &str = "\
# generated by pbs-dedup-client
name: {{hostname}}
smbios1: uuid={{vm_uuid}}
{{#each disks}}\
scsi{{this.index}}: backup-disk-{{this.index}}.img,size={{this.size_bytes}}
{{/each}}";

pub fn render(template: &str, ctx: &VmConfigContext) -> Result<String, BackupError> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars
        .render_template(template, ctx)
        .map_err(|e| BackupError::Invariant(format!("VM config template error: {e}")))
}
