//! Managed disk model and the naming conventions the repair flow keys off.

use serde::{Deserialize, Serialize};

/// Suffix of a machine's original OS disk: `<vmName>-osdisk`.
pub const ORIGINAL_DISK_SUFFIX: &str = "-osdisk";

const DISK_COPY_MARKER: &str = "-diskcopy-";

/// True when the disk name follows the `<anything>-DiskCopy-<anything>`
/// convention left behind by a previous repair attempt. Case-insensitive,
/// matching how the cloud treats resource names.
pub fn is_disk_copy(name: &str) -> bool {
    name.to_ascii_lowercase().contains(DISK_COPY_MARKER)
}

/// Name of the presumed original OS disk for a machine.
pub fn original_disk_name(vm_name: &str) -> String {
    format!("{}{}", vm_name, ORIGINAL_DISK_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskState {
    Attached,
    Unattached,
    Reserved,
    ActiveSas,
    ReadyToUpload,
    Other(String),
}

impl DiskState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "attached" => Self::Attached,
            "unattached" => Self::Unattached,
            "reserved" => Self::Reserved,
            "activesas" => Self::ActiveSas,
            "readytoupload" => Self::ReadyToUpload,
            _ => Self::Other(raw.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub name: String,
    pub id: String,
    pub disk_state: DiskState,
}

impl DiskInfo {
    pub fn new(name: impl Into<String>, id: impl Into<String>, disk_state: DiskState) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            disk_state,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.disk_state == DiskState::Attached
    }
}
