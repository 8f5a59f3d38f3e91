//! Per-transfer decisions taken once, before the first chunk moves.

use peerdrop_storage::BackendKind;

use crate::config::{ChunkSizeTable, DeviceClass};

const LARGE_FILE: u64 = 100 * 1024 * 1024;
const HUGE_FILE: u64 = 500 * 1024 * 1024;

/// Chunk size for a file of `file_size` bytes sent from a `device`.
///
/// Mobile devices always use the small fixed size. Desktops scale up above
/// 100 MB and again above 500 MB.
pub fn chunk_size_for(device: DeviceClass, file_size: u64, table: &ChunkSizeTable) -> u32 {
    match device {
        DeviceClass::Mobile => table.mobile,
        DeviceClass::Desktop if file_size > HUGE_FILE => table.desktop_huge,
        DeviceClass::Desktop if file_size > LARGE_FILE => table.desktop_large,
        DeviceClass::Desktop => table.desktop,
    }
}

/// Backend that should hold an incoming file.
///
/// Memory-constrained devices and files above `large_file_threshold` go to
/// disk; everything else stays in memory.
pub fn select_backend(device: DeviceClass, file_size: u64, large_file_threshold: u64) -> BackendKind {
    if device == DeviceClass::Mobile || file_size > large_file_threshold {
        BackendKind::Disk
    } else {
        BackendKind::Memory
    }
}
