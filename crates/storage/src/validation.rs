use crate::StorageError;

/// Longest transfer id accepted as a directory name.
const MAX_ID_LEN: usize = 128;

/// Validates that a transfer id is safe to use as a single path component.
///
/// Rejects:
/// - Empty ids and ids longer than 128 bytes
/// - `.` and `..`
/// - Anything outside `[A-Za-z0-9_-]` (separators, drive prefixes, NUL)
pub fn validate_transfer_id(id: &str) -> Result<(), StorageError> {
    if id.is_empty() {
        return Err(StorageError::InvalidTransferId("empty id".into()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(StorageError::InvalidTransferId(format!(
            "id longer than {MAX_ID_LEN} bytes"
        )));
    }
    if id == "." || id == ".." {
        return Err(StorageError::InvalidTransferId(format!(
            "relative component not allowed: {id}"
        )));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(StorageError::InvalidTransferId(format!(
            "character {c:?} not allowed: {id}"
        )));
    }
    Ok(())
}
