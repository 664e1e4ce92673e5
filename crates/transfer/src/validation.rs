use std::path::{Component, Path};

use crate::TransferError;

/// Validates a storage path such as `transfers/<fileId>`.
///
/// The path is joined onto a storage root, so it must stay inside it:
/// empty paths, absolute paths, `..` and Windows prefixes are rejected.
pub fn validate_storage_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    let path = Path::new(file_path);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    if path.file_name().is_none() {
        return Err(TransferError::InvalidPath(format!(
            "path has no file name: {file_path}"
        )));
    }

    Ok(())
}
