//! Path validation for incoming requests.

use std::path::{Component, Path, PathBuf};

use crate::error::TaskError;

/// Accept only absolute paths without `..` components.
pub fn validate_path(path: &Path) -> Result<(), TaskError> {
    let invalid = |reason| TaskError::InvalidPath {
        path: path.to_path_buf(),
        reason,
    };

    if path.as_os_str().is_empty() {
        return Err(invalid("path is empty"));
    }
    if !path.is_absolute() {
        return Err(invalid("path must be absolute"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid("path must not contain '..'"));
    }
    Ok(())
}

/// Accept a single path segment usable as a file name.
pub fn validate_file_name(name: &str) -> Result<(), TaskError> {
    let invalid = |reason| TaskError::InvalidPath {
        path: PathBuf::from(name),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("file name is empty"));
    }
    if name == "." || name == ".." {
        return Err(invalid("file name must not be '.' or '..'"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(invalid("file name must not contain separators"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path(Path::new("/srv/games/world")).is_ok());
        assert!(validate_path(Path::new("relative/dir")).is_err());
        assert!(validate_path(Path::new("/srv/../etc")).is_err());
        assert!(validate_path(Path::new("")).is_err());
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("server.properties").is_ok());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("a/b.txt").is_err());
        assert!(validate_file_name("").is_err());
    }
}
