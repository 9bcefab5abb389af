//! File I/O primitives with consistent error handling.

use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

fn io_error(e: std::io::Error, operation: &str) -> Error {
    Error::internal_io(e.to_string(), Some(operation.to_string()))
}

/// Read file contents with standardized error handling.
pub fn read_file(path: &Path, operation: &str) -> Result<String> {
    fs::read_to_string(path).map_err(|e| io_error(e, operation))
}

/// Write content to file with standardized error handling.
pub fn write_file(path: &Path, content: &str, operation: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| io_error(e, operation))
}

/// Write content to file atomically (write to .tmp, then rename).
///
/// Readers, including a worker process started right after the write, see
/// either the old content or the new content, never a partial file.
pub fn write_file_atomic(path: &Path, content: &str, operation: &str) -> Result<()> {
    let (parent, filename) = match (path.parent(), path.file_name()) {
        (Some(parent), Some(filename)) => (parent, filename),
        _ => {
            return Err(Error::internal_io(
                format!("Invalid path: {}", path.display()),
                Some(operation.to_string()),
            ))
        }
    };

    let tmp_path = parent.join(format!("{}.tmp", filename.to_string_lossy()));

    fs::write(&tmp_path, content).map_err(|e| io_error(e, &format!("{} (write temp)", operation)))?;
    fs::rename(&tmp_path, path).map_err(|e| io_error(e, &format!("{} (rename)", operation)))?;

    Ok(())
}

/// Create a directory and its parents if missing.
pub fn ensure_dir(path: &Path, operation: &str) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| io_error(e, operation))
}

/// Make `path` an existing, empty directory.
pub fn empty_dir(path: &Path, operation: &str) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|e| io_error(e, operation))?;
    }
    ensure_dir(path, operation)
}

/// Append one line to a file, creating it if needed.
pub fn append_line(path: &Path, line: &str, operation: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_error(e, operation))?;
    writeln!(file, "{}", line).map_err(|e| io_error(e, operation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn read_file_succeeds_for_existing_file() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "test content").unwrap();

        let content = read_file(temp.path(), "test read").unwrap();
        assert!(content.contains("test content"));
    }

    #[test]
    fn read_file_returns_error_for_missing_file() {
        let err = read_file(Path::new("/nonexistent/path.txt"), "test read").unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
    }

    #[test]
    fn write_file_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body.json");
        write_file_atomic(&path, "one", "test write").unwrap();
        write_file_atomic(&path, "two", "test write").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("body.json.tmp").exists());
    }

    #[test]
    fn empty_dir_clears_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs").join("r1");
        ensure_dir(&logs, "test").unwrap();
        write_file(&logs.join("old.log"), "stale", "test").unwrap();

        empty_dir(&logs, "test").unwrap();

        assert!(logs.is_dir());
        assert_eq!(fs::read_dir(&logs).unwrap().count(), 0);
    }

    #[test]
    fn append_line_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        append_line(&path, "first", "test").unwrap();
        append_line(&path, "second", "test").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
