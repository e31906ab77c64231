//! Non-recursive globbing of one directory.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Kind of directory entry to keep when globbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Entries directly inside `directory` whose names match `pattern`, in glob (lexicographic) order.
///
/// The directory name itself is escaped, so it may contain glob metacharacters.
pub fn discover(directory: &Path, pattern: &str, kind: EntryKind) -> Result<Vec<PathBuf>> {
    if pattern.contains('/') || pattern.contains(std::path::MAIN_SEPARATOR) {
        return Err(Error::general(format!(
            "pattern '{pattern}' must match names within a single directory"
        )));
    }
    if !directory.is_dir() {
        return Err(Error::io(
            directory,
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        ));
    }
    let Some(directory_str) = directory.to_str() else {
        return Err(Error::io(
            directory,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "directory name is not valid UTF-8",
            ),
        ));
    };
    let escaped = glob::Pattern::escape(directory_str);
    let full = format!("{escaped}/{pattern}");
    log::debug!("Globbing {full}");

    let mut out = Vec::new();
    for entry in glob::glob(&full)? {
        let path = entry.map_err(|e| {
            let path = e.path().to_owned();
            Error::io(path, std::io::Error::from(e))
        })?;
        let keep = match kind {
            EntryKind::File => path.is_file(),
            EntryKind::Directory => path.is_dir(),
        };
        if keep {
            out.push(path);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn matches_files_only_and_does_not_recurse() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("b.nc"), b"").unwrap();
        fs::write(root.join("a.nc"), b"").unwrap();
        fs::write(root.join("c.txt"), b"").unwrap();
        fs::create_dir(root.join("d.nc")).unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/e.nc"), b"").unwrap();

        let found = discover(root, "*.nc", EntryKind::File).unwrap();
        assert_eq!(found, vec![root.join("a.nc"), root.join("b.nc")]);

        let dirs = discover(root, "*.nc", EntryKind::Directory).unwrap();
        assert_eq!(dirs, vec![root.join("d.nc")]);
    }

    #[test]
    fn escapes_directory_names() {
        let dir = tempfile::tempdir().unwrap();
        let odd = dir.path().join("run[1]");
        fs::create_dir(&odd).unwrap();
        fs::write(odd.join("x.nc"), b"").unwrap();
        assert_eq!(
            discover(&odd, "*.nc", EntryKind::File).unwrap(),
            vec![odd.join("x.nc")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn rejects_non_utf8_directories() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let odd = dir.path().join(OsStr::from_bytes(b"run\xff"));
        if fs::create_dir(&odd).is_err() {
            // some filesystems refuse non-UTF-8 names
            return;
        }
        fs::write(odd.join("x.nc"), b"").unwrap();
        let err = discover(&odd, "*.nc", EntryKind::File).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
        assert!(err.to_string().contains("UTF-8"), "{err}");
    }

    #[test]
    fn rejects_nested_patterns() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(dir.path(), "**/*.nc", EntryKind::File).is_err());
    }
}
