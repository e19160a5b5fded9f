//! Small path helpers for build scripts.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::FilesError;

/// Paths matching `pattern`, sorted. Directories are skipped.
pub fn glob(pattern: &str) -> Result<Vec<Utf8PathBuf>, FilesError> {
    let mut paths = Vec::new();

    for entry in glob::glob(pattern)? {
        let path = entry?;
        if path.is_dir() {
            continue;
        }
        let path = Utf8PathBuf::try_from(path).map_err(|err| FilesError::NonUtf8(err.into_path_buf()))?;
        paths.push(path);
    }

    paths.sort();
    Ok(paths)
}

/// `path` without its final extension: `test/json.cpp` becomes `test/json`.
pub fn drop_ext(path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
    path.as_ref().with_extension("")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_drop_ext() {
        assert_eq!(drop_ext("test/json.cpp"), Utf8PathBuf::from("test/json"));
        assert_eq!(drop_ext("lib.tar.gz"), Utf8PathBuf::from("lib.tar"));
        assert_eq!(drop_ext("Makefile"), Utf8PathBuf::from("Makefile"));
    }

    #[test]
    fn test_glob_matches_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::write(root.join("b.cpp"), "").unwrap();
        fs::write(root.join("a.cpp"), "").unwrap();
        fs::write(root.join("notes.txt"), "").unwrap();
        fs::create_dir(root.join("dir.cpp")).unwrap();

        let found = glob(root.join("*.cpp").as_str()).unwrap();
        assert_eq!(found, vec![root.join("a.cpp"), root.join("b.cpp")]);
    }

    #[test]
    fn test_glob_rejects_bad_pattern() {
        assert!(matches!(glob("test/[*.cpp"), Err(FilesError::Pattern(_))));
    }
}
