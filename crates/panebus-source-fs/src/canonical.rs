//! Path canonicalization for roots and raw change notices.
//!
//! Roots are resolved on disk (symlinks followed). Changed paths may no
//! longer exist, so they are resolved through their nearest existing
//! ancestor and normalized lexically beyond it. Case folding only affects
//! comparison keys; reported paths keep their on-disk spelling.

use std::path::{Component, Path, PathBuf};

use crate::error::FsSourceError;

/// Platform default for case-insensitive path comparison.
pub fn default_case_insensitive() -> bool {
    cfg!(any(target_os = "macos", target_os = "windows"))
}

/// Resolve a root directory to its canonical form. Blocking.
pub fn canonicalize_root(path: &Path) -> Result<PathBuf, FsSourceError> {
    let canonical = std::fs::canonicalize(path).map_err(|source| FsSourceError::Canonicalize {
        path: path.to_path_buf(),
        source,
    })?;
    if !canonical.is_dir() {
        return Err(FsSourceError::NotADirectory(canonical));
    }
    Ok(canonical)
}

/// Resolve a changed path, tolerating deleted files. Blocking.
///
/// Walks up to the nearest ancestor that exists, canonicalizes that, and
/// re-appends the remaining components.
pub fn canonicalize_changed(path: &Path) -> PathBuf {
    let normalized = lexical_normalize(path);
    let mut existing = normalized.as_path();
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if let Ok(resolved) = std::fs::canonicalize(existing) {
            let mut out = resolved;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name);
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

/// Remove `.` and resolve `..` without touching the filesystem.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Comparison key: one string per normal component, folded if requested.
pub fn comparison_key(path: &Path, case_insensitive: bool) -> Vec<String> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            Component::RootDir | Component::Prefix(_) => Some(c.as_os_str().to_string_lossy()),
            Component::CurDir | Component::ParentDir => None,
        })
        .map(|part| {
            if case_insensitive {
                part.to_lowercase()
            } else {
                part.into_owned()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_normalize_resolves_dots() {
        assert_eq!(
            lexical_normalize(Path::new("/repo/./src/../docs/a.md")),
            PathBuf::from("/repo/docs/a.md")
        );
    }

    #[test]
    fn comparison_key_folds_case() {
        let key = comparison_key(Path::new("/Repo/Src"), true);
        assert_eq!(key, vec!["/", "repo", "src"]);
        let key = comparison_key(Path::new("/Repo/Src"), false);
        assert_eq!(key, vec!["/", "Repo", "Src"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = canonicalize_root(&dir.path().join("nope")).expect_err("missing");
        assert!(matches!(err, FsSourceError::Canonicalize { .. }));
    }

    #[test]
    fn file_root_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").expect("write");
        let err = canonicalize_root(&file).expect_err("not a dir");
        assert!(matches!(err, FsSourceError::NotADirectory(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_root_resolves_to_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let real = dir.path().join("real");
        std::fs::create_dir(&real).expect("mkdir");
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");

        let a = canonicalize_root(&real).expect("real");
        let b = canonicalize_root(&link).expect("link");
        assert_eq!(a, b);
    }

    #[cfg(unix)]
    #[test]
    fn deleted_file_resolves_through_symlinked_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let real = dir.path().join("real");
        std::fs::create_dir(&real).expect("mkdir");
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");

        let resolved = canonicalize_changed(&link.join("gone/file.txt"));
        let root = canonicalize_root(&real).expect("real");
        assert_eq!(resolved, root.join("gone/file.txt"));
    }
}
