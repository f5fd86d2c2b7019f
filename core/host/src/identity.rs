//! Path identity for matching closed documents against pending sessions.
//!
//! A pending path matches an incoming close when, in order:
//! 1. the raw strings are equal,
//! 2. their canonical forms are equal (symlinks resolved, `.`/`..` removed),
//! 3. their file-system object identifiers (device + inode) are equal.
//!
//! The identifier of a pending path is captured when the session registers,
//! while the file still sits at its original location. That keeps rule 3
//! working after the document was renamed or moved before closing.
//!
//! Rule 3 is a fallback: within a session, a pending path that matches by
//! name is always taken before one that only shares an identifier, so a
//! hard-linked sibling is never consumed in place of the exact path.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    pub fn of(path: &Path) -> Option<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            std::fs::metadata(path).ok().map(|meta| FileId {
                dev: meta.dev(),
                ino: meta.ino(),
            })
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            None
        }
    }
}

/// Resolves `path` to its canonical string form.
///
/// Existing paths go through `fs::canonicalize`. For paths that do not exist
/// (a document that was deleted, or a new file never saved), the nearest
/// existing ancestor is canonicalized and the remaining components are
/// appended lexically.
pub fn canonical_path(path: impl AsRef<Path>) -> String {
    let standardized = standardize(path.as_ref());

    if let Ok(canonical) = standardized.canonicalize() {
        return strip_trailing_slashes(&canonical.to_string_lossy());
    }

    let mut suffix: Vec<&std::ffi::OsStr> = Vec::new();
    let mut cursor = standardized.as_path();
    while let Some(parent) = cursor.parent() {
        if let Some(name) = cursor.file_name() {
            suffix.push(name);
        }
        if let Ok(resolved) = parent.canonicalize() {
            let mut rebuilt = resolved;
            for name in suffix.iter().rev() {
                rebuilt.push(name);
            }
            return strip_trailing_slashes(&rebuilt.to_string_lossy());
        }
        cursor = parent;
    }

    strip_trailing_slashes(&standardized.to_string_lossy())
}

/// Lexically removes `.` and `..` components without touching the disk.
pub fn standardize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn strip_trailing_slashes(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A path held by a pending session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedPath {
    pub canonical: String,
    pub file_id: Option<FileId>,
}

impl TrackedPath {
    pub fn register(raw: &str) -> Self {
        let canonical = canonical_path(raw);
        let file_id = FileId::of(Path::new(&canonical));
        Self { canonical, file_id }
    }
}

/// A path reported closed, resolved once and compared against every session.
#[derive(Debug, Clone)]
pub struct ClosedPath {
    raw: String,
    canonical: String,
    file_id: Option<FileId>,
}

impl ClosedPath {
    pub fn resolve(raw: &str) -> Self {
        let canonical = canonical_path(raw);
        let file_id = FileId::of(Path::new(raw));
        Self {
            raw: raw.to_string(),
            canonical,
            file_id,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Raw or canonical string equality.
    pub fn matches_name(&self, tracked: &TrackedPath) -> bool {
        self.raw == tracked.canonical || self.canonical == tracked.canonical
    }

    /// File identifier equality: the id recorded at registration, or failing
    /// that the tracked path's live id.
    pub fn matches_file(&self, tracked: &TrackedPath) -> bool {
        let incoming = match self.file_id {
            Some(id) => id,
            None => return false,
        };

        match tracked.file_id {
            Some(recorded) if recorded == incoming => true,
            _ => FileId::of(Path::new(&tracked.canonical)) == Some(incoming),
        }
    }
}
