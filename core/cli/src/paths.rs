use std::path::{Path, PathBuf};

use moped_host::identity::canonical_path;

/// Turns a command-line path into the absolute, symlink-resolved form both
/// processes agree on. Order of `raw` is preserved.
pub fn resolve_all(raw: &[String], cwd: &Path, home: Option<&Path>) -> Vec<String> {
    raw.iter()
        .map(|path| resolve(path, cwd, home))
        .collect()
}

pub fn resolve(raw: &str, cwd: &Path, home: Option<&Path>) -> String {
    let expanded = expand_tilde(raw, home);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    canonical_path(absolute)
}

fn expand_tilde(raw: &str, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return PathBuf::from(raw);
    };
    if raw == "~" {
        return home.to_path_buf();
    }
    match raw.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(raw),
    }
}
