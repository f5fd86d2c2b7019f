//! Headless document layer.
//!
//! Stands in for the editor's window/document plumbing: it remembers which
//! files are open, answers the coordinator's "what is open right now" query,
//! and fires the close hook whenever a document closes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::identity::canonical_path;

/// Enumerates the files backing currently open document windows.
pub trait DocumentHost: Send + Sync {
    fn open_document_paths(&self) -> Vec<PathBuf>;
}

type CloseHook = Box<dyn Fn(&Path) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOutcome {
    pub opened: Vec<String>,
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseOutcome {
    pub closed: Vec<String>,
    pub not_open: Vec<String>,
}

#[derive(Default)]
pub struct DocumentRegistry {
    // canonical path -> path the document was opened with
    open: Mutex<BTreeMap<String, PathBuf>>,
    close_hook: RwLock<Option<CloseHook>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_close_hook<F>(&self, hook: F)
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.close_hook.write() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Opens every absolute, non-directory path. Files that do not exist yet
    /// open as new documents.
    pub fn open(&self, paths: &[String]) -> OpenOutcome {
        let mut outcome = OpenOutcome::default();
        let mut open = match self.open.lock() {
            Ok(open) => open,
            Err(_) => {
                outcome.rejected = paths.to_vec();
                return outcome;
            }
        };

        for raw in paths {
            let path = Path::new(raw);
            if !path.is_absolute() || path.is_dir() {
                debug!(path = %raw, "Rejecting document path");
                outcome.rejected.push(raw.clone());
                continue;
            }
            let canonical = canonical_path(path);
            info!(path = %canonical, "Document opened");
            open.entry(canonical.clone())
                .or_insert_with(|| path.to_path_buf());
            outcome.opened.push(canonical);
        }

        outcome
    }

    /// Closes the documents for `paths` and fires the close hook for each.
    pub fn close(&self, paths: &[String]) -> CloseOutcome {
        let mut outcome = CloseOutcome::default();
        let mut closed_paths = Vec::new();

        if let Ok(mut open) = self.open.lock() {
            for raw in paths {
                let canonical = canonical_path(raw);
                match open.remove(&canonical) {
                    Some(_) => {
                        info!(path = %canonical, "Document closed");
                        closed_paths.push(PathBuf::from(&canonical));
                        outcome.closed.push(canonical);
                    }
                    None => outcome.not_open.push(raw.clone()),
                }
            }
        }

        // Hook runs outside the registry lock; the coordinator may query
        // open documents from its own thread at any time.
        if let Ok(hook) = self.close_hook.read() {
            if let Some(hook) = hook.as_ref() {
                for path in &closed_paths {
                    hook(path);
                }
            }
        }

        outcome
    }

    pub fn len(&self) -> usize {
        self.open.lock().map(|open| open.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentHost for DocumentRegistry {
    fn open_document_paths(&self) -> Vec<PathBuf> {
        self.open
            .lock()
            .map(|open| open.keys().map(PathBuf::from).collect())
            .unwrap_or_default()
    }
}
