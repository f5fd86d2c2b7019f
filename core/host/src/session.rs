//! Wait-session table.
//!
//! Every mutation returns the effects it implies instead of performing them,
//! so the coordinator worker stays the only place that touches the disk
//! (marker deletion), the notification hub and the poll deadline.

use moped_protocol::WaitRequest;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use crate::identity::{ClosedPath, TrackedPath};

// Completed ids remembered so a late duplicate request cannot reopen them.
const COMPLETED_HISTORY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Complete {
        session_id: String,
        marker: Option<PathBuf>,
    },
    StartTimer,
    StopTimer,
}

#[derive(Debug, Clone)]
struct Session {
    pending: Vec<TrackedPath>,
    marker: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    pub sessions: BTreeMap<String, Vec<String>>,
    pub timer_active: bool,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, Session>,
    completed: VecDeque<String>,
    timer_armed: bool,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn timer_armed(&self) -> bool {
        self.timer_armed
    }

    pub fn register(&mut self, request: WaitRequest) -> Vec<Effect> {
        let mut effects = Vec::new();
        let WaitRequest {
            session_id,
            files,
            session_file_path,
        } = request;

        if self.completed.contains(&session_id) {
            tracing::debug!(session_id = %session_id, "Ignoring request for completed session");
            return effects;
        }

        let mut seen = HashSet::new();
        let pending: Vec<TrackedPath> = files
            .iter()
            .map(|file| TrackedPath::register(file))
            .filter(|tracked| seen.insert(tracked.canonical.clone()))
            .collect();
        let marker = session_file_path.map(PathBuf::from);

        if pending.is_empty() {
            self.sessions.remove(&session_id);
            self.finish(session_id, marker, &mut effects);
        } else {
            tracing::info!(
                session_id = %session_id,
                files = pending.len(),
                "Wait session registered"
            );
            self.sessions
                .insert(session_id, Session { pending, marker });
        }

        self.reconcile_timer(&mut effects);
        effects
    }

    pub fn close_path(&mut self, path: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.remove_matching(&ClosedPath::resolve(path), true, &mut effects);
        self.reconcile_timer(&mut effects);
        effects
    }

    /// Treats every pending path missing from `open_paths` as closed.
    pub fn poll(&mut self, open_paths: &HashSet<String>) -> Vec<Effect> {
        let mut effects = Vec::new();

        let mut closed: Vec<String> = self
            .sessions
            .values()
            .flat_map(|session| session.pending.iter())
            .filter(|tracked| !open_paths.contains(&tracked.canonical))
            .map(|tracked| tracked.canonical.clone())
            .collect();
        closed.sort();
        closed.dedup();

        for path in closed {
            tracing::debug!(path = %path, "Poll found pending path no longer open");
            // Only this exact path is gone; a hard link to it may still be open.
            self.remove_matching(&ClosedPath::resolve(&path), false, &mut effects);
        }

        self.reconcile_timer(&mut effects);
        effects
    }

    /// Force-completes every pending session.
    pub fn terminate(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        for session_id in ids {
            if let Some(session) = self.sessions.remove(&session_id) {
                self.finish(session_id, session.marker, &mut effects);
            }
        }
        self.reconcile_timer(&mut effects);
        effects
    }

    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            sessions: self
                .sessions
                .iter()
                .map(|(id, session)| {
                    let mut paths: Vec<String> = session
                        .pending
                        .iter()
                        .map(|tracked| tracked.canonical.clone())
                        .collect();
                    paths.sort();
                    (id.clone(), paths)
                })
                .collect(),
            timer_active: self.timer_armed,
        }
    }

    /// Removes at most one pending path per session. A name match anywhere in
    /// the session wins over a file-identifier match.
    fn remove_matching(
        &mut self,
        closed: &ClosedPath,
        match_file_id: bool,
        effects: &mut Vec<Effect>,
    ) {
        let mut finished = Vec::new();

        for (session_id, session) in self.sessions.iter_mut() {
            let index = session
                .pending
                .iter()
                .position(|tracked| closed.matches_name(tracked))
                .or_else(|| {
                    if !match_file_id {
                        return None;
                    }
                    session
                        .pending
                        .iter()
                        .position(|tracked| closed.matches_file(tracked))
                });
            if let Some(index) = index {
                session.pending.remove(index);
                tracing::debug!(
                    session_id = %session_id,
                    path = %closed.raw(),
                    remaining = session.pending.len(),
                    "Pending path closed"
                );
                if session.pending.is_empty() {
                    finished.push(session_id.clone());
                }
            }
        }

        finished.sort();
        for session_id in finished {
            if let Some(session) = self.sessions.remove(&session_id) {
                self.finish(session_id, session.marker, effects);
            }
        }
    }

    fn finish(&mut self, session_id: String, marker: Option<PathBuf>, effects: &mut Vec<Effect>) {
        if self.completed.len() == COMPLETED_HISTORY {
            self.completed.pop_front();
        }
        self.completed.push_back(session_id.clone());
        effects.push(Effect::Complete { session_id, marker });
    }

    fn reconcile_timer(&mut self, effects: &mut Vec<Effect>) {
        match (self.sessions.is_empty(), self.timer_armed) {
            (false, false) => {
                self.timer_armed = true;
                effects.push(Effect::StartTimer);
            }
            (true, true) => {
                self.timer_armed = false;
                effects.push(Effect::StopTimer);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::canonical_path;
    use std::fs;
    use tempfile::tempdir;

    fn request(id: &str, files: &[&str], marker: Option<&str>) -> WaitRequest {
        WaitRequest {
            session_id: id.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
            session_file_path: marker.map(str::to_string),
        }
    }

    fn completions(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Complete { session_id, .. } => Some(session_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_request_completes_immediately_without_timer() {
        let mut table = SessionTable::new();
        let effects = table.register(request("s1", &[], Some("/tmp/s1.wait")));
        assert_eq!(
            effects,
            vec![Effect::Complete {
                session_id: "s1".to_string(),
                marker: Some(PathBuf::from("/tmp/s1.wait")),
            }]
        );
        assert!(table.is_empty());
        assert!(!table.timer_armed());
    }

    #[test]
    fn completes_only_after_last_path_closes() {
        let mut table = SessionTable::new();
        let effects = table.register(request("s1", &["/w/a.txt", "/w/b.txt"], None));
        assert_eq!(effects, vec![Effect::StartTimer]);

        let effects = table.close_path("/w/b.txt");
        assert!(completions(&effects).is_empty());
        assert_eq!(table.len(), 1);

        let effects = table.close_path("/w/a.txt");
        assert_eq!(completions(&effects), vec!["s1".to_string()]);
        assert!(effects.contains(&Effect::StopTimer));
        assert!(table.is_empty());
    }

    #[test]
    fn completion_happens_exactly_once() {
        let mut table = SessionTable::new();
        table.register(request("s1", &["/w/a.txt"], None));
        assert_eq!(completions(&table.close_path("/w/a.txt")), vec!["s1"]);
        assert!(completions(&table.close_path("/w/a.txt")).is_empty());
        assert!(completions(&table.terminate()).is_empty());
    }

    #[test]
    fn duplicate_request_after_completion_is_ignored() {
        let mut table = SessionTable::new();
        table.register(request("s1", &["/w/a.txt"], None));
        table.close_path("/w/a.txt");

        let effects = table.register(request("s1", &["/w/a.txt"], None));
        assert!(effects.is_empty());
        assert!(table.is_empty());
        assert!(completions(&table.poll(&HashSet::new())).is_empty());
    }

    #[test]
    fn repeated_request_for_pending_session_replaces_paths() {
        let mut table = SessionTable::new();
        table.register(request("s1", &["/w/a.txt"], None));
        let effects = table.register(request("s1", &["/w/a.txt", "/w/b.txt"], None));
        assert!(effects.is_empty());
        assert_eq!(table.snapshot().sessions["s1"].len(), 2);
    }

    #[test]
    fn duplicate_files_collapse() {
        let mut table = SessionTable::new();
        table.register(request("s1", &["/w/a.txt", "/w/./a.txt"], None));
        assert_eq!(table.snapshot().sessions["s1"], vec!["/w/a.txt".to_string()]);
        assert_eq!(completions(&table.close_path("/w/a.txt")), vec!["s1"]);
    }

    #[test]
    fn shared_path_advances_every_session() {
        let mut table = SessionTable::new();
        table.register(request("s1", &["/w/shared.txt"], None));
        table.register(request("s2", &["/w/shared.txt", "/w/other.txt"], None));

        let effects = table.close_path("/w/shared.txt");
        assert_eq!(completions(&effects), vec!["s1"]);
        assert_eq!(table.snapshot().sessions["s2"], vec!["/w/other.txt".to_string()]);
        assert!(table.timer_armed());

        assert_eq!(completions(&table.close_path("/w/other.txt")), vec!["s2"]);
        assert!(!table.timer_armed());
    }

    #[cfg(unix)]
    #[test]
    fn hard_linked_paths_close_by_name_first() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a.txt");
        let b = temp.path().join("b.txt");
        std::fs::write(&a, "x").unwrap();
        std::fs::hard_link(&a, &b).unwrap();
        let a = canonical_path(&a);
        let b = canonical_path(&b);

        let mut table = SessionTable::new();
        table.register(request("s1", &[b.as_str(), a.as_str()], None));

        assert!(completions(&table.close_path(&a)).is_empty());
        assert_eq!(table.snapshot().sessions["s1"], vec![b.clone()]);

        // a.txt is closed, b.txt still open: the tick must not finish s1.
        let mut open = HashSet::new();
        open.insert(b.clone());
        assert!(completions(&table.poll(&open)).is_empty());
        assert_eq!(table.len(), 1);

        assert_eq!(completions(&table.close_path(&b)), vec!["s1"]);
    }

    #[cfg(unix)]
    #[test]
    fn poll_does_not_close_an_open_hard_link() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a.txt");
        let b = temp.path().join("b.txt");
        std::fs::write(&a, "x").unwrap();
        std::fs::hard_link(&a, &b).unwrap();
        let a = canonical_path(&a);
        let b = canonical_path(&b);

        let mut table = SessionTable::new();
        table.register(request("s1", &[a.as_str()], None));
        table.register(request("s2", &[b.as_str()], None));

        let mut open = HashSet::new();
        open.insert(b.clone());
        assert_eq!(completions(&table.poll(&open)), vec!["s1"]);
        assert_eq!(table.snapshot().sessions["s2"], vec![b]);
    }

    #[cfg(unix)]
    #[test]
    fn hard_link_close_still_matches_by_identifier() {
        let temp = tempfile::tempdir().unwrap();
        let a = temp.path().join("a.txt");
        let b = temp.path().join("b.txt");
        std::fs::write(&a, "x").unwrap();
        std::fs::hard_link(&a, &b).unwrap();

        let mut table = SessionTable::new();
        table.register(request("s1", &[a.to_str().unwrap()], None));
        assert_eq!(
            completions(&table.close_path(b.to_str().unwrap())),
            vec!["s1"]
        );
    }

    #[test]
    fn timer_tracks_empty_transitions() {
        let mut table = SessionTable::new();
        assert_eq!(
            table.register(request("s1", &["/w/a"], None)),
            vec![Effect::StartTimer]
        );
        assert!(table.register(request("s2", &["/w/b"], None)).is_empty());
        assert!(!table.close_path("/w/a").contains(&Effect::StopTimer));
        assert!(table.close_path("/w/b").contains(&Effect::StopTimer));
        assert!(!table.timer_armed());
        assert_eq!(
            table.register(request("s3", &["/w/c"], None)),
            vec![Effect::StartTimer]
        );
    }

    #[test]
    fn poll_closes_paths_missing_from_open_set() {
        let mut table = SessionTable::new();
        table.register(request("s1", &["/w/a.txt", "/w/b.txt"], None));

        let mut open = HashSet::new();
        open.insert("/w/a.txt".to_string());
        open.insert("/w/b.txt".to_string());
        assert!(table.poll(&open).is_empty());

        open.remove("/w/b.txt");
        assert!(completions(&table.poll(&open)).is_empty());
        assert_eq!(table.snapshot().sessions["s1"], vec!["/w/a.txt".to_string()]);

        let effects = table.poll(&HashSet::new());
        assert_eq!(completions(&effects), vec!["s1"]);
        assert!(effects.contains(&Effect::StopTimer));
    }

    #[test]
    fn mixed_close_and_poll_complete_once() {
        let mut table = SessionTable::new();
        table.register(request("s1", &["/w/a", "/w/b", "/w/c"], None));
        table.close_path("/w/c");

        let mut open = HashSet::new();
        open.insert("/w/b".to_string());
        assert!(completions(&table.poll(&open)).is_empty());

        let effects = table.close_path("/w/b");
        assert_eq!(completions(&effects), vec!["s1"]);
        assert!(completions(&table.poll(&HashSet::new())).is_empty());
    }

    #[test]
    fn unrelated_close_leaves_session_pending() {
        let mut table = SessionTable::new();
        table.register(request("s1", &["/w/a"], None));
        assert!(table.close_path("/w/zzz").is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn terminate_completes_all_with_markers() {
        let mut table = SessionTable::new();
        table.register(request("s2", &["/w/b"], Some("/m/s2.wait")));
        table.register(request("s1", &["/w/a"], None));

        let effects = table.terminate();
        assert_eq!(
            effects,
            vec![
                Effect::Complete {
                    session_id: "s1".to_string(),
                    marker: None,
                },
                Effect::Complete {
                    session_id: "s2".to_string(),
                    marker: Some(PathBuf::from("/m/s2.wait")),
                },
                Effect::StopTimer,
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_close_resolves_canonical_session_path() {
        let temp = tempdir().unwrap();
        let real = temp.path().join("real.txt");
        let link = temp.path().join("link.txt");
        fs::write(&real, "x").unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut table = SessionTable::new();
        table.register(request("s1", &[link.to_str().unwrap()], None));
        assert_eq!(
            table.snapshot().sessions["s1"],
            vec![canonical_path(&real)]
        );

        assert_eq!(
            completions(&table.close_path(real.to_str().unwrap())),
            vec!["s1"]
        );
    }
}
