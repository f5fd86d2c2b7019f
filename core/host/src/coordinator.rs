//! Wait coordinator: owns every wait session for the life of the editor.
//!
//! All inbound signals (wait requests from the hub, document closes, poll
//! ticks, termination) become a [`CoordinatorEvent`] on one channel. A single
//! worker thread drains it, so the session table has exactly one writer and
//! sees a total order of mutations. The poll timer is the worker's own
//! receive deadline: armed when the table becomes non-empty, cleared when it
//! empties.

use fs_err as fs;
use moped_protocol::{Notification, WaitComplete, WaitRequest, WAIT_REQUEST_NOTIFICATION};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::documents::DocumentHost;
use crate::hub::{NotificationHub, Notifier};
use crate::identity::canonical_path;
use crate::session::{Effect, SessionTable};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

pub enum CoordinatorEvent {
    WaitRequestReceived(WaitRequest),
    PathClosed(String),
    TimerTick,
    AppTerminating(Option<Sender<()>>),
    Snapshot(Sender<CoordinatorSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub sessions: BTreeMap<String, Vec<String>>,
    pub timer_active: bool,
}

pub struct WaitCoordinator {
    sender: Sender<CoordinatorEvent>,
    observing: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WaitCoordinator {
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        documents: Arc<dyn DocumentHost>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel();
        let worker = Worker {
            table: SessionTable::new(),
            notifier,
            documents,
            poll_interval,
            next_tick: None,
        };
        let handle = thread::Builder::new()
            .name("moped-wait-coordinator".to_string())
            .spawn(move || worker.run(receiver))
            .map_err(|err| warn!(error = %err, "Failed to spawn coordinator worker"))
            .ok();

        Arc::new(Self {
            sender,
            observing: AtomicBool::new(false),
            worker: Mutex::new(handle),
        })
    }

    /// Registers for inbound wait requests. Later calls are no-ops.
    pub fn start_observing(&self, hub: &NotificationHub) {
        if self.observing.swap(true, Ordering::SeqCst) {
            return;
        }

        let sender = self.sender.clone();
        hub.add_observer(WAIT_REQUEST_NOTIFICATION, move |notification| {
            enqueue_wait_request(&sender, notification);
        });
        info!("Wait coordinator observing requests");
    }

    pub fn is_observing(&self) -> bool {
        self.observing.load(Ordering::SeqCst)
    }

    /// Queues removal of `path` from every session; returns immediately.
    pub fn handle_document_close_path(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_string_lossy().to_string();
        self.send(CoordinatorEvent::PathClosed(path));
    }

    /// Force-completes every pending session and waits until that work has
    /// run, so completions go out before the process exits.
    pub fn app_will_terminate(&self) {
        let (ack, done) = mpsc::channel();
        self.send(CoordinatorEvent::AppTerminating(Some(ack)));
        if done.recv_timeout(TERMINATE_TIMEOUT).is_err() {
            warn!("Timed out waiting for wait sessions to finish on termination");
        }
    }

    /// Reads the table through the queue, after every event sent before it.
    pub fn snapshot(&self) -> Option<CoordinatorSnapshot> {
        let (reply, response) = mpsc::channel();
        self.send(CoordinatorEvent::Snapshot(reply));
        response.recv_timeout(SNAPSHOT_TIMEOUT).ok()
    }

    pub fn shutdown(&self) {
        self.send(CoordinatorEvent::Shutdown);
        let handle = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Coordinator worker panicked");
            }
        }
    }

    fn send(&self, event: CoordinatorEvent) {
        if self.sender.send(event).is_err() {
            debug!("Coordinator worker is gone; dropping event");
        }
    }
}

impl Drop for WaitCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn enqueue_wait_request(sender: &Sender<CoordinatorEvent>, notification: &Notification) {
    match WaitRequest::from_notification(notification) {
        Ok(request) => {
            let _ = sender.send(CoordinatorEvent::WaitRequestReceived(request));
        }
        Err(err) => {
            debug!(code = %err.code, message = %err.message, "Ignoring malformed wait request");
        }
    }
}

struct Worker {
    table: SessionTable,
    notifier: Arc<dyn Notifier>,
    documents: Arc<dyn DocumentHost>,
    poll_interval: Duration,
    next_tick: Option<Instant>,
}

impl Worker {
    fn run(mut self, receiver: Receiver<CoordinatorEvent>) {
        loop {
            let event = match self.next_tick {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match receiver.recv_timeout(wait) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => CoordinatorEvent::TimerTick,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match receiver.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            if !self.handle(event) {
                break;
            }
        }
        debug!("Coordinator worker stopped");
    }

    fn handle(&mut self, event: CoordinatorEvent) -> bool {
        let effects = match event {
            CoordinatorEvent::WaitRequestReceived(request) => self.table.register(request),
            CoordinatorEvent::PathClosed(path) => self.table.close_path(&path),
            CoordinatorEvent::TimerTick => {
                self.next_tick = Some(Instant::now() + self.poll_interval);
                let open = self.open_paths();
                self.table.poll(&open)
            }
            CoordinatorEvent::AppTerminating(ack) => {
                if !self.table.is_empty() {
                    info!(
                        sessions = self.table.len(),
                        "Completing pending wait sessions on termination"
                    );
                }
                let effects = self.table.terminate();
                self.apply(effects);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return true;
            }
            CoordinatorEvent::Snapshot(reply) => {
                let table = self.table.snapshot();
                let _ = reply.send(CoordinatorSnapshot {
                    sessions: table.sessions,
                    timer_active: self.next_tick.is_some(),
                });
                return true;
            }
            CoordinatorEvent::Shutdown => return false,
        };

        self.apply(effects);
        true
    }

    fn open_paths(&self) -> HashSet<String> {
        self.documents
            .open_document_paths()
            .iter()
            .map(canonical_path)
            .collect()
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Complete { session_id, marker } => {
                    if let Some(marker) = marker {
                        remove_marker(&marker);
                    }
                    info!(session_id = %session_id, "Wait session complete");
                    self.notifier
                        .post(WaitComplete { session_id }.to_notification());
                }
                Effect::StartTimer => {
                    debug!(interval_ms = self.poll_interval.as_millis() as u64, "Poll timer started");
                    self.next_tick = Some(Instant::now() + self.poll_interval);
                }
                Effect::StopTimer => {
                    debug!("Poll timer stopped");
                    self.next_tick = None;
                }
            }
        }
    }
}

fn remove_marker(marker: &Path) {
    if let Err(err) = fs::remove_file(marker) {
        debug!(error = %err, "Marker file already gone");
    }
}
