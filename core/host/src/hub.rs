//! Notification hub: the host side of the broadcast channel.
//!
//! A posted notification goes to in-process observers first (synchronously,
//! so a `post` acknowledgment means every observer has queued it), then to
//! every remote subscriber registered for that name. Remote subscribers are
//! socket connections that asked to `subscribe`; a failed write drops them.

use moped_protocol::Notification;
use std::collections::HashSet;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

const SUBSCRIBER_WRITE_TIMEOUT_MS: u64 = 600;

/// Sink for notifications leaving the coordinator.
pub trait Notifier: Send + Sync {
    fn post(&self, notification: Notification);
}

type ObserverFn = Box<dyn Fn(&Notification) + Send + Sync>;

struct Observer {
    name: String,
    callback: ObserverFn,
}

struct Subscriber {
    id: u64,
    names: HashSet<String>,
    stream: UnixStream,
}

#[derive(Default)]
pub struct NotificationHub {
    observers: RwLock<Vec<Observer>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer<F>(&self, name: &str, callback: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(Observer {
                name: name.to_string(),
                callback: Box::new(callback),
            });
        }
    }

    pub fn observer_count(&self, name: &str) -> usize {
        self.observers
            .read()
            .map(|observers| observers.iter().filter(|o| o.name == name).count())
            .unwrap_or(0)
    }

    /// Hands `stream` over to the hub; it receives one JSON line per matching
    /// notification until a write fails.
    ///
    /// `ack` is written first while the subscriber list is locked, so once
    /// the peer can read it no broadcast can slip past the registration.
    pub fn subscribe(
        &self,
        names: Vec<String>,
        mut stream: UnixStream,
        ack: &[u8],
    ) -> io::Result<u64> {
        let _ = stream.set_write_timeout(Some(Duration::from_millis(SUBSCRIBER_WRITE_TIMEOUT_MS)));
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let names: HashSet<String> = names
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();

        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| io::Error::other("subscriber list poisoned"))?;
        if !ack.is_empty() {
            stream.write_all(ack)?;
            stream.flush()?;
        }
        debug!(subscriber = id, names = ?names, "Subscriber registered");
        subscribers.push(Subscriber { id, names, stream });
        Ok(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Delivers `notification` and returns how many receivers got it.
    pub fn broadcast(&self, notification: &Notification) -> usize {
        let mut delivered = 0;

        if let Ok(observers) = self.observers.read() {
            for observer in observers.iter().filter(|o| o.name == notification.name) {
                (observer.callback)(notification);
                delivered += 1;
            }
        }

        let mut line = match serde_json::to_vec(notification) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, name = %notification.name, "Failed to encode notification");
                return delivered;
            }
        };
        line.push(b'\n');

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain_mut(|subscriber| {
                if !subscriber.names.contains(&notification.name) {
                    return true;
                }
                match subscriber
                    .stream
                    .write_all(&line)
                    .and_then(|_| subscriber.stream.flush())
                {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(err) => {
                        debug!(
                            subscriber = subscriber.id,
                            error = %err,
                            "Dropping subscriber after failed write"
                        );
                        false
                    }
                }
            });
        }

        delivered
    }
}

impl Notifier for NotificationHub {
    fn post(&self, notification: Notification) {
        let delivered = self.broadcast(&notification);
        debug!(name = %notification.name, delivered, "Notification posted");
    }
}
