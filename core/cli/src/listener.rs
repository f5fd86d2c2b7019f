//! Completion listener: a reader thread on the subscription stream that
//! forwards the completion for one session id onto a channel.

use moped_protocol::{Notification, WaitComplete};
use std::io::{BufRead, BufReader};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Completed,
    /// The stream hit EOF or an error; the host is gone.
    Disconnected,
}

pub struct CompletionListener {
    events: Receiver<ListenerEvent>,
    stream: Option<UnixStream>,
    reader: Option<JoinHandle<()>>,
}

impl CompletionListener {
    pub fn start(stream: BufReader<UnixStream>, session_id: String) -> std::io::Result<Self> {
        let control = stream.get_ref().try_clone()?;
        let (sender, events) = mpsc::channel();

        let reader = thread::spawn(move || {
            let event = read_until_complete(stream, &session_id);
            let _ = sender.send(event);
        });

        Ok(Self {
            events,
            stream: Some(control),
            reader: Some(reader),
        })
    }

    pub fn events(&self) -> &Receiver<ListenerEvent> {
        &self.events
    }

    /// Closes the subscription and joins the reader thread.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for CompletionListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_until_complete(mut stream: BufReader<UnixStream>, session_id: &str) -> ListenerEvent {
    let mut line = String::new();
    loop {
        line.clear();
        match stream.read_line(&mut line) {
            Ok(0) | Err(_) => return ListenerEvent::Disconnected,
            Ok(_) => {}
        }

        let notification: Notification = match serde_json::from_str(line.trim_end()) {
            Ok(notification) => notification,
            Err(err) => {
                debug!(error = %err, "Ignoring unreadable notification line");
                continue;
            }
        };
        match WaitComplete::from_notification(&notification) {
            Ok(complete) if complete.session_id == session_id => {
                return ListenerEvent::Completed;
            }
            Ok(complete) => {
                debug!(session_id = %complete.session_id, "Completion for another session");
            }
            Err(err) => {
                debug!(error = %err, name = %notification.name, "Ignoring notification");
            }
        }
    }
}
