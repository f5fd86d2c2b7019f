//! Editor-side half of the Moped CLI wait protocol.
//!
//! The pieces an editor process embeds:
//!
//! - [`coordinator::WaitCoordinator`]: session table, path matching, poll
//!   timer and completion.
//! - [`hub::NotificationHub`]: broadcast channel the CLI talks to.
//! - [`documents::DocumentRegistry`]: a headless document layer that calls the
//!   close hook. A GUI replaces it with its own [`documents::DocumentHost`].
//! - [`server`]: the Unix-socket front end.

pub mod config;
pub mod coordinator;
pub mod documents;
pub mod hub;
pub mod identity;
pub mod server;
pub mod session;

use std::sync::{Arc, Weak};

use crate::config::HostConfig;
use crate::coordinator::WaitCoordinator;
use crate::documents::DocumentRegistry;
use crate::hub::NotificationHub;
use crate::server::HostContext;

/// Wires the hub, document layer and coordinator together and starts
/// observing wait requests.
pub fn start_host(config: &HostConfig) -> Arc<HostContext> {
    let hub = Arc::new(NotificationHub::new());
    let documents = Arc::new(DocumentRegistry::new());
    let coordinator = WaitCoordinator::spawn(
        hub.clone(),
        documents.clone(),
        config.poll_interval(),
    );

    let weak: Weak<WaitCoordinator> = Arc::downgrade(&coordinator);
    documents.set_close_hook(move |path| {
        if let Some(coordinator) = weak.upgrade() {
            coordinator.handle_document_close_path(path);
        }
    });

    coordinator.start_observing(&hub);

    Arc::new(HostContext {
        hub,
        documents,
        coordinator,
        started_at: chrono::Utc::now(),
    })
}
