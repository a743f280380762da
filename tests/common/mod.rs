#![cfg(feature = "ws")]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

pub mod memory;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashlink::ws::message::{ConnectionStatus, Event};
use dashlink::ws::{ConnectionManager, ConnectionState, EventKind};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

/// Log through `RUST_LOG` while tests run. Later calls are no-ops.
pub fn init_tracing() {
    _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records every event a connection emits, in delivery order.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
    notify: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>>,
}

impl EventLog {
    #[must_use]
    pub fn attach(connection: &ConnectionManager) -> Self {
        let log = Self::default();
        for kind in EventKind::ALL {
            let log = log.clone();
            connection.on(kind, move |event| log.push(event.clone()));
        }
        log
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event.clone());
        self.notify
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| event.kind() == kind)
            .collect()
    }

    /// Connection statuses in the order they were emitted.
    #[must_use]
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                Event::Connection(connection) => Some(connection.status),
                _ => None,
            })
            .collect()
    }

    /// Wait until an event matching `predicate` has been recorded.
    pub async fn wait_for<F>(&self, predicate: F) -> Event
    where
        F: Fn(&Event) -> bool,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(event) = self.events().into_iter().find(|event| predicate(event)) {
            return event;
        }
        self.notify.lock().unwrap().push(tx);
        // Events recorded between the check above and registering the sender
        if let Some(event) = self.events().into_iter().find(|event| predicate(event)) {
            return event;
        }

        timeout(Duration::from_secs(120), async {
            loop {
                let event = rx.recv().await.unwrap();
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }
}

/// Wait until `connection` reaches `state`.
pub async fn wait_for_state(connection: &ConnectionManager, state: ConnectionState) {
    let mut rx = connection.state_receiver();
    timeout(Duration::from_secs(120), rx.wait_for(|current| *current == state))
        .await
        .unwrap()
        .unwrap();
}
