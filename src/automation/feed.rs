use std::sync::{Arc, Mutex, PoisonError};

use async_stream::stream;
use dashmap::{DashMap, Entry};
use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::request::CallSite;
use crate::ws::message::{ConnectionStatus, Event, EventKind};
use crate::ws::{ConnectionManager, HandlerId};

/// Subscriptions and refresh hooks layered over one [`ConnectionManager`].
///
/// Symbol subscriptions are reference counted: the wire message goes out on the first
/// [`subscribe`](Self::subscribe) and the last [`unsubscribe`](Self::unsubscribe) of a symbol.
/// Every tracked symbol is subscribed again whenever the connection opens.
///
/// Handlers registered through the feed are removed by [`close`](Self::close) or on drop.
pub struct Feed {
    connection: ConnectionManager,
    symbols: Arc<DashMap<String, usize>>,
    handlers: Mutex<Vec<(EventKind, HandlerId)>>,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("connection", &self.connection)
            .field("symbols", &self.subscribed_symbols())
            .finish_non_exhaustive()
    }
}

impl Feed {
    #[must_use]
    pub fn new(connection: ConnectionManager) -> Self {
        let feed = Self {
            connection,
            symbols: Arc::new(DashMap::new()),
            handlers: Mutex::new(Vec::new()),
        };

        let symbols = Arc::clone(&feed.symbols);
        let resubscriber = feed.connection.clone();
        let id = feed.connection.on(EventKind::Connection, move |event| {
            if let Event::Connection(connection) = event
                && connection.status == ConnectionStatus::Connected
            {
                resubscribe_all(&resubscriber, &symbols);
            }
        });
        feed.track(EventKind::Connection, id);

        feed
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Call `hook` for every event of `kind`.
    pub fn on_refresh<F>(&self, kind: EventKind, hook: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.connection.on(kind, hook);
        self.track(kind, id);
        id
    }

    /// Refetch `call_site` in the background for every event of `kind`.
    pub fn refresh_call_site<T>(&self, kind: EventKind, call_site: CallSite<T>) -> HandlerId
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.on_refresh(kind, move |_event| {
            let Ok(runtime) = Handle::try_current() else {
                #[cfg(feature = "tracing")]
                tracing::warn!(%kind, "no runtime to refetch on, skipping refresh");
                return;
            };
            let call_site = call_site.clone();
            runtime.spawn(async move {
                if let Err(e) = call_site.refetch().await {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %e, "refresh after event failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            });
        })
    }

    /// Track `symbol`. Returns whether a subscribe message was written now.
    ///
    /// While disconnected nothing is sent; the symbol is subscribed once the connection opens.
    pub fn subscribe(&self, symbol: &str) -> bool {
        match self.symbols.entry(symbol.to_owned()) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() += 1;
                #[cfg(feature = "tracing")]
                tracing::debug!(symbol, refs = *entry.get(), "symbol already subscribed");
                false
            }
            Entry::Vacant(entry) => {
                // Send while holding the entry so a concurrent unsubscribe cannot interleave
                let sent = self.connection.subscribe_symbol(symbol);
                entry.insert(1);
                sent
            }
        }
    }

    /// Release one reference to `symbol`. Returns whether an unsubscribe message was written.
    pub fn unsubscribe(&self, symbol: &str) -> bool {
        let Entry::Occupied(mut entry) = self.symbols.entry(symbol.to_owned()) else {
            return false;
        };

        let refs = entry.get_mut();
        *refs = refs.saturating_sub(1);
        if *refs > 0 {
            return false;
        }

        let sent = self.connection.unsubscribe_symbol(symbol);
        entry.remove();
        sent
    }

    /// Tracked symbols in ascending order.
    #[must_use]
    pub fn subscribed_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.symbols.iter().map(|e| e.key().clone()).collect();
        symbols.sort_unstable();
        symbols
    }

    /// Every event of the connection, as a stream that ends when the feed is closed.
    pub fn events(&self) -> impl Stream<Item = Event> + use<> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for kind in EventKind::ALL {
            let tx = tx.clone();
            let id = self.connection.on(kind, move |event| {
                _ = tx.send(event.clone());
            });
            self.track(kind, id);
        }

        stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }

    /// Remove every handler this feed registered. Tracked symbols are kept.
    pub fn close(&self) {
        let handlers = std::mem::take(
            &mut *self.handlers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (kind, id) in handlers {
            self.connection.off(kind, id);
        }
    }

    fn track(&self, kind: EventKind, id: HandlerId) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, id));
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.close();
    }
}

fn resubscribe_all(connection: &ConnectionManager, symbols: &DashMap<String, usize>) {
    let symbols: Vec<String> = symbols.iter().map(|e| e.key().clone()).collect();
    if symbols.is_empty() {
        return;
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(count = symbols.len(), "re-subscribing symbols");

    for symbol in &symbols {
        if !connection.subscribe_symbol(symbol) {
            #[cfg(feature = "tracing")]
            tracing::warn!(%symbol, "failed to re-subscribe symbol");
        }
    }
}
