//! Persistent WebSocket connection with reconnection, heartbeat and batched event dispatch.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: connection state machine, reconnect timer and session task
//! - [`Connector`]: transport seam, backed by [`TungsteniteConnector`]
//! - [`EventRegistry`]: ordered handler lists per [`EventKind`]
//! - [`BatchProcessor`]: turns buffered inbound messages into events, on a worker task
//!   ([`WorkerProcessor`]) or inline ([`InlineProcessor`])
//!
//! # Example
//!
//! ```ignore
//! let url = websocket_url("https://api.example.com", &Route::Path("/automation".to_owned()))?;
//! let connection = ConnectionManager::new(url, Config::default());
//!
//! connection.on(EventKind::PortfolioUpdate, |event| println!("{event:?}"));
//! connection.connect();
//! ```

pub mod batch;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod message;
pub mod reconnect;
pub mod traits;
pub mod transport;
pub mod url;

pub use batch::{BatchProcessor, InlineProcessor, WorkerProcessor};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use events::{EventRegistry, HandlerId};
pub use message::{Event, EventKind};
pub use traits::*;
pub use transport::TungsteniteConnector;
pub use url::{Route, websocket_url};
