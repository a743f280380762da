//! Wire envelopes and the typed events produced from them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;

use super::error::WsError;

/// Close code of an orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the transport went away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close reason that marks a deliberate disconnect; paired with [`NORMAL_CLOSURE`].
pub const MANUAL_DISCONNECT_REASON: &str = "Manual disconnect";

/// A message received from the server, as described by the inbound envelope.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl InboundMessage {
    #[must_use]
    pub fn new<S: Into<String>>(kind: S, data: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
            message: None,
            status: None,
            timestamp: None,
            code: None,
        }
    }

    /// Server timestamp, when present and in range.
    #[must_use]
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.timestamp.and_then(DateTime::from_timestamp_millis)
    }
}

/// Parse a text frame that carries either one envelope or an array of envelopes.
pub fn parse_messages(bytes: &[u8]) -> Result<Vec<InboundMessage>, WsError> {
    let is_array = bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'[');

    let parsed = if is_array {
        serde_json::from_slice(bytes)
    } else {
        serde_json::from_slice(bytes).map(|message| vec![message])
    };
    parsed.map_err(WsError::MessageParse)
}

/// Order parameters carried by buy and sell messages.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub quantity: Decimal,
    /// Limit price; market order when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
}

impl OrderRequest {
    #[must_use]
    pub fn market<S: Into<String>>(symbol: S, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            price: None,
        }
    }

    #[must_use]
    pub fn limit<S: Into<String>>(symbol: S, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            price: Some(price),
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

/// Messages the client sends, encoded as `{ "type": ..., ...fields }`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Subscribe { symbol: String },
    Unsubscribe { symbol: String },
    Buy(OrderRequest),
    Sell(OrderRequest),
    GetPortfolio,
    Ping,
}

impl OutboundMessage {
    #[must_use]
    pub fn order(side: Side, order: OrderRequest) -> Self {
        match side {
            Side::Buy => Self::Buy(order),
            Side::Sell => Self::Sell(order),
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Lifecycle notification emitted on open and close.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub status: ConnectionStatus,
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl ConnectionEvent {
    #[must_use]
    pub fn connected() -> Self {
        Self {
            status: ConnectionStatus::Connected,
            code: None,
            reason: None,
        }
    }

    #[must_use]
    pub fn disconnected<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            code: Some(code),
            reason: Some(reason.into()),
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorSource {
    /// The socket could not be opened or failed while in use
    Transport,
    /// The connection attempt exceeded its timeout
    Timeout,
    /// The server reported an error in an envelope
    Server,
    /// Automatic reconnection gave up
    ReconnectExhausted,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub source: ErrorSource,
    pub message: String,
    pub code: Option<u16>,
    /// No further automatic transition will happen
    pub terminal: bool,
}

impl ErrorEvent {
    #[must_use]
    pub fn new<S: Into<String>>(source: ErrorSource, message: S) -> Self {
        Self {
            source,
            message: message.into(),
            code: None,
            terminal: false,
        }
    }

    #[must_use]
    pub fn reconnect_exhausted(max_attempts: u32) -> Self {
        Self {
            source: ErrorSource::ReconnectExhausted,
            message: format!("max reconnection attempts reached ({max_attempts})"),
            code: None,
            terminal: true,
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResponse {
    pub status: Option<String>,
    pub message: Option<String>,
    pub data: Option<Value>,
}

/// Domain update wrapped in an `automation_update` envelope.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AutomationUpdate {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Event delivered to subscribers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connection(ConnectionEvent),
    Error(ErrorEvent),
    TickData(Value),
    PortfolioUpdate(Value),
    OrderResponse(OrderResponse),
    AutomationUpdate(AutomationUpdate),
    /// Connection or disconnection notice sent by the server
    Notice(InboundMessage),
    /// Any kind this crate does not recognize
    Message(InboundMessage),
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Connection,
    Error,
    TickData,
    PortfolioUpdate,
    OrderResponse,
    AutomationUpdate,
    Notice,
    Message,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        Self::Connection,
        Self::Error,
        Self::TickData,
        Self::PortfolioUpdate,
        Self::OrderResponse,
        Self::AutomationUpdate,
        Self::Notice,
        Self::Message,
    ];
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connection(_) => EventKind::Connection,
            Self::Error(_) => EventKind::Error,
            Self::TickData(_) => EventKind::TickData,
            Self::PortfolioUpdate(_) => EventKind::PortfolioUpdate,
            Self::OrderResponse(_) => EventKind::OrderResponse,
            Self::AutomationUpdate(_) => EventKind::AutomationUpdate,
            Self::Notice(_) => EventKind::Notice,
            Self::Message(_) => EventKind::Message,
        }
    }

    /// Map an inbound envelope onto its typed event.
    #[must_use]
    pub fn from_inbound(message: InboundMessage) -> Self {
        match message.kind.as_str() {
            "tick_data" | "tick" => Self::TickData(message.data.unwrap_or_default()),
            "portfolio_update" => Self::PortfolioUpdate(message.data.unwrap_or_default()),
            "order_response" | "buy_response" | "sell_response" => {
                Self::OrderResponse(OrderResponse {
                    status: message.status,
                    message: message.message,
                    data: message.data,
                })
            }
            "automation_update" => {
                let update = message
                    .data
                    .clone()
                    .map(serde_json::from_value::<AutomationUpdate>);
                match update {
                    Some(Ok(update)) => Self::AutomationUpdate(update),
                    Some(Err(e)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %e, "automation_update without nested type, delivering as message");
                        #[cfg(not(feature = "tracing"))]
                        let _: &serde_json::Error = &e;
                        Self::Message(message)
                    }
                    None => Self::Message(message),
                }
            }
            "error" => Self::Error(ErrorEvent {
                source: ErrorSource::Server,
                message: message.message.unwrap_or_default(),
                code: message.code,
                terminal: false,
            }),
            "connection" | "disconnection" => Self::Notice(message),
            _ => Self::Message(message),
        }
    }
}
