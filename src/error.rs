use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// HTTP method type, re-exported for use with error inspection.
pub use reqwest::Method;
/// HTTP status code type, re-exported for use with error inspection.
pub use reqwest::StatusCode;
use reqwest::header;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Socket-level failure or non-successful HTTP response
    Transport,
    /// Connection or per-call timeout
    Timeout,
    /// Malformed payload received from the server
    Parse,
    /// The retry budget of a call site was used up
    MaxRetriesExceeded,
    /// Operation was superseded by a newer attempt or its owner was torn down
    Cancelled,
    /// Invalid input or state within dashlink
    Validation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Downcast the source of this error, looking through errors shared with a call site's state.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        if let Some(shared) = e.downcast_ref::<Shared>() {
            return shared.0.downcast_ref::<E>();
        }
        e.downcast_ref::<E>()
    }

    /// Whether this error only signals that the operation was superseded or torn down.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == Kind::Cancelled
    }

    /// Whether a call site may schedule another attempt after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            Kind::Cancelled | Kind::MaxRetriesExceeded | Kind::Validation
        )
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn status<S: Into<String>>(
        status_code: StatusCode,
        method: Method,
        path: String,
        message: S,
    ) -> Self {
        Status {
            status_code,
            method,
            path,
            message: message.into(),
        }
        .into()
    }

    pub fn timeout<S: Into<String>>(operation: S, after: Duration) -> Self {
        Timeout {
            operation: operation.into(),
            after,
        }
        .into()
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Cancelled.into()
    }

    #[must_use]
    pub fn max_retries_exceeded(attempts: u32, last: Error) -> Self {
        MaxRetriesExceeded {
            attempts,
            last: Box::new(last),
        }
        .into()
    }

    /// Build an owned error that refers to an error already published in shared state.
    #[must_use]
    pub fn shared(error: &Arc<Error>) -> Self {
        Self::with_source(error.kind, Shared(Arc::clone(error)))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Status {
    pub status_code: StatusCode,
    pub method: Method,
    pub path: String,
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error({}) making {} call to {} with {}",
            self.status_code, self.method, self.path, self.message
        )
    }
}

impl StdError for Status {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Timeout {
    pub operation: String,
    pub after: Duration,
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} timed out after {:?}", self.operation, self.after)
    }
}

impl StdError for Timeout {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation was cancelled")
    }
}

impl StdError for Cancelled {}

#[non_exhaustive]
#[derive(Debug)]
pub struct MaxRetriesExceeded {
    pub attempts: u32,
    pub last: Box<Error>,
}

impl fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "giving up after {} attempts, last error: {}",
            self.attempts, self.last
        )
    }
}

impl StdError for MaxRetriesExceeded {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.last.as_ref())
    }
}

/// An error owned by a call site's published state and handed out again to the caller.
#[derive(Debug)]
struct Shared(Arc<Error>);

impl fmt::Display for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.source.as_deref() {
            Some(src) => fmt::Display::fmt(src, f),
            None => write!(f, "{:?}", self.0.kind),
        }
    }
}

impl StdError for Shared {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<Status> for Error {
    fn from(err: Status) -> Self {
        Error::with_source(Kind::Transport, err)
    }
}

impl From<Timeout> for Error {
    fn from(err: Timeout) -> Self {
        Error::with_source(Kind::Timeout, err)
    }
}

impl From<Cancelled> for Error {
    fn from(err: Cancelled) -> Self {
        Error::with_source(Kind::Cancelled, err)
    }
}

impl From<MaxRetriesExceeded> for Error {
    fn from(err: MaxRetriesExceeded) -> Self {
        Error::with_source(Kind::MaxRetriesExceeded, err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::with_source(Kind::Timeout, e)
        } else if e.is_builder() {
            Error::with_source(Kind::Validation, e)
        } else if e.is_decode() {
            Error::with_source(Kind::Parse, e)
        } else {
            Error::with_source(Kind::Transport, e)
        }
    }
}

impl From<header::InvalidHeaderValue> for Error {
    fn from(e: header::InvalidHeaderValue) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Parse, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_should_succeed() {
        let error = Error::status(
            StatusCode::BAD_GATEWAY,
            Method::GET,
            "/summary".to_owned(),
            "upstream down",
        );

        assert_eq!(error.kind(), Kind::Transport);
        assert_eq!(
            error.to_string(),
            "Transport: error(502 Bad Gateway) making GET call to /summary with upstream down"
        );
    }

    #[test]
    fn cancelled_is_distinguishable() {
        let error = Error::cancelled();

        assert!(error.is_cancelled(), "cancelled error should report itself");
        assert!(!error.is_retryable(), "cancellation must not be retried");
        assert!(!Error::timeout("GET /summary", Duration::from_secs(1)).is_cancelled());
    }

    #[test]
    fn max_retries_exceeded_keeps_last_error() {
        let last = Error::timeout("GET /summary", Duration::from_millis(250));
        let error = Error::max_retries_exceeded(4, last);

        assert_eq!(error.kind(), Kind::MaxRetriesExceeded);
        assert!(!error.is_retryable(), "terminal error must not be retried");

        let exceeded = error.downcast_ref::<MaxRetriesExceeded>().unwrap();
        assert_eq!(exceeded.attempts, 4);
        assert_eq!(exceeded.last.kind(), Kind::Timeout);
    }

    #[test]
    fn shared_error_keeps_kind_and_source() {
        let original = Arc::new(Error::status(
            StatusCode::INTERNAL_SERVER_ERROR,
            Method::POST,
            "/orders".to_owned(),
            "boom",
        ));
        let shared = Error::shared(&original);

        assert_eq!(shared.kind(), Kind::Transport);
        let status = shared.downcast_ref::<Status>().unwrap();
        assert_eq!(status.status_code, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(shared.to_string().contains("boom"), "display should mention the message");
    }
}
