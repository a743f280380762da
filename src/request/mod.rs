//! Point-in-time HTTP calls wrapped with caching, staleness, cancellation and retry.
//!
//! An [`Executor`] owns the HTTP client and a [`ResponseCache`]; each logical request is a
//! [`CallSite`] created from it, with its own [`CallState`] and at most one attempt in flight.
//!
//! # Example
//!
//! ```no_run
//! use dashlink::request::{CallOptions, Executor, RequestConfig, ResponseCache};
//! use serde_json::Value;
//!
//! # async fn run() -> dashlink::Result<()> {
//! let executor = Executor::new("https://api.example.com", ResponseCache::new())?;
//! let portfolio = executor.call_site::<Value>(
//!     "/portfolio",
//!     RequestConfig::default(),
//!     CallOptions::builder().build(),
//! );
//!
//! let data = portfolio.execute().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod executor;
pub mod retry;

use reqwest::Request;
use serde_json::Value;

pub use cache::{CacheEntry, CacheKey, DEFAULT_CACHE_TIME, ResponseCache, SweepHandle};
pub use config::{RequestConfig, RequestOverrides};
pub use executor::{CallOptions, CallSite, CallState, Executor};
pub use retry::RetryConfig;

use crate::Result;
use crate::error::Error;

/// Execute `request` and decode the body as JSON. An empty body decodes to [`Value::Null`].
#[cfg_attr(
    feature = "tracing",
    tracing::instrument(
        level = "debug",
        skip_all,
        fields(method = %request.method(), path = request.url().path(), status_code)
    )
)]
pub(crate) async fn send_request(client: &reqwest::Client, request: Request) -> Result<Value> {
    let method = request.method().clone();
    let path = request.url().path().to_owned();

    let response = client.execute(request).await?;
    let status_code = response.status();

    #[cfg(feature = "tracing")]
    tracing::Span::current().record("status_code", status_code.as_u16());

    if !status_code.is_success() {
        let message = response.text().await.unwrap_or_default();

        #[cfg(feature = "tracing")]
        tracing::warn!(
            status = %status_code,
            method = %method,
            path = %path,
            message = %message,
            "API request failed"
        );

        return Err(Error::status(status_code, method, path, message));
    }

    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}
